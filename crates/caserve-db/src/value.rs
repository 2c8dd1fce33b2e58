// Typed record values and conversion to/from wire payloads.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use caserve_wire::DbrType;
use caserve_wire::dbr::MAX_STRING_SIZE;

use crate::{DbError, DbResult};

/// Value held by a record, stored in its native type.
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    String(Vec<String>),
    Short(Vec<i16>),
    Float(Vec<f32>),
    Enum(Vec<u16>),
    Char(Vec<u8>),
    Long(Vec<i32>),
    Double(Vec<f64>),
}

// One element in a type-neutral form.
enum Scalar {
    Num(f64),
    Text(String),
}

impl PvValue {
    pub fn native_type(&self) -> DbrType {
        match self {
            Self::String(_) => DbrType::String,
            Self::Short(_) => DbrType::Short,
            Self::Float(_) => DbrType::Float,
            Self::Enum(_) => DbrType::Enum,
            Self::Char(_) => DbrType::Char,
            Self::Long(_) => DbrType::Long,
            Self::Double(_) => DbrType::Double,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::String(v) => v.len(),
            Self::Short(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Enum(v) => v.len(),
            Self::Char(v) => v.len(),
            Self::Long(v) => v.len(),
            Self::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize the first `count` elements as `dbr` payload.
    ///
    /// ```
    /// use caserve_db::PvValue;
    /// use caserve_wire::DbrType;
    ///
    /// let value = PvValue::Double(vec![2.0]);
    /// let payload = value.encode(DbrType::Long, 1).expect("encode");
    /// assert_eq!(payload.as_ref(), &[0, 0, 0, 2]);
    /// ```
    pub fn encode(&self, dbr: DbrType, count: u32) -> DbResult<Bytes> {
        let n = self.checked_count(count)?;
        let mut buf = BytesMut::with_capacity(dbr.payload_size(count).unwrap_or(0));
        for index in 0..n {
            write_scalar(&mut buf, dbr, self.scalar(index))?;
        }
        Ok(buf.freeze())
    }

    /// Overwrite the first `count` elements from a `dbr` payload, converting
    /// into the native type. Elements beyond `count` keep their values.
    pub fn apply(&mut self, dbr: DbrType, count: u32, data: &[u8]) -> DbResult<()> {
        let n = self.checked_count(count)?;
        let needed = dbr.payload_size(count).unwrap_or(usize::MAX);
        if data.len() < needed {
            return Err(DbError::ShortPayload {
                needed,
                have: data.len(),
            });
        }
        // Decode everything first so a conversion failure leaves the value untouched.
        let mut buf = data;
        let mut scalars = Vec::with_capacity(n);
        for _ in 0..n {
            scalars.push(read_scalar(&mut buf, dbr));
        }
        let mut updated = self.clone();
        for (index, scalar) in scalars.into_iter().enumerate() {
            updated.set_scalar(index, scalar)?;
        }
        *self = updated;
        Ok(())
    }

    fn checked_count(&self, count: u32) -> DbResult<usize> {
        let native = self.len();
        let requested = count as usize;
        if requested == 0 || requested > native {
            return Err(DbError::BadCount {
                requested: count,
                native: native as u32,
            });
        }
        Ok(requested)
    }

    fn scalar(&self, index: usize) -> Scalar {
        match self {
            Self::String(v) => Scalar::Text(v[index].clone()),
            Self::Short(v) => Scalar::Num(f64::from(v[index])),
            Self::Float(v) => Scalar::Num(f64::from(v[index])),
            Self::Enum(v) => Scalar::Num(f64::from(v[index])),
            Self::Char(v) => Scalar::Num(f64::from(v[index])),
            Self::Long(v) => Scalar::Num(f64::from(v[index])),
            Self::Double(v) => Scalar::Num(v[index]),
        }
    }

    fn set_scalar(&mut self, index: usize, scalar: Scalar) -> DbResult<()> {
        if let Self::String(v) = self {
            v[index] = match scalar {
                Scalar::Text(text) => text,
                Scalar::Num(num) => format_number(num),
            };
            return Ok(());
        }
        let num = scalar_to_number(scalar)?;
        match self {
            Self::Short(v) => v[index] = num as i16,
            Self::Float(v) => v[index] = num as f32,
            Self::Enum(v) => v[index] = num as u16,
            Self::Char(v) => v[index] = num as u8,
            Self::Long(v) => v[index] = num as i32,
            Self::Double(v) => v[index] = num,
            Self::String(_) => {}
        }
        Ok(())
    }
}

fn scalar_to_number(scalar: Scalar) -> DbResult<f64> {
    match scalar {
        Scalar::Num(num) => Ok(num),
        Scalar::Text(text) => text.trim().parse().map_err(|_| DbError::TypeMismatch),
    }
}

fn format_number(num: f64) -> String {
    if num.fract() == 0.0 && num.abs() < 1e15 {
        format!("{}", num as i64)
    } else {
        format!("{num}")
    }
}

fn write_scalar(buf: &mut BytesMut, dbr: DbrType, scalar: Scalar) -> DbResult<()> {
    if dbr == DbrType::String {
        let text = match scalar {
            Scalar::Text(text) => text,
            Scalar::Num(num) => format_number(num),
        };
        // Fixed slot, always NUL terminated.
        let bytes = text.as_bytes();
        let len = bytes.len().min(MAX_STRING_SIZE - 1);
        buf.extend_from_slice(&bytes[..len]);
        buf.put_bytes(0, MAX_STRING_SIZE - len);
        return Ok(());
    }
    let num = scalar_to_number(scalar)?;
    match dbr {
        DbrType::Short => buf.put_i16(num as i16),
        DbrType::Float => buf.put_f32(num as f32),
        DbrType::Enum => buf.put_u16(num as u16),
        DbrType::Char => buf.put_u8(num as u8),
        DbrType::Long => buf.put_i32(num as i32),
        DbrType::Double => buf.put_f64(num),
        DbrType::String => {}
    }
    Ok(())
}

fn read_scalar(buf: &mut &[u8], dbr: DbrType) -> Scalar {
    match dbr {
        DbrType::String => {
            let slot = &buf[..MAX_STRING_SIZE];
            let end = slot.iter().position(|b| *b == 0).unwrap_or(slot.len());
            let text = String::from_utf8_lossy(&slot[..end]).into_owned();
            buf.advance(MAX_STRING_SIZE);
            Scalar::Text(text)
        }
        DbrType::Short => Scalar::Num(f64::from(buf.get_i16())),
        DbrType::Float => Scalar::Num(f64::from(buf.get_f32())),
        DbrType::Enum => Scalar::Num(f64::from(buf.get_u16())),
        DbrType::Char => Scalar::Num(f64::from(buf.get_u8())),
        DbrType::Long => Scalar::Num(f64::from(buf.get_i32())),
        DbrType::Double => Scalar::Num(buf.get_f64()),
    }
}
