// Value types used to frame payloads.

/// Fixed width of a string element.
pub const MAX_STRING_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DbrType {
    String = 0,
    Short = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl DbrType {
    pub fn from_code(code: u16) -> Option<Self> {
        let dbr = match code {
            0 => Self::String,
            1 => Self::Short,
            2 => Self::Float,
            3 => Self::Enum,
            4 => Self::Char,
            5 => Self::Long,
            6 => Self::Double,
            _ => return None,
        };
        Some(dbr)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn element_size(self) -> usize {
        match self {
            Self::String => MAX_STRING_SIZE,
            Self::Short | Self::Enum => 2,
            Self::Float | Self::Long => 4,
            Self::Char => 1,
            Self::Double => 8,
        }
    }

    /// Payload size for `count` elements, or `None` on overflow.
    ///
    /// ```
    /// use caserve_wire::DbrType;
    ///
    /// assert_eq!(DbrType::Double.payload_size(3), Some(24));
    /// assert_eq!(DbrType::String.payload_size(2), Some(80));
    /// ```
    pub fn payload_size(self, count: u32) -> Option<usize> {
        usize::try_from(count)
            .ok()?
            .checked_mul(self.element_size())
    }
}
