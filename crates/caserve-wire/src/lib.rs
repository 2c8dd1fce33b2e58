// Wire format for the PV access protocol: fixed headers, command codes and
// status values shared by the server engine and its tests.
use bytes::{Buf, BufMut, BytesMut};

pub mod dbr;
pub mod decoder;

pub use dbr::DbrType;
pub use decoder::{Frame, FrameDecoder};

/// Size of the standard header.
pub const HEADER_LEN: usize = 16;
/// Size of the extended header used for large payloads or counts.
pub const EXTENDED_HEADER_LEN: usize = 24;
// A standard header with this payload size and a zero count announces the
// extended form.
pub const EXTENDED_MARKER: u16 = 0xFFFF;

// Search request reply flags, carried in the data type field.
pub const SEARCH_DO_REPLY: u16 = 10;
pub const SEARCH_DONT_REPLY: u16 = 5;

/// Payload length of an event-add request.
pub const EVENT_ADD_PAYLOAD_LEN: usize = 16;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("incomplete frame")]
    Incomplete,
    #[error("declared payload of {declared} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { declared: usize, max: usize },
    #[error("invalid name payload")]
    BadName,
}

/// Operation codes understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Noop = 0,
    EventAdd = 1,
    EventCancel = 2,
    Read = 3,
    Write = 4,
    Search = 6,
    Build = 7,
    EventsOff = 8,
    EventsOn = 9,
    ReadSync = 10,
    Error = 11,
    ClearChannel = 12,
    NotFound = 14,
    ReadNotify = 15,
    ClaimChannel = 18,
    WriteNotify = 19,
}

impl Command {
    pub fn from_code(code: u16) -> Option<Self> {
        let command = match code {
            0 => Self::Noop,
            1 => Self::EventAdd,
            2 => Self::EventCancel,
            3 => Self::Read,
            4 => Self::Write,
            6 => Self::Search,
            7 => Self::Build,
            8 => Self::EventsOff,
            9 => Self::EventsOn,
            10 => Self::ReadSync,
            11 => Self::Error,
            12 => Self::ClearChannel,
            14 => Self::NotFound,
            15 => Self::ReadNotify,
            18 => Self::ClaimChannel,
            19 => Self::WriteNotify,
            _ => return None,
        };
        Some(command)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::EventAdd => "event_add",
            Self::EventCancel => "event_cancel",
            Self::Read => "read",
            Self::Write => "write",
            Self::Search => "search",
            Self::Build => "build",
            Self::EventsOff => "events_off",
            Self::EventsOn => "events_on",
            Self::ReadSync => "read_sync",
            Self::Error => "error",
            Self::ClearChannel => "clear_channel",
            Self::NotFound => "not_found",
            Self::ReadNotify => "read_notify",
            Self::ClaimChannel => "claim_channel",
            Self::WriteNotify => "write_notify",
        }
    }
}

/// Status codes reported to clients in error frames and notify replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Normal = 1,
    AllocMem = 2,
    BadType = 3,
    BadCount = 4,
    BadChannel = 5,
    BadString = 6,
    GetFail = 7,
    PutFail = 8,
    BadMask = 9,
    Timeout = 10,
    Internal = 11,
    EventNotFound = 12,
    BadPayload = 13,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let status = match code {
            1 => Self::Normal,
            2 => Self::AllocMem,
            3 => Self::BadType,
            4 => Self::BadCount,
            5 => Self::BadChannel,
            6 => Self::BadString,
            7 => Self::GetFail,
            8 => Self::PutFail,
            9 => Self::BadMask,
            10 => Self::Timeout,
            11 => Self::Internal,
            12 => Self::EventNotFound,
            13 => Self::BadPayload,
            _ => return None,
        };
        Some(status)
    }
}

/// Decoded frame header.
///
/// The command is kept as a raw code so that frames with unknown commands can
/// still be echoed back inside an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub count: u32,
    pub handle: u32,
    pub token: u32,
}

impl Header {
    pub fn new(command: Command) -> Self {
        Self {
            command: command.code(),
            ..Self::default()
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command)
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.command = command.code();
        self
    }

    pub fn with_payload_size(mut self, payload_size: u32) -> Self {
        self.payload_size = payload_size;
        self
    }

    pub fn with_handle(mut self, handle: u32) -> Self {
        self.handle = handle;
        self
    }

    pub fn with_token(mut self, token: u32) -> Self {
        self.token = token;
        self
    }

    pub fn is_extended(&self) -> bool {
        self.payload_size >= u32::from(EXTENDED_MARKER) || self.count > u32::from(u16::MAX)
    }

    pub fn encoded_len(&self) -> usize {
        if self.is_extended() {
            EXTENDED_HEADER_LEN
        } else {
            HEADER_LEN
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Always encode in network byte order.
        buf.reserve(self.encoded_len());
        buf.put_u16(self.command);
        if self.is_extended() {
            buf.put_u16(EXTENDED_MARKER);
            buf.put_u16(self.data_type);
            buf.put_u16(0);
            buf.put_u32(self.handle);
            buf.put_u32(self.token);
            buf.put_u32(self.payload_size);
            buf.put_u32(self.count);
        } else {
            buf.put_u16(self.payload_size as u16);
            buf.put_u16(self.data_type);
            buf.put_u16(self.count as u16);
            buf.put_u32(self.handle);
            buf.put_u32(self.token);
        }
    }

    /// Decode a header from the front of `input`.
    ///
    /// Returns the header together with the number of bytes it occupied, or
    /// `Error::Incomplete` when more bytes are needed.
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use caserve_wire::{Command, Header};
    ///
    /// let header = Header::new(Command::Search).with_token(7);
    /// let mut buf = BytesMut::new();
    /// header.encode(&mut buf);
    /// let (decoded, len) = Header::decode(&buf).expect("decode");
    /// assert_eq!(decoded, header);
    /// assert_eq!(len, 16);
    /// ```
    pub fn decode(input: &[u8]) -> Result<(Self, usize)> {
        if input.len() < HEADER_LEN {
            return Err(Error::Incomplete);
        }
        let mut buf = input;
        let command = buf.get_u16();
        let short_size = buf.get_u16();
        let data_type = buf.get_u16();
        let short_count = buf.get_u16();
        let handle = buf.get_u32();
        let token = buf.get_u32();
        if short_size == EXTENDED_MARKER && short_count == 0 {
            if input.len() < EXTENDED_HEADER_LEN {
                return Err(Error::Incomplete);
            }
            let payload_size = buf.get_u32();
            let count = buf.get_u32();
            return Ok((
                Self {
                    command,
                    payload_size,
                    data_type,
                    count,
                    handle,
                    token,
                },
                EXTENDED_HEADER_LEN,
            ));
        }
        Ok((
            Self {
                command,
                payload_size: u32::from(short_size),
                data_type,
                count: u32::from(short_count),
                handle,
                token,
            },
            HEADER_LEN,
        ))
    }
}

/// Append a complete frame (header followed by payload) to `buf`.
///
/// The header's payload size is replaced with the actual payload length.
pub fn encode_frame(buf: &mut BytesMut, header: &Header, payload: &[u8]) {
    let header = header.with_payload_size(payload.len() as u32);
    buf.reserve(header.encoded_len() + payload.len());
    header.encode(buf);
    buf.extend_from_slice(payload);
}

/// Append an error frame reporting `status` for the request described by `original`.
///
/// The offending header is carried verbatim at the front of the payload,
/// followed by a NUL-terminated message.
pub fn encode_error(buf: &mut BytesMut, original: &Header, status: Status, message: &str) {
    let mut payload = BytesMut::with_capacity(original.encoded_len() + message.len() + 1);
    original.encode(&mut payload);
    payload.extend_from_slice(message.as_bytes());
    payload.put_u8(0);
    let header = Header::new(Command::Error)
        .with_handle(original.handle)
        .with_token(status.code());
    encode_frame(buf, &header, &payload);
}

/// Extract a NUL-terminated name from a request payload.
pub fn decode_name(payload: &[u8]) -> Result<&str> {
    let end = payload
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(payload.len());
    let name = std::str::from_utf8(&payload[..end]).map_err(|_| Error::BadName)?;
    if name.is_empty() {
        return Err(Error::BadName);
    }
    Ok(name)
}

/// Encode a name payload: the name, a NUL terminator, and zero padding to an
/// eight byte boundary.
pub fn encode_name(name: &str) -> BytesMut {
    let unpadded = name.len() + 1;
    let padded = unpadded.div_ceil(8) * 8;
    let mut buf = BytesMut::with_capacity(padded);
    buf.extend_from_slice(name.as_bytes());
    buf.resize(padded, 0);
    buf
}

/// Parsed event-add request payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventAddRequest {
    pub low: f32,
    pub high: f32,
    pub timeout: f32,
    pub mask: u16,
}

impl EventAddRequest {
    pub fn new(mask: u16) -> Self {
        Self {
            low: 0.0,
            high: 0.0,
            timeout: 0.0,
            mask,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(EVENT_ADD_PAYLOAD_LEN);
        buf.put_f32(self.low);
        buf.put_f32(self.high);
        buf.put_f32(self.timeout);
        buf.put_u16(self.mask);
        buf.put_u16(0);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < EVENT_ADD_PAYLOAD_LEN {
            return Err(Error::Incomplete);
        }
        let mut buf = payload;
        Ok(Self {
            low: buf.get_f32(),
            high: buf.get_f32(),
            timeout: buf.get_f32(),
            mask: buf.get_u16(),
        })
    }
}
