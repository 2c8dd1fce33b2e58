// Incremental frame extraction over a byte stream.
use bytes::{Buf, Bytes, BytesMut};

use crate::{Error, Header, Result};

/// A complete frame: header plus its full declared payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHeader,
    HaveHeader { header: Header, header_len: usize },
}

/// Buffers stream bytes and yields frames once both the header and the whole
/// declared payload have arrived.
///
/// ```
/// use bytes::BytesMut;
/// use caserve_wire::{Command, FrameDecoder, Header, encode_frame};
///
/// let mut wire = BytesMut::new();
/// encode_frame(&mut wire, &Header::new(Command::Write), b"abcd");
///
/// let mut decoder = FrameDecoder::new(1024);
/// decoder.extend(&wire[..10]);
/// assert!(decoder.next_frame().expect("decode").is_none());
/// decoder.extend(&wire[10..]);
/// let frame = decoder.next_frame().expect("decode").expect("frame");
/// assert_eq!(frame.payload.as_ref(), b"abcd");
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    state: State,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: State::AwaitingHeader,
            max_payload,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held for frames that have not fully arrived.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if any.
    ///
    /// `Error::FrameTooLarge` is fatal: the stream can no longer be split into
    /// frames once a payload that will never be buffered has been announced.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::AwaitingHeader => {
                    let (header, header_len) = match Header::decode(&self.buf) {
                        Ok(decoded) => decoded,
                        Err(Error::Incomplete) => return Ok(None),
                        Err(err) => return Err(err),
                    };
                    let declared = header.payload_size as usize;
                    if declared > self.max_payload {
                        return Err(Error::FrameTooLarge {
                            declared,
                            max: self.max_payload,
                        });
                    }
                    self.state = State::HaveHeader { header, header_len };
                }
                State::HaveHeader { header, header_len } => {
                    let payload_len = header.payload_size as usize;
                    if self.buf.len() < header_len + payload_len {
                        return Ok(None);
                    }
                    self.buf.advance(header_len);
                    let payload = self.buf.split_to(payload_len).freeze();
                    self.state = State::AwaitingHeader;
                    return Ok(Some(Frame { header, payload }));
                }
            }
        }
    }
}
