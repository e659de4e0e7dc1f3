//! WebSocket frame codec (RFC 6455 §5.2)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const FIN: u8 = 0x80;
const RSV1: u8 = 0x40;
const RSV2: u8 = 0x20;
const RSV3: u8 = 0x10;
const MASK: u8 = 0x80;

/// Frame-level protocol violation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,

    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("control frame payload longer than 125 bytes")]
    ControlTooLong,

    #[error("fragmented control frame")]
    FragmentedControl,

    #[error("client frame is not masked")]
    Unmasked,

    #[error("invalid payload length")]
    InvalidLength,

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: u64, max: usize },
}

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte & 0x0F {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        (*self as u8) & 0x08 != 0
    }
}

/// Limits and negotiated options applied while decoding
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    pub max_frame_size: usize,
    /// RSV1 marks a compressed message (permessage-deflate)
    pub allow_rsv1: bool,
    pub require_mask: bool,
}

/// WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// Set on the first frame of a compressed message
    pub rsv1: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Create a text frame
    pub fn text(data: impl Into<String>) -> Self {
        Self::new(Opcode::Text, data.into())
    }

    /// Create a binary frame
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, data)
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, data)
    }

    /// Create a close frame
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(Opcode::Close, payload.freeze())
    }

    /// Encode frame into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut first = self.opcode as u8;
        if self.fin {
            first |= FIN;
        }
        if self.rsv1 {
            first |= RSV1;
        }
        buf.put_u8(first);

        let len = self.payload.len();
        let mask_bit = if self.mask.is_some() { MASK } else { 0 };
        if len < 126 {
            buf.put_u8(mask_bit | len as u8);
        } else if len < 65536 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(len as u64);
        }

        match self.mask {
            Some(mask) => {
                buf.put_slice(&mask);
                buf.extend(self.payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
            }
            None => buf.put_slice(&self.payload),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 14);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` until the whole frame is buffered. Header checks
    /// (reserved bits, opcode, declared length) run as soon as the header
    /// bytes are in, so an oversized frame is refused before its payload
    /// is read.
    pub fn parse(buf: &mut BytesMut, opts: &DecodeOptions) -> Result<Option<Frame>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let (b0, b1) = (buf[0], buf[1]);

        if b0 & (RSV2 | RSV3) != 0 {
            return Err(FrameError::ReservedBits);
        }
        let opcode = Opcode::from_u8(b0).ok_or(FrameError::UnknownOpcode(b0 & 0x0F))?;
        let fin = b0 & FIN != 0;
        let rsv1 = b0 & RSV1 != 0;
        if rsv1 && (!opts.allow_rsv1 || !matches!(opcode, Opcode::Text | Opcode::Binary)) {
            return Err(FrameError::ReservedBits);
        }

        let masked = b1 & MASK != 0;
        if opts.require_mask && !masked {
            return Err(FrameError::Unmasked);
        }

        let len7 = b1 & 0x7F;
        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControl);
            }
            if len7 > 125 {
                return Err(FrameError::ControlTooLong);
            }
        }

        let (len, mut offset) = match len7 {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(FrameError::InvalidLength);
                }
                (len, 10)
            }
            n => (n as u64, 2),
        };

        if len > opts.max_frame_size as u64 {
            return Err(FrameError::TooLarge {
                len,
                max: opts.max_frame_size,
            });
        }
        let len = len as usize;

        let mask = if masked {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let mask = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
            offset += 4;
            Some(mask)
        } else {
            None
        };

        if buf.len() < offset + len {
            buf.reserve(offset + len - buf.len());
            return Ok(None);
        }

        buf.advance(offset);
        let mut payload = buf.split_to(len);
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        Ok(Some(Frame {
            fin,
            rsv1,
            opcode,
            mask,
            payload: payload.freeze(),
        }))
    }
}
