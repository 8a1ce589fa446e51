//! Timer service wire format
//!
//! Requests and replies travel as UDP payloads between a client socket and
//! the timer port of the scheduling context. All fields are big-endian.
//!
//! ```text
//! request (24 bytes)                     reply (12 bytes)
//!  0  id          u32                     0  id          u32
//!  4  version     u16                     4  cmd         u16
//!  6  cmd         u16                     6  request_id  u16
//!  8  request_id  u16                     8  error       u32 (0 = none)
//! 10  reserved    u16
//! 12  sec         u32
//! 16  usec        u32
//! 20  repeat      u32 (0 or 1)
//! ```

use crate::config::{TICKS_PER_SECOND, TIMER_PROTOCOL_VERSION, USEC_PER_TICK};
use crate::error::{Error, Result};

pub const REQUEST_SIZE: usize = 24;
pub const REPLY_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TimerCommand {
    Invalid = 0,
    Open = 1,
    /// Accepted but has no effect
    Close = 2,
    /// Only ever sent by the service
    Tick = 3,
}

impl TimerCommand {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(TimerCommand::Invalid),
            1 => Some(TimerCommand::Open),
            2 => Some(TimerCommand::Close),
            3 => Some(TimerCommand::Tick),
            _ => None,
        }
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Service ticks for an interval; half a tick or less rounds down
pub fn ticks(sec: u32, usec: u32) -> u32 {
    sec.saturating_mul(TICKS_PER_SECOND)
        .saturating_add(usec.saturating_add(USEC_PER_TICK / 2 - 1) / USEC_PER_TICK)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    /// Chosen by the client and echoed in every tick
    pub id: u32,
    pub version: u16,
    pub cmd: u16,
    pub request_id: u16,
    pub sec: u32,
    pub usec: u32,
    pub repeat: bool,
}

impl TimerRequest {
    pub fn open(id: u32, sec: u32, usec: u32, repeat: bool) -> Self {
        Self {
            id,
            version: TIMER_PROTOCOL_VERSION,
            cmd: TimerCommand::Open as u16,
            request_id: 1,
            sec,
            usec,
            repeat,
        }
    }

    pub fn command(&self) -> Option<TimerCommand> {
        TimerCommand::from_u16(self.cmd)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < REQUEST_SIZE {
            return Err(Error::PacketTooShort);
        }
        Ok(Self {
            id: read_u32(bytes, 0),
            version: read_u16(bytes, 4),
            cmd: read_u16(bytes, 6),
            request_id: read_u16(bytes, 8),
            sec: read_u32(bytes, 12),
            usec: read_u32(bytes, 16),
            repeat: read_u32(bytes, 20) != 0,
        })
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < REQUEST_SIZE {
            return Err(Error::PacketTooShort);
        }
        out[0..4].copy_from_slice(&self.id.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&self.cmd.to_be_bytes());
        out[8..10].copy_from_slice(&self.request_id.to_be_bytes());
        out[10..12].fill(0);
        out[12..16].copy_from_slice(&self.sec.to_be_bytes());
        out[16..20].copy_from_slice(&self.usec.to_be_bytes());
        out[20..24].copy_from_slice(&(self.repeat as u32).to_be_bytes());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerReply {
    pub id: u32,
    pub cmd: u16,
    pub request_id: u16,
    pub error: Option<Error>,
}

impl TimerReply {
    pub fn tick(id: u32, request_id: u16) -> Self {
        Self {
            id,
            cmd: TimerCommand::Tick as u16,
            request_id,
            error: None,
        }
    }

    /// An error answer to `request`
    pub fn failure(request: &TimerRequest, error: Error) -> Self {
        Self {
            id: request.id,
            cmd: request.cmd,
            request_id: request.request_id,
            error: Some(error),
        }
    }

    pub fn is_tick(&self) -> bool {
        self.cmd == TimerCommand::Tick as u16 && self.error.is_none()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < REPLY_SIZE {
            return Err(Error::PacketTooShort);
        }
        Ok(Self {
            id: read_u32(bytes, 0),
            cmd: read_u16(bytes, 4),
            request_id: read_u16(bytes, 6),
            error: Error::from_code(read_u32(bytes, 8)),
        })
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < REPLY_SIZE {
            return Err(Error::PacketTooShort);
        }
        out[0..4].copy_from_slice(&self.id.to_be_bytes());
        out[4..6].copy_from_slice(&self.cmd.to_be_bytes());
        out[6..8].copy_from_slice(&self.request_id.to_be_bytes());
        let code = self.error.map_or(0, |error| error.code());
        out[8..12].copy_from_slice(&code.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_round_to_nearest() {
        assert_eq!(ticks(0, 100_000), 1);
        assert_eq!(ticks(0, 150_000), 1);
        assert_eq!(ticks(0, 150_001), 2);
        assert_eq!(ticks(2, 0), 20);
        assert_eq!(ticks(0, 50_000), 0);
        assert_eq!(ticks(0, 50_001), 1);
    }

    #[test]
    fn test_request_layout() {
        let request = TimerRequest::open(0x0102_0304, 1, 500_000, true);
        let mut bytes = [0xffu8; REQUEST_SIZE];
        request.encode(&mut bytes).unwrap();
        assert_eq!(&bytes[0..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(&bytes[6..8], &[0, 1]);
        assert_eq!(&bytes[10..12], &[0, 0]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 1]);
        assert_eq!(TimerRequest::decode(&bytes).unwrap(), request);
        assert_eq!(request.command(), Some(TimerCommand::Open));
    }

    #[test]
    fn test_reply_carries_error_code() {
        let request = TimerRequest::open(7, 0, 0, false);
        let reply = TimerReply::failure(&request, Error::InvalidArg);
        let mut bytes = [0u8; REPLY_SIZE];
        reply.encode(&mut bytes).unwrap();
        assert_eq!(&bytes[8..12], &Error::InvalidArg.code().to_be_bytes());

        let decoded = TimerReply::decode(&bytes).unwrap();
        assert_eq!(decoded.error, Some(Error::InvalidArg));
        assert!(!decoded.is_tick());
        assert!(TimerReply::tick(7, 1).is_tick());
    }

    #[test]
    fn test_short_buffers_are_rejected() {
        assert_eq!(TimerRequest::decode(&[0; 10]), Err(Error::PacketTooShort));
        assert_eq!(TimerReply::decode(&[0; 11]), Err(Error::PacketTooShort));
    }
}
