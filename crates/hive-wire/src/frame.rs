//! Frame type tags.

use hive_types::{HiveError, HiveResult};
use std::fmt;

/// First byte of every frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Heartbeat = 1,
    Push = 2,
    Request = 3,
    ResponseOk = 4,
    ResponseFail = 5,
    Watch = 6,
    Notify = 7,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Read the type byte of a frame body.
    pub fn of(frame: &[u8]) -> HiveResult<Self> {
        match frame.first() {
            Some(&b) => Self::try_from(b),
            None => Err(HiveError::unmarshal("frame_type", "empty frame")),
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = HiveError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Heartbeat,
            2 => Self::Push,
            3 => Self::Request,
            4 => Self::ResponseOk,
            5 => Self::ResponseFail,
            6 => Self::Watch,
            7 => Self::Notify,
            other => {
                return Err(HiveError::unmarshal(
                    "frame_type",
                    format!("unknown frame type {other}"),
                ))
            }
        })
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Heartbeat => "heartbeat",
            Self::Push => "push",
            Self::Request => "request",
            Self::ResponseOk => "response_ok",
            Self::ResponseFail => "response_fail",
            Self::Watch => "watch",
            Self::Notify => "notify",
        };
        f.write_str(name)
    }
}
