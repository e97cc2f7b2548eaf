//! Hive wire protocol.
//!
//! - [`FrameType`]: the leading byte of every frame body
//! - [`Head`] / [`Value`]: self-describing metadata maps
//! - [`packer`]: fixed binary layouts for each frame type
//! - [`Message`] / [`Codec`]: typed payloads and their registry

pub mod codec;
pub mod frame;
pub mod message;
pub mod packer;
pub mod value;

pub use codec::Codec;
pub use frame::FrameType;
pub use message::{type_name_of, Message};
pub use packer::{
    NotifyFrame, PushFrame, RequestFrame, ResponseFailFrame, ResponseOkFrame, WatchFrame,
};
pub use value::{keys, Head, Value};
