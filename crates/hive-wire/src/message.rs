//! Typed message bodies.
//!
//! Any serde type that is `Clone + Debug + Default` is a [`Message`]. JSON
//! payloads use `serde_json`; binary payloads use MessagePack.

use hive_types::{HiveError, HiveResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;

/// A message that can travel as a Push, Request, Response or Notify payload.
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// Serialize as JSON (`json = true`) or MessagePack.
    fn encode(&self, json: bool) -> HiveResult<Vec<u8>>;

    /// Overwrite `self` from `bytes`. An empty payload leaves the default value.
    fn decode_into(&mut self, bytes: &[u8], json: bool) -> HiveResult<()>;

    /// Stable type name used by the codec's reverse index.
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    fn clone_message(&self) -> Box<dyn Message>;
}

impl<T> Message for T
where
    T: Serialize + DeserializeOwned + Clone + fmt::Debug + Default + Send + Sync + 'static,
{
    fn encode(&self, json: bool) -> HiveResult<Vec<u8>> {
        if json {
            serde_json::to_vec(self).map_err(|e| HiveError::Marshal(e.to_string()))
        } else {
            rmp_serde::to_vec_named(self).map_err(|e| HiveError::Marshal(e.to_string()))
        }
    }

    fn decode_into(&mut self, bytes: &[u8], json: bool) -> HiveResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        *self = if json {
            serde_json::from_slice(bytes).map_err(|e| HiveError::unmarshal("payload", e.to_string()))?
        } else {
            rmp_serde::from_slice(bytes).map_err(|e| HiveError::unmarshal("payload", e.to_string()))?
        };
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn clone_message(&self) -> Box<dyn Message> {
        Box::new(self.clone())
    }
}

impl dyn Message {
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }

    pub fn downcast_mut<M: Message>(&mut self) -> Option<&mut M> {
        self.as_any_mut().downcast_mut::<M>()
    }

    /// Take the concrete message out of the box.
    pub fn downcast<M: Message>(self: Box<Self>) -> HiveResult<M> {
        let name = self.type_name();
        self.into_any()
            .downcast::<M>()
            .map(|m| *m)
            .map_err(|_| {
                HiveError::unmarshal(
                    "payload",
                    format!("expected {}, found {name}", std::any::type_name::<M>()),
                )
            })
    }
}

/// Type name of `M` as reported by [`Message::type_name`].
pub fn type_name_of<M: Message>() -> &'static str {
    std::any::type_name::<M>()
}
