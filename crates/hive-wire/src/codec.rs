//! Message registry: method key to factory, type name to key, request to response code.

use crate::message::{type_name_of, Message};
use hive_types::{method_key, split_key, HiveError, HiveResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

type Factory = Arc<dyn Fn() -> Box<dyn Message> + Send + Sync>;

#[derive(Default)]
struct Tables {
    factories: HashMap<u16, (Factory, &'static str)>,
    names: HashMap<&'static str, u16>,
    res_codes: HashMap<u16, u8>,
}

/// Thread-safe message registry shared by the router and node.
#[derive(Clone, Default)]
pub struct Codec {
    tables: Arc<RwLock<Tables>>,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request/response pair for method `(svc, req)` answered by `(svc, res)`.
    pub fn register<Req, Res>(&self, svc: u16, req: u8, res: u8) -> HiveResult<()>
    where
        Req: Message + Default,
        Res: Message + Default,
    {
        let req_key = method_key(svc, req)?;
        let res_key = method_key(svc, res)?;
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        insert::<Req>(&mut tables, req_key);
        insert::<Res>(&mut tables, res_key);
        tables.res_codes.insert(req_key, res);
        debug!(svc, req, res, "Registered request pair");
        Ok(())
    }

    /// Register a message used for pushes or notifications.
    pub fn register_one<M: Message + Default>(&self, svc: u16, code: u8) -> HiveResult<()> {
        let key = method_key(svc, code)?;
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        insert::<M>(&mut tables, key);
        Ok(())
    }

    /// A fresh default message for `(svc, code)`.
    pub fn spawn(&self, svc: u16, code: u8) -> HiveResult<Box<dyn Message>> {
        let key = method_key(svc, code)?;
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .factories
            .get(&key)
            .map(|(factory, _)| factory())
            .ok_or_else(|| not_registered(svc, code))
    }

    /// A fresh response message for request `(svc, req)`.
    pub fn spawn_res(&self, svc: u16, req: u8) -> HiveResult<Box<dyn Message>> {
        let res = self.res_code(svc, req)?;
        self.spawn(svc, res)
    }

    /// Response code registered for request `(svc, req)`.
    pub fn res_code(&self, svc: u16, req: u8) -> HiveResult<u8> {
        let key = method_key(svc, req)?;
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .res_codes
            .get(&key)
            .copied()
            .ok_or_else(|| HiveError::NotExist(format!("response for svc={svc} code={req}")))
    }

    /// Method key a message type was registered under.
    pub fn key_of(&self, type_name: &str) -> HiveResult<u16> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .names
            .get(type_name)
            .copied()
            .ok_or_else(|| HiveError::NotExist(format!("message type {type_name}")))
    }

    /// `(svc, code)` of message type `M`.
    pub fn method_of<M: Message>(&self) -> HiveResult<(u16, u8)> {
        self.key_of(type_name_of::<M>()).map(split_key)
    }

    /// Spawn and decode in one step.
    pub fn decode(
        &self,
        svc: u16,
        code: u8,
        bytes: &[u8],
        json: bool,
    ) -> HiveResult<Box<dyn Message>> {
        let mut msg = self.spawn(svc, code)?;
        msg.decode_into(bytes, json)?;
        Ok(msg)
    }

    pub fn is_registered(&self, svc: u16, code: u8) -> bool {
        let Ok(key) = method_key(svc, code) else {
            return false;
        };
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.factories.contains_key(&key)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.tables.read().unwrap_or_else(|e| e.into_inner()).factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn insert<M: Message + Default>(tables: &mut Tables, key: u16) {
    let name = type_name_of::<M>();
    let factory: Factory = Arc::new(|| Box::<M>::default() as Box<dyn Message>);
    tables.factories.insert(key, (factory, name));
    tables.names.insert(name, key);
}

fn not_registered(svc: u16, code: u8) -> HiveError {
    HiveError::NotExist(format!("svc={svc} code={code}"))
}
