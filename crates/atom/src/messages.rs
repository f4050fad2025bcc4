//! Envelope types of the command protocol and the entries that carry them.
//!
//! Envelopes are flat maps of short string keys to byte values. Field
//! presence and types are checked at construction; extra key/value pairs
//! ride alongside but may never collide with the reserved key set.

use crate::config::RESERVED_ENVELOPE_KEYS;
use crate::serialization::{Datum, Serialization};
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

/// A nucleus-assigned stream entry id, `<milliseconds>-<sequence>`.
/// Ordering is lexicographic in `(ms, seq)`, matching the nucleus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl std::str::FromStr for EntryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidEntryId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(EntryId {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// Ordered wire fields of one envelope or entry.
pub(crate) type FieldList = Vec<(String, Vec<u8>)>;

pub(crate) fn is_reserved(key: &str) -> bool {
    RESERVED_ENVELOPE_KEYS.contains(&key)
}

fn check_extras(extras: &BTreeMap<String, Bytes>) -> Result<()> {
    for key in extras.keys() {
        if is_reserved(key) {
            return Err(Error::ReservedKey(key.clone()));
        }
    }
    Ok(())
}

/// A command sent from a caller element to a callee element's inbox.
#[derive(Debug, Clone)]
pub struct Command {
    /// The caller's name.
    pub element: String,
    /// The command to run on the callee.
    pub cmd: String,
    /// Opaque payload, already in wire form.
    pub data: Bytes,
    /// Free-form extras forwarded to the handler.
    pub extras: BTreeMap<String, Bytes>,
}

impl Command {
    pub fn new(
        element: impl Into<String>,
        cmd: impl Into<String>,
        data: impl Into<Bytes>,
        extras: BTreeMap<String, Bytes>,
    ) -> Result<Self> {
        let element = element.into();
        let cmd = cmd.into();
        if element.is_empty() {
            return Err(Error::EmptyElementName);
        }
        if cmd.is_empty() {
            return Err(Error::MissingField("cmd"));
        }
        check_extras(&extras)?;
        Ok(Command {
            element,
            cmd,
            data: data.into(),
            extras,
        })
    }

    pub(crate) fn to_fields(&self) -> FieldList {
        let mut fields = vec![
            ("element".to_string(), self.element.clone().into_bytes()),
            ("cmd".to_string(), self.cmd.clone().into_bytes()),
            ("data".to_string(), self.data.to_vec()),
        ];
        for (key, value) in &self.extras {
            fields.push((key.clone(), value.to_vec()));
        }
        fields
    }

    /// Decode a consumed inbox entry. Entries missing the required fields
    /// are not commands and yield `None`; the dispatch loop skips them.
    pub(crate) fn from_map(map: &HashMap<String, Vec<u8>>) -> Option<Command> {
        let element = String::from_utf8(map.get("element")?.clone()).ok()?;
        let cmd = String::from_utf8(map.get("cmd")?.clone()).ok()?;
        let data = Bytes::from(map.get("data")?.clone());

        let mut extras = BTreeMap::new();
        for (key, value) in map {
            if !is_reserved(key) {
                extras.insert(key.clone(), Bytes::from(value.clone()));
            }
        }
        Some(Command {
            element,
            cmd,
            data,
            extras,
        })
    }
}

/// Sent by the callee to the caller's response inbox before the handler
/// runs, carrying how long the caller should wait for the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledge {
    /// The callee's name.
    pub element: String,
    /// Entry id of the originating command.
    pub cmd_id: EntryId,
    pub timeout_ms: u64,
}

impl Acknowledge {
    pub(crate) fn to_fields(&self) -> FieldList {
        vec![
            ("element".to_string(), self.element.clone().into_bytes()),
            ("cmd_id".to_string(), self.cmd_id.to_string().into_bytes()),
            ("timeout".to_string(), self.timeout_ms.to_string().into_bytes()),
        ]
    }
}

/// What a handler returns, and what `command_send` hands back. `err_code`
/// zero means success; handler codes are offset into the user range by the
/// dispatch loop before they hit the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub data: Datum,
    pub err_code: u64,
    pub err_str: String,
    pub extras: BTreeMap<String, Bytes>,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            data: Datum::empty(),
            err_code: 0,
            err_str: String::new(),
            extras: BTreeMap::new(),
        }
    }
}

impl Response {
    pub fn ok(data: impl Into<Datum>) -> Self {
        Response {
            data: data.into(),
            ..Default::default()
        }
    }

    /// A success response whose payload is encoded now with the given codec.
    pub fn serialized<T: serde::Serialize + ?Sized>(
        data: &T,
        method: Serialization,
    ) -> Result<Self> {
        Ok(Response {
            data: Datum::Bytes(method.encode(data)?.into()),
            ..Default::default()
        })
    }

    pub fn error(err_code: u64, err_str: impl Into<String>) -> Self {
        Response {
            err_code,
            err_str: err_str.into(),
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Result<Self> {
        let key = key.into();
        if is_reserved(&key) {
            return Err(Error::ReservedKey(key));
        }
        self.extras.insert(key, value.into());
        Ok(self)
    }

    pub fn is_ok(&self) -> bool {
        self.err_code == 0
    }

    /// The wire form written to the caller's response inbox.
    pub(crate) fn to_fields(&self, element: &str, cmd: &str, cmd_id: EntryId) -> FieldList {
        let mut fields = vec![
            ("element".to_string(), element.as_bytes().to_vec()),
            ("cmd".to_string(), cmd.as_bytes().to_vec()),
            ("cmd_id".to_string(), cmd_id.to_string().into_bytes()),
            ("data".to_string(), self.data.raw_wire()),
            ("err_code".to_string(), self.err_code.to_string().into_bytes()),
            ("err_str".to_string(), self.err_str.clone().into_bytes()),
        ];
        for (key, value) in &self.extras {
            fields.push((key.clone(), value.to_vec()));
        }
        fields
    }
}

/// One decoded stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    pub fields: BTreeMap<String, Datum>,
}

impl Entry {
    pub fn field(&self, name: &str) -> Option<&Datum> {
        self.fields.get(name)
    }
}

/// Syslog-style severities of the global log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Emerg = 0,
    Alert = 1,
    Crit = 2,
    Err = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Timing = 7,
    Debug = 8,
}

impl LogLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Emerg | LogLevel::Alert | LogLevel::Crit | LogLevel::Err => {
                tracing::Level::ERROR
            }
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Notice | LogLevel::Info => tracing::Level::INFO,
            LogLevel::Timing | LogLevel::Debug => tracing::Level::DEBUG,
        }
    }
}

/// A record appended to the global `log` stream.
#[derive(Debug, Clone)]
pub struct Log {
    pub element: String,
    pub host: String,
    pub level: LogLevel,
    pub msg: String,
}

impl Log {
    pub(crate) fn to_fields(&self) -> FieldList {
        vec![
            ("element".to_string(), self.element.clone().into_bytes()),
            ("host".to_string(), self.host.clone().into_bytes()),
            ("level".to_string(), self.level.as_u8().to_string().into_bytes()),
            ("msg".to_string(), self.msg.clone().into_bytes()),
        ]
    }
}
