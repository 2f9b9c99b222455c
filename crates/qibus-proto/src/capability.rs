//! Capability maps: the negotiation medium of the authentication handshake.
//!
//! A capability map is a `{string: value}` map exchanged between client and
//! server. It carries feature flags plus the reserved authentication keys,
//! and the server's replies carry the authentication state under
//! [`KEY_STATE`].

use std::collections::HashMap;

use crate::basic::{ByteReader, ByteWriter};
use crate::errors::Result;
use crate::value::Value;

/// Key of the authentication state in the map.
pub const KEY_STATE: &str = "__qi_auth_state";
/// Key of the user name.
pub const KEY_USER: &str = "auth_user";
/// Key of the user token.
pub const KEY_TOKEN: &str = "auth_token";
/// Key of a server-issued replacement token.
pub const KEY_NEW_TOKEN: &str = "auth_newToken";

/// Authentication states carried under [`KEY_STATE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthState {
    /// Authentication failed.
    Error = 1,
    /// A token-renewal round is required.
    Continue = 2,
    /// Authentication succeeded.
    Done = 3,
}

impl AuthState {
    /// Decode a state value.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Error),
            2 => Some(Self::Continue),
            3 => Some(Self::Done),
            _ => None,
        }
    }
}

/// A `{string: value}` capability map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityMap {
    entries: HashMap<String, Value>,
}

impl CapabilityMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default capabilities proposed by a client, with optional
    /// credentials. Empty user or token entries are omitted.
    pub fn preferred(user: &str, token: &str) -> Self {
        let mut map = Self::new();
        map.insert("ClientServerSocket", Value::from_bool(true));
        map.insert("MessageFlags", Value::from_bool(true));
        map.insert("MetaObjectCache", Value::from_bool(false));
        map.insert("RemoteCancelableCalls", Value::from_bool(false));
        map.insert("ObjectPtrUID", Value::from_bool(false));
        if !user.is_empty() {
            map.insert(KEY_USER, Value::from_string(user));
        }
        if !token.is_empty() {
            map.insert(KEY_TOKEN, Value::from_string(token));
        }
        map
    }

    /// Insert an entry, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Look up an entry.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Remove an entry, returning it.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// The raw authentication state integer, if present.
    ///
    /// Accepts both unsigned and signed integer encodings; some peers send
    /// `i` where `I` is expected.
    pub fn state_raw(&self) -> Option<u32> {
        let value = self.entries.get(KEY_STATE)?;
        value.to_u32().ok().or_else(|| value.to_i32().ok().map(|v| v as u32))
    }

    /// The authentication state, if present and well-formed.
    pub fn state(&self) -> Option<AuthState> {
        AuthState::from_u32(self.state_raw()?)
    }

    /// Set the authentication state.
    pub fn set_state(&mut self, state: AuthState) {
        self.insert(KEY_STATE, Value::from_u32(state as u32));
    }

    /// True once the handshake completed successfully.
    pub fn authenticated(&self) -> bool {
        self.state() == Some(AuthState::Done)
    }

    /// Force the done state; used by the legacy capability exchange.
    pub fn set_authenticated(&mut self) {
        self.set_state(AuthState::Done);
    }

    /// A string entry, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.entries.get(key).and_then(|v| v.to_str().ok())
    }

    /// Encode as `{sm}`.
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_u32(self.entries.len() as u32);
        for (key, value) in &self.entries {
            w.write_string(key);
            value.write(w);
        }
    }

    /// Decode from `{sm}`.
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let count = r.read_count(8)?;
        let mut entries = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = r.read_string()?;
            let value = Value::read(r)?;
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    /// Encode to a standalone payload buffer.
    pub fn to_payload(&self) -> bytes::Bytes {
        let mut w = ByteWriter::new();
        self.write(&mut w);
        w.into_bytes()
    }

    /// Decode from a standalone payload buffer.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(payload);
        Self::read(&mut r)
    }
}
