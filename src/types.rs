use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version stamped on every write; doubles as the transaction id.
pub type Version = i64;

pub type NodeId = u32;

/// Current state of one key: the value and the id of the transaction that wrote it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataItem {
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    pub version: Version,
}

impl fmt::Debug for DataItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataItem")
            .field("value_len", &self.value.len())
            .field("version", &self.version)
            .finish()
    }
}

impl DataItem {
    pub fn new(value: impl Into<Vec<u8>>, version: Version) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }
}

/// Where a request came from. Only local requests are fanned out to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "req",
            Origin::Remote => "sync",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "req" => Ok(Origin::Local),
            "sync" => Ok(Origin::Remote),
            other => Err(Error::Malformed(format!("unknown origin {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Set,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Set => "set",
            Action::Delete => "del",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "set" => Ok(Action::Set),
            "del" => Ok(Action::Delete),
            other => Err(Error::Malformed(format!("unsupported action {other:?}"))),
        }
    }
}

/// One intended mutation, independent of its source.
#[derive(Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub tx_id: Version,
    pub origin: Origin,
    pub action: Action,
    pub key: String,
    pub value: Vec<u8>,
}

impl fmt::Debug for TxRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxRequest")
            .field("tx_id", &self.tx_id)
            .field("origin", &self.origin)
            .field("action", &self.action)
            .field("key", &self.key)
            .field("value_len", &self.value.len())
            .finish()
    }
}

impl TxRequest {
    pub fn set(tx_id: Version, origin: Origin, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            tx_id,
            origin,
            action: Action::Set,
            key: key.into(),
            value,
        }
    }

    pub fn delete(tx_id: Version, origin: Origin, key: impl Into<String>) -> Self {
        Self {
            tx_id,
            origin,
            action: Action::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }

    /// Same request re-stamped as received from a peer.
    pub fn to_remote(&self) -> Self {
        Self {
            origin: Origin::Remote,
            ..self.clone()
        }
    }

    /// Encode as a text record: `tx_id origin action key [base64(value)]`.
    ///
    /// The value field is left out for deletes and for empty values.
    pub fn to_record(&self) -> String {
        let mut line = format!(
            "{} {} {} {}",
            self.tx_id, self.origin, self.action, self.key
        );
        if self.action == Action::Set && !self.value.is_empty() {
            line.push(' ');
            line.push_str(&STANDARD.encode(&self.value));
        }
        line
    }

    pub fn parse_record(record: &str) -> Result<Self> {
        let fields: Vec<&str> = record.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(Error::Malformed(format!(
                "expected at least 4 fields, found {}",
                fields.len()
            )));
        }
        let tx_id = fields[0]
            .parse::<Version>()
            .map_err(|e| Error::Malformed(format!("bad tx id {:?}: {e}", fields[0])))?;
        let origin = fields[1].parse::<Origin>()?;
        let action = fields[2].parse::<Action>()?;
        let key = fields[3];

        match action {
            Action::Delete => Ok(Self::delete(tx_id, origin, key)),
            Action::Set => {
                let value = match fields.get(4..) {
                    Some([]) | None => Vec::new(),
                    Some([encoded]) => STANDARD
                        .decode(encoded)
                        .map_err(|e| Error::Malformed(format!("bad base64 value: {e}")))?,
                    Some(_) => {
                        return Err(Error::Malformed("more than one value field".into()));
                    }
                };
                Ok(Self::set(tx_id, origin, key, value))
            }
        }
    }
}

impl FromStr for TxRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_record(s)
    }
}

/// Keys travel inside whitespace-delimited records.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Malformed("empty key".into()));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(Error::Malformed(format!("key {key:?} contains whitespace")));
    }
    Ok(())
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_record_carries_base64_value() {
        let req = TxRequest::set(42, Origin::Local, "greeting", b"hello".to_vec());
        assert_eq!(req.to_record(), "42 req set greeting aGVsbG8=");
        assert_eq!(TxRequest::parse_record(&req.to_record()).unwrap(), req);
    }

    #[test]
    fn empty_value_and_delete_omit_value_field() {
        let empty = TxRequest::set(7, Origin::Remote, "k", Vec::new());
        assert_eq!(empty.to_record(), "7 sync set k");
        let del = TxRequest::delete(8, Origin::Remote, "k");
        assert_eq!(del.to_record(), "8 sync del k");
        assert_eq!(TxRequest::parse_record("8 sync del k").unwrap(), del);
    }

    #[test]
    fn rejects_malformed_records() {
        for bad in [
            "",
            "1 req set",
            "x req set k",
            "1 bogus set k",
            "1 req put k",
            "1 req set k !!!",
            "1 req set k aGk= aGk=",
        ] {
            assert!(
                matches!(TxRequest::parse_record(bad), Err(Error::Malformed(_))),
                "{bad:?} should be malformed"
            );
        }
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("user:1").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("two words").is_err());
    }
}
