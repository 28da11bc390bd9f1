// Message identity shared by every pipeline stage.
// Headers travel as transport metadata next to the body; the receiver and the
// senders agree on the key names and on the integer values of `MessageKind`.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid header {key}: {value}")]
    InvalidHeader { key: &'static str, value: String },
    #[error("unknown message kind: {0}")]
    UnknownKind(i32),
}

pub type ClientId = i32;
pub type ReplicaId = usize;
pub type Seq = i32;
pub type QueryId = i32;

/// Query value carried when a message is not tied to a result set.
pub const NO_QUERY: QueryId = -1;
/// Client id stamped on PURGE, which applies to every session.
pub const ALL_CLIENTS: ClientId = -1;

pub const HEADER_REPLICA_ID: &str = "replica-id";
pub const HEADER_CLIENT_ID: &str = "client-id";
pub const HEADER_SEQ: &str = "seq";
pub const HEADER_KIND: &str = "kind";
pub const HEADER_QUERY: &str = "query";

/// Kind of a transported message. The discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum MessageKind {
    Batch = 0,
    Eof = 1,
    Flush = 2,
    Purge = 3,
}

impl MessageKind {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    // EOF and FLUSH are the markers counted by the receiver barrier.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageKind::Eof | MessageKind::Flush)
    }
}

impl TryFrom<i32> for MessageKind {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::Batch),
            1 => Ok(MessageKind::Eof),
            2 => Ok(MessageKind::Flush),
            3 => Ok(MessageKind::Purge),
            other => Err(Error::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Batch => "batch",
            MessageKind::Eof => "eof",
            MessageKind::Flush => "flush",
            MessageKind::Purge => "purge",
        };
        f.write_str(name)
    }
}

/// A single header value. Integers cover every key the pipeline reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Int(i32),
    Str(String),
}

impl HeaderValue {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            HeaderValue::Int(value) => Some(*value),
            HeaderValue::Str(_) => None,
        }
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Int(value) => write!(f, "{value}"),
            HeaderValue::Str(value) => f.write_str(value),
        }
    }
}

/// Transport metadata attached to every message.
pub type HeaderTable = BTreeMap<String, HeaderValue>;

/// Position of one message in the stream a replica produces for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelId {
    pub replica_id: ReplicaId,
    pub seq: Seq,
    pub client_id: ClientId,
}

impl DelId {
    pub fn new(replica_id: ReplicaId, seq: Seq, client_id: ClientId) -> Self {
        Self {
            replica_id,
            seq,
            client_id,
        }
    }
}

impl fmt::Display for DelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replica={} client={} seq={}",
            self.replica_id, self.client_id, self.seq
        )
    }
}

/// Decoded message headers.
///
/// ```
/// use conveyor_common::{Headers, MessageKind};
///
/// let headers = Headers::new(1, 7, 3, MessageKind::Batch);
/// let table = headers.to_table();
/// let decoded = Headers::from_table(&table).expect("decode");
/// assert_eq!(decoded, headers);
/// assert_eq!(decoded.id().seq, 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headers {
    pub replica_id: ReplicaId,
    pub client_id: ClientId,
    pub seq: Seq,
    pub query: QueryId,
    pub kind: MessageKind,
}

impl Headers {
    pub fn new(replica_id: ReplicaId, client_id: ClientId, seq: Seq, kind: MessageKind) -> Self {
        Self {
            replica_id,
            client_id,
            seq,
            query: NO_QUERY,
            kind,
        }
    }

    pub fn with_query(mut self, query: QueryId) -> Self {
        self.query = query;
        self
    }

    pub fn id(&self) -> DelId {
        DelId::new(self.replica_id, self.seq, self.client_id)
    }

    pub fn from_table(table: &HeaderTable) -> Result<Self> {
        let replica = required_int(table, HEADER_REPLICA_ID)?;
        let replica_id = ReplicaId::try_from(replica).map_err(|_| Error::InvalidHeader {
            key: HEADER_REPLICA_ID,
            value: replica.to_string(),
        })?;
        let client_id = required_int(table, HEADER_CLIENT_ID)?;
        let seq = required_int(table, HEADER_SEQ)?;
        let kind = MessageKind::try_from(required_int(table, HEADER_KIND)?)?;
        let query = match table.get(HEADER_QUERY) {
            None => NO_QUERY,
            Some(value) => value.as_int().ok_or_else(|| Error::InvalidHeader {
                key: HEADER_QUERY,
                value: value.to_string(),
            })?,
        };
        Ok(Self {
            replica_id,
            client_id,
            seq,
            query,
            kind,
        })
    }

    pub fn to_table(&self) -> HeaderTable {
        let mut table = HeaderTable::new();
        // Replica ids are small indexes; they always fit the int32 header.
        table.insert(
            HEADER_REPLICA_ID.to_string(),
            HeaderValue::Int(self.replica_id as i32),
        );
        table.insert(HEADER_CLIENT_ID.to_string(), HeaderValue::Int(self.client_id));
        table.insert(HEADER_SEQ.to_string(), HeaderValue::Int(self.seq));
        table.insert(
            HEADER_KIND.to_string(),
            HeaderValue::Int(self.kind.as_i32()),
        );
        if self.query != NO_QUERY {
            table.insert(HEADER_QUERY.to_string(), HeaderValue::Int(self.query));
        }
        table
    }
}

fn required_int(table: &HeaderTable, key: &'static str) -> Result<i32> {
    let value = table.get(key).ok_or(Error::MissingHeader(key))?;
    value.as_int().ok_or_else(|| Error::InvalidHeader {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, HeaderValue)]) -> HeaderTable {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn kind_values_match_wire_contract() {
        assert_eq!(MessageKind::Batch.as_i32(), 0);
        assert_eq!(MessageKind::Eof.as_i32(), 1);
        assert_eq!(MessageKind::Flush.as_i32(), 2);
        assert_eq!(MessageKind::Purge.as_i32(), 3);
        assert_eq!(MessageKind::try_from(2).expect("kind"), MessageKind::Flush);
        assert_eq!(MessageKind::try_from(9), Err(Error::UnknownKind(9)));
    }

    #[test]
    fn only_eof_and_flush_are_terminal() {
        assert!(MessageKind::Eof.is_terminal());
        assert!(MessageKind::Flush.is_terminal());
        assert!(!MessageKind::Batch.is_terminal());
        assert!(!MessageKind::Purge.is_terminal());
    }

    #[test]
    fn query_defaults_when_absent() {
        let headers = Headers::from_table(&table(&[
            (HEADER_REPLICA_ID, 0.into()),
            (HEADER_CLIENT_ID, 4.into()),
            (HEADER_SEQ, 12.into()),
            (HEADER_KIND, 1.into()),
        ]))
        .expect("headers");
        assert_eq!(headers.query, NO_QUERY);
        assert_eq!(headers.kind, MessageKind::Eof);
        assert_eq!(headers.id(), DelId::new(0, 12, 4));
    }

    #[test]
    fn query_is_kept_in_table() {
        let headers = Headers::new(2, 9, 0, MessageKind::Batch).with_query(3);
        let encoded = headers.to_table();
        assert_eq!(encoded.get(HEADER_QUERY), Some(&HeaderValue::Int(3)));
        assert_eq!(Headers::from_table(&encoded).expect("decode"), headers);
    }

    #[test]
    fn missing_seq_is_rejected() {
        let err = Headers::from_table(&table(&[
            (HEADER_REPLICA_ID, 0.into()),
            (HEADER_CLIENT_ID, 4.into()),
            (HEADER_KIND, 0.into()),
        ]))
        .expect_err("missing seq");
        assert_eq!(err, Error::MissingHeader(HEADER_SEQ));
    }

    #[test]
    fn negative_replica_is_rejected() {
        let err = Headers::from_table(&table(&[
            (HEADER_REPLICA_ID, (-1).into()),
            (HEADER_CLIENT_ID, 4.into()),
            (HEADER_SEQ, 0.into()),
            (HEADER_KIND, 0.into()),
        ]))
        .expect_err("negative replica");
        assert!(matches!(err, Error::InvalidHeader { key, .. } if key == HEADER_REPLICA_ID));
    }

    #[test]
    fn string_values_are_not_integers() {
        let err = Headers::from_table(&table(&[
            (HEADER_REPLICA_ID, 0.into()),
            (HEADER_CLIENT_ID, "seven".into()),
            (HEADER_SEQ, 0.into()),
            (HEADER_KIND, 0.into()),
        ]))
        .expect_err("string client");
        assert!(matches!(err, Error::InvalidHeader { key, .. } if key == HEADER_CLIENT_ID));
    }

    #[test]
    fn header_values_serialize_untagged() {
        let encoded = serde_json::to_string(&table(&[
            (HEADER_SEQ, 5.into()),
            ("origin", "gateway".into()),
        ]))
        .expect("json");
        assert_eq!(encoded, r#"{"origin":"gateway","seq":5}"#);
        let decoded: HeaderTable = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.get(HEADER_SEQ), Some(&HeaderValue::Int(5)));
    }
}
