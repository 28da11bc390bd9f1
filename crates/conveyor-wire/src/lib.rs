// Wire formats shared by the broker service, its client and the workers.
// Frames carry JSON broker messages; `batch` and `state` hold the body and
// persisted-state codecs used by pipeline stages.
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use conveyor_common::HeaderTable;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod batch;
pub mod state;

pub const MAGIC: u32 = 0x434E_5659;
pub const VERSION: u16 = 1;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(#[source] serde_json::Error),
    #[error("malformed batch body: {0}")]
    Batch(String),
    #[error("malformed state line: {0}")]
    State(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Fixed-size prefix of every frame, encoded big endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 10;

    pub fn new(length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            length,
        })
    }
}

/// Length-prefixed frame.
///
/// ```
/// use bytes::Bytes;
/// use conveyor_wire::Frame;
///
/// let frame = Frame::new(Bytes::from_static(b"hello")).expect("frame");
/// let decoded = Frame::decode(frame.encode()).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: Bytes) -> Result<Self> {
        let length = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge(payload.len()))?;
        Ok(Self {
            header: FrameHeader::new(length),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        let header = FrameHeader::decode(&input)?;
        let end = FrameHeader::LEN + header.length as usize;
        if input.len() < end {
            return Err(Error::Incomplete);
        }
        Ok(Self {
            header,
            payload: input.slice(FrameHeader::LEN..end),
        })
    }
}

/// Reads one frame. Returns `None` when the peer closed the stream between frames.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FrameHeader::LEN];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let header = FrameHeader::decode(&prefix)?;
    let length = header.length as usize;
    if length > max_frame_bytes {
        return Err(Error::FrameTooLarge(length));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        header,
        payload: Bytes::from(payload),
    }))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Broker protocol messages. Every request carries a `request_id` answered by
/// `Ok` or `Error`; `Deliver` is pushed to consumers.
///
/// ```
/// use bytes::Bytes;
/// use conveyor_common::HeaderTable;
/// use conveyor_wire::Message;
///
/// let message = Message::Publish {
///     request_id: 1,
///     exchange: "movies".to_string(),
///     routing_key: "filter-0".to_string(),
///     headers: HeaderTable::new(),
///     body: Bytes::from_static(b"id=1"),
/// };
/// let frame = message.encode().expect("encode");
/// assert_eq!(Message::decode(&frame).expect("decode"), message);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    DeclareExchange {
        request_id: u64,
        name: String,
    },
    DeclareQueue {
        request_id: u64,
        name: String,
    },
    BindQueue {
        request_id: u64,
        queue: String,
        routing_key: String,
        exchange: String,
    },
    Publish {
        request_id: u64,
        exchange: String,
        routing_key: String,
        headers: HeaderTable,
        #[serde(with = "base64_bytes")]
        body: Bytes,
    },
    Consume {
        request_id: u64,
        queue: String,
        consumer_tag: String,
    },
    Deliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        headers: HeaderTable,
        #[serde(with = "base64_bytes")]
        body: Bytes,
    },
    Ack {
        request_id: u64,
        delivery_tag: u64,
    },
    Nack {
        request_id: u64,
        delivery_tag: u64,
        requeue: bool,
    },
    Ok {
        request_id: u64,
    },
    Error {
        request_id: u64,
        message: String,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(Bytes::from(payload))
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }

    // Request id of a request or its reply; pushed deliveries have none.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Message::DeclareExchange { request_id, .. }
            | Message::DeclareQueue { request_id, .. }
            | Message::BindQueue { request_id, .. }
            | Message::Publish { request_id, .. }
            | Message::Consume { request_id, .. }
            | Message::Ack { request_id, .. }
            | Message::Nack { request_id, .. }
            | Message::Ok { request_id }
            | Message::Error { request_id, .. } => Some(*request_id),
            Message::Deliver { .. } => None,
        }
    }
}

mod base64_bytes {
    use super::*;
    use serde::de::Error;

    pub fn serialize<S>(value: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Bytes, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}
