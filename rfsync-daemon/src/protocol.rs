//! Wire protocol: a JSON envelope terminated by a single `@` byte.
//!
//! ```text
//! {"sec":0,"time":"2024-05-01T10:00:00Z","type":6,"payload":[123,34,...]}@
//! ```
//!
//! `payload` is the JSON encoding of the kind-specific payload, carried as a
//! byte array; for `ResponseFile` it is the raw file content. A `@` can only
//! occur inside a JSON string, so the encoder rewrites it to `\u0040` and the
//! delimiter stays unambiguous.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rfsync_core::{FileMeta, Op};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use crate::error::ProtocolError;

pub const DELIMITER: u8 = b'@';
const ESCAPED_DELIMITER: &[u8] = br"\u0040";

/// Upper bound on one buffered frame.
pub const MAX_FRAME_LEN: usize = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageKind {
    ChangeNotify = 1,
    RequestFile = 2,
    ResponseFile = 3,
    SubscribePath = 4,
    FilesList = 5,
    Join = 6,
    AckJoin = 7,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => MessageKind::ChangeNotify,
            2 => MessageKind::RequestFile,
            3 => MessageKind::ResponseFile,
            4 => MessageKind::SubscribePath,
            5 => MessageKind::FilesList,
            6 => MessageKind::Join,
            7 => MessageKind::AckJoin,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckJoinPayload {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
}

impl AckJoinPayload {
    pub fn accepted() -> Self {
        Self {
            ok: true,
            msg: String::new(),
        }
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            msg: msg.into(),
        }
    }
}

/// One changed file. `path` is the sender's root, `file_name` the
/// root-relative name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetaPayload {
    pub path: String,
    pub file_name: String,
    pub op: Op,
    pub size: u64,
    pub change_date: DateTime<Utc>,
}

impl FileMetaPayload {
    pub fn from_meta(root: &str, meta: &FileMeta, op: Op) -> Self {
        Self {
            path: root.to_string(),
            file_name: meta.name.clone(),
            op,
            size: meta.size,
            change_date: meta.modify_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFilePayload {
    pub path: String,
    pub file_name: String,
    pub change_date: DateTime<Utc>,
}

impl From<&FileMetaPayload> for RequestFilePayload {
    fn from(notify: &FileMetaPayload) -> Self {
        Self {
            path: notify.path.clone(),
            file_name: notify.file_name.clone(),
            change_date: notify.change_date,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribePathPayload {
    pub path: String,
    pub id: String,
}

/// Snapshot of every file under `path`; empty in the request direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathFiles {
    pub path: String,
    pub files: Vec<FileMetaPayload>,
}

/// Decoded message, tagged by its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ChangeNotify(FileMetaPayload),
    RequestFile(RequestFilePayload),
    ResponseFile(Vec<u8>),
    SubscribePath(SubscribePathPayload),
    FilesList(PathFiles),
    Join(JoinPayload),
    AckJoin(AckJoinPayload),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ChangeNotify(_) => MessageKind::ChangeNotify,
            Message::RequestFile(_) => MessageKind::RequestFile,
            Message::ResponseFile(_) => MessageKind::ResponseFile,
            Message::SubscribePath(_) => MessageKind::SubscribePath,
            Message::FilesList(_) => MessageKind::FilesList,
            Message::Join(_) => MessageKind::Join,
            Message::AckJoin(_) => MessageKind::AckJoin,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Message::ChangeNotify(p) => serde_json::to_vec(p),
            Message::RequestFile(p) => serde_json::to_vec(p),
            Message::ResponseFile(bytes) => Ok(bytes.clone()),
            Message::SubscribePath(p) => serde_json::to_vec(p),
            Message::FilesList(p) => serde_json::to_vec(p),
            Message::Join(p) => serde_json::to_vec(p),
            Message::AckJoin(p) => serde_json::to_vec(p),
        }
    }

    fn decode_payload(kind: MessageKind, payload: Vec<u8>) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::ChangeNotify => Message::ChangeNotify(serde_json::from_slice(&payload)?),
            MessageKind::RequestFile => Message::RequestFile(serde_json::from_slice(&payload)?),
            MessageKind::ResponseFile => Message::ResponseFile(payload),
            MessageKind::SubscribePath => Message::SubscribePath(decode_or_default(&payload)?),
            MessageKind::FilesList => Message::FilesList(decode_or_default(&payload)?),
            MessageKind::Join => Message::Join(serde_json::from_slice(&payload)?),
            MessageKind::AckJoin => Message::AckJoin(serde_json::from_slice(&payload)?),
        })
    }
}

fn decode_or_default<T: DeserializeOwned + Default>(payload: &[u8]) -> Result<T, serde_json::Error> {
    if payload.is_empty() {
        Ok(T::default())
    } else {
        serde_json::from_slice(payload)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(default)]
    sec: u64,
    time: DateTime<Utc>,
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    heading: BTreeMap<String, String>,
    #[serde(default)]
    payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence hint; replies carry the request's value plus one.
    pub sec: u64,
    pub time: DateTime<Utc>,
    pub heading: BTreeMap<String, String>,
    pub message: Message,
}

impl Frame {
    pub fn new(message: Message) -> Self {
        Self {
            sec: 0,
            time: Utc::now(),
            heading: BTreeMap::new(),
            message,
        }
    }

    /// A reply echoing the request's heading.
    pub fn reply_to(request: &Frame, message: Message) -> Self {
        Self {
            sec: request.sec.wrapping_add(1),
            time: Utc::now(),
            heading: request.heading.clone(),
            message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Serialize, escape and terminate with the delimiter.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let envelope = Envelope {
            sec: self.sec,
            time: self.time,
            kind: self.kind(),
            heading: self.heading.clone(),
            payload: self.message.encode_payload()?,
        };
        let mut bytes = escape_delimiter(serde_json::to_vec(&envelope)?);
        bytes.push(DELIMITER);
        Ok(bytes)
    }

    /// Decode one frame body (delimiter already stripped). The kind is read
    /// first and selects how the payload is decoded.
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        let message = Message::decode_payload(envelope.kind, envelope.payload)?;
        Ok(Self {
            sec: envelope.sec,
            time: envelope.time,
            heading: envelope.heading,
            message,
        })
    }
}

fn escape_delimiter(json: Vec<u8>) -> Vec<u8> {
    if !json.contains(&DELIMITER) {
        return json;
    }
    let mut escaped = Vec::with_capacity(json.len() + ESCAPED_DELIMITER.len());
    for byte in json {
        if byte == DELIMITER {
            escaped.extend_from_slice(ESCAPED_DELIMITER);
        } else {
            escaped.push(byte);
        }
    }
    escaped
}

/// Buffered frame reader.
///
/// Partially received bytes are kept across calls, so `read_frame` can be
/// raced against a timeout or cancellation without losing data.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            limit: MAX_FRAME_LEN,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Next frame, or `None` on a clean end of stream.
    ///
    /// A malformed frame is consumed and reported; the stream stays usable.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let room = (self.limit + 1).saturating_sub(self.buf.len()) as u64;
            let read = (&mut self.inner)
                .take(room)
                .read_until(DELIMITER, &mut self.buf)
                .await?;

            if self.buf.last() == Some(&DELIMITER) {
                let bytes = std::mem::take(&mut self.buf);
                return Frame::decode(&bytes[..bytes.len() - 1]).map(Some);
            }
            if self.buf.len() > self.limit {
                self.buf.clear();
                return Err(ProtocolError::FrameTooLarge { limit: self.limit });
            }
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let buffered = self.buf.len();
                self.buf.clear();
                return Err(ProtocolError::Truncated { buffered });
            }
        }
    }

    /// Next frame; end of stream is an error.
    pub async fn expect_frame(&mut self) -> Result<Frame, ProtocolError> {
        self.read_frame().await?.ok_or(ProtocolError::Closed)
    }
}

/// Frame writer stamping an increasing sequence hint on every sent frame.
pub struct FrameWriter<W> {
    inner: W,
    next_sec: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, next_sec: 0 }
    }

    pub async fn send(&mut self, message: Message) -> Result<(), ProtocolError> {
        let mut frame = Frame::new(message);
        frame.sec = self.next_sec;
        self.next_sec = self.next_sec.wrapping_add(1);
        self.write_frame(&frame).await
    }

    /// Write one encoded frame; the peer closing before every byte is
    /// accepted is a short write.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let bytes = frame.encode()?;
        self.inner.write_all(&bytes).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::WriteZero {
                ProtocolError::ShortWrite {
                    expected: bytes.len(),
                }
            } else {
                ProtocolError::Io(err)
            }
        })?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
