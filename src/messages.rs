//! Length-prefixed framing shared by the tracker and peer servers.
//!
//! Every frame is `tag: u8 | length: u32 (big endian) | payload`. Control
//! payloads are UTF-8 text or JSON; `Data` frames carry raw artifact bytes and
//! are streamed rather than decoded into a [`Message`].

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SwarmError};

pub const HEADER_BYTES: usize = 5;
/// Upper bound for any frame that is decoded in memory.
pub const MAX_CONTROL_FRAME: u32 = 16 * 1024 * 1024;
pub const MAX_DATA_FRAME: u32 = u32::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum MessageType {
    Discover = 1,
    Register,
    Announce,
    FindChunk,
    PeerChunks,
    Stats,
    Fetch,
    List,
    Peers = 64,
    Ack,
    StatsReport,
    Data,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub endpoint: String,
    pub chunks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub endpoint: String,
    pub chunk: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    pub active_connections: u64,
    pub total_connections: u64,
    pub registered_peers: u64,
    /// sum over peers of offered chunks
    pub total_chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Discover,
    Register(Registration),
    Announce(Announcement),
    FindChunk(String),
    PeerChunks(String),
    Stats,
    Fetch(String),
    List,
    Peers(Vec<String>),
    Ack(String),
    StatsReport(TrackerStats),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageType,
    pub len: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut bytes = [0_u8; HEADER_BYTES];
        bytes[0] = self.kind as u8;
        bytes[1..].copy_from_slice(&self.len.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: [u8; HEADER_BYTES]) -> Result<Self> {
        let kind = MessageType::from_u8(bytes[0])
            .ok_or_else(|| SwarmError::Protocol(format!("unknown message tag {}", bytes[0])))?;
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Ok(Self { kind, len })
    }
}

fn json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| SwarmError::Protocol(e.to_string()))
}

fn from_json<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| SwarmError::Protocol(e.to_string()))
}

fn text(payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| SwarmError::Protocol("payload is not valid UTF-8".into()))
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Discover => MessageType::Discover,
            Message::Register(_) => MessageType::Register,
            Message::Announce(_) => MessageType::Announce,
            Message::FindChunk(_) => MessageType::FindChunk,
            Message::PeerChunks(_) => MessageType::PeerChunks,
            Message::Stats => MessageType::Stats,
            Message::Fetch(_) => MessageType::Fetch,
            Message::List => MessageType::List,
            Message::Peers(_) => MessageType::Peers,
            Message::Ack(_) => MessageType::Ack,
            Message::StatsReport(_) => MessageType::StatsReport,
            Message::Error(_) => MessageType::Error,
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Message::Discover | Message::Stats | Message::List => Vec::new(),
            Message::Register(registration) => json(registration)?,
            Message::Announce(announcement) => json(announcement)?,
            Message::Peers(peers) => json(peers)?,
            Message::StatsReport(stats) => json(stats)?,
            Message::FindChunk(s)
            | Message::PeerChunks(s)
            | Message::Fetch(s)
            | Message::Ack(s)
            | Message::Error(s) => s.as_bytes().to_vec(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.payload()?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_CONTROL_FRAME)
            .ok_or_else(|| SwarmError::Protocol(format!("{:?} frame too large", self.kind())))?;
        let mut message = Vec::from(Header { kind: self.kind(), len }.encode());
        message.extend_from_slice(&payload);
        Ok(message)
    }

    pub fn decode(kind: MessageType, payload: &[u8]) -> Result<Self> {
        Ok(match kind {
            MessageType::Discover => Message::Discover,
            MessageType::Stats => Message::Stats,
            MessageType::List => Message::List,
            MessageType::Register => Message::Register(from_json(payload)?),
            MessageType::Announce => Message::Announce(from_json(payload)?),
            MessageType::Peers => Message::Peers(from_json(payload)?),
            MessageType::StatsReport => Message::StatsReport(from_json(payload)?),
            MessageType::FindChunk => Message::FindChunk(text(payload)?),
            MessageType::PeerChunks => Message::PeerChunks(text(payload)?),
            MessageType::Fetch => Message::Fetch(text(payload)?),
            MessageType::Ack => Message::Ack(text(payload)?),
            MessageType::Error => Message::Error(text(payload)?),
            MessageType::Data => {
                return Err(SwarmError::Protocol("data frames are streamed, not decoded".into()))
            }
        })
    }
}

pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Header> {
    let mut bytes = [0_u8; HEADER_BYTES];
    reader.read_exact(&mut bytes).await?;
    Header::decode(bytes)
}

/// Reads the payload of a control frame whose header was already consumed.
pub async fn read_body<R: AsyncRead + Unpin>(reader: &mut R, header: Header) -> Result<Message> {
    if header.kind == MessageType::Data {
        return Err(SwarmError::Protocol("unexpected data frame".into()));
    }
    if header.len > MAX_CONTROL_FRAME {
        return Err(SwarmError::Protocol(format!(
            "{:?} frame of {} bytes exceeds limit",
            header.kind, header.len
        )));
    }
    let mut payload = vec![0_u8; header.len as usize];
    reader.read_exact(&mut payload).await?;
    Message::decode(header.kind, &payload)
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let header = read_header(reader).await?;
    read_body(reader, header).await
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&message.encode()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Starts a `Data` frame; the caller then writes exactly `len` bytes.
pub async fn write_data_header<W: AsyncWrite + Unpin>(writer: &mut W, len: u64) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| SwarmError::Protocol(format!("artifact of {len} bytes is too large")))?;
    let header = Header {
        kind: MessageType::Data,
        len,
    };
    writer.write_all(&header.encode()).await?;
    Ok(())
}
