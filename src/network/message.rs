// Network protocol messages and their framing

use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::serialize::{
    varint_size, write_u32_le, write_u64_le, write_var_bytes, write_varint, ByteReader, Encodable,
};
use crate::core::{double_hash, Block, Decodable, Hash256, Transaction, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::network::{AddressMessage, InventoryMessage, PeerAddress};

/// Largest payload we accept in a single frame
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

const COMMAND_LEN: usize = 12;

/// Network message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Version,
    Verack,
    Ping,
    Pong,
    Addr,
    Inv,
    GetData,
    GetBlocks,
    Block,
    Tx,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Version => "version",
            MessageType::Verack => "verack",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Addr => "addr",
            MessageType::Inv => "inv",
            MessageType::GetData => "getdata",
            MessageType::GetBlocks => "getblocks",
            MessageType::Block => "block",
            MessageType::Tx => "tx",
        }
    }

    pub fn from_command(s: &str) -> Option<Self> {
        match s {
            "version" => Some(MessageType::Version),
            "verack" => Some(MessageType::Verack),
            "ping" => Some(MessageType::Ping),
            "pong" => Some(MessageType::Pong),
            "addr" => Some(MessageType::Addr),
            "inv" => Some(MessageType::Inv),
            "getdata" => Some(MessageType::GetData),
            "getblocks" => Some(MessageType::GetBlocks),
            "block" => Some(MessageType::Block),
            "tx" => Some(MessageType::Tx),
            _ => None,
        }
    }
}

/// Version message, the first thing each side sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: u64,
    pub receiver: PeerAddress,
    pub sender: PeerAddress,
    pub nonce: u64,
    pub user_agent: String,
    /// Height of the sender's best chain. Signed on the wire.
    pub start_height: i32,
    /// Whether the sender wants transactions relayed. Only present when sent.
    pub relay: Option<bool>,
}

impl VersionMessage {
    pub fn new(receiver: SocketAddr, user_agent: &str, start_height: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            receiver: PeerAddress::new(receiver, 0),
            sender: PeerAddress::unspecified(),
            nonce: rand::random(),
            user_agent: user_agent.to_string(),
            start_height: i32::try_from(start_height).unwrap_or(i32::MAX),
            relay: None,
        }
    }
}

impl Encodable for VersionMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        write_u32_le(out, self.version);
        write_u64_le(out, self.services);
        write_u64_le(out, self.timestamp);
        self.receiver.encode_with(out, false);
        self.sender.encode_with(out, false);
        write_u64_le(out, self.nonce);
        write_var_bytes(out, self.user_agent.as_bytes());
        out.extend_from_slice(&self.start_height.to_le_bytes());
        if let Some(relay) = self.relay {
            out.push(relay as u8);
        }
    }

    fn message_size(&self) -> usize {
        4 + 8
            + 8
            + 2 * PeerAddress::SIZE_WITHOUT_TIME
            + 8
            + varint_size(self.user_agent.len() as u64)
            + self.user_agent.len()
            + 4
            + self.relay.map_or(0, |_| 1)
    }
}

impl Decodable for VersionMessage {
    fn decode(buf: &[u8], offset: usize, known_length: Option<usize>) -> Result<(Self, usize)> {
        let end = known_length.map_or(buf.len(), |len| offset + len);
        let mut reader = ByteReader::new(&buf[..end.min(buf.len())], offset);

        let version = reader.read_u32_le()?;
        let services = reader.read_u64_le()?;
        let timestamp = reader.read_u64_le()?;
        let receiver = PeerAddress::read(&mut reader, false)?;
        let sender = PeerAddress::read(&mut reader, false)?;
        let nonce = reader.read_u64_le()?;
        let user_agent = String::from_utf8_lossy(&reader.read_var_bytes()?).into_owned();
        let start_height = reader.read_u32_le()? as i32;
        let relay = if reader.remaining() > 0 {
            Some(reader.read_u8()? != 0)
        } else {
            None
        };

        let message = Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        };
        Ok((message, reader.position() - offset))
    }
}

/// Payload of `getblocks`: a block locator and the hash to stop at
/// (zero for "as many as you will send")
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMessage {
    pub version: u32,
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

impl GetBlocksMessage {
    pub fn new(locator: Vec<Hash256>, stop: Hash256) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            locator,
            stop,
        }
    }
}

impl Encodable for GetBlocksMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        write_u32_le(out, self.version);
        write_varint(out, self.locator.len() as u64);
        for hash in &self.locator {
            out.extend_from_slice(hash.as_bytes());
        }
        out.extend_from_slice(self.stop.as_bytes());
    }

    fn message_size(&self) -> usize {
        4 + varint_size(self.locator.len() as u64) + 32 * self.locator.len() + 32
    }
}

impl Decodable for GetBlocksMessage {
    fn decode(buf: &[u8], offset: usize, _known_length: Option<usize>) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf, offset);
        let version = reader.read_u32_le()?;
        let count = reader.read_count(32)?;
        let mut locator = Vec::with_capacity(count);
        for _ in 0..count {
            locator.push(reader.read_hash()?);
        }
        let stop = reader.read_hash()?;
        Ok((Self { version, locator, stop }, reader.position() - offset))
    }
}

/// How payloads are turned into messages
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Keep block and transaction bodies as raw bytes until first accessed
    pub parse_lazy: bool,
    /// Version the remote peer speaks, which decides the `addr` layout
    pub protocol_version: u32,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            parse_lazy: false,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Network message
#[derive(Debug, Clone)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    /// Nonce is only present from peers speaking BIP31
    Ping(Option<u64>),
    Pong(u64),
    Address(AddressMessage),
    Inventory(InventoryMessage),
    GetData(InventoryMessage),
    GetBlocks(GetBlocksMessage),
    Block(Block),
    Transaction(Transaction),
    /// A command we don't understand, kept so it can be logged
    Unknown { command: String, payload: Vec<u8> },
}

impl Message {
    pub fn message_type(&self) -> Option<MessageType> {
        Some(match self {
            Message::Version(_) => MessageType::Version,
            Message::Verack => MessageType::Verack,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::Address(_) => MessageType::Addr,
            Message::Inventory(_) => MessageType::Inv,
            Message::GetData(_) => MessageType::GetData,
            Message::GetBlocks(_) => MessageType::GetBlocks,
            Message::Block(_) => MessageType::Block,
            Message::Transaction(_) => MessageType::Tx,
            Message::Unknown { .. } => return None,
        })
    }

    pub fn command(&self) -> &str {
        match self {
            Message::Unknown { command, .. } => command,
            other => other.message_type().map_or("", |t| t.as_str()),
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            Message::Version(version) => version.serialize(),
            Message::Verack => Vec::new(),
            Message::Ping(None) => Vec::new(),
            Message::Ping(Some(nonce)) | Message::Pong(nonce) => nonce.to_le_bytes().to_vec(),
            Message::Address(addr) => addr.serialize(),
            Message::Inventory(inv) | Message::GetData(inv) => inv.serialize(),
            Message::GetBlocks(getblocks) => getblocks.serialize(),
            Message::Block(block) => block.serialize(),
            Message::Transaction(tx) => tx.serialize(),
            Message::Unknown { payload, .. } => payload.clone(),
        }
    }

    /// Full frame: magic, command, length, checksum, payload
    pub fn to_frame(&self, magic: [u8; 4]) -> Vec<u8> {
        let payload = self.payload();
        let header = MessageHeader::new(self.command(), &payload);

        let mut frame = Vec::with_capacity(MessageHeader::SIZE + payload.len());
        header.encode(magic, &mut frame);
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decode a complete frame held in memory
    pub fn from_frame(frame: &[u8], magic: [u8; 4], options: &DecodeOptions) -> Result<Self> {
        let header = MessageHeader::decode(frame, magic)?;
        let end = MessageHeader::SIZE + header.length as usize;
        if frame.len() < end {
            return Err(Error::malformed(format!(
                "frame holds {} payload bytes, header says {}",
                frame.len() - MessageHeader::SIZE,
                header.length
            )));
        }
        let payload = &frame[MessageHeader::SIZE..end];
        header.verify(payload)?;
        Self::decode_payload(&header.command, payload, options)
    }

    /// Decode a payload whose frame has already been checked
    pub fn decode_payload(command: &str, payload: &[u8], options: &DecodeOptions) -> Result<Self> {
        let Some(message_type) = MessageType::from_command(command) else {
            return Ok(Message::Unknown {
                command: command.to_string(),
                payload: payload.to_vec(),
            });
        };

        let length = Some(payload.len());
        let message = match message_type {
            MessageType::Version => Message::Version(VersionMessage::decode(payload, 0, length)?.0),
            MessageType::Verack => Message::Verack,
            MessageType::Ping => {
                if payload.len() >= 8 {
                    Message::Ping(Some(ByteReader::new(payload, 0).read_u64_le()?))
                } else {
                    Message::Ping(None)
                }
            }
            MessageType::Pong => Message::Pong(ByteReader::new(payload, 0).read_u64_le()?),
            MessageType::Addr => {
                let (addr, _) = AddressMessage::decode_versioned(payload, 0, options.protocol_version)?;
                Message::Address(addr)
            }
            MessageType::Inv => Message::Inventory(InventoryMessage::decode(payload, 0, length)?.0),
            MessageType::GetData => Message::GetData(InventoryMessage::decode(payload, 0, length)?.0),
            MessageType::GetBlocks => Message::GetBlocks(GetBlocksMessage::decode(payload, 0, length)?.0),
            MessageType::Block => {
                let (block, _) = Block::decode(payload, 0, length)?;
                if !options.parse_lazy {
                    for tx in block.transactions()? {
                        tx.ensure_parsed()?;
                    }
                }
                Message::Block(block)
            }
            MessageType::Tx => {
                let (tx, _) = if options.parse_lazy {
                    Transaction::decode_lazy(payload, 0, length)?
                } else {
                    Transaction::decode(payload, 0, length)?
                };
                Message::Transaction(tx)
            }
        };
        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::Inventory(inv) | Message::GetData(inv) => {
                write!(f, "{} ({} items)", self.command(), inv.items.len())
            }
            Message::Address(addr) => write!(f, "addr ({} addresses)", addr.addresses.len()),
            Message::Block(block) => write!(f, "block {}", block.hash()),
            Message::Transaction(tx) => write!(f, "tx {}", tx.hash()),
            Message::GetBlocks(getblocks) => write!(f, "getblocks -> {}", getblocks.stop),
            other => write!(f, "{}", other.command()),
        }
    }
}

/// The fixed 24 bytes in front of every payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub const SIZE: usize = 4 + COMMAND_LEN + 4 + 4;

    pub fn new(command: &str, payload: &[u8]) -> Self {
        Self {
            command: command.to_string(),
            length: payload.len() as u32,
            checksum: checksum(payload),
        }
    }

    pub fn encode(&self, magic: [u8; 4], out: &mut Vec<u8>) {
        out.extend_from_slice(&magic);
        let mut command = [0u8; COMMAND_LEN];
        let bytes = self.command.as_bytes();
        let len = bytes.len().min(COMMAND_LEN);
        command[..len].copy_from_slice(&bytes[..len]);
        out.extend_from_slice(&command);
        write_u32_le(out, self.length);
        out.extend_from_slice(&self.checksum);
    }

    /// Parse the header at the start of `buf`, checking magic and size limit
    pub fn decode(buf: &[u8], magic: [u8; 4]) -> Result<Self> {
        let mut reader = ByteReader::new(buf, 0);
        let found = reader.read_slice(4)?;
        if found != magic {
            return Err(Error::malformed(format!(
                "bad magic {}, expected {}",
                hex::encode(found),
                hex::encode(magic)
            )));
        }

        let raw_command = reader.read_slice(COMMAND_LEN)?;
        let end = raw_command.iter().position(|&b| b == 0).unwrap_or(COMMAND_LEN);
        if raw_command[end..].iter().any(|&b| b != 0) {
            return Err(Error::malformed("command has bytes after its NUL padding"));
        }
        let command = std::str::from_utf8(&raw_command[..end])
            .map_err(|e| Error::malformed(format!("command is not ASCII: {}", e)))?
            .to_string();

        let length = reader.read_u32_le()?;
        if length as usize > MAX_MESSAGE_SIZE {
            return Err(Error::ProtocolViolation(format!(
                "{} message of {} bytes exceeds the {} byte limit",
                command, length, MAX_MESSAGE_SIZE
            )));
        }

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(reader.read_slice(4)?);

        Ok(Self {
            command,
            length,
            checksum,
        })
    }

    pub fn verify(&self, payload: &[u8]) -> Result<()> {
        let actual = checksum(payload);
        if actual != self.checksum {
            return Err(Error::malformed(format!(
                "{} checksum {} does not match payload {}",
                self.command,
                hex::encode(self.checksum),
                hex::encode(actual)
            )));
        }
        Ok(())
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_hash(payload);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&hash.as_bytes()[..4]);
    checksum
}
