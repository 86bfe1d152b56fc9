// Peer network addresses as carried in version and addr messages

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::params::ADDRESS_TIME_VERSION;
use crate::core::serialize::{varint_size, write_u32_le, write_u64_le, write_varint, ByteReader, Encodable};
use crate::core::{Decodable, PROTOCOL_VERSION};
use crate::error::{Error, Result};

/// Most addresses a single `addr` message may carry
pub const MAX_ADDRESSES: usize = 1024;

/// A node address: service bits, IPv6 (IPv4 is v4-mapped) and port.
///
/// `time` is only on the wire inside `addr` messages from peers newer than
/// protocol 31402. Version messages never carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    pub time: Option<u32>,
    pub services: u64,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl PeerAddress {
    /// Encoded size with the timestamp
    pub const MESSAGE_SIZE: usize = 30;
    /// Encoded size without the timestamp
    pub const SIZE_WITHOUT_TIME: usize = 26;

    pub fn new(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            time: None,
            services,
            ip,
            port: addr.port(),
        }
    }

    /// Address 0.0.0.0:0 with no services, sent when we don't know our own
    pub fn unspecified() -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], 0)), 0)
    }

    /// Stamp with the current time, for use in an `addr` message
    pub fn with_current_time(mut self) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        self.time = Some(now);
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let ip = match self.ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.ip),
        };
        SocketAddr::new(ip, self.port)
    }

    pub fn encoded_size(with_time: bool) -> usize {
        if with_time {
            Self::MESSAGE_SIZE
        } else {
            Self::SIZE_WITHOUT_TIME
        }
    }

    /// Write the address. A missing timestamp is written as zero when
    /// `with_time` is set.
    pub fn encode_with(&self, out: &mut Vec<u8>, with_time: bool) {
        if with_time {
            write_u32_le(out, self.time.unwrap_or(0));
        }
        write_u64_le(out, self.services);
        out.extend_from_slice(&self.ip.octets());
        // port is the one big-endian field in the protocol
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    pub fn read(reader: &mut ByteReader, with_time: bool) -> Result<Self> {
        let time = if with_time {
            Some(reader.read_u32_le()?)
        } else {
            None
        };
        let services = reader.read_u64_le()?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(reader.read_slice(16)?);
        let port = reader.read_u16_be()?;
        Ok(Self {
            time,
            services,
            ip: Ipv6Addr::from(octets),
            port,
        })
    }
}

/// Payload of an `addr` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMessage {
    pub addresses: Vec<PeerAddress>,
    /// Protocol version the list is encoded for; decides whether entries carry time
    pub protocol_version: u32,
}

impl AddressMessage {
    pub fn new(addresses: Vec<PeerAddress>) -> Self {
        Self {
            addresses,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    fn with_time(&self) -> bool {
        self.protocol_version > ADDRESS_TIME_VERSION
    }

    /// Decode an address list sent by a peer speaking `protocol_version`
    pub fn decode_versioned(buf: &[u8], offset: usize, protocol_version: u32) -> Result<(Self, usize)> {
        let with_time = protocol_version > ADDRESS_TIME_VERSION;
        let mut reader = ByteReader::new(buf, offset);

        let count = reader.read_varint()?;
        if count > MAX_ADDRESSES as u64 {
            return Err(Error::ProtocolViolation(format!(
                "address message with {} entries, limit is {}",
                count, MAX_ADDRESSES
            )));
        }

        let mut addresses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            addresses.push(PeerAddress::read(&mut reader, with_time)?);
        }

        let message = Self {
            addresses,
            protocol_version,
        };
        Ok((message, reader.position() - offset))
    }
}

impl Encodable for AddressMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        let with_time = self.with_time();
        write_varint(out, self.addresses.len() as u64);
        for address in &self.addresses {
            address.encode_with(out, with_time);
        }
    }

    fn message_size(&self) -> usize {
        varint_size(self.addresses.len() as u64)
            + self.addresses.len() * PeerAddress::encoded_size(self.with_time())
    }
}

impl Decodable for AddressMessage {
    fn decode(buf: &[u8], offset: usize, _known_length: Option<usize>) -> Result<(Self, usize)> {
        Self::decode_versioned(buf, offset, PROTOCOL_VERSION)
    }
}
