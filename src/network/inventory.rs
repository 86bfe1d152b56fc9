// Inventory vectors: what a peer has (inv) and what we want (getdata)

use std::fmt;

use crate::core::serialize::{varint_size, write_u32_le, write_varint, ByteReader, Encodable};
use crate::core::{Decodable, Hash256};
use crate::error::{Error, Result};

/// Most items a single `inv` or `getdata` message may carry
pub const MAX_INVENTORY_ITEMS: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryKind {
    Error = 0,
    Transaction = 1,
    Block = 2,
}

impl InventoryKind {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(InventoryKind::Error),
            1 => Ok(InventoryKind::Transaction),
            2 => Ok(InventoryKind::Block),
            other => Err(Error::ProtocolViolation(format!("unknown inventory type {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryItem {
    pub kind: InventoryKind,
    pub hash: Hash256,
}

impl InventoryItem {
    pub const SIZE: usize = 36;

    pub fn new(kind: InventoryKind, hash: Hash256) -> Self {
        Self { kind, hash }
    }

    pub fn block(hash: Hash256) -> Self {
        Self::new(InventoryKind::Block, hash)
    }

    pub fn transaction(hash: Hash256) -> Self {
        Self::new(InventoryKind::Transaction, hash)
    }
}

impl fmt::Display for InventoryItem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.hash)
    }
}

/// Payload shared by `inv` and `getdata`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryMessage {
    pub items: Vec<InventoryItem>,
}

impl InventoryMessage {
    pub fn new(items: Vec<InventoryItem>) -> Self {
        Self { items }
    }

    pub fn add_item(&mut self, item: InventoryItem) {
        self.items.push(item);
    }

    /// Block hashes in the order they were listed
    pub fn block_hashes(&self) -> impl Iterator<Item = Hash256> + '_ {
        self.items
            .iter()
            .filter(|item| item.kind == InventoryKind::Block)
            .map(|item| item.hash)
    }
}

impl Encodable for InventoryMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(out, self.items.len() as u64);
        for item in &self.items {
            write_u32_le(out, item.kind as u32);
            out.extend_from_slice(item.hash.as_bytes());
        }
    }

    fn message_size(&self) -> usize {
        varint_size(self.items.len() as u64) + self.items.len() * InventoryItem::SIZE
    }
}

impl Decodable for InventoryMessage {
    fn decode(buf: &[u8], offset: usize, _known_length: Option<usize>) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf, offset);

        let count = reader.read_varint()?;
        if count > MAX_INVENTORY_ITEMS as u64 {
            return Err(Error::ProtocolViolation(format!(
                "inventory with {} items, limit is {}",
                count, MAX_INVENTORY_ITEMS
            )));
        }

        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let kind = InventoryKind::from_u32(reader.read_u32_le()?)?;
            let hash = reader.read_hash()?;
            items.push(InventoryItem { kind, hash });
        }

        Ok((Self { items }, reader.position() - offset))
    }
}
