// Block data structures

use std::sync::{Arc, OnceLock};

use crate::core::params::NetworkParams;
use crate::core::script::Script;
use crate::core::serialize::{
    decode_varint, read_bytes, varint_size, write_u32_le, write_varint, ByteReader, Decodable, Encodable,
};
use crate::core::{double_hash, Hash256, ParseState, Transaction, TxOutput};
use crate::error::{Error, Result};

/// Coinbase script of the genesis block: difficulty bits, then the headline
const GENESIS_COINBASE_SCRIPT: &str = "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73";

/// Public key the genesis coinbase pays to
const GENESIS_OUTPUT_PUBKEY: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

/// Block header - 80 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block version
    pub version: u32,
    /// Hash of the previous block
    pub prev_block_hash: Hash256,
    /// Merkle root of all transactions in the block
    pub merkle_root: Hash256,
    /// Block timestamp (Unix epoch)
    pub timestamp: u32,
    /// Difficulty target (compact format)
    pub bits: u32,
    /// Nonce for proof-of-work
    pub nonce: u32,
}

impl BlockHeader {
    pub const SIZE: usize = 80;

    pub fn new(
        version: u32,
        prev_block_hash: Hash256,
        merkle_root: Hash256,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            version,
            prev_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        }
    }

    /// Calculate the hash of this block header
    pub fn hash(&self) -> Hash256 {
        double_hash(&self.serialize())
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        write_u32_le(out, self.version);
        out.extend_from_slice(self.prev_block_hash.as_bytes());
        out.extend_from_slice(self.merkle_root.as_bytes());
        write_u32_le(out, self.timestamp);
        write_u32_le(out, self.bits);
        write_u32_le(out, self.nonce);
    }

    fn message_size(&self) -> usize {
        Self::SIZE
    }
}

impl Decodable for BlockHeader {
    fn decode(buf: &[u8], offset: usize, _known_length: Option<usize>) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf, offset);
        let header = Self {
            version: reader.read_u32_le()?,
            prev_block_hash: reader.read_hash()?,
            merkle_root: reader.read_hash()?,
            timestamp: reader.read_u32_le()?,
            bits: reader.read_u32_le()?,
            nonce: reader.read_u32_le()?,
        };
        Ok((header, Self::SIZE))
    }
}

/// Block - header plus transactions.
///
/// A block decoded with a known length keeps its transaction region as raw
/// bytes until the transactions are first asked for.
#[derive(Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,
    /// Transaction count and transactions, exactly as received
    tx_bytes: Option<Arc<[u8]>>,
    transactions: OnceLock<Vec<Transaction>>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            tx_bytes: None,
            transactions: OnceLock::from(transactions),
        }
    }

    /// The first block of the chain described by `params`
    pub fn genesis(params: &NetworkParams) -> Self {
        // both constants are valid hex
        let script_sig = hex::decode(GENESIS_COINBASE_SCRIPT).unwrap_or_default();
        let pubkey = hex::decode(GENESIS_OUTPUT_PUBKEY).unwrap_or_default();

        let coinbase = Transaction::coinbase(
            script_sig,
            TxOutput::new(50 * 100_000_000, Script::p2pk_script_pubkey(&pubkey)),
        );
        let merkle_root = Self::calculate_merkle_root(std::slice::from_ref(&coinbase));

        let header = BlockHeader::new(
            1,
            Hash256::zero(),
            merkle_root,
            params.genesis_time,
            params.genesis_bits,
            params.genesis_nonce,
        );
        Self::new(header, vec![coinbase])
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn prev_block_hash(&self) -> Hash256 {
        self.header.prev_block_hash
    }

    /// Parse state of the transaction region
    pub fn transactions_state(&self) -> ParseState {
        match self.transactions.get() {
            None => ParseState::Unparsed,
            Some(txs) if txs.iter().all(|tx| tx.parse_state() == ParseState::Parsed) => ParseState::Parsed,
            Some(_) => ParseState::LengthKnown,
        }
    }

    /// The block's transactions, materialized from the retained bytes on first call
    pub fn transactions(&self) -> Result<&[Transaction]> {
        if let Some(txs) = self.transactions.get() {
            return Ok(txs);
        }
        let region = self
            .tx_bytes
            .as_deref()
            .ok_or_else(|| Error::malformed("block has neither transactions nor bytes"))?;

        let (txs, used) = Self::scan_transactions(region, 0)?;
        if used != region.len() {
            return Err(Error::malformed(format!(
                "block transactions use {} of {} bytes",
                used,
                region.len()
            )));
        }
        Ok(self.transactions.get_or_init(|| txs))
    }

    /// Decode the transaction count and locate each transaction with
    /// `calc_length`, leaving their fields unparsed.
    fn scan_transactions(buf: &[u8], offset: usize) -> Result<(Vec<Transaction>, usize)> {
        let (count, mut pos) = decode_varint(buf, offset)?;
        pos += offset;

        // every transaction is at least 10 bytes
        if count > (buf.len().saturating_sub(pos) / 10) as u64 {
            return Err(Error::malformed(format!("block claims {} transactions", count)));
        }

        let mut txs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (tx, size) = Transaction::decode_lazy(buf, pos, None)?;
            pos += size;
            txs.push(tx);
        }
        Ok((txs, pos - offset))
    }

    /// Calculate Merkle root from transactions
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash256 {
        if transactions.is_empty() {
            return Hash256::zero();
        }

        let mut hashes: Vec<Hash256> = transactions.iter().map(Transaction::hash).collect();

        while hashes.len() > 1 {
            let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));

            for chunk in hashes.chunks(2) {
                let left = chunk[0];
                let right = chunk.get(1).copied().unwrap_or(left);

                let mut combined = [0u8; 64];
                combined[..32].copy_from_slice(left.as_bytes());
                combined[32..].copy_from_slice(right.as_bytes());
                next_level.push(double_hash(&combined));
            }

            hashes = next_level;
        }

        hashes[0]
    }

    pub fn merkle_root(&self) -> Result<Hash256> {
        Ok(Self::calculate_merkle_root(self.transactions()?))
    }

    pub fn is_genesis(&self) -> bool {
        self.header.prev_block_hash.is_zero()
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.serialize() == other.serialize()
    }
}

impl Eq for Block {}

impl Encodable for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        match (self.transactions.get(), &self.tx_bytes) {
            (Some(txs), _) => {
                write_varint(out, txs.len() as u64);
                for tx in txs {
                    tx.encode(out);
                }
            }
            (None, Some(raw)) => out.extend_from_slice(raw),
            (None, None) => write_varint(out, 0),
        }
    }

    fn message_size(&self) -> usize {
        BlockHeader::SIZE
            + match (self.transactions.get(), &self.tx_bytes) {
                (Some(txs), _) => {
                    varint_size(txs.len() as u64) + txs.iter().map(Encodable::message_size).sum::<usize>()
                }
                (None, Some(raw)) => raw.len(),
                (None, None) => 1,
            }
    }
}

impl Decodable for Block {
    /// With `known_length` the transaction region is kept unparsed. Without
    /// it every transaction is located so the exact span is known.
    fn decode(buf: &[u8], offset: usize, known_length: Option<usize>) -> Result<(Self, usize)> {
        let (header, _) = BlockHeader::decode(buf, offset, None)?;
        let tx_offset = offset + BlockHeader::SIZE;

        match known_length {
            Some(length) => {
                let region_len = length.checked_sub(BlockHeader::SIZE).ok_or_else(|| {
                    Error::malformed(format!("block of {} bytes is shorter than its header", length))
                })?;
                let region = read_bytes(buf, tx_offset, region_len)?;
                let block = Self {
                    header,
                    tx_bytes: Some(Arc::from(region)),
                    transactions: OnceLock::new(),
                };
                Ok((block, length))
            }
            None => {
                let (txs, used) = Self::scan_transactions(buf, tx_offset)?;
                Ok((Self::new(header, txs), BlockHeader::SIZE + used))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TxInput, OutPoint};

    fn two_tx_block() -> Block {
        let coinbase = Transaction::coinbase(vec![1, 2, 3], TxOutput::new(5000000000, vec![0x51]));
        let mut spend = Transaction::new();
        spend
            .add_input(TxInput::new(OutPoint::new(coinbase.hash(), 0), vec![0x01, 0x02]))
            .unwrap();
        spend.add_output(1000, vec![0x51]).unwrap();

        let txs = vec![coinbase, spend];
        let header = BlockHeader::new(
            1,
            Hash256::new([4; 32]),
            Block::calculate_merkle_root(&txs),
            1234567890,
            0x207fffff,
            0,
        );
        Block::new(header, txs)
    }

    #[test]
    fn test_block_header_serialization() {
        let header = BlockHeader::new(1, Hash256::zero(), Hash256::zero(), 1234567890, 0x1d00ffff, 0);

        let serialized = header.serialize();
        assert_eq!(serialized.len(), 80);

        let deserialized = BlockHeader::deserialize(&serialized).unwrap();
        assert_eq!(header, deserialized);
        assert_eq!(header.hash(), double_hash(&serialized));
    }

    #[test]
    fn test_mainnet_genesis_block() {
        let genesis = Block::genesis(&NetworkParams::main());
        assert!(genesis.is_genesis());
        assert_eq!(
            genesis.header.merkle_root.to_hex(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert_eq!(
            genesis.hash().to_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(genesis.message_size(), 285);
    }

    #[test]
    fn test_lazy_block_with_known_length() {
        let block = two_tx_block();
        let bytes = block.serialize();

        let (lazy, used) = Block::decode(&bytes, 0, Some(bytes.len())).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(lazy.transactions_state(), ParseState::Unparsed);
        assert_eq!(lazy.hash(), block.hash());
        assert_eq!(lazy.serialize(), bytes);

        assert_eq!(lazy.transactions().unwrap().len(), 2);
        assert_eq!(lazy.transactions_state(), ParseState::LengthKnown);
        assert_eq!(lazy.merkle_root().unwrap(), block.header.merkle_root);
        assert_eq!(lazy.transactions_state(), ParseState::LengthKnown);

        for tx in lazy.transactions().unwrap() {
            tx.ensure_parsed().unwrap();
        }
        assert_eq!(lazy.transactions_state(), ParseState::Parsed);
    }

    #[test]
    fn test_block_embedded_without_length() {
        let block = two_tx_block();
        let mut buf = vec![0xaa; 7];
        block.encode(&mut buf);
        buf.extend_from_slice(&[0xbb; 3]);

        let (decoded, used) = Block::decode(&buf, 7, None).unwrap();
        assert_eq!(used, block.message_size());
        assert_eq!(decoded, block);
        assert_eq!(decoded.transactions_state(), ParseState::LengthKnown);
    }

    #[test]
    fn test_truncated_block() {
        let bytes = two_tx_block().serialize();
        assert!(Block::decode(&bytes[..bytes.len() - 2], 0, None).is_err());
        assert!(Block::decode(&bytes[..40], 0, Some(40)).is_err());

        // header is fine, transactions fail on first access
        let (lazy, _) = Block::decode(&bytes[..bytes.len() - 2], 0, Some(bytes.len() - 2)).unwrap();
        assert!(matches!(lazy.transactions(), Err(Error::MalformedEncoding(_))));
    }

    #[test]
    fn test_merkle_root_single_tx() {
        let tx = Transaction::coinbase(vec![4, 5, 6], TxOutput::new(5000000000, vec![1, 2, 3]));
        let merkle = Block::calculate_merkle_root(std::slice::from_ref(&tx));
        assert_eq!(merkle, tx.hash());
    }

    #[test]
    fn test_merkle_root_odd_count_duplicates_last() {
        let txs: Vec<Transaction> = (0..3u8)
            .map(|i| Transaction::coinbase(vec![i], TxOutput::new(1000, vec![])))
            .collect();

        let pair = |a: Hash256, b: Hash256| {
            let mut combined = a.as_bytes().to_vec();
            combined.extend_from_slice(b.as_bytes());
            double_hash(&combined)
        };
        let left = pair(txs[0].hash(), txs[1].hash());
        let right = pair(txs[2].hash(), txs[2].hash());

        assert_eq!(Block::calculate_merkle_root(&txs), pair(left, right));
    }
}
