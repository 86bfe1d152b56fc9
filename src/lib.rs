// Minimal Bitcoin peer client: wire codec, transactions, a header chain,
// a wallet and a single-peer session that downloads blocks.

pub mod consensus;
pub mod core;
pub mod error;
pub mod logging;
pub mod network;
pub mod storage;
pub mod wallet;

#[cfg(test)]
pub(crate) mod test_util;

// Re-exports for convenience
pub use core::{Block, BlockHeader, Hash256, NetworkParams, OutPoint, Transaction, TxInput, TxOutput};
pub use error::{Error, Result};
pub use network::{Message, Peer, PeerConfig, PeerEventListener, PendingBlock, TcpTransport, Transport};
pub use storage::{BlockChain, BlockStore, MemoryBlockStore, StoredBlock};
pub use wallet::{Address, KeyPair, Wallet};
