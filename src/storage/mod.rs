// Storage layer: block headers and the chain built on them

mod block_store;
mod chain;

pub use block_store::{BlockStore, MemoryBlockStore, StoredBlock};
pub use chain::{BlockChain, MAX_UNCONNECTED_BLOCKS};
