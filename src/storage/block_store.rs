// Block header storage: the BlockStore trait and an in-memory implementation

use std::collections::HashMap;
use std::sync::Mutex;

use crate::consensus::Target;
use crate::core::{BlockHeader, Hash256, NetworkParams};
use crate::error::{Error, Result};

/// A block header placed in the chain: how much work the chain up to and
/// including it represents, and how high it sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub header: BlockHeader,
    /// Cumulative work of the chain ending at this block
    pub chain_work: u128,
    pub height: u32,
}

impl StoredBlock {
    pub fn new(header: BlockHeader, chain_work: u128, height: u32) -> Self {
        Self { header, chain_work, height }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Whether this chain has more cumulative work than `other`
    pub fn more_work_than(&self, other: &StoredBlock) -> bool {
        self.chain_work > other.chain_work
    }

    /// The stored form of `header` when it extends this block
    pub fn build(&self, header: BlockHeader) -> StoredBlock {
        let work = Target::from_bits(header.bits).work();
        StoredBlock {
            chain_work: self.chain_work.saturating_add(work),
            height: self.height + 1,
            header,
        }
    }
}

/// Map from block hash to stored header, plus the current chain head.
/// Each call is atomic on its own; callers that read then write may race.
pub trait BlockStore: Send + Sync {
    fn put(&self, block: StoredBlock) -> Result<()>;

    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>>;

    fn chain_head(&self) -> Result<StoredBlock>;

    /// Move the head. [`MemoryBlockStore`] refuses a head that was never
    /// `put`, so the head is always retrievable by hash.
    fn set_chain_head(&self, head: StoredBlock) -> Result<()>;
}

struct Inner {
    blocks: HashMap<Hash256, StoredBlock>,
    head: StoredBlock,
}

/// Keeps every header in memory. Suitable for tests and short sessions.
pub struct MemoryBlockStore {
    inner: Mutex<Inner>,
}

impl MemoryBlockStore {
    /// A store holding only the genesis header, which is the chain head
    pub fn new(params: &NetworkParams) -> Self {
        let header = params.genesis_block().header;
        let work = Target::from_bits(header.bits).work();
        let genesis = StoredBlock::new(header, work, 0);

        let mut blocks = HashMap::new();
        blocks.insert(genesis.hash(), genesis.clone());

        Self {
            inner: Mutex::new(Inner { blocks, head: genesis }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::BlockStore("block store lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.blocks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemoryBlockStore {
    fn put(&self, block: StoredBlock) -> Result<()> {
        let mut inner = self.lock()?;
        inner.blocks.insert(block.hash(), block);
        Ok(())
    }

    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>> {
        Ok(self.lock()?.blocks.get(hash).cloned())
    }

    fn chain_head(&self) -> Result<StoredBlock> {
        Ok(self.lock()?.head.clone())
    }

    fn set_chain_head(&self, head: StoredBlock) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.blocks.contains_key(&head.hash()) {
            return Err(Error::BlockStore(format!("chain head {} was never stored", head.hash())));
        }
        inner.head = head;
        Ok(())
    }
}
