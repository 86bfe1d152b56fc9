// Block chain: connects downloaded blocks to the store and tracks orphans

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};

use crate::consensus::BlockValidator;
use crate::core::{Block, Hash256, NetworkParams};
use crate::error::{Error, Result};
use crate::storage::{BlockStore, StoredBlock};
use crate::wallet::Wallet;

/// Blocks held while their parent is unknown. The oldest is dropped first.
pub const MAX_UNCONNECTED_BLOCKS: usize = 100;

/// Orphan blocks indexed by the parent they wait for
#[derive(Default)]
struct UnconnectedBlocks {
    blocks: HashMap<Hash256, Block>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    // arrival order, oldest first
    order: VecDeque<Hash256>,
}

impl UnconnectedBlocks {
    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn newest(&self) -> Option<Hash256> {
        self.order.back().copied()
    }

    fn insert(&mut self, block: Block) {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return;
        }
        if self.blocks.len() >= MAX_UNCONNECTED_BLOCKS {
            if let Some(oldest) = self.order.front().copied() {
                debug!("Dropping held block {}", oldest);
                self.remove(&oldest);
            }
        }
        self.by_prev.entry(block.prev_block_hash()).or_default().push(hash);
        self.order.push_back(hash);
        self.blocks.insert(hash, block);
    }

    fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        let block = self.blocks.remove(hash)?;
        self.order.retain(|held| held != hash);
        let prev = block.prev_block_hash();
        if let Some(siblings) = self.by_prev.get_mut(&prev) {
            siblings.retain(|held| held != hash);
            if siblings.is_empty() {
                self.by_prev.remove(&prev);
            }
        }
        Some(block)
    }

    /// Remove and return every held block whose parent is `parent`
    fn take_children(&mut self, parent: &Hash256) -> Vec<Block> {
        let children = self.by_prev.remove(parent).unwrap_or_default();
        children
            .iter()
            .filter_map(|hash| {
                self.order.retain(|held| held != hash);
                self.blocks.remove(hash)
            })
            .collect()
    }
}

/// Keeps the best chain in a [`BlockStore`] and feeds relevant
/// transactions to an optional wallet.
///
/// Blocks whose parent is unknown are held as unconnected until the parent
/// arrives, up to [`MAX_UNCONNECTED_BLOCKS`]. Reading the head and then extending it are separate store
/// calls, so a concurrent `add` can move the head in between; the later
/// writer wins.
pub struct BlockChain {
    params: NetworkParams,
    store: Arc<dyn BlockStore>,
    validator: BlockValidator,
    genesis_hash: Hash256,
    wallet: Option<Arc<Mutex<Wallet>>>,
    unconnected: Mutex<UnconnectedBlocks>,
}

impl BlockChain {
    pub fn new(params: NetworkParams, store: Arc<dyn BlockStore>) -> Self {
        let validator = BlockValidator::new(&params);
        let genesis_hash = params.genesis_hash();
        Self {
            params,
            store,
            validator,
            genesis_hash,
            wallet: None,
            unconnected: Mutex::new(UnconnectedBlocks::default()),
        }
    }

    pub fn with_wallet(params: NetworkParams, store: Arc<dyn BlockStore>, wallet: Arc<Mutex<Wallet>>) -> Self {
        Self {
            wallet: Some(wallet),
            ..Self::new(params, store)
        }
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn chain_head(&self) -> Result<StoredBlock> {
        self.store.chain_head()
    }

    pub fn best_height(&self) -> Result<u32> {
        Ok(self.store.chain_head()?.height)
    }

    /// Add a block. Returns `true` when the block is (or already was)
    /// connected to the chain and `false` when its parent is unknown, in
    /// which case the block is kept until the parent shows up.
    pub fn add(&self, block: Block) -> Result<bool> {
        let hash = block.hash();
        if self.store.get(&hash)?.is_some() {
            debug!("Already have block {}", hash);
            return Ok(true);
        }

        self.validator.validate_block(&block)?;

        let Some(prev) = self.store.get(&block.prev_block_hash())? else {
            info!("Block {} does not connect to the chain, holding it", hash);
            self.lock_unconnected()?.insert(block);
            return Ok(false);
        };

        self.connect(&prev, &block)?;
        self.connect_unconnected(hash)?;
        Ok(true)
    }

    /// The most recently held block whose parent is still unknown
    pub fn unconnected_block(&self) -> Option<Hash256> {
        self.unconnected
            .lock()
            .ok()
            .and_then(|unconnected| unconnected.newest())
    }

    pub fn unconnected_count(&self) -> usize {
        self.unconnected.lock().map(|unconnected| unconnected.len()).unwrap_or(0)
    }

    fn lock_unconnected(&self) -> Result<MutexGuard<'_, UnconnectedBlocks>> {
        self.unconnected
            .lock()
            .map_err(|_| Error::BlockStore("unconnected block list lock poisoned".to_string()))
    }

    fn connect(&self, prev: &StoredBlock, block: &Block) -> Result<()> {
        let stored = prev.build(block.header.clone());
        self.store.put(stored.clone())?;

        let head = self.store.chain_head()?;
        let best_chain = stored.more_work_than(&head);
        if best_chain {
            self.store.set_chain_head(stored.clone())?;
            info!("New chain head {} at height {}", stored.hash(), stored.height);
        } else {
            debug!("Block {} at height {} is on a side chain", stored.hash(), stored.height);
        }

        if let Some(wallet) = &self.wallet {
            let mut wallet = wallet
                .lock()
                .map_err(|_| Error::WalletFile("wallet lock poisoned".to_string()))?;
            for tx in block.transactions()? {
                if wallet.is_transaction_relevant(tx)? {
                    wallet.receive_from_block(tx.clone(), &stored, best_chain)?;
                }
            }
        }
        Ok(())
    }

    /// Connect held blocks descending from `parent`, which was just stored
    fn connect_unconnected(&self, parent: Hash256) -> Result<()> {
        let mut parents = vec![parent];
        while let Some(parent) = parents.pop() {
            let children = self.lock_unconnected()?.take_children(&parent);
            if children.is_empty() {
                continue;
            }
            let Some(prev) = self.store.get(&parent)? else {
                continue;
            };
            for block in children {
                debug!("Connecting previously held block {}", block.hash());
                self.connect(&prev, &block)?;
                parents.push(block.hash());
            }
        }
        Ok(())
    }
}
