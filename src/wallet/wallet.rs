// Wallet: keys, transaction pools, balances and persistence

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::{
    format_btc, BlockHeader, Decodable, Encodable, Hash256, NetworkParams, OutPoint, Transaction, TxOutput,
};
use crate::error::{Error, Result};
use crate::storage::StoredBlock;
use crate::wallet::{Address, KeyPair, TransactionBuilder};

/// What signing and value accounting need to know about a wallet
pub trait WalletView {
    fn find_key_from_pub_hash(&self, pubkey_hash: &[u8; 20]) -> Option<&KeyPair>;

    /// The output an outpoint refers to, looked up in the unspent, spent
    /// and pending pools in that order
    fn connected_output(&self, outpoint: &OutPoint) -> Option<&TxOutput>;

    fn is_output_spent(&self, outpoint: &OutPoint) -> bool;

    fn balance(&self) -> u64;
}

/// A set of keys and the transactions that involve them.
///
/// Transactions live in one of three pools: `unspent` holds transactions
/// with at least one of our outputs still spendable, `spent` those whose
/// outputs are all used up, and `pending` our own sends not yet seen in a
/// block.
pub struct Wallet {
    params: NetworkParams,
    keys: Vec<KeyPair>,
    unspent: HashMap<Hash256, Transaction>,
    spent: HashMap<Hash256, Transaction>,
    pending: HashMap<Hash256, Transaction>,
    spent_outpoints: HashSet<OutPoint>,
}

impl Wallet {
    pub fn new(params: NetworkParams) -> Self {
        Self {
            params,
            keys: Vec::new(),
            unspent: HashMap::new(),
            spent: HashMap::new(),
            pending: HashMap::new(),
            spent_outpoints: HashSet::new(),
        }
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn add_key(&mut self, key: KeyPair) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    pub fn keys(&self) -> &[KeyPair] {
        &self.keys
    }

    pub fn unspent(&self) -> impl Iterator<Item = &Transaction> {
        self.unspent.values()
    }

    pub fn spent(&self) -> impl Iterator<Item = &Transaction> {
        self.spent.values()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Transaction> {
        self.pending.values()
    }

    fn find_transaction(&self, hash: &Hash256) -> Option<&Transaction> {
        self.unspent
            .get(hash)
            .or_else(|| self.spent.get(hash))
            .or_else(|| self.pending.get(hash))
    }

    /// Whether a transaction pays us, spends from us, or is one of our sends
    pub fn is_transaction_relevant(&self, tx: &Transaction) -> Result<bool> {
        Ok(self.pending.contains_key(&tx.hash())
            || tx.value_received_by(self, true)? > 0
            || tx.value_sent_by(self)? > 0)
    }

    /// Record a transaction found in `block`. Side-chain appearances are
    /// remembered on transactions we already know but do not change balances.
    pub fn receive_from_block(&mut self, tx: Transaction, block: &StoredBlock, best_chain: bool) -> Result<()> {
        let hash = tx.hash();

        for pool in [&mut self.unspent, &mut self.spent] {
            if let Some(known) = pool.get_mut(&hash) {
                known.add_block_appearance(block, best_chain);
                return Ok(());
            }
        }
        if !best_chain {
            if let Some(known) = self.pending.get_mut(&hash) {
                known.add_block_appearance(block, false);
            } else {
                debug!("Ignoring side chain transaction {}", hash);
            }
            return Ok(());
        }

        let mut tx = match self.pending.remove(&hash) {
            Some(ours) => {
                info!("Own transaction {} confirmed at height {}", hash, block.height);
                ours
            }
            None => {
                info!("Received transaction {} at height {}", hash, block.height);
                tx
            }
        };
        tx.add_block_appearance(block, true);

        self.mark_inputs_spent(&tx)?;
        self.file_by_spendability(tx)
    }

    /// Mark every wallet output `tx` spends as used and retire source
    /// transactions with nothing left to spend
    fn mark_inputs_spent(&mut self, tx: &Transaction) -> Result<()> {
        for input in tx.inputs()? {
            if self.connected_output(&input.outpoint).is_none() {
                continue;
            }
            self.spent_outpoints.insert(input.outpoint);

            let source_hash = input.outpoint.hash;
            let exhausted = match self.unspent.get(&source_hash) {
                Some(source) => source.value_received_by(&*self, false)? == 0,
                None => false,
            };
            if exhausted {
                if let Some(source) = self.unspent.remove(&source_hash) {
                    self.spent.insert(source_hash, source);
                }
            }
        }
        Ok(())
    }

    fn file_by_spendability(&mut self, tx: Transaction) -> Result<()> {
        let hash = tx.hash();
        if tx.value_received_by(&*self, false)? > 0 {
            self.unspent.insert(hash, tx);
        } else {
            self.spent.insert(hash, tx);
        }
        Ok(())
    }

    /// Spendable outputs, ordered by outpoint
    pub fn available_outputs(&self) -> Vec<(OutPoint, TxOutput)> {
        let mut outputs: Vec<(OutPoint, TxOutput)> = self
            .unspent
            .values()
            .flat_map(|tx| {
                let hash = tx.hash();
                tx.outputs()
                    .unwrap_or_default()
                    .iter()
                    .enumerate()
                    .map(move |(i, output)| (OutPoint::new(hash, i as u32), output))
            })
            .filter(|(outpoint, output)| output.is_mine(self) && !self.is_output_spent(outpoint))
            .map(|(outpoint, output)| (outpoint, output.clone()))
            .collect();
        outputs.sort_by_key(|(outpoint, _)| *outpoint);
        outputs
    }

    /// Value of the unspent outputs we can sign for
    pub fn balance(&self) -> u64 {
        self.available_outputs()
            .iter()
            .fold(0u64, |total, (_, output)| total.saturating_add(output.value))
    }

    /// Balance including change from our own sends that are not yet confirmed
    pub fn estimated_balance(&self) -> u64 {
        self.pending
            .values()
            .filter_map(|tx| tx.value_received_by(self, false).ok())
            .fold(self.balance(), u64::saturating_add)
    }

    /// Build and sign a transaction paying `amount` to `to`, with change back
    /// to our first key. The wallet is not changed until `commit_send`.
    pub fn create_send(&self, to: &Address, amount: u64, fee: u64) -> Result<Transaction> {
        TransactionBuilder::new(self).build(to, amount, fee)
    }

    /// Mark the outputs `tx` spends as used and hold it as pending
    pub fn commit_send(&mut self, mut tx: Transaction) -> Result<()> {
        let hash = tx.hash();
        info!("Committing send {} of {}", hash, format_btc(tx.total_output_value()?));

        self.mark_inputs_spent(&tx)?;
        if tx.update_time().is_none() {
            tx.set_update_time(unix_now());
        }
        self.pending.insert(hash, tx);
        Ok(())
    }

    /// Create and commit a send without broadcasting it
    pub fn send_coins_offline(&mut self, to: &Address, amount: u64, fee: u64) -> Result<Transaction> {
        let tx = self.create_send(to, amount, fee)?;
        self.commit_send(tx.clone())?;
        Ok(tx)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = WalletFile {
            network: self.params.name.to_string(),
            keys: self.keys.iter().map(|key| hex::encode(key.secret_bytes())).collect(),
            unspent: self.unspent.values().map(TxRecord::from_tx).collect(),
            spent: self.spent.values().map(TxRecord::from_tx).collect(),
            pending: self.pending.values().map(TxRecord::from_tx).collect(),
            spent_outpoints: self.spent_outpoints.iter().map(OutPointRecord::from).collect(),
        };

        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::WalletFile(format!("failed to serialize wallet: {}", e)))?;
        fs::write(path.as_ref(), json)
            .map_err(|e| Error::WalletFile(format!("failed to write {}: {}", path.as_ref().display(), e)))
    }

    pub fn load<P: AsRef<Path>>(path: P, params: &NetworkParams) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::WalletFile(format!("failed to read {}: {}", path.as_ref().display(), e)))?;
        let file: WalletFile = serde_json::from_str(&json)
            .map_err(|e| Error::WalletFile(format!("failed to parse wallet: {}", e)))?;

        if file.network != params.name {
            return Err(Error::WalletFile(format!(
                "wallet belongs to {}, not {}",
                file.network, params.name
            )));
        }

        let mut wallet = Wallet::new(params.clone());
        for secret in &file.keys {
            let bytes = hex::decode(secret).map_err(|e| Error::WalletFile(format!("bad key: {}", e)))?;
            wallet.add_key(KeyPair::from_secret_bytes(&bytes)?);
        }
        for (records, pool) in [
            (file.unspent, &mut wallet.unspent),
            (file.spent, &mut wallet.spent),
            (file.pending, &mut wallet.pending),
        ] {
            for record in records {
                let tx = record.into_tx()?;
                pool.insert(tx.hash(), tx);
            }
        }
        for record in file.spent_outpoints {
            wallet.spent_outpoints.insert(record.try_into()?);
        }
        Ok(wallet)
    }
}

impl WalletView for Wallet {
    fn find_key_from_pub_hash(&self, pubkey_hash: &[u8; 20]) -> Option<&KeyPair> {
        self.keys.iter().find(|key| key.pubkey_hash() == *pubkey_hash)
    }

    fn connected_output(&self, outpoint: &OutPoint) -> Option<&TxOutput> {
        self.find_transaction(&outpoint.hash)?
            .outputs()
            .ok()?
            .get(outpoint.index as usize)
    }

    fn is_output_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent_outpoints.contains(outpoint)
    }

    fn balance(&self) -> u64 {
        Wallet::balance(self)
    }
}

impl fmt::Display for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Wallet containing {} in:", format_btc(self.balance()))?;
        writeln!(f, "  {} unspent transactions", self.unspent.len())?;
        writeln!(f, "  {} spent transactions", self.spent.len())?;
        writeln!(f, "  {} pending transactions", self.pending.len())?;
        writeln!(f, "Keys:")?;
        for key in &self.keys {
            writeln!(
                f,
                "  addr:{} pub:{}",
                key.address(&self.params),
                hex::encode(key.public_key_bytes())
            )?;
        }
        for (label, pool) in [("UNSPENT", &self.unspent), ("SPENT", &self.spent), ("PENDING", &self.pending)] {
            if pool.is_empty() {
                continue;
            }
            writeln!(f, ">>> {}:", label)?;
            for tx in pool.values() {
                write!(f, "{}", tx)?;
            }
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// On-disk wallet layout
#[derive(Serialize, Deserialize)]
struct WalletFile {
    network: String,
    /// Hex secret keys
    keys: Vec<String>,
    unspent: Vec<TxRecord>,
    spent: Vec<TxRecord>,
    pending: Vec<TxRecord>,
    spent_outpoints: Vec<OutPointRecord>,
}

#[derive(Serialize, Deserialize)]
struct TxRecord {
    /// Hex wire form
    tx: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<u64>,
    #[serde(default)]
    appears_in: Vec<BlockRecord>,
}

impl TxRecord {
    fn from_tx(tx: &Transaction) -> Self {
        Self {
            tx: hex::encode(tx.serialize()),
            updated_at: tx.update_time(),
            appears_in: tx.appears_in().map(BlockRecord::from).collect(),
        }
    }

    fn into_tx(self) -> Result<Transaction> {
        let bytes = hex::decode(&self.tx).map_err(|e| Error::WalletFile(format!("bad transaction hex: {}", e)))?;
        let mut tx = Transaction::deserialize(&bytes)?;
        for block in self.appears_in {
            tx.add_block_appearance(&block.try_into()?, false);
        }
        if let Some(updated_at) = self.updated_at {
            tx.set_update_time(updated_at);
        }
        Ok(tx)
    }
}

#[derive(Serialize, Deserialize)]
struct BlockRecord {
    /// Hex 80-byte header
    header: String,
    /// Decimal, since JSON numbers cannot hold 128 bits
    chain_work: String,
    height: u32,
}

impl From<&StoredBlock> for BlockRecord {
    fn from(block: &StoredBlock) -> Self {
        Self {
            header: hex::encode(block.header.serialize()),
            chain_work: block.chain_work.to_string(),
            height: block.height,
        }
    }
}

impl TryFrom<BlockRecord> for StoredBlock {
    type Error = Error;

    fn try_from(record: BlockRecord) -> Result<Self> {
        let bytes = hex::decode(&record.header).map_err(|e| Error::WalletFile(format!("bad header hex: {}", e)))?;
        let header = BlockHeader::deserialize(&bytes)?;
        let chain_work = record
            .chain_work
            .parse()
            .map_err(|e| Error::WalletFile(format!("bad chain work {}: {}", record.chain_work, e)))?;
        Ok(StoredBlock::new(header, chain_work, record.height))
    }
}

#[derive(Serialize, Deserialize)]
struct OutPointRecord {
    hash: String,
    index: u32,
}

impl From<&OutPoint> for OutPointRecord {
    fn from(outpoint: &OutPoint) -> Self {
        Self {
            hash: outpoint.hash.to_hex(),
            index: outpoint.index,
        }
    }
}

impl TryFrom<OutPointRecord> for OutPoint {
    type Error = Error;

    fn try_from(record: OutPointRecord) -> Result<Self> {
        let hash = Hash256::from_hex(&record.hash).map_err(Error::WalletFile)?;
        Ok(OutPoint::new(hash, record.index))
    }
}
