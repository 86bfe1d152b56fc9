// CLI commands

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{info, warn};

use btc_peer::core::{format_btc, Block, Encodable, Hash256, NetworkParams, OutPoint, Script, Transaction, TxInput};
use btc_peer::network::{DownloadListener, Peer, PeerConfig, TcpTransport};
use btc_peer::storage::{BlockChain, BlockStore, MemoryBlockStore, StoredBlock};
use btc_peer::wallet::{KeyPair, Wallet};
use btc_peer::{Error, Result};

#[derive(Parser)]
#[command(name = "btc-peer")]
#[command(about = "Minimal Bitcoin peer client", long_about = None)]
pub struct Cli {
    /// Network: main, testnet or unit_test
    #[arg(short, long, default_value = "testnet")]
    pub network: String,

    /// Wallet file
    #[arg(short, long, default_value = "wallet.json")]
    pub wallet: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a key pair and print it
    Key,

    /// Print the wallet's receiving address, creating the wallet if needed
    Address,

    /// Print keys, balance and transaction pools
    Wallet,

    /// Fund an in-memory wallet with 5 BTC and send 1 BTC from it
    SendDemo,

    /// Download the block chain from a peer, feeding the wallet
    Sync {
        /// host[:port] of the peer
        #[arg(short, long)]
        peer: String,

        /// Parse every block fully on arrival instead of on first use
        #[arg(long)]
        eager: bool,

        /// Ask the peer not to relay transactions
        #[arg(long)]
        mobile: bool,
    },

    /// Fetch one block by hash from a peer
    GetBlock {
        /// host[:port] of the peer
        #[arg(short, long)]
        peer: String,

        /// Block hash in hex
        hash: String,

        /// Seconds to wait for the block
        #[arg(short, long, default_value = "60")]
        timeout: u64,
    },
}

/// CLI handler
pub struct CliHandler {
    params: NetworkParams,
    wallet_path: PathBuf,
}

impl CliHandler {
    pub fn new(network: &str, wallet_path: &Path) -> Result<Self> {
        let params = NetworkParams::from_name(network)
            .ok_or_else(|| Error::PreconditionViolation(format!("unknown network {}", network)))?;
        Ok(Self {
            params,
            wallet_path: wallet_path.to_path_buf(),
        })
    }

    /// Handle CLI command
    pub async fn handle(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Key => self.key(),
            Commands::Address => self.address(),
            Commands::Wallet => self.wallet(),
            Commands::SendDemo => self.send_demo(),
            Commands::Sync { peer, eager, mobile } => self.sync(&peer, !eager, mobile).await,
            Commands::GetBlock { peer, hash, timeout } => self.get_block(&peer, &hash, timeout).await,
        }
    }

    fn key(&self) -> Result<()> {
        let key = KeyPair::generate();
        println!("Secret:  {}", hex::encode(key.secret_bytes()));
        println!("Public:  {}", hex::encode(key.public_key_bytes()));
        println!("Address: {}", key.address(&self.params));
        Ok(())
    }

    fn load_or_create_wallet(&self) -> Result<Wallet> {
        if self.wallet_path.exists() {
            info!("Loading wallet from {}", self.wallet_path.display());
            return Wallet::load(&self.wallet_path, &self.params);
        }

        info!("Creating wallet at {}", self.wallet_path.display());
        let mut wallet = Wallet::new(self.params.clone());
        wallet.add_key(KeyPair::generate());
        wallet.save(&self.wallet_path)?;
        Ok(wallet)
    }

    fn address(&self) -> Result<()> {
        let wallet = self.load_or_create_wallet()?;
        let key = wallet
            .keys()
            .first()
            .ok_or_else(|| Error::WalletFile("wallet has no keys".to_string()))?;
        println!("{}", key.address(&self.params));
        Ok(())
    }

    fn wallet(&self) -> Result<()> {
        let wallet = self.load_or_create_wallet()?;
        print!("{}", wallet);
        Ok(())
    }

    fn send_demo(&self) -> Result<()> {
        let key = KeyPair::generate();
        let mut wallet = Wallet::new(self.params.clone());
        wallet.add_key(key.clone());

        // 5 BTC from a transaction that spends nothing real, recorded in
        // the genesis block
        let mut funding = Transaction::new();
        funding.add_input(TxInput::new(OutPoint::new(Hash256::new(rand::random()), 0), vec![0x51]))?;
        funding.add_output(500_000_000, Script::p2pkh_script_pubkey(&key.pubkey_hash()))?;
        let genesis = StoredBlock::new(self.params.genesis_block().header, 0, 0);
        wallet.receive_from_block(funding, &genesis, true)?;

        println!("Funded wallet:");
        print!("{}", wallet);

        let to = KeyPair::generate().address(&self.params);
        let tx = wallet.send_coins_offline(&to, 100_000_000, 0)?;

        println!();
        println!("Sent {} BTC to {}:", format_btc(100_000_000), to);
        println!("{}", tx);
        println!("Raw: {}", hex::encode(tx.serialize()));
        println!();
        print!("{}", wallet);
        Ok(())
    }

    fn peer_config(&self, parse_lazy: bool, mobile_optimized: bool) -> PeerConfig {
        PeerConfig {
            params: self.params.clone(),
            parse_lazy,
            mobile_optimized,
            ..PeerConfig::default()
        }
    }

    async fn resolve(&self, peer: &str) -> Result<SocketAddr> {
        let target = if peer.contains(':') {
            peer.to_string()
        } else {
            format!("{}:{}", peer, self.params.port)
        };
        tokio::net::lookup_host(&target)
            .await
            .map_err(|e| Error::PeerUnavailable(format!("{}: {}", target, e)))?
            .next()
            .ok_or_else(|| Error::PeerUnavailable(format!("{} did not resolve", target)))
    }

    async fn connect(&self, peer: &str, config: PeerConfig, chain: BlockChain) -> Result<Arc<Peer<TcpTransport>>> {
        let addr = self.resolve(peer).await?;
        let peer = Peer::new(config, addr, Arc::new(chain));
        peer.connect().await?;
        Ok(Arc::new(peer))
    }

    async fn sync(&self, peer: &str, lazy: bool, mobile: bool) -> Result<()> {
        let wallet = Arc::new(Mutex::new(self.load_or_create_wallet()?));
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new(&self.params));
        let chain = BlockChain::with_wallet(self.params.clone(), store, Arc::clone(&wallet));

        let peer = self.connect(peer, self.peer_config(lazy, mobile), chain).await?;
        let mut runner = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.run().await })
        };

        let listener = DownloadListener::new();
        let mut done = listener.subscribe();
        peer.add_event_listener(Arc::new(Mutex::new(listener)));

        let stopped_early = if peer.blocks_to_get()? > 0 {
            peer.start_block_chain_download().await?;
            tokio::select! {
                _ = done.wait_for(|done| *done) => None,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, stopping download");
                    None
                }
                result = &mut runner => Some(result),
            }
        } else {
            println!("Already up to date with {}", peer.info().unwrap_or_default());
            None
        };

        peer.disconnect().await;
        let result = match stopped_early {
            Some(result) => result,
            None => runner.await,
        };
        if let Ok(Err(e)) = result {
            warn!("Peer stopped with {}", e);
        }

        let wallet = wallet
            .lock()
            .map_err(|_| Error::WalletFile("wallet lock poisoned".to_string()))?;
        wallet.save(&self.wallet_path)?;
        print!("{}", wallet);
        Ok(())
    }

    async fn get_block(&self, peer: &str, hash: &str, timeout: u64) -> Result<()> {
        let hash = Hash256::from_hex(hash)
            .map_err(|e| Error::PreconditionViolation(format!("invalid block hash: {}", e)))?;

        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new(&self.params));
        let chain = BlockChain::new(self.params.clone(), store);
        let peer = self.connect(peer, self.peer_config(true, true), chain).await?;
        let runner = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.run().await })
        };

        let pending = peer.get_block(hash).await?;
        let result = pending.wait_timeout(Duration::from_secs(timeout)).await;

        peer.disconnect().await;
        let _ = runner.await;

        print_block(&result?)
    }
}

fn print_block(block: &Block) -> Result<()> {
    println!("Block:");
    println!("  Hash: {}", block.hash());
    println!("  Previous: {}", block.header.prev_block_hash);
    println!("  Merkle root: {}", block.header.merkle_root);
    println!("  Timestamp: {}", block.header.timestamp);
    println!("  Bits: {:#010x}", block.header.bits);
    println!("  Nonce: {}", block.header.nonce);

    let transactions = block.transactions()?;
    println!("  Transactions: {}", transactions.len());
    for (i, tx) in transactions.iter().enumerate() {
        println!("    [{}] {}", i, tx.hash());
    }
    Ok(())
}
