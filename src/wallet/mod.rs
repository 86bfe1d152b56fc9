// Wallet, keys and transaction building

mod keystore;
mod tx_builder;
#[allow(clippy::module_inception)]
mod wallet;

pub use keystore::{Address, KeyPair};
pub use tx_builder::TransactionBuilder;
pub use wallet::{Wallet, WalletView};
