// Proof of work and structural validation

pub mod pow;
pub mod validation;

pub use pow::{Miner, MiningResult, Target};
pub use validation::{BlockValidator, TransactionValidator, ValidationError};
