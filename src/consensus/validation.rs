// Structural block and transaction checks

use std::time::{SystemTime, UNIX_EPOCH};

use crate::consensus::pow::{Miner, Target};
use crate::core::{Block, BlockHeader, NetworkParams, Transaction};
use crate::error::Result;

/// Maximum money supply in satoshis
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

/// Blocks may be at most this far ahead of our clock
const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Validation error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("block hash does not meet its target")]
    InvalidProofOfWork,
    #[error("target is easier than the network allows")]
    TargetTooEasy,
    #[error("merkle root does not match transactions")]
    InvalidMerkleRoot,
    #[error("block has no transactions")]
    NoTransactions,
    #[error("first transaction is not a coinbase")]
    MissingCoinbase,
    #[error("coinbase transaction at position {0}")]
    CoinbaseNotFirst(usize),
    #[error("transaction has no inputs or no outputs")]
    EmptyTransaction,
    #[error("block timestamp {0} is too far in the future")]
    InvalidTimestamp(u32),
    #[error("block version {0} not supported")]
    InvalidVersion(u32),
    #[error("total output value exceeds maximum supply")]
    OutputValueExceedsMax,
}

/// Block validator
pub struct BlockValidator {
    pow_limit: Target,
}

impl BlockValidator {
    pub fn new(params: &NetworkParams) -> Self {
        Self {
            pow_limit: Target::from_bits(params.proof_of_work_limit),
        }
    }

    /// Validate a block header. The genesis header is not checked for work.
    pub fn validate_header(&self, header: &BlockHeader) -> std::result::Result<(), ValidationError> {
        if !header.prev_block_hash.is_zero() {
            if Target::from_bits(header.bits).to_be_bytes() > self.pow_limit.to_be_bytes() {
                return Err(ValidationError::TargetTooEasy);
            }
            if !Miner::new(header.bits).verify(header) {
                return Err(ValidationError::InvalidProofOfWork);
            }
        }

        if header.version < 1 {
            return Err(ValidationError::InvalidVersion(header.version));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        if header.timestamp as u64 > now + MAX_FUTURE_BLOCK_TIME {
            return Err(ValidationError::InvalidTimestamp(header.timestamp));
        }

        Ok(())
    }

    /// Validate a complete block. Materializes its transactions, so a
    /// malformed transaction region surfaces here as a decode error.
    pub fn validate_block(&self, block: &Block) -> Result<()> {
        self.validate_header(&block.header)?;

        let transactions = block.transactions()?;
        let Some((first, rest)) = transactions.split_first() else {
            return Err(ValidationError::NoTransactions.into());
        };

        if !first.is_coinbase()? {
            return Err(ValidationError::MissingCoinbase.into());
        }
        for (i, tx) in rest.iter().enumerate() {
            if tx.is_coinbase()? {
                return Err(ValidationError::CoinbaseNotFirst(i + 1).into());
            }
        }

        if Block::calculate_merkle_root(transactions) != block.header.merkle_root {
            return Err(ValidationError::InvalidMerkleRoot.into());
        }

        for tx in transactions {
            TransactionValidator::validate_structure(tx)?;
        }

        Ok(())
    }
}

/// Checks on a single transaction, independent of any UTXO set
pub struct TransactionValidator;

impl TransactionValidator {
    pub fn validate_structure(tx: &Transaction) -> Result<()> {
        if tx.inputs()?.is_empty() || tx.outputs()?.is_empty() {
            return Err(ValidationError::EmptyTransaction.into());
        }
        if tx.total_output_value()? > MAX_MONEY {
            return Err(ValidationError::OutputValueExceedsMax.into());
        }
        Ok(())
    }

    /// Checks before relaying our own transaction
    pub fn validate_for_broadcast(tx: &Transaction) -> Result<()> {
        Self::validate_structure(tx)?;
        if tx.is_coinbase()? {
            return Err(ValidationError::CoinbaseNotFirst(0).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Hash256, OutPoint, TxInput, TxOutput};
    use crate::error::Error;
    use crate::test_util::mine_block;

    fn unit_params() -> NetworkParams {
        NetworkParams::unit_test()
    }

    #[test]
    fn test_validate_genesis_block() {
        let params = NetworkParams::main();
        let validator = BlockValidator::new(&params);
        assert!(validator.validate_block(&params.genesis_block()).is_ok());
    }

    #[test]
    fn test_mined_block_is_valid() {
        let params = unit_params();
        let block = mine_block(&params.genesis_block(), vec![]);
        assert!(BlockValidator::new(&params).validate_block(&block).is_ok());
    }

    #[test]
    fn test_invalid_merkle_root() {
        let params = unit_params();
        let mut block = mine_block(&params.genesis_block(), vec![]);
        block.header.merkle_root = Hash256::new([1; 32]);
        Miner::new(block.header.bits).mine(&mut block.header);

        let err = BlockValidator::new(&params).validate_block(&block).unwrap_err();
        assert!(matches!(err, Error::BlockValidationFailure(ValidationError::InvalidMerkleRoot)));
    }

    #[test]
    fn test_pow_checked_against_network_limit() {
        let params = NetworkParams::main();
        let validator = BlockValidator::new(&params);

        // unit-test difficulty is far too easy for main
        let header = BlockHeader::new(1, Hash256::new([1; 32]), Hash256::zero(), 1231006505, 0x207fffff, 0);
        assert_eq!(validator.validate_header(&header), Err(ValidationError::TargetTooEasy));

        let header = BlockHeader::new(1, Hash256::new([1; 32]), Hash256::zero(), 1231006505, 0x1d00ffff, 0);
        assert_eq!(validator.validate_header(&header), Err(ValidationError::InvalidProofOfWork));
    }

    #[test]
    fn test_future_timestamp() {
        let validator = BlockValidator::new(&unit_params());
        let header = BlockHeader::new(1, Hash256::zero(), Hash256::zero(), u32::MAX, 0x207fffff, 0);
        assert_eq!(
            validator.validate_header(&header),
            Err(ValidationError::InvalidTimestamp(u32::MAX))
        );
    }

    #[test]
    fn test_coinbase_must_be_first() {
        let params = unit_params();
        let extra = Transaction::coinbase(vec![9, 9], TxOutput::new(1, vec![0x51]));
        let block = mine_block(&params.genesis_block(), vec![extra]);

        let err = BlockValidator::new(&params).validate_block(&block).unwrap_err();
        assert!(matches!(err, Error::BlockValidationFailure(ValidationError::CoinbaseNotFirst(1))));
    }

    #[test]
    fn test_broadcast_checks() {
        let coinbase = Transaction::coinbase(vec![1], TxOutput::new(50, vec![0x51]));
        assert!(TransactionValidator::validate_for_broadcast(&coinbase).is_err());

        let mut tx = Transaction::new();
        tx.add_input(TxInput::new(OutPoint::new(Hash256::new([2; 32]), 0), vec![]))
            .unwrap();
        assert!(TransactionValidator::validate_for_broadcast(&tx).is_err());

        tx.add_output(MAX_MONEY + 1, vec![0x51]).unwrap();
        let err = TransactionValidator::validate_for_broadcast(&tx).unwrap_err();
        assert!(matches!(err, Error::BlockValidationFailure(ValidationError::OutputValueExceedsMax)));
    }
}
