// Transaction builder

use log::debug;

use crate::core::{OutPoint, SigHash, Transaction, TxInput, TxOutput};
use crate::error::{Error, Result};
use crate::wallet::{Address, Wallet};

/// Builds signed payments from a wallet's spendable outputs
pub struct TransactionBuilder<'a> {
    wallet: &'a Wallet,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(wallet: &'a Wallet) -> Self {
        Self { wallet }
    }

    /// Build a transaction sending `amount` to `to`. Whatever the selected
    /// outputs hold beyond `amount + fee` goes back to the wallet's first key.
    pub fn build(&self, to: &Address, amount: u64, fee: u64) -> Result<Transaction> {
        let target = amount
            .checked_add(fee)
            .ok_or_else(|| Error::PreconditionViolation(format!("amount {} plus fee {} overflows", amount, fee)))?;

        let (selected, total_input) = self.select_outputs(target)?;
        debug!(
            "Selected {} outputs worth {} to cover {}",
            selected.len(),
            total_input,
            target
        );

        let mut tx = Transaction::new();
        for (outpoint, output) in selected {
            let mut input = TxInput::new(outpoint, Vec::new());
            input.connected = Some(output);
            tx.add_input(input)?;
        }

        tx.add_output(amount, to.script_pubkey())?;

        let change = total_input - target;
        if change > 0 {
            let change_key = self
                .wallet
                .keys()
                .first()
                .ok_or_else(|| Error::PreconditionViolation("wallet has no key to receive change".to_string()))?;
            tx.add_output(change, change_key.script_pubkey())?;
        }

        tx.sign_inputs(SigHash::All, self.wallet)?;
        Ok(tx)
    }

    /// Take spendable outputs in order until they cover `target`
    fn select_outputs(&self, target: u64) -> Result<(Vec<(OutPoint, TxOutput)>, u64)> {
        let mut selected = Vec::new();
        let mut total = 0u64;

        for (outpoint, output) in self.wallet.available_outputs() {
            total = total.saturating_add(output.value);
            selected.push((outpoint, output));

            if total >= target {
                return Ok((selected, total));
            }
        }

        Err(Error::InsufficientFunds {
            available: total,
            needed: target,
        })
    }
}
