// Transaction data structures

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::consensus::ValidationError;
use crate::core::script::Script;
use crate::core::serialize::{
    decode_varint, read_bytes, skip_var_bytes, var_bytes_size, varint_size, write_u32_le, write_u64_le,
    write_var_bytes, write_varint, ByteReader, Decodable, Encodable,
};
use crate::core::{double_hash, Hash256};
use crate::error::{Error, Result};
use crate::storage::StoredBlock;
use crate::wallet::WalletView;

/// How far a lazily decoded message has been parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Only the location in the buffer is known
    Unparsed,
    /// The exact byte span is known, fields are untouched
    LengthKnown,
    /// Every field is decoded
    Parsed,
}

/// Signature hash modes. Only `All` is supported for signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SigHash {
    All = 1,
    None = 2,
    Single = 3,
}

impl SigHash {
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Reference to one output of a previous transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub const SIZE: usize = 36;

    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    /// Previous-output reference of a coinbase input
    pub fn null() -> Self {
        Self { hash: Hash256::zero(), index: u32::MAX }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.index)
    }
}

/// Transaction input - references a previous transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub outpoint: OutPoint,
    /// Signature script (scriptSig) - proves ownership
    pub script_sig: Vec<u8>,
    /// Sequence number (usually 0xffffffff)
    pub sequence: u32,
    /// The output this input spends, when known. Never serialized.
    pub connected: Option<TxOutput>,
}

impl TxInput {
    pub fn new(outpoint: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            outpoint,
            script_sig,
            sequence: u32::MAX,
            connected: None,
        }
    }

    /// Create a coinbase input (for mining rewards)
    pub fn coinbase(script_sig: Vec<u8>) -> Self {
        Self::new(OutPoint::null(), script_sig)
    }

    pub fn is_coinbase(&self) -> bool {
        self.outpoint.hash.is_zero()
    }

    fn encode_with_script(&self, out: &mut Vec<u8>, script: &[u8]) {
        out.extend_from_slice(self.outpoint.hash.as_bytes());
        write_u32_le(out, self.outpoint.index);
        write_var_bytes(out, script);
        write_u32_le(out, self.sequence);
    }
}

impl Encodable for TxInput {
    fn encode(&self, out: &mut Vec<u8>) {
        self.encode_with_script(out, &self.script_sig);
    }

    fn message_size(&self) -> usize {
        OutPoint::SIZE + var_bytes_size(&self.script_sig) + 4
    }
}

impl Decodable for TxInput {
    fn decode(buf: &[u8], offset: usize, _known_length: Option<usize>) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf, offset);
        let hash = reader.read_hash()?;
        let index = reader.read_u32_le()?;
        let script_sig = reader.read_var_bytes()?;
        let sequence = reader.read_u32_le()?;

        let input = Self {
            outpoint: OutPoint::new(hash, index),
            script_sig,
            sequence,
            connected: None,
        };
        Ok((input, reader.position() - offset))
    }
}

/// Transaction output - specifies amount and recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Amount in satoshis (1 BTC = 100,000,000 satoshis)
    pub value: u64,
    /// Public key script (scriptPubKey)
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        Self { value, script_pubkey }
    }

    /// Public key hash this output pays to, if it is pay-to-pubkey-hash
    pub fn pubkey_hash(&self) -> Option<[u8; 20]> {
        Script::pubkey_hash(&self.script_pubkey).ok()
    }

    /// Whether the wallet holds the key for this output
    pub fn is_mine(&self, wallet: &impl WalletView) -> bool {
        self.pubkey_hash()
            .is_some_and(|hash| wallet.find_key_from_pub_hash(&hash).is_some())
    }
}

impl Encodable for TxOutput {
    fn encode(&self, out: &mut Vec<u8>) {
        write_u64_le(out, self.value);
        write_var_bytes(out, &self.script_pubkey);
    }

    fn message_size(&self) -> usize {
        8 + var_bytes_size(&self.script_pubkey)
    }
}

impl Decodable for TxOutput {
    fn decode(buf: &[u8], offset: usize, _known_length: Option<usize>) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf, offset);
        let value = reader.read_u64_le()?;
        let script_pubkey = reader.read_var_bytes()?;
        Ok((Self { value, script_pubkey }, reader.position() - offset))
    }
}

/// Decoded fields of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
struct TxBody {
    version: u32,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    lock_time: u32,
}

impl TxBody {
    // smallest possible input: outpoint, empty script, sequence
    const MIN_INPUT_SIZE: usize = OutPoint::SIZE + 1 + 4;
    const MIN_OUTPUT_SIZE: usize = 8 + 1;

    fn parse(buf: &[u8], offset: usize) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf, offset);
        let version = reader.read_u32_le()?;

        let input_count = reader.read_count(Self::MIN_INPUT_SIZE)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let (input, size) = TxInput::decode(buf, reader.position(), None)?;
            reader.read_slice(size)?;
            inputs.push(input);
        }

        let output_count = reader.read_count(Self::MIN_OUTPUT_SIZE)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let (output, size) = TxOutput::decode(buf, reader.position(), None)?;
            reader.read_slice(size)?;
            outputs.push(output);
        }

        let lock_time = reader.read_u32_le()?;
        let body = Self { version, inputs, outputs, lock_time };
        Ok((body, reader.position() - offset))
    }

    /// Encode with every input script replaced: `script_for(i)` supplies input i's script
    fn encode_with<'a>(&'a self, out: &mut Vec<u8>, script_for: impl Fn(usize, &'a TxInput) -> &'a [u8]) {
        write_u32_le(out, self.version);
        write_varint(out, self.inputs.len() as u64);
        for (i, input) in self.inputs.iter().enumerate() {
            input.encode_with_script(out, script_for(i, input));
        }
        write_varint(out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(out);
        }
        write_u32_le(out, self.lock_time);
    }

    fn size(&self) -> usize {
        4 + varint_size(self.inputs.len() as u64)
            + self.inputs.iter().map(Encodable::message_size).sum::<usize>()
            + varint_size(self.outputs.len() as u64)
            + self.outputs.iter().map(Encodable::message_size).sum::<usize>()
            + 4
    }
}

/// A transaction, possibly decoded lazily from a block.
///
/// A transaction decoded from the wire keeps its own bytes. Fields are parsed
/// on first access and serialization hands back the retained bytes until the
/// transaction is mutated. Every mutation drops the cached hash and the
/// retained bytes.
#[derive(Debug, Clone)]
pub struct Transaction {
    body: OnceLock<TxBody>,
    raw: Option<Arc<[u8]>>,
    hash: OnceLock<Hash256>,
    /// Blocks this transaction appeared in, keyed by block hash. Wallet-only.
    appears_in: HashMap<Hash256, StoredBlock>,
    /// First time this transaction was seen, Unix seconds. Wallet-only.
    updated_at: Option<u64>,
}

impl Transaction {
    /// Create an empty version 1 transaction
    pub fn new() -> Self {
        Self::from_parts(1, Vec::new(), Vec::new(), 0)
    }

    pub fn from_parts(version: u32, inputs: Vec<TxInput>, outputs: Vec<TxOutput>, lock_time: u32) -> Self {
        Self {
            body: OnceLock::from(TxBody { version, inputs, outputs, lock_time }),
            raw: None,
            hash: OnceLock::new(),
            appears_in: HashMap::new(),
            updated_at: None,
        }
    }

    /// Create a coinbase transaction (mining reward)
    pub fn coinbase(script_sig: Vec<u8>, output: TxOutput) -> Self {
        Self::from_parts(1, vec![TxInput::coinbase(script_sig)], vec![output], 0)
    }

    /// Length of the transaction starting at `offset`, found by skipping
    /// over the variable-length fields without decoding them.
    pub fn calc_length(buf: &[u8], offset: usize) -> Result<usize> {
        let mut pos = offset + 4;

        let (input_count, size) = decode_varint(buf, pos)?;
        pos += size;
        for _ in 0..input_count {
            pos += OutPoint::SIZE;
            pos += skip_var_bytes(buf, pos)?;
            pos += 4;
        }

        let (output_count, size) = decode_varint(buf, pos)?;
        pos += size;
        for _ in 0..output_count {
            pos += 8;
            pos += skip_var_bytes(buf, pos)?;
        }

        pos += 4;
        if pos > buf.len() {
            return Err(Error::malformed(format!(
                "transaction at {} runs to {} past end of {} byte buffer",
                offset,
                pos,
                buf.len()
            )));
        }
        Ok(pos - offset)
    }

    /// Decode without parsing fields. The span is `known_length` when given,
    /// otherwise it is found with `calc_length`.
    pub fn decode_lazy(buf: &[u8], offset: usize, known_length: Option<usize>) -> Result<(Self, usize)> {
        let length = match known_length {
            Some(length) => length,
            None => Self::calc_length(buf, offset)?,
        };
        let raw = read_bytes(buf, offset, length)?;

        let tx = Self {
            body: OnceLock::new(),
            raw: Some(Arc::from(raw)),
            hash: OnceLock::new(),
            appears_in: HashMap::new(),
            updated_at: None,
        };
        Ok((tx, length))
    }

    pub fn parse_state(&self) -> ParseState {
        if self.body.get().is_some() {
            ParseState::Parsed
        } else {
            ParseState::LengthKnown
        }
    }

    fn body(&self) -> Result<&TxBody> {
        if let Some(body) = self.body.get() {
            return Ok(body);
        }
        let raw = self
            .raw
            .as_deref()
            .ok_or_else(|| Error::malformed("transaction has neither fields nor bytes"))?;
        let (body, used) = TxBody::parse(raw, 0)?;
        if used != raw.len() {
            return Err(Error::malformed(format!(
                "transaction fields use {} of {} bytes",
                used,
                raw.len()
            )));
        }
        Ok(self.body.get_or_init(|| body))
    }

    fn body_mut(&mut self) -> Result<&mut TxBody> {
        self.body()?;
        self.hash = OnceLock::new();
        self.raw = None;
        self.body
            .get_mut()
            .ok_or_else(|| Error::malformed("transaction fields missing after parse"))
    }

    /// Force a full parse, surfacing any decode error now
    pub fn ensure_parsed(&self) -> Result<()> {
        self.body().map(|_| ())
    }

    pub fn version(&self) -> Result<u32> {
        Ok(self.body()?.version)
    }

    pub fn inputs(&self) -> Result<&[TxInput]> {
        Ok(&self.body()?.inputs)
    }

    pub fn outputs(&self) -> Result<&[TxOutput]> {
        Ok(&self.body()?.outputs)
    }

    pub fn lock_time(&self) -> Result<u32> {
        Ok(self.body()?.lock_time)
    }

    pub fn add_input(&mut self, input: TxInput) -> Result<()> {
        self.body_mut()?.inputs.push(input);
        Ok(())
    }

    /// Add an unsigned input spending output `index` of `from`, connected to that output
    pub fn add_input_from(&mut self, from: &Transaction, index: u32) -> Result<()> {
        let output = from.outputs()?.get(index as usize).cloned().ok_or_else(|| {
            Error::PreconditionViolation(format!("transaction {} has no output {}", from.hash(), index))
        })?;

        let mut input = TxInput::new(OutPoint::new(from.hash(), index), Vec::new());
        input.connected = Some(output);
        self.add_input(input)
    }

    pub fn add_output(&mut self, value: u64, script_pubkey: Vec<u8>) -> Result<()> {
        self.body_mut()?.outputs.push(TxOutput::new(value, script_pubkey));
        Ok(())
    }

    pub fn set_lock_time(&mut self, lock_time: u32) -> Result<()> {
        self.body_mut()?.lock_time = lock_time;
        Ok(())
    }

    /// Connect input `index` to the output it spends (not serialized)
    pub fn connect_input(&mut self, index: usize, output: TxOutput) -> Result<()> {
        let input = self.body_mut()?.inputs.get_mut(index).ok_or_else(|| {
            Error::PreconditionViolation(format!("no input {}", index))
        })?;
        input.connected = Some(output);
        Ok(())
    }

    /// Double SHA-256 of the wire form, computed once and cached until mutation
    pub fn hash(&self) -> Hash256 {
        *self.hash.get_or_init(|| double_hash(&self.serialize()))
    }

    /// Exactly one input, and it spends nothing
    pub fn is_coinbase(&self) -> Result<bool> {
        let inputs = self.inputs()?;
        Ok(inputs.len() == 1 && inputs[0].is_coinbase())
    }

    /// Sum of every output. Overflowing `u64` is a validation failure.
    pub fn total_output_value(&self) -> Result<u64> {
        sum_values(self.outputs()?.iter().map(|output| output.value))
    }

    /// Hash signed by input `input_index`.
    ///
    /// The transaction is serialized with every input script empty except
    /// the target, which carries the locking script of the output it
    /// spends, then the 4-byte hash type is appended and the whole thing is
    /// double hashed. `self` is not modified.
    pub fn signature_hash(&self, input_index: usize, hash_type: SigHash) -> Result<Hash256> {
        if hash_type != SigHash::All {
            return Err(Error::PreconditionViolation(format!(
                "signature hash type {:?} is not supported",
                hash_type
            )));
        }

        let body = self.body()?;
        let input = body.inputs.get(input_index).ok_or_else(|| {
            Error::PreconditionViolation(format!(
                "input {} out of range for {} inputs",
                input_index,
                body.inputs.len()
            ))
        })?;
        let connected_script = input
            .connected
            .as_ref()
            .map(|output| output.script_pubkey.as_slice())
            .ok_or_else(|| Error::PreconditionViolation(format!("input {} is not connected", input_index)))?;

        let mut buf = Vec::with_capacity(body.size() + connected_script.len() + 4);
        body.encode_with(&mut buf, |i, _| if i == input_index { connected_script } else { &[] });
        write_u32_le(&mut buf, hash_type.byte() as u32);

        Ok(double_hash(&buf))
    }

    /// Sign every input with the key the wallet holds for the output it spends.
    ///
    /// Each input script must be empty. Inputs that are not connected yet
    /// are connected through the wallet first. Every signature hash is
    /// computed before any script is written.
    pub fn sign_inputs(&mut self, hash_type: SigHash, wallet: &impl WalletView) -> Result<()> {
        let body = self.body()?;
        if body.inputs.is_empty() || body.outputs.is_empty() {
            return Err(Error::PreconditionViolation(format!(
                "cannot sign a transaction with {} inputs and {} outputs",
                body.inputs.len(),
                body.outputs.len()
            )));
        }
        if let Some(i) = body.inputs.iter().position(|input| !input.script_sig.is_empty()) {
            return Err(Error::PreconditionViolation(format!("input {} already has a script", i)));
        }

        let to_connect: Vec<(usize, TxOutput)> = body
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| input.connected.is_none())
            .map(|(i, input)| {
                wallet
                    .connected_output(&input.outpoint)
                    .cloned()
                    .map(|output| (i, output))
                    .ok_or_else(|| {
                        Error::PreconditionViolation(format!("input {} spends unknown output {}", i, input.outpoint))
                    })
            })
            .collect::<Result<_>>()?;
        for (i, output) in to_connect {
            self.connect_input(i, output)?;
        }

        let mut scripts = Vec::with_capacity(self.inputs()?.len());
        for (i, input) in self.inputs()?.iter().enumerate() {
            let connected_script = input
                .connected
                .as_ref()
                .map(|output| output.script_pubkey.as_slice())
                .unwrap_or_default();
            // only pay-to-pubkey-hash outputs can be matched to a wallet key
            let pubkey_hash = Script::pubkey_hash(connected_script)
                .map_err(|_| Error::KeyNotFound(format!("input {} spends {}", i, hex::encode(connected_script))))?;
            let key = wallet
                .find_key_from_pub_hash(&pubkey_hash)
                .ok_or_else(|| Error::KeyNotFound(hex::encode(pubkey_hash)))?;

            let sighash = self.signature_hash(i, hash_type)?;
            let mut signature = key.sign(&sighash);
            signature.push(hash_type.byte());

            scripts.push(Script::p2pkh_script_sig(&signature, &key.public_key_bytes()));
        }

        for (input, script) in self.body_mut()?.inputs.iter_mut().zip(scripts) {
            input.script_sig = script;
        }
        Ok(())
    }

    /// Empty every input script so the transaction can be signed again
    pub fn clear_input_scripts(&mut self) -> Result<()> {
        for input in &mut self.body_mut()?.inputs {
            input.script_sig.clear();
        }
        Ok(())
    }

    /// Check input `index`'s unlocking script against the output it spends
    pub fn verify_input(&self, index: usize) -> Result<bool> {
        let input = self
            .inputs()?
            .get(index)
            .ok_or_else(|| Error::PreconditionViolation(format!("no input {}", index)))?;
        let connected = input
            .connected
            .as_ref()
            .ok_or_else(|| Error::PreconditionViolation(format!("input {} is not connected", index)))?;

        let sighash = self.signature_hash(index, SigHash::All)?;
        Script::verify_p2pkh(&input.script_sig, &connected.script_pubkey, &sighash)
    }

    /// Sum of the outputs paying to the wallet's keys. Spent outputs are
    /// skipped unless `include_spent`.
    pub fn value_received_by(&self, wallet: &impl WalletView, include_spent: bool) -> Result<u64> {
        let hash = self.hash();
        let mut value = 0;
        for (i, output) in self.outputs()?.iter().enumerate() {
            if !output.is_mine(wallet) {
                continue;
            }
            if !include_spent && wallet.is_output_spent(&OutPoint::new(hash, i as u32)) {
                continue;
            }
            value = add_value(value, output.value)?;
        }
        Ok(value)
    }

    /// Sum of the wallet-owned outputs this transaction's inputs spend.
    /// Inputs spending outputs the wallet does not know are skipped.
    pub fn value_sent_by(&self, wallet: &impl WalletView) -> Result<u64> {
        let mut value = 0;
        for input in self.inputs()? {
            match wallet.connected_output(&input.outpoint) {
                Some(output) if output.is_mine(wallet) => value = add_value(value, output.value)?,
                _ => {}
            }
        }
        Ok(value)
    }

    /// Record that this transaction appeared in `block`. On the best chain
    /// the first appearance also sets the update time.
    pub fn add_block_appearance(&mut self, block: &StoredBlock, best_chain: bool) {
        if best_chain && self.updated_at.is_none() {
            self.updated_at = Some(block.header.timestamp as u64);
        }
        self.appears_in.insert(block.hash(), block.clone());
    }

    pub fn appears_in(&self) -> impl Iterator<Item = &StoredBlock> {
        self.appears_in.values()
    }

    /// Earliest time the transaction was seen, falling back to the earliest
    /// block it appeared in.
    pub fn update_time(&self) -> Option<u64> {
        self.updated_at.or_else(|| {
            self.appears_in
                .values()
                .map(|block| block.header.timestamp as u64)
                .min()
        })
    }

    pub fn set_update_time(&mut self, updated_at: u64) {
        self.updated_at = Some(updated_at);
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Transaction {}

impl Encodable for Transaction {
    fn encode(&self, out: &mut Vec<u8>) {
        if let Some(raw) = &self.raw {
            out.extend_from_slice(raw);
        } else if let Some(body) = self.body.get() {
            body.encode_with(out, |_, input| input.script_sig.as_slice());
        }
    }

    fn message_size(&self) -> usize {
        match (&self.raw, self.body.get()) {
            (Some(raw), _) => raw.len(),
            (None, Some(body)) => body.size(),
            (None, None) => 0,
        }
    }
}

impl Decodable for Transaction {
    /// Eager decode. The bytes are retained so re-serializing is a copy.
    fn decode(buf: &[u8], offset: usize, known_length: Option<usize>) -> Result<(Self, usize)> {
        let (body, used) = TxBody::parse(buf, offset)?;
        if let Some(length) = known_length {
            if length != used {
                return Err(Error::malformed(format!(
                    "transaction uses {} bytes but message holds {}",
                    used, length
                )));
            }
        }

        let raw = read_bytes(buf, offset, used)?;
        let tx = Self {
            body: OnceLock::from(body),
            raw: Some(Arc::from(raw)),
            hash: OnceLock::new(),
            appears_in: HashMap::new(),
            updated_at: None,
        };
        Ok((tx, used))
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "  {}", self.hash())?;
        let (inputs, outputs) = match (self.inputs(), self.outputs()) {
            (Ok(inputs), Ok(outputs)) => (inputs, outputs),
            _ => return writeln!(f, "     [unparseable]"),
        };

        if inputs.len() == 1 && inputs[0].is_coinbase() {
            return writeln!(f, "     == COINBASE ({} bytes of script)", inputs[0].script_sig.len());
        }
        for input in inputs {
            writeln!(f, "     from {}", input.outpoint)?;
        }
        for output in outputs {
            match output.pubkey_hash() {
                Some(hash) => writeln!(f, "       to {} {}", hex::encode(hash), format_btc(output.value))?,
                None => writeln!(f, "       to [script {}] {}", hex::encode(&output.script_pubkey), format_btc(output.value))?,
            }
        }
        Ok(())
    }
}

fn add_value(total: u64, value: u64) -> Result<u64> {
    total
        .checked_add(value)
        .ok_or_else(|| ValidationError::OutputValueExceedsMax.into())
}

fn sum_values(values: impl IntoIterator<Item = u64>) -> Result<u64> {
    values.into_iter().try_fold(0, add_value)
}

/// Render a satoshi amount as BTC with 8 decimal places
pub fn format_btc(satoshis: u64) -> String {
    format!("{}.{:08} BTC", satoshis / 100_000_000, satoshis % 100_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash160;
    use crate::test_util::{fake_funding_tx, TestWallet};

    fn sample_tx() -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(TxInput::new(OutPoint::new(Hash256::new([7; 32]), 1), vec![0xab; 10]))
            .unwrap();
        tx.add_output(5000, Script::p2pkh_script_pubkey(&[3; 20])).unwrap();
        tx.add_output(1234, vec![0x51]).unwrap();
        tx
    }

    #[test]
    fn test_coinbase_input() {
        let input = TxInput::coinbase(vec![1, 2, 3]);
        assert!(input.is_coinbase());
        assert_eq!(input.outpoint.index, u32::MAX);

        let tx = Transaction::coinbase(vec![4, 5, 6], TxOutput::new(5000000000, vec![1]));
        assert!(tx.is_coinbase().unwrap());
        assert!(!sample_tx().is_coinbase().unwrap());
    }

    #[test]
    fn test_decode_reencode_hash_identity() {
        let tx = sample_tx();
        let bytes = tx.serialize();
        assert_eq!(bytes.len(), tx.message_size());

        let (decoded, used) = Transaction::decode(&bytes, 0, Some(bytes.len())).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.serialize(), bytes);
        assert_eq!(decoded.hash(), double_hash(&bytes));
        assert_eq!(decoded.hash(), tx.hash());
        assert_eq!(decoded.outputs().unwrap()[1].value, 1234);
    }

    #[test]
    fn test_calc_length_matches_encoding() {
        let tx = sample_tx();
        let mut buf = vec![0xee; 3];
        tx.encode(&mut buf);
        buf.extend_from_slice(&[0xff; 5]);

        assert_eq!(Transaction::calc_length(&buf, 3).unwrap(), tx.message_size());
        assert!(Transaction::calc_length(&buf[..buf.len() - 8], 3).is_err());
    }

    #[test]
    fn test_lazy_parse_on_first_access() {
        let bytes = sample_tx().serialize();
        let (lazy, used) = Transaction::decode_lazy(&bytes, 0, None).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(lazy.parse_state(), ParseState::LengthKnown);

        // retained bytes, no parse needed
        assert_eq!(lazy.serialize(), bytes);
        assert_eq!(lazy.parse_state(), ParseState::LengthKnown);

        assert_eq!(lazy.inputs().unwrap().len(), 1);
        assert_eq!(lazy.parse_state(), ParseState::Parsed);
    }

    #[test]
    fn test_mutation_drops_cached_hash() {
        let bytes = sample_tx().serialize();
        let (mut tx, _) = Transaction::decode(&bytes, 0, None).unwrap();
        let before = tx.hash();

        tx.set_lock_time(500).unwrap();
        assert_ne!(tx.hash(), before);
        assert_eq!(tx.lock_time().unwrap(), 500);
        assert_ne!(tx.serialize(), bytes);
    }

    #[test]
    fn test_truncated_transaction() {
        let bytes = sample_tx().serialize();
        let err = Transaction::decode(&bytes[..bytes.len() - 1], 0, None).unwrap_err();
        assert!(matches!(err, Error::MalformedEncoding(_)));
    }

    #[test]
    fn test_sign_and_verify() {
        let wallet = TestWallet::with_new_key();
        let funding = fake_funding_tx(wallet.key().pubkey_hash(), 500_000_000);

        let mut tx = Transaction::new();
        tx.add_input_from(&funding, 0).unwrap();
        tx.add_output(100_000_000, Script::p2pkh_script_pubkey(&[9; 20])).unwrap();
        tx.sign_inputs(SigHash::All, &wallet).unwrap();

        let (signature, pubkey) = Script::parse_script_sig(&tx.inputs().unwrap()[0].script_sig).unwrap();
        assert_eq!(*signature.last().unwrap(), SigHash::All.byte());
        assert_eq!(hash160(&pubkey), wallet.key().pubkey_hash());
        assert!(tx.verify_input(0).unwrap());
    }

    #[test]
    fn test_resign_yields_same_signature_hashes() {
        let wallet = TestWallet::with_new_key();
        let funding = fake_funding_tx(wallet.key().pubkey_hash(), 500_000_000);

        let mut tx = Transaction::new();
        tx.add_input_from(&funding, 0).unwrap();
        tx.add_output(100_000_000, Script::p2pkh_script_pubkey(&[9; 20])).unwrap();

        let unsigned = tx.signature_hash(0, SigHash::All).unwrap();
        tx.sign_inputs(SigHash::All, &wallet).unwrap();
        let signed = tx.signature_hash(0, SigHash::All).unwrap();
        assert_eq!(unsigned, signed);

        // signing twice without clearing is misuse
        let err = tx.sign_inputs(SigHash::All, &wallet).unwrap_err();
        assert!(matches!(err, Error::PreconditionViolation(_)));

        tx.clear_input_scripts().unwrap();
        tx.sign_inputs(SigHash::All, &wallet).unwrap();
        assert_eq!(tx.signature_hash(0, SigHash::All).unwrap(), unsigned);
        assert!(tx.verify_input(0).unwrap());
    }

    #[test]
    fn test_sign_preconditions() {
        let wallet = TestWallet::with_new_key();

        let mut empty = Transaction::new();
        assert!(matches!(
            empty.sign_inputs(SigHash::All, &wallet),
            Err(Error::PreconditionViolation(_))
        ));

        let tx = sample_tx();
        assert!(matches!(
            tx.signature_hash(0, SigHash::Single),
            Err(Error::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_sign_without_key() {
        let wallet = TestWallet::with_new_key();
        let funding = fake_funding_tx([0x55; 20], 1000);

        let mut tx = Transaction::new();
        tx.add_input_from(&funding, 0).unwrap();
        tx.add_output(900, vec![0x51]).unwrap();
        assert!(matches!(
            tx.sign_inputs(SigHash::All, &wallet),
            Err(Error::KeyNotFound(_))
        ));

        let mut bare = Transaction::new();
        bare.add_input_from(&sample_tx(), 1).unwrap();
        bare.add_output(900, vec![0x51]).unwrap();
        assert!(matches!(
            bare.sign_inputs(SigHash::All, &wallet),
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_value_accounting() {
        let mut wallet = TestWallet::with_new_key();
        let funding = fake_funding_tx(wallet.key().pubkey_hash(), 500_000_000);
        wallet.add_unspent(funding.clone());

        assert_eq!(funding.value_received_by(&wallet, true).unwrap(), 500_000_000);

        let mut spend = Transaction::new();
        spend.add_input_from(&funding, 0).unwrap();
        spend.add_output(100_000_000, vec![0x51]).unwrap();
        assert_eq!(spend.value_sent_by(&wallet).unwrap(), 500_000_000);
        assert_eq!(spend.value_received_by(&wallet, true).unwrap(), 0);

        wallet.mark_spent(OutPoint::new(funding.hash(), 0));
        assert_eq!(funding.value_received_by(&wallet, false).unwrap(), 0);
        assert_eq!(funding.value_received_by(&wallet, true).unwrap(), 500_000_000);
    }

    #[test]
    fn test_output_value_overflow_is_rejected() {
        let mut tx = sample_tx();
        tx.add_output(u64::MAX, vec![0x51]).unwrap();
        assert!(matches!(
            tx.total_output_value(),
            Err(Error::BlockValidationFailure(ValidationError::OutputValueExceedsMax))
        ));

        let mut wallet = TestWallet::with_new_key();
        let mut funding = fake_funding_tx(wallet.key().pubkey_hash(), u64::MAX);
        funding
            .add_output(2, Script::p2pkh_script_pubkey(&wallet.key().pubkey_hash()))
            .unwrap();
        wallet.add_unspent(funding.clone());
        assert!(funding.value_received_by(&wallet, true).is_err());

        let mut spend = Transaction::new();
        spend.add_input_from(&funding, 0).unwrap();
        spend.add_input_from(&funding, 1).unwrap();
        assert!(spend.value_sent_by(&wallet).is_err());
    }

    #[test]
    fn test_update_time_from_appearances() {
        use crate::core::BlockHeader;

        let mut tx = sample_tx();
        assert_eq!(tx.update_time(), None);

        let early = StoredBlock::new(BlockHeader::new(1, Hash256::zero(), Hash256::zero(), 1000, 0x207fffff, 0), 1, 1);
        let late = StoredBlock::new(BlockHeader::new(1, Hash256::zero(), Hash256::zero(), 2000, 0x207fffff, 1), 1, 2);

        tx.add_block_appearance(&late, false);
        tx.add_block_appearance(&early, false);
        assert_eq!(tx.appears_in().count(), 2);
        assert_eq!(tx.update_time(), Some(1000));

        let mut best = sample_tx();
        best.add_block_appearance(&late, true);
        best.add_block_appearance(&early, true);
        assert_eq!(best.update_time(), Some(2000));
    }

    #[test]
    fn test_format_btc() {
        assert_eq!(format_btc(150_000_000), "1.50000000 BTC");
        assert_eq!(format_btc(1), "0.00000001 BTC");
    }
}
