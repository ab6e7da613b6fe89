// Bitcoin Dev Kit
// Written in 2020 by Alekos Filini <alekos.filini@gmail.com>
//
// Copyright (c) 2020-2021 Bitcoin Dev Kit Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Additional functions on the `rust-bitcoin` `PartiallySignedTransaction` structure.
//!
//! The base64 encoding used at the API boundary comes straight from `rust-bitcoin`: a [`Psbt`]
//! can be printed with `to_string()` and parsed back with `from_str()`.
//!
//! ## Example
//!
//! ```
//! # use std::str::FromStr;
//! # use bdk_engine::psbt::{Psbt, PsbtUtils};
//! let base64 = "cHNidP8BAKACAAAAAqsJSaCMWvfEm4IS9Bfi8Vqz9cM9zxU4IagTn4d6W3vkAAAAAAD+////qwlJoIxa98SbghL0F+LxWrP1wz3PFTghqBOfh3pbe+QBAAAAAP7///8CYDvqCwAAAAAZdqkUdopAu9dAy+gdmI5x3ipNXHE5ax2IrI4kAAAAAAAAGXapFG9GILVT+glechue4O/p+gOcykWXiKwAAAAAAAEHakcwRAIgR1lmF5fAGwNrJZKJSGhiGDR9iYZLcZ4ff89X0eURZYcCIFMJ6r9Wqk2Ikf/REf3xM286KdqGbX+EhtdVRs7tr5MZASEDXNxh/HupccC1AaZGoqg7ECy0OIEhfKaC3Ibi1z+ogpIAAQEgAOH1BQAAAAAXqRQ1RebjO4MsRwUPJNPuuTycA5SLx4cBBBYAFIXRNTfy4mVAWjTbr6nj3aAfuCMIAAAA";
//! let psbt = Psbt::from_str(base64)?;
//! assert_eq!(psbt.to_string(), base64);
//! assert_eq!(psbt.get_utxo_for(1).map(|txout| txout.value), Some(100_000_000));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;

use bitcoin::consensus::serialize;
use bitcoin::util::bip32::KeySource;
use bitcoin::util::psbt::{Input, Output};
use bitcoin::{Transaction, TxOut, Txid};

use crate::FeeRate;

/// Alias for the `rust-bitcoin` PSBT type
pub type Psbt = bitcoin::util::psbt::PartiallySignedTransaction;

/// Errors raised while merging or extracting a [`Psbt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsbtError {
    /// The two PSBTs being combined don't spend the same unsigned transaction
    UnexpectedUnsignedTx {
        /// Txid of the PSBT being combined into
        expected: Txid,
        /// Txid of the other PSBT
        actual: Txid,
    },
    /// At least one input has neither a final `scriptSig` nor a final witness
    IncompletePsbt,
}

impl fmt::Display for PsbtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedUnsignedTx { expected, actual } => write!(
                f,
                "Different unsigned transaction: expected {}, found {}",
                expected, actual
            ),
            Self::IncompletePsbt => write!(f, "Some inputs are not finalized"),
        }
    }
}

impl std::error::Error for PsbtError {}

// TODO upstream the functions here to `rust-bitcoin`?

/// Trait to add functions to extract utxos and calculate fees.
pub trait PsbtUtils {
    /// Get the `TxOut` for the specified input index, if it doesn't exist in the PSBT `None` is returned.
    fn get_utxo_for(&self, input_index: usize) -> Option<TxOut>;

    /// The total transaction fee amount, sum of input amounts minus sum of output amounts, in sats.
    /// If the PSBT is missing a TxOut for an input, or the outputs spend more than the inputs,
    /// returns None.
    fn fee_amount(&self) -> Option<u64>;

    /// The transaction's fee rate. This value will only be accurate if calculated AFTER the
    /// `PartiallySignedTransaction` is finalized and all witness/signature data is added to the
    /// transaction.
    /// If the PSBT is missing a TxOut for an input returns None.
    fn fee_rate(&self) -> Option<FeeRate>;

    /// Id of the unsigned transaction. It doesn't change as signatures are added.
    fn txid(&self) -> Txid;

    /// Merge `other` into `self`
    ///
    /// Both PSBTs must spend the same unsigned transaction. Key-value maps are unioned. When both
    /// sides carry a different value for the same field, the one with the smaller serialization
    /// is kept, so the result is the same whatever the order of the arguments, and combining a
    /// PSBT with itself is a no-op.
    fn combine_with(&mut self, other: Psbt) -> Result<(), PsbtError>;

    /// Build the network transaction out of a fully finalized PSBT
    fn extract_final_tx(&self) -> Result<Transaction, PsbtError>;
}

impl PsbtUtils for Psbt {
    fn get_utxo_for(&self, input_index: usize) -> Option<TxOut> {
        let tx = &self.unsigned_tx;
        let txin = tx.input.get(input_index)?;
        let input = self.inputs.get(input_index)?;

        if let Some(wit_utxo) = &input.witness_utxo {
            Some(wit_utxo.clone())
        } else if let Some(in_tx) = &input.non_witness_utxo {
            in_tx
                .output
                .get(txin.previous_output.vout as usize)
                .cloned()
        } else {
            None
        }
    }

    fn fee_amount(&self) -> Option<u64> {
        let tx = &self.unsigned_tx;
        let utxos: Option<Vec<TxOut>> = (0..tx.input.len()).map(|i| self.get_utxo_for(i)).collect();

        utxos.and_then(|inputs| {
            let input_amount: u64 = inputs.iter().map(|i| i.value).sum();
            let output_amount: u64 = tx.output.iter().map(|o| o.value).sum();
            input_amount.checked_sub(output_amount)
        })
    }

    fn fee_rate(&self) -> Option<FeeRate> {
        let fee_amount = self.fee_amount();
        fee_amount.map(|fee| {
            let weight = self.clone().extract_tx().weight();
            FeeRate::from_wu(fee, weight)
        })
    }

    fn txid(&self) -> Txid {
        self.unsigned_tx.txid()
    }

    fn combine_with(&mut self, other: Psbt) -> Result<(), PsbtError> {
        if self.unsigned_tx != other.unsigned_tx {
            return Err(PsbtError::UnexpectedUnsignedTx {
                expected: self.unsigned_tx.txid(),
                actual: other.unsigned_tx.txid(),
            });
        }

        self.version = self.version.max(other.version);
        merge_map(&mut self.xpub, other.xpub, encode_key_source);
        merge_map(&mut self.proprietary, other.proprietary, Clone::clone);
        merge_map(&mut self.unknown, other.unknown, Clone::clone);

        merge_vec(&mut self.inputs, other.inputs, combine_input);
        merge_vec(&mut self.outputs, other.outputs, combine_output);

        Ok(())
    }

    fn extract_final_tx(&self) -> Result<Transaction, PsbtError> {
        if self.inputs.len() != self.unsigned_tx.input.len() {
            return Err(PsbtError::IncompletePsbt);
        }

        let mut tx = self.unsigned_tx.clone();
        for (txin, input) in tx.input.iter_mut().zip(self.inputs.iter()) {
            if input.final_script_sig.is_none() && input.final_script_witness.is_none() {
                return Err(PsbtError::IncompletePsbt);
            }

            txin.script_sig = input.final_script_sig.clone().unwrap_or_default();
            txin.witness = input.final_script_witness.clone().unwrap_or_default();
        }

        Ok(tx)
    }
}

/// Combine two PSBTs, returning the merged copy
///
/// See [`PsbtUtils::combine_with`].
pub fn combine(mut a: Psbt, b: Psbt) -> Result<Psbt, PsbtError> {
    a.combine_with(b)?;
    Ok(a)
}

fn encode_key_source(source: &KeySource) -> Vec<u8> {
    let (fingerprint, path) = source;
    let mut bytes = fingerprint[..].to_vec();
    for child in path {
        bytes.extend_from_slice(&u32::from(*child).to_be_bytes());
    }
    bytes
}

// Picks the value with the smaller encoding, which makes the choice independent of the order.
fn pick<T, E: Fn(&T) -> Vec<u8>>(a: Option<T>, b: Option<T>, encode: E) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => {
            if encode(&b) < encode(&a) {
                Some(b)
            } else {
                Some(a)
            }
        }
        (a, b) => a.or(b),
    }
}

fn merge_map<K: Ord, V, E: Fn(&V) -> Vec<u8>>(
    into: &mut BTreeMap<K, V>,
    from: BTreeMap<K, V>,
    encode: E,
) {
    for (key, value) in from {
        let merged = pick(into.remove(&key), Some(value), &encode);
        if let Some(merged) = merged {
            into.insert(key, merged);
        }
    }
}

fn merge_vec<T, F: Fn(&mut T, T)>(into: &mut Vec<T>, from: Vec<T>, combine: F) {
    for (i, item) in from.into_iter().enumerate() {
        match into.get_mut(i) {
            Some(existing) => combine(existing, item),
            None => into.push(item),
        }
    }
}

fn combine_input(a: &mut Input, b: Input) {
    a.non_witness_utxo = pick(a.non_witness_utxo.take(), b.non_witness_utxo, serialize);
    a.witness_utxo = pick(a.witness_utxo.take(), b.witness_utxo, serialize);
    a.sighash_type = pick(a.sighash_type.take(), b.sighash_type, |s| {
        s.to_u32().to_be_bytes().to_vec()
    });
    a.redeem_script = pick(a.redeem_script.take(), b.redeem_script, |s| s.to_bytes());
    a.witness_script = pick(a.witness_script.take(), b.witness_script, |s| s.to_bytes());
    a.final_script_sig = pick(a.final_script_sig.take(), b.final_script_sig, |s| {
        s.to_bytes()
    });
    a.final_script_witness = pick(
        a.final_script_witness.take(),
        b.final_script_witness,
        serialize,
    );
    a.tap_key_sig = pick(a.tap_key_sig.take(), b.tap_key_sig, |s| s.to_vec());
    a.tap_internal_key = pick(a.tap_internal_key.take(), b.tap_internal_key, |k| {
        k.serialize().to_vec()
    });
    a.tap_merkle_root = pick(a.tap_merkle_root.take(), b.tap_merkle_root, |h| {
        h[..].to_vec()
    });

    merge_map(&mut a.partial_sigs, b.partial_sigs, |s| s.to_vec());
    merge_map(&mut a.bip32_derivation, b.bip32_derivation, encode_key_source);
    merge_map(&mut a.ripemd160_preimages, b.ripemd160_preimages, Clone::clone);
    merge_map(&mut a.sha256_preimages, b.sha256_preimages, Clone::clone);
    merge_map(&mut a.hash160_preimages, b.hash160_preimages, Clone::clone);
    merge_map(&mut a.hash256_preimages, b.hash256_preimages, Clone::clone);
    merge_map(&mut a.tap_script_sigs, b.tap_script_sigs, |s| s.to_vec());
    merge_map(&mut a.tap_scripts, b.tap_scripts, |(script, version)| {
        let mut bytes = script.to_bytes();
        bytes.push(version.to_consensus());
        bytes
    });
    merge_map(&mut a.tap_key_origins, b.tap_key_origins, encode_tap_origin);
    merge_map(&mut a.proprietary, b.proprietary, Clone::clone);
    merge_map(&mut a.unknown, b.unknown, Clone::clone);
}

fn combine_output(a: &mut Output, b: Output) {
    a.redeem_script = pick(a.redeem_script.take(), b.redeem_script, |s| s.to_bytes());
    a.witness_script = pick(a.witness_script.take(), b.witness_script, |s| s.to_bytes());
    a.tap_internal_key = pick(a.tap_internal_key.take(), b.tap_internal_key, |k| {
        k.serialize().to_vec()
    });
    // trees are compared through their debug form, there's no public encoder for them
    a.tap_tree = pick(a.tap_tree.take(), b.tap_tree, |t| {
        format!("{:?}", t).into_bytes()
    });

    merge_map(&mut a.bip32_derivation, b.bip32_derivation, encode_key_source);
    merge_map(&mut a.tap_key_origins, b.tap_key_origins, encode_tap_origin);
    merge_map(&mut a.proprietary, b.proprietary, Clone::clone);
    merge_map(&mut a.unknown, b.unknown, Clone::clone);
}

fn encode_tap_origin(
    (leaves, source): &(Vec<bitcoin::util::taproot::TapLeafHash>, KeySource),
) -> Vec<u8> {
    let mut bytes = Vec::new();
    for leaf in leaves {
        bytes.extend_from_slice(&leaf[..]);
    }
    bytes.extend(encode_key_source(source));
    bytes
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::hashes::hex::FromHex;
    use bitcoin::util::bip32::{DerivationPath, Fingerprint};
    use bitcoin::util::psbt::PsbtSighashType;
    use bitcoin::{EcdsaSighashType, PackedLockTime, Script, TxIn, Witness};

    use super::*;

    // from bip 174
    const PSBT_STR: &str = "cHNidP8BAKACAAAAAqsJSaCMWvfEm4IS9Bfi8Vqz9cM9zxU4IagTn4d6W3vkAAAAAAD+////qwlJoIxa98SbghL0F+LxWrP1wz3PFTghqBOfh3pbe+QBAAAAAP7///8CYDvqCwAAAAAZdqkUdopAu9dAy+gdmI5x3ipNXHE5ax2IrI4kAAAAAAAAGXapFG9GILVT+glechue4O/p+gOcykWXiKwAAAAAAAEHakcwRAIgR1lmF5fAGwNrJZKJSGhiGDR9iYZLcZ4ff89X0eURZYcCIFMJ6r9Wqk2Ikf/REf3xM286KdqGbX+EhtdVRs7tr5MZASEDXNxh/HupccC1AaZGoqg7ECy0OIEhfKaC3Ibi1z+ogpIAAQEgAOH1BQAAAAAXqRQ1RebjO4MsRwUPJNPuuTycA5SLx4cBBBYAFIXRNTfy4mVAWjTbr6nj3aAfuCMIAAAA";

    fn unsigned_psbt() -> Psbt {
        let tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn::default(), TxIn::default()],
            output: vec![TxOut {
                value: 10_000,
                script_pubkey: Script::new(),
            }],
        };
        Psbt::from_unsigned_tx(tx).unwrap()
    }

    fn key_source(fingerprint: &str, path: &str) -> KeySource {
        (
            Fingerprint::from_str(fingerprint).unwrap(),
            DerivationPath::from_str(path).unwrap(),
        )
    }

    fn pubkey(i: u8) -> bitcoin::secp256k1::PublicKey {
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let secret = bitcoin::secp256k1::SecretKey::from_slice(&[i; 32]).unwrap();
        bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &secret)
    }

    #[test]
    fn test_psbt_base64_roundtrip() {
        let psbt = Psbt::from_str(PSBT_STR).unwrap();
        assert_eq!(psbt.to_string(), PSBT_STR);
    }

    #[test]
    fn test_get_utxo_for_out_of_range() {
        let psbt = Psbt::from_str(PSBT_STR).unwrap();
        assert!(psbt.get_utxo_for(psbt.unsigned_tx.input.len()).is_none());
        assert_eq!(psbt.get_utxo_for(1).unwrap().value, 100_000_000);
        // the first input only carries a final scriptSig
        assert!(psbt.get_utxo_for(0).is_none());
        assert!(psbt.fee_amount().is_none());
        assert!(psbt.fee_rate().is_none());
    }

    #[test]
    fn test_fee_amount_outputs_exceed_inputs() {
        let mut psbt = unsigned_psbt();
        for input in &mut psbt.inputs {
            input.witness_utxo = Some(TxOut {
                value: 1_000,
                script_pubkey: Script::new(),
            });
        }
        assert!(psbt.fee_amount().is_none());

        psbt.inputs[0].witness_utxo.as_mut().unwrap().value = 9_500;
        assert_eq!(psbt.fee_amount(), Some(500));
        assert!(psbt.fee_rate().is_some());
    }

    #[test]
    fn test_combine_different_tx() {
        let mut a = unsigned_psbt();
        let mut b = unsigned_psbt();
        b.unsigned_tx.output[0].value = 9_000;
        let b_txid = b.unsigned_tx.txid();

        let res = a.combine_with(b);
        assert_eq!(
            res,
            Err(PsbtError::UnexpectedUnsignedTx {
                expected: a.unsigned_tx.txid(),
                actual: b_txid,
            })
        );
    }

    #[test]
    fn test_combine_is_commutative_and_idempotent() {
        let mut a = unsigned_psbt();
        let mut b = unsigned_psbt();

        a.inputs[0]
            .bip32_derivation
            .insert(pubkey(1), key_source("d34db33f", "m/84'/1'/0'/0/0"));
        b.inputs[0]
            .bip32_derivation
            .insert(pubkey(2), key_source("f00dbabe", "m/84'/1'/0'/0/1"));
        // conflicting singletons
        a.inputs[1].redeem_script = Some(Script::from(vec![0x51, 0x52]));
        b.inputs[1].redeem_script = Some(Script::from(vec![0x51]));
        a.inputs[1].sighash_type = Some(PsbtSighashType::from(EcdsaSighashType::All));
        b.inputs[1].sighash_type = Some(PsbtSighashType::from(EcdsaSighashType::None));
        b.inputs[0].final_script_witness = Some(Witness::from_vec(vec![vec![0x01]]));
        a.outputs[0]
            .bip32_derivation
            .insert(pubkey(3), key_source("d34db33f", "m/0"));

        let ab = combine(a.clone(), b.clone()).unwrap();
        let ba = combine(b.clone(), a.clone()).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.to_string(), ba.to_string());

        assert_eq!(ab.inputs[0].bip32_derivation.len(), 2);
        assert_eq!(ab.inputs[1].redeem_script, Some(Script::from(vec![0x51])));
        assert_eq!(
            ab.inputs[1].sighash_type,
            Some(PsbtSighashType::from(EcdsaSighashType::All))
        );
        assert!(ab.inputs[0].final_script_witness.is_some());
        assert_eq!(ab.outputs[0].bip32_derivation.len(), 1);

        assert_eq!(combine(a.clone(), a.clone()).unwrap(), a);
        assert_eq!(combine(ab.clone(), ab.clone()).unwrap(), ab);
        assert_eq!(combine(ab.clone(), a).unwrap(), ab);
    }

    #[test]
    fn test_combine_is_associative() {
        let base = unsigned_psbt();
        let mut a = base.clone();
        let mut b = base.clone();
        let mut c = base;

        a.inputs[0].witness_script = Some(Script::from(vec![0x52, 0x52]));
        b.inputs[0].witness_script = Some(Script::from(vec![0x53]));
        c.inputs[0].witness_script = Some(Script::from(vec![0x51, 0x51, 0x51]));
        c.unknown.insert(
            bitcoin::util::psbt::raw::Key {
                type_value: 0xfc,
                key: vec![0x01],
            },
            vec![0xff],
        );

        let left = combine(combine(a.clone(), b.clone()).unwrap(), c.clone()).unwrap();
        let right = combine(a, combine(b, c).unwrap()).unwrap();
        assert_eq!(left, right);
        assert_eq!(left.inputs[0].witness_script, Some(Script::from(vec![0x53])));
        assert_eq!(left.unknown.len(), 1);
    }

    #[test]
    fn test_extract_incomplete() {
        let mut psbt = unsigned_psbt();
        assert_eq!(psbt.extract_final_tx(), Err(PsbtError::IncompletePsbt));

        psbt.inputs[0].final_script_sig = Some(Script::from(Vec::from_hex("0001").unwrap()));
        assert_eq!(psbt.extract_final_tx(), Err(PsbtError::IncompletePsbt));

        psbt.inputs[1].final_script_witness = Some(Witness::from_vec(vec![vec![0xAA; 72]]));
        let tx = psbt.extract_final_tx().unwrap();
        assert_eq!(tx.input[0].script_sig.as_bytes(), &[0x00, 0x01]);
        assert_eq!(tx.input[1].witness.len(), 1);
        // the txid doesn't change once signatures are attached
        assert_eq!(tx.txid(), psbt.txid());
    }
}
