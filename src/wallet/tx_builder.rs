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


//! Transaction builder
//!
//! A [`TxBuilder`] collects the recipients and options of a new transaction, or of a fee bump,
//! and turns them into a PSBT with [`TxBuilder::finish`].
//!
//! ```
//! # use std::str::FromStr;
//! # use bitcoin::*;
//! # use bdk_engine::*;
//! # let to_address = Address::from_str("2N4eQYCbKUHCCTUjBJeHcJp9ok6J2GZsTDt").unwrap();
//! # let wallet = Wallet::new(
//! #     "wpkh(tpubD6NzVbkrYhZ4Xferm7Pz4VnjdcDPFyjVu5K4iZXQ4pVN8Cks4pHVowTBXBKRhX64pkRyJZJN5xAKj4UDNnLPb5p2sSKXhewoYx5GbTdUFWq/*)",
//! #     None,
//! #     Network::Testnet,
//! #     database::MemoryDatabase::new(),
//! # )?;
//! let mut builder = wallet.build_tx();
//! builder
//!     .add_recipient(to_address.script_pubkey(), 50_000)
//!     .fee_rate(FeeRate::from_sat_per_vb(5.0))
//!     .do_not_spend_change()
//!     .enable_rbf();
//! // nothing to spend until the wallet is synced
//! assert!(builder.finish().is_err());
//! # Ok::<(), bdk_engine::Error>(())
//! ```

use std::collections::HashSet;
use std::marker::PhantomData;

use bitcoin::util::psbt::{self, PartiallySignedTransaction as Psbt};
use bitcoin::{OutPoint, Script, Sequence, Transaction};
use rand::seq::SliceRandom;

use super::coin_selection::{CoinSelectionAlgorithm, DefaultCoinSelectionAlgorithm};
use super::Wallet;
use crate::database::BatchDatabase;
use crate::descriptor::DescriptorMeta;
use crate::error::Error;
use crate::types::{FeeRate, KeychainKind, LocalUtxo, TransactionDetails, WeightedUtxo};

/// What a [`TxBuilder`] is building
pub trait TxBuilderContext: std::fmt::Debug + Default + Clone {}

/// A new transaction, from [`Wallet::build_tx`]
#[derive(Debug, Default, Clone)]
pub struct CreateTx;
impl TxBuilderContext for CreateTx {}

/// A replacement of a wallet transaction, from [`Wallet::build_fee_bump`]
#[derive(Debug, Default, Clone)]
pub struct BumpFee;
impl TxBuilderContext for BumpFee {}

/// A transaction builder
///
/// Options are set through `&mut self` methods that return the builder, so they can be chained or
/// called one at a time:
///
/// ```
/// # use bdk_engine::*;
/// # use bdk_engine::wallet::tx_builder::*;
/// # use bitcoin::*;
/// # use std::str::FromStr;
/// # let wallet = Wallet::new(
/// #     "wpkh(tpubD6NzVbkrYhZ4Xferm7Pz4VnjdcDPFyjVu5K4iZXQ4pVN8Cks4pHVowTBXBKRhX64pkRyJZJN5xAKj4UDNnLPb5p2sSKXhewoYx5GbTdUFWq/*)",
/// #     None,
/// #     Network::Testnet,
/// #     database::MemoryDatabase::new(),
/// # )?;
/// # let first = Address::from_str("2N4eQYCbKUHCCTUjBJeHcJp9ok6J2GZsTDt").unwrap();
/// # let second = first.clone();
/// let mut builder = wallet.build_tx();
/// builder
///     .ordering(TxOrdering::Untouched)
///     .add_recipient(first.script_pubkey(), 50_000);
/// builder.add_recipient(second.script_pubkey(), 50_000);
/// # Ok::<(), bdk_engine::Error>(())
/// ```
///
/// [`coin_selection`](Self::coin_selection) takes the builder by value, call it first.
#[derive(Debug)]
pub struct TxBuilder<'a, D, Cs, Ctx> {
    pub(crate) wallet: &'a Wallet<D>,
    pub(crate) params: TxParams,
    pub(crate) coin_selection: Cs,
    pub(crate) phantom: PhantomData<Ctx>,
}

/// Everything a builder collects except the coin selection algorithm
#[derive(Default, Debug, Clone)]
pub(crate) struct TxParams {
    pub(crate) recipients: Vec<(Script, u64)>,
    pub(crate) drain_wallet: bool,
    pub(crate) drain_to: Option<Script>,
    pub(crate) fee_rate: Option<FeeRate>,
    pub(crate) fee_absolute: Option<u64>,
    pub(crate) utxos: Vec<WeightedUtxo>,
    pub(crate) unspendable: HashSet<OutPoint>,
    pub(crate) manually_selected_only: bool,
    pub(crate) sighash: Option<psbt::PsbtSighashType>,
    pub(crate) ordering: TxOrdering,
    pub(crate) locktime: Option<u32>,
    pub(crate) rbf: Option<RbfValue>,
    pub(crate) version: Option<Version>,
    pub(crate) change_policy: ChangeSpendPolicy,
    pub(crate) only_witness_utxo: bool,
    pub(crate) add_global_xpubs: bool,
    pub(crate) include_output_redeem_witness_script: bool,
    pub(crate) bumping_fee: Option<PreviousFee>,
    // value of the change output of the transaction being replaced, `drain_to` pays to it
    pub(crate) original_change: Option<u64>,
    pub(crate) current_height: Option<u32>,
    pub(crate) allow_dust: bool,
}

impl TxParams {
    /// Resolve the fee settings, a rate and an amount can't be set together
    pub(crate) fn fee_policy(&self) -> Result<FeePolicy, Error> {
        match (self.fee_rate, self.fee_absolute) {
            (Some(_), Some(_)) => Err(Error::ConflictingFeePolicy),
            (None, Some(amount)) => Ok(FeePolicy::FeeAmount(amount)),
            (Some(rate), None) => Ok(FeePolicy::FeeRate(rate)),
            (None, None) => Ok(FeePolicy::default()),
        }
    }

    /// Give up the output paying to `script_pubkey` as the one absorbing the fee increase
    fn shrink_output(&mut self, script_pubkey: Script) -> Result<(), Error> {
        let position = self
            .recipients
            .iter()
            .position(|(script, _)| *script == script_pubkey)
            .ok_or(Error::ScriptNotFound)?;
        self.recipients.remove(position);

        // the old change output is kept as a plain recipient with its value
        if let (Some(change), Some(value)) = (self.drain_to.take(), self.original_change.take()) {
            self.recipients.push((change, value));
        }
        self.drain_to = Some(script_pubkey);
        Ok(())
    }
}

/// Fee paid by the transaction being replaced
#[derive(Clone, Copy, Debug)]
pub(crate) struct PreviousFee {
    pub absolute: u64,
    pub rate: f32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum FeePolicy {
    FeeRate(FeeRate),
    FeeAmount(u64),
}

impl Default for FeePolicy {
    fn default() -> Self {
        FeePolicy::FeeRate(FeeRate::default_min_relay_fee())
    }
}

impl<'a, D, Cs: Clone, Ctx> Clone for TxBuilder<'a, D, Cs, Ctx> {
    fn clone(&self) -> Self {
        TxBuilder {
            wallet: self.wallet,
            params: self.params.clone(),
            coin_selection: self.coin_selection.clone(),
            phantom: PhantomData,
        }
    }
}

impl<'a, D: BatchDatabase, Cs: CoinSelectionAlgorithm<D>, Ctx: TxBuilderContext>
    TxBuilder<'a, D, Cs, Ctx>
{
    /// Pay `fee_rate`, can't be combined with [`fee_absolute`](Self::fee_absolute)
    pub fn fee_rate(&mut self, fee_rate: FeeRate) -> &mut Self {
        self.params.fee_rate = Some(fee_rate);
        self
    }

    /// Pay exactly `fee_amount` satoshi, can't be combined with [`fee_rate`](Self::fee_rate)
    pub fn fee_absolute(&mut self, fee_amount: u64) -> &mut Self {
        self.params.fee_absolute = Some(fee_amount);
        self
    }

    /// Spend all of `outpoints`
    ///
    /// Each one must be an unspent output of the wallet, otherwise nothing is added and
    /// [`Error::UnavailableUtxo`] is returned. Outpoints added here are spent even when they are
    /// also marked [unspendable](Self::add_unspendable).
    pub fn add_utxos(&mut self, outpoints: &[OutPoint]) -> Result<&mut Self, Error> {
        let mut utxos = Vec::with_capacity(outpoints.len());
        for outpoint in outpoints {
            match self.wallet.get_utxo(*outpoint)? {
                Some(utxo) if !utxo.is_spent => utxos.push(utxo),
                _ => return Err(Error::UnavailableUtxo(*outpoint)),
            }
        }

        for utxo in utxos {
            let known = self.params.utxos.iter();
            if known.map(|wu| wu.utxo.outpoint).any(|o| o == utxo.outpoint) {
                continue;
            }

            self.params.utxos.push(WeightedUtxo {
                satisfaction_weight: self.wallet.satisfaction_weight(utxo.keychain)?,
                utxo,
            });
        }

        Ok(self)
    }

    /// Spend `outpoint`, see [`add_utxos`](Self::add_utxos)
    pub fn add_utxo(&mut self, outpoint: OutPoint) -> Result<&mut Self, Error> {
        self.add_utxos(&[outpoint])
    }

    /// Spend nothing but the UTXOs given to [`add_utxo`](Self::add_utxo), even if they don't
    /// cover the outputs
    pub fn manually_selected_only(&mut self) -> &mut Self {
        self.params.manually_selected_only = true;
        self
    }

    /// Never spend any of `unspendable`, replacing the outpoints set before
    pub fn unspendable(&mut self, unspendable: Vec<OutPoint>) -> &mut Self {
        self.params.unspendable = unspendable.into_iter().collect();
        self
    }

    /// Never spend `unspendable`
    pub fn add_unspendable(&mut self, unspendable: OutPoint) -> &mut Self {
        self.params.unspendable.insert(unspendable);
        self
    }

    /// Sighash type requested from the signers
    ///
    /// Anything other than `SIGHASH_ALL` lets others alter the transaction after signing.
    pub fn sighash(&mut self, sighash: psbt::PsbtSighashType) -> &mut Self {
        self.params.sighash = Some(sighash);
        self
    }

    /// Order of inputs and outputs, shuffled by default
    pub fn ordering(&mut self, ordering: TxOrdering) -> &mut Self {
        self.params.ordering = ordering;
        self
    }

    /// Use `locktime` as nLockTime instead of the current height
    ///
    /// It must not be lower than an `after()` requirement of the descriptors.
    pub fn nlocktime(&mut self, locktime: u32) -> &mut Self {
        self.params.locktime = Some(locktime);
        self
    }

    /// Transaction version, at least 2 when the descriptors use `older()`
    pub fn version(&mut self, version: i32) -> &mut Self {
        self.params.version = Some(Version(version));
        self
    }

    /// Leave the outputs of the internal keychain alone
    pub fn do_not_spend_change(&mut self) -> &mut Self {
        self.params.change_policy = ChangeSpendPolicy::ChangeForbidden;
        self
    }

    /// Spend nothing but outputs of the internal keychain
    pub fn only_spend_change(&mut self) -> &mut Self {
        self.params.change_policy = ChangeSpendPolicy::OnlyChange;
        self
    }

    /// Restrict which keychains coin selection spends from
    pub fn change_policy(&mut self, change_policy: ChangeSpendPolicy) -> &mut Self {
        self.params.change_policy = change_policy;
        self
    }

    /// Skip `non_witness_utxo` on segwit inputs, which makes the PSBT smaller but isn't accepted
    /// by every signer
    pub fn only_witness_utxo(&mut self) -> &mut Self {
        self.params.only_witness_utxo = true;
        self
    }

    /// Keep the redeem and witness scripts on the outputs of the PSBT
    pub fn include_output_redeem_witness_script(&mut self) -> &mut Self {
        self.params.include_output_redeem_witness_script = true;
        self
    }

    /// List the extended keys of both descriptors in the global xpub map of the PSBT
    ///
    /// Every key must be a master key or carry its origin, otherwise [`finish`](Self::finish)
    /// fails with [`Error::MissingKeyOrigin`].
    pub fn add_global_xpubs(&mut self) -> &mut Self {
        self.params.add_global_xpubs = true;
        self
    }

    /// Spend every UTXO that the unspendable list and the change policy allow
    pub fn drain_wallet(&mut self) -> &mut Self {
        self.params.drain_wallet = true;
        self
    }

    /// Swap the coin selection algorithm, by default [`DefaultCoinSelectionAlgorithm`]
    pub fn coin_selection<P: CoinSelectionAlgorithm<D>>(
        self,
        coin_selection: P,
    ) -> TxBuilder<'a, D, P, Ctx> {
        TxBuilder {
            wallet: self.wallet,
            params: self.params,
            coin_selection,
            phantom: PhantomData,
        }
    }

    /// Build the unsigned PSBT and the details of its transaction
    ///
    /// A change address is only revealed when the transaction ends up with a change output.
    pub fn finish(self) -> Result<(Psbt, TransactionDetails), Error> {
        self.wallet.create_tx(self.coin_selection, self.params)
    }

    /// Signal replaceability with nSequence `0xFFFFFFFD`
    pub fn enable_rbf(&mut self) -> &mut Self {
        self.params.rbf = Some(RbfValue::Default);
        self
    }

    /// Signal replaceability with `nsequence`
    ///
    /// [`finish`](Self::finish) rejects `0xFFFFFFFF`, as well as values below an `older()`
    /// requirement of the descriptors, with [`Error::InvalidSequence`].
    pub fn enable_rbf_with_sequence(&mut self, nsequence: Sequence) -> &mut Self {
        self.params.rbf = Some(RbfValue::Value(nsequence));
        self
    }

    /// Height of the chain tip, instead of the one of the last sync
    ///
    /// It's the default nLockTime and decides which coinbase outputs are mature. Immature ones
    /// can still be spent through [`add_utxos`](Self::add_utxos).
    pub fn current_height(&mut self, height: u32) -> &mut Self {
        self.params.current_height = Some(height);
        self
    }

    /// Accept recipients below the dust limit, the transaction may not be relayed
    pub fn allow_dust(&mut self, allow_dust: bool) -> &mut Self {
        self.params.allow_dust = allow_dust;
        self
    }
}

impl<'a, D: BatchDatabase, Cs: CoinSelectionAlgorithm<D>> TxBuilder<'a, D, Cs, CreateTx> {
    /// Replace all the recipients
    pub fn set_recipients(&mut self, recipients: Vec<(Script, u64)>) -> &mut Self {
        self.params.recipients = recipients;
        self
    }

    /// Pay `amount` satoshi to `script_pubkey`
    pub fn add_recipient(&mut self, script_pubkey: Script, amount: u64) -> &mut Self {
        self.params.recipients.push((script_pubkey, amount));
        self
    }

    /// Add a zero value `OP_RETURN` output carrying `data`
    pub fn add_data(&mut self, data: &[u8]) -> &mut Self {
        self.add_recipient(Script::new_op_return(data), 0)
    }

    /// Send the leftover to `script_pubkey` instead of a change address
    ///
    /// Like change, the output is dropped when it would be dust. With no recipient at all the
    /// transaction needs UTXOs from [`add_utxos`](Self::add_utxos) or
    /// [`drain_wallet`](Self::drain_wallet), otherwise [`finish`](Self::finish) fails with
    /// [`Error::NoUtxosSelected`].
    pub fn drain_to(&mut self, script_pubkey: Script) -> &mut Self {
        self.params.drain_to = Some(script_pubkey);
        self
    }
}

impl<'a, D: BatchDatabase> TxBuilder<'a, D, DefaultCoinSelectionAlgorithm, BumpFee> {
    /// Take the extra fee out of the output paying to `script_pubkey`
    ///
    /// By default the change output pays for the bump. Once this is called the change output
    /// keeps its value, and the shrunk output disappears if it drops below dust.
    ///
    /// Fails with [`Error::ScriptNotFound`] when no recipient of the replaced transaction pays to
    /// `script_pubkey`.
    pub fn allow_shrinking(&mut self, script_pubkey: Script) -> Result<&mut Self, Error> {
        self.params.shrink_output(script_pubkey)?;
        Ok(self)
    }
}

/// Order of the inputs and outputs
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Clone, Copy)]
pub enum TxOrdering {
    /// Random, the default
    Shuffle,
    /// As built
    Untouched,
    /// BIP69
    Bip69Lexicographic,
}

impl Default for TxOrdering {
    fn default() -> Self {
        TxOrdering::Shuffle
    }
}

impl TxOrdering {
    /// Reorder the inputs and outputs of `tx`
    pub fn sort_tx(&self, tx: &mut Transaction) {
        match self {
            TxOrdering::Untouched => {}
            TxOrdering::Shuffle => {
                let mut rng = rand::thread_rng();
                tx.input.shuffle(&mut rng);
                tx.output.shuffle(&mut rng);
            }
            TxOrdering::Bip69Lexicographic => {
                tx.input.sort_unstable_by_key(|txin| txin.previous_output);
                tx.output.sort_unstable_by(|a, b| {
                    (a.value, &a.script_pubkey).cmp(&(b.value, &b.script_pubkey))
                });
            }
        }
    }
}

/// nVersion, 1 unless the builder asks otherwise
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Clone, Copy)]
pub(crate) struct Version(pub(crate) i32);

impl Default for Version {
    fn default() -> Self {
        Version(1)
    }
}

#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Clone, Copy)]
pub(crate) enum RbfValue {
    Default,
    Value(Sequence),
}

impl RbfValue {
    pub(crate) fn get_value(&self) -> Sequence {
        match self {
            RbfValue::Default => Sequence::ENABLE_RBF_NO_LOCKTIME,
            RbfValue::Value(v) => *v,
        }
    }
}

/// Which keychains coin selection may spend from
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Clone, Copy)]
pub enum ChangeSpendPolicy {
    /// Both, the default
    ChangeAllowed,
    /// Internal only
    OnlyChange,
    /// External only
    ChangeForbidden,
}

impl Default for ChangeSpendPolicy {
    fn default() -> Self {
        ChangeSpendPolicy::ChangeAllowed
    }
}

impl ChangeSpendPolicy {
    pub(crate) fn is_satisfied_by(&self, utxo: &LocalUtxo) -> bool {
        match self {
            ChangeSpendPolicy::ChangeAllowed => true,
            ChangeSpendPolicy::OnlyChange => utxo.keychain == KeychainKind::Internal,
            ChangeSpendPolicy::ChangeForbidden => utxo.keychain == KeychainKind::External,
        }
    }
}

impl<D: BatchDatabase> Wallet<D> {
    /// Weight of the witness and `scriptSig` needed to spend an output of `keychain`
    pub(crate) fn satisfaction_weight(&self, keychain: KeychainKind) -> Result<usize, Error> {
        Ok(self
            .get_descriptor_for_keychain(keychain)
            .max_satisfaction_weight()?)
    }

    fn descriptors(&self) -> impl Iterator<Item = &crate::descriptor::ExtendedDescriptor> {
        std::iter::once(&self.descriptor).chain(self.change_descriptor.as_ref())
    }

    /// Largest relative timelock required by the descriptors
    pub(crate) fn csv_requirement(&self) -> Option<Sequence> {
        self.descriptors().filter_map(|d| d.csv_requirement()).max()
    }

    /// Largest absolute timelock required by the descriptors
    pub(crate) fn timelock_requirement(&self) -> Option<u32> {
        self.descriptors()
            .filter_map(|d| d.timelock_requirement())
            .max()
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use assert_matches::assert_matches;
    use bitcoin::hashes::Hash;
    use bitcoin::{Network, PackedLockTime, TxIn, TxOut, Txid};

    use super::*;
    use crate::database::MemoryDatabase;

    fn outpoint(byte: u8, vout: u32) -> OutPoint {
        OutPoint::new(Txid::from_inner([byte; 32]), vout)
    }

    fn output(value: u64, script: &[u8]) -> TxOut {
        TxOut {
            value,
            script_pubkey: Script::from(script.to_vec()),
        }
    }

    fn unordered_tx() -> Transaction {
        Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![outpoint(0xbb, 1), outpoint(0xaa, 5), outpoint(0xbb, 0)]
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    ..Default::default()
                })
                .collect(),
            output: vec![
                output(1_000, &[0xaa, 0xee]),
                output(1_000, &[0xaa]),
                output(800, &[0xff]),
            ],
        }
    }

    #[test]
    fn test_ordering_untouched() {
        let mut tx = unordered_tx();
        TxOrdering::Untouched.sort_tx(&mut tx);
        assert_eq!(tx, unordered_tx());
        assert_eq!(TxOrdering::default(), TxOrdering::Shuffle);
    }

    #[test]
    fn test_ordering_shuffle() {
        let original = unordered_tx();
        let mut tx = original.clone();

        let inputs_moved = (0..40).any(|_| {
            TxOrdering::Shuffle.sort_tx(&mut tx);
            tx.input != original.input
        });
        let outputs_moved = (0..40).any(|_| {
            TxOrdering::Shuffle.sort_tx(&mut tx);
            tx.output != original.output
        });
        assert!(inputs_moved && outputs_moved);

        let sorted = |mut outpoints: Vec<OutPoint>| {
            outpoints.sort();
            outpoints
        };
        assert_eq!(
            sorted(tx.input.iter().map(|i| i.previous_output).collect()),
            sorted(original.input.iter().map(|i| i.previous_output).collect())
        );
    }

    #[test]
    fn test_ordering_bip69() {
        let mut tx = unordered_tx();
        TxOrdering::Bip69Lexicographic.sort_tx(&mut tx);

        let inputs: Vec<_> = tx.input.iter().map(|i| i.previous_output).collect();
        assert_eq!(
            inputs,
            vec![outpoint(0xaa, 5), outpoint(0xbb, 0), outpoint(0xbb, 1)]
        );
        let outputs: Vec<_> = tx.output.iter().map(|o| o.value).collect();
        assert_eq!(outputs, vec![800, 1_000, 1_000]);
        assert_eq!(tx.output[1].script_pubkey, Script::from(vec![0xaa]));
    }

    #[test]
    fn test_change_spend_policy() {
        let utxos: Vec<_> = vec![KeychainKind::External, KeychainKind::Internal]
            .into_iter()
            .enumerate()
            .map(|(vout, keychain)| LocalUtxo {
                outpoint: outpoint(0, vout as u32),
                txout: TxOut::default(),
                keychain,
                is_spent: false,
            })
            .collect();
        let allowed = |policy: ChangeSpendPolicy| -> Vec<KeychainKind> {
            utxos
                .iter()
                .filter(|u| policy.is_satisfied_by(u))
                .map(|u| u.keychain)
                .collect()
        };

        assert_eq!(
            allowed(ChangeSpendPolicy::default()),
            vec![KeychainKind::External, KeychainKind::Internal]
        );
        assert_eq!(
            allowed(ChangeSpendPolicy::ChangeForbidden),
            vec![KeychainKind::External]
        );
        assert_eq!(
            allowed(ChangeSpendPolicy::OnlyChange),
            vec![KeychainKind::Internal]
        );
    }

    #[test]
    fn test_version_and_rbf_defaults() {
        assert_eq!(Version::default(), Version(1));
        assert_eq!(RbfValue::Default.get_value(), Sequence(0xFFFFFFFD));
        assert_eq!(
            RbfValue::Value(Sequence(0xFFFFFFFE)).get_value(),
            Sequence(0xFFFFFFFE)
        );
    }

    #[test]
    fn test_fee_policy_conflict() {
        let mut params = TxParams::default();
        assert_matches!(
            params.fee_policy(),
            Ok(FeePolicy::FeeRate(rate)) if rate == FeeRate::default_min_relay_fee()
        );

        params.fee_absolute = Some(1_000);
        assert_matches!(params.fee_policy(), Ok(FeePolicy::FeeAmount(1_000)));

        params.fee_rate = Some(FeeRate::from_sat_per_vb(2.0));
        assert_matches!(params.fee_policy(), Err(Error::ConflictingFeePolicy));
    }

    #[test]
    fn test_shrink_output_keeps_change_value() {
        let recipient = Script::from(vec![0xaa]);
        let change = Script::from(vec![0xcc]);
        let mut params = TxParams {
            recipients: vec![(recipient.clone(), 25_000)],
            drain_to: Some(change.clone()),
            original_change: Some(24_000),
            ..Default::default()
        };

        params.shrink_output(recipient.clone()).unwrap();
        assert_eq!(params.recipients, vec![(change, 24_000)]);
        assert_eq!(params.drain_to, Some(recipient));
        assert_eq!(params.original_change, None);
    }

    #[test]
    fn test_shrink_unknown_output() {
        let mut params = TxParams {
            recipients: vec![(Script::from(vec![0xaa]), 25_000)],
            ..Default::default()
        };
        assert_matches!(
            params.shrink_output(Script::from(vec![0xbb])),
            Err(Error::ScriptNotFound)
        );
        assert_eq!(params.recipients.len(), 1);
        assert_eq!(params.drain_to, None);
    }

    #[test]
    fn test_add_unknown_utxo() {
        let wallet = Wallet::new(
            "wpkh(cVpPVruEDdmutPzisEsYvtST1usBR3ntr8pXSyt6D2YYqXRyPcFW)",
            None,
            Network::Regtest,
            MemoryDatabase::new(),
        )
        .unwrap();
        let unknown = OutPoint::from_str(
            "0e53ec5dfb2cb8a71fec32dc9a634a35b7e24799295ddd5278217822e0b31f57:5",
        )
        .unwrap();

        let mut builder = wallet.build_tx();
        assert_matches!(
            builder.add_utxo(unknown),
            Err(Error::UnavailableUtxo(o)) if o == unknown
        );
        assert!(builder.params.utxos.is_empty());
    }
}
