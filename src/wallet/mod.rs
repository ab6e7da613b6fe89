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

//! Wallet
//!
//! This module defines the [`Wallet`] structure.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, TryLockError};

use bitcoin::secp256k1::Secp256k1;
use bitcoin::util::bip32::{ChildNumber, ExtendedPubKey, KeySource};
use bitcoin::util::psbt::{self, PartiallySignedTransaction as Psbt};
use bitcoin::{
    Address, EcdsaSighashType, Network, OutPoint, PackedLockTime, Script, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};

use miniscript::psbt::{PsbtExt, PsbtInputExt, PsbtInputSatisfier};

#[allow(unused_imports)]
use log::{debug, error, info, trace};

pub mod coin_selection;
pub mod signer;
pub mod tx_builder;
pub(crate) mod utils;


pub use utils::IsDust;

use coin_selection::{CoinSelectionAlgorithm, DefaultCoinSelectionAlgorithm, Excess};
use signer::{SignOptions, SignerError, SignerOrdering, SignersContainer, TransactionSigner};
use tx_builder::{BumpFee, ChangeSpendPolicy, CreateTx, FeePolicy, TxBuilder, TxParams};
use utils::{check_nsequence_rbf, ChainHeights, SecpCtx, COINBASE_MATURITY};

use crate::blockchain::script_sync::{self, KeychainScan, Snapshot};
use crate::blockchain::{Blockchain, NoopProgress, Progress};
use crate::database::{BatchDatabase, BatchOperations, DatabaseUtils};
use crate::descriptor::{
    into_wallet_descriptor_checked, DerivedDescriptor, DescriptorMeta, ExtendedDescriptor,
    IntoWalletDescriptor,
};
use crate::error::{Error, MiniscriptPsbtError};
use crate::psbt::PsbtUtils;
use crate::types::*;

const CACHE_ADDR_BATCH_SIZE: u32 = 100;

// first hardened child index, wildcards stop right before it
const HARDENED_INDEX: u32 = 1 << 31;

// nLockTime values below this are block heights, the others are unix timestamps
const LOCK_TIME_THRESHOLD: u32 = 500_000_000;

/// A Bitcoin wallet
///
/// The `Wallet` struct acts as a way of coherently interfacing with output descriptors and related transactions.
/// Its main components are:
///
/// 1. output *descriptors* from which it can derive addresses.
/// 2. A [`Database`] where it tracks transactions and utxos related to the descriptors.
/// 3. [`signer`]s that can contribute signatures to addresses instantiated from the descriptors.
///
/// The database sits behind a lock: every method takes `&self`, so a wallet can be shared between
/// threads while a [`sync`](Self::sync) is running.
///
/// [`Database`]: crate::database::Database
/// [`signer`]: crate::wallet::signer
#[derive(Debug)]
pub struct Wallet<D> {
    descriptor: ExtendedDescriptor,
    change_descriptor: Option<ExtendedDescriptor>,

    signers: Arc<SignersContainer>,
    change_signers: Arc<SignersContainer>,

    network: Network,

    database: RwLock<D>,
    sync_lock: Mutex<()>,

    secp: SecpCtx,
}

/// The address index selection strategy to use to derived an address from the wallet's external
/// descriptor. See [`Wallet::get_address`]. If you're unsure which one to use use `AddressIndex::New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressIndex {
    /// Return a new address after incrementing the current descriptor index.
    New,
    /// Return the address for the current descriptor index if it has not been used in a received
    /// transaction. Otherwise return a new address as with [`AddressIndex::New`].
    ///
    /// Use with caution, if the wallet has not yet detected an address has been used it could
    /// return an already used address. This function is primarily meant for situations where the
    /// caller is untrusted; for example when deriving donation addresses on-demand for a public
    /// web page.
    LastUnused,
    /// Return the address for a specific descriptor index. Does not change the current descriptor
    /// index used by `AddressIndex::New` and `AddressIndex::LastUnused`.
    ///
    /// Use with caution, if an index is given that is less than the current descriptor index
    /// then the returned address may have already been used.
    Peek(u32),
    /// Return the address for a specific descriptor index and reset the current descriptor index
    /// used by `AddressIndex::New` and `AddressIndex::LastUnused` to this value.
    ///
    /// Use with caution, if an index is given that is less than the current descriptor index
    /// then the returned address and subsequent addresses returned by calls to `AddressIndex::New`
    /// and `AddressIndex::LastUnused` may have already been used. Also if the index is reset to a
    /// value earlier than the [`Blockchain`] stop_gap (default is 20) then a larger stop_gap
    /// should be used to monitor for all possibly used addresses.
    Reset(u32),
}

/// A derived address and the index it was found at
/// For convenience this automatically derefs to `Address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    /// Child index of this address
    pub index: u32,
    /// Address
    pub address: Address,
    /// Type of keychain
    pub keychain: KeychainKind,
}

impl Deref for AddressInfo {
    type Target = Address;

    fn deref(&self) -> &Self::Target {
        &self.address
    }
}

impl fmt::Display for AddressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Options to a [`sync`].
///
/// [`sync`]: Wallet::sync
#[derive(Debug, Default)]
pub struct SyncOptions {
    /// The progress tracker which may be informed when progress is made.
    pub progress: Option<Box<dyn Progress>>,
}

impl<D> Wallet<D>
where
    D: BatchDatabase,
{
    /// Create a wallet.
    ///
    /// The only way this can fail is if the descriptors passed in do not match the checksums in
    /// `database`, or if a key doesn't belong to `network`.
    ///
    /// ```
    /// # use bdk_engine::{Wallet, database::MemoryDatabase};
    /// # use bitcoin::Network;
    /// let wallet = Wallet::new(
    ///     "wpkh(tpubD6NzVbkrYhZ4Xferm7Pz4VnjdcDPFyjVu5K4iZXQ4pVN8Cks4pHVowTBXBKRhX64pkRyJZJN5xAKj4UDNnLPb5p2sSKXhewoYx5GbTdUFWq/0/*)",
    ///     Some("wpkh(tpubD6NzVbkrYhZ4Xferm7Pz4VnjdcDPFyjVu5K4iZXQ4pVN8Cks4pHVowTBXBKRhX64pkRyJZJN5xAKj4UDNnLPb5p2sSKXhewoYx5GbTdUFWq/1/*)"),
    ///     Network::Testnet,
    ///     MemoryDatabase::new(),
    /// )?;
    /// assert_eq!(wallet.network(), Network::Testnet);
    /// # Ok::<(), bdk_engine::Error>(())
    /// ```
    pub fn new<E: IntoWalletDescriptor>(
        descriptor: E,
        change_descriptor: Option<E>,
        network: Network,
        mut database: D,
    ) -> Result<Self, Error> {
        let secp = Secp256k1::new();

        let (descriptor, keymap) = into_wallet_descriptor_checked(descriptor, &secp, network)?;
        database.check_descriptor_checksum(
            KeychainKind::External,
            &descriptor.checksum()?,
        )?;
        let signers = Arc::new(SignersContainer::build(keymap, &descriptor, &secp));

        let (change_descriptor, change_signers) = match change_descriptor {
            Some(desc) => {
                let (change_descriptor, change_keymap) =
                    into_wallet_descriptor_checked(desc, &secp, network)?;
                database.check_descriptor_checksum(
                    KeychainKind::Internal,
                    &change_descriptor.checksum()?,
                )?;

                let change_signers = Arc::new(SignersContainer::build(
                    change_keymap,
                    &change_descriptor,
                    &secp,
                ));

                (Some(change_descriptor), change_signers)
            }
            None => (None, Arc::new(SignersContainer::new())),
        };

        Ok(Wallet {
            descriptor,
            change_descriptor,
            signers,
            change_signers,
            network,
            database: RwLock::new(database),
            sync_lock: Mutex::new(()),
            secp,
        })
    }

    /// Get the Bitcoin network the wallet is using.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Return a derived address using the external descriptor, see [`AddressIndex`] for
    /// available address index selection strategies. If none of the keys in the descriptor are derivable
    /// (i.e. does not end with /*) then the same address will always be returned for any [`AddressIndex`].
    pub fn get_address(&self, address_index: AddressIndex) -> Result<AddressInfo, Error> {
        self._get_address(address_index, KeychainKind::External)
    }

    /// Return a derived address using the internal (change) descriptor.
    ///
    /// If the wallet doesn't have an internal descriptor it will use the external descriptor.
    ///
    /// see [`AddressIndex`] for available address index selection strategies. If none of the keys
    /// in the descriptor are derivable (i.e. does not end with /*) then the same address will always
    /// be returned for any [`AddressIndex`].
    pub fn get_internal_address(&self, address_index: AddressIndex) -> Result<AddressInfo, Error> {
        self._get_address(address_index, KeychainKind::Internal)
    }

    fn _get_address(
        &self,
        address_index: AddressIndex,
        keychain: KeychainKind,
    ) -> Result<AddressInfo, Error> {
        match address_index {
            AddressIndex::New => self.get_new_address(keychain),
            AddressIndex::LastUnused => self.get_unused_address(keychain),
            AddressIndex::Peek(index) => self.peek_address(index, keychain),
            AddressIndex::Reset(index) => self.reset_address(index, keychain),
        }
    }

    // Return a newly derived address for the specified `keychain`
    fn get_new_address(&self, keychain: KeychainKind) -> Result<AddressInfo, Error> {
        let (descriptor, keychain) = self._get_descriptor_for_keychain(keychain);

        // the index is bumped and cached under a single write lock, so concurrent callers never
        // get the same index back
        let index = {
            let mut database = self.database.write()?;
            let index = match descriptor.is_derivable() {
                false => 0,
                true => {
                    // refuse to step into hardened indexes before touching the counter
                    if let Some(last) = database.get_last_index(keychain)? {
                        normal_index(last.saturating_add(1))?;
                    }
                    database.increment_last_index(keychain)?
                }
            };
            self.cache_addresses(&mut *database, keychain, index)?;
            index
        };
        debug!("Revealed {:?} address at index {}", keychain, index);

        self.address_at(descriptor, keychain, index)
    }

    // Return the last revealed address if it has not been used in a received transaction.
    // Otherwise return a new address using [`Wallet::get_new_address`].
    fn get_unused_address(&self, keychain: KeychainKind) -> Result<AddressInfo, Error> {
        let (descriptor, keychain) = self._get_descriptor_for_keychain(keychain);

        let current_index = match descriptor.is_derivable() {
            false => Some(0),
            true => self.database.read()?.get_last_index(keychain)?,
        };
        let current_index = match current_index {
            Some(index) => index,
            None => return self.get_new_address(keychain),
        };

        let script_pubkey = descriptor.derive_script(current_index)?;
        let found_used = self
            .list_transactions(true)?
            .iter()
            .flat_map(|details| details.transaction.as_ref())
            .flat_map(|tx| tx.output.iter())
            .any(|output| output.script_pubkey == script_pubkey);

        if found_used {
            self.get_new_address(keychain)
        } else {
            self.address_at(descriptor, keychain, current_index)
        }
    }

    // Return the address for a specific descriptor index, without touching the database
    fn peek_address(&self, index: u32, keychain: KeychainKind) -> Result<AddressInfo, Error> {
        let (descriptor, keychain) = self._get_descriptor_for_keychain(keychain);
        self.address_at(descriptor, keychain, index)
    }

    // Return the address for a specific descriptor index and reset the current index to it
    fn reset_address(&self, index: u32, keychain: KeychainKind) -> Result<AddressInfo, Error> {
        let (descriptor, keychain) = self._get_descriptor_for_keychain(keychain);
        let index = match descriptor.is_derivable() {
            true => normal_index(index)?,
            false => 0,
        };

        {
            let mut database = self.database.write()?;
            database.set_last_index(keychain, index)?;
            self.cache_addresses(&mut *database, keychain, index)?;
        }

        self.address_at(descriptor, keychain, index)
    }

    fn address_at(
        &self,
        descriptor: &ExtendedDescriptor,
        keychain: KeychainKind,
        index: u32,
    ) -> Result<AddressInfo, Error> {
        let index = if descriptor.is_derivable() { index } else { 0 };

        descriptor
            .derive_definite(index)?
            .address(self.network)
            .map(|address| AddressInfo {
                index,
                address,
                keychain,
            })
            .map_err(|_| Error::ScriptDoesntHaveAddressForm)
    }

    // Store the scripts from `from` onwards, so that `is_mine` recognizes revealed addresses
    // before the next sync
    fn cache_addresses(&self, database: &mut D, keychain: KeychainKind, from: u32) -> Result<(), Error> {
        if database.get_script_pubkey_from_path(keychain, from)?.is_some() {
            return Ok(());
        }

        let (descriptor, keychain) = self._get_descriptor_for_keychain(keychain);
        let count = match descriptor.is_derivable() {
            false if from > 0 => return Ok(()),
            false => 1,
            true => CACHE_ADDR_BATCH_SIZE,
        };

        let to = from.saturating_add(count).min(HARDENED_INDEX);
        let mut address_batch = database.begin_batch();
        for i in from..to {
            address_batch.set_script_pubkey(&descriptor.derive_script(i)?, keychain, i)?;
        }
        database.commit_batch(address_batch)?;

        trace!("Cached {} {:?} scripts from index {}", count, keychain, from);

        Ok(())
    }

    /// Return whether or not a `script` is part of this wallet (either internal or external)
    pub fn is_mine(&self, script: &Script) -> Result<bool, Error> {
        self.database.read()?.is_mine(script)
    }

    /// Return the list of unspent outputs of this wallet
    ///
    /// Note that this method only operates on the internal database, which first needs to be
    /// [`Wallet::sync`] manually.
    pub fn list_unspent(&self) -> Result<Vec<LocalUtxo>, Error> {
        Ok(self
            .database
            .read()?
            .iter_utxos()?
            .into_iter()
            .filter(|utxo| !utxo.is_spent)
            .collect())
    }

    /// Returns the utxo owned by this wallet corresponding to `outpoint` if it exists in the
    /// wallet's database.
    ///
    /// Spent outputs are returned too, with their `is_spent` flag set.
    pub fn get_utxo(&self, outpoint: OutPoint) -> Result<Option<LocalUtxo>, Error> {
        self.database.read()?.get_utxo(&outpoint)
    }

    /// Return a single transactions made and received by the wallet
    ///
    /// Optionally fill the [`TransactionDetails::transaction`] field with the raw transaction if
    /// `include_raw` is `true`.
    ///
    /// Note that this method only operates on the internal database, which first needs to be
    /// [`Wallet::sync`] manually.
    pub fn get_tx(
        &self,
        txid: &Txid,
        include_raw: bool,
    ) -> Result<Option<TransactionDetails>, Error> {
        self.database.read()?.get_tx(txid, include_raw)
    }

    /// Return an unsorted list of transactions made and received by the wallet
    ///
    /// Optionally fill the [`TransactionDetails::transaction`] field with the raw transaction if
    /// `include_raw` is `true`.
    ///
    /// To sort transactions, the following code can be used:
    /// ```no_run
    /// # let mut tx_list: Vec<bdk_engine::TransactionDetails> = vec![];
    /// tx_list.sort_by(|a, b| {
    ///     b.confirmation_time
    ///         .as_ref()
    ///         .map(|t| t.height)
    ///         .cmp(&a.confirmation_time.as_ref().map(|t| t.height))
    /// });
    /// ```
    ///
    /// Note that this method only operates on the internal database, which first needs to be
    /// [`Wallet::sync`] manually.
    pub fn list_transactions(&self, include_raw: bool) -> Result<Vec<TransactionDetails>, Error> {
        self.database.read()?.iter_txs(include_raw)
    }

    /// Return the balance, separated into available, trusted-pending, untrusted-pending and immature
    /// values.
    ///
    /// Note that this method only operates on the internal database, which first needs to be
    /// [`Wallet::sync`] manually.
    pub fn get_balance(&self) -> Result<Balance, Error> {
        let database = self.database.read()?;
        let tip = database
            .get_sync_time()?
            .map(|sync_time| sync_time.block_time.height);

        let mut balance = Balance::default();
        for utxo in database.iter_utxos()?.into_iter().filter(|utxo| !utxo.is_spent) {
            let value = utxo.txout.value;

            let details = match database.get_tx(&utxo.outpoint.txid, true)? {
                Some(details) => details,
                None => {
                    balance.untrusted_pending += value;
                    continue;
                }
            };
            let is_coinbase = details
                .transaction
                .as_ref()
                .map(Transaction::is_coin_base)
                .unwrap_or(false);

            if is_coinbase && !is_mature(details.confirmation_time.as_ref(), tip) {
                balance.immature += value;
            } else if details.confirmation_time.is_some() {
                balance.confirmed += value;
            } else if spends_only_wallet_outputs(&*database, details.transaction.as_ref())? {
                balance.trusted_pending += value;
            } else {
                balance.untrusted_pending += value;
            }
        }

        Ok(balance)
    }

    /// Add an external signer
    ///
    /// See [the `signer` module](signer) for an example.
    pub fn add_signer(
        &mut self,
        keychain: KeychainKind,
        ordering: SignerOrdering,
        signer: Arc<dyn TransactionSigner>,
    ) {
        let signers = match keychain {
            KeychainKind::External => Arc::make_mut(&mut self.signers),
            KeychainKind::Internal => Arc::make_mut(&mut self.change_signers),
        };

        signers.add_external(signer.id(&self.secp), ordering, signer);
    }

    /// Get the signers
    ///
    /// ## Example
    ///
    /// ```
    /// # use bdk_engine::{Wallet, KeychainKind};
    /// # use bdk_engine::database::MemoryDatabase;
    /// # use bitcoin::Network;
    /// let wallet = Wallet::new("wpkh(tprv8ZgxMBicQKsPe73PBRSmNbTfbcsZnwWhz5eVmhHpi31HW29Z7mc9B4cWGRQzopNUzZUT391DeDJxL2PefNunWyLgqCKRMDkU1s2s8bAfoSk/84'/0'/0'/0/*)", None, Network::Testnet, MemoryDatabase::new())?;
    /// for secret_key in wallet.get_signers(KeychainKind::External).signers().iter().filter_map(|s| s.descriptor_secret_key()) {
    ///     // secret_key: tprv8ZgxMBicQKsPe73PBRSmNbTfbcsZnwWhz5eVmhHpi31HW29Z7mc9B4cWGRQzopNUzZUT391DeDJxL2PefNunWyLgqCKRMDkU1s2s8bAfoSk/84'/0'/0'/0/*
    ///     println!("secret_key: {}", secret_key);
    /// }
    ///
    /// Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn get_signers(&self, keychain: KeychainKind) -> Arc<SignersContainer> {
        match keychain {
            KeychainKind::External => Arc::clone(&self.signers),
            KeychainKind::Internal => Arc::clone(&self.change_signers),
        }
    }

    /// Start building a transaction.
    ///
    /// This returns a blank [`TxBuilder`] from which you can specify the parameters for the transaction.
    ///
    /// ## Example
    ///
    /// ```
    /// # use std::str::FromStr;
    /// # use bitcoin::*;
    /// # use bdk_engine::*;
    /// # use bdk_engine::Error;
    /// # use bdk_engine::database::MemoryDatabase;
    /// # let descriptor = "wpkh(tpubD6NzVbkrYhZ4Xferm7Pz4VnjdcDPFyjVu5K4iZXQ4pVN8Cks4pHVowTBXBKRhX64pkRyJZJN5xAKj4UDNnLPb5p2sSKXhewoYx5GbTdUFWq/*)";
    /// # let wallet = Wallet::new(descriptor, None, Network::Testnet, MemoryDatabase::new())?;
    /// # let to_address = Address::from_str("2N4eQYCbKUHCCTUjBJeHcJp9ok6J2GZsTDt").unwrap();
    /// let mut builder = wallet.build_tx();
    /// builder.add_recipient(to_address.script_pubkey(), 50_000);
    /// // the wallet hasn't been synced, so there's nothing to spend yet
    /// assert!(matches!(
    ///     builder.finish(),
    ///     Err(Error::InsufficientFunds { .. })
    /// ));
    /// # Ok::<(), bdk_engine::Error>(())
    /// ```
    ///
    /// [`TxBuilder`]: crate::TxBuilder
    pub fn build_tx(&self) -> TxBuilder<'_, D, DefaultCoinSelectionAlgorithm, CreateTx> {
        TxBuilder {
            wallet: self,
            params: TxParams::default(),
            coin_selection: DefaultCoinSelectionAlgorithm::default(),
            phantom: PhantomData,
        }
    }

    pub(crate) fn create_tx<Cs: CoinSelectionAlgorithm<D>>(
        &self,
        coin_selection: Cs,
        params: TxParams,
    ) -> Result<(Psbt, TransactionDetails), Error> {
        // every configuration error comes before coin selection and before any address is revealed
        let fee_policy = params.fee_policy()?;

        let csv = self.csv_requirement();
        let timelock = self.timelock_requirement();
        debug!("Timelock requirements: csv {:?}, timelock {:?}", csv, timelock);

        let version = tx_version(params.version, csv)?;
        let current_height = match params.current_height {
            Some(height) => Some(height),
            None => self.sync_height()?,
        };
        let lock_time = tx_lock_time(params.locktime, timelock, current_height)?;
        let n_sequence = tx_sequence(params.rbf, csv, lock_time)?;
        let (fee_rate, mut fee_amount) = fee_target(fee_policy, params.bumping_fee)?;

        if params.manually_selected_only && params.utxos.is_empty() {
            return Err(Error::NoUtxosSelected);
        }
        if params.recipients.is_empty() {
            match params.drain_to {
                None => return Err(Error::NoRecipients),
                // draining needs to know what to drain
                Some(_) if !params.drain_wallet && params.utxos.is_empty() => {
                    return Err(Error::NoUtxosSelected)
                }
                Some(_) => {}
            }
        }
        if params.change_policy != ChangeSpendPolicy::ChangeAllowed
            && self.change_descriptor.is_none()
        {
            return Err(Error::Generic(
                "The `change_policy` can be set only if the wallet has a change_descriptor".into(),
            ));
        }
        let global_xpubs = match params.add_global_xpubs {
            true => self.global_xpubs()?,
            false => BTreeMap::new(),
        };

        let mut tx = Transaction {
            version,
            lock_time: PackedLockTime(lock_time),
            input: vec![],
            output: vec![],
        };

        let mut outgoing: u64 = 0;
        let mut received: u64 = 0;

        let database = self.database.read()?;
        for (index, (script_pubkey, value)) in params.recipients.iter().enumerate() {
            if !params.allow_dust
                && value.is_dust(script_pubkey)
                && !script_pubkey.is_provably_unspendable()
            {
                return Err(Error::OutputBelowDustLimit(index));
            }

            if database.is_mine(script_pubkey)? {
                received += value;
            }

            tx.output.push(TxOut {
                script_pubkey: script_pubkey.clone(),
                value: *value,
            });
            outgoing += value;
        }

        let (required_utxos, optional_utxos) = self.preselect_utxos(
            &*database,
            params.change_policy,
            &params.unspendable,
            params.utxos.clone(),
            params.drain_wallet,
            params.manually_selected_only,
            params.bumping_fee.is_some(), // a replacement only spends confirmed coins
            current_height,
        )?;

        // 2 WU for the segwit marker and flag, the inputs aren't known yet
        fee_amount += fee_rate.fee_wu(tx.weight() + 2);

        // the change address is only peeked at here, it's revealed once a change output exists
        let (drain_script, change_index) = match params.drain_to {
            Some(ref script) => (script.clone(), None),
            None => {
                let (keychain, index) = self.next_index(&*database, KeychainKind::Internal)?;
                let script = self
                    .get_descriptor_for_keychain(keychain)
                    .derive_script(index)?;
                (script, Some((keychain, index)))
            }
        };

        let coin_selection = coin_selection.coin_select(
            &*database,
            required_utxos,
            optional_utxos,
            fee_rate,
            outgoing + fee_amount,
            &drain_script,
        )?;
        fee_amount += coin_selection.fee_amount;

        tx.input = coin_selection
            .selected
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint,
                script_sig: Script::default(),
                sequence: n_sequence,
                witness: Witness::new(),
            })
            .collect();

        match coin_selection.excess {
            // with nothing but the drain output there's no transaction without it
            Excess::NoChange {
                dust_threshold,
                remaining_amount,
                change_fee,
            } if tx.output.is_empty() => {
                return Err(Error::InsufficientFunds {
                    needed: dust_threshold,
                    available: remaining_amount.saturating_sub(change_fee),
                });
            }
            Excess::NoChange {
                remaining_amount, ..
            } => fee_amount += remaining_amount,
            Excess::Change { amount, fee } => {
                if change_index.is_some() || database.is_mine(&drain_script)? {
                    received += amount;
                }
                fee_amount += fee;

                tx.output.push(TxOut {
                    value: amount,
                    script_pubkey: drain_script,
                });
            }
        }
        drop(database);

        if let (Some((keychain, index)), Excess::Change { .. }) =
            (change_index, &coin_selection.excess)
        {
            self.reveal_up_to(keychain, index)?;
        }

        params.ordering.sort_tx(&mut tx);

        let txid = tx.txid();
        let sent = coin_selection.selected_amount();
        info!(
            "Created transaction {} spending {} inputs, fee {} sat",
            txid,
            tx.input.len(),
            fee_amount
        );
        let psbt =
            self.complete_transaction(tx, coin_selection.selected, global_xpubs, params)?;

        let transaction_details = TransactionDetails {
            transaction: None,
            txid,
            confirmation_time: None,
            received,
            sent,
            fee: Some(fee_amount),
        };

        Ok((psbt, transaction_details))
    }

    // Height of the chain at the last sync
    fn sync_height(&self) -> Result<Option<u32>, Error> {
        Ok(self
            .database
            .read()?
            .get_sync_time()?
            .map(|sync_time| sync_time.block_time.height))
    }

    // Index `AddressIndex::New` would hand out next for `keychain`, without revealing it
    fn next_index(&self, database: &D, keychain: KeychainKind) -> Result<(KeychainKind, u32), Error> {
        let (descriptor, keychain) = self._get_descriptor_for_keychain(keychain);
        if !descriptor.is_derivable() {
            return Ok((keychain, 0));
        }

        let index = match database.get_last_index(keychain)? {
            Some(last) => normal_index(last.saturating_add(1))?,
            None => 0,
        };
        Ok((keychain, index))
    }

    // Mark every index of `keychain` up to `index` as revealed
    fn reveal_up_to(&self, keychain: KeychainKind, index: u32) -> Result<(), Error> {
        let (descriptor, keychain) = self._get_descriptor_for_keychain(keychain);

        let mut database = self.database.write()?;
        if descriptor.is_derivable() && database.get_last_index(keychain)?.map_or(true, |last| last < index) {
            database.set_last_index(keychain, index)?;
        }
        self.cache_addresses(&mut *database, keychain, index)?;
        debug!("Revealed {:?} address at index {} for change", keychain, index);

        Ok(())
    }

    /// Bump the fee of a transaction previously created with this wallet.
    ///
    /// Returns an error if the transaction is already confirmed or doesn't explicitly signal
    /// *replace by fee* (RBF). If the transaction can be fee bumped then it returns a [`TxBuilder`]
    /// pre-populated with the inputs and outputs of the original transaction.
    ///
    /// The change output of the original transaction pays for the bump, whatever is left goes
    /// back to the same script. Use [`TxBuilder::allow_shrinking`] to take the fee out of
    /// another output instead.
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use std::str::FromStr;
    /// # use bitcoin::*;
    /// # use bdk_engine::*;
    /// # use bdk_engine::Error;
    /// # use bdk_engine::blockchain::Blockchain;
    /// # use bdk_engine::database::MemoryDatabase;
    /// # fn bump<B: Blockchain>(blockchain: &B) -> Result<(), Error> {
    /// # let descriptor = "wpkh(tpubD6NzVbkrYhZ4Xferm7Pz4VnjdcDPFyjVu5K4iZXQ4pVN8Cks4pHVowTBXBKRhX64pkRyJZJN5xAKj4UDNnLPb5p2sSKXhewoYx5GbTdUFWq/*)";
    /// # let wallet = Wallet::new(descriptor, None, Network::Testnet, MemoryDatabase::new())?;
    /// # let to_address = Address::from_str("2N4eQYCbKUHCCTUjBJeHcJp9ok6J2GZsTDt").unwrap();
    /// let (mut psbt, _) = {
    ///     let mut builder = wallet.build_tx();
    ///     builder
    ///         .add_recipient(to_address.script_pubkey(), 50_000)
    ///         .enable_rbf();
    ///     builder.finish()?
    /// };
    /// let _ = wallet.sign(&mut psbt, SignOptions::default())?;
    /// let tx = psbt.extract_tx();
    /// wallet.broadcast(blockchain, &tx)?;
    /// // it's taking too long to confirm, so we want to bump the fee
    /// let (mut psbt, _) = {
    ///     let mut builder = wallet.build_fee_bump(tx.txid())?;
    ///     builder.fee_rate(FeeRate::from_sat_per_vb(5.0));
    ///     builder.finish()?
    /// };
    ///
    /// let _ = wallet.sign(&mut psbt, SignOptions::default())?;
    /// let fee_bumped_tx = psbt.extract_tx();
    /// // broadcast fee_bumped_tx to replace original
    /// # Ok(())
    /// # }
    /// ```
    pub fn build_fee_bump(
        &self,
        txid: Txid,
    ) -> Result<TxBuilder<'_, D, DefaultCoinSelectionAlgorithm, BumpFee>, Error> {
        let database = self.database.read()?;

        let mut details = database
            .get_tx(&txid, true)?
            .ok_or(Error::TransactionNotFound)?;
        if details.confirmation_time.is_some() {
            return Err(Error::TransactionConfirmed);
        }
        let mut tx = details
            .transaction
            .take()
            .ok_or(Error::TransactionNotFound)?;

        if !tx
            .input
            .iter()
            .any(|txin| txin.sequence.to_consensus_u32() <= 0xFFFFFFFD)
        {
            return Err(Error::IrreplaceableTransaction);
        }

        let fee = details.fee.ok_or(Error::FeeRateUnavailable)?;
        let feerate = FeeRate::from_wu(fee, tx.weight());

        // remove the inputs from the tx and process them
        let original_txin = tx.input.drain(..).collect::<Vec<_>>();
        let original_utxos = original_txin
            .iter()
            .map(|txin| -> Result<_, Error> {
                let txout = database
                    .get_previous_output(&txin.previous_output)?
                    .ok_or(Error::UnknownUtxo)?;
                let (keychain, _) = database
                    .get_path_from_script_pubkey(&txout.script_pubkey)?
                    .ok_or(Error::UnknownUtxo)?;

                Ok(WeightedUtxo {
                    satisfaction_weight: self.satisfaction_weight(keychain)?,
                    utxo: LocalUtxo {
                        outpoint: txin.previous_output,
                        txout,
                        keychain,
                        is_spent: true,
                    },
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut drain_to = None;
        let mut original_change = None;
        if tx.output.len() > 1 {
            let (_, change_keychain) = self._get_descriptor_for_keychain(KeychainKind::Internal);
            let mut change_index = None;
            for (index, txout) in tx.output.iter().enumerate() {
                match database.get_path_from_script_pubkey(&txout.script_pubkey)? {
                    Some((keychain, _)) if keychain == change_keychain => {
                        change_index = Some(index)
                    }
                    _ => {}
                }
            }

            if let Some(change_index) = change_index {
                let change = tx.output.remove(change_index);
                original_change = Some(change.value);
                drain_to = Some(change.script_pubkey);
            }
        }

        let params = TxParams {
            version: Some(tx_builder::Version(tx.version)),
            recipients: tx
                .output
                .into_iter()
                .map(|txout| (txout.script_pubkey, txout.value))
                .collect(),
            drain_to,
            original_change,
            utxos: original_utxos,
            rbf: Some(tx_builder::RbfValue::Default),
            bumping_fee: Some(tx_builder::PreviousFee {
                absolute: fee,
                rate: feerate.as_sat_per_vb(),
            }),
            ..Default::default()
        };

        Ok(TxBuilder {
            wallet: self,
            params,
            coin_selection: DefaultCoinSelectionAlgorithm::default(),
            phantom: PhantomData,
        })
    }

    /// Sign a transaction with all the wallet's signers, in the order specified by every signer's
    /// [`SignerOrdering`]. This function returns the `Result` type with an encapsulated `bool`
    /// that is `true` if every input owned by the wallet ended up signed (or finalized, when
    /// [`SignOptions::try_finalize`] is set).
    ///
    /// A signer that fails doesn't stop the others: the signatures that could be made are kept in
    /// the PSBT and the result is `false`.
    ///
    /// The [`SignOptions`] can be used to tweak the behavior of the software signers, and the way
    /// the transaction is finalized at the end. Note that it can't be guaranteed that *every*
    /// signers will follow the options, but the "software signers" (WIF keys and `xprv`) defined
    /// in this library will.
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use std::str::FromStr;
    /// # use bitcoin::*;
    /// # use bdk_engine::*;
    /// # use bdk_engine::Error;
    /// # use bdk_engine::database::MemoryDatabase;
    /// # let descriptor = "wpkh(tpubD6NzVbkrYhZ4Xferm7Pz4VnjdcDPFyjVu5K4iZXQ4pVN8Cks4pHVowTBXBKRhX64pkRyJZJN5xAKj4UDNnLPb5p2sSKXhewoYx5GbTdUFWq/*)";
    /// # let wallet = Wallet::new(descriptor, None, Network::Testnet, MemoryDatabase::new())?;
    /// # let to_address = Address::from_str("2N4eQYCbKUHCCTUjBJeHcJp9ok6J2GZsTDt").unwrap();
    /// let (mut psbt, _) = {
    ///     let mut builder = wallet.build_tx();
    ///     builder.add_recipient(to_address.script_pubkey(), 50_000);
    ///     builder.finish()?
    /// };
    /// let finalized = wallet.sign(&mut psbt, SignOptions::default())?;
    /// assert!(finalized, "we should have signed all the inputs");
    /// # Ok::<(), bdk_engine::Error>(())
    /// ```
    pub fn sign(&self, psbt: &mut Psbt, sign_options: SignOptions) -> Result<bool, Error> {
        // This adds all the PSBT metadata for the inputs, which will help us later figure out how
        // to derive our keys
        self.update_psbt_with_descriptor(psbt)?;

        // If we aren't allowed to use `witness_utxo`, ensure that every input (except p2tr and finalized ones)
        // has the `non_witness_utxo`
        if !sign_options.trust_witness_utxo
            && psbt
                .inputs
                .iter()
                .filter(|i| i.final_script_witness.is_none() && i.final_script_sig.is_none())
                .filter(|i| i.tap_internal_key.is_none() && i.tap_merkle_root.is_none())
                .any(|i| i.non_witness_utxo.is_none())
        {
            return Err(Error::Signer(SignerError::MissingNonWitnessUtxo));
        }

        if !sign_options.allow_all_sighashes
            && psbt.inputs.iter().any(|i| {
                i.sighash_type
                    .map_or(false, |ty| ty != EcdsaSighashType::All.into())
            })
        {
            return Err(Error::Signer(SignerError::NonStandardSighash));
        }

        for signer in self
            .signers
            .signers()
            .iter()
            .chain(self.change_signers.signers().iter())
        {
            if let Err(e) = signer.sign_transaction(psbt, &sign_options, &self.secp) {
                debug!("Signer {:?} failed: {}", signer.id(&self.secp), e);
            }
        }

        // attempt to finalize
        if sign_options.try_finalize {
            self.finalize_psbt(psbt, sign_options)
        } else {
            self.is_signed(psbt)
        }
    }

    // Whether every input spending a wallet output carries a signature or a final script
    fn is_signed(&self, psbt: &Psbt) -> Result<bool, Error> {
        let database = self.database.read()?;

        for (n, input) in psbt.inputs.iter().enumerate() {
            let is_mine = match psbt.get_utxo_for(n) {
                Some(txout) => database.is_mine(&txout.script_pubkey)?,
                None => false,
            };
            if !is_mine {
                continue;
            }

            let signed = input.final_script_sig.is_some()
                || input.final_script_witness.is_some()
                || !input.partial_sigs.is_empty()
                || input.tap_key_sig.is_some()
                || !input.tap_script_sigs.is_empty();
            if !signed {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Return the "public" version of the wallet's descriptor, meaning a new descriptor that has
    /// the same structure but with every secret key removed
    ///
    /// This can be used to build a watch-only version of a wallet
    pub fn public_descriptor(&self, keychain: KeychainKind) -> Option<&ExtendedDescriptor> {
        match keychain {
            KeychainKind::External => Some(&self.descriptor),
            KeychainKind::Internal => self.change_descriptor.as_ref(),
        }
    }

    /// Finalize a PSBT, i.e., for each input determine if sufficient data is available to pass
    /// validation and construct the respective `scriptSig` or `scriptWitness`. Please refer to
    /// [BIP174](https://github.com/bitcoin/bips/blob/master/bip-0174.mediawiki#Input_Finalizer)
    /// for further information.
    ///
    /// Returns `true` if the PSBT could be finalized, and `false` otherwise.
    ///
    /// The [`SignOptions`] can be used to tweak the behavior of the finalizer.
    pub fn finalize_psbt(&self, psbt: &mut Psbt, sign_options: SignOptions) -> Result<bool, Error> {
        let database = self.database.read()?;
        let current_height = match sign_options.assume_height {
            Some(height) => Some(height),
            None => database
                .get_sync_time()?
                .map(|sync_time| sync_time.block_time.height),
        };

        let mut finished = true;

        for n in 0..psbt.unsigned_tx.input.len() {
            let psbt_input = psbt
                .inputs
                .get(n)
                .ok_or(Error::Signer(SignerError::InputIndexOutOfRange))?;
            if psbt_input.final_script_sig.is_some() || psbt_input.final_script_witness.is_some() {
                continue;
            }

            let previous_output = psbt.unsigned_tx.input[n].previous_output;
            // unconfirmed parents have an "infinite" creation height, so no relative timelock
            // can be satisfied yet
            let create_height = database
                .get_tx(&previous_output.txid, false)?
                .map(|details| {
                    details
                        .confirmation_time
                        .map(|time| time.height)
                        .unwrap_or(u32::MAX)
                });

            debug!(
                "Input #{} - {}, using `create_height` = {:?}, `current_height` = {:?}",
                n, previous_output, create_height, current_height
            );

            let desc = match psbt.get_utxo_for(n) {
                Some(txout) => self.get_descriptor_for_txout(&*database, &txout)?,
                None => None,
            };

            match desc {
                Some(desc) => {
                    let mut tmp_input = TxIn::default();
                    match desc.satisfy(
                        &mut tmp_input,
                        (
                            PsbtInputSatisfier::new(psbt, n),
                            ChainHeights {
                                current: current_height,
                                created: create_height,
                            },
                        ),
                    ) {
                        Ok(_) => {
                            let psbt_input = &mut psbt.inputs[n];
                            psbt_input.final_script_sig = Some(tmp_input.script_sig);
                            psbt_input.final_script_witness = Some(tmp_input.witness);
                            if sign_options.remove_partial_sigs {
                                psbt_input.partial_sigs.clear();
                            }
                        }
                        Err(e) => {
                            debug!("satisfy error {:?} for input {}", e, n);
                            finished = false
                        }
                    }
                }
                None => finished = false,
            }
        }

        Ok(finished)
    }

    /// Return the secp256k1 context used for all signing operations
    pub fn secp_ctx(&self) -> &SecpCtx {
        &self.secp
    }

    /// Returns the descriptor used to create addresses for a particular `keychain`.
    pub fn get_descriptor_for_keychain(&self, keychain: KeychainKind) -> &ExtendedDescriptor {
        let (descriptor, _) = self._get_descriptor_for_keychain(keychain);
        descriptor
    }

    /// Return the checksum of the public descriptor associated to `keychain`
    ///
    /// Internally calls [`Self::get_descriptor_for_keychain`] to fetch the right descriptor
    pub fn descriptor_checksum(&self, keychain: KeychainKind) -> Result<String, Error> {
        Ok(self.get_descriptor_for_keychain(keychain).checksum()?)
    }

    /// Read access to the wallet's database
    ///
    /// The returned guard blocks [`sync`](Self::sync) from committing its results and every
    /// method that reveals addresses, so it should be dropped quickly.
    pub fn database(&self) -> Result<RwLockReadGuard<'_, D>, Error> {
        Ok(self.database.read()?)
    }

    // The change keychain falls back to the external one when there's no change descriptor
    fn _get_descriptor_for_keychain(
        &self,
        keychain: KeychainKind,
    ) -> (&ExtendedDescriptor, KeychainKind) {
        match keychain {
            KeychainKind::Internal if self.change_descriptor.is_some() => (
                self.change_descriptor.as_ref().unwrap_or(&self.descriptor),
                KeychainKind::Internal,
            ),
            _ => (&self.descriptor, KeychainKind::External),
        }
    }

    fn get_descriptor_for_txout(
        &self,
        database: &D,
        txout: &TxOut,
    ) -> Result<Option<DerivedDescriptor>, Error> {
        match database.get_path_from_script_pubkey(&txout.script_pubkey)? {
            Some((keychain, child)) => Ok(Some(
                self.get_descriptor_for_keychain(keychain)
                    .derive_definite(child)?,
            )),
            None => Ok(None),
        }
    }

    fn get_available_utxos(&self, database: &D) -> Result<Vec<(LocalUtxo, usize)>, Error> {
        database
            .iter_utxos()?
            .into_iter()
            .filter(|utxo| !utxo.is_spent)
            .map(|utxo| {
                let satisfaction_weight = self.satisfaction_weight(utxo.keychain)?;
                Ok((utxo, satisfaction_weight))
            })
            .collect()
    }

    /// Given the options returns the list of utxos that must be used to form the
    /// transaction and any further that may be used if needed.
    #[allow(clippy::too_many_arguments)]
    fn preselect_utxos(
        &self,
        database: &D,
        change_policy: ChangeSpendPolicy,
        unspendable: &HashSet<OutPoint>,
        manually_selected: Vec<WeightedUtxo>,
        must_use_all_available: bool,
        manual_only: bool,
        must_only_use_confirmed_tx: bool,
        current_height: Option<u32>,
    ) -> Result<(Vec<WeightedUtxo>, Vec<WeightedUtxo>), Error> {
        //    must_spend <- manually selected utxos
        //    may_spend  <- all other available utxos
        let mut may_spend = self.get_available_utxos(database)?;
        may_spend.retain(|may_spend| {
            !manually_selected
                .iter()
                .any(|manually_selected| manually_selected.utxo.outpoint == may_spend.0.outpoint)
        });
        let mut must_spend = manually_selected;

        // NOTE: we are intentionally ignoring `unspendable` here. i.e manual
        // selection overrides unspendable.
        if manual_only {
            return Ok((must_spend, vec![]));
        }

        let mut eligible = Vec::with_capacity(may_spend.len());
        for (utxo, satisfaction_weight) in may_spend {
            if !change_policy.is_satisfied_by(&utxo) || unspendable.contains(&utxo.outpoint) {
                continue;
            }

            let details = match database.get_tx(&utxo.outpoint.txid, true)? {
                Some(details) => details,
                None => continue,
            };
            if must_only_use_confirmed_tx && details.confirmation_time.is_none() {
                continue;
            }

            let is_coinbase = details
                .transaction
                .as_ref()
                .map(Transaction::is_coin_base)
                .unwrap_or(false);
            if is_coinbase && !is_mature(details.confirmation_time.as_ref(), current_height) {
                continue;
            }

            eligible.push(WeightedUtxo {
                satisfaction_weight,
                utxo,
            });
        }

        if must_use_all_available {
            must_spend.append(&mut eligible);
        }

        Ok((must_spend, eligible))
    }

    // Origins of every extended key of the descriptors, for the global xpub map of a PSBT
    fn global_xpubs(&self) -> Result<BTreeMap<ExtendedPubKey, KeySource>, Error> {
        let all_xpubs = self
            .descriptor
            .get_extended_keys()
            .into_iter()
            .chain(
                self.change_descriptor
                    .iter()
                    .flat_map(|desc| desc.get_extended_keys()),
            );

        let mut xpubs = BTreeMap::new();
        for xpub in all_xpubs {
            let origin = match xpub.origin {
                Some(origin) => origin,
                // a master key is its own origin
                None if xpub.xkey.depth == 0 => (xpub.xkey.fingerprint(), vec![].into()),
                _ => return Err(Error::MissingKeyOrigin(xpub.xkey.to_string())),
            };
            xpubs.insert(xpub.xkey, origin);
        }

        Ok(xpubs)
    }

    fn complete_transaction(
        &self,
        tx: Transaction,
        selected: Vec<LocalUtxo>,
        global_xpubs: BTreeMap<ExtendedPubKey, KeySource>,
        params: TxParams,
    ) -> Result<Psbt, Error> {
        let mut psbt = Psbt::from_unsigned_tx(tx)?;
        psbt.xpub = global_xpubs;

        let mut lookup_output = selected
            .into_iter()
            .map(|utxo| (utxo.outpoint, utxo))
            .collect::<HashMap<_, _>>();

        // add metadata for the inputs
        for (psbt_input, input) in psbt.inputs.iter_mut().zip(psbt.unsigned_tx.input.iter()) {
            let utxo = match lookup_output.remove(&input.previous_output) {
                Some(utxo) => utxo,
                None => continue,
            };

            *psbt_input = match self.get_psbt_input(utxo, params.sighash, params.only_witness_utxo)
            {
                Ok(psbt_input) => psbt_input,
                Err(Error::UnknownUtxo) => psbt::Input {
                    sighash_type: params.sighash,
                    ..psbt::Input::default()
                },
                Err(e) => return Err(e),
            };
        }

        self.update_psbt_with_descriptor(&mut psbt)?;

        if !params.include_output_redeem_witness_script {
            for psbt_output in psbt.outputs.iter_mut() {
                psbt_output.redeem_script = None;
                psbt_output.witness_script = None;
            }
        }

        Ok(psbt)
    }

    /// get the corresponding PSBT Input for a LocalUtxo
    pub fn get_psbt_input(
        &self,
        utxo: LocalUtxo,
        sighash_type: Option<psbt::PsbtSighashType>,
        only_witness_utxo: bool,
    ) -> Result<psbt::Input, Error> {
        let database = self.database.read()?;

        // Try to find the prev_script in our db to figure out if this is internal or external,
        // and the derivation index
        let (keychain, child) = database
            .get_path_from_script_pubkey(&utxo.txout.script_pubkey)?
            .ok_or(Error::UnknownUtxo)?;

        let mut psbt_input = psbt::Input {
            sighash_type,
            ..psbt::Input::default()
        };

        let desc = self.get_descriptor_for_keychain(keychain);
        let derived_descriptor = desc.derive_definite(child)?;

        psbt_input
            .update_with_descriptor_unchecked(&derived_descriptor)
            .map_err(MiniscriptPsbtError::Conversion)?;

        let prev_output = utxo.outpoint;
        if let Some(prev_tx) = database.get_raw_tx(&prev_output.txid)? {
            if desc.is_witness() || desc.is_taproot() {
                let txout = prev_tx
                    .output
                    .get(prev_output.vout as usize)
                    .ok_or(Error::InvalidOutpoint(prev_output))?;
                psbt_input.witness_utxo = Some(txout.clone());
            }
            if !desc.is_taproot() && (!desc.is_witness() || !only_witness_utxo) {
                psbt_input.non_witness_utxo = Some(prev_tx);
            }
        }

        Ok(psbt_input)
    }

    fn update_psbt_with_descriptor(&self, psbt: &mut Psbt) -> Result<(), Error> {
        // We need to borrow `psbt` mutably within the loops, so we have to allocate a vec for all
        // the input utxos and outputs
        let utxos = (0..psbt.inputs.len())
            .filter_map(|i| psbt.get_utxo_for(i).map(|utxo| (true, i, utxo)))
            .chain(
                psbt.unsigned_tx
                    .output
                    .iter()
                    .enumerate()
                    .map(|(i, out)| (false, i, out.clone())),
            )
            .collect::<Vec<_>>();

        let database = self.database.read()?;

        // Try to figure out the keychain and derivation for every input and output
        for (is_input, index, out) in utxos.into_iter() {
            if let Some((keychain, child)) =
                database.get_path_from_script_pubkey(&out.script_pubkey)?
            {
                debug!(
                    "Found descriptor for {} #{} {:?}/{}",
                    if is_input { "input" } else { "output" },
                    index,
                    keychain,
                    child
                );

                let desc = self
                    .get_descriptor_for_keychain(keychain)
                    .derive_definite(child)?;

                if is_input {
                    psbt.update_input_with_descriptor(index, &desc)
                        .map_err(MiniscriptPsbtError::UtxoUpdate)?;
                } else {
                    psbt.update_output_with_descriptor(index, &desc)
                        .map_err(MiniscriptPsbtError::OutputUpdate)?;
                }
            }
        }

        Ok(())
    }

    /// Sync the internal database with the blockchain
    ///
    /// Scans both keychains with the blockchain's stop gap, then commits everything that was
    /// found in a single batch. Only one sync can run at a time: a concurrent call fails with
    /// [`Error::SyncInProgress`]. Readers keep seeing the pre-sync state until the batch is
    /// committed.
    pub fn sync<B: Blockchain + ?Sized>(
        &self,
        blockchain: &B,
        sync_opts: SyncOptions,
    ) -> Result<(), Error> {
        let _sync_guard = match self.sync_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(Error::SyncInProgress),
            // the lock doesn't protect any data
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        debug!("Begin sync...");
        let progress = sync_opts
            .progress
            .unwrap_or_else(|| Box::new(NoopProgress));

        let (snapshot, external_revealed, internal_revealed) = {
            let database = self.database.read()?;
            (
                Snapshot::load(&*database)?,
                database.get_last_index(KeychainKind::External)?,
                database.get_last_index(KeychainKind::Internal)?,
            )
        };

        let mut keychains = vec![KeychainScan {
            keychain: KeychainKind::External,
            descriptor: &self.descriptor,
            revealed: external_revealed,
        }];
        if let Some(change_descriptor) = &self.change_descriptor {
            keychains.push(KeychainScan {
                keychain: KeychainKind::Internal,
                descriptor: change_descriptor,
                revealed: internal_revealed,
            });
        }

        let update = script_sync::run(blockchain, snapshot, keychains, &*progress)?;
        update.apply(&mut *self.database.write()?)?;

        progress.update(100.0, None)?;
        info!("Sync completed");

        Ok(())
    }

    /// Broadcast a transaction to the network
    ///
    /// Once the blockchain accepted it, the transaction is recorded in the database and the
    /// wallet outputs it spends are marked as spent, so they won't be selected again before the
    /// next sync sees the transaction.
    pub fn broadcast<B: Blockchain + ?Sized>(
        &self,
        blockchain: &B,
        tx: &Transaction,
    ) -> Result<Txid, Error> {
        blockchain.broadcast(tx)?;

        let txid = tx.txid();
        let mut database = self.database.write()?;
        let mut batch = database.begin_batch();

        let mut sent = 0;
        let mut inputs_value = Some(0u64);
        for input in tx.input.iter() {
            if let Some(utxo) = database.get_utxo(&input.previous_output)? {
                sent += utxo.txout.value;
                batch.set_utxo(&LocalUtxo {
                    is_spent: true,
                    ..utxo
                })?;
            }

            inputs_value = match database.get_previous_output(&input.previous_output)? {
                Some(txout) => inputs_value.map(|value| value + txout.value),
                None => None,
            };
        }

        let mut received = 0;
        for (vout, output) in tx.output.iter().enumerate() {
            if let Some((keychain, _)) = database.get_path_from_script_pubkey(&output.script_pubkey)?
            {
                received += output.value;
                batch.set_utxo(&LocalUtxo {
                    outpoint: OutPoint::new(txid, vout as u32),
                    txout: output.clone(),
                    keychain,
                    is_spent: false,
                })?;
            }
        }

        // a sync may already know about it, don't overwrite its confirmation
        if database.get_tx(&txid, false)?.is_none() {
            let outputs_value: u64 = tx.output.iter().map(|output| output.value).sum();
            batch.set_tx(&TransactionDetails {
                transaction: Some(tx.clone()),
                txid,
                received,
                sent,
                fee: inputs_value.map(|value| value.saturating_sub(outputs_value)),
                confirmation_time: None,
            })?;
        }

        database.commit_batch(batch)?;
        info!("Broadcast transaction {}", txid);

        Ok(txid)
    }

    /// Informs the wallet that a transaction it broadcast is not going to be used anymore
    ///
    /// The transaction and the outputs it created are removed from the database, and the wallet
    /// outputs it spent become available again. Unknown transactions are ignored, confirmed ones
    /// fail with [`Error::TransactionConfirmed`].
    pub fn cancel_tx(&self, tx: &Transaction) -> Result<(), Error> {
        let txid = tx.txid();
        let mut database = self.database.write()?;

        match database.get_tx(&txid, false)? {
            None => return Ok(()),
            Some(details) if details.confirmation_time.is_some() => {
                return Err(Error::TransactionConfirmed)
            }
            Some(_) => {}
        }

        let mut batch = database.begin_batch();
        for input in tx.input.iter() {
            if let Some(utxo) = database.get_utxo(&input.previous_output)? {
                batch.set_utxo(&LocalUtxo {
                    is_spent: false,
                    ..utxo
                })?;
            }
        }
        for vout in 0..tx.output.len() {
            batch.del_utxo(&OutPoint::new(txid, vout as u32))?;
        }
        batch.del_tx(&txid)?;

        database.commit_batch(batch)?;
        debug!("Cancelled transaction {}", txid);

        Ok(())
    }
}

fn normal_index(index: u32) -> Result<u32, Error> {
    ChildNumber::from_normal_idx(index)?;
    Ok(index)
}

fn tx_version(requested: Option<tx_builder::Version>, csv: Option<Sequence>) -> Result<i32, Error> {
    match requested {
        Some(tx_builder::Version(0)) => Err(Error::Generic("Invalid version `0`".into())),
        Some(tx_builder::Version(1)) if csv.is_some() => Err(Error::Generic(
            "TxBuilder requested version `1`, but at least `2` is needed to use OP_CSV".into(),
        )),
        Some(tx_builder::Version(x)) => Ok(x),
        None if csv.is_some() => Ok(2),
        None => Ok(1),
    }
}

// Without a requested nLockTime the current height is used against fee sniping, unless the
// descriptors need a later one
fn tx_lock_time(
    requested: Option<u32>,
    timelock: Option<u32>,
    current_height: Option<u32>,
) -> Result<u32, Error> {
    let requested = match requested {
        Some(requested) => requested,
        None => {
            let fee_sniping_height = current_height.unwrap_or(0);
            return Ok(match timelock {
                Some(value) if value < LOCK_TIME_THRESHOLD && value < fee_sniping_height => {
                    fee_sniping_height
                }
                Some(value) => value,
                None => fee_sniping_height,
            });
        }
    };

    match timelock {
        Some(required) if !is_same_lock_time_unit(requested, required) || requested < required => {
            Err(Error::Generic(format!(
                "TxBuilder requested timelock of `{}`, but at least `{}` is required to spend from this script",
                requested, required
            )))
        }
        _ => Ok(requested),
    }
}

fn tx_sequence(
    rbf: Option<tx_builder::RbfValue>,
    csv: Option<Sequence>,
    lock_time: u32,
) -> Result<Sequence, Error> {
    use tx_builder::RbfValue;

    match (rbf, csv) {
        // a final nSequence would disable the nLockTime
        (None, None) if lock_time != 0 => Ok(Sequence::ENABLE_LOCKTIME_NO_RBF),
        (None, None) => Ok(Sequence::MAX),
        (None, Some(csv)) => Ok(csv),
        (Some(RbfValue::Value(rbf)), _) if rbf == Sequence::MAX => Err(Error::InvalidSequence(rbf)),
        (Some(RbfValue::Value(rbf)), Some(csv)) if !check_nsequence_rbf(rbf, csv) => {
            Err(Error::InvalidSequence(rbf))
        }
        // the csv value already signals RBF
        (Some(RbfValue::Default), Some(csv)) => Ok(csv),
        (Some(rbf), _) => Ok(rbf.get_value()),
    }
}

// Fee rate used for coin selection and the fixed fee already owed, checked against the
// transaction being replaced
fn fee_target(
    policy: FeePolicy,
    replaced: Option<tx_builder::PreviousFee>,
) -> Result<(FeeRate, u64), Error> {
    match policy {
        FeePolicy::FeeAmount(fee) => {
            if let Some(previous) = replaced {
                let required = previous.absolute + 1;
                if fee < required {
                    return Err(Error::FeeTooLow { required });
                }
            }
            Ok((FeeRate::from_sat_per_vb(0.0), fee))
        }
        FeePolicy::FeeRate(rate) => {
            if let Some(previous) = replaced {
                let required = FeeRate::from_sat_per_vb(previous.rate + 1.0);
                if rate < required {
                    return Err(Error::FeeRateTooLow { required });
                }
            }
            Ok((rate, 0))
        }
    }
}

fn is_same_lock_time_unit(a: u32, b: u32) -> bool {
    (a < LOCK_TIME_THRESHOLD) == (b < LOCK_TIME_THRESHOLD)
}

// Whether a coinbase output confirmed at `confirmation_time` can be spent at `current_height`.
// Without a known height we can't tell, and let the node decide.
fn is_mature(confirmation_time: Option<&BlockTime>, current_height: Option<u32>) -> bool {
    match (confirmation_time, current_height) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(time), Some(current_height)) => {
            current_height.saturating_sub(time.height) >= COINBASE_MATURITY
        }
    }
}

fn spends_only_wallet_outputs<D: BatchDatabase>(
    database: &D,
    tx: Option<&Transaction>,
) -> Result<bool, Error> {
    let tx = match tx {
        Some(tx) if !tx.input.is_empty() => tx,
        _ => return Ok(false),
    };

    for input in tx.input.iter() {
        if database.get_utxo(&input.previous_output)?.is_none() {
            return Ok(false);
        }
    }

    Ok(true)
}
