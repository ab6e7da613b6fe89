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


//! Signers
//!
//! Every private key found in a descriptor becomes a software signer. More signers, for instance
//! one talking to an external device, can be registered with
//! [`Wallet::add_signer`](super::Wallet::add_signer).
//!
//! ```
//! # use std::sync::Arc;
//! # use bitcoin::util::psbt::PartiallySignedTransaction as Psbt;
//! # use bitcoin::*;
//! # use bdk_engine::wallet::signer::*;
//! # use bitcoin::secp256k1::{All, Secp256k1};
//! # use bdk_engine::database::MemoryDatabase;
//! # use bdk_engine::*;
//! #[derive(Debug)]
//! struct Cosigner {
//!     serial: u64,
//! }
//!
//! impl SignerCommon for Cosigner {
//!     fn id(&self, _secp: &Secp256k1<All>) -> SignerId {
//!         SignerId::Dummy(self.serial)
//!     }
//! }
//!
//! impl InputSigner for Cosigner {
//!     fn sign_input(
//!         &self,
//!         _psbt: &mut Psbt,
//!         _input_index: usize,
//!         _sign_options: &SignOptions,
//!         _secp: &Secp256k1<All>,
//!     ) -> Result<(), SignerError> {
//!         // ask the device for a signature here
//!         Err(SignerError::UserCanceled)
//!     }
//! }
//!
//! let descriptor = "wpkh(tpubD6NzVbkrYhZ4Xferm7Pz4VnjdcDPFyjVu5K4iZXQ4pVN8Cks4pHVowTBXBKRhX64pkRyJZJN5xAKj4UDNnLPb5p2sSKXhewoYx5GbTdUFWq/*)";
//! let mut wallet = Wallet::new(descriptor, None, Network::Testnet, MemoryDatabase::default())?;
//! wallet.add_signer(
//!     KeychainKind::External,
//!     SignerOrdering(200),
//!     Arc::new(Cosigner { serial: 7 }),
//! );
//! # Ok::<_, bdk_engine::Error>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bitcoin::blockdata::opcodes::all as op;
use bitcoin::blockdata::script::Builder as ScriptBuilder;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::{self, Message};
use bitcoin::util::bip32::{DerivationPath, ExtendedPrivKey, Fingerprint, KeySource};
use bitcoin::util::psbt::{Input as PsbtInput, PartiallySignedTransaction as Psbt};
use bitcoin::util::sighash::{self, SighashCache};
use bitcoin::{EcdsaSig, EcdsaSighashType, PrivateKey, PublicKey, Script, Sighash, TxOut};

use miniscript::descriptor::{
    Descriptor, DescriptorPublicKey, DescriptorSecretKey, DescriptorXKey, KeyMap, SinglePriv,
};

use super::utils::SecpCtx;
use crate::descriptor::DescriptorMeta;

/// Key used to look a signer up in a [`SignersContainer`]
#[derive(Debug, Clone, Ord, PartialOrd, PartialEq, Eq, Hash)]
pub enum SignerId {
    /// HASH160 of the public key of a single key signer
    PkHash(hash160::Hash),
    /// Fingerprint of the master key of an extended key signer
    Fingerprint(Fingerprint),
    /// Arbitrary number, for signers that have no key to show
    Dummy(u64),
}

impl From<hash160::Hash> for SignerId {
    fn from(hash: hash160::Hash) -> SignerId {
        SignerId::PkHash(hash)
    }
}

impl From<Fingerprint> for SignerId {
    fn from(fingerprint: Fingerprint) -> SignerId {
        SignerId::Fingerprint(fingerprint)
    }
}

/// Errors raised while signing
#[derive(Debug)]
pub enum SignerError {
    /// The signer has no key for this input
    MissingKey,
    /// The key has the expected fingerprint but derives to a different public key
    InvalidKey,
    /// The operation was refused on the signing device
    UserCanceled,
    /// The PSBT has no input at this index
    InputIndexOutOfRange,
    /// The input is missing its `non_witness_utxo`
    MissingNonWitnessUtxo,
    /// The `non_witness_utxo` doesn't match the outpoint being spent
    InvalidNonWitnessUtxo,
    /// A segwit input spends a script but carries no `witness_script`
    MissingWitnessScript,
    /// An input asks for a sighash other than `SIGHASH_ALL`
    ///
    /// Set [`SignOptions::allow_all_sighashes`] to sign it anyway.
    NonStandardSighash,
    /// The sighash type is not valid for ECDSA signatures
    InvalidSighash,
    /// The signature hash could not be computed
    SighashError(sighash::Error),
}

impl From<sighash::Error> for SignerError {
    fn from(e: sighash::Error) -> Self {
        SignerError::SighashError(e)
    }
}

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey => write!(f, "No private key for this input"),
            Self::InvalidKey => write!(f, "The private key doesn't derive the expected public key"),
            Self::UserCanceled => write!(f, "Signing was canceled"),
            Self::InputIndexOutOfRange => write!(f, "No input at this index"),
            Self::MissingNonWitnessUtxo => write!(f, "The input has no non-witness UTXO"),
            Self::InvalidNonWitnessUtxo => write!(f, "The non-witness UTXO doesn't match the input"),
            Self::MissingWitnessScript => write!(f, "The input has no witness script"),
            Self::NonStandardSighash => write!(f, "The PSBT asks for a non-standard sighash"),
            Self::InvalidSighash => write!(f, "Invalid sighash type for an ECDSA signature"),
            Self::SighashError(err) => write!(f, "Can't compute the sighash: {}", err),
        }
    }
}

impl std::error::Error for SignerError {}

/// Script context a software signer works in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerContext {
    /// Pre-segwit inputs, signed over the whole previous transaction
    Legacy,
    /// Segwit v0 inputs, signed following BIP143
    Segwitv0,
}

impl SignerContext {
    fn of(descriptor: &Descriptor<DescriptorPublicKey>) -> Self {
        if descriptor.is_witness() {
            SignerContext::Segwitv0
        } else {
            SignerContext::Legacy
        }
    }
}

/// A key together with the context it signs in
#[derive(Debug, Clone)]
pub struct SignerWrapper<K> {
    key: K,
    ctx: SignerContext,
}

impl<K> SignerWrapper<K> {
    /// Pair `key` with `ctx`
    pub fn new(key: K, ctx: SignerContext) -> Self {
        SignerWrapper { key, ctx }
    }
}

/// Methods shared by every signer
pub trait SignerCommon: fmt::Debug + Send + Sync {
    /// Identifier of this signer
    fn id(&self, secp: &SecpCtx) -> SignerId;

    /// The secret key behind this signer, if it is willing to share it
    fn descriptor_secret_key(&self) -> Option<DescriptorSecretKey> {
        None
    }
}

/// A signer that works one input at a time
///
/// Implementing it gives a [`TransactionSigner`] for free.
pub trait InputSigner: SignerCommon {
    /// Add this signer's signatures to input `input_index`
    fn sign_input(
        &self,
        psbt: &mut Psbt,
        input_index: usize,
        sign_options: &SignOptions,
        secp: &SecpCtx,
    ) -> Result<(), SignerError>;
}

/// A signer that processes the whole PSBT at once
pub trait TransactionSigner: SignerCommon {
    /// Add this signer's signatures to every input it can sign
    fn sign_transaction(
        &self,
        psbt: &mut Psbt,
        sign_options: &SignOptions,
        secp: &SecpCtx,
    ) -> Result<(), SignerError>;
}

impl<T: InputSigner> TransactionSigner for T {
    fn sign_transaction(
        &self,
        psbt: &mut Psbt,
        sign_options: &SignOptions,
        secp: &SecpCtx,
    ) -> Result<(), SignerError> {
        (0..psbt.inputs.len()).try_for_each(|i| self.sign_input(psbt, i, sign_options, secp))
    }
}

fn master_fingerprint(xprv: &DescriptorXKey<ExtendedPrivKey>, secp: &SecpCtx) -> Fingerprint {
    xprv.origin
        .as_ref()
        .map(|(fingerprint, _)| *fingerprint)
        .unwrap_or_else(|| xprv.xkey.fingerprint(secp))
}

/// Whether the input still needs signatures
fn is_open(psbt: &Psbt, input_index: usize) -> Result<bool, SignerError> {
    let input = psbt
        .inputs
        .get(input_index)
        .ok_or(SignerError::InputIndexOutOfRange)?;
    if input_index >= psbt.unsigned_tx.input.len() {
        return Err(SignerError::InputIndexOutOfRange);
    }
    Ok(input.final_script_sig.is_none() && input.final_script_witness.is_none())
}

impl SignerCommon for SignerWrapper<DescriptorXKey<ExtendedPrivKey>> {
    fn id(&self, secp: &SecpCtx) -> SignerId {
        master_fingerprint(&self.key, secp).into()
    }

    fn descriptor_secret_key(&self) -> Option<DescriptorSecretKey> {
        Some(DescriptorSecretKey::XPrv(self.key.clone()))
    }
}

impl SignerWrapper<DescriptorXKey<ExtendedPrivKey>> {
    /// Path from this xprv to the key at `full_path`, which starts at the master key
    fn relative_path(&self, (_, full_path): &KeySource) -> DerivationPath {
        match &self.key.origin {
            Some((_, origin)) => full_path
                .as_ref()
                .get(origin.as_ref().len()..)
                .unwrap_or_default()
                .to_vec()
                .into(),
            None => full_path.clone(),
        }
    }
}

impl InputSigner for SignerWrapper<DescriptorXKey<ExtendedPrivKey>> {
    fn sign_input(
        &self,
        psbt: &mut Psbt,
        input_index: usize,
        sign_options: &SignOptions,
        secp: &SecpCtx,
    ) -> Result<(), SignerError> {
        if !is_open(psbt, input_index)? {
            return Ok(());
        }

        let (expected, path) = match psbt.inputs[input_index]
            .bip32_derivation
            .iter()
            .find(|(_, source)| self.key.matches(source, secp).is_some())
        {
            Some((pk, source)) => (*pk, self.relative_path(source)),
            None => return Ok(()),
        };

        let derived = self
            .key
            .xkey
            .derive_priv(secp, &path)
            .map_err(|_| SignerError::InvalidKey)?;
        if secp256k1::PublicKey::from_secret_key(secp, &derived.private_key) != expected {
            return Err(SignerError::InvalidKey);
        }

        let single = PrivateKey::new(derived.private_key, self.key.xkey.network);
        SignerWrapper::new(single, self.ctx).sign_input(psbt, input_index, sign_options, secp)
    }
}

impl SignerCommon for SignerWrapper<PrivateKey> {
    fn id(&self, secp: &SecpCtx) -> SignerId {
        hash160::Hash::hash(&self.key.public_key(secp).to_bytes()).into()
    }

    fn descriptor_secret_key(&self) -> Option<DescriptorSecretKey> {
        Some(DescriptorSecretKey::Single(SinglePriv {
            key: self.key,
            origin: None,
        }))
    }
}

impl InputSigner for SignerWrapper<PrivateKey> {
    fn sign_input(
        &self,
        psbt: &mut Psbt,
        input_index: usize,
        sign_options: &SignOptions,
        secp: &SecpCtx,
    ) -> Result<(), SignerError> {
        if !is_open(psbt, input_index)? {
            return Ok(());
        }

        let pubkey = self.key.public_key(secp);
        if psbt.inputs[input_index].partial_sigs.contains_key(&pubkey) {
            return Ok(());
        }

        let (hash, hash_ty) = match self.ctx {
            SignerContext::Legacy => legacy_sighash(psbt, input_index)?,
            SignerContext::Segwitv0 => segwit_sighash(psbt, input_index)?,
        };
        add_signature(
            &self.key.inner,
            pubkey,
            &mut psbt.inputs[input_index],
            hash,
            hash_ty,
            secp,
            sign_options.allow_grinding,
        )
    }
}

fn add_signature(
    secret_key: &secp256k1::SecretKey,
    pubkey: PublicKey,
    input: &mut PsbtInput,
    hash: Sighash,
    hash_ty: EcdsaSighashType,
    secp: &SecpCtx,
    low_r: bool,
) -> Result<(), SignerError> {
    let msg = Message::from_slice(&hash[..]).map_err(|_| SignerError::InvalidSighash)?;
    let sig = if low_r {
        secp.sign_ecdsa_low_r(&msg, secret_key)
    } else {
        secp.sign_ecdsa(&msg, secret_key)
    };
    input.partial_sigs.insert(pubkey, EcdsaSig { sig, hash_ty });

    Ok(())
}

/// Position of a signer in the signing sequence
///
/// Lower values sign first, so a signer with a higher ordering sees the partial signatures of
/// the ones before it. Defaults to `100`.
#[derive(Debug, Clone, Copy, PartialOrd, PartialEq, Ord, Eq)]
pub struct SignerOrdering(pub usize);

impl Default for SignerOrdering {
    fn default() -> Self {
        SignerOrdering(100)
    }
}

/// The signers of one keychain, kept sorted by [`SignerOrdering`]
#[derive(Debug, Default, Clone)]
pub struct SignersContainer(BTreeMap<(SignerOrdering, SignerId), Arc<dyn TransactionSigner>>);

impl SignersContainer {
    /// An empty container
    pub fn new() -> Self {
        SignersContainer::default()
    }

    /// One software signer per secret key of `keymap`, in the context of `descriptor`
    pub fn build(
        keymap: KeyMap,
        descriptor: &Descriptor<DescriptorPublicKey>,
        secp: &SecpCtx,
    ) -> SignersContainer {
        let ctx = SignerContext::of(descriptor);
        let mut container = SignersContainer::new();

        for secret in keymap.into_values() {
            let signer: Arc<dyn TransactionSigner> = match secret {
                DescriptorSecretKey::Single(single) => Arc::new(SignerWrapper::new(single.key, ctx)),
                DescriptorSecretKey::XPrv(xprv) => Arc::new(SignerWrapper::new(xprv, ctx)),
            };
            container.add_external(signer.id(secp), SignerOrdering::default(), signer);
        }

        container
    }

    /// The secret keys the signers expose, indexed by their public key
    pub fn as_key_map(&self, secp: &SecpCtx) -> KeyMap {
        self.0
            .values()
            .filter_map(|signer| signer.descriptor_secret_key())
            .filter_map(|secret| Some((secret.to_public(secp).ok()?, secret)))
            .collect()
    }

    /// Insert `signer`, returning the one it replaced
    pub fn add_external(
        &mut self,
        id: SignerId,
        ordering: SignerOrdering,
        signer: Arc<dyn TransactionSigner>,
    ) -> Option<Arc<dyn TransactionSigner>> {
        self.0.insert((ordering, id), signer)
    }

    /// Take a signer out of the container
    pub fn remove(
        &mut self,
        id: SignerId,
        ordering: SignerOrdering,
    ) -> Option<Arc<dyn TransactionSigner>> {
        self.0.remove(&(ordering, id))
    }

    /// Identifiers of every signer, in signing order
    pub fn ids(&self) -> Vec<&SignerId> {
        self.0.keys().map(|(_, id)| id).collect()
    }

    /// Every signer, in signing order
    pub fn signers(&self) -> Vec<&Arc<dyn TransactionSigner>> {
        self.0.values().collect()
    }

    /// The first signer in signing order registered under `id`
    pub fn find(&self, id: SignerId) -> Option<&Arc<dyn TransactionSigner>> {
        self.0
            .iter()
            .find(|((_, signer_id), _)| *signer_id == id)
            .map(|(_, signer)| signer)
    }
}

/// Knobs for the software signers and for finalization
#[derive(Debug, Clone)]
pub struct SignOptions {
    /// Accept a `witness_utxo` alone, without the full previous transaction
    ///
    /// Off by default: a `witness_utxo` can lie about the amount being spent and trick the
    /// signer into paying a larger fee.
    pub trust_witness_utxo: bool,

    /// Height to finalize at, instead of the last synced one
    ///
    /// Timelocked branches only become usable once this height is reached.
    pub assume_height: Option<u32>,

    /// Sign inputs that ask for any sighash type, not only `SIGHASH_ALL`
    pub allow_all_sighashes: bool,

    /// Drop the partial signatures of an input once it is finalized. Defaults to `true`.
    pub remove_partial_sigs: bool,

    /// Finalize the PSBT after signing. Defaults to `true`.
    pub try_finalize: bool,

    /// Grind ECDSA nonces until the signature has a low `r`. Defaults to `true`.
    pub allow_grinding: bool,
}

impl Default for SignOptions {
    fn default() -> Self {
        SignOptions {
            trust_witness_utxo: false,
            assume_height: None,
            allow_all_sighashes: false,
            remove_partial_sigs: true,
            try_finalize: true,
            allow_grinding: true,
        }
    }
}

fn ecdsa_hash_ty(input: &PsbtInput) -> Result<EcdsaSighashType, SignerError> {
    match input.sighash_type {
        Some(ty) => ty.ecdsa_hash_ty().map_err(|_| SignerError::InvalidSighash),
        None => Ok(EcdsaSighashType::All),
    }
}

/// Output spent by input `input_index`, taken from the previous transaction
fn spent_output(psbt: &Psbt, input_index: usize) -> Result<Option<&TxOut>, SignerError> {
    let outpoint = psbt.unsigned_tx.input[input_index].previous_output;
    match &psbt.inputs[input_index].non_witness_utxo {
        Some(prev_tx) if prev_tx.txid() != outpoint.txid => Err(SignerError::InvalidNonWitnessUtxo),
        Some(prev_tx) => prev_tx
            .output
            .get(outpoint.vout as usize)
            .map(Some)
            .ok_or(SignerError::InvalidNonWitnessUtxo),
        None => Ok(None),
    }
}

pub(crate) fn legacy_sighash(
    psbt: &Psbt,
    input_index: usize,
) -> Result<(Sighash, EcdsaSighashType), SignerError> {
    is_open(psbt, input_index)?;
    let input = &psbt.inputs[input_index];
    let hash_ty = ecdsa_hash_ty(input)?;

    let script_code = match &input.redeem_script {
        Some(redeem_script) => redeem_script.clone(),
        None => spent_output(psbt, input_index)?
            .ok_or(SignerError::MissingNonWitnessUtxo)?
            .script_pubkey
            .clone(),
    };
    let hash = SighashCache::new(&psbt.unsigned_tx).legacy_signature_hash(
        input_index,
        &script_code,
        hash_ty.to_u32(),
    )?;

    Ok((hash, hash_ty))
}

/// BIP143 script code of a P2WPKH program
fn p2wpkh_script_code(program: &Script) -> Script {
    ScriptBuilder::new()
        .push_opcode(op::OP_DUP)
        .push_opcode(op::OP_HASH160)
        .push_slice(&program.as_bytes()[2..])
        .push_opcode(op::OP_EQUALVERIFY)
        .push_opcode(op::OP_CHECKSIG)
        .into_script()
}

pub(crate) fn segwit_sighash(
    psbt: &Psbt,
    input_index: usize,
) -> Result<(Sighash, EcdsaSighashType), SignerError> {
    is_open(psbt, input_index)?;
    let input = &psbt.inputs[input_index];
    let hash_ty = ecdsa_hash_ty(input)?;

    // the full previous transaction wins over `witness_utxo` when both are there
    let utxo = match spent_output(psbt, input_index)? {
        Some(utxo) => utxo,
        None => input
            .witness_utxo
            .as_ref()
            .ok_or(SignerError::MissingNonWitnessUtxo)?,
    };

    let script_code = if let Some(witness_script) = &input.witness_script {
        witness_script.clone()
    } else if utxo.script_pubkey.is_v0_p2wpkh() {
        p2wpkh_script_code(&utxo.script_pubkey)
    } else {
        match &input.redeem_script {
            Some(nested) if nested.is_v0_p2wpkh() => p2wpkh_script_code(nested),
            _ => return Err(SignerError::MissingWitnessScript),
        }
    };
    let hash = SighashCache::new(&psbt.unsigned_tx).segwit_signature_hash(
        input_index,
        &script_code,
        utxo.value,
        hash_ty,
    )?;

    Ok((hash, hash_ty))
}
