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

use std::fmt;

use crate::bitcoin::Network;
use crate::{descriptor, psbt, wallet};
use bitcoin::{OutPoint, Sequence};

/// Errors that can be thrown by the [`Wallet`](crate::wallet::Wallet)
#[derive(Debug)]
pub enum Error {
    /// Anything without a dedicated variant, described by the message
    Generic(String),
    /// The script has no address encoding, as with bare multisig or P2PK
    ScriptDoesntHaveAddressForm,
    /// The transaction has neither recipients nor a drain script
    NoRecipients,
    /// Nothing was chosen to spend while the builder only spends what it is given
    NoUtxosSelected,
    /// A recipient value is below the dust limit of its script
    OutputBelowDustLimit(usize),
    /// The spendable coins are worth less than the outputs plus the fee
    InsufficientFunds {
        /// Amount the transaction needs, fee included
        needed: u64,
        /// Amount the selection could gather
        available: u64,
    },
    /// The UTXO is unknown to the database
    UnknownUtxo,
    /// The outpoint passed to [`TxBuilder::add_utxo`] is not an unspent output of the wallet
    ///
    /// [`TxBuilder::add_utxo`]: crate::wallet::tx_builder::TxBuilder::add_utxo
    UnavailableUtxo(OutPoint),
    /// The transaction is unknown to the database
    TransactionNotFound,
    /// A confirmed transaction can't be replaced
    TransactionConfirmed,
    /// None of the inputs of the transaction signals replaceability
    IrreplaceableTransaction,
    /// The replacement doesn't pay a high enough fee rate
    FeeRateTooLow {
        /// Lowest acceptable rate
        required: crate::types::FeeRate,
    },
    /// The replacement doesn't pay a high enough absolute fee
    FeeTooLow {
        /// Lowest acceptable fee, in satoshi
        required: u64,
    },
    /// The fee rate of the replaced transaction is unknown
    FeeRateUnavailable,
    /// Both a fee rate and an absolute fee were set on the same [`TxBuilder`](crate::TxBuilder)
    ConflictingFeePolicy,
    /// The requested nSequence can't be used for this transaction
    InvalidSequence(Sequence),
    /// [`TxBuilder::allow_shrinking`] was given a script that none of the outputs pays to
    ///
    /// [`TxBuilder::allow_shrinking`]: crate::wallet::tx_builder::TxBuilder::allow_shrinking
    ScriptNotFound,
    /// In order to use the [`TxBuilder::add_global_xpubs`] option every extended
    /// key in the descriptor must either be a master key itself (having depth = 0) or have an
    /// explicit origin provided
    ///
    /// [`TxBuilder::add_global_xpubs`]: crate::wallet::tx_builder::TxBuilder::add_global_xpubs
    MissingKeyOrigin(String),
    /// Error while working with [`keys`](crate::keys)
    Key(crate::keys::KeyError),
    /// Descriptor checksum mismatch
    ChecksumMismatch,
    /// Signing error
    Signer(crate::wallet::signer::SignerError),
    /// Invalid network
    InvalidNetwork {
        /// requested network
        requested: Network,
        /// network of the keys found in the descriptor
        found: Network,
    },
    /// Another [`Wallet::sync`](crate::Wallet::sync) is already running on the same wallet
    SyncInProgress,

    /// Progress value must be between `0.0` (included) and `100.0` (included)
    InvalidProgressValue(f32),
    /// Progress update error (maybe the channel has been closed)
    ProgressUpdateError,
    /// Requested outpoint doesn't exist in the tx (vout greater than available outputs)
    InvalidOutpoint(OutPoint),

    /// Error related to the parsing and usage of descriptors
    Descriptor(crate::descriptor::error::Error),
    /// Encoding error
    Encode(bitcoin::consensus::encode::Error),
    /// Miniscript error
    Miniscript(miniscript::Error),
    /// Miniscript PSBT error
    MiniscriptPsbt(MiniscriptPsbtError),
    /// BIP32 error
    Bip32(bitcoin::util::bip32::Error),
    /// Error serializing or deserializing JSON data
    Json(serde_json::Error),
    /// Partially signed bitcoin transaction error
    Psbt(bitcoin::util::psbt::Error),
    /// Error while combining or extracting a PSBT
    PsbtCombine(crate::psbt::PsbtError),

    #[cfg(feature = "electrum")]
    /// Electrum client error
    Electrum(electrum_client::Error),
    #[cfg(feature = "esplora")]
    /// Esplora client error
    Esplora(Box<crate::blockchain::esplora::EsploraError>),
    #[cfg(feature = "key-value-db")]
    /// Sled database error
    Sled(sled::Error),
}

/// Errors returned by miniscript when updating inconsistent PSBTs
#[derive(Debug)]
pub enum MiniscriptPsbtError {
    /// A key in the descriptor can't be turned into a definite public key
    Conversion(miniscript::descriptor::ConversionError),
    /// An input's UTXO doesn't match the descriptor used to update it
    UtxoUpdate(miniscript::psbt::UtxoUpdateError),
    /// An output can't be updated with the descriptor
    OutputUpdate(miniscript::psbt::OutputUpdateError),
}

impl fmt::Display for MiniscriptPsbtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversion(err) => write!(f, "Conversion error: {}", err),
            Self::UtxoUpdate(err) => write!(f, "UTXO update error: {}", err),
            Self::OutputUpdate(err) => write!(f, "Output update error: {}", err),
        }
    }
}

impl std::error::Error for MiniscriptPsbtError {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic(err) => write!(f, "Generic error: {}", err),
            Self::ScriptDoesntHaveAddressForm => write!(f, "Script doesn't have address form"),
            Self::NoRecipients => write!(f, "The transaction has no recipients and no drain script"),
            Self::NoUtxosSelected => write!(f, "No UTXO was selected for spending"),
            Self::OutputBelowDustLimit(limit) => {
                write!(f, "Recipient #{} is below the dust limit", limit)
            }
            Self::InsufficientFunds { needed, available } => write!(
                f,
                "Insufficient funds: need {} sat, only {} sat available",
                needed, available
            ),
            Self::UnknownUtxo => write!(f, "Unknown UTXO"),
            Self::UnavailableUtxo(outpoint) => {
                write!(f, "UTXO {} is not an unspent output of the wallet", outpoint)
            }
            Self::TransactionNotFound => {
                write!(f, "Unknown transaction")
            }
            Self::TransactionConfirmed => write!(f, "The transaction is confirmed"),
            Self::IrreplaceableTransaction => write!(f, "The transaction doesn't signal replaceability"),
            Self::FeeRateTooLow { required } => write!(
                f,
                "Fee rate too low, at least {} sat/vB is needed",
                required.as_sat_per_vb()
            ),
            Self::FeeTooLow { required } => write!(f, "Fee too low, at least {} sat is needed", required),
            Self::FeeRateUnavailable => write!(f, "Unknown fee rate"),
            Self::ConflictingFeePolicy => {
                write!(f, "Both an absolute fee and a fee rate have been set")
            }
            Self::InvalidSequence(sequence) => write!(f, "Invalid nSequence value: {}", sequence),
            Self::ScriptNotFound => write!(f, "No output pays to the requested script"),
            Self::MissingKeyOrigin(err) => write!(f, "Missing key origin: {}", err),
            Self::Key(err) => write!(f, "Key error: {}", err),
            Self::ChecksumMismatch => write!(f, "Descriptor checksum mismatch"),
            Self::Signer(err) => write!(f, "Signer error: {}", err),
            Self::InvalidNetwork { requested, found } => write!(
                f,
                "Invalid network: requested {} but found {}",
                requested, found
            ),
            Self::SyncInProgress => write!(f, "A sync is already in progress on this wallet"),
            Self::InvalidProgressValue(progress) => {
                write!(f, "Invalid progress value: {}", progress)
            }
            Self::ProgressUpdateError => write!(
                f,
                "Progress update error (maybe the channel has been closed)"
            ),
            Self::InvalidOutpoint(outpoint) => write!(
                f,
                "Requested outpoint doesn't exist in the tx: {}",
                outpoint
            ),
            Self::Descriptor(err) => write!(f, "Descriptor error: {}", err),
            Self::Encode(err) => write!(f, "Encoding error: {}", err),
            Self::Miniscript(err) => write!(f, "Miniscript error: {}", err),
            Self::MiniscriptPsbt(err) => write!(f, "Miniscript PSBT error: {}", err),
            Self::Bip32(err) => write!(f, "BIP32 error: {}", err),
            Self::Json(err) => write!(f, "Serialize/Deserialize JSON error: {}", err),
            Self::Psbt(err) => write!(f, "PSBT error: {}", err),
            Self::PsbtCombine(err) => write!(f, "PSBT error: {}", err),
            #[cfg(feature = "electrum")]
            Self::Electrum(err) => write!(f, "Electrum client error: {}", err),
            #[cfg(feature = "esplora")]
            Self::Esplora(err) => write!(f, "Esplora client error: {}", err),
            #[cfg(feature = "key-value-db")]
            Self::Sled(err) => write!(f, "Sled database error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

macro_rules! impl_error {
    ( $from:ty, $to:ident ) => {
        impl_error!($from, $to, Error);
    };
    ( $from:ty, $to:ident, $impl_for:ty ) => {
        impl std::convert::From<$from> for $impl_for {
            fn from(err: $from) -> Self {
                <$impl_for>::$to(err)
            }
        }
    };
}

impl_error!(descriptor::error::Error, Descriptor);
impl_error!(wallet::signer::SignerError, Signer);
impl_error!(psbt::PsbtError, PsbtCombine);

impl From<crate::keys::KeyError> for Error {
    fn from(key_error: crate::keys::KeyError) -> Error {
        match key_error {
            crate::keys::KeyError::Miniscript(inner) => Error::Miniscript(inner),
            crate::keys::KeyError::Bip32(inner) => Error::Bip32(inner),
            e => Error::Key(e),
        }
    }
}

impl_error!(bitcoin::consensus::encode::Error, Encode);
impl_error!(miniscript::Error, Miniscript);
impl_error!(MiniscriptPsbtError, MiniscriptPsbt);
impl_error!(bitcoin::util::bip32::Error, Bip32);
impl_error!(serde_json::Error, Json);
impl_error!(bitcoin::util::psbt::Error, Psbt);

#[cfg(feature = "electrum")]
impl_error!(electrum_client::Error, Electrum);
#[cfg(feature = "key-value-db")]
impl_error!(sled::Error, Sled);

#[cfg(feature = "esplora")]
impl From<crate::blockchain::esplora::EsploraError> for Error {
    fn from(other: crate::blockchain::esplora::EsploraError) -> Self {
        Error::Esplora(Box::new(other))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Generic(format!("Poisoned lock: {}", err))
    }
}
