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

//! Key material
//!
//! Thin wrappers around miniscript's descriptor keys that add BIP32 derivation helpers. Paths are
//! always given as strings starting at the root marker `m`.
//!
//! ```
//! # use std::str::FromStr;
//! # use bdk_engine::keys::DescriptorSecretKey;
//! let key = DescriptorSecretKey::from_str("tprv8ZgxMBicQKsPcx5nBGsR63Pe8KnRUqmbJNENAfGftF3yuXoMMoVJJcYeUw5eVkm9WBPjWYt6HMWYJNesB5HaNVBaFc1M6dRjWSYnmewUMYy")?;
//! let account = key.derive("m/84h/1h/0h")?;
//! let external = account.as_public()?.extend("m/0")?;
//! println!("wpkh({}/*)", external);
//! # Ok::<_, bdk_engine::Error>(())
//! ```

use std::fmt;
use std::str::FromStr;

use bitcoin::secp256k1::Secp256k1;
use bitcoin::util::bip32::{self, DerivationPath};
#[cfg(feature = "keys-bip39")]
use bitcoin::Network;

use miniscript::descriptor::{self, DescriptorXKey, InnerXKey};

#[cfg(feature = "keys-bip39")]
#[cfg_attr(docsrs, doc(cfg(feature = "keys-bip39")))]
pub mod bip39;

#[cfg(feature = "keys-bip39")]
pub use self::bip39::{Mnemonic, WordCount};

fn parse_path(path: &str) -> Result<DerivationPath, KeyError> {
    DerivationPath::from_str(path).map_err(|_| KeyError::InvalidPath(path.to_string()))
}

fn has_hardened_step(path: &DerivationPath) -> bool {
    path.into_iter().any(bip32::ChildNumber::is_hardened)
}

/// An extended or single private key, with optional origin and derivation path
#[derive(Debug)]
pub struct DescriptorSecretKey(descriptor::DescriptorSecretKey);

impl DescriptorSecretKey {
    /// Build the master extended private key of a BIP39 mnemonic
    #[cfg(feature = "keys-bip39")]
    pub fn new(
        network: Network,
        mnemonic: &Mnemonic,
        password: Option<&str>,
    ) -> Result<Self, KeyError> {
        let seed = mnemonic.to_seed(password.unwrap_or(""));
        let xkey = bip32::ExtendedPrivKey::new_master(network, &seed)?;

        Ok(DescriptorSecretKey(descriptor::DescriptorSecretKey::XPrv(
            DescriptorXKey {
                origin: None,
                xkey,
                derivation_path: DerivationPath::master(),
                wildcard: descriptor::Wildcard::Unhardened,
            },
        )))
    }

    /// Derive a child key, keeping track of the full path in the key origin
    pub fn derive(&self, path: &str) -> Result<Self, KeyError> {
        let secp = Secp256k1::new();
        let path = parse_path(path)?;

        match &self.0 {
            descriptor::DescriptorSecretKey::XPrv(xkey) => {
                let derived = xkey.xkey.derive_priv(&secp, &path)?;
                let origin = match &xkey.origin {
                    Some((fingerprint, origin_path)) => (*fingerprint, origin_path.extend(&path)),
                    None => (xkey.xkey.xkey_fingerprint(&secp), path),
                };

                Ok(DescriptorSecretKey(descriptor::DescriptorSecretKey::XPrv(
                    DescriptorXKey {
                        origin: Some(origin),
                        xkey: derived,
                        derivation_path: DerivationPath::master(),
                        wildcard: xkey.wildcard,
                    },
                )))
            }
            descriptor::DescriptorSecretKey::Single(_) => Err(KeyError::NotExtendedKey),
        }
    }

    /// Append `path` to the derivation path of the key, without deriving
    pub fn extend(&self, path: &str) -> Result<Self, KeyError> {
        let path = parse_path(path)?;

        match &self.0 {
            descriptor::DescriptorSecretKey::XPrv(xkey) => {
                Ok(DescriptorSecretKey(descriptor::DescriptorSecretKey::XPrv(
                    DescriptorXKey {
                        origin: xkey.origin.clone(),
                        xkey: xkey.xkey,
                        derivation_path: xkey.derivation_path.extend(&path),
                        wildcard: xkey.wildcard,
                    },
                )))
            }
            descriptor::DescriptorSecretKey::Single(_) => Err(KeyError::NotExtendedKey),
        }
    }

    /// Return the public version of this key
    ///
    /// Private material is discarded, there's no way back.
    pub fn as_public(&self) -> Result<DescriptorPublicKey, KeyError> {
        let secp = Secp256k1::new();
        let public = self
            .0
            .to_public(&secp)
            .map_err(|e| KeyError::Message(e.to_string()))?;

        Ok(DescriptorPublicKey(public))
    }

    /// Raw bytes of the private key
    pub fn secret_bytes(&self) -> Vec<u8> {
        match &self.0 {
            descriptor::DescriptorSecretKey::XPrv(xkey) => {
                xkey.xkey.private_key.secret_bytes().to_vec()
            }
            descriptor::DescriptorSecretKey::Single(single) => {
                single.key.inner.secret_bytes().to_vec()
            }
        }
    }

    /// Return the inner miniscript key
    pub fn into_inner(self) -> descriptor::DescriptorSecretKey {
        self.0
    }
}

impl FromStr for DescriptorSecretKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        descriptor::DescriptorSecretKey::from_str(s)
            .map(DescriptorSecretKey)
            .map_err(|e| KeyError::Message(e.to_string()))
    }
}

impl fmt::Display for DescriptorSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An extended or single public key, with optional origin and derivation path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPublicKey(descriptor::DescriptorPublicKey);

impl DescriptorPublicKey {
    /// Derive a child key, keeping track of the full path in the key origin
    ///
    /// Fails on hardened steps, which need the private key.
    pub fn derive(&self, path: &str) -> Result<Self, KeyError> {
        let secp = Secp256k1::new();
        let path = parse_path(path)?;
        if has_hardened_step(&path) {
            return Err(KeyError::HardenedDerivationOnPublicKey);
        }

        match &self.0 {
            descriptor::DescriptorPublicKey::XPub(xkey) => {
                let derived = xkey.xkey.derive_pub(&secp, &path)?;
                let origin = match &xkey.origin {
                    Some((fingerprint, origin_path)) => (*fingerprint, origin_path.extend(&path)),
                    None => (xkey.xkey.fingerprint(), path),
                };

                Ok(DescriptorPublicKey(descriptor::DescriptorPublicKey::XPub(
                    DescriptorXKey {
                        origin: Some(origin),
                        xkey: derived,
                        derivation_path: DerivationPath::master(),
                        wildcard: xkey.wildcard,
                    },
                )))
            }
            descriptor::DescriptorPublicKey::Single(_) => Err(KeyError::NotExtendedKey),
        }
    }

    /// Append `path` to the derivation path of the key, without deriving
    pub fn extend(&self, path: &str) -> Result<Self, KeyError> {
        let path = parse_path(path)?;
        if has_hardened_step(&path) {
            return Err(KeyError::HardenedDerivationOnPublicKey);
        }

        match &self.0 {
            descriptor::DescriptorPublicKey::XPub(xkey) => {
                Ok(DescriptorPublicKey(descriptor::DescriptorPublicKey::XPub(
                    DescriptorXKey {
                        origin: xkey.origin.clone(),
                        xkey: xkey.xkey,
                        derivation_path: xkey.derivation_path.extend(&path),
                        wildcard: xkey.wildcard,
                    },
                )))
            }
            descriptor::DescriptorPublicKey::Single(_) => Err(KeyError::NotExtendedKey),
        }
    }

    /// Return the inner miniscript key
    pub fn into_inner(self) -> descriptor::DescriptorPublicKey {
        self.0
    }
}

impl FromStr for DescriptorPublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        descriptor::DescriptorPublicKey::from_str(s)
            .map(DescriptorPublicKey)
            .map_err(|e| KeyError::Message(e.to_string()))
    }
}

impl fmt::Display for DescriptorPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors thrown while working with keys
#[derive(Debug)]
pub enum KeyError {
    /// The key is not valid for the given network
    InvalidNetwork,
    /// The mnemonic has an invalid checksum
    InvalidChecksum,
    /// The derivation path doesn't start at the root marker `m` or can't be parsed
    InvalidPath(String),
    /// A hardened child was requested on a public key
    HardenedDerivationOnPublicKey,
    /// Derivation was requested on a single (non-extended) key
    NotExtendedKey,
    /// The mnemonic has an invalid number of words
    InvalidWordCount(usize),
    /// The word at this position is not part of the BIP39 word list
    UnknownWord(usize),
    /// Entropy must be a multiple of 4 bytes, between 16 and 32 bytes
    InvalidEntropyLength(usize),

    /// Custom error message
    Message(String),

    /// BIP32 error
    Bip32(bitcoin::util::bip32::Error),
    /// Miniscript error
    Miniscript(miniscript::Error),
}

impl_error!(miniscript::Error, Miniscript, KeyError);
impl_error!(bitcoin::util::bip32::Error, Bip32, KeyError);

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidNetwork => write!(f, "Invalid network"),
            Self::InvalidChecksum => write!(f, "Invalid checksum"),
            Self::InvalidPath(path) => write!(f, "Invalid derivation path: {}", path),
            Self::HardenedDerivationOnPublicKey => {
                write!(f, "Hardened derivation requested on a public key")
            }
            Self::NotExtendedKey => write!(f, "Derivation requires an extended key"),
            Self::InvalidWordCount(count) => write!(f, "Invalid word count: {}", count),
            Self::UnknownWord(index) => write!(f, "Unknown word at position {}", index),
            Self::InvalidEntropyLength(len) => write!(f, "Invalid entropy length: {}", len),
            Self::Message(err) => write!(f, "{}", err),
            Self::Bip32(err) => write!(f, "BIP32 error: {}", err),
            Self::Miniscript(err) => write!(f, "Miniscript error: {}", err),
        }
    }
}

impl std::error::Error for KeyError {}

#[cfg(test)]
pub mod test {
    use assert_matches::assert_matches;

    use super::*;

    const TPRV: &str = "tprv8ZgxMBicQKsPcx5nBGsR63Pe8KnRUqmbJNENAfGftF3yuXoMMoVJJcYeUw5eVkm9WBPjWYt6HMWYJNesB5HaNVBaFc1M6dRjWSYnmewUMYy";

    #[test]
    fn test_derive_keeps_origin() {
        let master = DescriptorSecretKey::from_str(TPRV).unwrap();
        let account = master.derive("m/84h/1h/0h").unwrap();
        let account_str = account.to_string();
        assert!(account_str.starts_with('['));
        assert!(account_str.contains("/84'/1'/0']tprv"));

        // deriving in two steps yields the same key as deriving at once
        let two_steps = master.derive("m/84h").unwrap().derive("m/1h/0h").unwrap();
        assert_eq!(two_steps.to_string(), account_str);
    }

    #[test]
    fn test_extend_appends_path() {
        let master = DescriptorSecretKey::from_str(TPRV).unwrap();
        let extended = master.extend("m/0").unwrap().extend("m/1").unwrap();
        assert_eq!(extended.to_string(), format!("{}/0/1", TPRV));
        assert_eq!(extended.secret_bytes(), master.secret_bytes());
    }

    #[test]
    fn test_invalid_path() {
        let master = DescriptorSecretKey::from_str(TPRV).unwrap();
        assert_matches!(master.derive("0/1"), Err(KeyError::InvalidPath(_)));
        assert_matches!(master.extend("n/0"), Err(KeyError::InvalidPath(_)));
    }

    #[test]
    fn test_public_derivation() {
        let master = DescriptorSecretKey::from_str(TPRV).unwrap();
        let public = master.as_public().unwrap();

        assert_matches!(
            public.derive("m/0h"),
            Err(KeyError::HardenedDerivationOnPublicKey)
        );
        assert_matches!(
            public.extend("m/0h"),
            Err(KeyError::HardenedDerivationOnPublicKey)
        );

        // derive then project equals project then derive for unhardened paths
        let from_private = master.derive("m/0/1").unwrap().as_public().unwrap();
        let from_public = public.derive("m/0/1").unwrap();
        assert_eq!(from_private, from_public);
    }

    #[test]
    fn test_single_key_cannot_derive() {
        let single =
            DescriptorSecretKey::from_str("cVpPVruEDdmutPzisEsYvtST1usBR3ntr8pXSyt6D2YYqXRyPcFW")
                .unwrap();
        assert_matches!(single.derive("m/0"), Err(KeyError::NotExtendedKey));
        assert_eq!(single.secret_bytes().len(), 32);
    }
}
