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

//! Descriptors
//!
//! This module contains generic utilities to work with descriptors, plus some re-exported types
//! from [`miniscript`].

use bitcoin::util::bip32::{ChildNumber, ExtendedPubKey};
use bitcoin::{Network, Script, Sequence};

use miniscript::descriptor::{DescriptorSecretKey, DescriptorType, ShInner, WshInner};
pub use miniscript::{
    descriptor::DefiniteDescriptorKey, descriptor::DescriptorXKey, descriptor::KeyMap,
    descriptor::Wildcard, Descriptor, DescriptorPublicKey, Legacy, Miniscript, ScriptContext,
    Segwitv0,
};
use miniscript::{ForEachKey, Terminal};

pub mod checksum;
pub mod error;

pub use self::checksum::calc_checksum;
pub use self::error::Error as DescriptorError;
use crate::keys::KeyError;
use crate::wallet::utils::SecpCtx;

/// Alias for a [`Descriptor`] that can contain extended keys using [`DescriptorPublicKey`]
pub type ExtendedDescriptor = Descriptor<DescriptorPublicKey>;

/// Alias for a [`Descriptor`] that contains extended **derived** keys
pub type DerivedDescriptor = Descriptor<DefiniteDescriptorKey>;

/// Trait for types which can be converted into an [`ExtendedDescriptor`] and a [`KeyMap`] usable by a wallet in a specific [`Network`]
pub trait IntoWalletDescriptor {
    /// Convert to wallet descriptor
    fn into_wallet_descriptor(
        self,
        secp: &SecpCtx,
        network: Network,
    ) -> Result<(ExtendedDescriptor, KeyMap), DescriptorError>;
}

impl IntoWalletDescriptor for &str {
    fn into_wallet_descriptor(
        self,
        secp: &SecpCtx,
        network: Network,
    ) -> Result<(ExtendedDescriptor, KeyMap), DescriptorError> {
        let descriptor = match self.split_once('#') {
            Some((descriptor, _)) => {
                calc_checksum(self)?;
                descriptor
            }
            None => self,
        };

        ExtendedDescriptor::parse_descriptor(secp, descriptor)
            .map_err(|e| DescriptorError::InvalidDescriptor(e.to_string()))?
            .into_wallet_descriptor(secp, network)
    }
}

impl IntoWalletDescriptor for &String {
    fn into_wallet_descriptor(
        self,
        secp: &SecpCtx,
        network: Network,
    ) -> Result<(ExtendedDescriptor, KeyMap), DescriptorError> {
        self.as_str().into_wallet_descriptor(secp, network)
    }
}

impl IntoWalletDescriptor for String {
    fn into_wallet_descriptor(
        self,
        secp: &SecpCtx,
        network: Network,
    ) -> Result<(ExtendedDescriptor, KeyMap), DescriptorError> {
        self.as_str().into_wallet_descriptor(secp, network)
    }
}

impl IntoWalletDescriptor for ExtendedDescriptor {
    fn into_wallet_descriptor(
        self,
        secp: &SecpCtx,
        network: Network,
    ) -> Result<(ExtendedDescriptor, KeyMap), DescriptorError> {
        (self, KeyMap::default()).into_wallet_descriptor(secp, network)
    }
}

impl IntoWalletDescriptor for (ExtendedDescriptor, KeyMap) {
    fn into_wallet_descriptor(
        self,
        _secp: &SecpCtx,
        network: Network,
    ) -> Result<(ExtendedDescriptor, KeyMap), DescriptorError> {
        let (descriptor, keymap) = self;

        let public_keys_ok = descriptor.for_each_key(|pk| match pk {
            DescriptorPublicKey::XPub(xpub) => is_valid_network(xpub.xkey.network, network),
            DescriptorPublicKey::Single(_) => true,
        });
        let secret_keys_ok = keymap.values().all(|secret| match secret {
            DescriptorSecretKey::XPrv(xprv) => is_valid_network(xprv.xkey.network, network),
            DescriptorSecretKey::Single(single) => is_valid_network(single.key.network, network),
        });

        if !public_keys_ok || !secret_keys_ok {
            return Err(DescriptorError::Key(KeyError::InvalidNetwork));
        }

        Ok((descriptor, keymap))
    }
}

// Extended keys and WIFs only encode "mainnet" or "testnet": the testnet encoding is shared by
// every test network.
fn is_valid_network(key_network: Network, network: Network) -> bool {
    match network {
        Network::Bitcoin => key_network == Network::Bitcoin,
        _ => key_network != Network::Bitcoin,
    }
}

/// Wrapper for `IntoWalletDescriptor` that performs additional checks on the keys contained in the
/// descriptor
pub(crate) fn into_wallet_descriptor_checked<T: IntoWalletDescriptor>(
    inner: T,
    secp: &SecpCtx,
    network: Network,
) -> Result<(ExtendedDescriptor, KeyMap), DescriptorError> {
    let (descriptor, keymap) = inner.into_wallet_descriptor(secp, network)?;

    let descriptor_contains_hardened_steps = descriptor.for_any_key(|k| {
        if let DescriptorPublicKey::XPub(DescriptorXKey {
            derivation_path,
            wildcard,
            ..
        }) = k
        {
            return *wildcard == Wildcard::Hardened
                || derivation_path.into_iter().any(ChildNumber::is_hardened);
        }

        false
    });
    if descriptor_contains_hardened_steps {
        return Err(DescriptorError::HardenedDerivationXpub);
    }

    Ok((descriptor, keymap))
}

pub(crate) trait DescriptorMeta {
    fn is_witness(&self) -> bool;
    fn is_taproot(&self) -> bool;
    fn is_derivable(&self) -> bool;
    fn derive_script(&self, index: u32) -> Result<Script, DescriptorError>;
    fn derive_definite(&self, index: u32) -> Result<DerivedDescriptor, DescriptorError>;
    fn get_extended_keys(&self) -> Vec<DescriptorXKey<ExtendedPubKey>>;
    fn csv_requirement(&self) -> Option<Sequence>;
    fn timelock_requirement(&self) -> Option<u32>;
    fn checksum(&self) -> Result<String, DescriptorError>;
}

impl DescriptorMeta for ExtendedDescriptor {
    fn is_witness(&self) -> bool {
        matches!(
            self.desc_type(),
            DescriptorType::Wpkh
                | DescriptorType::ShWpkh
                | DescriptorType::Wsh
                | DescriptorType::ShWsh
                | DescriptorType::ShWshSortedMulti
                | DescriptorType::WshSortedMulti
        )
    }

    fn is_taproot(&self) -> bool {
        self.desc_type() == DescriptorType::Tr
    }

    fn is_derivable(&self) -> bool {
        self.has_wildcard()
    }

    fn derive_script(&self, index: u32) -> Result<Script, DescriptorError> {
        Ok(self.derive_definite(index)?.script_pubkey())
    }

    fn derive_definite(&self, index: u32) -> Result<DerivedDescriptor, DescriptorError> {
        // fixed descriptors yield the same script for every index
        if !self.is_derivable() {
            return Ok(self.at_derivation_index(0));
        }
        // wildcards only derive normal children
        ChildNumber::from_normal_idx(index)?;
        Ok(self.at_derivation_index(index))
    }

    fn get_extended_keys(&self) -> Vec<DescriptorXKey<ExtendedPubKey>> {
        let mut answer = Vec::new();

        self.for_each_key(|pk| {
            if let DescriptorPublicKey::XPub(xpub) = pk {
                answer.push(xpub.clone());
            }

            true
        });

        answer
    }

    fn csv_requirement(&self) -> Option<Sequence> {
        let mut timelocks = Timelocks::default();
        timelocks.visit_descriptor(self);
        timelocks.older.map(Sequence)
    }

    fn timelock_requirement(&self) -> Option<u32> {
        let mut timelocks = Timelocks::default();
        timelocks.visit_descriptor(self);
        timelocks.after
    }

    fn checksum(&self) -> Result<String, DescriptorError> {
        calc_checksum(&self.to_string())
    }
}

/// Largest `older` and `after` terms found in a descriptor
#[derive(Debug, Default)]
struct Timelocks {
    older: Option<u32>,
    after: Option<u32>,
}

impl Timelocks {
    fn visit_descriptor(&mut self, descriptor: &ExtendedDescriptor) {
        match descriptor {
            Descriptor::Bare(bare) => self.visit(bare.as_inner()),
            Descriptor::Sh(sh) => match sh.as_inner() {
                ShInner::Wsh(wsh) => match wsh.as_inner() {
                    WshInner::Ms(ms) => self.visit(ms),
                    WshInner::SortedMulti(_) => {}
                },
                ShInner::Ms(ms) => self.visit(ms),
                ShInner::Wpkh(_) | ShInner::SortedMulti(_) => {}
            },
            Descriptor::Wsh(wsh) => match wsh.as_inner() {
                WshInner::Ms(ms) => self.visit(ms),
                WshInner::SortedMulti(_) => {}
            },
            Descriptor::Tr(tr) => {
                for (_, ms) in tr.iter_scripts() {
                    self.visit(ms);
                }
            }
            Descriptor::Pkh(_) | Descriptor::Wpkh(_) => {}
        }
    }

    fn visit<Ctx: ScriptContext>(&mut self, ms: &Miniscript<DescriptorPublicKey, Ctx>) {
        for node in ms.iter() {
            match &node.node {
                Terminal::Older(sequence) => {
                    let value = sequence.to_consensus_u32();
                    self.older = Some(self.older.map_or(value, |v| v.max(value)));
                }
                Terminal::After(locktime) => {
                    let value = locktime.to_u32();
                    self.after = Some(self.after.map_or(value, |v| v.max(value)));
                }
                _ => {}
            }
        }
    }
}
