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

//! BIP-0039

use std::fmt;
use std::str::FromStr;

use rand::RngCore;

use super::KeyError;

/// Number of words of a mnemonic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordCount {
    /// 12 words, 128 bits of entropy
    Words12,
    /// 15 words, 160 bits of entropy
    Words15,
    /// 18 words, 192 bits of entropy
    Words18,
    /// 21 words, 224 bits of entropy
    Words21,
    /// 24 words, 256 bits of entropy
    Words24,
}

impl WordCount {
    fn entropy_bytes(&self) -> usize {
        match self {
            WordCount::Words12 => 16,
            WordCount::Words15 => 20,
            WordCount::Words18 => 24,
            WordCount::Words21 => 28,
            WordCount::Words24 => 32,
        }
    }
}

/// A BIP39 mnemonic in the English word list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mnemonic(bip39::Mnemonic);

impl Mnemonic {
    /// Generate a new mnemonic from fresh random entropy
    pub fn new(word_count: WordCount) -> Self {
        let mut entropy = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut entropy);

        // any supported word count maps to a valid entropy length
        Mnemonic::from_entropy(&entropy[..word_count.entropy_bytes()])
            .unwrap_or_else(|_| unreachable!("valid entropy length"))
    }

    /// Build a mnemonic from raw entropy
    ///
    /// The entropy must be a multiple of 4 bytes, between 16 and 32 bytes.
    pub fn from_entropy(entropy: &[u8]) -> Result<Self, KeyError> {
        if entropy.len() % 4 != 0 || !(16..=32).contains(&entropy.len()) {
            return Err(KeyError::InvalidEntropyLength(entropy.len()));
        }

        bip39::Mnemonic::from_entropy(entropy)
            .map(Mnemonic)
            .map_err(map_bip39_error)
    }

    /// Compute the 64-byte seed, using `passphrase` as the BIP39 password
    pub fn to_seed(&self, passphrase: &str) -> [u8; 64] {
        self.0.to_seed(passphrase)
    }

    /// Number of words in the mnemonic
    pub fn word_count(&self) -> usize {
        self.0.word_count()
    }
}

fn map_bip39_error(err: bip39::Error) -> KeyError {
    match err {
        bip39::Error::BadWordCount(count) => KeyError::InvalidWordCount(count),
        bip39::Error::UnknownWord(index) => KeyError::UnknownWord(index),
        bip39::Error::BadEntropyBitCount(bits) => KeyError::InvalidEntropyLength(bits / 8),
        bip39::Error::InvalidChecksum => KeyError::InvalidChecksum,
        e => KeyError::Message(e.to_string()),
    }
}

impl FromStr for Mnemonic {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        bip39::Mnemonic::parse_in(bip39::Language::English, s)
            .map(Mnemonic)
            .map_err(map_bip39_error)
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
