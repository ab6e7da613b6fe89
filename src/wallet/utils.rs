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


use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{LockTime, Script, Sequence};

use miniscript::{MiniscriptKey, Satisfier, ToPublicKey};

/// Number of confirmations a coinbase output needs before it can be spent
pub const COINBASE_MATURITY: u32 = 100;

pub(crate) type SecpCtx = Secp256k1<All>;

/// Values too small to be relayed when paid to a given script
pub trait IsDust {
    /// Whether paying `self` to `script` creates a non-standard dust output
    fn is_dust(&self, script: &Script) -> bool;
}

impl IsDust for u64 {
    fn is_dust(&self, script: &Script) -> bool {
        *self < script.dust_value().to_sat()
    }
}

/// Answers the timelock questions of the finalizer from the chain height
///
/// An unknown `current_height` satisfies no timelock. An unknown parent counts as created at
/// height `0`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChainHeights {
    pub current: Option<u32>,
    pub created: Option<u32>,
}

impl<Pk: MiniscriptKey + ToPublicKey> Satisfier<Pk> for ChainHeights {
    fn check_after(&self, n: LockTime) -> bool {
        self.current
            .map_or(false, |height| height >= n.to_consensus_u32())
    }

    fn check_older(&self, n: Sequence) -> bool {
        let created = self.created.unwrap_or(0);
        self.current
            .map_or(false, |height| height >= created.saturating_add(n.to_consensus_u32()))
    }
}

/// Whether `rbf` can be used as nSequence on a transaction that must also satisfy an
/// `OP_CSV` of `csv`
pub(crate) fn check_nsequence_rbf(rbf: Sequence, csv: Sequence) -> bool {
    rbf.is_relative_lock_time() && rbf.is_time_locked() == csv.is_time_locked() && rbf >= csv
}
