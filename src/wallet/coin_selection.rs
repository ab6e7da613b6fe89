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


//! Coin selection
//!
//! A [`CoinSelectionAlgorithm`] picks which UTXOs fund a transaction. Three are provided:
//!
//! * [`BranchAndBoundCoinSelection`], the default, looks for a set of inputs that needs no change
//!   output and otherwise spends the largest coins first;
//! * [`LargestFirstCoinSelection`] always spends the largest coins first;
//! * [`OldestFirstCoinSelection`] spends the coins with the oldest confirmation first.
//!
//! A custom algorithm is plugged in with [`TxBuilder::coin_selection`]:
//!
//! ```
//! # use std::str::FromStr;
//! # use bitcoin::*;
//! # use bdk_engine::wallet::coin_selection::*;
//! # use bdk_engine::database::Database;
//! # use bdk_engine::*;
//! # use bdk_engine::Error;
//! /// Spends every available coin, leftover goes to change
//! #[derive(Debug)]
//! struct SpendAll;
//!
//! impl<D: Database> CoinSelectionAlgorithm<D> for SpendAll {
//!     fn coin_select(
//!         &self,
//!         _database: &D,
//!         required_utxos: Vec<WeightedUtxo>,
//!         optional_utxos: Vec<WeightedUtxo>,
//!         fee_rate: FeeRate,
//!         target_amount: u64,
//!         drain_script: &Script,
//!     ) -> Result<CoinSelectionResult, bdk_engine::Error> {
//!         let utxos: Vec<_> = required_utxos.into_iter().chain(optional_utxos).collect();
//!         let value: u64 = utxos.iter().map(|u| u.utxo.txout.value).sum();
//!         // 160 WU for outpoint and sequence, plus what unlocking the coin takes
//!         let weight: usize = utxos.iter().map(|u| 160 + u.satisfaction_weight).sum();
//!         let fee_amount = fee_rate.fee_wu(weight);
//!
//!         let needed = target_amount + fee_amount;
//!         if value < needed {
//!             return Err(Error::InsufficientFunds { needed, available: value });
//!         }
//!
//!         Ok(CoinSelectionResult {
//!             selected: utxos.into_iter().map(|u| u.utxo).collect(),
//!             fee_amount,
//!             excess: decide_change(value - needed, fee_rate, drain_script),
//!         })
//!     }
//! }
//!
//! # let wallet = Wallet::new(
//! #     "wpkh(tpubD6NzVbkrYhZ4Xferm7Pz4VnjdcDPFyjVu5K4iZXQ4pVN8Cks4pHVowTBXBKRhX64pkRyJZJN5xAKj4UDNnLPb5p2sSKXhewoYx5GbTdUFWq/*)",
//! #     None,
//! #     Network::Testnet,
//! #     database::MemoryDatabase::new(),
//! # )?;
//! let to_address = Address::from_str("2N4eQYCbKUHCCTUjBJeHcJp9ok6J2GZsTDt").unwrap();
//! let mut builder = wallet.build_tx().coin_selection(SpendAll);
//! builder.add_recipient(to_address.script_pubkey(), 50_000);
//! // a wallet that was never synced has nothing to spend
//! assert!(builder.finish().is_err());
//! # Ok::<(), bdk_engine::Error>(())
//! ```
//!
//! [`TxBuilder::coin_selection`]: super::tx_builder::TxBuilder::coin_selection

use bitcoin::consensus::encode::serialize;
use bitcoin::Script;

use crate::database::Database;
use crate::error::Error;
use crate::types::{FeeRate, LocalUtxo, WeightedUtxo};
use crate::wallet::utils::IsDust;

/// Algorithm used by [`TxBuilder`](super::tx_builder::TxBuilder) unless another one is set
pub type DefaultCoinSelectionAlgorithm = BranchAndBoundCoinSelection;

// outpoint (36 bytes) and nSequence (4 bytes), without the scriptSig or witness
pub(crate) const TXIN_BASE_WEIGHT: usize = (32 + 4 + 4) * 4;

// nodes the branch and bound search may visit before giving up
const BNB_TOTAL_TRIES: usize = 100_000;

/// What is left once the targets and the fee are paid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Excess {
    /// The leftover can't pay for a change output above dust, it goes to the miners
    NoChange {
        /// Dust limit of the drain script
        dust_threshold: u64,
        /// Leftover, before paying for a change output
        remaining_amount: u64,
        /// What a change output to the drain script would cost
        change_fee: u64,
    },
    /// The leftover is sent back through a change output
    Change {
        /// Value of the change output
        amount: u64,
        /// Fee paid for the change output itself
        fee: u64,
    },
}

/// Outcome of a successful coin selection
#[derive(Debug)]
pub struct CoinSelectionResult {
    /// UTXOs to spend, required ones included
    pub selected: Vec<LocalUtxo>,
    /// Fee paid for spending the selected inputs
    pub fee_amount: u64,
    /// Leftover of the selection
    pub excess: Excess,
}

impl CoinSelectionResult {
    /// Sum of the values of the selected UTXOs
    pub fn selected_amount(&self) -> u64 {
        self.selected.iter().map(|utxo| utxo.txout.value).sum()
    }
}

/// A strategy to fund a transaction
pub trait CoinSelectionAlgorithm<D: Database>: std::fmt::Debug {
    /// Choose the UTXOs to spend
    ///
    /// Every one of `required_utxos` must be selected. `target_amount` is the sum of the outputs
    /// plus the fee of the transaction without inputs, the fee of the inputs themselves is
    /// reported back in [`CoinSelectionResult::fee_amount`]. `drain_script` is where a change
    /// output would pay to.
    fn coin_select(
        &self,
        database: &D,
        required_utxos: Vec<WeightedUtxo>,
        optional_utxos: Vec<WeightedUtxo>,
        fee_rate: FeeRate,
        target_amount: u64,
        drain_script: &Script,
    ) -> Result<CoinSelectionResult, Error>;
}

/// Decide whether `remaining_amount` is worth a change output paying to `drain_script`
pub fn decide_change(remaining_amount: u64, fee_rate: FeeRate, drain_script: &Script) -> Excess {
    // value (8 bytes) plus the length-prefixed script
    let change_fee = fee_rate.fee_vb(8 + serialize(drain_script).len());
    let amount = remaining_amount.saturating_sub(change_fee);

    if amount.is_dust(drain_script) {
        Excess::NoChange {
            dust_threshold: drain_script.dust_value().to_sat(),
            remaining_amount,
            change_fee,
        }
    } else {
        Excess::Change {
            amount,
            fee: change_fee,
        }
    }
}

/// A UTXO with the fee it costs to spend it at the selection fee rate
#[derive(Debug, Clone)]
struct Candidate {
    utxo: LocalUtxo,
    fee: u64,
}

impl Candidate {
    fn new(weighted: WeightedUtxo, fee_rate: FeeRate) -> Self {
        Candidate {
            fee: fee_rate.fee_wu(TXIN_BASE_WEIGHT + weighted.satisfaction_weight),
            utxo: weighted.utxo,
        }
    }

    fn value(&self) -> u64 {
        self.utxo.txout.value
    }

    /// What the UTXO brings once its own fee is paid, may be negative
    fn effective_value(&self) -> i64 {
        self.value() as i64 - self.fee as i64
    }
}

fn candidates(utxos: Vec<WeightedUtxo>, fee_rate: FeeRate) -> Vec<Candidate> {
    utxos
        .into_iter()
        .map(|utxo| Candidate::new(utxo, fee_rate))
        .collect()
}

/// Running totals of the inputs picked so far
#[derive(Debug, Default)]
struct Selection {
    picked: Vec<LocalUtxo>,
    value: u64,
    fee: u64,
}

impl Selection {
    fn with(required: Vec<Candidate>) -> Self {
        let mut selection = Selection::default();
        for candidate in required {
            selection.add(candidate);
        }
        selection
    }

    fn add(&mut self, candidate: Candidate) {
        self.value += candidate.value();
        self.fee += candidate.fee;
        self.picked.push(candidate.utxo);
    }

    fn covers(&self, target_amount: u64) -> bool {
        self.value >= target_amount + self.fee
    }

    fn finish(
        self,
        target_amount: u64,
        fee_rate: FeeRate,
        drain_script: &Script,
    ) -> Result<CoinSelectionResult, Error> {
        let needed = target_amount + self.fee;
        if self.value < needed {
            return Err(Error::InsufficientFunds {
                needed,
                available: self.value,
            });
        }

        Ok(CoinSelectionResult {
            excess: decide_change(self.value - needed, fee_rate, drain_script),
            selected: self.picked,
            fee_amount: self.fee,
        })
    }
}

/// Start from the required candidates, then take `ordered` ones until the target is covered
fn select_in_order(
    required: Vec<Candidate>,
    ordered: impl IntoIterator<Item = Candidate>,
    fee_rate: FeeRate,
    target_amount: u64,
    drain_script: &Script,
) -> Result<CoinSelectionResult, Error> {
    let mut selection = Selection::with(required);
    for candidate in ordered {
        if selection.covers(target_amount) {
            break;
        }
        selection.add(candidate);
    }

    selection.finish(target_amount, fee_rate, drain_script)
}

/// Spends the largest UTXOs first
#[derive(Debug, Default, Clone, Copy)]
pub struct LargestFirstCoinSelection;

impl<D: Database> CoinSelectionAlgorithm<D> for LargestFirstCoinSelection {
    fn coin_select(
        &self,
        _database: &D,
        required_utxos: Vec<WeightedUtxo>,
        optional_utxos: Vec<WeightedUtxo>,
        fee_rate: FeeRate,
        target_amount: u64,
        drain_script: &Script,
    ) -> Result<CoinSelectionResult, Error> {
        let mut optional = candidates(optional_utxos, fee_rate);
        optional.sort_by_key(|candidate| std::cmp::Reverse(candidate.value()));

        select_in_order(
            candidates(required_utxos, fee_rate),
            optional,
            fee_rate,
            target_amount,
            drain_script,
        )
    }
}

/// Spends the UTXOs confirmed the earliest first, unconfirmed ones last
#[derive(Debug, Default, Clone, Copy)]
pub struct OldestFirstCoinSelection;

impl<D: Database> CoinSelectionAlgorithm<D> for OldestFirstCoinSelection {
    fn coin_select(
        &self,
        database: &D,
        required_utxos: Vec<WeightedUtxo>,
        optional_utxos: Vec<WeightedUtxo>,
        fee_rate: FeeRate,
        target_amount: u64,
        drain_script: &Script,
    ) -> Result<CoinSelectionResult, Error> {
        let mut aged = Vec::with_capacity(optional_utxos.len());
        for weighted in optional_utxos {
            let height = database
                .get_tx(&weighted.utxo.outpoint.txid, false)?
                .and_then(|details| details.confirmation_time)
                .map_or(u32::MAX, |time| time.height);
            aged.push((height, Candidate::new(weighted, fee_rate)));
        }
        aged.sort_by_key(|(height, _)| *height);

        select_in_order(
            candidates(required_utxos, fee_rate),
            aged.into_iter().map(|(_, candidate)| candidate),
            fee_rate,
            target_amount,
            drain_script,
        )
    }
}

/// Looks for inputs that pay the target without a change output
///
/// The search accepts any set whose effective value lands between the target and the target
/// plus the cost of a change output, preferring the one that wastes the least. When no such set
/// is found within the search budget the largest UTXOs are spent first.
#[derive(Debug, Clone, Copy)]
pub struct BranchAndBoundCoinSelection {
    size_of_change: u64,
}

impl Default for BranchAndBoundCoinSelection {
    fn default() -> Self {
        // a P2WPKH output: value, script length and a 22 bytes script
        BranchAndBoundCoinSelection {
            size_of_change: 8 + 1 + 22,
        }
    }
}

impl BranchAndBoundCoinSelection {
    /// Use a change output of `size_of_change` bytes to price the no-change window
    pub fn new(size_of_change: u64) -> Self {
        BranchAndBoundCoinSelection { size_of_change }
    }
}

impl<D: Database> CoinSelectionAlgorithm<D> for BranchAndBoundCoinSelection {
    fn coin_select(
        &self,
        _database: &D,
        required_utxos: Vec<WeightedUtxo>,
        optional_utxos: Vec<WeightedUtxo>,
        fee_rate: FeeRate,
        target_amount: u64,
        drain_script: &Script,
    ) -> Result<CoinSelectionResult, Error> {
        let required = candidates(required_utxos, fee_rate);
        let mut optional: Vec<_> = candidates(optional_utxos, fee_rate)
            .into_iter()
            .filter(|candidate| candidate.effective_value() > 0)
            .collect();
        optional.sort_by_key(|candidate| std::cmp::Reverse(candidate.effective_value()));

        let required_effective: i64 = required.iter().map(Candidate::effective_value).sum();
        let missing = target_amount as i64 - required_effective;
        if missing <= 0 {
            return Selection::with(required).finish(target_amount, fee_rate, drain_script);
        }

        let values: Vec<i64> = optional.iter().map(Candidate::effective_value).collect();
        let cost_of_change = fee_rate.fee_vb(self.size_of_change as usize) as i64;

        match search_no_change(&values, missing, missing + cost_of_change) {
            Some(picked) => {
                log::debug!("Found a selection without change: {} inputs", picked.len());
                let mut selection = Selection::with(required);
                let mut picked = picked.into_iter().peekable();
                for (index, candidate) in optional.into_iter().enumerate() {
                    if picked.next_if_eq(&index).is_some() {
                        selection.add(candidate);
                    }
                }
                selection.finish(target_amount, fee_rate, drain_script)
            }
            None => {
                log::debug!("No selection without change, spending the largest inputs first");
                select_in_order(required, optional, fee_rate, target_amount, drain_script)
            }
        }
    }
}

/// Depth-first search for the subset of `values` (sorted descending) whose sum falls in
/// `[lower, upper]` with the smallest overshoot. Returns the indexes of the subset, ascending.
fn search_no_change(values: &[i64], lower: i64, upper: i64) -> Option<Vec<usize>> {
    // left[i] is what the undecided values from `i` onwards could still add
    let mut left = vec![0; values.len() + 1];
    for i in (0..values.len()).rev() {
        left[i] = left[i + 1] + values[i];
    }

    let mut included = vec![false; values.len()];
    let mut best: Option<(i64, Vec<usize>)> = None;
    let mut depth = 0;
    let mut sum = 0;

    for _ in 0..BNB_TOTAL_TRIES {
        let dead_end = sum > upper || sum + left[depth] < lower;
        if !dead_end && sum < lower {
            // go deeper, including the next value first
            included[depth] = true;
            sum += values[depth];
            depth += 1;
            continue;
        }

        if !dead_end {
            let waste = sum - lower;
            if best.as_ref().map_or(true, |(best_waste, _)| waste < *best_waste) {
                let picked = (0..depth).filter(|i| included[*i]).collect();
                best = Some((waste, picked));
            }
            if waste == 0 {
                break;
            }
        }

        // backtrack to the last included value and try without it
        loop {
            if depth == 0 {
                return best.map(|(_, picked)| picked);
            }
            depth -= 1;
            if included[depth] {
                included[depth] = false;
                sum -= values[depth];
                depth += 1;
                break;
            }
        }
    }

    best.map(|(_, picked)| picked)
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use assert_matches::assert_matches;
    use bitcoin::hashes::{sha256d, Hash};
    use bitcoin::{OutPoint, TxOut, Txid, WPubkeyHash};

    use super::*;
    use crate::database::{BatchOperations, MemoryDatabase};
    use crate::types::{BlockTime, KeychainKind, TransactionDetails};

    // one signature and one compressed key, with their length prefixes and the item count
    const P2WPKH_SATISFACTION_SIZE: usize = 1 + 1 + 72 + 1 + 33;
    // fee of one P2WPKH input at 1 sat/vB
    const INPUT_FEE: u64 = 67;

    fn drain_script() -> Script {
        Script::new_v0_p2wpkh(&WPubkeyHash::hash(b"change"))
    }

    fn utxo(value: u64, n: u32) -> WeightedUtxo {
        let txid = Txid::from_hash(sha256d::Hash::hash(&n.to_le_bytes()));
        WeightedUtxo {
            satisfaction_weight: P2WPKH_SATISFACTION_SIZE,
            utxo: LocalUtxo {
                outpoint: OutPoint::new(txid, 0),
                txout: TxOut {
                    value,
                    script_pubkey: Script::new_v0_p2wpkh(&WPubkeyHash::hash(&n.to_le_bytes())),
                },
                keychain: KeychainKind::External,
                is_spent: false,
            },
        }
    }

    fn utxos(values: &[u64]) -> Vec<WeightedUtxo> {
        values
            .iter()
            .enumerate()
            .map(|(n, value)| utxo(*value, n as u32))
            .collect()
    }

    fn values(result: &CoinSelectionResult) -> Vec<u64> {
        let mut values: Vec<_> = result.selected.iter().map(|u| u.txout.value).collect();
        values.sort_unstable();
        values
    }

    fn one_sat() -> FeeRate {
        FeeRate::from_sat_per_vb(1.0)
    }

    #[test]
    fn test_decide_change() {
        assert_eq!(
            decide_change(300, one_sat(), &drain_script()),
            Excess::NoChange {
                dust_threshold: 294,
                remaining_amount: 300,
                change_fee: 31,
            }
        );
        assert_eq!(
            decide_change(10_000, one_sat(), &drain_script()),
            Excess::Change {
                amount: 9_969,
                fee: 31,
            }
        );
    }

    #[test]
    fn test_input_fee() {
        let candidate = Candidate::new(utxo(1_000, 0), one_sat());
        assert_eq!(candidate.fee, INPUT_FEE);
        assert_eq!(candidate.effective_value(), 1_000 - INPUT_FEE as i64);
    }

    #[test]
    fn test_largest_first() {
        let database = MemoryDatabase::default();
        let result = LargestFirstCoinSelection
            .coin_select(
                &database,
                vec![],
                utxos(&[10_000, 200_000, 50_000]),
                one_sat(),
                150_000,
                &drain_script(),
            )
            .unwrap();

        assert_eq!(values(&result), vec![200_000]);
        assert_eq!(result.fee_amount, INPUT_FEE);
        assert_matches!(result.excess, Excess::Change { amount, .. } if amount == 50_000 - INPUT_FEE - 31);
    }

    #[test]
    fn test_largest_first_keeps_required() {
        let database = MemoryDatabase::default();
        let result = LargestFirstCoinSelection
            .coin_select(
                &database,
                utxos(&[1_000]),
                vec![utxo(200_000, 7), utxo(50_000, 8)],
                one_sat(),
                150_000,
                &drain_script(),
            )
            .unwrap();

        assert_eq!(values(&result), vec![1_000, 200_000]);
        assert_eq!(result.fee_amount, 2 * INPUT_FEE);
    }

    #[test]
    fn test_largest_first_insufficient_funds() {
        let database = MemoryDatabase::default();
        let result = LargestFirstCoinSelection.coin_select(
            &database,
            vec![],
            utxos(&[10_000, 20_000]),
            one_sat(),
            50_000,
            &drain_script(),
        );

        assert_matches!(
            result,
            Err(Error::InsufficientFunds { needed, available })
                if needed == 50_000 + 2 * INPUT_FEE && available == 30_000
        );
    }

    #[test]
    fn test_oldest_first() {
        let mut database = MemoryDatabase::default();
        let coins = utxos(&[30_000, 30_000, 30_000]);
        for (coin, height) in coins.iter().zip([Some(500), Some(100), None]) {
            database
                .set_tx(&TransactionDetails {
                    txid: coin.utxo.outpoint.txid,
                    confirmation_time: height.map(|height| BlockTime {
                        height,
                        timestamp: 1_600_000_000,
                    }),
                    ..Default::default()
                })
                .unwrap();
        }
        let oldest = coins[1].utxo.outpoint;
        let newest_confirmed = coins[0].utxo.outpoint;

        let result = OldestFirstCoinSelection
            .coin_select(&database, vec![], coins, one_sat(), 20_000, &drain_script())
            .unwrap();
        assert_eq!(result.selected.len(), 1);
        assert_eq!(result.selected[0].outpoint, oldest);

        let coins = utxos(&[30_000, 30_000, 30_000]);
        let result = OldestFirstCoinSelection
            .coin_select(&database, vec![], coins, one_sat(), 50_000, &drain_script())
            .unwrap();
        let picked: Vec<_> = result.selected.iter().map(|u| u.outpoint).collect();
        assert_eq!(picked, vec![oldest, newest_confirmed]);
    }

    #[test]
    fn test_bnb_exact_match() {
        let database = MemoryDatabase::default();
        let result = BranchAndBoundCoinSelection::default()
            .coin_select(
                &database,
                vec![],
                utxos(&[50_000, 25_000, 20_067, 10_067, 5_000]),
                one_sat(),
                30_000,
                &drain_script(),
            )
            .unwrap();

        assert_eq!(values(&result), vec![10_067, 20_067]);
        assert_eq!(result.fee_amount, 2 * INPUT_FEE);
        assert_eq!(
            result.excess,
            Excess::NoChange {
                dust_threshold: 294,
                remaining_amount: 0,
                change_fee: 31,
            }
        );
    }

    #[test]
    fn test_bnb_accepts_cost_of_change_window() {
        let database = MemoryDatabase::default();
        // 20 sats over the target, less than a change output would cost
        let result = BranchAndBoundCoinSelection::default()
            .coin_select(
                &database,
                vec![],
                utxos(&[60_000, 30_087]),
                one_sat(),
                30_000,
                &drain_script(),
            )
            .unwrap();

        assert_eq!(values(&result), vec![30_087]);
        assert_matches!(result.excess, Excess::NoChange { remaining_amount: 20, .. });
    }

    #[test]
    fn test_bnb_required_cover_target() {
        let database = MemoryDatabase::default();
        let result = BranchAndBoundCoinSelection::default()
            .coin_select(
                &database,
                utxos(&[100_000]),
                vec![utxo(30_067, 9)],
                one_sat(),
                30_000,
                &drain_script(),
            )
            .unwrap();

        assert_eq!(values(&result), vec![100_000]);
        assert_matches!(result.excess, Excess::Change { .. });
    }

    #[test]
    fn test_bnb_falls_back_to_largest_first() {
        let database = MemoryDatabase::default();
        let result = BranchAndBoundCoinSelection::default()
            .coin_select(
                &database,
                vec![],
                utxos(&[40_000, 50_000]),
                one_sat(),
                30_000,
                &drain_script(),
            )
            .unwrap();

        assert_eq!(values(&result), vec![50_000]);
        assert_matches!(result.excess, Excess::Change { .. });
    }

    #[test]
    fn test_bnb_search_budget() {
        let database = MemoryDatabase::default();
        // every subset misses the window, the search runs out of tries
        let coins = (0..50).map(|n| utxo(1_067, n)).collect();
        let result = BranchAndBoundCoinSelection::default()
            .coin_select(&database, vec![], coins, one_sat(), 10_500, &drain_script())
            .unwrap();

        assert_eq!(result.selected.len(), 11);
        assert_eq!(result.excess, Excess::Change { amount: 469, fee: 31 });
    }

    #[test]
    fn test_bnb_skips_uneconomic_utxos() {
        let database = MemoryDatabase::default();
        // at 10 sat/vB this coin costs more than it's worth
        let result = BranchAndBoundCoinSelection::default().coin_select(
            &database,
            vec![],
            utxos(&[500]),
            FeeRate::from_sat_per_vb(10.0),
            100,
            &drain_script(),
        );

        assert_matches!(result, Err(Error::InsufficientFunds { .. }));
    }

    #[test]
    fn test_search_no_change() {
        assert_eq!(search_no_change(&[8, 5, 3, 2], 10, 10), Some(vec![0, 3]));
        assert_eq!(search_no_change(&[8, 5, 3], 9, 9), None);
        // the smallest overshoot wins
        assert_eq!(search_no_change(&[9, 6, 5], 10, 12), Some(vec![1, 2]));
        assert_eq!(search_no_change(&[], 1, 5), None);
    }

    #[test]
    fn test_unconfirmed_sorted_last() {
        let database = MemoryDatabase::default();
        let script = Script::from_str("0014aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        let result = OldestFirstCoinSelection
            .coin_select(&database, vec![], utxos(&[40_000]), one_sat(), 10_000, &script)
            .unwrap();
        assert_eq!(result.selected.len(), 1);
    }
}
