// Channeld-core: per-peer payment-channel state engine
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! `ChannelState`: a pure value snapshot of balances and in-flight HTLCs for
//! both sides at one commitment point. Every operation returns a fresh state
//! or a typed rejection; none mutates its receiver.

use std::collections::BTreeMap;

use bitcoin_hashes::{sha256, Hash};
use strict_encoding::{StrictDecode, StrictEncode};

use crate::error::CommandError;
use crate::htlc::{ChannelHtlc, Side, MAX_HTLCS_PER_SIDE};

/// BOLT3-style base weight of a commitment transaction without HTLC outputs.
const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;
/// BOLT3-style weight added per HTLC output.
const HTLC_OUTPUT_WEIGHT: u64 = 172;

/// Expected on-chain fee, in satoshis, for a commitment transaction carrying
/// `n_htlcs` HTLC outputs at the given feerate. The funder side bears it
/// (spec §4.1's "Fee policy").
pub fn expected_fee(feerate_per_kw: u32, n_htlcs: usize) -> u64 {
    let weight = COMMITMENT_TX_BASE_WEIGHT + HTLC_OUTPUT_WEIGHT * n_htlcs as u64;
    (feerate_per_kw as u64 * weight) / 1000
}

/// A snapshot of both sides' balances and in-flight HTLCs at one commitment
/// point.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct ChannelState {
    /// msat balance: (ours, theirs).
    balance_ours: u64,
    balance_theirs: u64,

    /// HTLCs offered by us, keyed by id.
    htlcs_ours: BTreeMap<u64, ChannelHtlc>,
    /// HTLCs offered by them, keyed by id.
    htlcs_theirs: BTreeMap<u64, ChannelHtlc>,

    /// Monotonic counter, incremented on every add/fulfill/fail; used to
    /// detect empty commits (spec §4.4, §8 property 6).
    changes: u64,
}

impl ChannelState {
    pub fn new(balance_ours: u64, balance_theirs: u64) -> Self {
        ChannelState {
            balance_ours,
            balance_theirs,
            htlcs_ours: BTreeMap::new(),
            htlcs_theirs: BTreeMap::new(),
            changes: 0,
        }
    }

    #[inline]
    pub fn changes(&self) -> u64 {
        self.changes
    }

    #[inline]
    pub fn balance(&self, side: Side) -> u64 {
        match side {
            Side::Ours => self.balance_ours,
            Side::Theirs => self.balance_theirs,
        }
    }

    #[inline]
    fn balance_mut(&mut self, side: Side) -> &mut u64 {
        match side {
            Side::Ours => &mut self.balance_ours,
            Side::Theirs => &mut self.balance_theirs,
        }
    }

    #[inline]
    pub fn htlcs(&self, side: Side) -> &BTreeMap<u64, ChannelHtlc> {
        match side {
            Side::Ours => &self.htlcs_ours,
            Side::Theirs => &self.htlcs_theirs,
        }
    }

    #[inline]
    fn htlcs_mut(&mut self, side: Side) -> &mut BTreeMap<u64, ChannelHtlc> {
        match side {
            Side::Ours => &mut self.htlcs_ours,
            Side::Theirs => &mut self.htlcs_theirs,
        }
    }

    #[inline]
    pub fn htlc(&self, side: Side, id: u64) -> Option<&ChannelHtlc> {
        self.htlcs(side).get(&id)
    }

    #[inline]
    pub fn total_htlcs(&self) -> usize {
        self.htlcs_ours.len() + self.htlcs_theirs.len()
    }

    /// Logical clone for the commit path (spec §4.1's `copy` operation).
    #[inline]
    pub fn copy(&self) -> ChannelState {
        self.clone()
    }

    /// Sum of this snapshot's observable value: both balances plus every
    /// in-flight HTLC amount. Used by the conservation property test; the fee
    /// is not part of this sum (spec §8 property 1 keeps it as a separate
    /// term).
    pub fn observable_total(&self) -> u64 {
        self.balance_ours
            + self.balance_theirs
            + self.htlcs_ours.values().map(ChannelHtlc::amount_msat).sum::<u64>()
            + self.htlcs_theirs.values().map(ChannelHtlc::amount_msat).sum::<u64>()
    }

    /// Adds a new HTLC offered by `offered_by`. `funder` is the side that
    /// opened the anchor and bears the commitment-tx fee. Rejects when the
    /// resulting state would drive either the offering side's or the
    /// funder's balance negative, when the 300-per-side cap is hit, or when
    /// `id` collides with an existing HTLC offered by the same side.
    pub fn add_htlc(
        &self,
        offered_by: Side,
        htlc: ChannelHtlc,
        funder: Side,
        feerate_per_kw: u32,
    ) -> Result<ChannelState, CommandError> {
        if self.htlcs(offered_by).len() >= MAX_HTLCS_PER_SIDE {
            return Err(CommandError::TooManyHtlcs);
        }
        if self.htlcs(offered_by).contains_key(&htlc.id()) {
            return Err(CommandError::DuplicateId);
        }

        let old_fee_msat = 1000 * expected_fee(feerate_per_kw, self.total_htlcs());
        let mut next = self.clone();
        next.htlcs_mut(offered_by).insert(htlc.id(), htlc.clone());
        let new_fee_msat = 1000 * expected_fee(feerate_per_kw, next.total_htlcs());
        let fee_delta = new_fee_msat.saturating_sub(old_fee_msat);

        if *next.balance_mut(offered_by) < htlc.amount_msat() {
            return Err(CommandError::InsufficientFunds);
        }
        *next.balance_mut(offered_by) -= htlc.amount_msat();

        if *next.balance_mut(funder) < fee_delta {
            return Err(CommandError::InsufficientFunds);
        }
        *next.balance_mut(funder) -= fee_delta;

        next.changes += 1;
        Ok(next)
    }

    /// Removes a fulfilled HTLC, crediting its amount to the side that did
    /// *not* offer it, and refunding the funder any fee headroom the removal
    /// frees up.
    pub fn fulfill_htlc(
        &self,
        id: u64,
        offered_by: Side,
        preimage: [u8; 32],
        funder: Side,
        feerate_per_kw: u32,
    ) -> Result<ChannelState, CommandError> {
        let htlc = self.htlc(offered_by, id).ok_or(CommandError::NotFound)?.clone();
        if sha256::Hash::hash(&preimage).into_inner() != htlc.rhash() {
            return Err(CommandError::BadPreimage);
        }

        let old_fee_msat = 1000 * expected_fee(feerate_per_kw, self.total_htlcs());
        let mut next = self.clone();
        next.htlcs_mut(offered_by).remove(&id);
        let new_fee_msat = 1000 * expected_fee(feerate_per_kw, next.total_htlcs());
        let fee_refund = old_fee_msat.saturating_sub(new_fee_msat);

        *next.balance_mut(offered_by.other()) += htlc.amount_msat();
        *next.balance_mut(funder) += fee_refund;
        next.changes += 1;
        Ok(next)
    }

    /// Removes a failed HTLC, refunding its amount to the side that offered
    /// it, and refunding the funder any fee headroom the removal frees up.
    pub fn fail_htlc(&self, id: u64, offered_by: Side, funder: Side, feerate_per_kw: u32) -> Result<ChannelState, CommandError> {
        let htlc = self.htlc(offered_by, id).ok_or(CommandError::NotFound)?.clone();

        let old_fee_msat = 1000 * expected_fee(feerate_per_kw, self.total_htlcs());
        let mut next = self.clone();
        next.htlcs_mut(offered_by).remove(&id);
        let new_fee_msat = 1000 * expected_fee(feerate_per_kw, next.total_htlcs());
        let fee_refund = old_fee_msat.saturating_sub(new_fee_msat);

        *next.balance_mut(offered_by) += htlc.amount_msat();
        *next.balance_mut(funder) += fee_refund;
        next.changes += 1;
        Ok(next)
    }

    /// Spec §8 property 1: `balance[OURS] + balance[THEIRS] + Σ htlc.amount +
    /// fee == 1000 * anchor_satoshis`.
    pub fn conserves(&self, anchor_satoshis: u64, feerate_per_kw: u32) -> bool {
        let fee_msat = 1000 * expected_fee(feerate_per_kw, self.total_htlcs());
        self.observable_total() + fee_msat == 1000 * anchor_satoshis
    }
}
