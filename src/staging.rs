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

//! `StagingChange`, `SideView` and `StagingBuffers`: the dual-commitment
//! bookkeeping of spec §4.2. Each side of the channel (`local`, `remote`)
//! keeps a `staging_cstate` that is always "the last fully revoked committed
//! state for that side plus every subsequently applied `StagingChange`"
//! (spec's definition of "Staging cstate", glossary).
//!
//! **Crossover direction (`DESIGN.md` Open Question).** Spec §4.2 states
//! plainly that local-origin changes are appended to `remote.commit`'s
//! unacked list; spec §4.4's "sending UpdateCommit" step 4 separately
//! describes that same list as carrying "remote-origin" changes, which
//! reads as a wording slip against §4.2's fully justified "key invariant"
//! paragraph. This module follows §4.2 literally: `remote.commit`'s unacked
//! list holds the changes *we* introduced; `local.commit`'s holds the ones
//! *they* introduced.

use crate::commit::CommitInfo;
use crate::error::CommandError;
use crate::htlc::{ChannelHtlc, Side};
use crate::state::ChannelState;

/// A single pending modification to a `ChannelState`, not yet permanent
/// until the commitment carrying it is revoked.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StagingChange {
    Add(ChannelHtlc),
    Fulfill { id: u64, offered_by: Side, preimage: [u8; 32] },
    Fail { id: u64, offered_by: Side, reason: Vec<u8> },
}

impl StagingChange {
    /// Which side originated this change (the side whose HTLC it concerns).
    pub fn offered_by(&self) -> Side {
        match self {
            StagingChange::Add(htlc) => htlc.offered_by(),
            StagingChange::Fulfill { offered_by, .. } => *offered_by,
            StagingChange::Fail { offered_by, .. } => *offered_by,
        }
    }

    /// Applies this change to `state`, returning the resulting snapshot.
    pub fn apply(&self, state: &ChannelState, funder: Side, feerate_per_kw: u32) -> Result<ChannelState, CommandError> {
        match self {
            StagingChange::Add(htlc) => state.add_htlc(htlc.offered_by(), htlc.clone(), funder, feerate_per_kw),
            StagingChange::Fulfill { id, offered_by, preimage } => {
                state.fulfill_htlc(*id, *offered_by, *preimage, funder, feerate_per_kw)
            }
            StagingChange::Fail { id, offered_by, .. } => state.fail_htlc(*id, *offered_by, funder, feerate_per_kw),
        }
    }
}

/// One side's view of the channel: its commitment chain tip, the projected
/// staging state, and the open-time parameters that never change over the
/// channel's life (spec §3's SideView).
#[derive(Clone, Debug)]
pub struct SideView {
    commit: Option<CommitInfo>,
    pending_changes: Vec<StagingChange>,
    staging_cstate: ChannelState,
    next_revocation_hash: [u8; 32],
    commit_key: secp256k1::PublicKey,
    final_key: secp256k1::PublicKey,
    to_self_delay: u32,
    feerate_per_kw: u32,
    mindepth: u32,
    offer_anchor: bool,
}

impl SideView {
    pub fn new(
        staging_cstate: ChannelState,
        next_revocation_hash: [u8; 32],
        commit_key: secp256k1::PublicKey,
        final_key: secp256k1::PublicKey,
        to_self_delay: u32,
        feerate_per_kw: u32,
        mindepth: u32,
        offer_anchor: bool,
    ) -> Self {
        SideView {
            commit: None,
            pending_changes: Vec::new(),
            staging_cstate,
            next_revocation_hash,
            commit_key,
            final_key,
            to_self_delay,
            feerate_per_kw,
            mindepth,
            offer_anchor,
        }
    }

    #[inline]
    pub fn commit(&self) -> Option<&CommitInfo> {
        self.commit.as_ref()
    }

    #[inline]
    pub fn commit_mut(&mut self) -> Option<&mut CommitInfo> {
        self.commit.as_mut()
    }

    pub fn set_commit(&mut self, commit: CommitInfo) {
        self.commit = Some(commit);
    }

    /// Takes the current tip out, leaving `None` behind. Used when advancing
    /// the chain: the old tip is consumed into the new tip's `prev` link
    /// (spec §3 `CommitInfo.prev`).
    pub fn take_commit(&mut self) -> Option<CommitInfo> {
        self.commit.take()
    }

    #[inline]
    pub fn staging_cstate(&self) -> &ChannelState {
        &self.staging_cstate
    }

    #[inline]
    pub fn next_revocation_hash(&self) -> [u8; 32] {
        self.next_revocation_hash
    }

    pub fn set_next_revocation_hash(&mut self, hash: [u8; 32]) {
        self.next_revocation_hash = hash;
    }

    #[inline]
    pub fn commit_key(&self) -> secp256k1::PublicKey {
        self.commit_key
    }

    #[inline]
    pub fn final_key(&self) -> secp256k1::PublicKey {
        self.final_key
    }

    #[inline]
    pub fn to_self_delay(&self) -> u32 {
        self.to_self_delay
    }

    #[inline]
    pub fn feerate_per_kw(&self) -> u32 {
        self.feerate_per_kw
    }

    #[inline]
    pub fn mindepth(&self) -> u32 {
        self.mindepth
    }

    #[inline]
    pub fn offer_anchor(&self) -> bool {
        self.offer_anchor
    }

    #[inline]
    pub fn pending_changes(&self) -> &[StagingChange] {
        &self.pending_changes
    }

    /// Applies `change` to `staging_cstate` and queues it for the next
    /// commitment built on this side's chain.
    fn apply_change(&mut self, change: StagingChange, funder: Side, feerate_per_kw: u32) -> Result<(), CommandError> {
        let next = change.apply(&self.staging_cstate, funder, feerate_per_kw)?;
        self.staging_cstate = next;
        self.pending_changes.push(change);
        Ok(())
    }

    /// Drains the accumulated pending changes, handing them to the new tip
    /// under construction (spec §3's `unacked_changes`).
    pub fn take_pending_changes(&mut self) -> Vec<StagingChange> {
        std::mem::take(&mut self.pending_changes)
    }
}

/// The pair of `SideView`s a `PeerChannel` maintains: `local` (our
/// commitment chain, signed by the counterparty) and `remote` (their
/// commitment chain, signed by us) — spec §2 item 4.
#[derive(Clone, Debug)]
pub struct StagingBuffers {
    pub local: SideView,
    pub remote: SideView,
}

impl StagingBuffers {
    pub fn new(local: SideView, remote: SideView) -> Self {
        StagingBuffers { local, remote }
    }

    /// Applies a change we introduced locally (our own `add_htlc`,
    /// `fulfill_htlc`, `fail_htlc`). Lands first in `remote`'s staging (spec
    /// §4.2).
    pub fn apply_local_origin(&mut self, change: StagingChange, funder: Side, feerate_per_kw: u32) -> Result<(), CommandError> {
        self.remote.apply_change(change, funder, feerate_per_kw)
    }

    /// Applies a change the counterparty introduced (an inbound
    /// add/fulfill/fail packet). Lands first in `local`'s staging.
    pub fn apply_remote_origin(&mut self, change: StagingChange, funder: Side, feerate_per_kw: u32) -> Result<(), CommandError> {
        self.local.apply_change(change, funder, feerate_per_kw)
    }

    /// Crossover performed when *we* send our own revocation: the changes
    /// that were pending on our just-superseded `local.commit` tip (which
    /// were remote-origin) become permanent by replaying them onto
    /// `remote.staging_cstate` (spec §4.4 "sending UpdateRevocation" step 3).
    pub fn cross_over_to_remote(&mut self, changes: &[StagingChange], funder: Side, feerate_per_kw: u32) -> Result<(), CommandError> {
        for change in changes {
            self.remote.staging_cstate = change.apply(&self.remote.staging_cstate, funder, feerate_per_kw)?;
        }
        Ok(())
    }

    /// Crossover performed when we *receive* their revocation: the changes
    /// pending on the revoked `remote.commit` entry (local-origin) become
    /// permanent on `local.staging_cstate` (spec §4.4 "receiving
    /// UpdateRevocation" step 4).
    pub fn cross_over_to_local(&mut self, changes: &[StagingChange], funder: Side, feerate_per_kw: u32) -> Result<(), CommandError> {
        for change in changes {
            self.local.staging_cstate = change.apply(&self.local.staging_cstate, funder, feerate_per_kw)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key() -> secp256k1::PublicKey {
        let secp = secp256k1::Secp256k1::new();
        let sk = secp256k1::SecretKey::from_slice(&[0xab; 32]).unwrap();
        secp256k1::PublicKey::from_secret_key(&secp, &sk)
    }

    fn side(balance_ours: u64, balance_theirs: u64) -> SideView {
        SideView::new(ChannelState::new(balance_ours, balance_theirs), [0u8; 32], key(), key(), 144, 5000, 3, true)
    }

    #[test]
    fn local_origin_change_lands_in_remote_staging_first() {
        let mut buffers = StagingBuffers::new(side(1_000_000_000, 0), side(1_000_000_000, 0));
        let htlc = ChannelHtlc::new(0, Side::Ours, 100_000_000, [1u8; 32], crate::htlc::Expiry::Seconds(1), vec![]);
        buffers.apply_local_origin(StagingChange::Add(htlc), Side::Ours, 5000).unwrap();

        assert_eq!(buffers.remote.staging_cstate().htlc(Side::Ours, 0).unwrap().amount_msat(), 100_000_000);
        assert_eq!(buffers.remote.pending_changes().len(), 1);
        assert!(buffers.local.staging_cstate().htlc(Side::Ours, 0).is_none());
    }

    #[test]
    fn remote_origin_change_lands_in_local_staging_first() {
        let mut buffers = StagingBuffers::new(side(1_000_000_000, 0), side(1_000_000_000, 0));
        let htlc = ChannelHtlc::new(0, Side::Theirs, 100_000_000, [1u8; 32], crate::htlc::Expiry::Seconds(1), vec![]);
        buffers.apply_remote_origin(StagingChange::Add(htlc), Side::Ours, 5000).unwrap();

        assert_eq!(buffers.local.staging_cstate().htlc(Side::Theirs, 0).unwrap().amount_msat(), 100_000_000);
        assert_eq!(buffers.local.pending_changes().len(), 1);
        assert!(buffers.remote.staging_cstate().htlc(Side::Theirs, 0).is_none());
    }

    #[test]
    fn crossover_mirrors_changes_onto_the_other_staging_state() {
        let mut buffers = StagingBuffers::new(side(1_000_000_000, 0), side(1_000_000_000, 0));
        let htlc = ChannelHtlc::new(0, Side::Theirs, 100_000_000, [1u8; 32], crate::htlc::Expiry::Seconds(1), vec![]);
        buffers.apply_remote_origin(StagingChange::Add(htlc), Side::Ours, 5000).unwrap();
        let changes = buffers.local.take_pending_changes();
        assert!(buffers.local.pending_changes().is_empty());

        buffers.cross_over_to_remote(&changes, Side::Ours, 5000).unwrap();
        assert_eq!(buffers.remote.staging_cstate().htlc(Side::Theirs, 0).unwrap().amount_msat(), 100_000_000);
    }
}
