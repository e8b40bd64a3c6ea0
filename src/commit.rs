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

//! `CommitInfo`: one node in a side's commitment chain (spec §3). The chain
//! is a one-directional, child-owns-parent structure (spec §9's redesign
//! note on the source's cyclic `prev` pointer) walked forward-only from the
//! tip; there is no back-pointer.

use bitcoin::Transaction;
use bitcoin_hashes::{sha256, Hash};
use secp256k1::ecdsa::Signature;

use crate::error::ProtocolError;
use crate::staging::StagingChange;
use crate::state::ChannelState;

/// One commitment transaction in a side's chain.
#[derive(Clone, Debug)]
pub struct CommitInfo {
    /// Owning back-link to the commitment this one supersedes; `None` for
    /// the very first commitment (commit_num 0).
    prev: Option<Box<CommitInfo>>,

    /// Zero for the first commitment, +1 per subsequent one (spec §8
    /// property 3).
    commit_num: u64,

    /// Expected hash of the preimage that will retire this commitment.
    revocation_hash: [u8; 32],

    /// The balance/HTLC snapshot this commitment encodes.
    state: ChannelState,

    /// Built via `TxBuilder`; opaque to this crate beyond being something we
    /// hand to `Signer`.
    tx: Transaction,

    /// The counterparty's signature authorizing this commitment. Present
    /// once received.
    remote_sig: Option<Signature>,

    /// Set once the counterparty reveals it; never unset afterwards.
    revocation_preimage: Option<[u8; 32]>,

    /// StagingChanges introduced since `prev`, exactly the changes
    /// introduced by the party that will revoke this commitment (spec
    /// §4.2's "key invariant"). Dropped once the commitment is revoked.
    unacked_changes: Vec<StagingChange>,
}

impl CommitInfo {
    /// Constructs the genesis commitment (`commit_num == 0`, no `prev`).
    pub fn genesis(revocation_hash: [u8; 32], state: ChannelState, tx: Transaction) -> Self {
        CommitInfo {
            prev: None,
            commit_num: 0,
            revocation_hash,
            state,
            tx,
            remote_sig: None,
            revocation_preimage: None,
            unacked_changes: Vec::new(),
        }
    }

    /// Builds the next commitment in the chain, taking ownership of `self`
    /// as the new tip's `prev` (spec §8 property 3: `prev.commit_num + 1 ==
    /// commit_num`).
    pub fn advance(self, revocation_hash: [u8; 32], state: ChannelState, tx: Transaction, unacked_changes: Vec<StagingChange>) -> Self {
        let commit_num = self.commit_num + 1;
        CommitInfo {
            prev: Some(Box::new(self)),
            commit_num,
            revocation_hash,
            state,
            tx,
            remote_sig: None,
            revocation_preimage: None,
            unacked_changes,
        }
    }

    #[inline]
    pub fn commit_num(&self) -> u64 {
        self.commit_num
    }

    #[inline]
    pub fn revocation_hash(&self) -> [u8; 32] {
        self.revocation_hash
    }

    #[inline]
    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    #[inline]
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    #[inline]
    pub fn remote_sig(&self) -> Option<&Signature> {
        self.remote_sig.as_ref()
    }

    #[inline]
    pub fn revocation_preimage(&self) -> Option<[u8; 32]> {
        self.revocation_preimage
    }

    #[inline]
    pub fn prev(&self) -> Option<&CommitInfo> {
        self.prev.as_deref()
    }

    #[inline]
    pub fn prev_mut(&mut self) -> Option<&mut CommitInfo> {
        self.prev.as_deref_mut()
    }

    #[inline]
    pub fn unacked_changes(&self) -> &[StagingChange] {
        &self.unacked_changes
    }

    pub fn attach_remote_sig(&mut self, sig: Signature) {
        self.remote_sig = Some(sig);
    }

    /// Records `preimage` as the revocation for this commitment after
    /// checking it hashes to `revocation_hash` (spec §8 property 4).
    pub fn reveal_preimage(&mut self, preimage: [u8; 32]) -> Result<(), ProtocolError> {
        if sha256::Hash::hash(&preimage).into_inner() != self.revocation_hash {
            return Err(ProtocolError::BadPreimage);
        }
        self.revocation_preimage = Some(preimage);
        Ok(())
    }

    /// Takes and clears the unacked-change list, as happens once this
    /// commitment is revoked (spec §3's CommitInfo lifecycle: "... after
    /// that the StagingChange list is dropped").
    pub fn take_unacked_changes(&mut self) -> Vec<StagingChange> {
        std::mem::take(&mut self.unacked_changes)
    }

    /// Detaches and returns `prev`, consuming the link. Used when walking
    /// off the revoked tail of the chain.
    pub fn into_prev(self) -> Option<CommitInfo> {
        self.prev.map(|b| *b)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dummy_tx() -> Transaction {
        Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime(0),
            input: vec![],
            output: vec![],
        }
    }

    #[test]
    fn commit_num_increments_by_one_along_the_chain() {
        let c0 = CommitInfo::genesis([0u8; 32], ChannelState::new(1000, 0), dummy_tx());
        let c1 = c0.advance([1u8; 32], ChannelState::new(1000, 0), dummy_tx(), vec![]);
        let c2 = c1.advance([2u8; 32], ChannelState::new(1000, 0), dummy_tx(), vec![]);
        assert_eq!(c2.commit_num(), 2);
        assert_eq!(c2.prev().unwrap().commit_num(), 1);
        assert_eq!(c2.prev().unwrap().prev().unwrap().commit_num(), 0);
    }

    #[test]
    fn reveal_preimage_checks_hash() {
        let preimage = [7u8; 32];
        let hash = sha256::Hash::hash(&preimage).into_inner();
        let mut c0 = CommitInfo::genesis(hash, ChannelState::new(1000, 0), dummy_tx());

        let err = c0.reveal_preimage([0u8; 32]).unwrap_err();
        assert_eq!(err, ProtocolError::BadPreimage);
        assert!(c0.revocation_preimage().is_none());

        c0.reveal_preimage(preimage).unwrap();
        assert_eq!(c0.revocation_preimage(), Some(preimage));
    }

    #[test]
    fn take_unacked_changes_clears_the_list() {
        let mut c0 = CommitInfo::genesis([0u8; 32], ChannelState::new(1000, 0), dummy_tx());
        c0 = c0.advance(
            [1u8; 32],
            ChannelState::new(1000, 0),
            dummy_tx(),
            vec![StagingChange::Fail { id: 1, offered_by: crate::htlc::Side::Ours, reason: vec![] }],
        );
        assert_eq!(c0.unacked_changes().len(), 1);
        let taken = c0.take_unacked_changes();
        assert_eq!(taken.len(), 1);
        assert!(c0.unacked_changes().is_empty());
    }
}
