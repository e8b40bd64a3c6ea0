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

//! `ChannelEngine`: the public façade tying `ChannelState`, `CommitInfo`,
//! `RevocationLadder`, `StagingBuffers`, `ProtocolFSM` and `PacketCodec`
//! together (spec §2 component 7, §4.4). One instance is owned per peer
//! (spec §5's "one logical single-threaded cooperative task per peer");
//! nothing here is shared between peers except through the capabilities
//! reached via `HostContext`.

use std::collections::VecDeque;

use bitcoin_hashes::{sha256, Hash};
use secp256k1::ecdsa::Signature;

use crate::capabilities::{AnchorPoint, CapabilityError, Capabilities, CommitKeySet, Locktimes};
use crate::commit::CommitInfo;
use crate::config::HostContext;
use crate::error::{CommandError, ProtocolError};
use crate::fsm::ProtocolState;
use crate::htlc::{ChannelHtlc, Expiry, Side};
use crate::packet::{
    CloseClearing, CloseSignature, ErrorPkt, OpenAnchor, OpenChannel, OpenCommitSig, OpenComplete, Pkt, UpdateAddHtlc,
    UpdateCommit, UpdateFailHtlc, UpdateFulfillHtlc, UpdateRevocation,
};
use crate::revocation::RevocationLadder;
use crate::staging::{SideView, StagingBuffers, StagingChange};
use crate::state::ChannelState;

/// Zero-sized marker returned by every `accept_pkt_*` handler on success
/// (spec §4.4: "Each returns either `Accepted` or an `Error` packet").
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Accepted;

/// A capability error is never peer-caused; there is no taxonomy slot for it
/// in `ProtocolError` (spec §7's ten kinds are all wire/invariant failures).
/// Treated as a malformed-input-shaped failure of the operation in progress,
/// since the alternative (panicking inside a wire-reachable path) is exactly
/// what spec §9's Design Notes forbid.
fn capability_failure(_e: CapabilityError) -> ProtocolError {
    ProtocolError::MalformedField
}

impl From<CommandError> for ProtocolError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::InsufficientFunds => ProtocolError::InsufficientFunds,
            CommandError::TooManyHtlcs => ProtocolError::TooManyHtlcs,
            CommandError::DuplicateId => ProtocolError::DuplicateId,
            CommandError::NotFound => ProtocolError::NotFound,
            CommandError::BadPreimage => ProtocolError::BadPreimage,
            CommandError::BlockHeightExpiry => ProtocolError::MalformedField,
            CommandError::WrongState(_) => ProtocolError::Unexpected,
            CommandError::HostCapability(_) => ProtocolError::MalformedField,
        }
    }
}

/// The anchor this channel spends, plus which side funded it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AnchorMeta {
    pub point: AnchorPoint,
    pub anchor_satoshis: u64,
    pub funder: Side,
}

/// Mutual-close handshake state (spec §3's `Peer.closing`, §4.7).
#[derive(Clone, Debug)]
pub struct ClosingState {
    pub our_fee: u64,
    pub their_fee: Option<u64>,
    pub their_sig: Option<Signature>,
    pub our_script: Vec<u8>,
    pub their_script: Option<Vec<u8>>,
}

/// Per-peer channel state: everything in spec §3's `Peer` except the host
/// capabilities, which live in `HostContext` and are threaded through
/// `ChannelEngine` instead (spec §9's redesign note: "pass a `HostContext`
/// ... by explicit reference; no process-wide singleton").
#[derive(Clone, Debug)]
pub struct PeerChannel {
    id: String,
    state: ProtocolState,
    funder: Side,
    feerate_per_kw: u32,
    anchor: Option<AnchorMeta>,
    local_open: Option<OpenChannel>,
    remote_open: Option<OpenChannel>,
    buffers: Option<StagingBuffers>,
    ladder: RevocationLadder,
    htlc_id_counter: u64,
    remote_next_htlc_id: u64,
    outbound: VecDeque<Pkt>,
    commit_timer_pending: bool,
    closing: Option<ClosingState>,
}

impl PeerChannel {
    fn new(id: impl Into<String>) -> Self {
        PeerChannel {
            id: id.into(),
            state: ProtocolState::Init,
            funder: Side::Ours,
            feerate_per_kw: 0,
            anchor: None,
            local_open: None,
            remote_open: None,
            buffers: None,
            ladder: RevocationLadder::new(),
            htlc_id_counter: 0,
            remote_next_htlc_id: 0,
            outbound: VecDeque::new(),
            commit_timer_pending: false,
            closing: None,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    #[inline]
    pub fn anchor(&self) -> Option<AnchorMeta> {
        self.anchor
    }

    #[inline]
    pub fn ladder(&self) -> &RevocationLadder {
        &self.ladder
    }

    #[inline]
    pub fn closing(&self) -> Option<&ClosingState> {
        self.closing.as_ref()
    }

    #[inline]
    pub fn buffers(&self) -> Option<&StagingBuffers> {
        self.buffers.as_ref()
    }

    /// Pops the next outbound packet, in enqueue order (spec §5's ordering
    /// guarantee 1).
    pub fn pop_outbound(&mut self) -> Option<Pkt> {
        self.outbound.pop_front()
    }

    #[inline]
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    fn enqueue(&mut self, pkt: Pkt) {
        self.outbound.push_back(pkt);
    }

    fn fail_out(&mut self, kind: ProtocolError, problem: impl Into<String>) -> ProtocolError {
        self.enqueue(Pkt::Error(ErrorPkt { problem: problem.into() }));
        self.state = ProtocolState::ErrBreakdown;
        kind
    }
}

/// Parameters the application layer supplies to open a channel (spec §4.4
/// `open(anchor_offer)`).
#[derive(Clone, Copy, Debug)]
pub struct OpenParams {
    pub anchor_satoshis: u64,
    pub push_msat: u64,
    pub feerate_per_kw: u32,
    pub min_depth: u32,
    pub to_self_delay: u32,
    pub commit_key: secp256k1::PublicKey,
    pub final_key: secp256k1::PublicKey,
    pub will_create_anchor: bool,
}

/// Ties `ChannelState`, `CommitInfo`, `RevocationLadder`, `StagingBuffers`,
/// `ProtocolFSM` and `PacketCodec` together for one peer, generic over the
/// host capabilities it consumes (spec §6.2) rather than over the teacher's
/// open extension-pipeline marker (`DESIGN.md`'s redesign note).
pub struct ChannelEngine<C: Capabilities> {
    host: HostContext<C>,
    peer: PeerChannel,
}

impl<C: Capabilities> ChannelEngine<C> {
    pub fn new(host: HostContext<C>, peer_id: impl Into<String>) -> Self {
        ChannelEngine { host, peer: PeerChannel::new(peer_id) }
    }

    #[inline]
    pub fn host(&self) -> &HostContext<C> {
        &self.host
    }

    #[inline]
    pub fn peer(&self) -> &PeerChannel {
        &self.peer
    }

    #[inline]
    pub fn state(&self) -> ProtocolState {
        self.peer.state
    }

    pub fn pop_outbound(&mut self) -> Option<Pkt> {
        self.peer.pop_outbound()
    }

    fn require_command_state(&self, want: ProtocolState) -> Result<(), CommandError> {
        self.require_command_state_matching(|state| state == want)
    }

    fn require_wire_state(&mut self, want: ProtocolState) -> Result<(), ProtocolError> {
        self.require_wire_state_matching(|state| state == want)
    }

    /// Like [`Self::require_command_state`], but accepts any state the
    /// predicate allows — used where more than one top-level state permits
    /// a command (e.g. fulfil/fail settling during `CLEARING`, spec §4.7).
    fn require_command_state_matching(&self, pred: impl Fn(ProtocolState) -> bool) -> Result<(), CommandError> {
        if !pred(self.peer.state) {
            return Err(CommandError::WrongState(self.peer.state));
        }
        Ok(())
    }

    /// Wire-side counterpart of [`Self::require_command_state_matching`].
    fn require_wire_state_matching(&mut self, pred: impl Fn(ProtocolState) -> bool) -> Result<(), ProtocolError> {
        if !pred(self.peer.state) {
            log::warn!("peer {}: unexpected packet for state {}", self.peer.id, self.peer.state);
            return Err(self.peer.fail_out(ProtocolError::Unexpected, format!("unexpected packet for state {}", self.peer.state)));
        }
        Ok(())
    }

    fn buffers_mut(&mut self) -> Result<&mut StagingBuffers, ProtocolError> {
        self.peer.buffers.as_mut().ok_or_else(|| ProtocolError::Unexpected)
    }

    // ---- Open handshake (spec §4.3, §4.4) ------------------------------

    /// Allowed only in `INIT`. Emits `OpenChannel` and moves to
    /// `OPEN_WAIT_FOR_OPEN`.
    pub fn open(&mut self, params: OpenParams) -> Result<(), CommandError> {
        self.require_command_state(ProtocolState::Init)?;

        let first_revocation_hash = self.host.capabilities.signer().revocation_hash(0)?;
        self.peer.feerate_per_kw = params.feerate_per_kw;

        let open = OpenChannel {
            anchor_satoshis: params.anchor_satoshis,
            push_msat: params.push_msat,
            initial_fee_rate: params.feerate_per_kw,
            min_depth: params.min_depth,
            to_self_delay: params.to_self_delay,
            commit_key: params.commit_key,
            final_key: params.final_key,
            first_revocation_hash,
            will_create_anchor: params.will_create_anchor,
        };
        self.peer.local_open = Some(open.clone());
        self.peer.enqueue(Pkt::Open(open));
        self.peer.state = ProtocolState::OpenWaitForOpen;
        log::debug!("peer {}: sent OpenChannel, -> OPEN_WAIT_FOR_OPEN", self.peer.id);
        Ok(())
    }

    /// Inbound `OpenChannel` from the counterparty. Validates the
    /// field-level contracts of spec §6.1 and the exactly-one-funder rule.
    pub fn accept_pkt_open(&mut self, pkt: OpenChannel) -> Result<Accepted, ProtocolError> {
        self.require_wire_state(ProtocolState::OpenWaitForOpen)?;

        let local = self.peer.local_open.clone().ok_or_else(|| self.peer.fail_out(ProtocolError::Unexpected, "no local Open on file"))?;
        if pkt.initial_fee_rate < self.host.config.commitment_fee_rate_min() {
            return Err(self.peer.fail_out(ProtocolError::MalformedField, "feerate below configured minimum"));
        }
        if pkt.min_depth > self.host.config.anchor_confirms_max() {
            return Err(self.peer.fail_out(ProtocolError::MalformedField, "min_depth above configured maximum"));
        }
        if pkt.to_self_delay > self.host.config.rel_locktime_max() {
            return Err(self.peer.fail_out(ProtocolError::MalformedField, "to_self_delay above configured maximum"));
        }
        if local.will_create_anchor == pkt.will_create_anchor {
            return Err(self.peer.fail_out(ProtocolError::MalformedField, "exactly one side must announce WILL_CREATE_ANCHOR"));
        }
        if local.anchor_satoshis != pkt.anchor_satoshis {
            return Err(self.peer.fail_out(ProtocolError::MalformedField, "anchor_satoshis mismatch between Open messages"));
        }

        self.peer.funder = if pkt.will_create_anchor { Side::Theirs } else { Side::Ours };
        self.peer.remote_open = Some(pkt);
        self.peer.state = ProtocolState::OpenWaitForAnchor;
        log::debug!("peer {}: accepted OpenChannel, -> OPEN_WAIT_FOR_ANCHOR", self.peer.id);
        Ok(Accepted)
    }

    /// We are the funder: hand over the confirmed anchor outpoint.
    pub fn provide_anchor(&mut self, anchor_input: AnchorPoint) -> Result<(), CommandError> {
        self.require_command_state(ProtocolState::OpenWaitForAnchor)?;
        if self.peer.funder != Side::Ours {
            return Err(CommandError::WrongState(self.peer.state));
        }
        let anchor_satoshis = self.peer.local_open.as_ref().expect("set in open()").anchor_satoshis;
        self.peer.anchor = Some(AnchorMeta { point: anchor_input, anchor_satoshis, funder: Side::Ours });
        self.peer.enqueue(Pkt::OpenAnchor(OpenAnchor {
            txid: anchor_input.txid,
            vout: anchor_input.vout,
            value_sat: anchor_input.value_sat,
        }));
        self.setup_first_commit()
    }

    /// They are the funder: their `OpenAnchor` packet.
    pub fn accept_pkt_anchor(&mut self, pkt: OpenAnchor) -> Result<Accepted, ProtocolError> {
        self.require_wire_state(ProtocolState::OpenWaitForAnchor)?;
        if self.peer.funder != Side::Theirs {
            return Err(self.peer.fail_out(ProtocolError::Unexpected, "anchor offered by the non-funding side"));
        }
        let anchor_satoshis = self.peer.remote_open.as_ref().expect("set in accept_pkt_open").anchor_satoshis;
        let point = AnchorPoint { txid: pkt.txid, vout: pkt.vout, value_sat: pkt.value_sat };
        self.peer.anchor = Some(AnchorMeta { point, anchor_satoshis, funder: Side::Theirs });
        self.setup_first_commit()
            .map_err(|e| {
                let kind = if matches!(e, CommandError::InsufficientFunds) { ProtocolError::InsufficientFunds } else { ProtocolError::MalformedField };
                self.peer.fail_out(kind, e.to_string())
            })?;
        Ok(Accepted)
    }

    /// Builds both sides' genesis commitment via `TxBuilder`, signs the
    /// counterparty's for them, and moves to `OPEN_WAIT_FOR_COMMIT_SIG`
    /// (spec §4.4's `setup_first_commit`).
    fn setup_first_commit(&mut self) -> Result<(), CommandError> {
        let anchor = self.peer.anchor.ok_or_else(|| CommandError::WrongState(self.peer.state))?;
        let local_open = self.peer.local_open.clone().expect("set in open()");
        let remote_open = self.peer.remote_open.clone().expect("set in accept_pkt_open");

        let fee_msat = 1000 * crate::state::expected_fee(self.peer.feerate_per_kw, 0);
        let (funder_balance, other_balance) = match self.peer.funder {
            Side::Ours => ((anchor.anchor_satoshis * 1000).saturating_sub(local_open.push_msat).saturating_sub(fee_msat), local_open.push_msat),
            Side::Theirs => ((anchor.anchor_satoshis * 1000).saturating_sub(remote_open.push_msat).saturating_sub(fee_msat), remote_open.push_msat),
        };
        if funder_balance == 0 && anchor.anchor_satoshis > 0 {
            return Err(CommandError::InsufficientFunds);
        }
        let (balance_ours, balance_theirs) = match self.peer.funder {
            Side::Ours => (funder_balance, other_balance),
            Side::Theirs => (other_balance, funder_balance),
        };
        let genesis_state = ChannelState::new(balance_ours, balance_theirs);

        let keys = CommitKeySet {
            local_commit_key: local_open.commit_key,
            local_final_key: local_open.final_key,
            remote_commit_key: remote_open.commit_key,
            remote_final_key: remote_open.final_key,
        };
        let locktimes = Locktimes { to_self_delay: local_open.to_self_delay, mindepth: local_open.min_depth };

        let our_revocation_hash = self.host.capabilities.signer().revocation_hash(0)?;
        let (local_tx, _) =
            self.host.capabilities.tx_builder().create_commit_tx(keys, locktimes, anchor.point, our_revocation_hash, &genesis_state, Side::Ours)?;
        let local_commit = CommitInfo::genesis(our_revocation_hash, genesis_state.clone(), local_tx);

        let (remote_tx, _) = self.host.capabilities.tx_builder().create_commit_tx(
            keys,
            locktimes,
            anchor.point,
            remote_open.first_revocation_hash,
            &genesis_state,
            Side::Theirs,
        )?;
        let remote_commit = CommitInfo::genesis(remote_open.first_revocation_hash, genesis_state.clone(), remote_tx);

        let our_next_revocation_hash = self.host.capabilities.signer().revocation_hash(1)?;
        let mut local_view = SideView::new(
            genesis_state.clone(),
            our_next_revocation_hash,
            local_open.commit_key,
            local_open.final_key,
            local_open.to_self_delay,
            self.peer.feerate_per_kw,
            local_open.min_depth,
            local_open.will_create_anchor,
        );
        local_view.set_commit(local_commit);

        let mut remote_view = SideView::new(
            genesis_state,
            [0u8; 32],
            remote_open.commit_key,
            remote_open.final_key,
            remote_open.to_self_delay,
            self.peer.feerate_per_kw,
            remote_open.min_depth,
            remote_open.will_create_anchor,
        );
        let remote_sig = self.host.capabilities.signer().sign_their_commit(remote_view.commit().map(CommitInfo::tx).unwrap_or(remote_commit.tx()))?;
        remote_view.set_commit(remote_commit);

        self.peer.buffers = Some(StagingBuffers::new(local_view, remote_view));
        self.peer.enqueue(Pkt::OpenCommitSig(OpenCommitSig { signature: remote_sig }));
        self.peer.state = ProtocolState::OpenWaitForCommitSig;
        log::debug!("peer {}: genesis commitments built, -> OPEN_WAIT_FOR_COMMIT_SIG", self.peer.id);
        Ok(())
    }

    pub fn accept_pkt_open_commit_sig(&mut self, pkt: OpenCommitSig) -> Result<Accepted, ProtocolError> {
        self.require_wire_state(ProtocolState::OpenWaitForCommitSig)?;
        let tx = self.peer.buffers.as_ref().ok_or(ProtocolError::Unexpected)?.local.commit().expect("genesis set").tx().clone();
        let ok = self.host.capabilities.signer().verify_their_commit_sig(&tx, &pkt.signature).map_err(capability_failure)?;
        if !ok {
            return Err(self.peer.fail_out(ProtocolError::BadSignature, "bad signature on genesis commitment"));
        }
        let next_revocation_hash = self.buffers_mut()?.local.next_revocation_hash();
        self.buffers_mut()?.local.commit_mut().expect("genesis set").attach_remote_sig(pkt.signature);
        self.peer.enqueue(Pkt::OpenComplete(OpenComplete { next_revocation_hash }));
        self.peer.state = ProtocolState::OpenWaitForComplete;
        log::debug!("peer {}: commit_sig accepted, -> OPEN_WAIT_FOR_COMPLETE", self.peer.id);
        Ok(Accepted)
    }

    pub fn accept_pkt_open_complete(&mut self, pkt: OpenComplete) -> Result<Accepted, ProtocolError> {
        self.require_wire_state(ProtocolState::OpenWaitForComplete)?;
        self.buffers_mut()?.remote.set_next_revocation_hash(pkt.next_revocation_hash);
        self.peer.state = ProtocolState::Normal;
        log::info!("peer {}: channel open, -> NORMAL", self.peer.id);
        Ok(Accepted)
    }

    // ---- Steady-state HTLC commands (spec §4.4) ------------------------

    /// `id = htlc_id_counter++`. Lands in `remote.staging_cstate` first,
    /// schedules the commit timer (spec §4.6).
    pub fn add_htlc(&mut self, amount_msat: u64, expiry: Expiry, rhash: [u8; 32], route: Vec<u8>) -> Result<u64, CommandError> {
        self.require_command_state(ProtocolState::Normal)?;
        if !expiry.is_seconds() {
            return Err(CommandError::BlockHeightExpiry);
        }
        if amount_msat == 0 {
            return Err(CommandError::InsufficientFunds);
        }

        let id = self.peer.htlc_id_counter;
        let htlc = ChannelHtlc::new(id, Side::Ours, amount_msat, rhash, expiry, route.clone());
        let funder = self.peer.funder;
        let feerate = self.peer.feerate_per_kw;
        self.peer
            .buffers
            .as_mut()
            .ok_or(CommandError::WrongState(self.peer.state))?
            .apply_local_origin(StagingChange::Add(htlc), funder, feerate)?;

        self.peer.htlc_id_counter += 1;
        self.peer.commit_timer_pending = true;
        self.peer.enqueue(Pkt::UpdateAddHtlc(UpdateAddHtlc { id, amount_msat, rhash, expiry, route }));
        log::trace!("peer {}: add_htlc id={} amount_msat={}", self.peer.id, id, amount_msat);
        Ok(id)
    }

    /// Must find the HTLC (offered by the counterparty) in the current
    /// *committed* state, not staging (spec §4.4).
    pub fn fulfill_htlc(&mut self, id: u64, preimage: [u8; 32]) -> Result<(), CommandError> {
        self.require_command_state_matching(ProtocolState::accepts_drain_updates)?;
        let buffers = self.peer.buffers.as_mut().ok_or(CommandError::WrongState(self.peer.state))?;
        let committed = buffers.local.commit().ok_or(CommandError::NotFound)?.state();
        committed.htlc(Side::Theirs, id).ok_or(CommandError::NotFound)?;

        let funder = self.peer.funder;
        let feerate = self.peer.feerate_per_kw;
        buffers.apply_local_origin(StagingChange::Fulfill { id, offered_by: Side::Theirs, preimage }, funder, feerate)?;

        self.peer.commit_timer_pending = true;
        self.peer.enqueue(Pkt::UpdateFulfillHtlc(UpdateFulfillHtlc { id, preimage }));
        Ok(())
    }

    pub fn fail_htlc(&mut self, id: u64, reason: Vec<u8>) -> Result<(), CommandError> {
        self.require_command_state_matching(ProtocolState::accepts_drain_updates)?;
        let buffers = self.peer.buffers.as_mut().ok_or(CommandError::WrongState(self.peer.state))?;
        let committed = buffers.local.commit().ok_or(CommandError::NotFound)?.state();
        committed.htlc(Side::Theirs, id).ok_or(CommandError::NotFound)?;

        let funder = self.peer.funder;
        let feerate = self.peer.feerate_per_kw;
        buffers.apply_local_origin(StagingChange::Fail { id, offered_by: Side::Theirs, reason: reason.clone() }, funder, feerate)?;

        self.peer.commit_timer_pending = true;
        self.peer.enqueue(Pkt::UpdateFailHtlc(UpdateFailHtlc { id, reason }));
        Ok(())
    }

    pub fn accept_pkt_htlc_add(&mut self, pkt: UpdateAddHtlc) -> Result<Accepted, ProtocolError> {
        self.require_wire_state(ProtocolState::Normal)?;
        if !self.peer.state.accepts_new_adds() {
            return Err(self.peer.fail_out(ProtocolError::Unexpected, "add_htlc received outside of accepting state"));
        }
        if pkt.amount_msat == 0 {
            return Err(self.peer.fail_out(ProtocolError::MalformedField, "zero-amount HTLC add"));
        }
        if !pkt.expiry.is_seconds() {
            return Err(self.peer.fail_out(ProtocolError::MalformedField, "block-height expiry variant not accepted"));
        }
        if pkt.id != self.peer.remote_next_htlc_id {
            return Err(self.peer.fail_out(ProtocolError::MalformedField, "HTLC id not strictly increasing"));
        }

        let funder = self.peer.funder;
        let feerate = self.peer.feerate_per_kw;
        let htlc = ChannelHtlc::new(pkt.id, Side::Theirs, pkt.amount_msat, pkt.rhash, pkt.expiry, pkt.route.clone());

        // Open Question (DESIGN.md): affordability for incoming adds is
        // checked against the last fully-acked committed state, not
        // whatever staging already reflects.
        let buffers = self.buffers_mut()?;
        let committed = buffers.local.commit().expect("open handshake completed before NORMAL").state();
        committed.add_htlc(Side::Theirs, htlc.clone(), funder, feerate)?;

        buffers.apply_remote_origin(StagingChange::Add(htlc), funder, feerate)?;
        self.peer.remote_next_htlc_id += 1;
        log::trace!("peer {}: accepted inbound add id={}", self.peer.id, pkt.id);
        Ok(Accepted)
    }

    pub fn accept_pkt_htlc_fulfill(&mut self, pkt: UpdateFulfillHtlc) -> Result<Accepted, ProtocolError> {
        self.require_wire_state_matching(ProtocolState::accepts_drain_updates)?;
        let funder = self.peer.funder;
        let feerate = self.peer.feerate_per_kw;
        let buffers = self.buffers_mut()?;
        let committed = buffers.local.commit().expect("open handshake completed before NORMAL").state();
        committed.htlc(Side::Ours, pkt.id).ok_or_else(|| ProtocolError::NotFound)?;

        buffers.apply_remote_origin(StagingChange::Fulfill { id: pkt.id, offered_by: Side::Ours, preimage: pkt.preimage }, funder, feerate)?;
        self.try_advance_clearing()?;
        Ok(Accepted)
    }

    pub fn accept_pkt_htlc_fail(&mut self, pkt: UpdateFailHtlc) -> Result<Accepted, ProtocolError> {
        self.require_wire_state_matching(ProtocolState::accepts_drain_updates)?;
        let funder = self.peer.funder;
        let feerate = self.peer.feerate_per_kw;
        let buffers = self.buffers_mut()?;
        let committed = buffers.local.commit().expect("open handshake completed before NORMAL").state();
        committed.htlc(Side::Ours, pkt.id).ok_or_else(|| ProtocolError::NotFound)?;

        buffers.apply_remote_origin(StagingChange::Fail { id: pkt.id, offered_by: Side::Ours, reason: pkt.reason }, funder, feerate)?;
        self.try_advance_clearing()?;
        Ok(Accepted)
    }

    // ---- Commit / revocation exchange (spec §4.4's two sub-sections) ---

    /// Fired by the commit timer. Builds+signs a new `remote.commit` tip iff
    /// there are unacked local-origin changes; a bare re-fire with nothing
    /// pending is a silent no-op (spec §8 property 9, idempotence).
    pub fn trigger_commit(&mut self) -> Result<(), CommandError> {
        self.require_command_state_matching(ProtocolState::accepts_drain_updates)?;
        self.peer.commit_timer_pending = false;

        if self.peer.buffers.as_ref().unwrap().remote.pending_changes().is_empty() {
            return Ok(());
        }

        let anchor = self.peer.anchor.ok_or(CommandError::WrongState(self.peer.state))?;
        let keys = self.commit_key_set();
        let locktimes = self.locktimes(Side::Theirs);

        let revocation_hash = self.peer.buffers.as_ref().unwrap().remote.next_revocation_hash();
        let new_state = self.peer.buffers.as_ref().unwrap().remote.staging_cstate().copy();
        let (tx, _) = self.host.capabilities.tx_builder().create_commit_tx(keys, locktimes, anchor.point, revocation_hash, &new_state, Side::Theirs)?;
        let sig = self.host.capabilities.signer().sign_their_commit(&tx)?;

        let buffers = self.peer.buffers.as_mut().unwrap();
        let unacked = buffers.remote.take_pending_changes();
        let old_commit = buffers.remote.take_commit().expect("genesis commit always present in NORMAL");
        buffers.remote.set_commit(old_commit.advance(revocation_hash, new_state, tx, unacked));

        self.peer.enqueue(Pkt::UpdateCommit(UpdateCommit { signature: sig }));
        log::debug!("peer {}: sent UpdateCommit for commit_num={}", self.peer.id, self.peer.buffers.as_ref().unwrap().remote.commit().unwrap().commit_num());
        Ok(())
    }

    pub fn accept_pkt_commit(&mut self, pkt: UpdateCommit) -> Result<Accepted, ProtocolError> {
        self.require_wire_state_matching(ProtocolState::accepts_drain_updates)?;

        if self.peer.buffers.as_ref().unwrap().local.pending_changes().is_empty() {
            return Err(self.peer.fail_out(ProtocolError::EmptyCommit, "commitment carries no new changes"));
        }

        let anchor = self.peer.anchor.ok_or_else(|| self.peer.fail_out(ProtocolError::Unexpected, "no anchor on file"))?;
        let keys = self.commit_key_set();
        let locktimes = self.locktimes(Side::Ours);
        let revocation_hash = self.peer.buffers.as_ref().unwrap().local.next_revocation_hash();
        let new_state = self.peer.buffers.as_ref().unwrap().local.staging_cstate().copy();

        let (tx, _) = self
            .host
            .capabilities
            .tx_builder()
            .create_commit_tx(keys, locktimes, anchor.point, revocation_hash, &new_state, Side::Ours)
            .map_err(capability_failure)?;
        let ok = self.host.capabilities.signer().verify_their_commit_sig(&tx, &pkt.signature).map_err(capability_failure)?;
        if !ok {
            return Err(self.peer.fail_out(ProtocolError::BadSignature, "bad signature"));
        }

        let new_commit_num = {
            let buffers = self.peer.buffers.as_mut().unwrap();
            let unacked = buffers.local.take_pending_changes();
            let old_commit = buffers.local.take_commit().expect("genesis commit always present in NORMAL");
            let mut new_commit = old_commit.advance(revocation_hash, new_state, tx, unacked);
            new_commit.attach_remote_sig(pkt.signature);
            let commit_num = new_commit.commit_num();
            buffers.local.set_commit(new_commit);
            commit_num
        };

        let next_revocation_hash = self.host.capabilities.signer().revocation_hash(new_commit_num + 1).map_err(capability_failure)?;
        self.peer.buffers.as_mut().unwrap().local.set_next_revocation_hash(next_revocation_hash);

        self.send_revocation()?;
        log::debug!("peer {}: accepted UpdateCommit, commit_num={}", self.peer.id, new_commit_num);
        Ok(Accepted)
    }

    /// Emits our `UpdateRevocation` for `local.commit.prev` (spec §4.4
    /// "sending UpdateRevocation"), called right after `accept_pkt_commit`
    /// advances `local.commit`.
    fn send_revocation(&mut self) -> Result<(), ProtocolError> {
        let (prev_commit_num, prev_hash, unacked) = {
            let buffers = self.peer.buffers.as_mut().unwrap();
            let prev = buffers.local.commit_mut().unwrap().prev_mut().expect("at least genesis precedes every post-open commit");
            (prev.commit_num(), prev.revocation_hash(), prev.take_unacked_changes())
        };

        let preimage = self.host.capabilities.signer().revocation_preimage(prev_commit_num).map_err(capability_failure)?;
        if sha256::Hash::hash(&preimage).into_inner() != prev_hash {
            // Our own Signer failed to reproduce its own committed hash:
            // a host-capability bug, not a peer-caused protocol error.
            panic!("signer produced a revocation preimage inconsistent with its own prior commitment");
        }

        let next_revocation_hash = self.peer.buffers.as_ref().unwrap().local.next_revocation_hash();
        self.peer.enqueue(Pkt::UpdateRevocation(UpdateRevocation { preimage, next_revocation_hash }));

        let funder = self.peer.funder;
        let feerate = self.peer.feerate_per_kw;
        self.peer.buffers.as_mut().unwrap().cross_over_to_remote(&unacked, funder, feerate).map_err(ProtocolError::from)?;
        Ok(())
    }

    pub fn accept_pkt_revocation(&mut self, pkt: UpdateRevocation) -> Result<Accepted, ProtocolError> {
        self.require_wire_state_matching(ProtocolState::accepts_drain_updates)?;

        let (prev_commit_num, unacked) = {
            let buffers = self.peer.buffers.as_mut().unwrap();
            let remote_commit = buffers.remote.commit_mut().ok_or_else(|| ProtocolError::Unexpected)?;
            let prev = match remote_commit.prev_mut() {
                Some(p) => p,
                None => return Err(self.peer.fail_out(ProtocolError::Unexpected, "revocation received with no prior commitment to revoke")),
            };
            if prev.reveal_preimage(pkt.preimage).is_err() {
                return Err(self.peer.fail_out(ProtocolError::BadPreimage, "complete preimage incorrect"));
            }
            (prev.commit_num(), prev.take_unacked_changes())
        };

        if self.peer.ladder.insert(u64::MAX - prev_commit_num, pkt.preimage).is_err() {
            return Err(self.peer.fail_out(ProtocolError::ShachainBreak, "preimage not next in shachain"));
        }

        self.peer.buffers.as_mut().unwrap().remote.set_next_revocation_hash(pkt.next_revocation_hash);
        let funder = self.peer.funder;
        let feerate = self.peer.feerate_per_kw;
        self.peer
            .buffers
            .as_mut()
            .unwrap()
            .cross_over_to_local(&unacked, funder, feerate)
            .map_err(|_| self.peer.fail_out(ProtocolError::Unexpected, "crossover replay failed"))?;

        log::debug!("peer {}: revocation accepted for commit_num={}", self.peer.id, prev_commit_num);
        self.try_advance_clearing()?;
        Ok(Accepted)
    }

    fn commit_key_set(&self) -> CommitKeySet {
        let local_open = self.peer.local_open.as_ref().expect("set during open()");
        let remote_open = self.peer.remote_open.as_ref().expect("set during accept_pkt_open");
        CommitKeySet {
            local_commit_key: local_open.commit_key,
            local_final_key: local_open.final_key,
            remote_commit_key: remote_open.commit_key,
            remote_final_key: remote_open.final_key,
        }
    }

    fn locktimes(&self, for_side: Side) -> Locktimes {
        let open = match for_side {
            Side::Ours => self.peer.local_open.as_ref().expect("set during open()"),
            Side::Theirs => self.peer.remote_open.as_ref().expect("set during accept_pkt_open"),
        };
        Locktimes { to_self_delay: open.to_self_delay, mindepth: open.min_depth }
    }

    /// Schedules the one-shot commit timer if one isn't already pending
    /// (spec §4.6).
    pub fn maybe_schedule_commit_timer(&mut self) {
        if self.peer.commit_timer_pending {
            let dur = self.host.config.commit_timer();
            let _handle = self.host.capabilities.clock().after(dur, 0);
        }
    }

    // ---- Mutual close (spec §4.7) --------------------------------------

    pub fn begin_clearing(&mut self) -> Result<(), CommandError> {
        self.require_command_state(ProtocolState::Normal)?;
        let final_key = self.peer.local_open.as_ref().expect("set during open()").final_key;
        let script = self.host.capabilities.tx_builder().closing_script(final_key)?.to_bytes();

        self.peer.closing = Some(ClosingState {
            our_fee: self.initial_close_fee(),
            their_fee: None,
            their_sig: None,
            our_script: script.clone(),
            their_script: None,
        });
        self.peer.enqueue(Pkt::CloseClearing(CloseClearing { script }));
        self.peer.state = ProtocolState::Clearing;
        log::info!("peer {}: begin_clearing, -> CLEARING", self.peer.id);
        Ok(())
    }

    fn initial_close_fee(&self) -> u64 {
        crate::state::expected_fee(self.peer.feerate_per_kw, 0)
    }

    pub fn accept_pkt_close_clearing(&mut self, pkt: CloseClearing) -> Result<Accepted, ProtocolError> {
        if !matches!(self.peer.state, ProtocolState::Normal | ProtocolState::Clearing) {
            return Err(self.peer.fail_out(ProtocolError::Unexpected, "clearing received outside of NORMAL/CLEARING"));
        }
        if self.peer.closing.is_none() {
            let final_key = self.peer.local_open.as_ref().expect("set during open()").final_key;
            let script = self.host.capabilities.tx_builder().closing_script(final_key).map_err(capability_failure)?.to_bytes();
            self.peer.closing = Some(ClosingState {
                our_fee: self.initial_close_fee(),
                their_fee: None,
                their_sig: None,
                our_script: script.clone(),
                their_script: None,
            });
            self.peer.enqueue(Pkt::CloseClearing(CloseClearing { script }));
        }
        self.peer.closing.as_mut().unwrap().their_script = Some(pkt.script);
        self.peer.state = ProtocolState::Clearing;
        self.try_advance_clearing()?;
        Ok(Accepted)
    }

    /// Once both scripts are known and no HTLCs remain on either side,
    /// proposes the first `CloseSignature` and moves to
    /// `CLOSE_WAIT_SIG` (spec §4.7).
    fn try_advance_clearing(&mut self) -> Result<(), ProtocolError> {
        if self.peer.state != ProtocolState::Clearing {
            return Ok(());
        }
        let drained = match &self.peer.buffers {
            Some(b) => b.local.staging_cstate().total_htlcs() == 0 && b.remote.staging_cstate().total_htlcs() == 0,
            None => false,
        };
        let closing = match &self.peer.closing {
            Some(c) if c.their_script.is_some() => c,
            _ => return Ok(()),
        };
        if !drained {
            return Ok(());
        }

        let fee = closing.our_fee;
        let tx = self.host.capabilities.tx_builder().create_close_tx(fee).map_err(capability_failure)?;
        let sig = self.host.capabilities.signer().sign_mutual_close(&tx).map_err(capability_failure)?;
        self.peer.enqueue(Pkt::CloseSignature(CloseSignature { fee_satoshis: fee, signature: sig }));
        self.peer.state = ProtocolState::CloseWaitSig;
        log::info!("peer {}: HTLCs drained, -> CLOSE_WAIT_SIG", self.peer.id);
        Ok(())
    }

    pub fn accept_pkt_close_signature(&mut self, pkt: CloseSignature) -> Result<Accepted, ProtocolError> {
        self.require_wire_state(ProtocolState::CloseWaitSig)?;
        let closing = self.peer.closing.as_mut().ok_or_else(|| ProtocolError::Unexpected)?;
        closing.their_fee = Some(pkt.fee_satoshis);
        closing.their_sig = Some(pkt.signature);

        if closing.our_fee == pkt.fee_satoshis
            || closing.our_fee.abs_diff(pkt.fee_satoshis) <= self.host.config.close_fee_tolerance_sat()
        {
            self.peer.state = ProtocolState::Closed;
            log::info!("peer {}: close fees converged at {} sat, -> CLOSED", self.peer.id, pkt.fee_satoshis);
            return Ok(Accepted);
        }

        // Move our next proposal toward the midpoint (spec §4.7's
        // iteration policy, made concrete per SPEC_FULL.md §4.7).
        let midpoint = (closing.our_fee + pkt.fee_satoshis) / 2;
        let next_fee = if midpoint == closing.our_fee { pkt.fee_satoshis } else { midpoint };
        closing.our_fee = next_fee;

        let tx = self.host.capabilities.tx_builder().create_close_tx(next_fee).map_err(capability_failure)?;
        let sig = self.host.capabilities.signer().sign_mutual_close(&tx).map_err(capability_failure)?;
        self.peer.enqueue(Pkt::CloseSignature(CloseSignature { fee_satoshis: next_fee, signature: sig }));
        Ok(Accepted)
    }

    pub fn accept_pkt_error(&mut self, pkt: ErrorPkt) -> Accepted {
        log::warn!("peer {}: counterparty raised Error: {}", self.peer.id, pkt.problem);
        self.peer.state = ProtocolState::ErrBreakdown;
        Accepted
    }

    /// Cancellation per spec §5: drains nothing further, emits a final
    /// `Error`, and releases everything except the revocation ladder
    /// (retained for on-chain defense).
    pub fn shutdown(&mut self, reason: impl Into<String>) {
        self.peer.enqueue(Pkt::error(reason.into()));
        self.peer.state = ProtocolState::ErrBreakdown;
        self.peer.buffers = None;
    }

    /// Persisted-state snapshot (spec §6.3): commitment chains, revocation
    /// ladder, `htlc_id_counter`, peer id, anchor meta. `SideView` already
    /// carries `staging_cstate` as "committed + unacked", so restoring it
    /// verbatim *is* "replay `unacked_changes` on top of the committed
    /// states" — there is no separate replay step to perform.
    pub fn snapshot(&self) -> Option<PersistedChannel> {
        let buffers = self.peer.buffers.as_ref()?;
        Some(PersistedChannel {
            id: self.peer.id.clone(),
            state: self.peer.state,
            funder: self.peer.funder,
            feerate_per_kw: self.peer.feerate_per_kw,
            anchor: self.peer.anchor,
            local: buffers.local.clone(),
            remote: buffers.remote.clone(),
            ladder: self.peer.ladder.clone(),
            htlc_id_counter: self.peer.htlc_id_counter,
            remote_next_htlc_id: self.peer.remote_next_htlc_id,
        })
    }

    pub fn restore(host: HostContext<C>, persisted: PersistedChannel) -> Self {
        let mut peer = PeerChannel::new(persisted.id);
        peer.state = persisted.state;
        peer.funder = persisted.funder;
        peer.feerate_per_kw = persisted.feerate_per_kw;
        peer.anchor = persisted.anchor;
        peer.buffers = Some(StagingBuffers::new(persisted.local, persisted.remote));
        peer.ladder = persisted.ladder;
        peer.htlc_id_counter = persisted.htlc_id_counter;
        peer.remote_next_htlc_id = persisted.remote_next_htlc_id;
        ChannelEngine { host, peer }
    }
}

/// The subset of `PeerChannel` that must survive a crash-restart (spec
/// §6.3). Not itself wire-encoded: persistence format is a host concern.
#[derive(Clone, Debug)]
pub struct PersistedChannel {
    pub id: String,
    pub state: ProtocolState,
    pub funder: Side,
    pub feerate_per_kw: u32,
    pub anchor: Option<AnchorMeta>,
    pub local: SideView,
    pub remote: SideView,
    pub ladder: RevocationLadder,
    pub htlc_id_counter: u64,
    pub remote_next_htlc_id: u64,
}

#[cfg(test)]
mod scenarios {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use bitcoin::{OutPoint, PackedLockTime, Script, Transaction, TxIn, TxOut, Txid};
    use secp256k1::{Secp256k1, SecretKey};

    use super::*;
    use crate::capabilities::{ChainMonitor, Clock, PacketTransport, Signer, TimerHandle, TxBuilder};

    fn key(byte: u8) -> secp256k1::PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        secp256k1::PublicKey::from_secret_key(&secp, &sk)
    }

    fn dummy_tx(marker: u64) -> Transaction {
        Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_hash(sha256::Hash::hash(&marker.to_le_bytes())), 0),
                ..Default::default()
            }],
            output: vec![TxOut { value: 0, script_pubkey: Script::new() }],
        }
    }

    /// A deterministic fake signer: revocation material for commitment
    /// `commit_num` is derived from a single master seed via
    /// [`crate::revocation::generate_from_seed`] at index `u64::MAX -
    /// commit_num` — the same shachain rule `RevocationLadder::insert`
    /// verifies consistency against, unlike independently-hashed-per-index
    /// preimages.
    struct FakeSigner {
        seed: [u8; 32],
    }

    impl Signer for FakeSigner {
        fn sign_their_commit(&self, _tx: &Transaction) -> Result<Signature, CapabilityError> {
            Ok(dummy_sig())
        }

        fn sign_mutual_close(&self, _tx: &Transaction) -> Result<Signature, CapabilityError> {
            Ok(dummy_sig())
        }

        fn revocation_preimage(&self, commit_num: u64) -> Result<[u8; 32], CapabilityError> {
            Ok(crate::revocation::generate_from_seed(self.seed, u64::MAX - commit_num))
        }

        fn revocation_hash(&self, commit_num: u64) -> Result<[u8; 32], CapabilityError> {
            Ok(sha256::Hash::hash(&self.revocation_preimage(commit_num)?).into_inner())
        }

        fn verify_their_commit_sig(&self, _tx: &Transaction, _sig: &Signature) -> Result<bool, CapabilityError> {
            Ok(true)
        }
    }

    fn dummy_sig() -> Signature {
        let secp = Secp256k1::signing_only();
        let sk = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let msg = secp256k1::Message::from_slice(&[7u8; 32]).unwrap();
        secp.sign_ecdsa(&msg, &sk)
    }

    struct FakeTxBuilder {
        counter: Cell<u64>,
    }

    impl TxBuilder for FakeTxBuilder {
        fn create_commit_tx(
            &self,
            _fkeys: CommitKeySet,
            _locktimes: Locktimes,
            _anchor: AnchorPoint,
            _revocation_hash: [u8; 32],
            _cstate: &ChannelState,
            _for_side: Side,
        ) -> Result<(Transaction, crate::capabilities::CommitOutputMap), CapabilityError> {
            let marker = self.counter.get();
            self.counter.set(marker + 1);
            Ok((dummy_tx(marker), crate::capabilities::CommitOutputMap::default()))
        }

        fn create_close_tx(&self, _fee_sat: u64) -> Result<Transaction, CapabilityError> {
            let marker = self.counter.get();
            self.counter.set(marker + 1);
            Ok(dummy_tx(marker))
        }

        fn redeem_2of2(&self, _key_a: secp256k1::PublicKey, _key_b: secp256k1::PublicKey) -> Result<Script, CapabilityError> {
            Ok(Script::new())
        }

        fn p2sh(&self, _script: &Script) -> Result<bitcoin::Address, CapabilityError> {
            Err(CapabilityError::TxBuildFailed("unused in tests".into()))
        }

        fn closing_script(&self, _final_key: secp256k1::PublicKey) -> Result<Script, CapabilityError> {
            Ok(Script::new())
        }
    }

    struct FakeClock {
        next_handle: Cell<u64>,
    }

    impl Clock for FakeClock {
        fn now(&self) -> std::time::Duration {
            std::time::Duration::from_secs(0)
        }

        fn after(&mut self, _duration: std::time::Duration, _tag: u64) -> TimerHandle {
            let h = self.next_handle.get();
            self.next_handle.set(h + 1);
            TimerHandle(h)
        }

        fn cancel(&mut self, _handle: TimerHandle) {}
    }

    struct FakeTransport;

    impl PacketTransport for FakeTransport {
        fn send(&mut self, _bytes: Vec<u8>) -> Result<(), CapabilityError> {
            Ok(())
        }

        fn recv(&mut self) -> Result<Option<Vec<u8>>, CapabilityError> {
            Ok(None)
        }
    }

    struct FakeChainMonitor;

    impl ChainMonitor for FakeChainMonitor {
        fn anchor_confirmed(&self) -> bool {
            true
        }

        fn commit_published(&self) -> Option<Transaction> {
            None
        }
    }

    struct FakeCapabilities {
        signer: FakeSigner,
        tx_builder: FakeTxBuilder,
        transport: FakeTransport,
        clock: FakeClock,
        chain_monitor: FakeChainMonitor,
    }

    impl FakeCapabilities {
        fn new(seed_byte: u8) -> Self {
            FakeCapabilities {
                signer: FakeSigner { seed: [seed_byte; 32] },
                tx_builder: FakeTxBuilder { counter: Cell::new(0) },
                transport: FakeTransport,
                clock: FakeClock { next_handle: Cell::new(0) },
                chain_monitor: FakeChainMonitor,
            }
        }
    }

    impl Capabilities for FakeCapabilities {
        type Signer = FakeSigner;
        type TxBuilder = FakeTxBuilder;
        type Transport = FakeTransport;
        type Clock = FakeClock;
        type ChainMonitor = FakeChainMonitor;

        fn signer(&self) -> &Self::Signer {
            &self.signer
        }

        fn tx_builder(&self) -> &Self::TxBuilder {
            &self.tx_builder
        }

        fn transport(&mut self) -> &mut Self::Transport {
            &mut self.transport
        }

        fn clock(&mut self) -> &mut Self::Clock {
            &mut self.clock
        }

        fn chain_monitor(&self) -> &Self::ChainMonitor {
            &self.chain_monitor
        }
    }

    fn engine(seed_byte: u8, id: &str) -> ChannelEngine<FakeCapabilities> {
        let host = HostContext::new(EngineConfig_with_min_depth(), FakeCapabilities::new(seed_byte));
        ChannelEngine::new(host, id)
    }

    #[allow(non_snake_case)]
    fn EngineConfig_with_min_depth() -> crate::config::EngineConfig {
        crate::config::EngineConfig::default()
    }

    fn open_params(will_create_anchor: bool, key_byte: u8) -> OpenParams {
        OpenParams {
            anchor_satoshis: 1_000_000,
            push_msat: 0,
            feerate_per_kw: 5000,
            min_depth: 3,
            to_self_delay: 144,
            commit_key: key(key_byte),
            final_key: key(key_byte + 1),
            will_create_anchor,
        }
    }

    /// Drives both engines through the open handshake up to `NORMAL` (spec
    /// §8 scenario S1).
    fn open_channel_pair() -> (ChannelEngine<FakeCapabilities>, ChannelEngine<FakeCapabilities>) {
        let mut a = engine(0xA0, "b");
        let mut b = engine(0xB0, "a");

        a.open(open_params(true, 10)).unwrap();
        b.open(open_params(false, 20)).unwrap();

        let a_open = match a.pop_outbound().unwrap() {
            Pkt::Open(o) => o,
            _ => panic!("expected Open"),
        };
        let b_open = match b.pop_outbound().unwrap() {
            Pkt::Open(o) => o,
            _ => panic!("expected Open"),
        };

        b.accept_pkt_open(a_open).unwrap();
        a.accept_pkt_open(b_open).unwrap();

        let anchor = AnchorPoint { txid: [9u8; 32], vout: 0, value_sat: 1_000_000 };
        a.provide_anchor(anchor).unwrap();
        let anchor_pkt = match a.pop_outbound().unwrap() {
            Pkt::OpenAnchor(p) => p,
            _ => panic!("expected OpenAnchor"),
        };
        b.accept_pkt_anchor(anchor_pkt).unwrap();

        let a_sig = match a.pop_outbound().unwrap() {
            Pkt::OpenCommitSig(p) => p,
            _ => panic!("expected OpenCommitSig"),
        };
        let b_sig = match b.pop_outbound().unwrap() {
            Pkt::OpenCommitSig(p) => p,
            _ => panic!("expected OpenCommitSig"),
        };
        b.accept_pkt_open_commit_sig(a_sig).unwrap();
        a.accept_pkt_open_commit_sig(b_sig).unwrap();

        let a_complete = match a.pop_outbound().unwrap() {
            Pkt::OpenComplete(p) => p,
            _ => panic!("expected OpenComplete"),
        };
        let b_complete = match b.pop_outbound().unwrap() {
            Pkt::OpenComplete(p) => p,
            _ => panic!("expected OpenComplete"),
        };
        b.accept_pkt_open_complete(a_complete).unwrap();
        a.accept_pkt_open_complete(b_complete).unwrap();

        assert_eq!(a.state(), ProtocolState::Normal);
        assert_eq!(b.state(), ProtocolState::Normal);
        (a, b)
    }

    #[test]
    fn s1_open_reaches_normal_with_expected_balances() {
        let (a, b) = open_channel_pair();
        let fee_msat = 1000 * crate::state::expected_fee(5000, 0);
        let a_balance = a.peer.buffers.as_ref().unwrap().local.staging_cstate().balance(Side::Ours);
        assert_eq!(a_balance, 1_000_000_000 - fee_msat);
        assert_eq!(b.peer.buffers.as_ref().unwrap().local.staging_cstate().balance(Side::Ours), 0);
    }

    #[test]
    fn s2_single_htlc_round_trip() {
        let (mut a, mut b) = open_channel_pair();

        let preimage = [3u8; 32];
        let rhash = sha256::Hash::hash(&preimage).into_inner();
        let id = a.add_htlc(100_000_000, Expiry::Seconds(500_000), rhash, vec![]).unwrap();
        let add_pkt = match a.pop_outbound().unwrap() {
            Pkt::UpdateAddHtlc(p) => p,
            _ => panic!(),
        };
        b.accept_pkt_htlc_add(add_pkt).unwrap();

        a.trigger_commit().unwrap();
        let commit_pkt = match a.pop_outbound().unwrap() {
            Pkt::UpdateCommit(p) => p,
            _ => panic!(),
        };
        b.accept_pkt_commit(commit_pkt).unwrap();
        let revoke_pkt = match b.pop_outbound().unwrap() {
            Pkt::UpdateRevocation(p) => p,
            _ => panic!(),
        };
        a.accept_pkt_revocation(revoke_pkt).unwrap();

        b.trigger_commit().unwrap();
        let commit_pkt2 = match b.pop_outbound().unwrap() {
            Pkt::UpdateCommit(p) => p,
            _ => panic!(),
        };
        a.accept_pkt_commit(commit_pkt2).unwrap();
        let revoke_pkt2 = match a.pop_outbound().unwrap() {
            Pkt::UpdateRevocation(p) => p,
            _ => panic!(),
        };
        b.accept_pkt_revocation(revoke_pkt2).unwrap();

        assert_eq!(a.peer.buffers.as_ref().unwrap().local.commit().unwrap().state().htlc(Side::Ours, id).unwrap().amount_msat(), 100_000_000);
        assert_eq!(b.peer.buffers.as_ref().unwrap().local.commit().unwrap().state().htlc(Side::Theirs, id).unwrap().amount_msat(), 100_000_000);

        b.fulfill_htlc(id, preimage).unwrap();
        let fulfill_pkt = match b.pop_outbound().unwrap() {
            Pkt::UpdateFulfillHtlc(p) => p,
            _ => panic!(),
        };
        a.accept_pkt_htlc_fulfill(fulfill_pkt).unwrap();

        b.trigger_commit().unwrap();
        let c3 = match b.pop_outbound().unwrap() {
            Pkt::UpdateCommit(p) => p,
            _ => panic!(),
        };
        a.accept_pkt_commit(c3).unwrap();
        let r3 = match a.pop_outbound().unwrap() {
            Pkt::UpdateRevocation(p) => p,
            _ => panic!(),
        };
        b.accept_pkt_revocation(r3).unwrap();

        a.trigger_commit().unwrap();
        let c4 = match a.pop_outbound().unwrap() {
            Pkt::UpdateCommit(p) => p,
            _ => panic!(),
        };
        b.accept_pkt_commit(c4).unwrap();
        let r4 = match b.pop_outbound().unwrap() {
            Pkt::UpdateRevocation(p) => p,
            _ => panic!(),
        };
        a.accept_pkt_revocation(r4).unwrap();

        assert_eq!(b.peer.buffers.as_ref().unwrap().local.commit().unwrap().state().balance(Side::Ours), 100_000_000);
        assert!(a.peer.buffers.as_ref().unwrap().local.commit().unwrap().state().htlc(Side::Ours, id).is_none());
    }

    #[test]
    fn s3_bad_preimage_breaks_down_the_channel() {
        let (mut a, mut b) = open_channel_pair();
        let rhash = sha256::Hash::hash(&[3u8; 32]).into_inner();
        a.add_htlc(1_000_000, Expiry::Seconds(500_000), rhash, vec![]).unwrap();
        let add_pkt = match a.pop_outbound().unwrap() {
            Pkt::UpdateAddHtlc(p) => p,
            _ => panic!(),
        };
        b.accept_pkt_htlc_add(add_pkt).unwrap();
        a.trigger_commit().unwrap();
        let commit_pkt = match a.pop_outbound().unwrap() {
            Pkt::UpdateCommit(p) => p,
            _ => panic!(),
        };
        b.accept_pkt_commit(commit_pkt).unwrap();
        let mut revoke_pkt = match b.pop_outbound().unwrap() {
            Pkt::UpdateRevocation(p) => p,
            _ => panic!(),
        };
        revoke_pkt.preimage[0] ^= 0x01;

        let err = a.accept_pkt_revocation(revoke_pkt).unwrap_err();
        assert_eq!(err, ProtocolError::BadPreimage);
        assert_eq!(a.state(), ProtocolState::ErrBreakdown);
        assert!(matches!(a.pop_outbound(), Some(Pkt::Error(_))));
    }

    #[test]
    fn s4_duplicate_id_rejected_before_touching_the_wire() {
        let (mut a, _b) = open_channel_pair();
        let rhash = sha256::Hash::hash(&[1u8; 32]).into_inner();
        a.add_htlc(1000, Expiry::Seconds(1), rhash, vec![]).unwrap();
        let _ = a.pop_outbound();

        // Same id can't be produced again by the local counter, so force
        // the collision path directly: a second add at the same id the
        // counter has already issued would be rejected with DuplicateId.
        let funder = a.peer.funder;
        let feerate = a.peer.feerate_per_kw;
        let htlc = ChannelHtlc::new(0, Side::Ours, 1000, rhash, Expiry::Seconds(1), vec![]);
        let err = a
            .peer
            .buffers
            .as_mut()
            .unwrap()
            .apply_local_origin(StagingChange::Add(htlc), funder, feerate)
            .unwrap_err();
        assert_eq!(err, CommandError::DuplicateId);
        assert_eq!(a.peer.outbound_len(), 0);
    }

    #[test]
    fn s5_cap_of_300_htlcs_enforced() {
        let (mut a, mut b) = open_channel_pair();
        for i in 0..300u64 {
            let rhash = sha256::Hash::hash(&i.to_le_bytes()).into_inner();
            let id = a.add_htlc(1, Expiry::Seconds(500_000), rhash, vec![]).unwrap();
            assert_eq!(id, i);
            let pkt = match a.pop_outbound().unwrap() {
                Pkt::UpdateAddHtlc(p) => p,
                _ => panic!(),
            };
            b.accept_pkt_htlc_add(pkt).unwrap();
        }
        let rhash = sha256::Hash::hash(&[0xffu8; 4]).into_inner();
        let err = a.add_htlc(1, Expiry::Seconds(500_000), rhash, vec![]).unwrap_err();
        assert_eq!(err, CommandError::TooManyHtlcs);
    }

    #[test]
    fn s6_mutual_close_converges_and_closes() {
        let (mut a, mut b) = open_channel_pair();
        a.begin_clearing().unwrap();
        let a_clearing = match a.pop_outbound().unwrap() {
            Pkt::CloseClearing(p) => p,
            _ => panic!(),
        };
        b.accept_pkt_close_clearing(a_clearing).unwrap();
        let b_clearing = match b.pop_outbound().unwrap() {
            Pkt::CloseClearing(p) => p,
            _ => panic!(),
        };
        a.accept_pkt_close_clearing(b_clearing).unwrap();

        assert_eq!(a.state(), ProtocolState::CloseWaitSig);
        assert_eq!(b.state(), ProtocolState::CloseWaitSig);

        let mut a_sig = match a.pop_outbound().unwrap() {
            Pkt::CloseSignature(p) => p,
            _ => panic!(),
        };
        let mut b_sig = match b.pop_outbound().unwrap() {
            Pkt::CloseSignature(p) => p,
            _ => panic!(),
        };

        for _ in 0..10 {
            if a.state() == ProtocolState::Closed && b.state() == ProtocolState::Closed {
                break;
            }
            if a.state() != ProtocolState::Closed {
                a.accept_pkt_close_signature(b_sig.clone()).unwrap();
            }
            if b.state() != ProtocolState::Closed {
                b.accept_pkt_close_signature(a_sig.clone()).unwrap();
            }
            if let Some(Pkt::CloseSignature(p)) = a.pop_outbound() {
                a_sig = p;
            }
            if let Some(Pkt::CloseSignature(p)) = b.pop_outbound() {
                b_sig = p;
            }
        }

        assert_eq!(a.state(), ProtocolState::Closed);
        assert_eq!(b.state(), ProtocolState::Closed);
    }

    /// Spec §4.7 / glossary "Clearing": new adds are forbidden once clearing
    /// begins, but an HTLC already outstanding must still drain via the
    /// normal commit/revoke cycle before the mutual close can proceed.
    #[test]
    fn clearing_drains_an_outstanding_htlc_before_closing() {
        let (mut a, mut b) = open_channel_pair();

        let preimage = [5u8; 32];
        let rhash = sha256::Hash::hash(&preimage).into_inner();
        let id = a.add_htlc(100_000_000, Expiry::Seconds(500_000), rhash, vec![]).unwrap();
        b.accept_pkt_htlc_add(match a.pop_outbound().unwrap() {
            Pkt::UpdateAddHtlc(p) => p,
            _ => panic!(),
        })
        .unwrap();

        a.trigger_commit().unwrap();
        b.accept_pkt_commit(match a.pop_outbound().unwrap() {
            Pkt::UpdateCommit(p) => p,
            _ => panic!(),
        })
        .unwrap();
        a.accept_pkt_revocation(match b.pop_outbound().unwrap() {
            Pkt::UpdateRevocation(p) => p,
            _ => panic!(),
        })
        .unwrap();

        b.trigger_commit().unwrap();
        a.accept_pkt_commit(match b.pop_outbound().unwrap() {
            Pkt::UpdateCommit(p) => p,
            _ => panic!(),
        })
        .unwrap();
        b.accept_pkt_revocation(match a.pop_outbound().unwrap() {
            Pkt::UpdateRevocation(p) => p,
            _ => panic!(),
        })
        .unwrap();

        // Both sides now carry the HTLC in their committed state. Begin
        // clearing with it still outstanding.
        a.begin_clearing().unwrap();
        b.accept_pkt_close_clearing(match a.pop_outbound().unwrap() {
            Pkt::CloseClearing(p) => p,
            _ => panic!(),
        })
        .unwrap();
        a.accept_pkt_close_clearing(match b.pop_outbound().unwrap() {
            Pkt::CloseClearing(p) => p,
            _ => panic!(),
        })
        .unwrap();

        assert_eq!(a.state(), ProtocolState::Clearing);
        assert_eq!(b.state(), ProtocolState::Clearing);
        // No CloseSignature yet: the HTLC hasn't drained.
        assert!(a.peer.outbound.is_empty());
        assert!(b.peer.outbound.is_empty());

        // A new add is still forbidden once clearing has begun.
        let err = a.add_htlc(1, Expiry::Seconds(500_000), [0u8; 32], vec![]).unwrap_err();
        assert_eq!(err, CommandError::WrongState(ProtocolState::Clearing));

        // The receiver fulfils the outstanding HTLC while CLEARING; this
        // must be accepted rather than rejected as WrongState/Unexpected.
        b.fulfill_htlc(id, preimage).unwrap();
        a.accept_pkt_htlc_fulfill(match b.pop_outbound().unwrap() {
            Pkt::UpdateFulfillHtlc(p) => p,
            _ => panic!(),
        })
        .unwrap();

        // Drive commit/revoke rounds (in whichever direction has something
        // queued) until both sides have drained the fulfillment out of
        // their committed state and clearing has advanced past it.
        for _ in 0..8 {
            if a.state() == ProtocolState::CloseWaitSig && b.state() == ProtocolState::CloseWaitSig {
                break;
            }
            if a.state() == ProtocolState::Clearing {
                a.trigger_commit().unwrap();
            }
            if b.state() == ProtocolState::Clearing {
                if let Some(Pkt::UpdateCommit(p)) = a.pop_outbound() {
                    b.accept_pkt_commit(p).unwrap();
                }
            }
            if a.state() == ProtocolState::Clearing {
                if let Some(Pkt::UpdateRevocation(p)) = b.pop_outbound() {
                    a.accept_pkt_revocation(p).unwrap();
                }
            }
            if b.state() == ProtocolState::Clearing {
                b.trigger_commit().unwrap();
            }
            if a.state() == ProtocolState::Clearing {
                if let Some(Pkt::UpdateCommit(p)) = b.pop_outbound() {
                    a.accept_pkt_commit(p).unwrap();
                }
            }
            if b.state() == ProtocolState::Clearing {
                if let Some(Pkt::UpdateRevocation(p)) = a.pop_outbound() {
                    b.accept_pkt_revocation(p).unwrap();
                }
            }
        }

        assert!(a.peer.buffers.as_ref().unwrap().local.commit().unwrap().state().htlc(Side::Ours, id).is_none());
        assert_eq!(a.state(), ProtocolState::CloseWaitSig);
        assert_eq!(b.state(), ProtocolState::CloseWaitSig);

        let mut a_sig = match a.pop_outbound().unwrap() {
            Pkt::CloseSignature(p) => p,
            _ => panic!(),
        };
        let mut b_sig = match b.pop_outbound().unwrap() {
            Pkt::CloseSignature(p) => p,
            _ => panic!(),
        };
        for _ in 0..10 {
            if a.state() == ProtocolState::Closed && b.state() == ProtocolState::Closed {
                break;
            }
            if a.state() != ProtocolState::Closed {
                a.accept_pkt_close_signature(b_sig.clone()).unwrap();
            }
            if b.state() != ProtocolState::Closed {
                b.accept_pkt_close_signature(a_sig.clone()).unwrap();
            }
            if let Some(Pkt::CloseSignature(p)) = a.pop_outbound() {
                a_sig = p;
            }
            if let Some(Pkt::CloseSignature(p)) = b.pop_outbound() {
                b_sig = p;
            }
        }
        assert_eq!(a.state(), ProtocolState::Closed);
        assert_eq!(b.state(), ProtocolState::Closed);
    }
}
