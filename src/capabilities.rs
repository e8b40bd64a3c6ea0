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

//! Host capabilities consumed, never implemented, by this crate (spec §6.2).
//! Raw Bitcoin transaction construction, signing, network transport and wall
//! clocks are exactly what spec §1 excludes from the engine; these traits are
//! the narrow seam through which the host supplies them. Only test fakes
//! implement them inside this crate.

use std::collections::BTreeMap;
use std::time::Duration;

use bitcoin::{Address, Script, Transaction};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use crate::htlc::Side;
use crate::state::ChannelState;

/// Failure surfaced by a host capability implementation. The engine treats
/// any of these as terminal for the operation in progress; it does not retry
/// (spec §7: "There is no mid-flight retry").
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum CapabilityError {
    /// signing operation failed: {0}
    SigningFailed(String),

    /// transaction construction failed: {0}
    TxBuildFailed(String),

    /// the peer transport is gone
    PeerGone,

    /// transport send failed: {0}
    SendFailed(String),
}

/// Per-side key material and timelock parameters a commitment transaction is
/// built against.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CommitKeySet {
    pub local_commit_key: PublicKey,
    pub local_final_key: PublicKey,
    pub remote_commit_key: PublicKey,
    pub remote_final_key: PublicKey,
}

/// Relative and absolute locktime parameters agreed at open.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Locktimes {
    pub to_self_delay: u32,
    pub mindepth: u32,
}

/// Where, within the built commitment transaction, each logical output
/// landed. `TxBuilder` fills this in; the engine never inspects transaction
/// internals itself.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct CommitOutputMap {
    pub to_ours_vout: Option<u32>,
    pub to_theirs_vout: Option<u32>,
    pub htlc_vouts: BTreeMap<u64, u32>,
}

/// Produces and signs their rotating commitment preimages and our signatures
/// over the counterparty's commitment/close transactions. Shared across
/// peers (spec §5: "The RandomOracle and Signer are shared across peers").
/// `RandomOracle` is folded in here (see `DESIGN.md`'s Open Question 5):
/// nothing in this crate needs randomness beyond deterministic, per-index
/// revocation material.
pub trait Signer {
    /// Signs `tx` on our behalf, to be handed to the counterparty so they can
    /// hold our commitment transaction.
    fn sign_their_commit(&self, tx: &Transaction) -> Result<Signature, CapabilityError>;

    /// Signs a proposed mutual-close transaction.
    fn sign_mutual_close(&self, tx: &Transaction) -> Result<Signature, CapabilityError>;

    /// Deterministically derives the revocation preimage for `commit_num`.
    fn revocation_preimage(&self, commit_num: u64) -> Result<[u8; 32], CapabilityError>;

    /// Deterministically derives the revocation hash for `commit_num`
    /// (`sha256(revocation_preimage(commit_num))`, but the host may compute
    /// it without materializing the preimage).
    fn revocation_hash(&self, commit_num: u64) -> Result<[u8; 32], CapabilityError>;

    /// Verifies the counterparty's signature over one of our commitment
    /// transactions against the anchor's 2-of-2 witness script (spec §4.4
    /// "receiving UpdateCommit" step 2). The sighash/script plumbing this
    /// needs is exactly the raw-transaction machinery spec §1 excludes from
    /// the engine, so verification — not just signing — is a capability the
    /// host must provide; this completes the narrow seam spec §6.2 leaves
    /// implicit (see `DESIGN.md`).
    fn verify_their_commit_sig(&self, tx: &Transaction, sig: &Signature) -> Result<bool, CapabilityError>;
}

/// Builds the raw Bitcoin-style transactions this engine reasons about only
/// as opaque values (spec §1: "Construction and signing of raw Bitcoin-style
/// transactions ... out of scope").
pub trait TxBuilder {
    /// Builds one side's version of the commitment transaction for `cstate`.
    fn create_commit_tx(
        &self,
        fkeys: CommitKeySet,
        locktimes: Locktimes,
        anchor: AnchorPoint,
        revocation_hash: [u8; 32],
        cstate: &ChannelState,
        for_side: Side,
    ) -> Result<(Transaction, CommitOutputMap), CapabilityError>;

    /// Builds the mutual-close transaction paying `fee_sat` to the two
    /// agreed closing scripts.
    fn create_close_tx(&self, fee_sat: u64) -> Result<Transaction, CapabilityError>;

    /// The 2-of-2 witness script gating the anchor output.
    fn redeem_2of2(&self, key_a: PublicKey, key_b: PublicKey) -> Result<Script, CapabilityError>;

    /// The P2SH (or equivalent) address wrapping `script`.
    fn p2sh(&self, script: &Script) -> Result<Address, CapabilityError>;

    /// The output script a mutual close should pay `final_key` to (spec
    /// §4.7's `our_script = P2SH(redeem(finalkey))`). Kept a `TxBuilder`
    /// concern like the rest of scripting, rather than hand-rolled in the
    /// engine (spec §1 excludes "witness scripts" from the engine itself).
    fn closing_script(&self, final_key: PublicKey) -> Result<Script, CapabilityError>;
}

/// The funded anchor output this channel spends.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AnchorPoint {
    pub txid: [u8; 32],
    pub vout: u32,
    pub value_sat: u64,
}

/// Opaque wire envelope transport. Encryption, framing and key exchange are
/// the host's concern (spec §1); this crate only ever sees already-decoded
/// `Pkt` values or raw bytes it hands to [`crate::packet::PacketCodec`].
pub trait PacketTransport {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), CapabilityError>;

    /// `Ok(None)` means no packet is currently available (non-blocking
    /// poll); `Err` means the peer is gone.
    fn recv(&mut self) -> Result<Option<Vec<u8>>, CapabilityError>;
}

/// A handle to a scheduled, cancellable one-shot timer (spec §4.6).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TimerHandle(pub u64);

/// Wall-clock and one-shot timer facility. Shared across peers (spec §5).
pub trait Clock {
    fn now(&self) -> Duration;

    /// Schedules `callback` to run after `duration`; the `u64` is an opaque
    /// engine-chosen correlation tag the host echoes back when the timer
    /// fires (the engine does not hold a live closure across a suspension
    /// point, per spec §5).
    fn after(&mut self, duration: Duration, tag: u64) -> TimerHandle;

    fn cancel(&mut self, handle: TimerHandle);
}

/// Chain-confirmation events the engine consumes but never produces
/// on-chain activity for (spec §6.2: "not part of the core").
pub trait ChainMonitor {
    fn anchor_confirmed(&self) -> bool;

    fn commit_published(&self) -> Option<Transaction>;
}

/// Bundles the five capability traits the engine is generic over, mirroring
/// the teacher's pattern of parameterizing channel logic by a single marker
/// type (`Channel<N: Nomenclature>`) rather than threading five separate
/// generics through every signature.
pub trait Capabilities {
    type Signer: Signer;
    type TxBuilder: TxBuilder;
    type Transport: PacketTransport;
    type Clock: Clock;
    type ChainMonitor: ChainMonitor;

    fn signer(&self) -> &Self::Signer;
    fn tx_builder(&self) -> &Self::TxBuilder;
    fn transport(&mut self) -> &mut Self::Transport;
    fn clock(&mut self) -> &mut Self::Clock;
    fn chain_monitor(&self) -> &Self::ChainMonitor;
}
