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

//! The wire message union (spec §4.8, §6.1) and its length-delimited tagged
//! codec, built on `strict_encoding` — the teacher's own wire mechanism
//! throughout `channel/bolt/*.rs` and `lnp2p` — rather than a hand-rolled
//! byte-pusher. Field shapes are trimmed of the Sphinx/TLV/feature-bit
//! machinery that belongs to the routing/gossip layer this crate excludes;
//! see `DESIGN.md`.

use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use strict_encoding::{strict_deserialize, strict_serialize, StrictDecode, StrictEncode};

use crate::error::ProtocolError;
use crate::htlc::Expiry;

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct OpenChannel {
    pub anchor_satoshis: u64,
    pub push_msat: u64,
    pub initial_fee_rate: u32,
    pub min_depth: u32,
    pub to_self_delay: u32,
    pub commit_key: PublicKey,
    pub final_key: PublicKey,
    pub first_revocation_hash: [u8; 32],
    /// Exactly one side may set this (spec §6.1: "Exactly one side may
    /// announce `WILL_CREATE_ANCHOR`").
    pub will_create_anchor: bool,
}

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct OpenAnchor {
    pub txid: [u8; 32],
    pub vout: u32,
    pub value_sat: u64,
}

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct OpenCommitSig {
    pub signature: Signature,
}

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct OpenComplete {
    pub next_revocation_hash: [u8; 32],
}

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct UpdateAddHtlc {
    pub id: u64,
    pub amount_msat: u64,
    pub rhash: [u8; 32],
    pub expiry: Expiry,
    pub route: Vec<u8>,
}

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct UpdateFulfillHtlc {
    pub id: u64,
    pub preimage: [u8; 32],
}

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct UpdateFailHtlc {
    pub id: u64,
    /// Opaque, uninterpreted by this engine (spec §9 Open Questions: the
    /// source elides any reason-payload interpretation).
    pub reason: Vec<u8>,
}

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct UpdateCommit {
    pub signature: Signature,
}

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct UpdateRevocation {
    pub preimage: [u8; 32],
    pub next_revocation_hash: [u8; 32],
}

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct CloseClearing {
    pub script: Vec<u8>,
}

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct CloseSignature {
    pub fee_satoshis: u64,
    pub signature: Signature,
}

#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct ErrorPkt {
    pub problem: String,
}

/// The tagged union of every message this engine sends or receives (spec
/// §4.8).
#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub enum Pkt {
    Open(OpenChannel),
    OpenAnchor(OpenAnchor),
    OpenCommitSig(OpenCommitSig),
    OpenComplete(OpenComplete),
    UpdateAddHtlc(UpdateAddHtlc),
    UpdateFulfillHtlc(UpdateFulfillHtlc),
    UpdateFailHtlc(UpdateFailHtlc),
    UpdateCommit(UpdateCommit),
    UpdateRevocation(UpdateRevocation),
    CloseClearing(CloseClearing),
    CloseSignature(CloseSignature),
    Error(ErrorPkt),
}

impl Pkt {
    pub fn error(problem: impl Into<String>) -> Pkt {
        Pkt::Error(ErrorPkt { problem: problem.into() })
    }
}

/// Structural (de)serialization only — the field-level semantic contracts of
/// spec §6.1 (monotonic ids, positive amounts, the 300-HTLC cap, ...) are
/// checked by `ChannelEngine` at the point each field is consumed, not here.
pub struct PacketCodec;

impl PacketCodec {
    /// Encodes `pkt`. In debug builds the result is immediately decoded and
    /// compared back against `pkt`, per spec §4.8's last sentence.
    pub fn encode(pkt: &Pkt) -> Result<Vec<u8>, ProtocolError> {
        let bytes = strict_serialize(pkt).map_err(|_| ProtocolError::MalformedField)?;
        #[cfg(debug_assertions)]
        {
            let roundtrip: Pkt = strict_deserialize(&bytes).expect("freshly encoded packet must decode");
            debug_assert_eq!(&roundtrip, pkt, "packet round-trip mismatch");
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Pkt, ProtocolError> {
        strict_deserialize(bytes).map_err(|_| ProtocolError::MalformedField)
    }
}
