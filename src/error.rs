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

//! Error taxonomy. `ProtocolError` is always terminal (emits an outbound
//! `Error` packet and drives the channel into `ERR_BREAKDOWN`); `CommandError`
//! is returned to the local application caller and never touches the wire.

use crate::fsm::ProtocolState;

/// Every kind a counterparty packet, or a protocol-integrity check, can fail
/// with. Each variant's doc comment is its stable wire problem string.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ProtocolError {
    /// malformed field: failed deserialization or range check
    MalformedField,

    /// unexpected packet for the current protocol state
    Unexpected,

    /// signature check on the new commitment failed
    BadSignature,

    /// revocation preimage does not hash to the expected value
    BadPreimage,

    /// revocation ladder rejected the new preimage
    ShachainBreak,

    /// affordability check failed
    InsufficientFunds,

    /// 300-HTLC-per-side cap reached
    TooManyHtlcs,

    /// HTLC id clash within the offering side
    DuplicateId,

    /// referenced HTLC is not present in the current commitment
    NotFound,

    /// commitment carries no new changes
    EmptyCommit,
}

/// Rejections of local application commands. Recoverable: the caller decides
/// what to do next, nothing is sent on the wire and the channel stays in its
/// current state.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum CommandError {
    /// affordability check failed
    InsufficientFunds,

    /// 300-HTLC-per-side cap reached
    TooManyHtlcs,

    /// HTLC id clash within the offering side
    DuplicateId,

    /// referenced HTLC is not present in the current commitment
    NotFound,

    /// revocation preimage does not match the stored hash
    BadPreimage,

    /// command is not permitted in protocol state {0}
    WrongState(ProtocolState),

    /// block-height expiry variants are not accepted by this engine
    BlockHeightExpiry,

    /// host capability call failed: {0}
    HostCapability(String),
}

impl From<crate::capabilities::CapabilityError> for CommandError {
    fn from(e: crate::capabilities::CapabilityError) -> Self {
        CommandError::HostCapability(e.to_string())
    }
}
