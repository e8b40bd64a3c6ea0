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

//! Conditional-payment primitives: which side of the channel owns what, and
//! the HTLC value type itself.

use strict_encoding::{StrictDecode, StrictEncode};

/// Maximum number of HTLCs either side may have offered in a single snapshot
/// (spec §3, §8 property 8).
pub const MAX_HTLCS_PER_SIDE: usize = 300;

/// Which of the two channel parties a value belongs to.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum Side {
    /// us
    #[display("ours")]
    Ours = 0,

    /// the counterparty
    #[display("theirs")]
    Theirs = 1,
}

impl Side {
    /// Flips the side.
    #[inline]
    pub fn other(self) -> Side {
        match self {
            Side::Ours => Side::Theirs,
            Side::Theirs => Side::Ours,
        }
    }

    #[inline]
    pub fn as_index(self) -> usize {
        self as usize
    }
}

/// An HTLC's timelock. Only the `Seconds` variant is accepted by this engine
/// (spec §9 Open Questions: block-height variants are rejected, not guessed
/// at).
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, StrictEncode, StrictDecode)]
pub enum Expiry {
    /// seconds-since-epoch expiry {0}
    Seconds(u32),

    /// block-height expiry {0}
    Blocks(u32),
}

impl Expiry {
    #[inline]
    pub fn is_seconds(self) -> bool {
        matches!(self, Expiry::Seconds(_))
    }
}

/// A conditional, hash-locked in-channel payment.
#[derive(Getters, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, StrictEncode, StrictDecode)]
pub struct ChannelHtlc {
    /// Unique within `offered_by`'s additions on this channel, monotonically
    /// chosen by the offering side.
    #[getter(as_copy)]
    id: u64,

    /// Which side offered this HTLC.
    #[getter(as_copy)]
    offered_by: Side,

    /// Value in milli-satoshi. Always positive.
    #[getter(as_copy)]
    amount_msat: u64,

    /// Hash of the redeeming preimage.
    #[getter(as_copy)]
    rhash: [u8; 32],

    /// Absolute timelock.
    #[getter(as_copy)]
    expiry: Expiry,

    /// Opaque onion/routing payload; this engine does not interpret it.
    #[getter(as_ref)]
    route: Vec<u8>,
}

impl ChannelHtlc {
    pub fn new(id: u64, offered_by: Side, amount_msat: u64, rhash: [u8; 32], expiry: Expiry, route: Vec<u8>) -> Self {
        ChannelHtlc {
            id,
            offered_by,
            amount_msat,
            rhash,
            expiry,
            route,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn side_other_is_involution() {
        assert_eq!(Side::Ours.other(), Side::Theirs);
        assert_eq!(Side::Theirs.other(), Side::Ours);
        assert_eq!(Side::Ours.other().other(), Side::Ours);
    }

    #[test]
    fn expiry_seconds_detection() {
        assert!(Expiry::Seconds(500_000).is_seconds());
        assert!(!Expiry::Blocks(700_000).is_seconds());
    }
}
