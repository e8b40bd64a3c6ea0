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

#![recursion_limit = "256"]
#![deny(unused_variables)]
#![deny(unused_mut)]
#![deny(unused_imports)]
#![deny(dead_code)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate amplify_derive;

pub mod capabilities;
pub mod commit;
pub mod config;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod htlc;
pub mod packet;
pub mod revocation;
pub mod staging;
pub mod state;

pub use capabilities::{CapabilityError, Capabilities, ChainMonitor, Clock, PacketTransport, Signer, TimerHandle, TxBuilder};
pub use commit::CommitInfo;
pub use config::{EngineConfig, HostContext};
pub use engine::{Accepted, AnchorMeta, ChannelEngine, ClosingState, PeerChannel};
pub use error::{CommandError, ProtocolError};
pub use fsm::ProtocolState;
pub use htlc::{ChannelHtlc, Expiry, Side};
pub use packet::{Pkt, PacketCodec};
pub use revocation::{generate_from_seed, RevocationLadder};
pub use staging::{SideView, StagingBuffers, StagingChange};
pub use state::ChannelState;
