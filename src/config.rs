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

//! Engine configuration and the explicit, non-singleton conduit through which
//! the host hands the engine its thresholds and capabilities. No file format
//! is parsed here; the host constructs `EngineConfig` programmatically.

use std::time::Duration;

use crate::capabilities::Capabilities;

/// Field-level thresholds referenced in the wire-protocol contracts (spec
/// §6.1) plus the commit-timer duration (spec §4.6).
#[derive(Getters, Clone, PartialEq, Eq, Debug)]
pub struct EngineConfig {
    /// Minimum `feerate_per_kw` an `OpenChannel` may propose.
    #[getter(as_copy)]
    commitment_fee_rate_min: u32,

    /// Maximum `minimum_depth` an `OpenChannel`/`AcceptChannel` may request.
    #[getter(as_copy)]
    anchor_confirms_max: u32,

    /// Maximum `to_self_delay`, in seconds, either side may request.
    #[getter(as_copy)]
    rel_locktime_max: u32,

    /// Duration of the one-shot commit timer (spec §4.6: "typical ≈ 10ms-1s").
    #[getter(as_copy)]
    commit_timer: Duration,

    /// Per-HTLC floor below which an add is rejected outright.
    #[getter(as_copy)]
    htlc_minimum_msat: u64,

    /// Tolerance, in satoshis, within which a mutual-close fee proposal is
    /// accepted as converged (spec §4.7).
    #[getter(as_copy)]
    close_fee_tolerance_sat: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            commitment_fee_rate_min: 253,
            anchor_confirms_max: 144,
            rel_locktime_max: 2016,
            commit_timer: Duration::from_millis(50),
            htlc_minimum_msat: 1,
            close_fee_tolerance_sat: 0,
        }
    }
}

impl EngineConfig {
    /// Thresholds matching the conservative defaults `c-lightning` ships with.
    pub fn with_clightning_defaults() -> Self {
        EngineConfig {
            commitment_fee_rate_min: 253,
            anchor_confirms_max: 2016,
            rel_locktime_max: 2016,
            ..EngineConfig::default()
        }
    }

    /// Thresholds matching `lnd`'s defaults.
    pub fn with_lnd_defaults() -> Self {
        EngineConfig {
            commitment_fee_rate_min: 253,
            anchor_confirms_max: 10,
            rel_locktime_max: 2016,
            ..EngineConfig::default()
        }
    }

    /// Thresholds matching `eclair`'s defaults.
    pub fn with_eclair_defaults() -> Self {
        EngineConfig {
            commitment_fee_rate_min: 253,
            anchor_confirms_max: 144,
            rel_locktime_max: 2016,
            ..EngineConfig::default()
        }
    }
}

/// The explicit, per-peer context passed by reference to every engine
/// operation: configuration plus the host capabilities. No process-wide
/// singleton is used anywhere in this crate (spec §9's redesign note on
/// "Global mutable `dstate`").
pub struct HostContext<C: Capabilities> {
    pub config: EngineConfig,
    pub capabilities: C,
}

impl<C: Capabilities> HostContext<C> {
    pub fn new(config: EngineConfig, capabilities: C) -> Self {
        HostContext { config, capabilities }
    }
}
