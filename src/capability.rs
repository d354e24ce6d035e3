//! Read-only description of what timer pools may be configured with.
//!
//! `TimerEngine::create_pool` validates every descriptor against the engine's
//! `Capabilities`; anything outside them fails with `CapabilityViolation`.

use std::cmp;

/// Nanoseconds in one second.
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

const DEFAULT_MAX_POOLS:          usize = 32;
const DEFAULT_MAX_TIMERS:         usize = 1 << 16;
const DEFAULT_HIGHEST_RES_NS:     u64   = 1_000;
const DEFAULT_LOWEST_RES_NS:      u64   = NSEC_PER_SEC;
const DEFAULT_MAX_TMO_NS:         u64   = 365 * 24 * 3600 * NSEC_PER_SEC;
const DEFAULT_MIN_BASE_FREQ_HZ:   u64   = 1;
const DEFAULT_MAX_BASE_FREQ_HZ:   u64   = 100_000;
const DEFAULT_MAX_MULTIPLIER:     u64   = 1_000;

/// Source that a timer pool derives its ticks from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClockSource {
    /// Ticks follow `std::time::Instant` since the pool was started.
    Monotonic,
    /// Ticks only move when a `PoolTicker` advances them.
    Manual
}

/// Tick resolution of a timer pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Length of one tick in nanoseconds.
    Nanos(u64),
    /// Number of ticks per second.
    Hertz(u64)
}

impl Resolution {
    /// Length of one tick in nanoseconds, `None` for a zero or sub-nanosecond tick.
    pub fn as_nanos(&self) -> Option<u64> {
        match *self {
            Resolution::Nanos(0)  => None,
            Resolution::Nanos(ns) => Some(ns),
            Resolution::Hertz(hz) => NSEC_PER_SEC.checked_div(hz).filter(|&ns| ns > 0)
        }
    }
}

/// Timeout bounds supported at one resolution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResolutionCapability {
    pub res_ns: u64,
    pub min_tmo_ns: u64,
    pub max_tmo_ns: u64
}

/// Periodic configuration the platform can honor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PeriodicCapability {
    pub base_freq_hz: u64,
    pub max_multiplier: u64,
    /// Finest resolution that keeps every multiplier at least one tick long.
    pub res_ns: u64,
    /// Whether the request was supported without adjustment.
    pub exact: bool
}

/// Limits timer pools are validated against.
#[derive(Clone, Debug)]
pub struct Capabilities {
    clock_sources: Vec<ClockSource>,
    max_pools: usize,
    max_timers: usize,
    highest_res_ns: u64,
    lowest_res_ns: u64,
    max_tmo_ns: u64,
    min_base_freq_hz: u64,
    max_base_freq_hz: u64,
    max_multiplier: u64
}

impl Capabilities {
    /// Sets the supported clock sources.
    pub fn with_clock_sources(mut self, clock_sources: &[ClockSource]) -> Capabilities {
        self.clock_sources = clock_sources.to_vec();
        self
    }

    /// Sets the maximum number of pools that may exist at once.
    pub fn with_max_pools(mut self, max_pools: usize) -> Capabilities {
        self.max_pools = max_pools;
        self
    }

    /// Sets the maximum number of timers in a single pool.
    pub fn with_max_timers(mut self, max_timers: usize) -> Capabilities {
        self.max_timers = max_timers;
        self
    }

    /// Sets the range of tick lengths in nanoseconds, finest first.
    pub fn with_resolution_range(mut self, highest_res_ns: u64, lowest_res_ns: u64) -> Capabilities {
        self.highest_res_ns = highest_res_ns;
        self.lowest_res_ns = lowest_res_ns;
        self
    }

    /// Sets the longest supported timeout in nanoseconds.
    pub fn with_max_timeout_ns(mut self, max_tmo_ns: u64) -> Capabilities {
        self.max_tmo_ns = max_tmo_ns;
        self
    }

    /// Sets the periodic base frequency range and the largest multiplier.
    pub fn with_periodic(mut self, min_base_freq_hz: u64, max_base_freq_hz: u64, max_multiplier: u64) -> Capabilities {
        self.min_base_freq_hz = min_base_freq_hz;
        self.max_base_freq_hz = max_base_freq_hz;
        self.max_multiplier = max_multiplier;
        self
    }

    /// Whether pools can be driven by the given clock source.
    pub fn supports_clock(&self, clock_source: ClockSource) -> bool {
        self.clock_sources.contains(&clock_source)
    }

    /// Supported clock sources.
    pub fn clock_sources(&self) -> &[ClockSource] {
        &self.clock_sources
    }

    /// Maximum number of pools that may exist at once.
    pub fn max_pools(&self) -> usize {
        self.max_pools
    }

    /// Maximum number of timers in a single pool.
    pub fn max_timers(&self) -> usize {
        self.max_timers
    }

    /// Finest tick length in nanoseconds.
    pub fn highest_res_ns(&self) -> u64 {
        self.highest_res_ns
    }

    /// Coarsest tick length in nanoseconds.
    pub fn lowest_res_ns(&self) -> u64 {
        self.lowest_res_ns
    }

    /// Longest supported timeout in nanoseconds.
    pub fn max_tmo_ns(&self) -> u64 {
        self.max_tmo_ns
    }

    /// Lowest periodic base frequency.
    pub fn min_base_freq_hz(&self) -> u64 {
        self.min_base_freq_hz
    }

    /// Highest periodic base frequency.
    pub fn max_base_freq_hz(&self) -> u64 {
        self.max_base_freq_hz
    }

    /// Largest periodic multiplier.
    pub fn max_multiplier(&self) -> u64 {
        self.max_multiplier
    }

    /// Timeout bounds for a pool running at `res_ns`, `None` if the resolution is unsupported.
    pub fn resolution_capability(&self, res_ns: u64) -> Option<ResolutionCapability> {
        if res_ns < self.highest_res_ns || res_ns > self.lowest_res_ns {
            return None
        }

        Some(ResolutionCapability{ res_ns: res_ns, min_tmo_ns: 0, max_tmo_ns: self.max_tmo_ns })
    }

    /// Closest periodic configuration to the one requested.
    ///
    /// Returns `None` if the base frequency is outside the supported range.
    pub fn periodic_capability(&self, base_freq_hz: u64, max_multiplier: u64) -> Option<PeriodicCapability> {
        if base_freq_hz < self.min_base_freq_hz || base_freq_hz > self.max_base_freq_hz {
            return None
        }

        // Largest multiplier whose period is still a whole tick at the finest resolution
        let reachable = base_freq_hz.checked_mul(self.highest_res_ns)
            .and_then(|denominator| NSEC_PER_SEC.checked_div(denominator))?;
        let supported = cmp::min(cmp::min(max_multiplier, self.max_multiplier), reachable);
        if supported == 0 {
            return None
        }

        let res_ns = cmp::max(self.highest_res_ns, NSEC_PER_SEC / (base_freq_hz * supported));

        Some(PeriodicCapability{ base_freq_hz: base_freq_hz, max_multiplier: supported,
            res_ns: cmp::min(res_ns, self.lowest_res_ns), exact: supported == max_multiplier })
    }
}

impl Default for Capabilities {
    fn default() -> Capabilities {
        Capabilities{ clock_sources: vec![ClockSource::Monotonic, ClockSource::Manual],
            max_pools: DEFAULT_MAX_POOLS, max_timers: DEFAULT_MAX_TIMERS,
            highest_res_ns: DEFAULT_HIGHEST_RES_NS, lowest_res_ns: DEFAULT_LOWEST_RES_NS,
            max_tmo_ns: DEFAULT_MAX_TMO_NS, min_base_freq_hz: DEFAULT_MIN_BASE_FREQ_HZ,
            max_base_freq_hz: DEFAULT_MAX_BASE_FREQ_HZ, max_multiplier: DEFAULT_MAX_MULTIPLIER }
    }
}
