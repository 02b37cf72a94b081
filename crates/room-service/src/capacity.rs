//! Tiered room capacity accounting.
//!
//! Total room capacity is split between the `free` and `supporter` pools by
//! configured percentages. Whatever the two pools do not claim is an
//! uncommitted reserve. Everything here is plain arithmetic; the registry
//! actor is the only caller that mutates counters.

use crate::config::CapacityConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Service level of a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Supporter,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Free, Tier::Supporter];

    /// Returns the string representation of the tier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Supporter => "supporter",
        }
    }

    /// Stable reason code reported when this tier's pool is exhausted.
    pub fn pool_full_reason(&self) -> &'static str {
        match self {
            Tier::Free => "free_pool_full",
            Tier::Supporter => "supporter_pool_full",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "supporter" => Ok(Tier::Supporter),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Point-in-time view of one tier's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub active: u32,
    pub max: u32,
    pub available: u32,
}

/// Result of an admission preflight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionCheck {
    pub allowed: bool,
    pub pool: PoolStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalStatus {
    pub active: u32,
    pub capacity: u32,
    pub utilization_percent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationStatus {
    pub free_percent: u32,
    pub supporter_percent: u32,
    pub reserve_percent: u32,
}

/// Public capacity report. Every field is safe to disclose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacityStatus {
    pub free: PoolStatus,
    pub supporter: PoolStatus,
    pub total: TotalStatus,
    pub allocation: AllocationStatus,
}

#[derive(Debug, Clone, Copy)]
struct Pool {
    active: u32,
    max: u32,
}

impl Pool {
    fn status(&self) -> PoolStatus {
        PoolStatus {
            active: self.active,
            max: self.max,
            available: self.max.saturating_sub(self.active),
        }
    }
}

/// Per-tier room slot counters.
#[derive(Debug, Clone)]
pub struct CapacityPool {
    free: Pool,
    supporter: Pool,
    free_percent: u32,
    supporter_percent: u32,
}

impl CapacityPool {
    /// Build pools from the configured total and percentage split.
    ///
    /// Each pool's maximum is `floor(total * percent / 100)`.
    pub fn new(config: CapacityConfig) -> Self {
        let share = |percent: u32| {
            let max = u64::from(config.total_max_rooms) * u64::from(percent) / 100;
            u32::try_from(max).unwrap_or(u32::MAX)
        };

        Self {
            free: Pool {
                active: 0,
                max: share(config.free_percent),
            },
            supporter: Pool {
                active: 0,
                max: share(config.supporter_percent),
            },
            free_percent: config.free_percent,
            supporter_percent: config.supporter_percent,
        }
    }

    fn pool(&self, tier: Tier) -> &Pool {
        match tier {
            Tier::Free => &self.free,
            Tier::Supporter => &self.supporter,
        }
    }

    fn pool_mut(&mut self, tier: Tier) -> &mut Pool {
        match tier {
            Tier::Free => &mut self.free,
            Tier::Supporter => &mut self.supporter,
        }
    }

    /// Whether a new room of `tier` fits. Pure read.
    pub fn can_admit(&self, tier: Tier) -> AdmissionCheck {
        let pool = self.pool(tier);
        AdmissionCheck {
            allowed: pool.active < pool.max,
            pool: pool.status(),
        }
    }

    /// Take one slot from `tier`'s pool.
    ///
    /// Returns the pool status as the error when the pool is already full,
    /// so `active <= max` holds unconditionally.
    pub fn admit(&mut self, tier: Tier) -> Result<PoolStatus, PoolStatus> {
        let pool = self.pool_mut(tier);
        if pool.active >= pool.max {
            return Err(pool.status());
        }
        pool.active += 1;
        Ok(pool.status())
    }

    /// Return one slot to `tier`'s pool. Floors at zero.
    pub fn release(&mut self, tier: Tier) -> PoolStatus {
        let pool = self.pool_mut(tier);
        pool.active = pool.active.saturating_sub(1);
        pool.status()
    }

    /// Active room count for a tier.
    pub fn active(&self, tier: Tier) -> u32 {
        self.pool(tier).active
    }

    /// Full public report across both pools.
    pub fn status(&self) -> CapacityStatus {
        let active = self.free.active + self.supporter.active;
        let capacity = self.free.max + self.supporter.max;
        let utilization_percent = if capacity == 0 {
            0
        } else {
            // Rounded to the nearest whole percent.
            let scaled = (u64::from(active) * 200 + u64::from(capacity)) / (2 * u64::from(capacity));
            u32::try_from(scaled).unwrap_or(u32::MAX)
        };

        CapacityStatus {
            free: self.free.status(),
            supporter: self.supporter.status(),
            total: TotalStatus {
                active,
                capacity,
                utilization_percent,
            },
            allocation: AllocationStatus {
                free_percent: self.free_percent,
                supporter_percent: self.supporter_percent,
                reserve_percent: 100u32
                    .saturating_sub(self.free_percent)
                    .saturating_sub(self.supporter_percent),
            },
        }
    }
}
