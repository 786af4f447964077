//! Drop breaker guarding listing retirement.
//!
//! Prevents a broken scrape from retiring a whole catalogue: when the number
//! of listings harvested from a site drops sharply compared to what the store
//! holds as active, retirement is skipped for that run.

use crate::models::HarvestConfig;

/// Drop breaker thresholds.
#[derive(Debug, Clone)]
pub struct DropBreakerConfig {
    /// Maximum allowed drop percentage (0-100). Default: 50%
    pub max_drop_percent: u8,
    /// Minimum active count for the check to apply.
    /// Below this threshold, retirement always proceeds.
    pub min_baseline: usize,
}

impl Default for DropBreakerConfig {
    fn default() -> Self {
        Self {
            max_drop_percent: 50,
            min_baseline: 10,
        }
    }
}

impl From<&HarvestConfig> for DropBreakerConfig {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            max_drop_percent: config.max_drop_percent,
            min_baseline: config.min_baseline,
        }
    }
}

/// Result of a drop breaker check.
#[derive(Debug, Clone, PartialEq)]
pub enum DropCheck {
    /// Safe to retire missing listings
    Safe {
        harvested: usize,
        active: usize,
    },
    /// Baseline too small to judge
    ColdStart { harvested: usize },
    /// Drop too large; keep everything active
    Triggered {
        harvested: usize,
        active: usize,
        drop_percent: f64,
    },
    /// Nothing harvested from a site with a real catalogue
    EmptyResult,
}

impl DropCheck {
    pub fn allows_retirement(&self) -> bool {
        matches!(self, DropCheck::Safe { .. } | DropCheck::ColdStart { .. })
    }
}

/// Drop breaker for retirement decisions.
#[derive(Debug, Clone, Default)]
pub struct DropBreaker {
    config: DropBreakerConfig,
}

impl DropBreaker {
    pub fn new(config: DropBreakerConfig) -> Self {
        Self { config }
    }

    /// Compare the distinct listings harvested now with the active count.
    pub fn check(&self, harvested: usize, active: usize) -> DropCheck {
        if active < self.config.min_baseline {
            return DropCheck::ColdStart { harvested };
        }
        if harvested == 0 {
            return DropCheck::EmptyResult;
        }

        if harvested < active {
            let drop_percent = ((active - harvested) as f64 / active as f64) * 100.0;
            if drop_percent > self.config.max_drop_percent as f64 {
                return DropCheck::Triggered {
                    harvested,
                    active,
                    drop_percent,
                };
            }
        }

        DropCheck::Safe { harvested, active }
    }

    /// Check and log the verdict. Returns whether retirement may proceed.
    pub fn permits(&self, site_id: &str, harvested: usize, active: usize) -> bool {
        let check = self.check(harvested, active);
        match &check {
            DropCheck::Safe { .. } | DropCheck::ColdStart { .. } => {
                log::debug!(
                    "{}: drop breaker {:?}",
                    site_id,
                    check
                );
            }
            DropCheck::Triggered { drop_percent, .. } => {
                log::warn!(
                    "{}: drop breaker TRIGGERED, {} → {} listings ({:.1}% drop > {}% threshold); retirement skipped",
                    site_id,
                    active,
                    harvested,
                    drop_percent,
                    self.config.max_drop_percent
                );
            }
            DropCheck::EmptyResult => {
                log::warn!("{}: drop breaker EMPTY RESULT; retirement skipped", site_id);
            }
        }
        check.allows_retirement()
    }
}
