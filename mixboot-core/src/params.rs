//! Network and E2E parameters. Passed through to the network engine verbatim.

use serde::{Deserialize, Serialize};

use crate::partition::DEFAULT_MAX_PART_LEN;
use crate::wire::MAX_FRAME_LEN;

/// Room a link frame keeps for envelope, addressing and tags around one part.
const PART_FRAME_OVERHEAD: usize = 4096;
/// Largest `max_part_len` whose parts still fit in one link frame.
pub const MAX_PART_LEN: usize = MAX_FRAME_LEN as usize - PART_FRAME_OVERHEAD;

/// Timing and sizing for the network engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CmixParams {
    /// No round update for this long marks the network unhealthy.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    /// Delay before relinking after the gateway link drops.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// How often the follower re-checks health.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Largest E2E part placed in one round.
    #[serde(default = "default_max_part_len")]
    pub max_part_len: usize,
}

fn default_health_timeout_ms() -> u64 {
    10_000
}
fn default_reconnect_delay_ms() -> u64 {
    1_000
}
fn default_health_check_interval_ms() -> u64 {
    500
}
fn default_max_part_len() -> usize {
    DEFAULT_MAX_PART_LEN
}

impl Default for CmixParams {
    fn default() -> Self {
        Self {
            health_timeout_ms: default_health_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            max_part_len: default_max_part_len(),
        }
    }
}

impl CmixParams {
    /// Rejects values the link cannot carry. A `max_part_len` of 0 selects the default.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.max_part_len > MAX_PART_LEN {
            return Err(ParamsError::PartTooLarge {
                len: self.max_part_len,
                max: MAX_PART_LEN,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("max_part_len {len} does not fit in a link frame (max {max})")]
    PartTooLarge { len: usize, max: usize },
}

/// Parameters for E2E sends on direct channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct E2eParams {
    #[serde(default)]
    pub base: CmixParams,
}
