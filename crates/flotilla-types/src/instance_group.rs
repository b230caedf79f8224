//! Instance groups and their autoscale rules.

use serde::{Deserialize, Serialize};

use crate::error::InvalidInput;

/// An elastically sized group of agents, with the rule governing its
/// scale-up and scale-down behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub id: String,
    pub min: u32,
    pub max: u32,
    pub min_idle_to_keep: u32,
    pub max_idle_to_keep: u32,
    pub cool_down_sec: u32,
    pub priority: u32,
    pub shortfall_adjusting_factor: u32,
}

impl InstanceGroup {
    /// Validating constructor. Enforces `min <= max`,
    /// `min_idle_to_keep <= max_idle_to_keep`, and
    /// `shortfall_adjusting_factor >= 1`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        min: u32,
        max: u32,
        min_idle_to_keep: u32,
        max_idle_to_keep: u32,
        cool_down_sec: u32,
        priority: u32,
        shortfall_adjusting_factor: u32,
    ) -> Result<Self, InvalidInput> {
        if min > max {
            return Err(InvalidInput::new(
                "min",
                format!("min ({min}) must be <= max ({max})"),
            ));
        }
        if min_idle_to_keep > max_idle_to_keep {
            return Err(InvalidInput::new(
                "min_idle_to_keep",
                format!(
                    "min_idle_to_keep ({min_idle_to_keep}) must be <= max_idle_to_keep ({max_idle_to_keep})"
                ),
            ));
        }
        if shortfall_adjusting_factor < 1 {
            return Err(InvalidInput::new(
                "shortfall_adjusting_factor",
                format!("must be >= 1, got {shortfall_adjusting_factor}"),
            ));
        }
        Ok(Self {
            id: id.into(),
            min,
            max,
            min_idle_to_keep,
            max_idle_to_keep,
            cool_down_sec,
            priority,
            shortfall_adjusting_factor,
        })
    }

    /// The size below which scale-down never goes.
    pub fn scale_down_floor(&self) -> u32 {
        self.min.max(self.min_idle_to_keep)
    }
}
