//! Error taxonomy for the fight engine and the Monte Carlo analysis.
//!
//! Precondition failures (GCD, cooldown, resource, combo) are not errors:
//! they are reported as [`crate::resolver::Blocked`] and handled by the
//! rotation executor.

use thiserror::Error;

use crate::arena::Millis;

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("unknown action `{0}`")]
    UnknownAction(String),

    #[error("unknown status `{0}`")]
    UnknownStatus(String),

    #[error("event scheduled at {at} ms but the clock is already at {now} ms")]
    SchedulingViolation { at: Millis, now: Millis },

    #[error("insufficient samples: {reason}")]
    SamplingInsufficiency { reason: String },

    #[error("failed to read config")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML config")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON config")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    pub fn config(message: impl Into<String>) -> Self {
        SimError::Configuration {
            message: message.into(),
        }
    }

    pub fn insufficient(reason: impl Into<String>) -> Self {
        SimError::SamplingInsufficiency {
            reason: reason.into(),
        }
    }
}
