//! Analysis settings bundled for loading from JSON.

use crate::continuation::ContinuationSettings;
use crate::equilibrium::NewtonSettings;
use crate::error::{DynamicsError, Result};
use crate::integrator::IntegratorOptions;
use crate::periodic::ShootingSettings;
use serde::{Deserialize, Serialize};

/// Every tunable of the numerical core. Omitted JSON fields take their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub newton: NewtonSettings,
    pub integrator: IntegratorOptions,
    pub continuation: ContinuationSettings,
    pub shooting: ShootingSettings,
}

impl AnalysisConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| DynamicsError::InvalidInput(format!("invalid analysis config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| DynamicsError::InvalidInput(format!("failed to serialize config: {err}")))
    }

    pub fn validate(&self) -> Result<()> {
        self.newton.validate()?;
        self.integrator.validate()?;
        self.continuation.validate()?;
        self.shooting.validate()
    }
}
