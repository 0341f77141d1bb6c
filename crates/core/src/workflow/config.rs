//! Order workflow configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{RetryPolicy, StepName, WorkflowStep};

/// Settings of one step. Every step must succeed for an order to complete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSettings {
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

/// The `[workflow]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Budget for a single step attempt (seconds).
    /// An attempt that overruns counts as a retryable failure.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default)]
    pub init: StepSettings,

    #[serde(default)]
    pub address_select: StepSettings,

    #[serde(default)]
    pub cart_populate: StepSettings,

    #[serde(default)]
    pub checkout: StepSettings,
}

fn default_call_timeout() -> u64 {
    120
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            init: StepSettings::default(),
            address_select: StepSettings::default(),
            cart_populate: StepSettings::default(),
            checkout: StepSettings::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn settings(&self, step: StepName) -> &StepSettings {
        match step {
            StepName::Init => &self.init,
            StepName::AddressSelect => &self.address_select,
            StepName::CartPopulate => &self.cart_populate,
            StepName::Checkout => &self.checkout,
        }
    }

    /// Steps in execution order.
    pub fn steps(&self) -> Vec<WorkflowStep> {
        StepName::ALL
            .iter()
            .map(|&name| {
                let settings = self.settings(name);
                WorkflowStep {
                    name,
                    retry: settings.retry.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkflowConfig::default();
        assert_eq!(config.call_timeout_secs, 120);
        for step in config.steps() {
            assert_eq!(step.retry.max_attempts, 3);
            assert_eq!(step.retry.initial_delay_ms, 5000);
            assert_eq!(step.retry.max_delay_ms, 60_000);
        }
    }

    #[test]
    fn test_deserialize_partial_step() {
        let toml = r#"
            call_timeout_secs = 30

            [cart_populate]
            max_attempts = 5
            initial_delay_ms = 250

            [address_select]
            max_attempts = 1
        "#;
        let config: WorkflowConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.cart_populate.retry.max_attempts, 5);
        assert_eq!(config.cart_populate.retry.initial_delay_ms, 250);
        assert_eq!(config.cart_populate.retry.backoff_multiplier, 2.0);
        assert_eq!(config.address_select.retry.max_attempts, 1);
        assert_eq!(config.init.retry.max_attempts, 3);
    }

    #[test]
    fn test_steps_in_order() {
        let names: Vec<StepName> = WorkflowConfig::default()
            .steps()
            .iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, StepName::ALL.to_vec());
    }
}
