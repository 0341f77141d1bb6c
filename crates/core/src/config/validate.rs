use super::{types::Config, ConfigError};
use crate::workflow::StepName;

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Default concurrency lies within `1..=max_concurrency`
/// - Task ceiling, timeouts and event buffers are non-zero
/// - Every step allows at least one attempt and never shrinks its backoff
/// - Checkpoint URL is set when the section is present
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Server validation
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    // Engine validation
    let engine = &config.engine;
    if engine.max_concurrency == 0 {
        return Err(ConfigError::ValidationError(
            "engine.max_concurrency must be at least 1".to_string(),
        ));
    }
    if engine.default_concurrency == 0 || engine.default_concurrency > engine.max_concurrency {
        return Err(ConfigError::ValidationError(format!(
            "engine.default_concurrency must be between 1 and {}",
            engine.max_concurrency
        )));
    }
    if engine.max_tasks_per_batch == 0 {
        return Err(ConfigError::ValidationError(
            "engine.max_tasks_per_batch must be at least 1".to_string(),
        ));
    }
    if engine.task_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "engine.task_timeout_secs must be at least 1".to_string(),
        ));
    }
    if engine.event_buffer == 0 || engine.subscriber_buffer == 0 {
        return Err(ConfigError::ValidationError(
            "engine.event_buffer and engine.subscriber_buffer must be at least 1".to_string(),
        ));
    }

    // Workflow validation
    if config.workflow.call_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "workflow.call_timeout_secs must be at least 1".to_string(),
        ));
    }
    for step in StepName::ALL {
        let retry = &config.workflow.settings(step).retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(format!(
                "workflow.{}.max_attempts must be at least 1",
                step
            )));
        }
        if retry.backoff_multiplier.is_nan() || retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "workflow.{}.backoff_multiplier must be at least 1.0",
                step
            )));
        }
    }

    // Checkpoint validation
    if let Some(checkpoint) = &config.checkpoint {
        if checkpoint.account_api_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "checkpoint.account_api_url cannot be empty".to_string(),
            ));
        }
    }

    if let Some(order) = &config.order {
        match reqwest::Url::parse(&order.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "order.base_url must be an http(s) URL, got '{}'",
                    order.base_url
                )))
            }
        }
        if order.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "order.request_timeout_secs must be greater than 0".to_string(),
            ));
        }
    }

    Ok(())
}
