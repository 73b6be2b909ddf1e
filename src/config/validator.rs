// Config validation
// Invalid tuning is rejected at startup with actionable errors before any
// shared segment is mapped.

use crate::config::config::StateManagerConfig;
use crate::config::types::{Result, StateManagerError};
use crate::core::shared::MAX_PROCESSES;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate config at startup, failing on the first batch of errors
pub fn validate_config(config: &StateManagerConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::default();

    validate_intervals(config, &mut result);
    validate_process_slots(config, &mut result);

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(StateManagerError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_intervals(config: &StateManagerConfig, result: &mut ValidationResult) {
    if config.poll_interval_ms == 0 {
        result.add_error("poll_interval_ms cannot be zero (suspended workers would spin)".to_string());
    } else if config.poll_interval_ms > 10_000 {
        result.add_warning(format!(
            "poll_interval_ms {} is above 10s, convergence latency will suffer",
            config.poll_interval_ms
        ));
    }

    if config.timer_interval_ms == 0 {
        result.add_error("timer_interval_ms cannot be zero".to_string());
    }

    if let Some(timeout) = config.timeout() {
        if timeout < config.timer_interval() {
            result.add_warning(format!(
                "timeout ({:?}) is shorter than the timer interval ({:?})",
                timeout,
                config.timer_interval()
            ));
        }
    }
}

fn validate_process_slots(config: &StateManagerConfig, result: &mut ValidationResult) {
    if config.max_processes == 0 {
        result.add_error("max_processes cannot be zero".to_string());
    }
    if config.max_processes > MAX_PROCESSES {
        result.add_error(format!(
            "max_processes ({}) exceeds the compiled slot count ({})",
            config.max_processes, MAX_PROCESSES
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate_config(&StateManagerConfig::default()).unwrap();
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = StateManagerConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_too_many_processes_rejected() {
        let config = StateManagerConfig {
            max_processes: MAX_PROCESSES + 1,
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("max_processes"));
    }

    #[test]
    fn test_short_timeout_only_warns() {
        let config = StateManagerConfig {
            timeout_secs: 1,
            timer_interval_ms: 5000,
            ..Default::default()
        };
        let result = validate_config(&config).unwrap();
        assert_eq!(result.warnings.len(), 1);
    }
}
