use crate::error::{AppError, Result};
use crate::scheduler::RequestKind;

use super::{SchedulerConfig, UpstreamConfig};

/// Validate a scheduler configuration and surface every problem at once.
pub fn validate_config(config: &SchedulerConfig) -> Result<()> {
    let mut issues = Vec::new();

    validate_budget(config, &mut issues);
    validate_timers(config, &mut issues);
    validate_priorities(config, &mut issues);
    validate_upstream(&config.upstream, &mut issues);

    if issues.is_empty() {
        Ok(())
    } else {
        Err(AppError::message(format!(
            "scheduler config invalid:\n  - {}",
            issues.join("\n  - ")
        )))
    }
}

fn validate_budget(config: &SchedulerConfig, issues: &mut Vec<String>) {
    if config.max_calls_per_window == 0 {
        issues.push("max_calls_per_window must be at least 1".to_string());
    }

    if config.window_length.is_zero() {
        issues.push("window_length_secs must be greater than zero".to_string());
    }

    if config.latency_sample_capacity == 0 {
        issues.push("latency_sample_capacity must be at least 1".to_string());
    }
}

fn validate_timers(config: &SchedulerConfig, issues: &mut Vec<String>) {
    if config.watchdog_interval.is_zero() {
        issues.push("watchdog_interval_secs must be greater than zero".to_string());
    } else if config.watchdog_interval >= config.window_length {
        issues.push(format!(
            "watchdog_interval_secs ({}s) must be shorter than the rate window ({}s)",
            config.watchdog_interval.as_secs(),
            config.window_length.as_secs()
        ));
    }
}

fn validate_priorities(config: &SchedulerConfig, issues: &mut Vec<String>) {
    let missing: Vec<&str> = RequestKind::ALL
        .iter()
        .filter(|kind| !config.priorities.contains(**kind))
        .map(|kind| kind.as_str())
        .collect();

    if !missing.is_empty() {
        issues.push(format!(
            "priorities has no entry for: {}",
            missing.join(", ")
        ));
    }
}

fn validate_upstream(upstream: &UpstreamConfig, issues: &mut Vec<String>) {
    if upstream.request_timeout.is_zero() {
        issues.push("upstream.request_timeout_secs must be greater than zero".to_string());
    }

    for (kind, template) in &upstream.endpoints {
        if template.trim().is_empty() {
            issues.push(format!("upstream.endpoints.{kind} must not be empty"));
        } else if !template.contains("{symbol") {
            issues.push(format!(
                "upstream.endpoints.{kind} should reference `{{symbol}}` for symbol substitution"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::config::PriorityTable;

    #[test]
    fn accepts_builtin_config() {
        validate_config(&SchedulerConfig::builtin()).expect("builtin config should be valid");
    }

    #[test]
    fn rejects_zero_budget() {
        let mut config = SchedulerConfig::builtin();
        config.max_calls_per_window = 0;

        let err = validate_config(&config).expect_err("validation should fail");
        assert!(
            err.to_string().contains("max_calls_per_window"),
            "unexpected error message: {err}"
        );
    }

    #[test]
    fn rejects_watchdog_slower_than_window() {
        let mut config = SchedulerConfig::builtin();
        config.watchdog_interval = Duration::from_secs(90);

        let err = validate_config(&config).expect_err("validation should fail");
        assert!(
            err.to_string().contains("shorter than the rate window"),
            "unexpected error message: {}",
            err
        );
    }

    #[test]
    fn reports_every_issue() {
        let mut config = SchedulerConfig::builtin();
        config.window_length = Duration::ZERO;
        config.priorities = PriorityTable::new(HashMap::from([(RequestKind::Quote, 1)]));
        config
            .upstream
            .endpoints
            .insert(RequestKind::Quote, "https://example.com/quote".to_string());

        let message = validate_config(&config)
            .expect_err("validation should fail")
            .to_string();
        assert!(message.contains("window_length_secs"), "{message}");
        assert!(message.contains("technical, news"), "{message}");
        assert!(message.contains("upstream.endpoints.quote"), "{message}");
    }
}
