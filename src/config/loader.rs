use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::error::{AppError, Context, Result};
use crate::scheduler::RequestKind;

use super::{validator, SchedulerConfig, UpstreamConfig};

/// Location of the bundled configuration relative to the crate root.
pub const BUNDLED_CONFIG_PATH: &str = "assets/configs/default.json";

/// Load the JSON configuration shipped under `assets/configs`.
pub fn load_bundled(root: &Path) -> Result<SchedulerConfig> {
    load_config(&root.join(BUNDLED_CONFIG_PATH))
}

/// Load a scheduler configuration from JSON. Missing fields fall back to
/// [`SchedulerConfig::builtin`]; the merged result is validated before it is returned.
pub fn load_config(path: &Path) -> Result<SchedulerConfig> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read scheduler config at {}", path.display()))?;

    let config = parse_config(&json)
        .with_context(|| format!("failed to load scheduler config at {}", path.display()))?;

    Ok(config)
}

pub fn parse_config(json: &str) -> Result<SchedulerConfig> {
    let raw: RawSchedulerConfig = serde_json::from_str(json)?;
    let config = raw.into_config()?;
    validator::validate_config(&config)?;
    Ok(config)
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawSchedulerConfig {
    max_calls_per_window: Option<u32>,
    window_length_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    watchdog_interval_secs: Option<u64>,
    window_safety_margin_ms: Option<u64>,
    next_slot_estimate_secs: Option<u64>,
    latency_sample_capacity: Option<usize>,
    completed_marker_ttl_secs: Option<u64>,
    #[serde(default)]
    priorities: HashMap<String, u32>,
    #[serde(default)]
    upstream: RawUpstreamConfig,
}

impl RawSchedulerConfig {
    fn into_config(self) -> Result<SchedulerConfig> {
        let defaults = SchedulerConfig::builtin();

        let mut priorities = defaults.priorities.clone();
        for (kind, priority) in self.priorities {
            priorities.set(parse_kind(&kind, "priorities")?, priority);
        }

        Ok(SchedulerConfig {
            max_calls_per_window: self
                .max_calls_per_window
                .unwrap_or(defaults.max_calls_per_window),
            window_length: secs_or(self.window_length_secs, defaults.window_length),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_base_delay: millis_or(self.retry_base_delay_ms, defaults.retry_base_delay),
            watchdog_interval: secs_or(self.watchdog_interval_secs, defaults.watchdog_interval),
            window_safety_margin: millis_or(
                self.window_safety_margin_ms,
                defaults.window_safety_margin,
            ),
            next_slot_estimate: secs_or(self.next_slot_estimate_secs, defaults.next_slot_estimate),
            latency_sample_capacity: self
                .latency_sample_capacity
                .unwrap_or(defaults.latency_sample_capacity),
            completed_marker_ttl: secs_or(
                self.completed_marker_ttl_secs,
                defaults.completed_marker_ttl,
            ),
            priorities,
            upstream: self.upstream.into_upstream(defaults.upstream)?,
        })
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawUpstreamConfig {
    request_timeout_secs: Option<u64>,
    headers: Option<HashMap<String, String>>,
    #[serde(default)]
    endpoints: HashMap<String, String>,
}

impl RawUpstreamConfig {
    fn into_upstream(self, defaults: UpstreamConfig) -> Result<UpstreamConfig> {
        let mut endpoints = defaults.endpoints;
        for (kind, template) in self.endpoints {
            endpoints.insert(parse_kind(&kind, "upstream.endpoints")?, template);
        }

        Ok(UpstreamConfig {
            request_timeout: secs_or(self.request_timeout_secs, defaults.request_timeout),
            headers: self.headers.unwrap_or(defaults.headers),
            endpoints,
        })
    }
}

fn parse_kind(value: &str, section: &str) -> Result<RequestKind> {
    value.parse::<RequestKind>().map_err(|_| {
        AppError::message(format!(
            "unknown request kind `{value}` in {section}; expected one of {}",
            RequestKind::ALL
                .iter()
                .map(|kind| kind.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    })
}

fn secs_or(value: Option<u64>, fallback: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(fallback)
}

fn millis_or(value: Option<u64>, fallback: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_bundled_config() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR"));
        let config = load_bundled(root).expect("bundled config loads");

        assert_eq!(config.max_calls_per_window, 5);
        assert_eq!(config.window_length, Duration::from_secs(60));
        assert_eq!(config.priorities.priority_of(RequestKind::Technical), 1);
        assert!(config.upstream.endpoint(RequestKind::News).is_some());
    }

    #[test]
    fn missing_fields_fall_back_to_builtin() {
        let config = parse_config(r#"{ "max_calls_per_window": 2 }"#).expect("partial config");
        let builtin = SchedulerConfig::builtin();

        assert_eq!(config.max_calls_per_window, 2);
        assert_eq!(config.max_retries, builtin.max_retries);
        assert_eq!(config.retry_base_delay, builtin.retry_base_delay);
        assert_eq!(config.priorities, builtin.priorities);
    }

    #[test]
    fn overrides_priorities_by_kind_name() {
        let config = parse_config(r#"{ "priorities": { "news": 0 } }"#).expect("override");
        assert_eq!(config.priorities.priority_of(RequestKind::News), 0);
        assert_eq!(config.priorities.priority_of(RequestKind::Quote), 2);
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = parse_config(r#"{ "priorities": { "fundamentals": 4 } }"#)
            .expect_err("unknown kind should fail");
        assert!(
            err.to_string().contains("unknown request kind"),
            "unexpected error message: {err}"
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(parse_config(r#"{ "max_calls": 5 }"#).is_err());
    }
}
