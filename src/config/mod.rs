use std::collections::HashMap;
use std::time::Duration;

use crate::scheduler::RequestKind;

pub mod loader;
pub mod validator;

pub use loader::{load_bundled, load_config, BUNDLED_CONFIG_PATH};

/// Fixed mapping from request kind to priority. Lower values are served first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityTable {
    entries: HashMap<RequestKind, u32>,
}

impl PriorityTable {
    pub fn new(entries: HashMap<RequestKind, u32>) -> Self {
        Self { entries }
    }

    /// Priority for `kind`. Kinds missing from the table sort after everything else.
    pub fn priority_of(&self, kind: RequestKind) -> u32 {
        self.entries.get(&kind).copied().unwrap_or(u32::MAX)
    }

    pub fn contains(&self, kind: RequestKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn set(&mut self, kind: RequestKind, priority: u32) {
        self.entries.insert(kind, priority);
    }
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self::new(HashMap::from([
            (RequestKind::Technical, 1),
            (RequestKind::Quote, 2),
            (RequestKind::News, 3),
        ]))
    }
}

/// Settings for the HTTP collaborator that performs the actual upstream calls.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub request_timeout: Duration,
    pub headers: HashMap<String, String>,
    /// URL template per request kind, rendered with [`crate::fetch::prepare_url`].
    pub endpoints: HashMap<RequestKind, String>,
}

impl UpstreamConfig {
    pub fn endpoint(&self, kind: RequestKind) -> Option<&str> {
        self.endpoints.get(&kind).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_calls_per_window: u32,
    pub window_length: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub watchdog_interval: Duration,
    /// Extra sleep added on top of the time left in the window before retrying.
    pub window_safety_margin: Duration,
    /// Wait estimate reported while the current window still has budget.
    pub next_slot_estimate: Duration,
    pub latency_sample_capacity: usize,
    /// How long served/failed markers stay visible to status queries.
    pub completed_marker_ttl: Duration,
    pub priorities: PriorityTable,
    pub upstream: UpstreamConfig,
}

impl SchedulerConfig {
    pub fn builtin() -> Self {
        let api_key = "${ALPHAVANTAGE_API_KEY}";
        let endpoints = HashMap::from([
            (
                RequestKind::Technical,
                format!(
                    "https://www.alphavantage.co/query?function=RSI&symbol={{symbol}}&interval=daily&time_period=14&series_type=close&apikey={api_key}"
                ),
            ),
            (
                RequestKind::Quote,
                format!(
                    "https://www.alphavantage.co/query?function=GLOBAL_QUOTE&symbol={{symbol}}&apikey={api_key}"
                ),
            ),
            (
                RequestKind::News,
                format!(
                    "https://www.alphavantage.co/query?function=NEWS_SENTIMENT&tickers={{symbol}}&apikey={api_key}"
                ),
            ),
        ]);

        let headers = HashMap::from([(
            "User-Agent".to_string(),
            concat!("quote-gate/", env!("CARGO_PKG_VERSION")).to_string(),
        )]);

        Self {
            max_calls_per_window: 5,
            window_length: Duration::from_secs(60),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(2000),
            watchdog_interval: Duration::from_secs(15),
            window_safety_margin: Duration::from_millis(250),
            next_slot_estimate: Duration::from_secs(1),
            latency_sample_capacity: 50,
            completed_marker_ttl: Duration::from_secs(300),
            priorities: PriorityTable::default(),
            upstream: UpstreamConfig {
                request_timeout: Duration::from_secs(10),
                headers,
                endpoints,
            },
        }
    }

    /// Convenience for tests and embedders that only care about the budget.
    pub fn with_budget(max_calls_per_window: u32, window_length: Duration) -> Self {
        Self {
            max_calls_per_window,
            window_length,
            ..Self::builtin()
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builtin()
    }
}
