//! Pipeline metrics
//!
//! Thin wrappers over the `metrics` facade. A no-op unless the binary
//! installs a recorder.

use std::time::Duration;

use recall_config::RetrievalConfig;

/// Label for intents without a configured budget
pub const OTHER_INTENT: &str = "other";

/// Intent label bounded to the configured budget keys
pub fn intent_label(config: &RetrievalConfig, intent: &str) -> String {
    if config.budgets.contains_key(intent) {
        intent.to_string()
    } else {
        OTHER_INTENT.to_string()
    }
}

pub fn record_pipeline_run(intent: String) {
    metrics::counter!("recall_pipeline_runs_total", "intent" => intent).increment(1);
}

pub fn record_cache_hit(intent: String) {
    metrics::counter!("recall_pipeline_cache_hits_total", "intent" => intent).increment(1);
}

/// A backend call that degraded to an empty result
pub fn record_backend_error(source: &'static str) {
    metrics::counter!("recall_backend_errors_total", "source" => source).increment(1);
}

pub fn record_pipeline_duration(elapsed: Duration) {
    metrics::histogram!("recall_pipeline_duration_seconds").record(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_label_bounded_to_budget_keys() {
        let config = RetrievalConfig::default();
        assert_eq!(intent_label(&config, "ha"), "ha");
        assert_eq!(intent_label(&config, "chat"), "chat");
        assert_eq!(intent_label(&config, "user-supplied-7f3a"), OTHER_INTENT);
    }
}
