//! Orchestrator settings loaded from the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(3600);
const MAX_ITEMS_PER_POLL: usize = 100;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub gmail_poll_interval: Duration,
    pub gcal_poll_interval: Duration,
    pub poll_max_items: usize,
    pub backfill_window_days: i64,
    pub backfill_email_max_items: usize,
    pub analysis_history_limit: usize,
    pub inbound_queue_capacity: usize,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub analyzer_url: Option<String>,
    pub analyzer_fallback_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gmail_poll_interval: Duration::from_secs(60),
            gcal_poll_interval: Duration::from_secs(60),
            poll_max_items: 10,
            backfill_window_days: 10,
            backfill_email_max_items: 200,
            analysis_history_limit: 20,
            inbound_queue_capacity: 1024,
            db_path: default_db_path(),
            host: "0.0.0.0".to_string(),
            port: 9200,
            analyzer_url: None,
            analyzer_fallback_url: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let gmail_poll_interval = env::var("GMAIL_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.gmail_poll_interval);
        let gcal_poll_interval = env::var("GCAL_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.gcal_poll_interval);
        let poll_max_items = env::var("POLL_MAX_ITEMS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.poll_max_items);
        let backfill_window_days = env::var("BACKFILL_WINDOW_DAYS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|days| *days > 0)
            .unwrap_or(defaults.backfill_window_days);
        let backfill_email_max_items = env::var("BACKFILL_EMAIL_MAX_ITEMS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|max| *max > 0)
            .unwrap_or(defaults.backfill_email_max_items);
        let analysis_history_limit = env::var("ANALYSIS_HISTORY_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.analysis_history_limit);
        let inbound_queue_capacity = env::var("INBOUND_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|capacity| *capacity > 0)
            .unwrap_or(defaults.inbound_queue_capacity);
        let db_path = env::var("ASSISTANT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let host = env::var("ASSISTANT_HOST").unwrap_or(defaults.host);
        let port = env::var("ASSISTANT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);

        Self {
            gmail_poll_interval,
            gcal_poll_interval,
            poll_max_items,
            backfill_window_days,
            backfill_email_max_items,
            analysis_history_limit,
            inbound_queue_capacity,
            db_path,
            host,
            port,
            analyzer_url: non_empty_var("ANALYZER_URL"),
            analyzer_fallback_url: non_empty_var("ANALYZER_FALLBACK_URL"),
        }
    }

    pub fn gmail_interval(&self) -> Duration {
        clamp_interval(self.gmail_poll_interval)
    }

    pub fn gcal_interval(&self) -> Duration {
        clamp_interval(self.gcal_poll_interval)
    }

    pub fn max_items_per_poll(&self) -> usize {
        self.poll_max_items.clamp(1, MAX_ITEMS_PER_POLL)
    }

    pub fn backfill_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.backfill_window_days.max(1))
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".assistant")
        .join("state")
        .join("assistant.db")
}
