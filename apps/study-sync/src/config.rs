use std::env;
use std::path::PathBuf;
use std::time::Duration;

use autosave::{AutosaveConfig, RetryPolicy};
use directories::BaseDirs;
use url::Url;

pub const TOKEN_VAR: &str = "STUDY_SYNC_TOKEN";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub backup_root: PathBuf,
    pub debounce_ms: u64,
    pub periodic_secs: u64,
    pub max_retries: u32,
}

impl Config {
    pub fn from_env() -> Self {
        let backup_root = env::var("STUDY_SYNC_BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_backup_root());

        Self {
            api_url: env::var("STUDY_SYNC_API_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            backup_root,
            debounce_ms: env::var("STUDY_SYNC_DEBOUNCE_MS")
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(800),
            periodic_secs: env::var("STUDY_SYNC_PERIODIC_SECS")
                .ok()
                .and_then(|val| val.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(30),
            max_retries: env::var("STUDY_SYNC_MAX_RETRIES")
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(3),
        }
    }

    pub fn autosave(&self) -> AutosaveConfig {
        AutosaveConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            periodic_interval: Duration::from_secs(self.periodic_secs),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                ..RetryPolicy::default()
            },
            ..AutosaveConfig::default()
        }
    }

    /// Backups are scoped to the API origin so two servers never share keys.
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_root.join(origin_slug(&self.api_url))
    }
}

fn default_backup_root() -> PathBuf {
    BaseDirs::new()
        .map(|base| base.data_dir().join("study-sync").join("backups"))
        .unwrap_or_else(|| PathBuf::from(".study-sync").join("backups"))
}

/// `host_port` of the API origin; userinfo and path never take part.
fn origin_slug(api_url: &str) -> String {
    let Ok(url) = Url::parse(api_url) else {
        return "local".to_string();
    };
    let host = url.host_str().unwrap_or("local");
    let origin = match url.port_or_known_default() {
        Some(port) => format!("{host}_{port}"),
        None => host.to_string(),
    };
    origin
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
