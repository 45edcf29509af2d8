//! Application configuration.
//!
//! Configuration is a JSON document (every field optional, defaults below)
//! named by `REPLAY_REVIEW_CONFIG`, with environment overrides applied on top.
//! `.env` files are honoured through `dotenvy`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Environment variable naming the JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "REPLAY_REVIEW_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    /// Root directory for jobs, cache, state, analysis artifacts and logs.
    pub data_dir: PathBuf,
    /// Default log filter directive (overridden by `RUST_LOG`).
    pub log_filter: String,
    pub slots: SlotConfig,
    pub render: RenderConfig,
    pub daemon: DaemonConfig,
    pub source: SourceConfig,
    pub inference: InferenceConfig,
    pub storage: StorageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_filter: crate::logging::DEFAULT_LOG_FILTER.to_string(),
            slots: SlotConfig::default(),
            render: RenderConfig::default(),
            daemon: DaemonConfig::default(),
            source: SourceConfig::default(),
            inference: InferenceConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Render slot arbitration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SlotConfig {
    /// Directory holding `slot-N.lock` files. Shared by every process on the
    /// host; defaults to a directory under the system temp dir.
    pub slot_dir: Option<PathBuf>,
    /// Upper bound on memory all concurrent renders may use.
    pub max_render_memory_mb: u64,
    /// Estimated memory cost of one render (browser + encoder).
    pub per_render_memory_mb: u64,
    /// Fraction of live free memory considered usable.
    pub memory_utilization: f64,
    /// Sleep between full slot scans when every slot is taken.
    pub backoff_ms: u64,
    /// Age after which an unreadable lock file is treated as abandoned.
    pub stale_lock_secs: u64,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            slot_dir: None,
            max_render_memory_mb: 4096,
            per_render_memory_mb: 512,
            memory_utilization: 0.9,
            backoff_ms: 1000,
            stale_lock_secs: 60,
        }
    }
}

/// Replay rendering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderConfig {
    /// Headless browser player command (program followed by fixed arguments).
    /// The manifest path is appended as the last argument.
    pub player_command: Vec<String>,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Gap between interactions that starts an inactive segment.
    pub skip_threshold_ms: i64,
    /// Video-time compression applied to inactive segments.
    pub skip_multiplier: f64,
    /// Playback speed for active segments.
    pub base_speed: f64,
    /// Lowest playback speed used inside an inactive segment.
    pub min_inactive_speed: f64,
    pub timeout_floor_secs: u64,
    pub timeout_buffer_secs: u64,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub fps: u32,
    /// Trim a leading black intro when it falls inside the configured window.
    pub trim_black_intro: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            player_command: vec!["replay-player".to_string()],
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            skip_threshold_ms: 10_000,
            skip_multiplier: 360.0,
            base_speed: 1.0,
            min_inactive_speed: 8.0,
            timeout_floor_secs: 120,
            timeout_buffer_secs: 60,
            viewport_width: 1280,
            viewport_height: 720,
            fps: 25,
            trim_black_intro: true,
        }
    }
}

/// Daemon loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    pub poll_interval_secs: u64,
    /// How far back the first heartbeat reaches.
    pub lookback_days: i64,
    /// Hosts (and their subdomains) whose recordings are processed.
    /// Empty admits every recording.
    pub allowed_domains: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            lookback_days: 7,
            allowed_domains: Vec::new(),
        }
    }
}

/// Recording source connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceConfig {
    pub base_url: String,
    pub project_id: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub page_size: u32,
    pub request_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            project_id: String::new(),
            api_key: None,
            page_size: 100,
            request_timeout_secs: 60,
        }
    }
}

/// Inference connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InferenceConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1/analyze".to_string(),
            model: "default".to_string(),
            api_key: None,
            request_timeout_secs: 600,
        }
    }
}

/// Object storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Copy artifacts into a local directory.
    Local {
        root: PathBuf,
    },
    /// Upload through `rclone copyto`.
    Rclone {
        remote: String,
        #[serde(default)]
        rclone_path: Option<String>,
        /// Base used to build retrievable URIs; defaults to `remote`.
        #[serde(default)]
        public_base_url: Option<String>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            root: PathBuf::from("./data/artifacts"),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    /// Load configuration from `.env`, the optional JSON file and environment
    /// overrides, then validate it.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match env_nonempty(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => {
                debug!("{} not set, using default configuration", CONFIG_PATH_ENV);
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config file", path, e))?;
        let config = serde_json::from_str(&raw).map_err(|e| {
            Error::config(format!("invalid config file {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_nonempty("REPLAY_REVIEW_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_nonempty("REPLAY_REVIEW_SLOT_DIR") {
            self.slots.slot_dir = Some(PathBuf::from(dir));
        }
        if let Some(mb) = env_nonempty("MAX_RENDER_MEMORY_MB").and_then(|v| v.parse().ok()) {
            self.slots.max_render_memory_mb = mb;
        }
        if let Some(path) = env_nonempty("FFMPEG_PATH") {
            self.render.ffmpeg_path = path;
        }
        if let Some(path) = env_nonempty("FFPROBE_PATH") {
            self.render.ffprobe_path = path;
        }
        if let Some(player) = env_nonempty("REPLAY_PLAYER") {
            self.render.player_command = player.split_whitespace().map(str::to_string).collect();
        }
        if let Some(path) = env_nonempty("RCLONE_PATH")
            && let StorageConfig::Rclone { rclone_path, .. } = &mut self.storage
        {
            *rclone_path = Some(path);
        }
        if let Some(url) = env_nonempty("SOURCE_BASE_URL") {
            self.source.base_url = url;
        }
        if let Some(project) = env_nonempty("SOURCE_PROJECT_ID") {
            self.source.project_id = project;
        }
        if let Some(key) = env_nonempty("SOURCE_API_KEY") {
            self.source.api_key = Some(key);
        }
        if let Some(endpoint) = env_nonempty("INFERENCE_ENDPOINT") {
            self.inference.endpoint = endpoint;
        }
        if let Some(key) = env_nonempty("INFERENCE_API_KEY") {
            self.inference.api_key = Some(key);
        }
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.slots.per_render_memory_mb == 0 {
            return Err(Error::config("slots.perRenderMemoryMb must be greater than 0"));
        }
        if !(self.slots.memory_utilization > 0.0 && self.slots.memory_utilization <= 1.0) {
            return Err(Error::config("slots.memoryUtilization must be in (0, 1]"));
        }
        if self.render.skip_multiplier < 1.0 {
            return Err(Error::config("render.skipMultiplier must be at least 1"));
        }
        if self.render.base_speed <= 0.0 || self.render.min_inactive_speed <= 0.0 {
            return Err(Error::config("render speeds must be positive"));
        }
        if self.render.skip_threshold_ms <= 0 {
            return Err(Error::config("render.skipThresholdMs must be positive"));
        }
        if self.render.player_command.is_empty() || self.render.player_command[0].trim().is_empty() {
            return Err(Error::config("render.playerCommand must name a program"));
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(Error::config("daemon.pollIntervalSecs must be greater than 0"));
        }
        if self.daemon.lookback_days < 0 {
            return Err(Error::config("daemon.lookbackDays must not be negative"));
        }
        Ok(())
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state").join("daemon.json")
    }

    pub fn analysis_dir(&self) -> PathBuf {
        self.data_dir.join("analysis")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("daemon.pid")
    }

    pub fn slot_dir(&self) -> PathBuf {
        self.slots
            .slot_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("replay-review-slots"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slots.per_render_memory_mb, 512);
        assert_eq!(config.render.skip_threshold_ms, 10_000);
        assert_eq!(config.daemon.poll_interval_secs, 30);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "dataDir": "/var/lib/replay-review",
            "slots": {"maxRenderMemoryMb": 1024},
            "storage": {"kind": "rclone", "remote": "s3:bucket/replays"}
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/replay-review"));
        assert_eq!(config.slots.max_render_memory_mb, 1024);
        assert_eq!(config.slots.per_render_memory_mb, 512);
        assert_eq!(config.jobs_dir(), PathBuf::from("/var/lib/replay-review/jobs"));
        assert!(matches!(config.storage, StorageConfig::Rclone { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.slots.per_render_memory_mb = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.slots.memory_utilization = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.render.player_command.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.render.skip_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_keys_are_not_serialized() {
        let mut config = AppConfig::default();
        config.source.api_key = Some("secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
