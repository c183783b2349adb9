use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_upload_base_url")]
    pub upload_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_seconds: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Uploaded/generated element URLs older than this are considered expired
    /// (the remote file storage keeps files for 3 days).
    #[serde(default = "default_url_ttl_hours")]
    pub url_ttl_hours: i64,
}

fn default_base_url() -> String {
    "https://api.kie.ai".to_string()
}

fn default_upload_base_url() -> String {
    "https://kieai.redpandaai.co".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_max_wait() -> u64 {
    300
}

fn default_concurrency() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_mode() -> String {
    "pro".to_string()
}

fn default_aspect_ratio() -> String {
    "16:9".to_string()
}

fn default_cfg_scale() -> f64 {
    0.5
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_url_ttl_hours() -> i64 {
    72
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_poll_interval(),
            max_wait_seconds: default_max_wait(),
            concurrency: default_concurrency(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            aspect_ratio: default_aspect_ratio(),
            cfg_scale: default_cfg_scale(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            url_ttl_hours: default_url_ttl_hours(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.as_ref().display()))?;

        if config.api.api_key.is_empty() || config.api.api_key == "YOUR_KIE_API_KEY" {
            anyhow::bail!("config.json: api.api_key is not set");
        }

        Ok(config)
    }

    /// Element reference images, shared across scenarios.
    pub fn elements_dir(&self) -> PathBuf {
        self.output.base_dir.join("elements")
    }

    /// Element status file, shared across scenarios.
    pub fn elements_status_path(&self) -> PathBuf {
        self.output.base_dir.join("elements_status.json")
    }

    /// Per-scenario shot videos.
    pub fn shots_dir(&self, scenario_stem: &str) -> PathBuf {
        self.output.base_dir.join(scenario_stem).join("shots")
    }

    /// Per-scenario shot status file.
    pub fn scenario_status_path(&self, scenario_stem: &str) -> PathBuf {
        self.output.base_dir.join(scenario_stem).join("status.json")
    }

    /// Assembled final video for a scenario.
    pub fn final_video_path(&self, scenario_stem: &str) -> PathBuf {
        self.output
            .base_dir
            .join(scenario_stem)
            .join(format!("{scenario_stem}.mp4"))
    }

    pub fn url_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.output.url_ttl_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let raw = r#"{"api": {"api_key": "k-123"}}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.api.base_url, "https://api.kie.ai");
        assert_eq!(cfg.polling.interval_seconds, 10);
        assert_eq!(cfg.polling.concurrency, 3);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.output.url_ttl_hours, 72);
    }

    #[test]
    fn scoped_paths() {
        let raw = r#"{"api": {"api_key": "k"}}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(
            cfg.scenario_status_path("intro"),
            PathBuf::from("output/intro/status.json")
        );
        assert_eq!(cfg.shots_dir("intro"), PathBuf::from("output/intro/shots"));
        assert_eq!(
            cfg.elements_status_path(),
            PathBuf::from("output/elements_status.json")
        );
    }
}
