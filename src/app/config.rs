use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSettings {
    pub adb_command_path: String,
    pub shell_timeout_secs: u64,
    pub install_timeout_secs: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            adb_command_path: String::new(),
            shell_timeout_secs: 30,
            install_timeout_secs: 180,
        }
    }
}

impl BridgeSettings {
    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactSettings {
    pub capture_root: String,
    pub plugins_dir: String,
    pub automation_server_apk: String,
    pub automation_server_test_apk: String,
    pub automation_server_version: String,
    pub agent_app_apk: String,
    pub agent_app_version: String,
    pub supply_binary: String,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            capture_root: "mini".to_string(),
            plugins_dir: "plugins".to_string(),
            automation_server_apk: "plugins/sonic-appium-uiautomator2-server.apk".to_string(),
            automation_server_test_apk: "plugins/sonic-appium-uiautomator2-server-test.apk"
                .to_string(),
            automation_server_version: "5.12.4".to_string(),
            agent_app_apk: "plugins/sonic-android-apk.apk".to_string(),
            agent_app_version: "2.4.0".to_string(),
            supply_binary: "plugins/sonic-android-supply".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingSettings {
    pub frame_queue_capacity: usize,
    pub read_timeout_ms: u64,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            frame_queue_capacity: 256,
            read_timeout_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessSettings {
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
    pub settle_delay_ms: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 800,
            poll_attempts: 20,
            settle_delay_ms: 2000,
        }
    }
}

impl ReadinessSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorSettings {
    pub stop_grace_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self { stop_grace_secs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSettings {
    pub worker_limit: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { worker_limit: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            json: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub artifacts: ArtifactSettings,
    #[serde(default)]
    pub streaming: StreamingSettings,
    #[serde(default)]
    pub readiness: ReadinessSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DEVICEHUB_AGENT_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".devicehub_agent.json")
}

pub fn load_config() -> Result<AgentConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<AgentConfig, AppError> {
    if !path.exists() {
        return Ok(AgentConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: AgentConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

fn validate_config(mut config: AgentConfig) -> AgentConfig {
    if config.bridge.shell_timeout_secs == 0 {
        config.bridge.shell_timeout_secs = 30;
    }
    if config.bridge.install_timeout_secs < 10 {
        config.bridge.install_timeout_secs = 180;
    }
    if config.streaming.frame_queue_capacity == 0 {
        config.streaming.frame_queue_capacity = 256;
    }
    if !(10..=5_000).contains(&config.streaming.read_timeout_ms) {
        config.streaming.read_timeout_ms = 250;
    }
    if config.readiness.poll_interval_ms < 50 {
        config.readiness.poll_interval_ms = 800;
    }
    if config.readiness.poll_attempts == 0 {
        config.readiness.poll_attempts = 20;
    }
    if config.supervisor.stop_grace_secs == 0 {
        config.supervisor.stop_grace_secs = 5;
    }
    if config.scheduler.worker_limit == 0 {
        config.scheduler.worker_limit = 64;
    }
    config
}
