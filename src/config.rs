//! Configuration loading for the sorting cell

use crate::{CellError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default dashboard (control channel) port on UR controllers
pub const DEFAULT_DASHBOARD_PORT: u16 = 29999;
/// Default secondary client port used for script uploads
pub const DEFAULT_SCRIPT_PORT: u16 = 30002;
/// Default port the robot connects back to for event notifications
pub const DEFAULT_EVENT_PORT: u16 = 5005;
/// Default deadline in seconds for a dashboard reply or script upload
pub const DEFAULT_COMMAND_TIMEOUT: f64 = 2.0;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub robot: RobotConfig,
    pub outputs: OutputConfig,
    pub batch: BatchConfig,
    pub program: ProgramConfig,
    pub events: EventConfig,
    pub store: StoreConfig,
    pub operators: OperatorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Address used when `connect` is issued without one
    pub host: Option<String>,
    pub ports: PortConfig,
    /// Per-socket connect timeout; unset leaves it to the OS
    pub connect_timeout: Option<f64>,
    /// Deadline for one dashboard exchange or script upload
    pub command_timeout: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortConfig {
    pub dashboard: u16,
    pub script: u16,
}

/// Standard digital output wiring between the cell and the controller
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Halts the program after the current cycle when high
    pub stop: u8,
    pub conveyor: u8,
    /// Asserted for the duration of the post-batch safety dwell
    pub safety: u8,
    /// Optional second line that follows the stop output
    pub stop_mirror: Option<u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub poll_interval: f64,
    pub max_wait: Option<f64>,
    pub safety_dwell: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProgramConfig {
    pub template_name: String,
    pub template_path: Option<PathBuf>,
    pub placeholder: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON-lines run log; runs are kept in memory when unset
    pub runs_path: Option<PathBuf>,
    pub counter_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub admins: Vec<String>,
    pub default_operator: Option<String>,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            host: None,
            ports: PortConfig::default(),
            connect_timeout: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            dashboard: DEFAULT_DASHBOARD_PORT,
            script: DEFAULT_SCRIPT_PORT,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            stop: 6,
            conveyor: 7,
            safety: 7,
            stop_mirror: None,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: 0.25,
            max_wait: None,
            safety_dwell: 60.0,
        }
    }
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            template_name: "robot.script".to_string(),
            template_path: None,
            placeholder: "{{MAX_CYCLES}}".to_string(),
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_EVENT_PORT,
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            admins: vec!["admin".to_string()],
            default_operator: None,
        }
    }
}

impl Config {
    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| CellError::Config(format!("Failed to read {}: {}", config_path, e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        positive("batch.poll_interval", self.batch.poll_interval)?;
        positive("robot.command_timeout", self.robot.command_timeout)?;
        if let Some(wait) = self.batch.max_wait {
            positive("batch.max_wait", wait)?;
        }
        if let Some(timeout) = self.robot.connect_timeout {
            positive("robot.connect_timeout", timeout)?;
        }
        if !self.batch.safety_dwell.is_finite() || self.batch.safety_dwell < 0.0 {
            return Err(CellError::Config(
                "batch.safety_dwell must be a finite, non-negative number of seconds".to_string(),
            ));
        }
        if self.program.placeholder.is_empty() {
            return Err(CellError::Config("program.placeholder must not be empty".to_string()));
        }
        Ok(())
    }
}

fn positive(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(CellError::Config(format!(
            "{} must be a finite, positive number of seconds",
            field
        )))
    }
}

/// Seconds to `Duration`; values that cannot be represented fall back to `fallback`
fn seconds(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}

impl RobotConfig {
    /// Get connect timeout as a duration, if configured
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
            .and_then(|t| Duration::try_from_secs_f64(t).ok())
    }

    /// Get the dashboard reply and upload deadline
    pub fn command_timeout(&self) -> Duration {
        seconds(self.command_timeout, DEFAULT_COMMAND_TIMEOUT)
    }
}

impl BatchConfig {
    /// Get monitor poll interval
    pub fn poll_interval(&self) -> Duration {
        seconds(self.poll_interval, 0.25)
    }

    /// Get upper bound on a single batch run, if any
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait.and_then(|w| Duration::try_from_secs_f64(w).ok())
    }

    /// Get the post-batch safety dwell
    pub fn safety_dwell(&self) -> Duration {
        seconds(self.safety_dwell, 60.0)
    }
}
