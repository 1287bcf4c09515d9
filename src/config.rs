use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;

pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// Text as written to the sysfs `direction` attribute.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("IN"),
            Direction::Out => f.write_str("OUT"),
        }
    }
}

impl FromStr for Direction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(GpioError::Format(format!(
                "direction '{other}' is neither in nor out"
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeDetect {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeDetect {
    /// Text as written to the sysfs `edge` attribute.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EdgeDetect::None => "none",
            EdgeDetect::Rising => "rising",
            EdgeDetect::Falling => "falling",
            EdgeDetect::Both => "both",
        }
    }

    /// Whether a transition from `old` to `new` raises an event in this mode.
    pub fn matches(&self, old: bool, new: bool) -> bool {
        match (self, old, new) {
            (EdgeDetect::Rising, false, true) | (EdgeDetect::Falling, true, false) => true,
            (EdgeDetect::Both, old, new) => old != new,
            _ => false,
        }
    }
}

impl fmt::Display for EdgeDetect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeDetect {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" => Ok(EdgeDetect::None),
            "rising" => Ok(EdgeDetect::Rising),
            "falling" => Ok(EdgeDetect::Falling),
            "both" => Ok(EdgeDetect::Both),
            other => Err(GpioError::Format(format!("invalid edge mode '{other}'"))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PinConfig {
    pub number: u32,
    pub direction: Direction,
    #[serde(default)]
    pub active_low: bool,
    #[serde(default)]
    pub edge: EdgeDetect,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Readiness wait timeout in milliseconds, negative waits indefinitely.
    #[serde(default = "MonitorConfig::default_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default = "MonitorConfig::default_buffer")]
    pub buffer: usize,
}

impl MonitorConfig {
    fn default_timeout_ms() -> i64 {
        -1
    }

    fn default_buffer() -> usize {
        1
    }

    pub fn timeout(&self) -> Option<Duration> {
        u64::try_from(self.timeout_ms).ok().map(Duration::from_millis)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            buffer: Self::default_buffer(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GpioConfig {
    #[serde(default = "GpioConfig::default_root")]
    pub sysfs_root: PathBuf,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub gpios: FxHashMap<String, PinConfig>,
}

impl GpioConfig {
    fn default_root() -> PathBuf {
        PathBuf::from(SYSFS_GPIO_ROOT)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GpioError> {
        if self.monitor.buffer == 0 {
            return Err(GpioError::Config(
                "monitor buffer must hold at least one value".into(),
            ));
        }
        for (name, pin) in &self.gpios {
            if pin.edge != EdgeDetect::None && pin.direction != Direction::In {
                return Err(GpioError::Config(format!(
                    "edge detection on {name} requires direction in"
                )));
            }
        }
        Ok(())
    }
}
