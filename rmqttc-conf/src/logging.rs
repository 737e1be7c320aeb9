use std::ops::Deref;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// `[log]` section
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default")]
    pub level: Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Self::level_default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
        }
    }
}

impl Log {
    fn to_default() -> To {
        To::Console
    }
    fn level_default() -> Level {
        Level::default()
    }
    fn dir_default() -> String {
        "/var/log/rmqttc".into()
    }
    fn file_default() -> String {
        "rmqttc.log".into()
    }

    /// Full path of the log file, empty when no file is configured.
    pub fn filename(&self) -> String {
        if self.file.is_empty() || self.dir.is_empty() {
            return self.file.clone();
        }
        format!("{}/{}", self.dir.trim_end_matches(['/', '\\']), self.file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl<'de> Deserialize<'de> for To {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;
        match v.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            _ => Err(de::Error::custom(format!("invalid log destination {:?}", v))),
        }
    }
}

/// slog level that deserializes from `"info"`, `"debug"`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }

    /// Same level for the `log` facade.
    pub fn filter(&self) -> log::LevelFilter {
        match self.0 {
            slog::Level::Critical | slog::Level::Error => log::LevelFilter::Error,
            slog::Level::Warning => log::LevelFilter::Warn,
            slog::Level::Info => log::LevelFilter::Info,
            slog::Level::Debug => log::LevelFilter::Debug,
            slog::Level::Trace => log::LevelFilter::Trace,
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level(slog::Level::Info)
    }
}

impl From<slog::Level> for Level {
    fn from(level: slog::Level) -> Self {
        Level(level)
    }
}

impl Deref for Level {
    type Target = slog::Level;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;
        slog::Level::from_str(&v)
            .map(Level)
            .map_err(|_| de::Error::custom(format!("invalid log level {:?}", v)))
    }
}
