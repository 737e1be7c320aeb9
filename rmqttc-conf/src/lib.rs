#![deny(unsafe_code)]

//! Client settings: an optional TOML file overlaid by `RMQTTC_*` environment variables.
//!
//! ```toml
//! [client]
//! server = "broker.local:1883"
//! keepalive = "30s"
//!
//! [client.reconnect]
//! max_delay = "1m"
//!
//! [log]
//! level = "debug"
//! ```
//!
//! `RMQTTC_CLIENT__KEEPALIVE=10s` overrides `client.keepalive`.

use anyhow::Result;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

pub use self::logging::{Level, Log, To};
pub use self::options::{ClientOptions, LastWillOptions, MqttVersion, ReconnectOptions, TopicAliasPolicy};

pub mod logging;
pub mod options;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub client: ClientOptions,
    #[serde(default)]
    pub log: Log,
}

impl Settings {
    /// Loads `rmqttc.toml` from the working directory when present, then `cfg_name` if given,
    /// then the environment.
    pub fn load(cfg_name: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder().add_source(File::with_name("rmqttc").required(false));
        if let Some(cfg) = cfg_name {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }
        let settings: Settings = builder.add_source(env_source()).build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses settings from TOML text, environment overrides still apply.
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let c = &self.client;
        anyhow::ensure!(c.receive_maximum > 0, "client.receive_maximum must not be 0");
        anyhow::ensure!(c.maximum_packet_size.as_usize() > 0, "client.maximum_packet_size must not be 0");
        anyhow::ensure!(c.command_queue > 0, "client.command_queue must not be 0");
        anyhow::ensure!(
            c.reconnect.min_delay <= c.reconnect.max_delay,
            "client.reconnect.min_delay is larger than max_delay"
        );
        anyhow::ensure!(c.reconnect.multiplier >= 1.0, "client.reconnect.multiplier must be at least 1.0");
        anyhow::ensure!((0.0..1.0).contains(&c.reconnect.jitter), "client.reconnect.jitter must be in [0, 1)");
        if let Some(will) = &c.last_will {
            anyhow::ensure!(will.qos <= 2, "client.last_will.qos must be 0, 1 or 2");
            anyhow::ensure!(!will.topic.is_empty(), "client.last_will.topic must not be empty");
        }
        Ok(())
    }

    pub fn logs(&self) {
        log::debug!("settings: {:?}", self);
        log::info!("server is {}, protocol {:?}", self.client.server, self.client.protocol);
        log::info!(
            "keepalive is {:?}, clean_start is {}, session expiry is {:?}",
            self.client.keepalive,
            self.client.clean_start,
            self.client.session_expiry_interval
        );
        log::info!("reconnect config is: {:?}", self.client.reconnect);
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("rmqttc").prefix_separator("_").separator("__").try_parsing(true)
}
