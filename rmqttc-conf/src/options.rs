use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use rmqttc_utils::{deserialize_duration, serialize_duration, Bytesize};

/// Protocol level spoken on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum MqttVersion {
    V311,
    #[default]
    V5,
}

impl<'de> Deserialize<'de> for MqttVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;
        match v.to_ascii_lowercase().as_str() {
            "v4" | "v311" | "3.1.1" | "4" => Ok(MqttVersion::V311),
            "v5" | "5" | "5.0" => Ok(MqttVersion::V5),
            _ => Err(de::Error::custom(format!("unsupported mqtt version {:?}", v))),
        }
    }
}

/// Whether outgoing publishes use topic aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicAliasPolicy {
    /// Reuse an alias if one exists, create one while slots remain.
    #[default]
    Attempt,
    /// Like `Attempt`; with every slot taken the oldest alias is reassigned.
    Force,
    /// Never send an alias.
    Forbid,
}

/// Automatic reconnection after an unplanned disconnect.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectOptions {
    #[serde(default = "ReconnectOptions::enable_default")]
    pub enable: bool,
    #[serde(
        default = "ReconnectOptions::min_delay_default",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub min_delay: Duration,
    #[serde(
        default = "ReconnectOptions::max_delay_default",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_delay: Duration,
    #[serde(default = "ReconnectOptions::multiplier_default")]
    pub multiplier: f64,
    /// Randomization factor, `0.25` spreads each delay over +-25%.
    #[serde(default = "ReconnectOptions::jitter_default")]
    pub jitter: f64,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enable: Self::enable_default(),
            min_delay: Self::min_delay_default(),
            max_delay: Self::max_delay_default(),
            multiplier: Self::multiplier_default(),
            jitter: Self::jitter_default(),
        }
    }
}

impl ReconnectOptions {
    fn enable_default() -> bool {
        true
    }
    fn min_delay_default() -> Duration {
        Duration::from_secs(1)
    }
    fn max_delay_default() -> Duration {
        Duration::from_secs(120)
    }
    fn multiplier_default() -> f64 {
        2.0
    }
    fn jitter_default() -> f64 {
        0.25
    }
}

/// Will message sent by the server when the connection drops unexpectedly.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LastWillOptions {
    pub topic: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// `[client]` section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientOptions {
    /// `host:port`, an optional `tcp://` scheme is accepted
    #[serde(default = "ClientOptions::server_default", deserialize_with = "ClientOptions::deserialize_server")]
    pub server: String,
    /// empty asks the server to assign one
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub protocol: MqttVersion,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(
        default = "ClientOptions::keepalive_default",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub keepalive: Duration,
    #[serde(
        default = "ClientOptions::connect_timeout_default",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub connect_timeout: Duration,
    #[serde(default = "ClientOptions::clean_start_default")]
    pub clean_start: bool,
    #[serde(default, deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub session_expiry_interval: Duration,
    #[serde(default = "ClientOptions::receive_maximum_default")]
    pub receive_maximum: u16,
    /// largest packet we accept, advertised in CONNECT
    #[serde(default = "ClientOptions::maximum_packet_size_default")]
    pub maximum_packet_size: Bytesize,
    /// aliases we accept from the server
    #[serde(default)]
    pub topic_alias_maximum: u16,
    #[serde(default = "ClientOptions::request_problem_information_default")]
    pub request_problem_information: bool,
    #[serde(default)]
    pub request_response_information: bool,
    #[serde(default)]
    pub topic_alias_policy: TopicAliasPolicy,
    #[serde(default)]
    pub manual_ack: bool,
    #[serde(default)]
    pub republish_if_session_expired: bool,
    #[serde(default = "ClientOptions::resubscribe_if_session_expired_default")]
    pub resubscribe_if_session_expired: bool,
    #[serde(default)]
    pub last_will: Option<LastWillOptions>,
    #[serde(default)]
    pub reconnect: ReconnectOptions,
    /// capacity of the connection task's command channel
    #[serde(default = "ClientOptions::command_queue_default")]
    pub command_queue: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server: Self::server_default(),
            client_id: String::new(),
            protocol: MqttVersion::default(),
            username: None,
            password: None,
            keepalive: Self::keepalive_default(),
            connect_timeout: Self::connect_timeout_default(),
            clean_start: Self::clean_start_default(),
            session_expiry_interval: Duration::ZERO,
            receive_maximum: Self::receive_maximum_default(),
            maximum_packet_size: Self::maximum_packet_size_default(),
            topic_alias_maximum: 0,
            request_problem_information: Self::request_problem_information_default(),
            request_response_information: false,
            topic_alias_policy: TopicAliasPolicy::default(),
            manual_ack: false,
            republish_if_session_expired: false,
            resubscribe_if_session_expired: Self::resubscribe_if_session_expired_default(),
            last_will: None,
            reconnect: ReconnectOptions::default(),
            command_queue: Self::command_queue_default(),
        }
    }
}

impl ClientOptions {
    fn server_default() -> String {
        "127.0.0.1:1883".into()
    }
    fn keepalive_default() -> Duration {
        Duration::from_secs(60)
    }
    fn connect_timeout_default() -> Duration {
        Duration::from_secs(20)
    }
    fn clean_start_default() -> bool {
        true
    }
    fn receive_maximum_default() -> u16 {
        u16::MAX
    }
    fn maximum_packet_size_default() -> Bytesize {
        Bytesize(268_435_460)
    }
    fn request_problem_information_default() -> bool {
        true
    }
    fn resubscribe_if_session_expired_default() -> bool {
        true
    }
    fn command_queue_default() -> usize {
        1024
    }

    fn deserialize_server<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        let addr = String::deserialize(deserializer)?;
        let addr = match addr.split_once("://") {
            None => addr,
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("tcp") || scheme.eq_ignore_ascii_case("mqtt") => {
                rest.to_owned()
            }
            Some(_) => return Err(de::Error::custom(format!("unsupported server address {:?}", addr))),
        };
        if addr.rsplit_once(':').is_none_or(|(host, port)| host.is_empty() || port.parse::<u16>().is_err()) {
            return Err(de::Error::custom(format!("server address must be host:port, got {:?}", addr)));
        }
        Ok(addr)
    }

    /// Keep alive in whole seconds as carried by CONNECT, saturating at `u16::MAX`.
    pub fn keepalive_secs(&self) -> u16 {
        u16::try_from(self.keepalive.as_secs()).unwrap_or(u16::MAX)
    }

    /// Session expiry in whole seconds as carried by CONNECT.
    pub fn session_expiry_secs(&self) -> u32 {
        u32::try_from(self.session_expiry_interval.as_secs()).unwrap_or(u32::MAX)
    }
}
