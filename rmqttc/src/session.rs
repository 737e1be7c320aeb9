//! Connection lifecycle and the per-connection limits negotiated by CONNECT/CONNACK.

use std::fmt;

use rmqttc_codec::types::QoS;
use rmqttc_codec::v5::ConnectAck;
use rmqttc_codec::types::MAX_TOTAL_PACKET_SIZE;
use rmqttc_conf::{ClientOptions, MqttVersion};

use crate::error::{MqttError, Result};

/// Identifiers kept back from the publish quota so subscription requests always find one.
const RESERVED_IDS: u16 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(s)
    }
}

/// Legal transitions of [`ConnectionState`].
#[derive(Debug, Default)]
pub struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `DISCONNECTED -> CONNECTING`, the only way to start an attempt.
    pub fn connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            ConnectionState::Connecting => Err(MqttError::AlreadyConnecting),
            ConnectionState::Connected | ConnectionState::Disconnecting => Err(MqttError::AlreadyConnected),
        }
    }

    /// `CONNECTING -> CONNECTED` on a successful CONNACK.
    pub fn connected(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connecting {
            return Err(MqttError::protocol(format!("CONNACK received while {}", self.state)));
        }
        self.state = ConnectionState::Connected;
        Ok(())
    }

    pub fn disconnecting(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnecting;
        }
    }

    /// Any state `-> DISCONNECTED`; returns the state that was left.
    pub fn disconnected(&mut self) -> ConnectionState {
        std::mem::replace(&mut self.state, ConnectionState::Disconnected)
    }
}

/// Decides what of the previous session is kept after a CONNACK.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub expiry_interval_secs: u32,
    pub clean_start: bool,
    pub resubscribe_if_expired: bool,
    pub republish_if_expired: bool,
    connected_before: bool,
}

impl SessionState {
    pub fn new(options: &ClientOptions) -> Self {
        Self {
            expiry_interval_secs: if options.protocol == MqttVersion::V5 { options.session_expiry_secs() } else { 0 },
            clean_start: options.clean_start,
            resubscribe_if_expired: options.resubscribe_if_session_expired,
            republish_if_expired: options.republish_if_session_expired,
            connected_before: false,
        }
    }

    /// Clean start flag for the next CONNECT.
    ///
    /// Reconnects ask to resume when the server may still hold the session.
    pub fn clean_start_flag(&self, v311: bool) -> bool {
        if !self.connected_before {
            return self.clean_start;
        }
        if v311 {
            self.clean_start
        } else {
            self.expiry_interval_secs == 0 && self.clean_start
        }
    }

    /// Validates CONNACK's session present flag and reports whether the session continues.
    pub fn on_connack(&mut self, clean_start_sent: bool, session_present: bool) -> Result<bool> {
        if clean_start_sent && session_present {
            return Err(MqttError::protocol("session present in reply to a clean start"));
        }
        self.connected_before = true;
        Ok(session_present)
    }
}

/// Limits of one connection, replaced wholesale on every CONNACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRestrictions {
    /// Unacknowledged QoS>0 publishes the server accepts
    pub receive_maximum: u16,
    /// Publish quota actually used, leaves room in the identifier space for subscriptions
    pub send_maximum: u16,
    /// Largest packet the server accepts
    pub maximum_packet_size: u32,
    /// Largest packet we accept, as sent in CONNECT
    pub incoming_maximum_packet_size: u32,
    pub topic_alias_maximum: u16,
    pub incoming_topic_alias_maximum: u16,
    pub maximum_qos: QoS,
    pub retain_available: bool,
    pub wildcard_subscription_available: bool,
    pub shared_subscription_available: bool,
    pub subscription_identifiers_available: bool,
    /// Effective keep alive in seconds, the server's value wins
    pub keepalive: u16,
}

impl ConnectionRestrictions {
    pub fn new(options: &ClientOptions, ack: &ConnectAck) -> Self {
        let v5 = options.protocol == MqttVersion::V5;
        let receive_maximum = ack.receive_max.get();
        Self {
            receive_maximum,
            send_maximum: receive_maximum.min(u16::MAX - RESERVED_IDS),
            maximum_packet_size: ack
                .max_packet_size
                .filter(|size| *size > 0)
                .unwrap_or(MAX_TOTAL_PACKET_SIZE),
            incoming_maximum_packet_size: options.maximum_packet_size.as_u32(),
            topic_alias_maximum: if v5 { ack.topic_alias_max } else { 0 },
            incoming_topic_alias_maximum: if v5 { options.topic_alias_maximum } else { 0 },
            maximum_qos: ack.max_qos,
            retain_available: ack.retain_available,
            wildcard_subscription_available: ack.wildcard_subscription_available,
            shared_subscription_available: ack.shared_subscription_available,
            subscription_identifiers_available: ack.subscription_identifiers_available,
            keepalive: ack.server_keepalive_sec.unwrap_or_else(|| options.keepalive_secs()),
        }
    }

    /// Publishes the server would reject are failed before they are sent.
    pub fn check_publish(&self, qos: QoS, retain: bool) -> Result<()> {
        if qos > self.maximum_qos {
            return Err(MqttError::NotSupported("QoS above the server's maximum"));
        }
        if retain && !self.retain_available {
            return Err(MqttError::NotSupported("retain"));
        }
        Ok(())
    }
}
