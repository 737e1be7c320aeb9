//! Adapters between the MQTT v5 packet model and MQTT v3.1.1 packets.
//!
//! The client speaks the v5 model everywhere; on a v3.1.1 connection packets are converted at
//! the codec boundary. v5-only fields are dropped on the way out and defaulted on the way in.

use crate::error::EncodeError;
use crate::types::{Protocol, MQTT_LEVEL_311};
use crate::{v3, v5};

/// Converts an outbound v5 packet, failing for packets v3.1.1 does not have.
pub fn to_v3(pkt: v5::Packet) -> Result<v3::Packet, EncodeError> {
    let pkt = match pkt {
        v5::Packet::Connect(connect) => {
            let connect = *connect;
            v3::Packet::Connect(Box::new(v3::Connect {
                protocol: Protocol(MQTT_LEVEL_311),
                clean_session: connect.clean_start,
                keep_alive: connect.keep_alive,
                last_will: connect.last_will.map(|will| v3::LastWill {
                    qos: will.qos,
                    retain: will.retain,
                    topic: will.topic,
                    message: will.message,
                }),
                client_id: connect.client_id,
                username: connect.username,
                password: connect.password,
            }))
        }
        v5::Packet::ConnectAck(ack) => v3::Packet::ConnectAck(v3::ConnectAck {
            return_code: connack_reason_to_v3(ack.reason_code),
            session_present: ack.session_present,
        }),
        v5::Packet::Publish(mut publish) => {
            publish.properties = None;
            v3::Packet::Publish(*publish)
        }
        v5::Packet::PublishAck(ack) => v3::Packet::PublishAck { packet_id: ack.packet_id },
        v5::Packet::PublishReceived(ack) => v3::Packet::PublishReceived { packet_id: ack.packet_id },
        v5::Packet::PublishRelease(ack) => v3::Packet::PublishRelease { packet_id: ack.packet_id },
        v5::Packet::PublishComplete(ack) => v3::Packet::PublishComplete { packet_id: ack.packet_id },
        v5::Packet::Subscribe(sub) => v3::Packet::Subscribe {
            packet_id: sub.packet_id,
            topic_filters: sub.topic_filters.into_iter().map(|(filter, opts)| (filter, opts.qos)).collect(),
        },
        v5::Packet::SubscribeAck(ack) => v3::Packet::SubscribeAck {
            packet_id: ack.packet_id,
            status: ack
                .status
                .iter()
                .map(|reason| match reason.granted_qos() {
                    Some(qos) => v3::SubscribeReturnCode::Success(qos),
                    None => v3::SubscribeReturnCode::Failure,
                })
                .collect(),
        },
        v5::Packet::Unsubscribe(unsub) => {
            v3::Packet::Unsubscribe { packet_id: unsub.packet_id, topic_filters: unsub.topic_filters }
        }
        v5::Packet::UnsubscribeAck(ack) => v3::Packet::UnsubscribeAck { packet_id: ack.packet_id },
        v5::Packet::PingRequest => v3::Packet::PingRequest,
        v5::Packet::PingResponse => v3::Packet::PingResponse,
        v5::Packet::Disconnect(_) => v3::Packet::Disconnect,
        v5::Packet::Auth(_) => return Err(EncodeError::UnsupportedVersion),
    };
    Ok(pkt)
}

/// Converts an inbound v3.1.1 packet into the v5 model.
///
/// A v3.1.1 UNSUBACK carries no per-filter result, its `status` comes back empty.
pub fn from_v3(pkt: v3::Packet) -> v5::Packet {
    match pkt {
        v3::Packet::Connect(connect) => {
            let connect = *connect;
            v5::Packet::Connect(Box::new(v5::Connect {
                clean_start: connect.clean_session,
                keep_alive: connect.keep_alive,
                last_will: connect.last_will.map(|will| v5::LastWill {
                    qos: will.qos,
                    retain: will.retain,
                    topic: will.topic,
                    message: will.message,
                    will_delay_interval_sec: None,
                    correlation_data: None,
                    message_expiry_interval: None,
                    content_type: None,
                    user_properties: Vec::new(),
                    is_utf8_payload: None,
                    response_topic: None,
                }),
                client_id: connect.client_id,
                username: connect.username,
                password: connect.password,
                ..v5::Connect::default()
            }))
        }
        v3::Packet::ConnectAck(ack) => v5::Packet::ConnectAck(Box::new(v5::ConnectAck {
            session_present: ack.session_present,
            reason_code: connack_reason_from_v3(ack.return_code),
            ..v5::ConnectAck::default()
        })),
        v3::Packet::Publish(publish) => v5::Packet::Publish(Box::new(publish)),
        v3::Packet::PublishAck { packet_id } => {
            v5::Packet::PublishAck(v5::PublishAck::new(packet_id, v5::PublishAckReason::Success))
        }
        v3::Packet::PublishReceived { packet_id } => {
            v5::Packet::PublishReceived(v5::PublishAck::new(packet_id, v5::PublishAckReason::Success))
        }
        v3::Packet::PublishRelease { packet_id } => {
            v5::Packet::PublishRelease(v5::PublishAck2::new(packet_id, v5::PublishAck2Reason::Success))
        }
        v3::Packet::PublishComplete { packet_id } => {
            v5::Packet::PublishComplete(v5::PublishAck2::new(packet_id, v5::PublishAck2Reason::Success))
        }
        v3::Packet::Subscribe { packet_id, topic_filters } => v5::Packet::Subscribe(v5::Subscribe {
            packet_id,
            id: None,
            user_properties: Vec::new(),
            topic_filters: topic_filters
                .into_iter()
                .map(|(filter, qos)| (filter, v5::SubscriptionOptions { qos, ..Default::default() }))
                .collect(),
        }),
        v3::Packet::SubscribeAck { packet_id, status } => v5::Packet::SubscribeAck(v5::SubscribeAck {
            packet_id,
            properties: Vec::new(),
            reason_string: None,
            status: status
                .into_iter()
                .map(|code| match code {
                    v3::SubscribeReturnCode::Success(v5::QoS::AtMostOnce) => v5::SubscribeAckReason::GrantedQos0,
                    v3::SubscribeReturnCode::Success(v5::QoS::AtLeastOnce) => v5::SubscribeAckReason::GrantedQos1,
                    v3::SubscribeReturnCode::Success(v5::QoS::ExactlyOnce) => v5::SubscribeAckReason::GrantedQos2,
                    v3::SubscribeReturnCode::Failure => v5::SubscribeAckReason::UnspecifiedError,
                })
                .collect(),
        }),
        v3::Packet::Unsubscribe { packet_id, topic_filters } => {
            v5::Packet::Unsubscribe(v5::Unsubscribe { packet_id, user_properties: Vec::new(), topic_filters })
        }
        v3::Packet::UnsubscribeAck { packet_id } => v5::Packet::UnsubscribeAck(v5::UnsubscribeAck {
            packet_id,
            properties: Vec::new(),
            reason_string: None,
            status: Vec::new(),
        }),
        v3::Packet::PingRequest => v5::Packet::PingRequest,
        v3::Packet::PingResponse => v5::Packet::PingResponse,
        v3::Packet::Disconnect => v5::Packet::Disconnect(v5::Disconnect::default()),
    }
}

fn connack_reason_from_v3(code: v3::ConnectAckReason) -> v5::ConnectAckReason {
    match code {
        v3::ConnectAckReason::ConnectionAccepted => v5::ConnectAckReason::Success,
        v3::ConnectAckReason::UnacceptableProtocolVersion => v5::ConnectAckReason::UnsupportedProtocolVersion,
        v3::ConnectAckReason::IdentifierRejected => v5::ConnectAckReason::ClientIdentifierNotValid,
        v3::ConnectAckReason::ServiceUnavailable => v5::ConnectAckReason::ServerUnavailable,
        v3::ConnectAckReason::BadUserNameOrPassword => v5::ConnectAckReason::BadUserNameOrPassword,
        v3::ConnectAckReason::NotAuthorized => v5::ConnectAckReason::NotAuthorized,
    }
}

fn connack_reason_to_v3(code: v5::ConnectAckReason) -> v3::ConnectAckReason {
    match code {
        v5::ConnectAckReason::Success => v3::ConnectAckReason::ConnectionAccepted,
        v5::ConnectAckReason::UnsupportedProtocolVersion => v3::ConnectAckReason::UnacceptableProtocolVersion,
        v5::ConnectAckReason::ClientIdentifierNotValid => v3::ConnectAckReason::IdentifierRejected,
        v5::ConnectAckReason::BadUserNameOrPassword => v3::ConnectAckReason::BadUserNameOrPassword,
        v5::ConnectAckReason::NotAuthorized | v5::ConnectAckReason::Banned => v3::ConnectAckReason::NotAuthorized,
        _ => v3::ConnectAckReason::ServiceUnavailable,
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;

    use super::*;
    use crate::types::QoS;

    fn id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    #[test]
    fn test_publish_properties_dropped() {
        let mut publish = v5::Publish::new("t", Bytes::from_static(b"p"), QoS::AtLeastOnce, false);
        publish.packet_id = Some(id(1));
        publish.properties = Some(v5::PublishProperties { topic_alias: Some(2), ..Default::default() });
        let v3::Packet::Publish(p) = to_v3(publish.into()).unwrap() else { panic!("expected publish") };
        assert!(p.properties.is_none());
        assert_eq!(p.packet_id, Some(id(1)));
    }

    #[test]
    fn test_connect_keeps_credentials() {
        let mut connect = v5::Connect::default().client_id("c");
        connect.clean_start = true;
        connect.username = Some("u".into());
        connect.session_expiry_interval_secs = 30;
        let v3::Packet::Connect(c) = to_v3(connect.into()).unwrap() else { panic!("expected connect") };
        assert_eq!(c.protocol, Protocol(MQTT_LEVEL_311));
        assert!(c.clean_session);
        assert_eq!(c.username.as_deref(), Some("u"));
    }

    #[test]
    fn test_suback_codes() {
        let pkt = from_v3(v3::Packet::SubscribeAck {
            packet_id: id(4),
            status: vec![v3::SubscribeReturnCode::Success(QoS::ExactlyOnce), v3::SubscribeReturnCode::Failure],
        });
        let v5::Packet::SubscribeAck(ack) = pkt else { panic!("expected suback") };
        assert_eq!(ack.status, vec![v5::SubscribeAckReason::GrantedQos2, v5::SubscribeAckReason::UnspecifiedError]);
        assert!(ack.status[1].is_error());
    }

    #[test]
    fn test_connack_refused() {
        let pkt = from_v3(v3::Packet::ConnectAck(v3::ConnectAck {
            return_code: v3::ConnectAckReason::BadUserNameOrPassword,
            session_present: false,
        }));
        let v5::Packet::ConnectAck(ack) = pkt else { panic!("expected connack") };
        assert_eq!(ack.reason_code, v5::ConnectAckReason::BadUserNameOrPassword);
        assert_eq!(ack.topic_alias_max, 0);
        assert_eq!(ack.receive_max.get(), 65535);
    }

    #[test]
    fn test_auth_has_no_v3_form() {
        assert!(matches!(to_v3(v5::Packet::Auth(v5::Auth::default())), Err(EncodeError::UnsupportedVersion)));
    }
}
