use std::num::NonZeroU16;

use bytes::{Buf, Bytes};
use bytestring::ByteString;

use super::packet::{Connect, ConnectAck, LastWill, Packet, Publish, SubscribeReturnCode};
use crate::error::DecodeError;
use crate::types::{
    packet_type, ConnectAckFlags, ConnectFlags, Protocol, QoS, MQISDP, MQTT, MQTT_LEVEL_31, MQTT_LEVEL_311,
    WILL_QOS_SHIFT,
};
use crate::utils::Decode;

pub(crate) fn decode_packet(mut src: Bytes, first_byte: u8) -> Result<Packet, DecodeError> {
    let pkt = match first_byte {
        packet_type::CONNECT => Connect::decode(&mut src)?.into(),
        packet_type::CONNACK => Packet::ConnectAck(decode_connect_ack(&mut src)?),
        packet_type::PUBLISH_START..=packet_type::PUBLISH_END => {
            return decode_publish(src, first_byte & 0b0000_1111).map(Packet::Publish)
        }
        packet_type::PUBACK => Packet::PublishAck { packet_id: NonZeroU16::decode(&mut src)? },
        packet_type::PUBREC => Packet::PublishReceived { packet_id: NonZeroU16::decode(&mut src)? },
        packet_type::PUBREL => Packet::PublishRelease { packet_id: NonZeroU16::decode(&mut src)? },
        packet_type::PUBCOMP => Packet::PublishComplete { packet_id: NonZeroU16::decode(&mut src)? },
        packet_type::SUBSCRIBE => {
            let packet_id = NonZeroU16::decode(&mut src)?;
            let mut topic_filters = Vec::new();
            while src.has_remaining() {
                let filter = ByteString::decode(&mut src)?;
                ensure!(src.has_remaining(), DecodeError::InvalidLength);
                topic_filters.push((filter, QoS::try_from(src.get_u8())?));
            }
            ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket("subscribe without topic filters"));
            Packet::Subscribe { packet_id, topic_filters }
        }
        packet_type::SUBACK => {
            let packet_id = NonZeroU16::decode(&mut src)?;
            let status = src
                .split_off(0)
                .iter()
                .map(|code| match *code {
                    SubscribeReturnCode::FAILURE => Ok(SubscribeReturnCode::Failure),
                    code => QoS::try_from(code).map(SubscribeReturnCode::Success),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Packet::SubscribeAck { packet_id, status }
        }
        packet_type::UNSUBSCRIBE => {
            let packet_id = NonZeroU16::decode(&mut src)?;
            let mut topic_filters = Vec::new();
            while src.has_remaining() {
                topic_filters.push(ByteString::decode(&mut src)?);
            }
            Packet::Unsubscribe { packet_id, topic_filters }
        }
        packet_type::UNSUBACK => Packet::UnsubscribeAck { packet_id: NonZeroU16::decode(&mut src)? },
        packet_type::PINGREQ => Packet::PingRequest,
        packet_type::PINGRESP => Packet::PingResponse,
        packet_type::DISCONNECT => Packet::Disconnect,
        _ => return Err(DecodeError::UnsupportedPacketType),
    };
    // everything but PUBLISH has a fixed layout
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok(pkt)
}

impl Connect {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let name = Bytes::decode(src)?;
        ensure!(name == MQTT || name == MQISDP, DecodeError::InvalidProtocol);
        ensure!(src.remaining() >= 4, DecodeError::InvalidLength);
        let level = src.get_u8();
        ensure!(level == MQTT_LEVEL_311 || level == MQTT_LEVEL_31, DecodeError::UnsupportedProtocolLevel);
        let flags = ConnectFlags::from_bits(src.get_u8())
            .ok_or(DecodeError::MalformedPacket("connect reserved flag is set"))?;
        let keep_alive = src.get_u16();

        let client_id = ByteString::decode(src)?;
        let last_will = if flags.contains(ConnectFlags::WILL) {
            Some(LastWill {
                qos: QoS::try_from((flags & ConnectFlags::WILL_QOS).bits() >> WILL_QOS_SHIFT)?,
                retain: flags.contains(ConnectFlags::WILL_RETAIN),
                topic: ByteString::decode(src)?,
                message: Bytes::decode(src)?,
            })
        } else {
            None
        };
        let username =
            if flags.contains(ConnectFlags::USERNAME) { Some(ByteString::decode(src)?) } else { None };
        let password = if flags.contains(ConnectFlags::PASSWORD) { Some(Bytes::decode(src)?) } else { None };

        Ok(Connect {
            protocol: Protocol(level),
            clean_session: flags.contains(ConnectFlags::CLEAN_START),
            keep_alive,
            last_will,
            client_id,
            username,
            password,
        })
    }
}

fn decode_connect_ack(src: &mut Bytes) -> Result<ConnectAck, DecodeError> {
    ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
    let flags = ConnectAckFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnAckReservedFlagSet)?;
    Ok(ConnectAck {
        return_code: src.get_u8().try_into()?,
        session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
    })
}

fn decode_publish(mut src: Bytes, flags: u8) -> Result<Publish, DecodeError> {
    let topic = ByteString::decode(&mut src)?;
    let qos = QoS::try_from((flags & 0b0110) >> 1)?;
    let packet_id = if qos == QoS::AtMostOnce { None } else { Some(NonZeroU16::decode(&mut src)?) };
    Ok(Publish {
        dup: flags & 0b1000 != 0,
        retain: flags & 0b0001 != 0,
        qos,
        topic,
        packet_id,
        payload: src,
        properties: None,
    })
}
