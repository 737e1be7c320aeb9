use bytes::{BufMut, BytesMut};
use bytestring::ByteString;

use super::packet::*;
use crate::error::EncodeError;
use crate::types::{ConnectFlags, QoS, WILL_QOS_SHIFT};
use crate::utils::{write_variable_length, Encode};

impl Packet {
    /// Remaining length of the packet once encoded.
    pub(crate) fn encoded_size(&self) -> usize {
        match self {
            Packet::Connect(connect) => connect.encoded_size(),
            Packet::Publish(p) => {
                let packet_id = if p.qos == QoS::AtMostOnce { 0 } else { 2 };
                p.topic.encoded_size() + packet_id + p.payload.len()
            }
            Packet::ConnectAck(_)
            | Packet::PublishAck { .. }
            | Packet::PublishReceived { .. }
            | Packet::PublishRelease { .. }
            | Packet::PublishComplete { .. }
            | Packet::UnsubscribeAck { .. } => 2,
            Packet::Subscribe { topic_filters, .. } => {
                2 + topic_filters.iter().map(|(filter, _)| filter.encoded_size() + 1).sum::<usize>()
            }
            Packet::SubscribeAck { status, .. } => 2 + status.len(),
            Packet::Unsubscribe { topic_filters, .. } => {
                2 + topic_filters.iter().map(ByteString::encoded_size).sum::<usize>()
            }
            Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => 0,
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut, size: u32) -> Result<(), EncodeError> {
        dst.put_u8(self.first_byte());
        write_variable_length(size, dst)?;
        match self {
            Packet::Connect(connect) => connect.encode(dst),
            Packet::ConnectAck(ack) => {
                dst.put_u8(ack.session_present as u8);
                dst.put_u8(ack.return_code.into());
                Ok(())
            }
            Packet::Publish(p) => {
                p.topic.encode(dst)?;
                match (p.qos, p.packet_id) {
                    (QoS::AtMostOnce, None) => (),
                    (QoS::AtMostOnce, Some(_)) => return Err(EncodeError::MalformedPacket),
                    (_, Some(packet_id)) => packet_id.encode(dst)?,
                    (_, None) => return Err(EncodeError::PacketIdRequired),
                }
                dst.put_slice(&p.payload);
                Ok(())
            }
            Packet::PublishAck { packet_id }
            | Packet::PublishReceived { packet_id }
            | Packet::PublishRelease { packet_id }
            | Packet::PublishComplete { packet_id }
            | Packet::UnsubscribeAck { packet_id } => packet_id.encode(dst),
            Packet::Subscribe { packet_id, topic_filters } => {
                packet_id.encode(dst)?;
                for (filter, qos) in topic_filters {
                    filter.encode(dst)?;
                    dst.put_u8((*qos).into());
                }
                Ok(())
            }
            Packet::SubscribeAck { packet_id, status } => {
                packet_id.encode(dst)?;
                dst.extend(status.iter().map(|code| u8::from(*code)));
                Ok(())
            }
            Packet::Unsubscribe { packet_id, topic_filters } => {
                packet_id.encode(dst)?;
                topic_filters.iter().try_for_each(|filter| filter.encode(dst))
            }
            Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => Ok(()),
        }
    }
}

impl Connect {
    fn encoded_size(&self) -> usize {
        // protocol name, level, flags and keep alive
        let mut size = 2 + self.protocol.name().len() + 1 + 1 + 2;
        size += self.client_id.encoded_size();
        if let Some(will) = &self.last_will {
            size += will.topic.encoded_size() + will.message.encoded_size();
        }
        size += self.username.as_ref().map_or(0, |u| u.encoded_size());
        size += self.password.as_ref().map_or(0, |p| p.encoded_size());
        size
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let mut flags = ConnectFlags::empty();
        flags.set(ConnectFlags::USERNAME, self.username.is_some());
        flags.set(ConnectFlags::PASSWORD, self.password.is_some());
        flags.set(ConnectFlags::CLEAN_START, self.clean_session);
        if let Some(will) = &self.last_will {
            flags |= ConnectFlags::WILL;
            flags.set(ConnectFlags::WILL_RETAIN, will.retain);
            flags |= ConnectFlags::from_bits_truncate(u8::from(will.qos) << WILL_QOS_SHIFT);
        }

        self.protocol.name().as_bytes().encode(dst)?;
        dst.put_u8(self.protocol.level());
        dst.put_u8(flags.bits());
        dst.put_u16(self.keep_alive);
        self.client_id.encode(dst)?;
        if let Some(will) = &self.last_will {
            will.topic.encode(dst)?;
            will.message.encode(dst)?;
        }
        if let Some(username) = &self.username {
            username.encode(dst)?;
        }
        if let Some(password) = &self.password {
            password.encode(dst)?;
        }
        Ok(())
    }
}
