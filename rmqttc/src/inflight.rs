use std::collections::BTreeMap;
use std::num::NonZeroU16;

use itertools::Itertools;

use rmqttc_codec::types::{Publish, QoS};
use rmqttc_codec::v5::{
    DisconnectReasonCode, PublishAck2, PublishAck2Reason, PublishAckReason, Subscribe, SubscribeAck,
    Unsubscribe, UnsubscribeAck,
};
use rmqttc_conf::TopicAliasPolicy;

use crate::client::{PublishResult, Responder};
use crate::error::{MqttError, Result};

/// SUBSCRIBE/UNSUBSCRIBE requests awaiting their acknowledgment, bounded apart from publishes.
pub const MAX_SUB_PENDING: usize = 10;

pub type PacketId = u16;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum MomentStatus {
    /// QoS 1 sent, waiting for PUBACK
    UnAck,
    /// QoS 2 sent, waiting for PUBREC
    UnReceived,
    /// PUBREL sent, waiting for PUBCOMP
    UnComplete,
}

#[derive(Debug)]
pub struct OutInflightMessage {
    /// Publish as submitted, before any topic alias rewriting
    pub publish: Publish,
    pub policy: TopicAliasPolicy,
    pub status: MomentStatus,
    pub(crate) responder: Option<Responder<PublishResult>>,
}

impl OutInflightMessage {
    #[inline]
    pub fn new(publish: Publish, policy: TopicAliasPolicy, responder: Option<Responder<PublishResult>>) -> Self {
        let status = if publish.qos == QoS::ExactlyOnce { MomentStatus::UnReceived } else { MomentStatus::UnAck };
        Self { publish, policy, status, responder }
    }

    #[inline]
    pub fn packet_id(&self) -> Option<NonZeroU16> {
        self.publish.packet_id
    }

    pub(crate) fn respond(self, result: Result<PublishResult>) {
        if let Some(tx) = self.responder {
            let _ = tx.send(result);
        }
    }
}

#[derive(Debug)]
pub enum PendingRequest {
    Subscribe(Subscribe, Option<Responder<SubscribeAck>>),
    Unsubscribe(Unsubscribe, Option<Responder<UnsubscribeAck>>),
}

/// What has to go on the wire again after a session was resumed.
#[derive(Debug, PartialEq, Eq)]
pub enum Resend {
    Publish(Box<Publish>, TopicAliasPolicy),
    Release(PublishAck2),
}

/// Outgoing flows keyed by packet identifier.
///
/// Publishes and subscription requests share one identifier space; the number of unacknowledged
/// publishes is capped by the send quota granted in CONNACK.
#[derive(Debug)]
pub struct OutInflight {
    cap: usize,
    next: PacketId,
    publishes: BTreeMap<PacketId, OutInflightMessage>,
    requests: BTreeMap<PacketId, PendingRequest>,
}

impl OutInflight {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap, next: 1, publishes: BTreeMap::new(), requests: BTreeMap::new() }
    }

    #[inline]
    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap;
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.publishes.len() < self.cap
    }

    #[inline]
    pub fn has_request_credit(&self) -> bool {
        self.requests.len() < MAX_SUB_PENDING
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.publishes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.publishes.is_empty()
    }

    #[inline]
    pub fn requests_len(&self) -> usize {
        self.requests.len()
    }

    #[inline]
    fn in_use(&self, packet_id: PacketId) -> bool {
        self.publishes.contains_key(&packet_id) || self.requests.contains_key(&packet_id)
    }

    /// Next free identifier after the last one handed out, wrapping after 65535.
    pub fn next_id(&mut self) -> Option<NonZeroU16> {
        for _ in 0..u16::MAX {
            let packet_id = self.next;
            self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
            if !self.in_use(packet_id) {
                return NonZeroU16::new(packet_id);
            }
        }
        None
    }

    #[inline]
    pub fn push_back(&mut self, m: OutInflightMessage) -> Result<()> {
        let Some(packet_id) = m.packet_id() else {
            log::warn!("packet_id is None, inflight message: {:?}", m.publish);
            return Err(MqttError::Encode(rmqttc_codec::error::EncodeError::PacketIdRequired));
        };
        self.publishes.insert(packet_id.get(), m);
        Ok(())
    }

    #[inline]
    pub fn get(&self, packet_id: PacketId) -> Option<&OutInflightMessage> {
        self.publishes.get(&packet_id)
    }

    #[inline]
    pub fn remove(&mut self, packet_id: PacketId) -> Option<OutInflightMessage> {
        self.publishes.remove(&packet_id)
    }

    #[inline]
    pub fn update_status(&mut self, packet_id: PacketId, s: MomentStatus) {
        if let Some(m) = self.publishes.get_mut(&packet_id) {
            m.status = s;
        }
    }

    #[inline]
    pub fn push_request(&mut self, packet_id: NonZeroU16, req: PendingRequest) {
        self.requests.insert(packet_id.get(), req);
    }

    #[inline]
    pub fn remove_request(&mut self, packet_id: PacketId) -> Option<PendingRequest> {
        self.requests.remove(&packet_id)
    }

    /// Packets to retransmit on a resumed session, in packet identifier order.
    ///
    /// Publishes not yet acknowledged are marked duplicate; flows past PUBREC resend PUBREL.
    pub fn resend(&mut self) -> Vec<Resend> {
        self.publishes
            .iter_mut()
            .map(|(packet_id, m)| match m.status {
                MomentStatus::UnAck | MomentStatus::UnReceived => {
                    m.publish.dup = true;
                    Resend::Publish(Box::new(m.publish.clone()), m.policy)
                }
                MomentStatus::UnComplete => Resend::Release(PublishAck2::new(
                    NonZeroU16::new(*packet_id).unwrap_or(NonZeroU16::MIN),
                    PublishAck2Reason::Success,
                )),
            })
            .collect_vec()
    }

    /// Subscription requests still waiting for SUBACK/UNSUBACK, in identifier order.
    pub fn pending_requests(&self) -> Vec<rmqttc_codec::v5::Packet> {
        self.requests
            .values()
            .map(|req| match req {
                PendingRequest::Subscribe(sub, _) => rmqttc_codec::v5::Packet::Subscribe(sub.clone()),
                PendingRequest::Unsubscribe(unsub, _) => rmqttc_codec::v5::Packet::Unsubscribe(unsub.clone()),
            })
            .collect_vec()
    }

    /// Empties the publish table, for a session that did not survive.
    pub fn take_all(&mut self) -> Vec<OutInflightMessage> {
        std::mem::take(&mut self.publishes).into_values().collect_vec()
    }

    pub fn take_requests(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.requests).into_values().collect_vec()
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum InStatus {
    /// QoS 1 delivered, PUBACK held until the application acknowledges
    Qos1Unacked,
    /// QoS 2 delivered, PUBREC held until the application acknowledges
    Qos2Received,
    /// PUBREC sent, waiting for PUBREL
    Qos2RecSent(PublishAckReason),
}

/// How an incoming QoS>0 publish relates to what is already tracked.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum Arrival {
    New,
    /// Resent while the application still holds it
    Duplicate,
    /// Resent after PUBREC went out, answer with the stored reason again
    Resend(PublishAckReason),
}

/// Incoming QoS 1/2 flows keyed by packet identifier, bounded by our Receive Maximum.
#[derive(Debug)]
pub struct InInflight {
    cached: BTreeMap<NonZeroU16, InStatus>,
    max_inflight: u16,
}

impl InInflight {
    pub fn new(max_inflight: u16) -> Self {
        Self { cached: BTreeMap::new(), max_inflight }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cached.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }

    #[inline]
    pub fn get(&self, pid: NonZeroU16) -> Option<InStatus> {
        self.cached.get(&pid).copied()
    }

    /// Classifies an arriving publish without recording it.
    pub fn arrive(&self, pid: NonZeroU16, qos: QoS, dup: bool) -> Result<Arrival> {
        match self.cached.get(&pid) {
            Some(status) => {
                let same_flow = matches!(
                    (qos, status),
                    (QoS::AtLeastOnce, InStatus::Qos1Unacked)
                        | (QoS::ExactlyOnce, InStatus::Qos2Received | InStatus::Qos2RecSent(_))
                );
                if !same_flow {
                    return Err(MqttError::protocol(format!("packet id {} is in use by another QoS flow", pid)));
                }
                if !dup {
                    return Err(MqttError::protocol(format!("publish {} resent without DUP", pid)));
                }
                Ok(match status {
                    InStatus::Qos2RecSent(reason) => Arrival::Resend(*reason),
                    _ => Arrival::Duplicate,
                })
            }
            None => {
                if self.cached.len() >= self.max_inflight as usize {
                    return Err(MqttError::violation(
                        DisconnectReasonCode::ReceiveMaximumExceeded,
                        format!("more than {} unacknowledged incoming publishes", self.max_inflight),
                    ));
                }
                Ok(Arrival::New)
            }
        }
    }

    #[inline]
    pub fn insert(&mut self, pid: NonZeroU16, status: InStatus) {
        self.cached.insert(pid, status);
    }

    /// Application acknowledgment; returns the packet to send, if any is still due.
    pub fn ack(&mut self, pid: NonZeroU16, qos: QoS) -> Option<InStatus> {
        match (qos, self.cached.get(&pid).copied()) {
            (QoS::AtLeastOnce, Some(InStatus::Qos1Unacked)) => {
                self.cached.remove(&pid);
                Some(InStatus::Qos1Unacked)
            }
            (QoS::ExactlyOnce, Some(InStatus::Qos2Received)) => {
                let status = InStatus::Qos2RecSent(PublishAckReason::Success);
                self.cached.insert(pid, status);
                Some(status)
            }
            _ => None,
        }
    }

    /// PUBREL arrived; the reason code for the PUBCOMP to answer with.
    pub fn release(&mut self, pid: NonZeroU16) -> Result<PublishAck2Reason> {
        match self.cached.get(&pid) {
            Some(InStatus::Qos2RecSent(_)) => {
                self.cached.remove(&pid);
                Ok(PublishAck2Reason::Success)
            }
            Some(InStatus::Qos2Received) => {
                Err(MqttError::protocol(format!("PUBREL {} before PUBREC was sent", pid)))
            }
            Some(InStatus::Qos1Unacked) => Err(MqttError::protocol(format!("PUBREL {} for a QoS 1 publish", pid))),
            None => Ok(PublishAck2Reason::PacketIdNotFound),
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.cached.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use bytes::Bytes;

    use super::*;
    use test_case::test_case;

    fn message(qos: QoS, pid: NonZeroU16) -> OutInflightMessage {
        let mut publish = Publish::new("t", Bytes::from_static(b"p"), qos, false);
        publish.packet_id = Some(pid);
        OutInflightMessage::new(publish, TopicAliasPolicy::Attempt, None)
    }

    fn pid(n: u16) -> NonZeroU16 {
        NonZeroU16::new(n).unwrap()
    }

    #[test]
    fn test_ids_unique_while_inflight() {
        let mut out = OutInflight::new(1000);
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = out.next_id().unwrap();
            assert!(seen.insert(id));
            out.push_back(message(QoS::AtLeastOnce, id)).unwrap();
        }
        assert!(!out.has_credit());
    }

    #[test]
    fn test_ids_wrap_and_skip_used() {
        let mut out = OutInflight::new(10);
        out.next = u16::MAX;
        out.push_back(message(QoS::AtLeastOnce, pid(1))).unwrap();
        assert_eq!(out.next_id(), Some(pid(u16::MAX)));
        assert_eq!(out.next_id(), Some(pid(2)));
    }

    #[test]
    fn test_ids_shared_with_requests() {
        let mut out = OutInflight::new(10);
        let id = out.next_id().unwrap();
        out.push_request(id, PendingRequest::Unsubscribe(Unsubscribe::new(id, vec!["t".into()]), None));
        out.next = 1;
        assert_eq!(out.next_id(), Some(pid(2)));
        assert_eq!(out.requests_len(), 1);
    }

    #[test]
    fn test_request_credit() {
        let mut out = OutInflight::new(10);
        for _ in 0..MAX_SUB_PENDING {
            let id = out.next_id().unwrap();
            out.push_request(id, PendingRequest::Unsubscribe(Unsubscribe::new(id, vec!["t".into()]), None));
        }
        assert!(!out.has_request_credit());
        assert!(out.has_credit());
    }

    #[test]
    fn test_resend_in_id_order_with_dup() {
        let mut out = OutInflight::new(10);
        out.push_back(message(QoS::ExactlyOnce, pid(7))).unwrap();
        out.push_back(message(QoS::AtLeastOnce, pid(3))).unwrap();
        out.push_back(message(QoS::ExactlyOnce, pid(5))).unwrap();
        out.update_status(5, MomentStatus::UnComplete);

        let resend = out.resend();
        assert_eq!(resend.len(), 3);
        match &resend[0] {
            Resend::Publish(p, _) => assert!(p.dup && p.packet_id == Some(pid(3))),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(resend[1], Resend::Release(PublishAck2::new(pid(5), PublishAck2Reason::Success)));
        match &resend[2] {
            Resend::Publish(p, _) => assert!(p.dup && p.packet_id == Some(pid(7))),
            other => panic!("unexpected {:?}", other),
        }
        assert!(out.get(3).unwrap().publish.dup);
    }

    #[test]
    fn test_take_all_empties() {
        let mut out = OutInflight::new(10);
        out.push_back(message(QoS::AtLeastOnce, pid(1))).unwrap();
        assert_eq!(out.take_all().len(), 1);
        assert!(out.is_empty());
    }

    #[test]
    fn test_incoming_receive_maximum() {
        let mut inc = InInflight::new(2);
        inc.insert(pid(1), InStatus::Qos1Unacked);
        inc.insert(pid(2), InStatus::Qos2RecSent(PublishAckReason::Success));
        let err = inc.arrive(pid(3), QoS::AtLeastOnce, false).unwrap_err();
        assert_eq!(err.to_reason_code(), DisconnectReasonCode::ReceiveMaximumExceeded);
    }

    #[test_case(InStatus::Qos1Unacked, QoS::AtLeastOnce, true, Ok(Arrival::Duplicate); "qos1_dup")]
    #[test_case(InStatus::Qos2Received, QoS::ExactlyOnce, true, Ok(Arrival::Duplicate); "qos2_held_dup")]
    #[test_case(
        InStatus::Qos2RecSent(PublishAckReason::Success), QoS::ExactlyOnce, true,
        Ok(Arrival::Resend(PublishAckReason::Success)); "qos2_rec_sent_dup"
    )]
    #[test_case(InStatus::Qos1Unacked, QoS::AtLeastOnce, false, Err(()); "resent_without_dup")]
    #[test_case(InStatus::Qos1Unacked, QoS::ExactlyOnce, true, Err(()); "qos_mismatch")]
    #[test_case(InStatus::Qos2Received, QoS::AtLeastOnce, true, Err(()); "qos_mismatch_2")]
    fn test_incoming_arrival(status: InStatus, qos: QoS, dup: bool, expected: std::result::Result<Arrival, ()>) {
        let mut inc = InInflight::new(10);
        inc.insert(pid(9), status);
        assert_eq!(inc.arrive(pid(9), qos, dup).map_err(|_| ()), expected);
    }

    #[test]
    fn test_incoming_manual_ack() {
        let mut inc = InInflight::new(10);
        inc.insert(pid(1), InStatus::Qos1Unacked);
        inc.insert(pid(2), InStatus::Qos2Received);

        assert_eq!(inc.ack(pid(1), QoS::AtLeastOnce), Some(InStatus::Qos1Unacked));
        assert_eq!(inc.ack(pid(1), QoS::AtLeastOnce), None);
        assert_eq!(inc.ack(pid(2), QoS::ExactlyOnce), Some(InStatus::Qos2RecSent(PublishAckReason::Success)));
        assert_eq!(inc.ack(pid(2), QoS::ExactlyOnce), None);
        assert_eq!(inc.len(), 1);
    }

    #[test]
    fn test_incoming_release() {
        let mut inc = InInflight::new(10);
        inc.insert(pid(4), InStatus::Qos2RecSent(PublishAckReason::Success));
        assert_eq!(inc.release(pid(4)).unwrap(), PublishAck2Reason::Success);
        assert_eq!(inc.release(pid(4)).unwrap(), PublishAck2Reason::PacketIdNotFound);

        inc.insert(pid(5), InStatus::Qos2Received);
        assert!(inc.release(pid(5)).is_err());
    }
}
