//! The connection task.
//!
//! One task per client owns the transport and every piece of protocol state. Commands from
//! [`MqttClient`](crate::MqttClient) handles, packets from the server and the keep alive,
//! connect and reconnect timers are all handled here one at a time, so nothing is shared.

use std::collections::{BTreeMap, VecDeque};
use std::future;
use std::io;
use std::num::{NonZeroU16, NonZeroU32};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use rmqttc_codec::error::EncodeError;
use rmqttc_codec::types::{Publish, QoS};
use rmqttc_codec::v5::{
    self, Auth, AuthReasonCode, ConnectAck, Disconnect, DisconnectReasonCode, LastWill, PublishAck, PublishAck2,
    PublishAck2Reason, PublishAckReason, Subscribe, SubscribeAck, SubscriptionOptions, Unsubscribe,
    UnsubscribeAck, UserProperties,
};
use rmqttc_codec::types::MAX_TOTAL_PACKET_SIZE;
use rmqttc_conf::{ClientOptions, MqttVersion, TopicAliasPolicy};

use crate::alias::{AliasUse, IncomingAliases, OutgoingAliases};
use crate::client::{Acker, Command, IncomingPublish, PublishResult, Responder};
use crate::error::{MqttError, Result};
use crate::inflight::{
    Arrival, InInflight, InStatus, MomentStatus, OutInflight, OutInflightMessage, PendingRequest, Resend,
};
use crate::listener::{Authenticator, ConnectedContext, DisconnectSource, DisconnectedContext, Listeners};
use crate::reconnect::ReconnectScheduler;
use crate::session::{ConnectionRestrictions, ConnectionState, SessionState, StateMachine};
use crate::transport::{Connector, MqttStream};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// An operation waiting for the connection or for send quota.
enum Work {
    Publish(Box<Publish>, TopicAliasPolicy, Option<Responder<PublishResult>>),
    Subscribe(Vec<(ByteString, SubscriptionOptions)>, UserProperties, Option<Responder<SubscribeAck>>),
    Unsubscribe(Vec<ByteString>, Option<Responder<UnsubscribeAck>>),
}

impl Work {
    fn fail(self, err: MqttError) {
        match self {
            Work::Publish(_, _, tx) => respond(tx, Err(err)),
            Work::Subscribe(_, _, tx) => respond(tx, Err(err)),
            Work::Unsubscribe(_, tx) => respond(tx, Err(err)),
        }
    }
}

#[inline]
fn respond<T>(tx: Option<Responder<T>>, result: Result<T>) {
    if let Some(tx) = tx {
        let _ = tx.send(result);
    }
}

/// Hand-off of incoming publishes to the [`Incoming`](crate::Incoming) stream.
struct Delivery {
    tx: mpsc::UnboundedSender<IncomingPublish>,
    manual: bool,
    demand: usize,
    // publishes read while there was no demand
    held: VecDeque<IncomingPublish>,
    limit: usize,
}

impl Delivery {
    /// Reading stops once this many publishes wait for demand.
    #[inline]
    fn saturated(&self) -> bool {
        self.manual && self.held.len() >= self.limit
    }
}

pub(crate) struct Connection {
    options: ClientOptions,
    client_id: ByteString,
    connector: Arc<dyn Connector>,
    authenticator: Option<Arc<dyn Authenticator>>,
    cmd_tx: mpsc::WeakSender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    state: StateMachine,
    state_tx: watch::Sender<ConnectionState>,
    session: SessionState,
    stream: Option<MqttStream>,
    restrictions: Option<ConnectionRestrictions>,
    out: OutInflight,
    inc: InInflight,
    out_aliases: OutgoingAliases,
    in_aliases: IncomingAliases,
    subscriptions: BTreeMap<ByteString, SubscriptionOptions>,
    queue: VecDeque<Work>,
    reconnect: ReconnectScheduler,
    listeners: Listeners,
    delivery: Delivery,
    connect_waiter: Option<Responder<ConnectedContext>>,
    connect_deadline: Option<Instant>,
    clean_start_sent: bool,
    last_write: Instant,
    ping_sent: Option<Instant>,
}

impl Connection {
    pub(crate) fn new(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        cmd_tx: mpsc::WeakSender<Command>,
        cmd_rx: mpsc::Receiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        incoming_tx: mpsc::UnboundedSender<IncomingPublish>,
        listeners: Listeners,
    ) -> Self {
        let receive_maximum = options.receive_maximum.max(1);
        Self {
            client_id: ByteString::from(options.client_id.as_str()),
            connector,
            authenticator: None,
            cmd_tx,
            cmd_rx,
            state: StateMachine::default(),
            state_tx,
            session: SessionState::new(&options),
            stream: None,
            restrictions: None,
            out: OutInflight::new(u16::MAX as usize),
            inc: InInflight::new(receive_maximum),
            out_aliases: OutgoingAliases::default(),
            in_aliases: IncomingAliases::default(),
            subscriptions: BTreeMap::new(),
            queue: VecDeque::new(),
            reconnect: ReconnectScheduler::new(&options.reconnect),
            listeners,
            delivery: Delivery {
                tx: incoming_tx,
                manual: options.manual_ack,
                demand: 0,
                held: VecDeque::new(),
                limit: receive_maximum as usize,
            },
            connect_waiter: None,
            connect_deadline: None,
            clean_start_sent: false,
            last_write: Instant::now(),
            ping_sent: None,
            options,
        }
    }

    /// Runs until every handle to the client is dropped.
    pub(crate) async fn run(mut self) {
        log::debug!("{} connection task started", self.client_id);
        loop {
            let keepalive_at = self.keepalive_deadline();
            let connect_at = self.connect_deadline;
            let reconnect_at = self.reconnect.deadline();
            let readable = !self.delivery.saturated();
            let holding = self.delivery.manual && !self.delivery.held.is_empty();

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                packet = next_packet(&mut self.stream), if readable => self.handle_incoming(packet).await,
                _ = sleep_until(keepalive_at) => self.on_keepalive().await,
                _ = sleep_until(connect_at) => self.on_connect_timeout().await,
                _ = sleep_until(reconnect_at) => self.on_reconnect_timer().await,
                _ = self.delivery.tx.closed(), if holding => {
                    if let Err(e) = self.release_held().await {
                        self.on_error(e).await;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    #[inline]
    fn is_v5(&self) -> bool {
        self.options.protocol == MqttVersion::V5
    }

    #[inline]
    fn publish_state(&self) {
        self.state_tx.send_replace(self.state.state());
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(tx, auth) => {
                if let Err(e) = self.state.connect() {
                    let _ = tx.send(Err(e));
                    return;
                }
                if auth.is_some() {
                    self.authenticator = auth;
                }
                self.reconnect.cancel();
                self.connect_waiter = Some(tx);
                self.start_connect().await;
            }
            Command::Disconnect(tx) => {
                let res = self.user_disconnect().await;
                let _ = tx.send(res);
            }
            Command::Publish(publish, policy, tx) => self.submit(Work::Publish(publish, policy, Some(tx))).await,
            Command::Subscribe(topic_filters, user_properties, tx) => {
                if topic_filters.is_empty() {
                    let _ = tx.send(Err(MqttError::Encode(EncodeError::MalformedPacket)));
                    return;
                }
                self.submit(Work::Subscribe(topic_filters, user_properties, Some(tx))).await
            }
            Command::Unsubscribe(topic_filters, tx) => {
                if topic_filters.is_empty() {
                    let _ = tx.send(Err(MqttError::Encode(EncodeError::MalformedPacket)));
                    return;
                }
                self.submit(Work::Unsubscribe(topic_filters, Some(tx))).await
            }
            Command::Request(n) => {
                if let Err(e) = self.on_request(n).await {
                    self.on_error(e).await;
                }
            }
            Command::Ack(packet_id, qos) => {
                if let Err(e) = self.on_app_ack(packet_id, qos).await {
                    self.on_error(e).await;
                }
            }
        }
    }

    /// Queues an operation; only a connection that will not come back refuses it.
    async fn submit(&mut self, work: Work) {
        match self.state.state() {
            ConnectionState::Connected => {
                self.queue.push_back(work);
                if let Err(e) = self.drain_queue().await {
                    self.on_error(e).await;
                }
            }
            ConnectionState::Connecting => self.queue.push_back(work),
            ConnectionState::Disconnected if self.reconnect.is_pending() => self.queue.push_back(work),
            _ => work.fail(MqttError::NotConnected),
        }
    }

    fn fail_queue(&mut self) {
        for work in self.queue.drain(..) {
            work.fail(MqttError::NotConnected);
        }
    }

    fn build_connect(&mut self, clean_start: bool) -> Result<v5::Connect> {
        let o = &self.options;
        if o.protocol == MqttVersion::V311 && self.client_id.is_empty() && !clean_start {
            // a v3.1.1 server rejects an empty id that asks for a persistent session
            self.client_id = ByteString::from(format!("rmqttc-{:016x}", rand::random::<u64>()));
        }
        let last_will = match &o.last_will {
            Some(w) => Some(LastWill {
                qos: QoS::try_from(w.qos).map_err(|_| MqttError::NotSupported("last will QoS"))?,
                retain: w.retain,
                topic: ByteString::from(w.topic.as_str()),
                message: Bytes::from(w.message.clone()),
                will_delay_interval_sec: None,
                correlation_data: None,
                message_expiry_interval: None,
                content_type: None,
                user_properties: UserProperties::default(),
                is_utf8_payload: None,
                response_topic: None,
            }),
            None => None,
        };
        Ok(v5::Connect {
            clean_start,
            keep_alive: o.keepalive_secs(),
            session_expiry_interval_secs: self.session.expiry_interval_secs,
            auth_method: self.authenticator.as_ref().map(|a| a.method()),
            auth_data: self.authenticator.as_ref().and_then(|a| a.initial_data()),
            request_problem_info: o.request_problem_information,
            request_response_info: o.request_response_information,
            receive_max: NonZeroU16::new(o.receive_maximum).filter(|n| n.get() != u16::MAX),
            topic_alias_max: o.topic_alias_maximum,
            user_properties: UserProperties::default(),
            max_packet_size: NonZeroU32::new(o.maximum_packet_size.as_u32())
                .filter(|n| n.get() < MAX_TOTAL_PACKET_SIZE),
            last_will,
            client_id: self.client_id.clone(),
            username: o.username.as_deref().map(ByteString::from),
            password: o.password.as_ref().map(|p| Bytes::from(p.clone())),
        })
    }

    /// Opens the transport and sends CONNECT; the state must already be `CONNECTING`.
    async fn start_connect(&mut self) {
        self.publish_state();
        let clean_start = self.session.clean_start_flag(!self.is_v5());
        let connect = match self.build_connect(clean_start) {
            Ok(connect) => connect,
            Err(e) => return self.teardown(DisconnectSource::Client, None, None, e).await,
        };

        log::debug!("{} connecting to {}, clean start: {}", self.client_id, self.options.server, clean_start);
        let tm = self.options.connect_timeout;
        let io = match time::timeout(tm, self.connector.connect(&self.options.server)).await {
            Ok(Ok(io)) => io,
            Ok(Err(e)) => return self.teardown(DisconnectSource::Transport, None, None, MqttError::Io(e)).await,
            Err(_) => return self.teardown(DisconnectSource::Transport, None, None, MqttError::Timeout).await,
        };

        let mut stream = MqttStream::new(io, self.is_v5(), self.options.maximum_packet_size.as_u32());
        if let Err(e) = stream.send(connect.into()).await {
            let source = if e.is_local() { DisconnectSource::Client } else { DisconnectSource::Transport };
            return self.teardown(source, None, None, e).await;
        }
        self.clean_start_sent = clean_start;
        self.last_write = Instant::now();
        self.connect_deadline = Some(self.last_write + tm);
        self.stream = Some(stream);
    }

    async fn on_connack(&mut self, ack: Box<ConnectAck>) -> Result<()> {
        if ack.reason_code.is_error() {
            log::warn!("{} connection refused, {}", self.client_id, ack.reason_code.reason());
            let err = MqttError::ConnectRefused(ack.reason_code);
            self.teardown(DisconnectSource::Server, None, ack.server_reference.clone(), err).await;
            return Ok(());
        }

        let session_present = self.session.on_connack(self.clean_start_sent, ack.session_present)?;
        match &ack.assigned_client_id {
            Some(id) => self.client_id = id.clone(),
            None if self.client_id.is_empty() && self.is_v5() => {
                return Err(MqttError::protocol("empty client identifier and none assigned"));
            }
            None => {}
        }

        let restrictions = ConnectionRestrictions::new(&self.options, &ack);
        if let Some(stream) = self.stream.as_mut() {
            stream.set_max_outbound_size(restrictions.maximum_packet_size);
        }
        self.out.set_cap(restrictions.send_maximum as usize);
        self.out_aliases.reset(restrictions.topic_alias_maximum);
        self.in_aliases.reset(restrictions.incoming_topic_alias_maximum);
        self.state.connected()?;
        self.connect_deadline = None;
        self.ping_sent = None;
        self.restrictions = Some(restrictions.clone());
        self.reconnect.reset();
        self.publish_state();
        log::info!(
            "{} connected to {}, session present: {}, send quota: {}",
            self.client_id,
            self.options.server,
            session_present,
            restrictions.send_maximum
        );

        if session_present {
            self.resend().await?;
        } else {
            self.expire_session();
        }

        let ctx = ConnectedContext { client_id: self.client_id.clone(), session_present, restrictions };
        if let Some(tx) = self.connect_waiter.take() {
            let _ = tx.send(Ok(ctx.clone()));
        }
        self.listeners.connected(&ctx);
        self.drain_queue().await
    }

    /// Retransmits the unfinished flows of a resumed session, in packet identifier order.
    async fn resend(&mut self) -> Result<()> {
        for resend in self.out.resend() {
            match resend {
                Resend::Publish(publish, policy) => {
                    let Some(packet_id) = publish.packet_id else {
                        continue;
                    };
                    if let Err(e) = self.write_publish(*publish, policy).await {
                        if !e.is_local() {
                            return Err(e);
                        }
                        if let Some(m) = self.out.remove(packet_id.get()) {
                            m.respond(Err(e));
                        }
                    }
                }
                Resend::Release(release) => self.write(v5::Packet::PublishRelease(release)).await?,
            }
        }
        for packet in self.out.pending_requests() {
            self.write(packet).await?;
        }
        Ok(())
    }

    /// The server did not keep the session: in-flight work starts over or fails.
    fn expire_session(&mut self) {
        self.inc.clear();
        let mut front = Vec::new();
        if self.session.resubscribe_if_expired && !self.subscriptions.is_empty() {
            let topic_filters = self.subscriptions.iter().map(|(f, opts)| (f.clone(), opts.clone())).collect();
            front.push(Work::Subscribe(topic_filters, UserProperties::default(), None));
        }
        for req in self.out.take_requests() {
            front.push(match req {
                PendingRequest::Subscribe(sub, tx) => Work::Subscribe(sub.topic_filters, sub.user_properties, tx),
                PendingRequest::Unsubscribe(unsub, tx) => Work::Unsubscribe(unsub.topic_filters, tx),
            });
        }
        let expired = self.out.take_all();
        if !expired.is_empty() {
            log::info!(
                "{} session expired with {} publishes in flight, republish: {}",
                self.client_id,
                expired.len(),
                self.session.republish_if_expired
            );
        }
        for m in expired {
            if self.session.republish_if_expired {
                let mut publish = m.publish;
                publish.packet_id = None;
                publish.dup = false;
                front.push(Work::Publish(Box::new(publish), m.policy, m.responder));
            } else {
                m.respond(Err(MqttError::SessionExpired));
            }
        }
        for work in front.into_iter().rev() {
            self.queue.push_front(work);
        }
    }

    /// Sends queued work while there is quota.
    async fn drain_queue(&mut self) -> Result<()> {
        while self.state.state().is_connected() {
            let ready = match self.queue.front() {
                None => false,
                Some(Work::Publish(p, ..)) => p.qos == QoS::AtMostOnce || self.out.has_credit(),
                Some(_) => self.out.has_request_credit(),
            };
            if !ready {
                break;
            }
            let Some(work) = self.queue.pop_front() else {
                break;
            };
            if !self.dispatch(work).await? {
                break;
            }
        }
        Ok(())
    }

    /// Puts one operation on the wire; `false` if it went back to the queue.
    async fn dispatch(&mut self, work: Work) -> Result<bool> {
        match work {
            Work::Publish(mut publish, policy, tx) => {
                if let Some(r) = &self.restrictions {
                    if let Err(e) = r.check_publish(publish.qos, publish.retain) {
                        respond(tx, Err(e));
                        return Ok(true);
                    }
                }
                if publish.qos == QoS::AtMostOnce {
                    return match self.write_publish(*publish, policy).await {
                        Ok(()) => {
                            respond(tx, Ok(PublishResult::Sent));
                            Ok(true)
                        }
                        Err(e) if e.is_local() => {
                            respond(tx, Err(e));
                            Ok(true)
                        }
                        Err(e) => {
                            respond(tx, Err(MqttError::NotConnected));
                            Err(e)
                        }
                    };
                }
                let Some(packet_id) = self.out.next_id() else {
                    self.queue.push_front(Work::Publish(publish, policy, tx));
                    return Ok(false);
                };
                publish.packet_id = Some(packet_id);
                let wire = (*publish).clone();
                self.out.push_back(OutInflightMessage::new(*publish, policy, tx))?;
                if let Err(e) = self.write_publish(wire, policy).await {
                    // anything but a local failure keeps the publish for retransmission
                    if !e.is_local() {
                        return Err(e);
                    }
                    if let Some(m) = self.out.remove(packet_id.get()) {
                        m.respond(Err(e));
                    }
                }
                Ok(true)
            }
            Work::Subscribe(topic_filters, user_properties, tx) => {
                let Some(packet_id) = self.out.next_id() else {
                    self.queue.push_front(Work::Subscribe(topic_filters, user_properties, tx));
                    return Ok(false);
                };
                let mut sub = Subscribe::new(packet_id, topic_filters);
                sub.user_properties = user_properties;
                self.out.push_request(packet_id, PendingRequest::Subscribe(sub.clone(), tx));
                self.write_request(packet_id, v5::Packet::Subscribe(sub)).await
            }
            Work::Unsubscribe(topic_filters, tx) => {
                let Some(packet_id) = self.out.next_id() else {
                    self.queue.push_front(Work::Unsubscribe(topic_filters, tx));
                    return Ok(false);
                };
                let unsub = Unsubscribe::new(packet_id, topic_filters);
                self.out.push_request(packet_id, PendingRequest::Unsubscribe(unsub.clone(), tx));
                self.write_request(packet_id, v5::Packet::Unsubscribe(unsub)).await
            }
        }
    }

    async fn write_request(&mut self, packet_id: NonZeroU16, packet: v5::Packet) -> Result<bool> {
        if let Err(e) = self.write(packet).await {
            if !e.is_local() {
                return Err(e);
            }
            match self.out.remove_request(packet_id.get()) {
                Some(PendingRequest::Subscribe(_, tx)) => respond(tx, Err(e)),
                Some(PendingRequest::Unsubscribe(_, tx)) => respond(tx, Err(e)),
                None => {}
            }
        }
        Ok(true)
    }

    async fn write(&mut self, packet: v5::Packet) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(MqttError::NotConnected);
        };
        log::trace!("{} send {:?}", self.client_id, packet);
        stream.send(packet).await?;
        self.last_write = Instant::now();
        Ok(())
    }

    /// Writes a publish, topic alias applied; the stored copy keeps its full topic name.
    async fn write_publish(&mut self, mut publish: Publish, policy: TopicAliasPolicy) -> Result<()> {
        let used = if self.is_v5() { self.out_aliases.apply(&mut publish, policy) } else { AliasUse::None };
        let res = self.write(v5::Packet::Publish(Box::new(publish))).await;
        if let (Err(e), AliasUse::Established(alias)) = (&res, used) {
            if e.is_local() {
                self.out_aliases.forget(alias);
            }
        }
        res
    }

    async fn handle_incoming(&mut self, packet: Option<Result<v5::Packet>>) {
        let res = match packet {
            Some(Ok(packet)) => self.process_packet(packet).await,
            Some(Err(e)) => Err(e),
            None => Err(MqttError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server"))),
        };
        if let Err(e) = res {
            self.on_error(e).await;
        }
    }

    async fn process_packet(&mut self, packet: v5::Packet) -> Result<()> {
        log::trace!("{} recv {:?}", self.client_id, packet);
        if self.state.state() == ConnectionState::Connecting {
            return match packet {
                v5::Packet::ConnectAck(ack) => self.on_connack(ack).await,
                v5::Packet::Auth(auth) => self.on_auth(auth).await,
                v5::Packet::Disconnect(d) => {
                    self.on_server_disconnect(d).await;
                    Ok(())
                }
                other => Err(MqttError::protocol(format!("packet type {:#x} before CONNACK", other.packet_type()))),
            };
        }

        match packet {
            v5::Packet::Publish(publish) => self.on_publish(*publish).await,
            v5::Packet::PublishAck(ack) => self.on_puback(ack).await,
            v5::Packet::PublishReceived(ack) => self.on_pubrec(ack).await,
            v5::Packet::PublishRelease(release) => self.on_pubrel(release).await,
            v5::Packet::PublishComplete(complete) => self.on_pubcomp(complete).await,
            v5::Packet::SubscribeAck(ack) => self.on_suback(ack).await,
            v5::Packet::UnsubscribeAck(ack) => self.on_unsuback(ack).await,
            v5::Packet::PingResponse => {
                self.ping_sent = None;
                Ok(())
            }
            v5::Packet::Disconnect(d) => {
                self.on_server_disconnect(d).await;
                Ok(())
            }
            v5::Packet::Auth(auth) => self.on_auth(auth).await,
            other => Err(MqttError::protocol(format!("unexpected packet type {:#x}", other.packet_type()))),
        }
    }

    async fn on_server_disconnect(&mut self, d: Disconnect) {
        log::info!("{} disconnected by server, {:?} {:?}", self.client_id, d.reason_code, d.reason_string);
        let err = MqttError::ServerDisconnected(d.reason_code);
        self.teardown(DisconnectSource::Server, Some(d.reason_code), d.server_reference, err).await;
    }

    async fn on_auth(&mut self, auth: Auth) -> Result<()> {
        let Some(authenticator) = self.authenticator.clone() else {
            return Err(MqttError::protocol("AUTH without an authentication method"));
        };
        let method = authenticator.method();
        if auth.auth_method.as_ref() != Some(&method) {
            return Err(MqttError::protocol(format!("AUTH method {:?} was not requested", auth.auth_method)));
        }
        match auth.reason_code {
            AuthReasonCode::ContinueAuth => {
                let data = authenticator.on_continue(&auth)?;
                self.write(v5::Packet::Auth(Auth::continue_auth(method, data))).await
            }
            AuthReasonCode::Success => Ok(()),
            AuthReasonCode::ReAuth => Err(MqttError::protocol("AUTH with Re-authenticate from the server")),
        }
    }

    async fn on_publish(&mut self, mut publish: Publish) -> Result<()> {
        if self.is_v5() {
            self.in_aliases.resolve(&mut publish)?;
        }
        let qos = publish.qos;
        if qos == QoS::AtMostOnce {
            return self.deliver(publish, None).await;
        }
        let Some(packet_id) = publish.packet_id else {
            return Err(MqttError::protocol("QoS>0 publish without packet id"));
        };

        match self.inc.arrive(packet_id, qos, publish.dup)? {
            Arrival::Duplicate => {
                log::debug!("{} duplicate publish {} still held by the application", self.client_id, packet_id);
                Ok(())
            }
            Arrival::Resend(reason) => {
                self.write(v5::Packet::PublishReceived(PublishAck::new(packet_id, reason))).await
            }
            Arrival::New if self.delivery.manual => {
                let status = if qos == QoS::AtLeastOnce { InStatus::Qos1Unacked } else { InStatus::Qos2Received };
                self.inc.insert(packet_id, status);
                self.deliver(publish, Some((packet_id, qos))).await
            }
            Arrival::New if qos == QoS::AtLeastOnce => {
                self.deliver(publish, None).await?;
                self.write(v5::Packet::PublishAck(PublishAck::new(packet_id, PublishAckReason::Success))).await
            }
            Arrival::New => {
                self.inc.insert(packet_id, InStatus::Qos2RecSent(PublishAckReason::Success));
                self.deliver(publish, None).await?;
                self.write(v5::Packet::PublishReceived(PublishAck::new(packet_id, PublishAckReason::Success))).await
            }
        }
    }

    async fn deliver(&mut self, publish: Publish, ack: Option<(NonZeroU16, QoS)>) -> Result<()> {
        let acker = ack.map(|(packet_id, qos)| Acker { tx: self.cmd_tx.clone(), packet_id, qos });
        let item = IncomingPublish { publish, acker };
        if self.delivery.manual && self.delivery.demand == 0 && !self.delivery.tx.is_closed() {
            self.delivery.held.push_back(item);
            return Ok(());
        }
        self.hand_over(item).await
    }

    async fn hand_over(&mut self, item: IncomingPublish) -> Result<()> {
        if self.delivery.manual {
            self.delivery.demand = self.delivery.demand.saturating_sub(1);
        }
        if let Err(mpsc::error::SendError(item)) = self.delivery.tx.send(item) {
            // nobody consumes incoming publishes anymore
            if let Some(acker) = item.acker {
                self.on_app_ack(acker.packet_id, acker.qos).await?;
            }
        }
        Ok(())
    }

    async fn on_request(&mut self, n: usize) -> Result<()> {
        self.delivery.demand = self.delivery.demand.saturating_add(n);
        while self.delivery.demand > 0 {
            let Some(item) = self.delivery.held.pop_front() else {
                break;
            };
            self.hand_over(item).await?;
        }
        Ok(())
    }

    /// The stream was dropped: held publishes are acknowledged as if the application had.
    async fn release_held(&mut self) -> Result<()> {
        let held = self.delivery.held.len();
        log::debug!("{} incoming stream dropped, releasing {} held publishes", self.client_id, held);
        while let Some(item) = self.delivery.held.pop_front() {
            if let Some(acker) = item.acker {
                self.on_app_ack(acker.packet_id, acker.qos).await?;
            }
        }
        Ok(())
    }

    async fn on_app_ack(&mut self, packet_id: NonZeroU16, qos: QoS) -> Result<()> {
        let packet = match self.inc.ack(packet_id, qos) {
            Some(InStatus::Qos1Unacked) => {
                v5::Packet::PublishAck(PublishAck::new(packet_id, PublishAckReason::Success))
            }
            Some(InStatus::Qos2RecSent(reason)) => v5::Packet::PublishReceived(PublishAck::new(packet_id, reason)),
            _ => {
                log::debug!("{} publish {} already acknowledged", self.client_id, packet_id);
                return Ok(());
            }
        };
        if self.state.state().is_connected() {
            self.write(packet).await
        } else {
            Ok(())
        }
    }

    async fn on_puback(&mut self, ack: PublishAck) -> Result<()> {
        let id = ack.packet_id.get();
        if self.out.get(id).map(|m| m.status) != Some(MomentStatus::UnAck) {
            return Err(MqttError::protocol(format!("PUBACK for unknown packet id {}", id)));
        }
        if let Some(m) = self.out.remove(id) {
            if ack.reason_code.is_error() {
                m.respond(Err(MqttError::PublishAck(ack)));
            } else {
                m.respond(Ok(PublishResult::Acked(ack)));
            }
        }
        self.drain_queue().await
    }

    async fn on_pubrec(&mut self, ack: PublishAck) -> Result<()> {
        let id = ack.packet_id.get();
        match self.out.get(id).map(|m| m.status) {
            Some(MomentStatus::UnReceived) if ack.reason_code.is_error() => {
                if let Some(m) = self.out.remove(id) {
                    m.respond(Err(MqttError::PublishRec(ack)));
                }
                self.drain_queue().await
            }
            Some(MomentStatus::UnReceived) => {
                self.out.update_status(id, MomentStatus::UnComplete);
                let release = PublishAck2::new(ack.packet_id, PublishAck2Reason::Success);
                self.write(v5::Packet::PublishRelease(release)).await
            }
            Some(MomentStatus::UnComplete) => {
                let release = PublishAck2::new(ack.packet_id, PublishAck2Reason::Success);
                self.write(v5::Packet::PublishRelease(release)).await
            }
            _ => Err(MqttError::protocol(format!("PUBREC for unknown packet id {}", id))),
        }
    }

    async fn on_pubrel(&mut self, release: PublishAck2) -> Result<()> {
        let reason = self.inc.release(release.packet_id)?;
        if reason.is_error() {
            log::debug!("{} PUBREL for unknown packet id {}", self.client_id, release.packet_id);
        }
        self.write(v5::Packet::PublishComplete(PublishAck2::new(release.packet_id, reason))).await
    }

    async fn on_pubcomp(&mut self, complete: PublishAck2) -> Result<()> {
        let id = complete.packet_id.get();
        if self.out.get(id).map(|m| m.status) != Some(MomentStatus::UnComplete) {
            return Err(MqttError::protocol(format!("PUBCOMP for unknown packet id {}", id)));
        }
        if let Some(m) = self.out.remove(id) {
            if complete.reason_code.is_error() {
                m.respond(Err(MqttError::PublishComp(complete)));
            } else {
                m.respond(Ok(PublishResult::Completed(complete)));
            }
        }
        self.drain_queue().await
    }

    async fn on_suback(&mut self, ack: SubscribeAck) -> Result<()> {
        let (sub, tx) = match self.out.remove_request(ack.packet_id.get()) {
            Some(PendingRequest::Subscribe(sub, tx)) => (sub, tx),
            Some(other) => {
                self.out.push_request(ack.packet_id, other);
                return Err(MqttError::protocol(format!("SUBACK for UNSUBSCRIBE {}", ack.packet_id)));
            }
            None => return Err(MqttError::protocol(format!("SUBACK for unknown packet id {}", ack.packet_id))),
        };
        if ack.status.len() != sub.topic_filters.len() {
            let msg = format!("SUBACK has {} reason codes for {} filters", ack.status.len(), sub.topic_filters.len());
            respond(tx, Err(MqttError::protocol(msg.clone())));
            return Err(MqttError::protocol(msg));
        }
        for ((filter, opts), reason) in sub.topic_filters.into_iter().zip(ack.status.iter()) {
            if reason.is_error() {
                self.subscriptions.remove(&filter);
            } else {
                self.subscriptions.insert(filter, opts);
            }
        }
        if ack.status.iter().any(|r| r.is_error()) {
            respond(tx, Err(MqttError::SubscribeAck(ack)));
        } else {
            respond(tx, Ok(ack));
        }
        self.drain_queue().await
    }

    async fn on_unsuback(&mut self, ack: UnsubscribeAck) -> Result<()> {
        let (unsub, tx) = match self.out.remove_request(ack.packet_id.get()) {
            Some(PendingRequest::Unsubscribe(unsub, tx)) => (unsub, tx),
            Some(other) => {
                self.out.push_request(ack.packet_id, other);
                return Err(MqttError::protocol(format!("UNSUBACK for SUBSCRIBE {}", ack.packet_id)));
            }
            None => return Err(MqttError::protocol(format!("UNSUBACK for unknown packet id {}", ack.packet_id))),
        };
        // v3.1.1 UNSUBACK carries no reason codes
        if self.is_v5() && ack.status.len() != unsub.topic_filters.len() {
            let msg =
                format!("UNSUBACK has {} reason codes for {} filters", ack.status.len(), unsub.topic_filters.len());
            respond(tx, Err(MqttError::protocol(msg.clone())));
            return Err(MqttError::protocol(msg));
        }
        for (i, filter) in unsub.topic_filters.iter().enumerate() {
            if ack.status.get(i).map_or(true, |r| !r.is_error()) {
                self.subscriptions.remove(filter);
            }
        }
        if ack.status.iter().any(|r| r.is_error()) {
            respond(tx, Err(MqttError::UnsubscribeAck(ack)));
        } else {
            respond(tx, Ok(ack));
        }
        self.drain_queue().await
    }

    fn keepalive_deadline(&self) -> Option<Instant> {
        if !self.state.state().is_connected() {
            return None;
        }
        let keepalive = self.restrictions.as_ref()?.keepalive;
        if keepalive == 0 {
            return None;
        }
        let keepalive = Duration::from_secs(keepalive as u64);
        Some(match self.ping_sent {
            Some(at) => at + keepalive,
            None => self.last_write + keepalive,
        })
    }

    async fn on_keepalive(&mut self) {
        if self.ping_sent.is_some() {
            self.on_error(MqttError::KeepAliveTimeout).await;
            return;
        }
        match self.write(v5::Packet::PingRequest).await {
            Ok(()) => self.ping_sent = Some(Instant::now()),
            Err(e) => self.on_error(e).await,
        }
    }

    async fn on_connect_timeout(&mut self) {
        self.connect_deadline = None;
        log::warn!("{} no CONNACK within {:?}", self.client_id, self.options.connect_timeout);
        self.teardown(DisconnectSource::Transport, None, None, MqttError::Timeout).await;
    }

    async fn on_reconnect_timer(&mut self) {
        if !self.reconnect.fire() {
            return;
        }
        if self.state.connect().is_ok() {
            log::info!("{} reconnect attempt {}", self.client_id, self.reconnect.attempts());
            self.start_connect().await;
        }
    }

    async fn user_disconnect(&mut self) -> Result<()> {
        let had_pending = self.reconnect.cancel();
        match self.state.state() {
            ConnectionState::Connected => {
                self.state.disconnecting();
                self.publish_state();
                if let Err(e) = self.write(Disconnect::default().into()).await {
                    log::debug!("{} sending DISCONNECT, {}", self.client_id, e);
                }
                let code = Some(DisconnectReasonCode::NormalDisconnection);
                self.teardown(DisconnectSource::User, code, None, MqttError::Closed).await;
                Ok(())
            }
            ConnectionState::Connecting => {
                self.teardown(DisconnectSource::User, None, None, MqttError::Closed).await;
                Ok(())
            }
            ConnectionState::Disconnected if had_pending => {
                self.fail_queue();
                Ok(())
            }
            _ => Err(MqttError::NotConnected),
        }
    }

    /// Closes the connection because of `err`, telling the server why when the protocol allows.
    async fn on_error(&mut self, err: MqttError) {
        match err {
            MqttError::Io(_) | MqttError::Timeout => {
                log::warn!("{} transport failed, {}", self.client_id, err);
                self.teardown(DisconnectSource::Transport, None, None, err).await
            }
            err => {
                let code = err.to_reason_code();
                log::warn!("{} closing connection, {}", self.client_id, err);
                if self.state.state().is_connected() {
                    self.state.disconnecting();
                    self.publish_state();
                    let disconnect = Disconnect::new(code).with_reason_string(err.to_string());
                    if let Err(e) = self.write(disconnect.into()).await {
                        log::debug!("{} sending DISCONNECT, {}", self.client_id, e);
                    }
                }
                self.teardown(DisconnectSource::Client, Some(code), None, err).await
            }
        }
    }

    /// Drops the transport and enters `DISCONNECTED`, scheduling a reconnect unless the user
    /// asked for it or an explicit connect failed.
    async fn teardown(
        &mut self,
        source: DisconnectSource,
        reason_code: Option<DisconnectReasonCode>,
        server_reference: Option<ByteString>,
        err: MqttError,
    ) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(CLOSE_TIMEOUT).await {
                log::debug!("{} closing transport, {}", self.client_id, e);
            }
        }
        self.connect_deadline = None;
        self.ping_sent = None;
        self.restrictions = None;
        self.state.disconnected();
        self.publish_state();

        let reason = err.to_string();
        let reconnect_delay = match self.connect_waiter.take() {
            Some(tx) => {
                let _ = tx.send(Err(err));
                None
            }
            None if source != DisconnectSource::User => self.reconnect.schedule(),
            None => None,
        };
        if reconnect_delay.is_none() {
            self.fail_queue();
        }
        log::info!(
            "{} disconnected ({:?}), {}, reconnect in {:?}",
            self.client_id,
            source,
            reason,
            reconnect_delay
        );
        self.listeners.disconnected(&DisconnectedContext {
            source,
            reason_code,
            reason,
            server_reference,
            reconnect_delay,
            attempts: self.reconnect.attempts(),
        });
    }

    async fn shutdown(&mut self) {
        if self.state.state().is_connected() {
            if let Err(e) = self.write(Disconnect::default().into()).await {
                log::debug!("{} sending DISCONNECT, {}", self.client_id, e);
            }
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(CLOSE_TIMEOUT).await;
        }
        self.state.disconnected();
        self.publish_state();
        for work in self.queue.drain(..) {
            work.fail(MqttError::Closed);
        }
        for m in self.out.take_all() {
            m.respond(Err(MqttError::Closed));
        }
        log::debug!("{} connection task stopped", self.client_id);
    }
}

async fn next_packet(stream: &mut Option<MqttStream>) -> Option<Result<v5::Packet>> {
    match stream {
        Some(stream) => stream.recv().await,
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Framed;

    use super::*;
    use crate::client::MqttClient;
    use crate::listener::Listener;
    use crate::transport::Io;
    use rmqttc_codec::v3;
    use rmqttc_codec::v5::{ConnectAckReason, PublishProperties, SubscribeAckReason};
    use rmqttc_conf::ReconnectOptions;

    struct DuplexConnector(Mutex<VecDeque<DuplexStream>>);

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self, _server: &str) -> io::Result<Box<dyn Io>> {
            match self.0.lock().pop_front() {
                Some(io) => Ok(Box::new(io)),
                None => Err(io::ErrorKind::ConnectionRefused.into()),
            }
        }
    }

    struct Broker {
        io: Framed<DuplexStream, v5::Codec>,
    }

    impl Broker {
        async fn recv(&mut self) -> v5::Packet {
            let next = time::timeout(Duration::from_secs(5), self.io.next()).await.expect("nothing received");
            next.expect("client closed the stream").expect("undecodable packet").0
        }

        async fn recv_publish(&mut self) -> Publish {
            match self.recv().await {
                v5::Packet::Publish(p) => *p,
                other => panic!("expected PUBLISH, got {:?}", other),
            }
        }

        async fn send(&mut self, packet: v5::Packet) {
            self.io.send(packet).await.unwrap();
        }

        async fn accept(&mut self, ack: ConnectAck) -> v5::Connect {
            let connect = match self.recv().await {
                v5::Packet::Connect(connect) => *connect,
                other => panic!("expected CONNECT, got {:?}", other),
            };
            self.send(v5::Packet::ConnectAck(Box::new(ack))).await;
            connect
        }
    }

    fn pid(n: u16) -> NonZeroU16 {
        NonZeroU16::new(n).unwrap()
    }

    fn options() -> ClientOptions {
        ClientOptions {
            client_id: "test".into(),
            reconnect: ReconnectOptions { enable: false, ..Default::default() },
            ..Default::default()
        }
    }

    fn reconnecting() -> ReconnectOptions {
        ReconnectOptions {
            enable: true,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn setup(options: ClientOptions, brokers: usize) -> (MqttClient, Vec<Broker>) {
        let mut streams = VecDeque::new();
        let mut servers = Vec::new();
        for _ in 0..brokers {
            let (client, server) = tokio::io::duplex(64 * 1024);
            streams.push_back(client);
            servers.push(Broker { io: Framed::new(server, v5::Codec::new(0, 0)) });
        }
        (MqttClient::with_connector(options, DuplexConnector(Mutex::new(streams))), servers)
    }

    async fn connect(client: &MqttClient, broker: &mut Broker, ack: ConnectAck) -> (ConnectedContext, v5::Connect) {
        let c = client.clone();
        let handle = tokio::spawn(async move { c.connect().await });
        let connect = broker.accept(ack).await;
        (handle.await.unwrap().unwrap(), connect)
    }

    fn publish(topic: &str, payload: &'static str, qos: QoS) -> Publish {
        Publish::new(topic, Bytes::from_static(payload.as_bytes()), qos, false)
    }

    #[tokio::test]
    async fn test_connect_and_publish_qos1() {
        let (client, mut brokers) = setup(options(), 1);
        let broker = &mut brokers[0];
        let (ctx, connect) = connect(&client, broker, ConnectAck::default()).await;
        assert_eq!(connect.client_id, "test");
        assert!(connect.clean_start);
        assert_eq!(connect.keep_alive, 60);
        assert!(!ctx.session_present);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(matches!(client.connect().await, Err(MqttError::AlreadyConnected)));

        let c = client.clone();
        let res = tokio::spawn(async move { c.publish(publish("a/b", "hi", QoS::AtLeastOnce)).await });
        let p = broker.recv_publish().await;
        assert_eq!(p.packet_id, Some(pid(1)));
        assert_eq!(p.topic, "a/b");
        assert!(!p.dup);
        broker.send(v5::Packet::PublishAck(PublishAck::new(pid(1), PublishAckReason::Success))).await;
        assert!(matches!(res.await.unwrap(), Ok(PublishResult::Acked(_))));

        client.disconnect().await.unwrap();
        assert!(matches!(broker.recv().await, v5::Packet::Disconnect(d) if d.reason_code == DisconnectReasonCode::NormalDisconnection));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(client.disconnect().await, Err(MqttError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (client, mut brokers) = setup(options(), 1);
        let c = client.clone();
        let handle = tokio::spawn(async move { c.connect().await });
        brokers[0].accept(ConnectAck { reason_code: ConnectAckReason::NotAuthorized, ..Default::default() }).await;
        assert!(matches!(
            handle.await.unwrap(),
            Err(MqttError::ConnectRefused(ConnectAckReason::NotAuthorized))
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let err = client.publish(publish("t", "x", QoS::AtMostOnce)).await.unwrap_err();
        assert!(matches!(err, MqttError::NotConnected));
    }

    #[tokio::test]
    async fn test_subscribe_partially_rejected() {
        let (client, mut brokers) = setup(options(), 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;

        let c = client.clone();
        let res = tokio::spawn(async move {
            c.subscribe(vec![
                ("a/#".into(), SubscriptionOptions { qos: QoS::AtLeastOnce, ..Default::default() }),
                ("secret".into(), SubscriptionOptions::default()),
            ])
            .await
        });
        let sub = match broker.recv().await {
            v5::Packet::Subscribe(sub) => sub,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        assert_eq!(sub.topic_filters.len(), 2);
        broker
            .send(v5::Packet::SubscribeAck(SubscribeAck {
                packet_id: sub.packet_id,
                properties: UserProperties::default(),
                reason_string: None,
                status: vec![SubscribeAckReason::GrantedQos1, SubscribeAckReason::NotAuthorized],
            }))
            .await;
        match res.await.unwrap() {
            Err(MqttError::SubscribeAck(ack)) => assert_eq!(ack.status[1], SubscribeAckReason::NotAuthorized),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_qos2() {
        let (client, mut brokers) = setup(options(), 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;

        let c = client.clone();
        let res = tokio::spawn(async move { c.publish(publish("t", "x", QoS::ExactlyOnce)).await });
        let p = broker.recv_publish().await;
        assert_eq!(p.qos, QoS::ExactlyOnce);
        broker.send(v5::Packet::PublishReceived(PublishAck::new(pid(1), PublishAckReason::Success))).await;
        assert!(matches!(broker.recv().await, v5::Packet::PublishRelease(rel) if rel.packet_id == pid(1)));
        broker.send(v5::Packet::PublishComplete(PublishAck2::new(pid(1), PublishAck2Reason::Success))).await;
        assert!(matches!(res.await.unwrap(), Ok(PublishResult::Completed(_))));
    }

    #[tokio::test]
    async fn test_publish_above_maximum_qos() {
        let (client, mut brokers) = setup(options(), 1);
        connect(&client, &mut brokers[0], ConnectAck { max_qos: QoS::AtLeastOnce, ..Default::default() }).await;
        let err = client.publish(publish("t", "x", QoS::ExactlyOnce)).await.unwrap_err();
        assert!(matches!(err, MqttError::NotSupported(_)));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_incoming_qos2() {
        let (client, mut brokers) = setup(options(), 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;
        let mut incoming = client.incoming().unwrap();

        let mut p = publish("in", "x", QoS::ExactlyOnce);
        p.packet_id = Some(pid(3));
        broker.send(p.into()).await;
        let received = incoming.recv().await.unwrap();
        assert_eq!(received.publish.topic, "in");
        assert!(!received.needs_ack());
        assert!(matches!(broker.recv().await, v5::Packet::PublishReceived(ack) if ack.packet_id == pid(3)));

        broker.send(v5::Packet::PublishRelease(PublishAck2::new(pid(3), PublishAck2Reason::Success))).await;
        assert!(matches!(
            broker.recv().await,
            v5::Packet::PublishComplete(comp) if comp.packet_id == pid(3) && comp.reason_code == PublishAck2Reason::Success
        ));

        broker.send(v5::Packet::PublishRelease(PublishAck2::new(pid(9), PublishAck2Reason::Success))).await;
        assert!(matches!(
            broker.recv().await,
            v5::Packet::PublishComplete(comp) if comp.reason_code == PublishAck2Reason::PacketIdNotFound
        ));
    }

    #[tokio::test]
    async fn test_outgoing_topic_alias() {
        let (client, mut brokers) = setup(options(), 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck { topic_alias_max: 1, ..Default::default() }).await;

        for topic in ["a/b", "a/b", "c/d"] {
            let res = client.publish(publish(topic, "x", QoS::AtMostOnce)).await.unwrap();
            assert_eq!(res, PublishResult::Sent);
        }
        let p = broker.recv_publish().await;
        assert_eq!((p.topic.as_ref(), p.topic_alias()), ("a/b", Some(1)));
        let p = broker.recv_publish().await;
        assert_eq!((p.topic.as_ref(), p.topic_alias()), ("", Some(1)));
        let p = broker.recv_publish().await;
        assert_eq!((p.topic.as_ref(), p.topic_alias()), ("c/d", None));
    }

    #[tokio::test]
    async fn test_unknown_incoming_alias_closes() {
        let (client, mut brokers) = setup(ClientOptions { topic_alias_maximum: 2, ..options() }, 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;

        let mut p = publish("", "x", QoS::AtMostOnce);
        p.properties = Some(PublishProperties { topic_alias: Some(1), ..Default::default() });
        broker.send(p.into()).await;
        assert!(matches!(
            broker.recv().await,
            v5::Packet::Disconnect(d) if d.reason_code == DisconnectReasonCode::TopicAliasInvalid
        ));
        client.wait_for(ConnectionState::Disconnected).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_puback_closes() {
        let (client, mut brokers) = setup(options(), 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;
        broker.send(v5::Packet::PublishAck(PublishAck::new(pid(5), PublishAckReason::Success))).await;
        assert!(matches!(
            broker.recv().await,
            v5::Packet::Disconnect(d) if d.reason_code == DisconnectReasonCode::ProtocolError
        ));
    }

    #[tokio::test]
    async fn test_reconnect_resends_in_order() {
        let options = ClientOptions {
            clean_start: false,
            session_expiry_interval: Duration::from_secs(60),
            reconnect: reconnecting(),
            ..options()
        };
        let (client, mut brokers) = setup(options, 2);
        let mut second = brokers.pop().unwrap();
        let mut first = brokers.pop().unwrap();
        connect(&client, &mut first, ConnectAck::default()).await;

        let c = client.clone();
        let sent = tokio::spawn(async move {
            let publishes = ["1", "2", "3"].map(|p| c.publish(publish("t", p, QoS::AtLeastOnce)));
            futures::future::join_all(publishes).await
        });
        for id in 1..=3 {
            assert_eq!(first.recv_publish().await.packet_id, Some(pid(id)));
        }
        drop(first);
        client.wait_for(ConnectionState::Connecting).await.unwrap();

        let c = client.clone();
        let late = tokio::spawn(async move { c.publish(publish("t", "4", QoS::AtLeastOnce)).await });
        time::sleep(Duration::from_millis(50)).await;

        let connect = second.accept(ConnectAck { session_present: true, ..Default::default() }).await;
        assert!(!connect.clean_start);
        for id in 1..=3u16 {
            let p = second.recv_publish().await;
            assert!(p.dup);
            assert_eq!(p.packet_id, Some(pid(id)));
            assert_eq!(&p.payload[..], id.to_string().as_bytes());
        }
        let p = second.recv_publish().await;
        assert!(!p.dup);
        assert_eq!(&p.payload[..], b"4");
        assert_eq!(p.packet_id, Some(pid(4)));

        for id in 1..=4 {
            second.send(v5::Packet::PublishAck(PublishAck::new(pid(id), PublishAckReason::Success))).await;
        }
        assert!(sent.await.unwrap().iter().all(|r| matches!(r, Ok(PublishResult::Acked(_)))));
        assert!(matches!(late.await.unwrap(), Ok(PublishResult::Acked(_))));
    }

    #[tokio::test]
    async fn test_expired_session_resubscribes() {
        let options = ClientOptions {
            clean_start: false,
            session_expiry_interval: Duration::from_secs(60),
            reconnect: reconnecting(),
            ..options()
        };
        let (client, mut brokers) = setup(options, 2);
        let mut second = brokers.pop().unwrap();
        let mut first = brokers.pop().unwrap();
        connect(&client, &mut first, ConnectAck::default()).await;

        let c = client.clone();
        let sub = tokio::spawn(async move { c.subscribe(vec![("s/#".into(), SubscriptionOptions::default())]).await });
        let packet_id = match first.recv().await {
            v5::Packet::Subscribe(sub) => sub.packet_id,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        first
            .send(v5::Packet::SubscribeAck(SubscribeAck {
                packet_id,
                properties: UserProperties::default(),
                reason_string: None,
                status: vec![SubscribeAckReason::GrantedQos0],
            }))
            .await;
        sub.await.unwrap().unwrap();

        let c = client.clone();
        let inflight = tokio::spawn(async move { c.publish(publish("t", "x", QoS::AtLeastOnce)).await });
        first.recv_publish().await;
        drop(first);

        second.accept(ConnectAck::default()).await;
        match second.recv().await {
            v5::Packet::Subscribe(sub) => assert_eq!(sub.topic_filters[0].0, "s/#"),
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }
        assert!(matches!(inflight.await.unwrap(), Err(MqttError::SessionExpired)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timeout() {
        let (client, mut brokers) = setup(ClientOptions { keepalive: Duration::from_secs(1), ..options() }, 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;

        assert_eq!(broker.recv().await, v5::Packet::PingRequest);
        assert!(matches!(
            broker.recv().await,
            v5::Packet::Disconnect(d) if d.reason_code == DisconnectReasonCode::KeepAliveTimeout
        ));
        client.wait_for(ConnectionState::Disconnected).await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_ack_and_demand() {
        let (client, mut brokers) = setup(ClientOptions { manual_ack: true, ..options() }, 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;
        let mut incoming = client.incoming().unwrap();
        assert!(client.incoming().is_none());

        for id in [7, 8] {
            let mut p = publish("m", "x", QoS::AtLeastOnce);
            p.packet_id = Some(pid(id));
            broker.send(p.into()).await;
        }
        incoming.request(1).await.unwrap();
        let first = incoming.recv().await.unwrap();
        assert_eq!(first.publish.packet_id, Some(pid(7)));
        assert!(first.needs_ack());
        assert!(time::timeout(Duration::from_millis(100), incoming.recv()).await.is_err());

        // nothing but the marker may reach the broker before the application acks
        client.publish(publish("marker", "x", QoS::AtMostOnce)).await.unwrap();
        assert_eq!(broker.recv_publish().await.topic, "marker");
        first.ack().await.unwrap();
        assert!(matches!(broker.recv().await, v5::Packet::PublishAck(ack) if ack.packet_id == pid(7)));

        incoming.request(1).await.unwrap();
        assert_eq!(incoming.recv().await.unwrap().publish.packet_id, Some(pid(8)));
    }

    struct Disconnects(mpsc::UnboundedSender<DisconnectedContext>);

    impl Listener for Disconnects {
        fn on_disconnected(&self, ctx: &DisconnectedContext) {
            let _ = self.0.send(ctx.clone());
        }
    }

    #[tokio::test]
    async fn test_server_disconnect_schedules_reconnect() {
        let (client, mut brokers) = setup(ClientOptions { reconnect: reconnecting(), ..options() }, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.add_listener(Disconnects(tx));
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;

        let mut disconnect = Disconnect::new(DisconnectReasonCode::ServerShuttingDown);
        disconnect.server_reference = Some("other:1883".into());
        broker.send(disconnect.into()).await;

        let ctx = rx.recv().await.unwrap();
        assert_eq!(ctx.source, DisconnectSource::Server);
        assert_eq!(ctx.reason_code, Some(DisconnectReasonCode::ServerShuttingDown));
        assert_eq!(ctx.server_reference.as_deref(), Some("other:1883"));
        assert_eq!(ctx.reconnect_delay, Some(Duration::from_millis(10)));
        assert_eq!(ctx.attempts, 1);
    }

    #[tokio::test]
    async fn test_v311_session() {
        let (stream, server) = tokio::io::duplex(64 * 1024);
        let mut broker = Framed::new(server, v3::Codec::new(0));
        let options = ClientOptions { protocol: MqttVersion::V311, ..options() };
        let client = MqttClient::with_connector(options, DuplexConnector(Mutex::new(VecDeque::from([stream]))));

        let c = client.clone();
        let handle = tokio::spawn(async move { c.connect().await });
        match broker.next().await.unwrap().unwrap().0 {
            v3::Packet::Connect(connect) => {
                assert_eq!(connect.client_id, "test");
                assert!(connect.clean_session);
            }
            other => panic!("expected CONNECT, got {:?}", other),
        }
        let ack = v3::ConnectAck { return_code: v3::ConnectAckReason::ConnectionAccepted, session_present: false };
        broker.send(v3::Packet::ConnectAck(ack)).await.unwrap();
        let ctx = handle.await.unwrap().unwrap();
        assert_eq!(ctx.restrictions.topic_alias_maximum, 0);

        let c = client.clone();
        let res = tokio::spawn(async move { c.publish(publish("t", "x", QoS::ExactlyOnce)).await });
        match broker.next().await.unwrap().unwrap().0 {
            v3::Packet::Publish(p) => assert_eq!(p.packet_id, Some(pid(1))),
            other => panic!("expected PUBLISH, got {:?}", other),
        }
        broker.send(v3::Packet::PublishReceived { packet_id: pid(1) }).await.unwrap();
        assert_eq!(broker.next().await.unwrap().unwrap().0, v3::Packet::PublishRelease { packet_id: pid(1) });
        broker.send(v3::Packet::PublishComplete { packet_id: pid(1) }).await.unwrap();
        assert!(matches!(res.await.unwrap(), Ok(PublishResult::Completed(_))));
    }

    #[derive(Default)]
    struct Challenge {
        rounds: AtomicUsize,
    }

    impl Authenticator for Challenge {
        fn method(&self) -> ByteString {
            "SCRAM".into()
        }

        fn initial_data(&self) -> Option<Bytes> {
            Some(Bytes::from_static(b"first"))
        }

        fn on_continue(&self, auth: &Auth) -> Result<Option<Bytes>> {
            self.rounds.fetch_add(1, Ordering::SeqCst);
            assert_eq!(auth.auth_data.as_deref(), Some(&b"challenge"[..]));
            Ok(Some(Bytes::from_static(b"response")))
        }
    }

    #[tokio::test]
    async fn test_enhanced_authentication() {
        let (client, mut brokers) = setup(options(), 1);
        let broker = &mut brokers[0];
        let auth = Arc::new(Challenge::default());
        let c = client.clone();
        let a = auth.clone();
        let handle = tokio::spawn(async move { c.connect_with(a).await });

        match broker.recv().await {
            v5::Packet::Connect(connect) => {
                assert_eq!(connect.auth_method.as_deref(), Some("SCRAM"));
                assert_eq!(connect.auth_data.as_deref(), Some(&b"first"[..]));
            }
            other => panic!("expected CONNECT, got {:?}", other),
        }
        let challenge = Auth::continue_auth("SCRAM".into(), Some(Bytes::from_static(b"challenge")));
        broker.send(v5::Packet::Auth(challenge)).await;
        match broker.recv().await {
            v5::Packet::Auth(auth) => {
                assert_eq!(auth.reason_code, AuthReasonCode::ContinueAuth);
                assert_eq!(auth.auth_data.as_deref(), Some(&b"response"[..]));
            }
            other => panic!("expected AUTH, got {:?}", other),
        }
        broker.send(v5::Packet::ConnectAck(Box::new(ConnectAck::default()))).await;
        handle.await.unwrap().unwrap();
        assert_eq!(auth.rounds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_incoming_alias_closes() {
        let (client, mut brokers) = setup(ClientOptions { topic_alias_maximum: 2, ..options() }, 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;

        // QoS 0 PUBLISH to "t" carrying Topic Alias 0
        broker.io.get_mut().write_all(b"\x30\x07\x00\x01t\x03\x23\x00\x00").await.unwrap();
        assert!(matches!(
            broker.recv().await,
            v5::Packet::Disconnect(d) if d.reason_code == DisconnectReasonCode::TopicAliasInvalid
        ));
        client.wait_for(ConnectionState::Disconnected).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_incoming_releases_held() {
        let options = ClientOptions { manual_ack: true, receive_maximum: 2, ..options() };
        let (client, mut brokers) = setup(options, 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;
        let incoming = client.incoming().unwrap();

        for id in [7, 8] {
            let mut p = publish("m", "x", QoS::AtLeastOnce);
            p.packet_id = Some(pid(id));
            broker.send(p.into()).await;
        }
        time::sleep(Duration::from_millis(50)).await;
        drop(incoming);

        let mut acked = Vec::new();
        for _ in 0..2 {
            match broker.recv().await {
                v5::Packet::PublishAck(ack) => acked.push(ack.packet_id.get()),
                other => panic!("expected PUBACK, got {:?}", other),
            }
        }
        acked.sort_unstable();
        assert_eq!(acked, [7, 8]);

        // reading goes on once nothing is held
        let mut p = publish("m", "x", QoS::AtLeastOnce);
        p.packet_id = Some(pid(9));
        broker.send(p.into()).await;
        assert!(matches!(broker.recv().await, v5::Packet::PublishAck(ack) if ack.packet_id == pid(9)));
    }

    #[tokio::test]
    async fn test_expired_session_republishes() {
        let options = ClientOptions {
            clean_start: false,
            session_expiry_interval: Duration::from_secs(60),
            republish_if_session_expired: true,
            reconnect: reconnecting(),
            ..options()
        };
        let (client, mut brokers) = setup(options, 2);
        let mut second = brokers.pop().unwrap();
        let mut first = brokers.pop().unwrap();
        connect(&client, &mut first, ConnectAck::default()).await;

        let c = client.clone();
        let res = tokio::spawn(async move { c.publish(publish("t", "again", QoS::AtLeastOnce)).await });
        assert_eq!(first.recv_publish().await.packet_id, Some(pid(1)));
        drop(first);

        let connect = second.accept(ConnectAck { session_present: false, ..Default::default() }).await;
        assert!(!connect.clean_start);
        let p = second.recv_publish().await;
        assert!(!p.dup);
        assert_eq!(p.topic, "t");
        assert_eq!(&p.payload[..], b"again");
        let packet_id = p.packet_id.expect("QoS 1 publish without packet id");
        second.send(v5::Packet::PublishAck(PublishAck::new(packet_id, PublishAckReason::Success))).await;
        assert!(matches!(res.await.unwrap(), Ok(PublishResult::Acked(_))));
    }

    #[tokio::test]
    async fn test_error_pubrec_ends_flow() {
        let (client, mut brokers) = setup(options(), 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;

        let c = client.clone();
        let res = tokio::spawn(async move { c.publish(publish("t", "x", QoS::ExactlyOnce)).await });
        let p = broker.recv_publish().await;
        broker.send(v5::Packet::PublishReceived(PublishAck::new(pid(1), PublishAckReason::QuotaExceeded))).await;
        match res.await.unwrap() {
            Err(MqttError::PublishRec(ack)) => assert_eq!(ack.reason_code, PublishAckReason::QuotaExceeded),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(p.packet_id, Some(pid(1)));

        // no PUBREL goes out before the next publish
        client.publish(publish("marker", "x", QoS::AtMostOnce)).await.unwrap();
        assert_eq!(broker.recv_publish().await.topic, "marker");
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_error_puback_keeps_connection() {
        let (client, mut brokers) = setup(options(), 1);
        let broker = &mut brokers[0];
        connect(&client, broker, ConnectAck::default()).await;

        let c = client.clone();
        let res = tokio::spawn(async move { c.publish(publish("t", "x", QoS::AtLeastOnce)).await });
        broker.recv_publish().await;
        let mut ack = PublishAck::new(pid(1), PublishAckReason::NotAuthorized);
        ack.reason_string = Some("denied".into());
        broker.send(v5::Packet::PublishAck(ack)).await;
        match res.await.unwrap() {
            Err(MqttError::PublishAck(ack)) => {
                assert_eq!(ack.reason_code, PublishAckReason::NotAuthorized);
                assert_eq!(ack.reason_string.as_deref(), Some("denied"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.state(), ConnectionState::Connected);

        let c = client.clone();
        let res = tokio::spawn(async move { c.publish(publish("t", "y", QoS::AtLeastOnce)).await });
        let packet_id = broker.recv_publish().await.packet_id.expect("QoS 1 publish without packet id");
        broker.send(v5::Packet::PublishAck(PublishAck::new(packet_id, PublishAckReason::Success))).await;
        assert!(matches!(res.await.unwrap(), Ok(PublishResult::Acked(_))));
    }

    #[tokio::test]
    async fn test_oversized_publish_fails_locally() {
        let (client, mut brokers) = setup(options(), 1);
        let broker = &mut brokers[0];
        let ack = ConnectAck { max_packet_size: Some(64), topic_alias_max: 1, ..Default::default() };
        connect(&client, broker, ack).await;

        let big = Publish::new("big", Bytes::from(vec![0u8; 128]), QoS::AtLeastOnce, false);
        let err = client.publish(big).await.unwrap_err();
        assert!(matches!(err, MqttError::Encode(EncodeError::MaximumPacketSizeExceeded)));
        assert_eq!(client.state(), ConnectionState::Connected);

        // the alias picked for the failed publish was never announced
        client.publish(publish("big", "x", QoS::AtMostOnce)).await.unwrap();
        let p = broker.recv_publish().await;
        assert_eq!((p.topic.as_ref(), p.topic_alias()), ("big", Some(1)));
        assert_eq!(&p.payload[..], b"x");
    }

    #[tokio::test]
    async fn test_disconnect_cancels_reconnect() {
        let reconnect = ReconnectOptions {
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(400),
            ..reconnecting()
        };
        let (client, mut brokers) = setup(ClientOptions { reconnect, ..options() }, 2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.add_listener(Disconnects(tx));
        let mut second = brokers.pop().unwrap();
        let mut first = brokers.pop().unwrap();
        connect(&client, &mut first, ConnectAck::default()).await;

        drop(first);
        let ctx = rx.recv().await.unwrap();
        assert_eq!(ctx.source, DisconnectSource::Transport);
        assert_eq!(ctx.reconnect_delay, Some(Duration::from_millis(200)));

        client.disconnect().await.unwrap();
        assert!(time::timeout(Duration::from_millis(500), second.io.next()).await.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let err = client.publish(publish("t", "x", QoS::AtMostOnce)).await.unwrap_err();
        assert!(matches!(err, MqttError::NotConnected));
    }
}
