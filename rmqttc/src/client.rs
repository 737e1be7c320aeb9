use std::num::NonZeroU16;
use std::sync::Arc;

use bytestring::ByteString;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use rmqttc_codec::types::{Publish, QoS};
use rmqttc_codec::v5::{PublishAck, PublishAck2, SubscribeAck, SubscriptionOptions, UnsubscribeAck, UserProperties};
use rmqttc_conf::{ClientOptions, TopicAliasPolicy};

use crate::connection::Connection;
use crate::error::{MqttError, Result};
use crate::listener::{Authenticator, ConnectedContext, Listener, Listeners};
use crate::session::ConnectionState;
use crate::transport::{Connector, TcpConnector};

pub(crate) type Responder<T> = oneshot::Sender<Result<T>>;

/// Completion of a publish, by QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    /// QoS 0, written to the transport
    Sent,
    /// QoS 1, PUBACK received
    Acked(PublishAck),
    /// QoS 2, PUBCOMP received
    Completed(PublishAck2),
}

pub(crate) enum Command {
    Connect(Responder<ConnectedContext>, Option<Arc<dyn Authenticator>>),
    Disconnect(Responder<()>),
    Publish(Box<Publish>, TopicAliasPolicy, Responder<PublishResult>),
    Subscribe(Vec<(ByteString, SubscriptionOptions)>, UserProperties, Responder<SubscribeAck>),
    Unsubscribe(Vec<ByteString>, Responder<UnsubscribeAck>),
    /// Consumer demand for more incoming publishes
    Request(usize),
    /// Application acknowledgment of an incoming publish
    Ack(NonZeroU16, QoS),
}

/// Cloneable handle to one client connection.
///
/// Every operation is handed to the connection task and answered on a oneshot channel.
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct MqttClient {
    client_id: ByteString,
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    listeners: Listeners,
    incoming: Arc<Mutex<Option<Incoming>>>,
    alias_policy: TopicAliasPolicy,
}

impl MqttClient {
    pub fn new(options: ClientOptions) -> Self {
        Self::with_connector(options, TcpConnector)
    }

    pub fn with_connector<C: Connector>(options: ClientOptions, connector: C) -> Self {
        let (tx, rx) = mpsc::channel(options.command_queue.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let listeners = Listeners::default();
        let client_id = ByteString::from(options.client_id.as_str());
        let alias_policy = options.topic_alias_policy;
        let manual_ack = options.manual_ack;

        let conn =
            Connection::new(options, Arc::new(connector), tx.downgrade(), rx, state_tx, incoming_tx, listeners.clone());
        tokio::spawn(conn.run());

        let incoming = Incoming { rx: incoming_rx, tx: tx.clone(), manual_ack };
        Self { client_id, tx, state, listeners, incoming: Arc::new(Mutex::new(Some(incoming))), alias_policy }
    }

    /// Client id as configured; the id assigned by the server is reported in [`ConnectedContext`].
    #[inline]
    pub fn client_id(&self) -> &ByteString {
        &self.client_id
    }

    async fn call<T>(&self, f: impl FnOnce(Responder<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(f(tx)).await?;
        rx.await?
    }

    pub async fn connect(&self) -> Result<ConnectedContext> {
        self.call(|tx| Command::Connect(tx, None)).await
    }

    /// Connects with enhanced authentication; the authenticator is kept for reconnects.
    pub async fn connect_with(&self, auth: Arc<dyn Authenticator>) -> Result<ConnectedContext> {
        self.call(|tx| Command::Connect(tx, Some(auth))).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.call(Command::Disconnect).await
    }

    /// Completes according to QoS, see [`PublishResult`].
    pub async fn publish(&self, publish: Publish) -> Result<PublishResult> {
        self.publish_with(publish, self.alias_policy).await
    }

    pub async fn publish_with(&self, mut publish: Publish, policy: TopicAliasPolicy) -> Result<PublishResult> {
        publish.packet_id = None;
        publish.dup = false;
        self.call(|tx| Command::Publish(Box::new(publish), policy, tx)).await
    }

    /// Fails with [`MqttError::SubscribeAck`] if any filter was refused.
    pub async fn subscribe(&self, topic_filters: Vec<(ByteString, SubscriptionOptions)>) -> Result<SubscribeAck> {
        self.subscribe_with(topic_filters, UserProperties::default()).await
    }

    pub async fn subscribe_with(
        &self,
        topic_filters: Vec<(ByteString, SubscriptionOptions)>,
        user_properties: UserProperties,
    ) -> Result<SubscribeAck> {
        self.call(|tx| Command::Subscribe(topic_filters, user_properties, tx)).await
    }

    pub async fn unsubscribe(&self, topic_filters: Vec<ByteString>) -> Result<UnsubscribeAck> {
        self.call(|tx| Command::Unsubscribe(topic_filters, tx)).await
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Resolves once the connection reaches `state`.
    pub async fn wait_for(&self, state: ConnectionState) -> Result<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state).await.map_err(|_| MqttError::Closed)?;
        Ok(())
    }

    /// Incoming publishes; can be taken once.
    pub fn incoming(&self) -> Option<Incoming> {
        self.incoming.lock().take()
    }

    pub fn add_listener<L: Listener>(&self, listener: L) {
        self.listeners.add(Arc::new(listener));
    }
}

/// Stream of incoming publishes.
///
/// With manual acknowledgment nothing is delivered until demand is signalled with
/// [`Incoming::request`], and every publish must be acknowledged with [`IncomingPublish::ack`].
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<IncomingPublish>,
    tx: mpsc::Sender<Command>,
    manual_ack: bool,
}

impl Incoming {
    pub async fn request(&self, n: usize) -> Result<()> {
        if self.manual_ack && n > 0 {
            self.tx.send(Command::Request(n)).await?;
        }
        Ok(())
    }

    pub async fn recv(&mut self) -> Option<IncomingPublish> {
        self.rx.recv().await
    }
}

#[derive(Debug)]
pub struct IncomingPublish {
    pub publish: Publish,
    pub(crate) acker: Option<Acker>,
}

#[derive(Debug)]
pub(crate) struct Acker {
    pub(crate) tx: mpsc::WeakSender<Command>,
    pub(crate) packet_id: NonZeroU16,
    pub(crate) qos: QoS,
}

impl IncomingPublish {
    /// Releases the held PUBACK/PUBREC; a no-op unless manual acknowledgment is enabled.
    pub async fn ack(mut self) -> Result<()> {
        if let Some(acker) = self.acker.take() {
            let tx = acker.tx.upgrade().ok_or(MqttError::Closed)?;
            tx.send(Command::Ack(acker.packet_id, acker.qos)).await?;
        }
        Ok(())
    }

    #[inline]
    pub fn needs_ack(&self) -> bool {
        self.acker.is_some()
    }
}
