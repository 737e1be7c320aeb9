use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use parking_lot::RwLock;

use rmqttc_codec::v5::{Auth, DisconnectReasonCode};

use crate::error::Result;
use crate::session::ConnectionRestrictions;

/// Who ended a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectSource {
    /// `disconnect()` was called
    User,
    /// The client closed it after a protocol error or keep alive timeout
    Client,
    /// DISCONNECT from the server or a refused CONNACK
    Server,
    /// The byte stream failed or was closed
    Transport,
}

#[derive(Debug, Clone)]
pub struct ConnectedContext {
    pub client_id: ByteString,
    pub session_present: bool,
    pub restrictions: ConnectionRestrictions,
}

#[derive(Debug, Clone)]
pub struct DisconnectedContext {
    pub source: DisconnectSource,
    pub reason_code: Option<DisconnectReasonCode>,
    pub reason: String,
    pub server_reference: Option<ByteString>,
    /// Delay before the next automatic attempt, `None` if none is scheduled
    pub reconnect_delay: Option<Duration>,
    pub attempts: usize,
}

/// Connection lifecycle callbacks, run on the connection task so they must not block.
pub trait Listener: Send + Sync + 'static {
    fn on_connected(&self, _ctx: &ConnectedContext) {}

    fn on_disconnected(&self, _ctx: &DisconnectedContext) {}
}

/// Enhanced authentication exchange started by a CONNECT carrying [`Authenticator::method`].
pub trait Authenticator: Send + Sync + 'static {
    fn method(&self) -> ByteString;

    fn initial_data(&self) -> Option<Bytes> {
        None
    }

    /// Answers a Continue Authentication AUTH with the data for the next AUTH.
    fn on_continue(&self, auth: &Auth) -> Result<Option<Bytes>>;
}

#[derive(Clone, Default)]
pub(crate) struct Listeners {
    inner: Arc<RwLock<Vec<Arc<dyn Listener>>>>,
}

impl Listeners {
    pub(crate) fn add(&self, listener: Arc<dyn Listener>) {
        self.inner.write().push(listener);
    }

    #[inline]
    fn snapshot(&self) -> Vec<Arc<dyn Listener>> {
        self.inner.read().clone()
    }

    pub(crate) fn connected(&self, ctx: &ConnectedContext) {
        for l in self.snapshot() {
            l.on_connected(ctx);
        }
    }

    pub(crate) fn disconnected(&self, ctx: &DisconnectedContext) {
        for l in self.snapshot() {
            l.on_disconnected(ctx);
        }
    }
}
