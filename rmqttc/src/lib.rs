#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use bytes::Bytes;
//! use rmqttc::codec::types::{Publish, QoS};
//! use rmqttc::{ClientOptions, MqttClient, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = MqttClient::new(ClientOptions { client_id: "sensor-1".into(), ..Default::default() });
//!     let mut incoming = client.incoming().expect("taken once");
//!
//!     client.connect().await?;
//!     client.subscribe(vec![("cmd/#".into(), Default::default())]).await?;
//!     client.publish(Publish::new("state", Bytes::from_static(b"on"), QoS::AtLeastOnce, false)).await?;
//!
//!     while let Some(msg) = incoming.recv().await {
//!         println!("{} {:?}", msg.publish.topic, msg.publish.payload);
//!     }
//!     Ok(())
//! }
//!
//! ```

mod alias; // Topic alias tables
pub mod client; // Client handle and incoming stream
mod connection; // The task owning the transport
pub mod error; // Error type
mod inflight; // In-flight message tracking
pub mod listener; // Connection callbacks and enhanced authentication
pub mod logger; // slog backend for the log facade
pub mod reconnect; // Reconnect backoff
pub mod session; // Connection state machine and negotiated limits
pub mod transport; // Byte stream contract

pub use rmqttc_codec as codec;
pub use rmqttc_conf::{
    ClientOptions, LastWillOptions, Log, MqttVersion, ReconnectOptions, Settings, TopicAliasPolicy,
};
pub use rmqttc_utils::Bytesize;

pub use client::{Incoming, IncomingPublish, MqttClient, PublishResult};
pub use error::{MqttError, Result};
pub use listener::{Authenticator, ConnectedContext, DisconnectSource, DisconnectedContext, Listener};
pub use session::{ConnectionRestrictions, ConnectionState};
pub use transport::{Connector, Io, TcpConnector};
