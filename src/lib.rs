//! A client library for NSQ, a distributed real-time message-queue broker.
//!
//! This crate speaks NSQ's V2 TCP wire protocol to nsqd, with optional
//! topic discovery against nsqlookupd. The three pieces that matter most:
//!
//! - [`wire`] — the stateful frame codec and per-connection compression.
//! - [`connection`] — one TCP link's handshake, dispatch loop, and state machine.
//! - [`rdy`] — the flow-control engine that keeps a consumer's in-flight
//!   budget distributed fairly (or fairly rotated, when scarce) across
//!   connections.
//!
//! [`Consumer`] ties discovery, reconnection, and RDY control together into
//! a single stream of messages. [`Producer`] is a minimal publish-only
//! counterpart for callers that never subscribe.
//!
//! # Examples
//!
//! ```rust,no_run
//! use nsq_client::{Consumer, ConsumerConfig};
//! use nsq_client::topic::{Channel, Topic};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let topic: Topic = "events".parse()?;
//!     let channel: Channel = "processor".parse()?;
//!     let config = ConsumerConfig::default()
//!         .with_nsqd_addresses(["127.0.0.1:4150".to_string()]);
//!
//!     let mut consumer = Consumer::connect(topic, channel, config).await?;
//!     while let Some(delivery) = consumer.next_message().await {
//!         println!("got message {}", delivery.message.id_str());
//!         delivery.connection.send_fin(&delivery.message.id_str());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod lookup;
pub mod producer;
pub mod rdy;
pub mod topic;
pub mod wire;

#[cfg(test)]
mod tests;

pub use config::{ConsumerConfig, IdentifyOptions};
pub use connection::{Connection, ConnectionHandle, ConnectionState, Delivery};
pub use consumer::Consumer;
pub use error::{NsqError, NsqResult};
pub use producer::Producer;
pub use wire::{CodecError, Frame, FrameType, Message, Reader};
