//! Core of the Nimbus gateway pump: sharded, resumable connections to the
//! Discord real-time gateway.
//!
//! A [`Shard`] owns one logical gateway session at a time and runs its own
//! connect / hello / identify-or-resume / heartbeat / reconnect lifecycle. The
//! [`Manager`] owns every shard assigned to this process, splitting the shard
//! space across server instances by `shard_id mod server_count`.
//!
//! Shards do not interpret dispatch payloads. Every inbound packet is handed
//! to an [`EventObserver`], and outbound [`SendPacket`]s are routed to the
//! owning shard through the [`ManagerHandle`]. Identify launches are gated
//! through a shared [`queue::Queue`] so that the gateway's session-start
//! concurrency limit is respected across the whole fleet, and session state is
//! persisted through a [`store::SessionStore`] so sessions survive process
//! restarts.

#![warn(clippy::pedantic, missing_docs, rust_2018_idioms, unsafe_code)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

pub mod compression;
pub mod config;
pub mod error;
pub mod info;
pub mod metrics;
pub mod observer;
pub mod queue;
pub mod store;

mod channel;
mod connection;
mod future;
mod intents;
mod latency;
mod manager;
mod packet;
mod ratelimiter;
mod session;
mod shard;

pub use self::{
    channel::ShardSender,
    config::{Config, ConfigBuilder, ShardId},
    intents::Intents,
    latency::Latency,
    manager::{Manager, ManagerError, ManagerErrorType, ManagerHandle, ShardScheme, Topology},
    observer::EventObserver,
    packet::{IdentifyProperties, OpCode, ReceivePacket, SendPacket},
    ratelimiter::CommandRatelimiter,
    session::Session,
    shard::{Shard, Stage},
};

/// Gateway API version requested when none is configured.
pub const API_VERSION: u8 = 10;

#[cfg(not(any(
    feature = "native",
    feature = "rustls-native-roots",
    feature = "rustls-webpki-roots"
)))]
compile_error!(
    "Either the `native`, `rustls-native-roots` or `rustls-webpki-roots` feature must be enabled."
);
