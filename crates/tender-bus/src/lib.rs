//! # tender-bus
//!
//! Durable task queues for the tender pipeline.
//!
//! This crate provides:
//! - The [`BrokerChannel`]/[`BrokerConnector`] abstraction with NATS JetStream
//!   and in-memory backends
//! - The [`TaskDispatcher`] that publishes task messages with reconnect/retry
//! - The in-flight [`DedupGuard`] and favorite-search enqueue
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tender_bus::{DedupGuard, EventBusConfig, FavoriteSearchQueue, TaskDispatcher};
//!
//! let config = EventBusConfig::from_env();
//! let dispatcher = Arc::new(TaskDispatcher::from_config(config.connector(), &config));
//! let favorites = FavoriteSearchQueue::new(dispatcher, DedupGuard::new(config.dedup_ttl()));
//! let outcome = favorites.enqueue("user-1", &request).await?;
//! ```

pub mod broker;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod favorite_search;
pub mod jetstream;
pub mod memory;

pub use broker::{
    close_best_effort, sleep_or_cancel, Acker, BrokerChannel, BrokerConnector, Delivery, DeliveryStream,
    OutgoingMessage,
};
pub use config::{EventBusConfig, QueueNames};
pub use dedup::DedupGuard;
pub use dispatcher::TaskDispatcher;
pub use favorite_search::{
    build_command, FavoriteSearchOutcome, FavoriteSearchQueue, FavoriteSearchRequest,
};
pub use tender_core::{EnqueueErrorKind, EnqueueOutcome};
pub use jetstream::JetStreamConnector;
pub use memory::{MemoryBroker, MemoryMessage};
