//! # kestrel-rpc
//!
//! A small, embeddable RPC runtime carrying schema-packed messages over
//! byte-stream sockets (unix / tcp v4 / tcp v6). Serialization lives
//! outside: callers hand in a [Service] with a method table of
//! [MessageSchema]s, and the runtime moves opaque payloads framed by a
//! 12-byte little-endian header.
//!
//! ## Components
//!
//! - [RpcServer] / [provide_service]: readiness-driven event loop over the
//!   registered descriptors, with an optional fixed worker pool. Ready
//!   connections migrate from the polled *pending* list to a *working*
//!   list owned by a worker, and re-park through a self-pipe wake.
//! - [RpcClient]: one blocking in-flight request per connection, with a
//!   bounded response deadline.
//! - [codec]: an optional msgpack bridge ([codec::MsgpCodec]) from serde
//!   types to the schema contract, for callers without their own
//!   serialization layer.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kestrel_rpc::{provide_service, stop_pipe, ServerConfig};
//!
//! let (stop_r, stop_w) = stop_pipe()?;
//! // stop_w kept by the caller: one byte shuts the server down
//! let config = ServerConfig { num_workers: 4, ..Default::default() };
//! provide_service("unix:///run/app.sock", Arc::new(my_service), config, Some(stop_r))?;
//! ```

#[macro_use]
extern crate captains_log;

pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod net;
pub mod proto;
pub mod server;
pub mod service;

pub use client::RpcClient;
pub use config::{ClientConfig, ServerConfig};
pub use error::RpcError;
pub use net::{stop_pipe, Endpoint};
pub use server::{provide_service, ReplySink, RpcServer};
pub use service::{Message, MessageSchema, MethodDescriptor, Service, ServiceDescriptor};
