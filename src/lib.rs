//! # umps - a Uniform Messaging Pattern Service stack
//!
//! `umps` provides the ZeroMQ socket wrappers, ZAP authentication, and proxy
//! composites that back a message broker: publish/subscribe and request/reply
//! patterns, a four-level authentication ladder (grasslands, strawhouse,
//! woodhouse, stonehouse), a broadcast/service proxy engine, a connection
//! information directory, a module-command subsystem, and the counter and
//! packet-cache ambient services built on top of them.
//!
//! ## Architecture
//!
//! Every socket pattern is a thin wrapper around [`transport::AsyncSocket`]
//! configured by [`socket::SocketOptions`] (address, bind/connect, ZAP tier,
//! high-water marks, timeouts). [`proxy::Proxy`] relays frames between a
//! frontend/backend pair; [`composite::Broadcast`] and [`composite::Service`]
//! pair a proxy with an [`auth::AuthenticationService`] so authentication
//! comes up before traffic is relayed. [`directory::Operator`] and
//! [`command::LocalService`] are themselves `Reply`-backed services
//! reachable the same way as any other module.

pub mod auth;
pub mod command;
pub mod composite;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod domain_types;
pub mod error;
pub mod keys;
pub mod message;
pub mod proxy;
pub mod services;
pub mod socket;
pub mod storage;
pub mod transport;
pub mod zap;

pub use crate::error::{Error, Result};

// Common imports used throughout the crate and its binaries.
pub use ::tracing::{debug, error, info, instrument, warn};
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use thiserror::Error as ThisError;
