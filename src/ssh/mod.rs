//! SSH module - connections shared by terminals and tunnels
//!
//! This module provides the SSH substrate using the russh library.
//!
//! # Features
//! - Direct SSH connections
//! - ProxyJump (jump host) chains
//! - Single-owner handle task with a cloneable controller
//! - Connection pool with single-flight dial, keepalive and idle eviction

mod client;
mod config;
pub mod connection_pool;
mod error;
mod handle_owner;
mod proxy;

pub use client::{connect, ClientHandler, DialOptions, SshConnection};
pub use config::{AuthMethod, ProxyHopConfig, SshConfig};
pub use connection_pool::{
    ConnectionHealth, ConnectionPool, ConnectionStats, Dialer, PoolError, PoolStats,
    PooledConnection, SshDialer,
};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
