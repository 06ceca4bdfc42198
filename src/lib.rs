//! Pebble Trading Core
//!
//! Off-chain core of a binary prediction market: a price-time-priority
//! matching engine with binary cross-matching, order lifecycle with fund
//! and position locking, a two-phase settlement batcher driving an
//! external Canton ledger, a ledger event processor feeding local
//! projections, a balance reconciliation loop, and a subscription hub for
//! live updates. Transport (HTTP/WebSocket framing) lives outside this
//! crate and talks to the services exposed through [`context::AppContext`].

pub mod config;
pub mod context;
pub mod db;
pub mod errors;
pub mod ledger;
pub mod models;
pub mod services;
pub mod ws;

pub use context::AppContext;
pub use errors::CoreError;
