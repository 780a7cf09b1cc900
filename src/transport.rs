//! Shared duplex connection to a streaming backend
//!
//! One WebSocket per process, multiplexed by conversation and message id.
//! The connection reconnects on its own after a drop; callers observe the
//! state through a watch channel and never see transport failures as panics.

mod backoff;
mod connection;
pub mod wire;


pub use backoff::{BackoffStrategy, ReconnectPolicy};
pub use connection::{ConnectionState, TransportConnection};
pub use wire::{ClientFrame, ServerFrame};
