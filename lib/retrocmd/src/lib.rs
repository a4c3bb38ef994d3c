//! Client SDK for the RetroArch-style UDP command channel.
//!
//! The emulator accepts ASCII commands over datagrams; this crate covers the
//! wire dialect, request/response correlation, and adaptive read chunking.
mod chunking;
mod client;
pub mod wire;

pub use chunking::{ChunkPolicy, initial_chunk};
pub use client::{ClientConfig, RetroClient, TransportError};
