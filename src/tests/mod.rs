//! Unit tests for the realtime channel
//!
//! These drive the channel through the loopback transport, which reports
//! lifecycle signals synchronously, so every path is deterministic.

pub mod lifecycle_test;
