//! Integration tests for the realtime channel
//! These exercise the public API end to end, over a real websocket where it matters

pub mod test_server;

pub mod channel_test;
pub mod websocket_test;
