//! Node agent for a game-server fleet.
//!
//! Each node runs one agent process that keeps a single outbound control
//! connection to the central coordinator, relays WebRTC signaling so remote
//! clients can probe their latency to the node, and drains finished match
//! recordings to object storage via presigned URLs.

pub mod channel;
pub mod config;
pub mod demos;
pub mod health;
pub mod latency;
pub mod network;
pub mod relay;
pub mod signaling;
pub mod storage;
pub mod telemetry;
