//! Tidewatch: a presence relay. One resilient upstream shard against a
//! push-event gateway, a downstream WebSocket relay fanning curated events
//! out to viewers, and a rendezvous cache bridging the two for the HTTP
//! collaborator.

pub mod cli;
pub mod config;
pub mod metrics;
pub mod relay;
pub mod rendezvous;
pub mod shard;
