//! pasarela - TCP connection router for managed MySQL replica sets
//!
//! pasarela sits in front of a group of cooperating MySQL servers and
//! forwards client sessions to a backend picked by a per-route destination
//! strategy. Destinations are either a static address list (round-robin,
//! first-available, or a failover ring) or driven by a topology cache that
//! continuously reconciles the declared cluster metadata with the live
//! group state and publishes consistent snapshots.
//!
//! Routing never interprets queries. It frames just enough of the wire
//! protocol (classic or X) to tell handshake from steady state, applies
//! admission control and per-source-host error blocking, and otherwise
//! copies bytes verbatim in both directions.
pub mod config;
pub mod destination;
pub mod error;
pub mod metadata;
pub mod net;
pub mod protocol;
pub mod routing;
pub mod utils;

pub use error::{RouterError, RouterResult};
pub use routing::Router;
