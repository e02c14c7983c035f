#![deny(unsafe_code)]

//! MQTT ingress proxy core.
//!
//! Terminates MQTT 3.1.1/5.0 client connections, authenticates publishers
//! and forwards every PUBLISH to a backend broker. One-way by design: the
//! proxy acknowledges at the requested QoS but never delivers messages back
//! to clients.

pub mod auth; // username/password authenticators
pub mod conn; // connection state machine and write sink
pub mod handler; // per-packet dispatch and publish orchestration
pub mod http; // probes and prometheus exposition
pub mod logger; // slog backend behind the log facade
pub mod metrics; // metric families
pub mod publisher; // backend publishers
pub mod server; // accept loop, registry, shutdown

pub use mqrelay_codec as codec;
pub use mqrelay_conf as conf;
pub use mqrelay_net as net;

pub use net::{Error, Result};
