pub mod access;
pub mod carrier;
pub mod config;
pub mod http;
pub mod icmp;
pub mod ingress;
pub mod metrics;
pub mod origin;
pub mod pkt;
pub mod proxy;
pub mod router;
pub mod token;
pub mod trc;

pub use tunnel_core::prelude::*;
