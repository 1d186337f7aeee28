//! The side network: the out-of-band control plane.
//!
//! Short-lived TCP exchanges handle everything the data plane cannot
//! bootstrap itself: topology dissemination, endpoint establishment,
//! segment registration and group handshakes. Each process runs one
//! server loop ([`server`]) and issues client commands ([`client`])
//! against its peers' servers.

pub(crate) mod allgather;
pub(crate) mod client;
pub(crate) mod server;
pub(crate) mod topology;
