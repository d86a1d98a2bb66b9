//! Reverse tunnel: an authenticated session per client, many streams
//! multiplexed over it, and the ingress side that routes public traffic by
//! subdomain.

pub mod auth;
pub mod client;
pub mod error;
pub mod forwarder;
pub mod frame;
pub mod ingress;
pub mod pump;
pub mod registry;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;
