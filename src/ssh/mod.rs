//! SSH plumbing: the client-facing russh server handler, the upstream
//! client and the per-channel relay between them.

pub mod handler;
pub mod keys;
pub mod requests;
pub mod upstream;

pub use handler::ProxyHandler;
