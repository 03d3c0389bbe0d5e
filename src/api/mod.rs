//! HTTP surface of the service.

pub mod handlers;
pub mod server;

pub use server::AdmissionServer;
