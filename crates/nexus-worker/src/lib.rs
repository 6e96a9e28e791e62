//! Worker for the Nexus workflow platform.
//!
//! Long-polls the build queue, leases messages with heartbeat
//! extension, dispatches by workflow type and reconciles task and
//! project records on every terminal outcome.

pub mod handler;
pub mod invoker;
pub mod worker;

pub use handler::WorkflowHandler;
pub use invoker::HttpLlmInvoker;
pub use worker::Worker;
