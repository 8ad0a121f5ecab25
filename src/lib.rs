#![forbid(unsafe_code)]

//! Single-flight session coordination for a cooperative actor worker.
//!
//! A [`session::Session`] loads its shared state at most once per load cycle
//! no matter how many [`worker::Step`]s ask for it. Steps that find the data
//! missing are parked in FIFO order and resumed by the owning
//! [`worker::Worker`] once the loader marks the session ready, or failed when
//! the session's timeout hook decides so.

pub mod config;
pub mod errors;
pub mod models;
pub mod profile;
pub mod runtime;
pub mod session;
pub mod worker;

pub use config::WorkerConfig;
pub use errors::{AppError, Result};
