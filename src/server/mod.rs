//! Connection record/FSM and the per-worker event loop.

pub mod connection;
pub mod worker;
