//! kappa-core: primitives shared by every Kappa subsystem.
//!
//! The only resident today is the [`Supervisor`], a cancellation and
//! join primitive arranged as a tree. The transport server, the
//! membership event loop, and the server façade all run their tasks
//! under one.

pub mod supervise;

pub use supervise::{Supervisor, TaskFailure};
