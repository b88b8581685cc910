//! Concrete [`MessageHandler`](crate::MessageHandler) implementations.
//!
//! Contains [`SpoolHandler`] for writing messages to disk and
//! [`SmarthostHandler`] (feature-gated behind `smarthost`) for relaying them
//! to an upstream SMTP server.

#[cfg(feature = "smarthost")]
pub mod smarthost;
pub mod spool;

#[cfg(feature = "smarthost")]
pub use smarthost::*;
pub use spool::*;
