//! Built-in transformations applied before delivery.
//!
//! Each transformer runs between the per-recipient split and the delivery
//! handler. Currently supports `Message-ID` header injection and
//! per-recipient encryption.

pub mod encryption;
pub mod message_id;

pub use encryption::*;
pub use message_id::*;
