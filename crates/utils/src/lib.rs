pub mod auth;
pub mod config;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod guard;
pub mod handler;
pub mod handlers;
pub mod headers;
pub mod license;
pub mod message;
pub mod mime;
pub mod pipeline;
pub mod policy;
pub mod storage;
pub mod tls;
pub mod transformer;
pub mod transformers;

#[cfg(test)]
mod testing;

pub use auth::*;
pub use config::*;
pub use encryption::*;
pub use envelope::*;
pub use error::*;
pub use guard::*;
pub use handler::*;
pub use handlers::*;
pub use headers::*;
pub use license::*;
pub use message::*;
pub use mime::*;
pub use pipeline::*;
pub use policy::*;
pub use storage::*;
pub use tls::*;
pub use transformer::*;
pub use transformers::*;
