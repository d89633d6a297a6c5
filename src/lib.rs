// A SIP call engine in Rust
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;
pub mod auth;
pub mod call;
pub mod config;
pub mod dialog;
pub mod endpoint;
pub mod error;
pub mod fork;
pub mod outbound;
pub mod proxy;
pub mod registrar;
pub mod router;
pub mod rsip_ext;
pub mod service;
pub mod timer;
pub mod transaction;
pub mod transport;
pub use endpoint::{Endpoint, EndpointBuilder};
