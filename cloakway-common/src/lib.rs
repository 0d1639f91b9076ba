mod config;
mod connections;
mod error;
mod lru;
mod secret;
mod tunnel;
pub mod helpers;
pub mod tls;

pub use config::*;
pub use connections::*;
pub use error::*;
pub use lru::*;
pub use secret::*;
pub use tunnel::*;
