pub mod config;
pub mod error;
pub mod message;

pub use config::ImporterConfig;
pub use error::*;
pub use message::*;
