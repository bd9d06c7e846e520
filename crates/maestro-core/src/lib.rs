pub mod config;
pub mod error;
pub mod ids;

pub use config::MaestroConfig;
pub use error::{MaestroError, Result};
