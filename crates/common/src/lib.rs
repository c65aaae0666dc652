pub mod config;
pub mod error;
pub mod keys;
pub mod types;
pub mod utils;

pub use config::*;
pub use error::{FailureKind, ScrapeError, ScrapeResult};
pub use types::*;
