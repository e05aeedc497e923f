pub mod config;
pub mod error;
pub mod manifest;

pub use config::DirectorConfig;
pub use error::ManifestError;
pub use manifest::*;
