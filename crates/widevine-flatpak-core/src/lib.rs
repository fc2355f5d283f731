mod config;
mod error;
mod version;

pub use config::{ArchiveSource, PayloadPaths, ProvisionConfig};
pub use error::ProvisionError;
pub use version::LinkerVersion;
