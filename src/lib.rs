pub mod archive;
pub mod config;
pub mod error;
pub mod logging;
pub mod mapper;
pub mod pipeline;
pub mod source;
pub mod tuple;

pub use archive::{ArchiveStore, Archiver, LogArchiver};
pub use error::{ArchiveError, Result};
pub use mapper::{PrefixMap, ResourceKey, ResourceRule};
pub use pipeline::Pipeline;
