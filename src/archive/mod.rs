//! Archive drivers: the capability surface the pipeline writes through.

mod store;

pub use store::ArchiveStore;

use tracing::info;

use crate::error::Result;

/// One logical event's worth of writes. Implementations must make each call
/// atomically visible or not at all.
pub trait Archiver: Send + Sync {
    fn create(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
        current: &[u8],
    ) -> Result<()>;

    fn update(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
        current: &[u8],
    ) -> Result<()>;

    fn delete(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
    ) -> Result<()>;
}

/// Driver that records operations in the log without persisting anything.
pub struct LogArchiver;

impl Archiver for LogArchiver {
    fn create(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
        _current: &[u8],
    ) -> Result<()> {
        info!("created {resource} {namespace:?} {name:?} {uid:?} {index}");
        Ok(())
    }

    fn update(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
        _current: &[u8],
    ) -> Result<()> {
        info!("updated {resource} {namespace:?} {name:?} {uid:?} {index}");
        Ok(())
    }

    fn delete(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
    ) -> Result<()> {
        info!("deleted {resource} {namespace:?} {name:?} {uid:?} {index}");
        Ok(())
    }
}
