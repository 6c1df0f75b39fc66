//! The archive indexer: a record of cluster resource changes with secondary
//! indices for the access patterns the archive serves.
//!
//! All keys live in the `events` column family and are packed tuples
//! (`crate::tuple`); four index families share the keyspace without
//! colliding because the type tag of the first element, and the arity and
//! types that follow, differ:
//!
//! * Event log - tracks creates, updates, and deletes.
//!   `(index, resource, namespace, name, op)` -> contents (empty for delete)
//!   A forward scan yields events in the order the source assigned indices.
//!
//! * Resources by version.
//!   `(resource, namespace, name, index)` -> empty
//!   Scanning the `(resource, namespace, name)` prefix enumerates every
//!   known version index in ascending order.
//!
//! * Resources by uid.
//!   `(uid)` -> `(index)` of the currently-live instance; removed on delete.
//!
//! * Deleted resources in a namespace.
//!   `(resource, namespace, deleted_index, uid)` -> `(last_known_index)`
//!   Enumerates the deletions within a namespace in event order.

use std::{fs, io::Write, path::Path, sync::Arc};

use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options,
    WriteBatch,
};

use crate::{
    error::{ArchiveError, Result},
    tuple::{Element, Tuple},
};

use super::Archiver;

const EVENTS_CF: &str = "events";

const OP_CREATE: u8 = 0;
const OP_UPDATE: u8 = 1;
const OP_DELETE: u8 = 2;

pub struct ArchiveStore {
    db: DBWithThreadMode<MultiThreaded>,
    write_lock: Mutex<()>,
}

impl ArchiveStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        let db = DBWithThreadMode::<MultiThreaded>::open_cf(&options, path, [EVENTS_CF])
            .map_err(|err| ArchiveError::Storage(err.to_string()))?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Opens an existing archive without taking the writer role. Writes
    /// through the returned store fail.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let options = Options::default();
        let db = DBWithThreadMode::<MultiThreaded>::open_cf_for_read_only(
            &options,
            path,
            [EVENTS_CF],
            false,
        )
        .map_err(|err| ArchiveError::Storage(err.to_string()))?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn events(&self) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(EVENTS_CF)
            .ok_or_else(|| ArchiveError::Storage(format!("missing column family {EVENTS_CF}")))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|err| ArchiveError::Storage(err.to_string()))
    }

    /// Queues a delete for every versions-index entry of the named resource
    /// and reports the highest version index that was present. The prefix
    /// packs the full `(resource, namespace, name)` triple; element
    /// self-delimiting guarantees sibling names never match it.
    fn purge_versions(
        &self,
        cf: &Arc<BoundColumnFamily<'_>>,
        batch: &mut WriteBatch,
        resource: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<u64>> {
        let prefix = version_prefix(resource, namespace, name);
        let mut last = None;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|err| ArchiveError::Storage(err.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            last = Some(version_of(&key)?);
            batch.delete_cf(cf, key);
        }
        Ok(last)
    }

    /// Renders every archived entry as `[tuple]=value-length`, one per line.
    pub fn dump(&self, w: &mut impl Write) -> Result<()> {
        let cf = self.events()?;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|err| ArchiveError::Storage(err.to_string()))?;
            match Tuple::unpack(&key) {
                Ok(tuple) => writeln!(w, "[{tuple}]={}", value.len())?,
                Err(err) => writeln!(w, "[{err}]={}", value.len())?,
            }
        }
        Ok(())
    }

    /// Raw read-side scan: every entry whose key begins with `prefix`, in
    /// key order. An empty prefix scans the whole archive.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.events()?;
        let mode = if prefix.is_empty() {
            IteratorMode::Start
        } else {
            IteratorMode::From(prefix, Direction::Forward)
        };

        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf, mode) {
            let (key, value) = item.map_err(|err| ArchiveError::Storage(err.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.into_vec(), value.into_vec()));
        }
        Ok(entries)
    }
}

impl Archiver for ArchiveStore {
    fn create(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
        current: &[u8],
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.events()?;
        let mut batch = WriteBatch::default();

        batch.put_cf(
            &cf,
            key_by_index(resource, namespace, name, index, OP_CREATE),
            current,
        );
        batch.put_cf(&cf, key_by_type(resource, namespace, name, index), b"");
        if !uid.is_empty() {
            batch.put_cf(&cf, uid_key(uid), index_value(index));
        }

        self.write(batch)
    }

    fn update(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
        current: &[u8],
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.events()?;
        let mut batch = WriteBatch::default();

        batch.put_cf(
            &cf,
            key_by_index(resource, namespace, name, index, OP_UPDATE),
            current,
        );
        self.purge_versions(&cf, &mut batch, resource, namespace, name)?;
        batch.put_cf(&cf, key_by_type(resource, namespace, name, index), b"");
        if !uid.is_empty() {
            batch.put_cf(&cf, uid_key(uid), index_value(index));
        }

        self.write(batch)
    }

    fn delete(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.events()?;
        let mut batch = WriteBatch::default();

        batch.put_cf(
            &cf,
            key_by_index(resource, namespace, name, index, OP_DELETE),
            b"",
        );
        let last_known = self.purge_versions(&cf, &mut batch, resource, namespace, name)?;
        batch.put_cf(
            &cf,
            deleted_key(resource, namespace, index, uid),
            index_value(last_known.unwrap_or(index)),
        );
        if !uid.is_empty() {
            batch.delete_cf(&cf, uid_key(uid));
        }

        self.write(batch)
    }
}

fn version_of(key: &[u8]) -> Result<u64> {
    let tuple = Tuple::unpack(key)?;
    match tuple.elements().last() {
        Some(Element::Int(index)) => Ok(*index),
        _ => Err(ArchiveError::MalformedKey(format!(
            "versions entry {tuple} carries no index"
        ))),
    }
}

fn key_by_index(resource: &str, namespace: &str, name: &str, index: u64, op: u8) -> Vec<u8> {
    Tuple(vec![
        index.into(),
        resource.into(),
        namespace.into(),
        name.into(),
        Element::Bytes(vec![op]),
    ])
    .pack()
}

fn key_by_type(resource: &str, namespace: &str, name: &str, index: u64) -> Vec<u8> {
    Tuple(vec![
        resource.into(),
        namespace.into(),
        name.into(),
        index.into(),
    ])
    .pack()
}

fn version_prefix(resource: &str, namespace: &str, name: &str) -> Vec<u8> {
    Tuple(vec![resource.into(), namespace.into(), name.into()]).pack()
}

fn uid_key(uid: &str) -> Vec<u8> {
    Tuple(vec![uid.into()]).pack()
}

fn deleted_key(resource: &str, namespace: &str, index: u64, uid: &str) -> Vec<u8> {
    Tuple(vec![
        resource.into(),
        namespace.into(),
        index.into(),
        uid.into(),
    ])
    .pack()
}

fn index_value(index: u64) -> Vec<u8> {
    Tuple(vec![index.into()]).pack()
}
