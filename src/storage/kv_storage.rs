use crate::error::{GcError, StorageError};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::VecDeque;
use std::fs;
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::key::{decode_key, KeyRange};
use super::stream::{cancellable, finish};
use super::{
    NewProfile, ProfileId, ProfileMeta, ProfileRecord, ProfileStream, Query, Reader, Reclaim,
    ReclaimStats, Writer,
};

/// key -> expires_at (u64 BE Unix millis) ++ payload
const PROFILES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("profiles");
/// expires_at (u64 BE millis) ++ key -> payload length
const EXPIRY: TableDefinition<&[u8], u64> = TableDefinition::new("profile_expiry");

const DB_FILE: &str = "profiles.redb";
const EXPIRES_AT_LEN: usize = 8;
const SCAN_BATCH: usize = 256;
/// Oldest expiry-index entries considered per reclamation pass.
const RECLAIM_SEGMENT: usize = 1024;

/// Profile store on a local redb database. Entries carry an expiration set
/// at write time; expired entries are invisible to reads and are deleted by
/// [`KvStorage::reclaim`], which the GC coordinator drives.
#[derive(Clone)]
pub struct KvStorage {
    handle: Arc<Handle>,
    ttl: Duration,
}

struct Handle {
    db: RwLock<Option<Arc<Database>>>,
}

impl Handle {
    fn get(&self) -> Result<Arc<Database>, StorageError> {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StorageError::Closed)
    }
}

impl KvStorage {
    pub fn open(dir: impl AsRef<Path>, ttl: Duration) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            StorageError::Open(format!("could not create {}: {}", dir.display(), e))
        })?;

        let path = dir.join(DB_FILE);
        let db = Database::create(&path).map_err(|e| {
            StorageError::Open(format!("could not open db {}: {}", path.display(), e))
        })?;

        // Create both tables up front so read transactions never see them missing.
        let txn = db.begin_write().map_err(open_failed)?;
        txn.open_table(PROFILES).map_err(open_failed)?;
        txn.open_table(EXPIRY).map_err(open_failed)?;
        txn.commit().map_err(open_failed)?;

        info!("Opened profile store at {:?} with ttl {:?}", path, ttl);
        Ok(Self {
            handle: Arc::new(Handle {
                db: RwLock::new(Some(Arc::new(db))),
            }),
            ttl,
        })
    }

    /// Releases the database. Every later call, including reclamation, fails
    /// with `Closed`; the file is closed once in-flight operations finish.
    pub fn close(&self) {
        let db = self
            .handle
            .db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if db.is_some() {
            info!("Closed profile store");
        }
    }

    fn expires_at(&self) -> u64 {
        now_millis().saturating_add(self.ttl.as_millis().try_into().unwrap_or(u64::MAX))
    }

    fn scan(&self, range: KeyRange, now: u64) -> ProfileStream {
        let state = ScanState {
            handle: self.handle.clone(),
            range,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(Some(state), move |state| async move {
            let mut st = state?;
            loop {
                if let Some(meta) = st.buffer.pop_front() {
                    return Some((Ok(meta), Some(st)));
                }
                if st.exhausted {
                    return None;
                }

                let db = match st.handle.get() {
                    Ok(db) => db,
                    Err(e) => return Some((Err(e), None)),
                };
                let range = st.range.clone();
                let after = st.after.clone();
                let batch = tokio::task::spawn_blocking(move || {
                    scan_batch(&db, &range, after.as_deref(), now)
                })
                .await
                .map_err(|e| StorageError::ReadFailed(e.to_string()))
                .and_then(|batch| batch);

                match batch {
                    Ok(batch) => {
                        st.buffer.extend(batch.metas);
                        st.after = batch.last_key.or(st.after);
                        st.exhausted = batch.exhausted;
                    }
                    Err(e) => return Some((Err(e), None)),
                }
            }
        })
        .boxed()
    }
}

struct ScanState {
    handle: Arc<Handle>,
    range: KeyRange,
    after: Option<Vec<u8>>,
    buffer: VecDeque<ProfileMeta>,
    exhausted: bool,
}

struct Batch {
    metas: Vec<ProfileMeta>,
    last_key: Option<Vec<u8>>,
    exhausted: bool,
}

#[async_trait]
impl Writer for KvStorage {
    async fn write_profile(
        &self,
        profile: NewProfile,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<ProfileId, StorageError> {
        let meta = profile.into_meta();
        let key = meta.key()?;
        let id = ProfileId::from_key(key.clone())?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let db = self.handle.get()?;
        let expires_at = self.expires_at();
        let cancel = cancel.clone();
        let size = payload.len();
        tokio::task::spawn_blocking(move || put(&db, &key, expires_at, &payload, &cancel))
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))??;

        debug!(
            service = %meta.service,
            profile_type = %meta.profile_type,
            id = %id,
            size,
            "Stored profile"
        );
        Ok(id)
    }
}

#[async_trait]
impl Reader for KvStorage {
    async fn read_profile(
        &self,
        id: &ProfileId,
        cancel: &CancellationToken,
    ) -> Result<ProfileRecord, StorageError> {
        let meta = id.meta()?;
        let db = self.handle.get()?;
        let key = id.as_bytes().to_vec();
        let now = now_millis();

        let payload = cancellable(cancel, async move {
            tokio::task::spawn_blocking(move || get(&db, &key, now))
                .await
                .map_err(|e| StorageError::ReadFailed(e.to_string()))?
        })
        .await?;

        match payload {
            Some(payload) => Ok(ProfileRecord { meta, payload }),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    fn find_profiles(
        &self,
        query: Query,
        cancel: &CancellationToken,
    ) -> Result<ProfileStream, StorageError> {
        let ranges = query.key_ranges()?;
        self.handle.get()?;

        let now = now_millis();
        let streams = ranges
            .into_iter()
            .map(|(_, range)| self.scan(range, now))
            .collect();
        Ok(finish(streams, query.limit, cancel))
    }
}

#[async_trait]
impl Reclaim for KvStorage {
    async fn reclaim(&self, discard_ratio: f64) -> Result<ReclaimStats, GcError> {
        let db = self.handle.get()?;
        let now = now_millis();
        tokio::task::spawn_blocking(move || reclaim_expired(&db, now, discard_ratio))
            .await
            .map_err(|e| GcError::Backend(StorageError::WriteFailed(e.to_string())))?
    }
}

fn put(
    db: &Database,
    key: &[u8],
    expires_at: u64,
    payload: &[u8],
    cancel: &CancellationToken,
) -> Result<(), StorageError> {
    let mut value = vec![0u8; EXPIRES_AT_LEN + payload.len()];
    BigEndian::write_u64(&mut value[..EXPIRES_AT_LEN], expires_at);
    value[EXPIRES_AT_LEN..].copy_from_slice(payload);

    let txn = db.begin_write().map_err(write_failed)?;
    {
        let mut profiles = txn.open_table(PROFILES).map_err(write_failed)?;
        let mut expiry = txn.open_table(EXPIRY).map_err(write_failed)?;
        profiles
            .insert(key, value.as_slice())
            .map_err(write_failed)?;
        expiry
            .insert(expiry_key(expires_at, key).as_slice(), payload.len() as u64)
            .map_err(write_failed)?;
    }

    if cancel.is_cancelled() {
        txn.abort().map_err(write_failed)?;
        return Err(StorageError::Cancelled);
    }
    txn.commit().map_err(write_failed)
}

fn get(db: &Database, key: &[u8], now: u64) -> Result<Option<Bytes>, StorageError> {
    let txn = db.begin_read().map_err(read_failed)?;
    let profiles = txn.open_table(PROFILES).map_err(read_failed)?;
    let Some(value) = profiles.get(key).map_err(read_failed)? else {
        return Ok(None);
    };

    let (expires_at, payload) = split_value(value.value())?;
    if expires_at <= now {
        return Ok(None);
    }
    Ok(Some(Bytes::copy_from_slice(payload)))
}

fn scan_batch(
    db: &Database,
    range: &KeyRange,
    after: Option<&[u8]>,
    now: u64,
) -> Result<Batch, StorageError> {
    let txn = db.begin_read().map_err(read_failed)?;
    let profiles = txn.open_table(PROFILES).map_err(read_failed)?;

    let start = match after {
        Some(last) => Bound::Excluded(last),
        None => Bound::Included(range.lower.as_slice()),
    };
    let end = Bound::Excluded(range.upper.as_slice());

    let mut batch = Batch {
        metas: Vec::new(),
        last_key: None,
        exhausted: true,
    };
    let mut scanned = 0;
    for entry in profiles.range::<&[u8]>((start, end)).map_err(read_failed)? {
        let (key, value) = entry.map_err(read_failed)?;
        let key = key.value();
        batch.last_key = Some(key.to_vec());
        scanned += 1;

        let (expires_at, _) = split_value(value.value())?;
        if expires_at > now {
            match decode_key(key) {
                Ok(meta) => batch.metas.push(meta),
                Err(e) => error!("Skipping undecodable key in profile store: {}", e),
            }
        }

        if scanned == SCAN_BATCH {
            batch.exhausted = false;
            break;
        }
    }
    Ok(batch)
}

/// Deletes expired entries from the oldest segment of the expiry index, but
/// only when at least `discard_ratio` of that segment has expired.
fn reclaim_expired(db: &Database, now: u64, discard_ratio: f64) -> Result<ReclaimStats, GcError> {
    let txn = db.begin_write().map_err(write_failed)?;
    let stats = {
        let mut profiles = txn.open_table(PROFILES).map_err(write_failed)?;
        let mut expiry = txn.open_table(EXPIRY).map_err(write_failed)?;

        let segment = expiry
            .iter()
            .map_err(write_failed)?
            .take(RECLAIM_SEGMENT)
            .map(|entry| entry.map(|(k, v)| (k.value().to_vec(), v.value())))
            .collect::<Result<Vec<_>, _>>()
            .map_err(write_failed)?;

        let expired: Vec<&(Vec<u8>, u64)> = segment
            .iter()
            .filter(|(k, _)| {
                k.len() >= EXPIRES_AT_LEN && BigEndian::read_u64(&k[..EXPIRES_AT_LEN]) <= now
            })
            .collect();

        if expired.is_empty() || (expired.len() as f64) < discard_ratio * segment.len() as f64 {
            None
        } else {
            let mut stats = ReclaimStats::default();
            for (index_key, size) in expired {
                profiles
                    .remove(&index_key[EXPIRES_AT_LEN..])
                    .map_err(write_failed)?;
                expiry.remove(index_key.as_slice()).map_err(write_failed)?;
                stats.entries += 1;
                stats.bytes += size;
            }
            debug!(
                remaining = profiles.len().unwrap_or_default(),
                "Reclaimed expired profiles"
            );
            Some(stats)
        }
    };

    match stats {
        Some(stats) => {
            txn.commit().map_err(write_failed)?;
            Ok(stats)
        }
        None => {
            txn.abort().map_err(write_failed)?;
            Err(GcError::NothingToReclaim)
        }
    }
}

fn expiry_key(expires_at: u64, key: &[u8]) -> Vec<u8> {
    let mut index_key = vec![0u8; EXPIRES_AT_LEN];
    BigEndian::write_u64(&mut index_key, expires_at);
    index_key.extend_from_slice(key);
    index_key
}

fn split_value(value: &[u8]) -> Result<(u64, &[u8]), StorageError> {
    if value.len() < EXPIRES_AT_LEN {
        return Err(StorageError::ReadFailed(format!(
            "stored value is {} bytes, shorter than its header",
            value.len()
        )));
    }
    let (header, payload) = value.split_at(EXPIRES_AT_LEN);
    Ok((BigEndian::read_u64(header), payload))
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn open_failed(e: impl std::fmt::Display) -> StorageError {
    StorageError::Open(e.to_string())
}

fn write_failed(e: impl std::fmt::Display) -> StorageError {
    StorageError::WriteFailed(e.to_string())
}

fn read_failed(e: impl std::fmt::Display) -> StorageError {
    StorageError::ReadFailed(e.to_string())
}
