pub mod gc;
pub mod key;
mod kv_storage;
mod s3_storage;
mod stream;
mod types;

pub use gc::{GcCoordinator, GcPolicy};
pub use key::{decode_key, encode_key, encode_range_bounds, KeyRange};
pub use kv_storage::KvStorage;
pub use s3_storage::S3Storage;
pub use types::{
    generate_disambiguator, NewProfile, ProfileId, ProfileMeta, ProfileRecord, ProfileType, Query,
};

use crate::error::{GcError, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// Lazy, single-use result of a range query, ordered by creation time.
/// Dropping it early releases the underlying scan.
pub type ProfileStream = BoxStream<'static, Result<ProfileMeta, StorageError>>;

#[async_trait]
pub trait Writer: Send + Sync {
    /// Persists one profile and returns its stored ID once the backend has
    /// made the write durable.
    async fn write_profile(
        &self,
        profile: NewProfile,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<ProfileId, StorageError>;
}

#[async_trait]
pub trait Reader: Send + Sync {
    async fn read_profile(
        &self,
        id: &ProfileId,
        cancel: &CancellationToken,
    ) -> Result<ProfileRecord, StorageError>;

    /// Validation errors are returned up front; I/O errors and cancellation
    /// arrive as the last item of the stream.
    fn find_profiles(
        &self,
        query: Query,
        cancel: &CancellationToken,
    ) -> Result<ProfileStream, StorageError>;
}

/// Backends that must be told to reclaim space occupied by expired entries.
#[async_trait]
pub trait Reclaim: Send + Sync {
    async fn reclaim(&self, discard_ratio: f64) -> Result<ReclaimStats, GcError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub entries: u64,
    pub bytes: u64,
}
