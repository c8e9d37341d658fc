use crate::config::{Settings, StorageBackend};
use crate::prelude::*;
use crate::storage::{GcCoordinator, GcPolicy, KvStorage, Reader, S3Storage, Writer};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;

pub struct AppState {
    pub reader: Arc<dyn Reader>,
    pub writer: Arc<dyn Writer>,
    /// Name of the selected backend, reported by `/health`.
    pub backend: &'static str,
    pub start_time: SystemTime,
}

/// Background resources owned by the running backend. Must be shut down
/// after the server has stopped accepting requests.
pub struct StorageLifecycle {
    kv: Option<(KvStorage, GcCoordinator)>,
}

impl AppState {
    pub fn new(
        reader: Arc<dyn Reader>,
        writer: Arc<dyn Writer>,
        backend: &'static str,
    ) -> Arc<Self> {
        Arc::new(AppState {
            reader,
            writer,
            backend,
            start_time: SystemTime::now(),
        })
    }

    /// Opens the configured backend. For the embedded store this also starts
    /// the reclamation loop.
    pub async fn from_settings(settings: &Settings) -> Result<(Arc<Self>, StorageLifecycle)> {
        match settings.storage_backend()? {
            StorageBackend::Kv(kv) => {
                let storage = KvStorage::open(&kv.dir, kv.profile_ttl())?;
                let gc = GcCoordinator::start(
                    Arc::new(storage.clone()),
                    GcPolicy {
                        interval: kv.gc_interval(),
                        discard_ratio: kv.gc_discard_ratio,
                    },
                );
                info!("Using embedded profile storage in {}", kv.dir);

                let shared = Arc::new(storage.clone());
                let state = Self::new(shared.clone(), shared, "kv");
                Ok((state, StorageLifecycle { kv: Some((storage, gc)) }))
            }
            StorageBackend::S3(s3) => {
                let shared = Arc::new(S3Storage::new(s3).await?);
                let state = Self::new(shared.clone(), shared, "s3");
                Ok((state, StorageLifecycle { kv: None }))
            }
        }
    }
}

impl StorageLifecycle {
    /// Stops reclamation, then closes the store.
    pub async fn shutdown(self) {
        if let Some((storage, gc)) = self.kv {
            gc.stop().await;
            storage.close();
        }
    }
}
