use crate::config::S3Settings;
use crate::error::StorageError;
use async_trait::async_trait;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{config::Region, Client};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::key::{decode_key, type_prefix, KeyRange};
use super::stream::{cancellable, finish};
use super::{
    NewProfile, ProfileId, ProfileMeta, ProfileRecord, ProfileStream, ProfileType, Query, Reader,
    Writer,
};

/// Profile store on an S3 bucket. The object key is the storage key and the
/// body is the raw payload.
///
/// Retention is not enforced here: objects live until a bucket lifecycle
/// rule removes them. The engine never deletes.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub async fn new(settings: &S3Settings) -> Result<Self, StorageError> {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::v2024_03_28())
            .region(Region::new(settings.region.clone()))
            .load()
            .await;

        // The SDK retries; we don't add our own on top.
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .retry_config(RetryConfig::standard().with_max_attempts(settings.max_retries + 1))
            .force_path_style(settings.force_path_style());
        if let Some(endpoint) = settings.endpoint() {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        let storage = Self::from_client(client, settings.bucket.clone());
        storage.check_bucket().await?;
        info!(
            bucket = %storage.bucket,
            region = %settings.region,
            "Using S3 profile storage"
        );
        warn!(
            "S3 storage does not expire profiles; configure a lifecycle rule on bucket {:?} to bound retention",
            storage.bucket
        );
        Ok(storage)
    }

    pub fn from_client(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Fails with `Open` when the bucket is missing or the credentials
    /// cannot reach it.
    pub async fn check_bucket(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StorageError::Open(format!(
                    "bucket {:?} is not reachable: {}",
                    self.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    fn list(&self, profile_type: ProfileType, service: &str, range: KeyRange) -> ProfileStream {
        let state = ListState {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            prefix: String::from_utf8_lossy(&type_prefix(service, profile_type)).into_owned(),
            start_after: String::from_utf8_lossy(&range.lower).into_owned(),
            range,
            continuation: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(Some(state), |state| async move {
            let mut st = state?;
            loop {
                if let Some(meta) = st.buffer.pop_front() {
                    return Some((Ok(meta), Some(st)));
                }
                if st.exhausted {
                    return None;
                }
                if let Err(e) = st.next_page().await {
                    return Some((Err(e), None));
                }
            }
        })
        .boxed()
    }
}

/// Pagination cursor of one listing. Owned by the stream; dropping the
/// stream drops the cursor.
struct ListState {
    client: Client,
    bucket: String,
    prefix: String,
    start_after: String,
    range: KeyRange,
    continuation: Option<String>,
    buffer: VecDeque<ProfileMeta>,
    exhausted: bool,
}

impl ListState {
    async fn next_page(&mut self) -> Result<(), StorageError> {
        let request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix);
        // S3 ignores start_after once a continuation token is present.
        let request = match self.continuation.take() {
            Some(token) => request.continuation_token(token),
            None => request.start_after(&self.start_after),
        };

        let page = request
            .send()
            .await
            .map_err(|e| StorageError::ReadFailed(DisplayErrorContext(&e).to_string()))?;

        for object in page.contents() {
            let Some(key) = object.key() else {
                continue;
            };
            if key.as_bytes() >= self.range.upper.as_slice() {
                self.exhausted = true;
                return Ok(());
            }
            if !self.range.contains(key.as_bytes()) {
                continue;
            }
            match decode_key(key.as_bytes()) {
                Ok(meta) => self.buffer.push_back(meta),
                Err(e) => error!(bucket = %self.bucket, "Skipping foreign object: {}", e),
            }
        }

        match page.next_continuation_token() {
            Some(token) if page.is_truncated().unwrap_or(false) => {
                self.continuation = Some(token.to_string());
            }
            _ => self.exhausted = true,
        }
        Ok(())
    }
}

#[async_trait]
impl Writer for S3Storage {
    async fn write_profile(
        &self,
        profile: NewProfile,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<ProfileId, StorageError> {
        let meta = profile.into_meta();
        let id = meta.id()?;
        let size = payload.len();

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(id.as_str())
            .content_type("application/octet-stream")
            .body(ByteStream::from(payload));

        cancellable(cancel, async move {
            request
                .send()
                .await
                .map_err(|e| StorageError::WriteFailed(DisplayErrorContext(&e).to_string()))
        })
        .await?;

        debug!(
            service = %meta.service,
            profile_type = %meta.profile_type,
            id = %id,
            size,
            "Uploaded profile to S3"
        );
        Ok(id)
    }
}

#[async_trait]
impl Reader for S3Storage {
    async fn read_profile(
        &self,
        id: &ProfileId,
        cancel: &CancellationToken,
    ) -> Result<ProfileRecord, StorageError> {
        let meta = id.meta()?;

        let payload = cancellable(cancel, async {
            let obj = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(id.as_str())
                .send()
                .await
            {
                Ok(obj) => obj,
                Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                    return Err(StorageError::NotFound(id.to_string()));
                }
                Err(e) => {
                    return Err(StorageError::ReadFailed(DisplayErrorContext(&e).to_string()));
                }
            };

            obj.body
                .collect()
                .await
                .map(|data| data.into_bytes())
                .map_err(|e| StorageError::ReadFailed(e.to_string()))
        })
        .await?;

        Ok(ProfileRecord { meta, payload })
    }

    fn find_profiles(
        &self,
        query: Query,
        cancel: &CancellationToken,
    ) -> Result<ProfileStream, StorageError> {
        let streams = query
            .key_ranges()?
            .into_iter()
            .map(|(profile_type, range)| self.list(profile_type, &query.service, range))
            .collect();
        Ok(finish(streams, query.limit, cancel))
    }
}
