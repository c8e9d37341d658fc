use crate::error::StorageError;
use futures::stream::{self, StreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;

use super::types::ProfileMeta;
use super::ProfileStream;

/// Runs `fut` unless `cancel` fires first. Dropping `fut` aborts whatever
/// request it had in flight.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        result = fut => result,
    }
}

/// Applies the query-level wrappers shared by every backend: merge,
/// cancellation and limit.
pub(crate) fn finish(
    streams: Vec<ProfileStream>,
    limit: Option<usize>,
    cancel: &CancellationToken,
) -> ProfileStream {
    let merged = until_cancelled(merge_by_time(streams), cancel.clone());
    match limit {
        Some(n) => merged.take(n).boxed(),
        None => merged,
    }
}

struct Head {
    stream: ProfileStream,
    next: Option<ProfileMeta>,
    exhausted: bool,
}

/// Merges per-type streams, each already ordered by key, into one stream
/// ordered by creation time. The first error ends the merged stream.
pub(crate) fn merge_by_time(mut streams: Vec<ProfileStream>) -> ProfileStream {
    if streams.len() == 1 {
        if let Some(single) = streams.pop() {
            return single;
        }
    }

    let heads: Vec<Head> = streams
        .into_iter()
        .map(|stream| Head {
            stream,
            next: None,
            exhausted: false,
        })
        .collect();

    stream::unfold(Some(heads), |heads| async move {
        let mut heads = heads?;
        for head in heads.iter_mut() {
            if head.next.is_some() || head.exhausted {
                continue;
            }
            match head.stream.next().await {
                Some(Ok(meta)) => head.next = Some(meta),
                Some(Err(e)) => return Some((Err(e), None)),
                None => head.exhausted = true,
            }
        }

        let earliest = heads
            .iter()
            .enumerate()
            .filter_map(|(i, head)| head.next.as_ref().map(|meta| (i, meta)))
            .min_by(|(_, a), (_, b)| {
                (a.created_at, a.profile_type, &a.disambiguator).cmp(&(
                    b.created_at,
                    b.profile_type,
                    &b.disambiguator,
                ))
            })
            .map(|(i, _)| i)?;

        let meta = heads[earliest].next.take()?;
        Some((Ok(meta), Some(heads)))
    })
    .boxed()
}

/// Yields `Cancelled` once the token fires and then ends, dropping the inner
/// stream and whatever scan state it owns.
pub(crate) fn until_cancelled(inner: ProfileStream, cancel: CancellationToken) -> ProfileStream {
    stream::unfold(Some((inner, cancel)), |state| async move {
        let (mut inner, cancel) = state?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Some((Err(StorageError::Cancelled), None)),
            item = inner.next() => item.map(|item| {
                let keep_going = item.is_ok();
                (item, keep_going.then_some((inner, cancel)))
            }),
        }
    })
    .boxed()
}
