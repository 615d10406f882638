use std::sync::Arc;

use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use mirror_common::error::{MirrorError, MirrorResult};
use mirror_common::retry::{retry_with_backoff, RetryError, RetryPolicy};
use mirror_common::time::Timestamp;

use crate::source::{ChangeQuery, IssueSource, SourceRecord};

/// Pagination cursor: `None` once the last page has been read.
type Cursor = Option<Option<String>>;

pub struct ChangeSetFetcher {
    source: Arc<dyn IssueSource>,
    retry: RetryPolicy,
    page_size: u32,
    max_results: Option<usize>,
    with_comments: bool,
}

impl ChangeSetFetcher {
    pub fn new(source: Arc<dyn IssueSource>, retry: RetryPolicy, page_size: u32) -> Self {
        Self {
            source,
            retry,
            page_size,
            max_results: None,
            with_comments: false,
        }
    }

    pub fn with_max_results(mut self, max_results: Option<usize>) -> Self {
        self.max_results = max_results;
        self
    }

    /// Fetch comments for each record so the latest one can be mapped.
    pub fn with_comments(mut self, enabled: bool) -> Self {
        self.with_comments = enabled;
        self
    }

    /// Lazily stream issues modified strictly after `since`, in creation order.
    ///
    /// Pages are requested only as the stream is polled. The first error ends the stream.
    pub fn fetch_changes<'a>(
        &'a self,
        since: Option<Timestamp>,
        base_filter: &str,
    ) -> BoxStream<'a, MirrorResult<SourceRecord>> {
        let query = ChangeQuery {
            base_filter: base_filter.to_owned(),
            since,
        };

        let pages = stream::try_unfold(Some(None), move |cursor: Cursor| {
            let query = query.clone();
            async move { self.next_page(&query, cursor).await }
        });

        let records = pages
            .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, MirrorError>)))
            .try_flatten()
            .try_filter(move |record| future::ready(is_after(record, since)));

        let limited = match self.max_results {
            Some(limit) => records.take(limit).boxed(),
            None => records.boxed(),
        };

        limited
            .and_then(move |record| self.with_latest_comment(record))
            .boxed()
    }

    async fn next_page(
        &self,
        query: &ChangeQuery,
        cursor: Cursor,
    ) -> MirrorResult<Option<(Vec<SourceRecord>, Cursor)>> {
        let Some(token) = cursor else {
            return Ok(None);
        };

        let page = retry_with_backoff(&self.retry, "source.search", || {
            self.source.search(query, token.as_deref(), self.page_size)
        })
        .await
        .map_err(fetch_failed)?;

        tracing::debug!(
            records = page.records.len(),
            more = page.next_page_token.is_some(),
            "fetched change-set page"
        );

        let next = page.next_page_token.map(Some);
        Ok(Some((page.records, next)))
    }

    async fn with_latest_comment(&self, mut record: SourceRecord) -> MirrorResult<SourceRecord> {
        if !self.with_comments {
            return Ok(record);
        }

        let comments = retry_with_backoff(&self.retry, "source.comments", || {
            self.source.get_comments(&record.key)
        })
        .await;

        match comments {
            Ok(comments) => {
                record.latest_comment = comments.into_iter().max_by_key(|c| c.created);
            }
            Err(e) => {
                // The record must not be written with blank comment columns.
                tracing::warn!(key = %record.key, error = %e, "failed to fetch comments");
                record.comments_error = Some(e.to_string());
            }
        }
        Ok(record)
    }
}

/// Records without a parseable `updated` pass through so the mapper can report them.
fn is_after(record: &SourceRecord, since: Option<Timestamp>) -> bool {
    match (since, record.updated()) {
        (Some(since), Some(updated)) => updated > since,
        _ => true,
    }
}

fn fetch_failed(err: RetryError<MirrorError>) -> MirrorError {
    match err {
        RetryError::Permanent(MirrorError::SourceFetchFailed(msg)) => MirrorError::SourceFetchFailed(msg),
        other => MirrorError::SourceFetchFailed(other.to_string()),
    }
}
