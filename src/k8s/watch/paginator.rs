/**
 * Paginated bulk reads
 *
 * A list read is a lazy stream of bounded pages that follows the server's
 * continuation token until a page arrives without one. The owning
 * subscription's liveness is the loop guard: once it is released no further
 * page is requested and no fetched page is dispatched.
 */
use super::errors::WatchError;
use super::kinds::ResourceKind;
use super::query::WatchQuery;
use super::store::{StoreEvent, WatchData};
use async_trait::async_trait;
use futures::{Stream, StreamExt, pin_mut};
use k8s_openapi::serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One page of a list read
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub resource_version: String,
    pub continue_token: Option<String>,
}

/// Where pages and single objects come from
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn list_page(
        &self,
        kind: &ResourceKind,
        query: &WatchQuery,
        page_size: u32,
        continue_token: Option<&str>,
    ) -> Result<Page, WatchError>;

    async fn get_object(&self, kind: &ResourceKind, query: &WatchQuery) -> Result<Value, WatchError>;
}

/// How an initial read ended
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// All pages dispatched; the last page's resourceVersion seeds the stream
    Completed { resource_version: String, pages: usize },
    Failed(WatchError),
    /// The subscription was released mid-read; nothing further was dispatched
    Abandoned,
}

enum Cursor {
    Start,
    Continue(String),
    Done,
}

pub struct Paginator {
    source: Arc<dyn PageSource>,
    kind: ResourceKind,
    query: WatchQuery,
    page_size: u32,
}

impl Paginator {
    #[must_use]
    pub fn new(source: Arc<dyn PageSource>, kind: ResourceKind, query: WatchQuery, page_size: u32) -> Self {
        Self {
            source,
            kind,
            query,
            page_size,
        }
    }

    /// Lazily fetch pages in order. Ends after the first page without a
    /// continuation token, after the first error, or as soon as `liveness`
    /// is cancelled. An explicit query limit reads a single page.
    pub fn pages(&self, liveness: CancellationToken) -> impl Stream<Item = Result<Page, WatchError>> + Send + '_ {
        futures::stream::unfold(Cursor::Start, move |cursor| {
            let liveness = liveness.clone();
            async move {
                let token = match cursor {
                    Cursor::Done => return None,
                    Cursor::Start => None,
                    Cursor::Continue(token) => Some(token),
                };
                if liveness.is_cancelled() {
                    debug!("✂️  Subscription released, abandoning pagination");
                    return None;
                }
                match self
                    .source
                    .list_page(&self.kind, &self.query, self.page_size, token.as_deref())
                    .await
                {
                    Ok(page) => {
                        let next = match (&page.continue_token, self.query.limit) {
                            (Some(token), None) if !token.is_empty() => Cursor::Continue(token.clone()),
                            _ => Cursor::Done,
                        };
                        Some((Ok(page), next))
                    }
                    Err(e) => Some((Err(e), Cursor::Done)),
                }
            }
        })
    }

    /// Run a full list read, handing the first page to `dispatch` as a
    /// `Replace` and every later page as an `Append`, so partial results are
    /// visible before the read completes.
    pub async fn initial_read<F>(&self, liveness: &CancellationToken, mut dispatch: F) -> ReadOutcome
    where
        F: FnMut(StoreEvent) + Send,
    {
        let pages = self.pages(liveness.clone());
        pin_mut!(pages);

        let mut count = 0usize;
        let mut last_version = None;
        while let Some(page) = pages.next().await {
            let page = match page {
                Ok(page) => page,
                Err(e) => return ReadOutcome::Failed(e),
            };
            if liveness.is_cancelled() {
                debug!("✂️  Dropping page fetched for a released subscription");
                return ReadOutcome::Abandoned;
            }
            let complete = page.continue_token.as_deref().is_none_or(str::is_empty) || self.query.limit.is_some();
            let resource_version = Some(page.resource_version.clone());
            debug!(
                "📄 Page {} for {}: {} items (rv {})",
                count + 1,
                self.kind.reference,
                page.items.len(),
                page.resource_version
            );
            if count == 0 {
                dispatch(StoreEvent::Replace {
                    data: WatchData::List(page.items),
                    resource_version,
                    complete,
                });
            } else {
                dispatch(StoreEvent::Append {
                    items: page.items,
                    resource_version,
                    complete,
                });
            }
            count += 1;
            last_version = Some(page.resource_version);
        }

        match last_version {
            Some(resource_version) => ReadOutcome::Completed {
                resource_version,
                pages: count,
            },
            None => ReadOutcome::Abandoned,
        }
    }

    /// Single-object read
    ///
    /// # Errors
    ///
    /// Returns the source's error, `NotFound` for a missing object
    pub async fn read_object(&self) -> Result<Value, WatchError> {
        self.source.get_object(&self.kind, &self.query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::watch::kinds::KindRef;
    use k8s_openapi::serde_json::json;
    use std::sync::Mutex;

    /// Serves `pages` pages, each with a continue token except the last
    struct CountingSource {
        pages: usize,
        calls: Mutex<Vec<Option<String>>>,
        fail_on: Option<usize>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl CountingSource {
        fn new(pages: usize) -> Self {
            Self {
                pages,
                calls: Mutex::new(Vec::new()),
                fail_on: None,
                cancel_after: None,
            }
        }
    }

    #[async_trait]
    impl PageSource for CountingSource {
        async fn list_page(
            &self,
            _kind: &ResourceKind,
            _query: &WatchQuery,
            _page_size: u32,
            continue_token: Option<&str>,
        ) -> Result<Page, WatchError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(continue_token.map(ToString::to_string));
                calls.len()
            };
            if self.fail_on == Some(n) {
                return Err(WatchError::fetch(Some(500), "etcd timeout"));
            }
            if let Some((after, token)) = &self.cancel_after {
                if *after == n {
                    token.cancel();
                }
            }
            Ok(Page {
                items: vec![json!({"metadata": {"name": format!("item-{n}")}})],
                resource_version: n.to_string(),
                continue_token: (n < self.pages).then(|| format!("token-{n}")),
            })
        }

        async fn get_object(&self, _kind: &ResourceKind, _query: &WatchQuery) -> Result<Value, WatchError> {
            Err(WatchError::NotFound("x".to_string()))
        }
    }

    fn paginator(source: Arc<CountingSource>, query: WatchQuery) -> Paginator {
        let kind = ResourceKind::new(KindRef::new("", "v1", "Pod"), "pods");
        Paginator::new(source, kind, query, 250)
    }

    #[tokio::test]
    async fn test_follows_continue_tokens_until_exhausted() {
        let source = Arc::new(CountingSource::new(4));
        let pager = paginator(source.clone(), WatchQuery::list());
        let liveness = CancellationToken::new();

        let mut events = Vec::new();
        let outcome = pager.initial_read(&liveness, |e| events.push(e)).await;

        assert_eq!(
            outcome,
            ReadOutcome::Completed {
                resource_version: "4".to_string(),
                pages: 4
            }
        );
        let calls = source.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                None,
                Some("token-1".to_string()),
                Some("token-2".to_string()),
                Some("token-3".to_string())
            ]
        );
        assert!(matches!(events[0], StoreEvent::Replace { complete: false, .. }));
        assert!(matches!(events[1], StoreEvent::Append { complete: false, .. }));
        assert!(matches!(events[3], StoreEvent::Append { complete: true, .. }));
    }

    #[tokio::test]
    async fn test_page_error_stops_the_read() {
        let mut source = CountingSource::new(5);
        source.fail_on = Some(2);
        let source = Arc::new(source);
        let pager = paginator(source.clone(), WatchQuery::list());

        let mut events = Vec::new();
        let outcome = pager.initial_read(&CancellationToken::new(), |e| events.push(e)).await;
        assert!(matches!(outcome, ReadOutcome::Failed(WatchError::Fetch { code: Some(500), .. })));
        assert_eq!(events.len(), 1);
        assert_eq!(source.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_release_mid_read_stops_requests_and_dispatch() {
        let liveness = CancellationToken::new();
        let mut source = CountingSource::new(5);
        source.cancel_after = Some((2, liveness.clone()));
        let source = Arc::new(source);
        let pager = paginator(source.clone(), WatchQuery::list());

        let mut events = Vec::new();
        let outcome = pager.initial_read(&liveness, |e| events.push(e)).await;
        assert_eq!(outcome, ReadOutcome::Abandoned);
        // page 2 was fetched while live but released before dispatch
        assert_eq!(events.len(), 1);
        assert_eq!(source.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_explicit_limit_reads_one_page() {
        let source = Arc::new(CountingSource::new(3));
        let pager = paginator(source.clone(), WatchQuery::list().limit(1));

        let mut events = Vec::new();
        let outcome = pager.initial_read(&CancellationToken::new(), |e| events.push(e)).await;
        assert!(matches!(outcome, ReadOutcome::Completed { pages: 1, .. }));
        assert!(matches!(events[0], StoreEvent::Replace { complete: true, .. }));
        assert_eq!(source.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pages_stream_is_lazy() {
        let source = Arc::new(CountingSource::new(10));
        let pager = paginator(source.clone(), WatchQuery::list());
        let pages = pager.pages(CancellationToken::new());
        pin_mut!(pages);

        let first = pages.next().await.unwrap().unwrap();
        assert_eq!(first.continue_token.as_deref(), Some("token-1"));
        assert_eq!(source.calls.lock().unwrap().len(), 1);
    }
}
