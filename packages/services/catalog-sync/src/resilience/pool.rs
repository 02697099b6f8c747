use futures::stream::{self, StreamExt};
use std::future::Future;

/// Applies `f` to every item with at most `limit` futures in flight.
/// Results come back in input order; a failing item only occupies its own slot.
pub async fn map_concurrent<T, R, F, Fut>(items: Vec<T>, limit: usize, mut f: F) -> Vec<R>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = R>,
{
    let limit = limit.max(1);
    let mut indexed: Vec<(usize, R)> = stream::iter(items.into_iter().enumerate().map(|(idx, item)| {
        let fut = f(item);
        async move { (idx, fut.await) }
    }))
    .buffer_unordered(limit)
    .collect()
    .await;
    indexed.sort_by_key(|(idx, _)| *idx);
    indexed.into_iter().map(|(_, r)| r).collect()
}
