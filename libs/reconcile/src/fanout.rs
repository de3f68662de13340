//! Bounded concurrent fan-out of store writes.

use std::fmt::Display;
use std::future::Future;

use futures_util::stream::{self, StreamExt};
use tracing::error;

/// Run `f` over `items` with at most `limit` calls in flight.
///
/// Every item runs to completion; results come back in completion order.
pub async fn fan_out<I, F, Fut, T>(items: I, limit: usize, f: F) -> Vec<T>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = T>,
{
    stream::iter(items)
        .map(f)
        .buffer_unordered(limit.max(1))
        .collect()
        .await
}

/// Keep the first error of a batch and log the others.
pub fn first_error<E: Display>(results: Vec<Result<(), E>>, operation: &str) -> Option<E> {
    let mut first = None;
    for err in results.into_iter().filter_map(Result::err) {
        if first.is_none() {
            first = Some(err);
        } else {
            error!(operation, error = %err, "Additional failure in batch");
        }
    }
    first
}
