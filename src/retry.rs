//! Bounded-time retry of fallible operations.
//!
//! [`retry`] re-runs an operation until it succeeds, fails with an error no
//! classifier tolerates, or the context finishes. Attempts are immediate: no
//! backoff or jitter is applied, the context deadline is the only bound. That
//! suits a test harness talking to a local API server, not a production client.
//!
//! Each attempt runs on its own task so a hung attempt can be raced against
//! the context. When the context wins, the attempt is abandoned rather than
//! aborted: its side effects may still land after the caller stopped waiting.
//! Only idempotent operations should be retried here.
//!
//! # Example
//!
//! ```ignore
//! use lattice_harness::error::is_json_syntax_error;
//! use lattice_harness::retry::retry;
//!
//! let ctx = Context::background().with_timeout(Duration::from_secs(30));
//! let pod = retry(&ctx, |_| {
//!     let store = store.clone();
//!     async move { store.get(&gvk, &key).await }
//! }, &[is_json_syntax_error]).await?;
//! ```

use std::future::Future;

use tracing::{debug, warn};

use crate::context::Context;
use crate::Error;

/// Predicate answering "is this error tolerable?"
///
/// Classifiers passed to [`retry`] are OR-ed together; order doesn't matter.
pub type ErrorClassifier = fn(&Error) -> bool;

/// Whether any classifier tolerates `err`
pub fn is_tolerated(err: &Error, classifiers: &[ErrorClassifier]) -> bool {
    classifiers.iter().any(|classify| classify(err))
}

/// Retry `operation` until it succeeds, fails fatally, or `ctx` finishes.
///
/// * Success returns the attempt's value.
/// * An error rejected by every classifier is returned immediately.
/// * When `ctx` finishes, the most recent tolerated error is returned, or the
///   context's own error when no attempt has failed yet.
///
/// Attempts are strictly sequential: attempt N+1 starts only after attempt N's
/// result has been observed.
pub async fn retry<T, F, Fut>(
    ctx: &Context,
    mut operation: F,
    classifiers: &[ErrorClassifier],
) -> Result<T, Error>
where
    F: FnMut(Context) -> Fut,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
    T: Send + 'static,
{
    let mut last_error: Option<Error> = None;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let handle = tokio::spawn(operation(ctx.clone()));

        tokio::select! {
            biased;

            _ = ctx.done() => {
                // Dropping the handle detaches the in-flight attempt
                return Err(match last_error {
                    Some(err) => err,
                    None => ctx.err().map(Error::from).unwrap_or_else(|| {
                        Error::internal_with_context("retry", "context finished without a reason")
                    }),
                });
            }
            joined = handle => {
                let result = joined.map_err(|e| {
                    Error::internal_with_context("retry", format!("attempt {attempt} aborted: {e}"))
                })?;

                match result {
                    Ok(value) => {
                        if attempt > 1 {
                            debug!(attempt, "operation succeeded after retries");
                        }
                        return Ok(value);
                    }
                    Err(err) if is_tolerated(&err, classifiers) => {
                        warn!(attempt, error = %err, "tolerated error, retrying");
                        last_error = Some(err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }
}
