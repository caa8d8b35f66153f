//! Handler invocation shared by the delivery loops.

use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use futures::FutureExt;
use tracing::error;

use super::MessageHandler;

/// Runs `handler` on `payload`, logging failures and panics so the calling
/// loop keeps delivering. Panics raised while building the future are caught
/// as well as those raised while polling it.
pub(crate) async fn dispatch(subject: &str, handler: &MessageHandler, payload: Bytes) {
    match AssertUnwindSafe(async { handler(payload).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(subject, error = %err, "message handler failed"),
        Err(_) => error!(subject, "message handler panicked"),
    }
}
