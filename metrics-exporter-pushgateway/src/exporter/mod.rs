use std::future::Future;
use std::pin::Pin;
use std::thread;

use thiserror::Error as ThisError;
use tokio::runtime;
use tracing::Dispatch;

use crate::common::BuildError;

/// Error types possible from an exporter.
#[derive(Debug, ThisError)]
pub enum ExporterError {
    /// The listener socket could not be driven by the runtime.
    #[error("HTTP listener I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type for Future implementing an exporter.
pub type ExporterFuture = Pin<Box<dyn Future<Output = Result<(), ExporterError>> + Send + 'static>>;

pub(crate) mod builder;
pub(crate) mod forwarder;
pub(crate) mod http_listener;
pub(crate) mod push_gateway;
pub(crate) mod transport;

/// Runs an exporter future in the background.
///
/// When called from within a Tokio runtime, the future is spawned directly into the runtime.
/// Otherwise, a new single-threaded Tokio runtime is created on a background thread, and the
/// future is driven there until it completes.
pub(crate) fn spawn_exporter(kind: &'static str, exporter: ExporterFuture) -> Result<(), BuildError> {
    if let Ok(handle) = runtime::Handle::try_current() {
        handle.spawn(exporter);
        return Ok(());
    }

    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

    thread::Builder::new()
        .name(format!("metrics-exporter-pushgateway-{kind}"))
        .spawn(move || runtime.block_on(exporter))
        .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

    Ok(())
}

/// Runs `f` with `dispatch` as the default dispatcher, or with the current one when unset.
pub(crate) fn in_dispatch<R>(dispatch: Option<&Dispatch>, f: impl FnOnce() -> R) -> R {
    match dispatch {
        Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
        None => f(),
    }
}
