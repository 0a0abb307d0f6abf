//! Panic isolation for backend code
//!
//! Probes, schema builders, factories and initialization run third-party
//! engine glue. A panic in any of them is caught here and turned into a
//! [`BackendError::Panic`] so one broken backend cannot take down the
//! registry listing or a reload.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, UnwindSafe, catch_unwind};

use futures::FutureExt;

use super::base::{BackendError, BackendResult};

/// Call a fallible backend function, converting panics to errors.
pub fn call_isolated<F, T>(backend_fn: F) -> BackendResult<T>
where
    F: FnOnce() -> BackendResult<T> + UnwindSafe,
{
    match catch_unwind(backend_fn) {
        Ok(result) => result,
        Err(panic_info) => {
            let msg = panic_message(&panic_info);
            tracing::error!(message = %msg, "Backend panicked");
            Err(BackendError::Panic(msg))
        }
    }
}

/// Call an infallible backend function, converting panics to errors.
pub fn call_isolated_value<F, T>(backend_fn: F) -> BackendResult<T>
where
    F: FnOnce() -> T + UnwindSafe,
{
    call_isolated(|| Ok(backend_fn()))
}

/// Await a backend future, converting panics during polling to errors.
pub async fn await_isolated<Fut, T>(future: Fut) -> BackendResult<T>
where
    Fut: Future<Output = BackendResult<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic_info) => {
            let msg = panic_message(&panic_info);
            tracing::error!(message = %msg, "Backend panicked during async execution");
            Err(BackendError::Panic(msg))
        }
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(panic_info: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (non-string payload)".to_string()
    }
}
