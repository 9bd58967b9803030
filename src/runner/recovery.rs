//! Panic boundary around handler execution.
//!
//! A process-wide panic hook (installed once, chaining the previous one)
//! records the location and backtrace of panics raised while a guarded handler
//! is being polled. The worker then reports them as an [`ExecutionFault`]
//! instead of losing the task.

use futures::FutureExt;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};
use tracing::error;

use crate::job::handler::{QueueHandler, RecoveryListener};
use crate::job::job::{QueuePayload, QueueResult};

thread_local! {
    static GUARDED: Cell<bool> = const { Cell::new(false) };
    static LAST_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// A handler panic caught at the worker boundary.
#[derive(Debug, Clone)]
pub struct ExecutionFault {
    pub message: String,
    pub trace: String,
}

pub(crate) fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARDED.with(Cell::get) {
                let location = info
                    .location()
                    .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                    .unwrap_or_else(|| "<unknown>".to_string());
                let trace = format!("panicked at {location}\n{}", Backtrace::force_capture());
                LAST_TRACE.with(|last| *last.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

/// Marks the current thread as guarded for the duration of each poll.
struct Guarded<'a, T> {
    inner: Pin<Box<dyn Future<Output = T> + Send + 'a>>,
}

struct ResetOnDrop(bool);

impl Drop for ResetOnDrop {
    fn drop(&mut self) {
        GUARDED.with(|g| g.set(self.0));
    }
}

impl<T> Future for Guarded<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let _reset = ResetOnDrop(GUARDED.with(|g| g.replace(true)));
        self.inner.as_mut().poll(cx)
    }
}

/// Runs the handler, turning a panic into an [`ExecutionFault`].
pub(crate) async fn execute_guarded(
    handler: &dyn QueueHandler,
    payload: &QueuePayload,
) -> Result<QueueResult, ExecutionFault> {
    install_panic_hook();
    LAST_TRACE.with(|last| last.borrow_mut().take());

    let guarded = Guarded {
        inner: handler.execute(payload),
    };
    match AssertUnwindSafe(guarded).catch_unwind().await {
        Ok(result) => Ok(result),
        Err(panic_info) => {
            let message = panic_info
                .downcast_ref::<String>()
                .map(|s| s.as_str())
                .or_else(|| panic_info.downcast_ref::<&str>().copied())
                .unwrap_or("unknown panic")
                .to_string();
            let trace = LAST_TRACE
                .with(|last| last.borrow_mut().take())
                .unwrap_or_else(|| Backtrace::force_capture().to_string());
            Err(ExecutionFault { message, trace })
        }
    }
}

/// Delivers a fault trace to the listener; a panicking listener is contained.
pub(crate) fn notify_recovery(listener: Option<&RecoveryListener>, trace: &str) {
    if let Some(listener) = listener {
        if panic::catch_unwind(AssertUnwindSafe(|| listener(trace))).is_err() {
            error!("Recovery listener panicked");
        }
    }
}
