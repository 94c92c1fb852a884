//! [`ShutdownSignal`] – process-wide orderly-shutdown request.
//!
//! Fatal protocol failures never abort the process from inside the command
//! primitives.  The caller that classifies a failure as fatal calls
//! [`ShutdownSignal::request`]; the sequencer stops issuing commands once the
//! flag is set, and the top-level driver maps it to the exit code.  The CLI's
//! Ctrl-C handler uses the same flag.
//!
//! The first recorded reason wins; later requests only log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, error};

#[derive(Default)]
struct Inner {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

/// Cloneable handle; all clones share the same flag.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the process to stop issuing commands.
    pub fn request(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut slot = self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            error!(%reason, "shutdown requested");
            *slot = Some(reason);
        } else {
            debug!(%reason, "shutdown already requested");
        }
        self.inner.requested.store(true, Ordering::SeqCst);
        drop(slot);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.  Safe to call from any task;
    /// `request` may come from a non-runtime thread such as a signal handler.
    pub async fn requested(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// The first reason passed to [`request`][Self::request].
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("requested", &self.is_requested())
            .field("reason", &self.reason())
            .finish()
    }
}
