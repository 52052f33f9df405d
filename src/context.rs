// src/context.rs

//! Request context
//!
//! Everything a resolver or orchestrator call needs from "the current
//! request" travels in one explicit `RequestContext` value: the event sink
//! back to the owning session, the cancellation token, the request-scoped
//! package state, and the notice-deduplication sets. Nothing here is ambient
//! or thread-local; callers pass the context down.

use crate::error::{Error, Result};
use crate::identity::CanonicalIdentity;
use crate::package::SessionDataMap;
use crate::session::message::{Event, OutboundMessage};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, mpsc};

/// Cooperative cancellation token
///
/// Cancellation is idempotent and cascades: a token created with `child`
/// observes its parent's cancellation as well as its own. Long-running loops
/// call `is_canceled` at iteration boundaries; sleepers can await `notified`.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
                parent: None,
            }),
        }
    }

    /// A token that is canceled when either it or its parent is canceled
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Request cancellation. Harmless to call more than once.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        if self.inner.flag.load(Ordering::SeqCst) {
            return true;
        }
        self.inner
            .parent
            .as_ref()
            .is_some_and(CancelToken::is_canceled)
    }

    /// Wait until this token (not a parent) is canceled
    pub async fn notified(&self) {
        if self.is_canceled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request state threaded through resolver and orchestrator calls
pub struct RequestContext {
    correlation_id: Option<String>,
    events: mpsc::UnboundedSender<OutboundMessage>,
    cancel: CancelToken,
    session_data: Arc<SessionDataMap>,
    /// Packages already reported as satisfied, so repeated resolution passes
    /// notify at most once each
    satisfied_notices: Mutex<HashSet<CanonicalIdentity>>,
    /// Packages already reported as needing a remote file
    remote_file_notices: Mutex<HashSet<CanonicalIdentity>>,
    /// Diagnostic notices accumulated for the terminal failure report
    failure_notices: Mutex<Vec<String>>,
}

impl RequestContext {
    pub fn new(
        correlation_id: Option<String>,
        events: mpsc::UnboundedSender<OutboundMessage>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            correlation_id,
            events,
            cancel,
            session_data: Arc::new(SessionDataMap::new()),
            satisfied_notices: Mutex::new(HashSet::new()),
            remote_file_notices: Mutex::new(HashSet::new()),
            failure_notices: Mutex::new(Vec::new()),
        }
    }

    /// A context wired to a fresh channel; returns the receiving end.
    /// Used by tests and by internally-driven requests.
    pub fn detached(cancel: CancelToken) -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(None, tx, cancel), rx)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Error out with `Canceled` if the request's token has fired
    pub fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    pub fn session_data(&self) -> &SessionDataMap {
        &self.session_data
    }

    /// Shared handle to the session data map, for tasks that outlive the
    /// borrow of the context (download workers)
    pub fn session_data_arc(&self) -> Arc<SessionDataMap> {
        self.session_data.clone()
    }

    /// Send an event to the owning session, scoped to this request
    ///
    /// A closed sink means the session is gone; events are dropped silently
    /// because the orchestration will observe cancellation shortly.
    pub fn emit(&self, event: Event) {
        let _ = self
            .events
            .send(OutboundMessage::new(self.correlation_id.clone(), event));
    }

    /// Emit `PackageSatisfiedBy` at most once per requested package
    pub fn notify_satisfied(
        &self,
        requested: &CanonicalIdentity,
        satisfied_by: &CanonicalIdentity,
    ) {
        if self.satisfied_notices.lock().insert(requested.clone()) {
            self.emit(Event::PackageSatisfiedBy {
                requested: requested.clone(),
                satisfied_by: satisfied_by.clone(),
            });
        }
    }

    /// Emit `RequireRemoteFile` at most once per package per request
    pub fn notify_remote_file_required(
        &self,
        package: &CanonicalIdentity,
        locations: Vec<url::Url>,
        destination: String,
    ) {
        if self.remote_file_notices.lock().insert(package.clone()) {
            self.emit(Event::RequireRemoteFile {
                package: package.clone(),
                locations,
                destination,
            });
        }
    }

    /// Record a diagnostic line for the terminal failure report
    pub fn record_failure(&self, notice: impl Into<String>) {
        self.failure_notices.lock().push(notice.into());
    }

    pub fn failure_notices(&self) -> Vec<String> {
        self.failure_notices.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Architecture;
    use crate::version::PackageVersion;

    fn identity(name: &str) -> CanonicalIdentity {
        CanonicalIdentity::new(
            name,
            PackageVersion::parse("1.0").unwrap(),
            Architecture::X86,
            "aa",
        )
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        token.cancel();
        token.cancel();
        assert!(token.is_canceled());
    }

    #[test]
    fn test_cancel_cascades_to_children() {
        let session = CancelToken::new();
        let request = session.child();
        assert!(!request.is_canceled());

        session.cancel();
        assert!(request.is_canceled());
        // Parent is unaffected by the child.
        let other = CancelToken::new();
        let child = other.child();
        child.cancel();
        assert!(!other.is_canceled());
    }

    #[test]
    fn test_satisfied_notice_deduplicated() {
        let (ctx, mut rx) = RequestContext::detached(CancelToken::new());
        ctx.notify_satisfied(&identity("app"), &identity("app2"));
        ctx.notify_satisfied(&identity("app"), &identity("app2"));
        ctx.notify_satisfied(&identity("other"), &identity("other2"));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_check_canceled() {
        let (ctx, _rx) = RequestContext::detached(CancelToken::new());
        assert!(ctx.check_canceled().is_ok());
        ctx.cancel_token().cancel();
        assert!(matches!(ctx.check_canceled(), Err(Error::Canceled)));
    }
}
