use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use super::refresh::RefreshError;
use super::session::SessionStore;

/// Query parameter appended to the login entry point after an expiry.
const SESSION_EXPIRED_PARAM: &str = "sessionExpired=true";

/// What made an expired session unrecoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryCause {
    /// The issuer refused the refresh credential.
    RefreshRejected,
    /// The token exchange could not be completed (timeout, transport, bad reply).
    RefreshUnavailable,
    /// The server kept rejecting the access credential after a refresh.
    CredentialRejected,
    /// There was nothing to refresh with.
    MissingRefreshCredential,
}

impl From<&RefreshError> for ExpiryCause {
    fn from(e: &RefreshError) -> Self {
        match e {
            RefreshError::Rejected { .. } => ExpiryCause::RefreshRejected,
            RefreshError::NoRefreshCredential => ExpiryCause::MissingRefreshCredential,
            RefreshError::NetworkFailure(_)
            | RefreshError::InvalidResponse(_)
            | RefreshError::Store(_)
            | RefreshError::Aborted(_) => ExpiryCause::RefreshUnavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The user asked to log out.
    LoggedOut,
    SessionExpired(ExpiryCause),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::LoggedOut => write!(f, "logged out"),
            TerminationReason::SessionExpired(cause) => write!(f, "session expired ({:?})", cause),
        }
    }
}

/// Where the host should send the user once the session is gone.
#[derive(Debug, Clone)]
pub struct LoginRedirect {
    entry_point: String,
}

impl LoginRedirect {
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self {
            entry_point: entry_point.into(),
        }
    }

    /// The login entry point, flagged when the session expired rather
    /// than being ended by the user.
    pub fn target(&self, reason: TerminationReason) -> String {
        match reason {
            TerminationReason::LoggedOut => self.entry_point.clone(),
            TerminationReason::SessionExpired(_) => {
                let separator = if self.entry_point.contains('?') { '&' } else { '?' };
                format!("{}{}{}", self.entry_point, separator, SESSION_EXPIRED_PARAM)
            }
        }
    }
}

impl Default for LoginRedirect {
    fn default() -> Self {
        Self::new("/login")
    }
}

/// Host-side hook that returns the application to its signed-out state.
pub trait SessionListener: Send + Sync {
    fn session_ended(&self, reason: TerminationReason, redirect: &str);
}

impl<F> SessionListener for F
where
    F: Fn(TerminationReason, &str) + Send + Sync,
{
    fn session_ended(&self, reason: TerminationReason, redirect: &str) {
        self(reason, redirect)
    }
}

/// The single place a session is torn down.
///
/// Termination is idempotent: the first call clears the store and signals
/// the listener, later calls are no-ops until [`SessionTerminator::rearm`]
/// is called for a new session.
pub struct SessionTerminator {
    store: Arc<dyn SessionStore>,
    listener: Arc<dyn SessionListener>,
    redirect: LoginRedirect,
    terminated: AtomicBool,
}

impl SessionTerminator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        listener: Arc<dyn SessionListener>,
        redirect: LoginRedirect,
    ) -> Self {
        Self {
            store,
            listener,
            redirect,
            terminated: AtomicBool::new(false),
        }
    }

    /// End the session. Returns `true` if this call did the work.
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        if self
            .terminated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // The user must be sent back to login even if storage misbehaves
        if let Err(e) = self.store.clear() {
            error!(error = %e, "Failed to clear session store");
        }

        let target = self.redirect.target(reason);
        info!(%reason, redirect = %target, "Session terminated");
        self.listener.session_ended(reason, &target);
        true
    }

    /// Allow the next termination to signal again. Called after login.
    pub fn rearm(&self) {
        self.terminated.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use crate::auth::session::{MemorySessionStore, Session};

    #[derive(Default)]
    struct Recorder {
        signals: AtomicUsize,
        last: Mutex<Option<(TerminationReason, String)>>,
    }

    impl SessionListener for Recorder {
        fn session_ended(&self, reason: TerminationReason, redirect: &str) {
            self.signals.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some((reason, redirect.to_string()));
        }
    }

    fn setup() -> (Arc<MemorySessionStore>, Arc<Recorder>, SessionTerminator) {
        let store = Arc::new(MemorySessionStore::with_session(Session::new(
            "access".into(),
            "refresh".into(),
            Some("admin".into()),
        )));
        let recorder = Arc::new(Recorder::default());
        let terminator = SessionTerminator::new(
            store.clone(),
            recorder.clone(),
            LoginRedirect::default(),
        );
        (store, recorder, terminator)
    }

    #[test]
    fn test_redirect_targets() {
        let redirect = LoginRedirect::new("/login");
        assert_eq!(redirect.target(TerminationReason::LoggedOut), "/login");
        assert_eq!(
            redirect.target(TerminationReason::SessionExpired(ExpiryCause::RefreshRejected)),
            "/login?sessionExpired=true"
        );

        let with_query = LoginRedirect::new("/login?lang=en");
        assert_eq!(
            with_query.target(TerminationReason::SessionExpired(ExpiryCause::CredentialRejected)),
            "/login?lang=en&sessionExpired=true"
        );
    }

    #[test]
    fn test_terminate_clears_and_signals() {
        let (store, recorder, terminator) = setup();
        let reason = TerminationReason::SessionExpired(ExpiryCause::RefreshRejected);

        assert!(terminator.terminate(reason));
        assert_eq!(store.get().unwrap(), None);
        assert_eq!(recorder.signals.load(Ordering::SeqCst), 1);
        assert_eq!(
            *recorder.last.lock().unwrap(),
            Some((reason, "/login?sessionExpired=true".to_string()))
        );
    }

    #[test]
    fn test_concurrent_termination_signals_once() {
        let (store, recorder, terminator) = setup();

        let performed = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        terminator.terminate(TerminationReason::SessionExpired(
                            ExpiryCause::RefreshUnavailable,
                        ))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|did| *did)
                .count()
        });

        assert_eq!(performed, 1);
        assert_eq!(recorder.signals.load(Ordering::SeqCst), 1);
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn test_rearm_allows_next_session_to_signal() {
        let (store, recorder, terminator) = setup();
        terminator.terminate(TerminationReason::LoggedOut);
        assert!(!terminator.terminate(TerminationReason::LoggedOut));

        store
            .set(&Session::new("access-2".into(), "refresh-2".into(), None))
            .unwrap();
        terminator.rearm();

        assert!(terminator.terminate(TerminationReason::LoggedOut));
        assert_eq!(recorder.signals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_closure_listener() {
        let store = Arc::new(MemorySessionStore::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let terminator = SessionTerminator::new(
            store,
            Arc::new(move |_reason: TerminationReason, redirect: &str| {
                sink.lock().unwrap().push(redirect.to_string());
            }),
            LoginRedirect::new("/signin"),
        );

        terminator.terminate(TerminationReason::LoggedOut);
        assert_eq!(*seen.lock().unwrap(), vec!["/signin".to_string()]);
    }

    #[test]
    fn test_expiry_cause_from_refresh_error() {
        assert_eq!(
            ExpiryCause::from(&RefreshError::Rejected { status: 403 }),
            ExpiryCause::RefreshRejected
        );
        assert_eq!(
            ExpiryCause::from(&RefreshError::NetworkFailure("timeout".into())),
            ExpiryCause::RefreshUnavailable
        );
        assert_eq!(
            ExpiryCause::from(&RefreshError::NoRefreshCredential),
            ExpiryCause::MissingRefreshCredential
        );
    }
}
