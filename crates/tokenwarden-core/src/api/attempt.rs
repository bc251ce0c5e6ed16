//! Per-request retry bookkeeping for authorization failures.

use reqwest::StatusCode;

/// How an outgoing request relates to the credential endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Issues the first credentials; sent without authorization.
    Login,
    /// Exchanges the refresh credential; must never trigger its own refresh.
    Refresh,
    /// Anything else. Carries the access credential.
    Protected,
}

/// Paths of the credential-issuing endpoints.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub login_path: String,
    pub refresh_path: String,
}

impl Endpoints {
    /// Classify a request path. `path` is the full URL path, which may sit
    /// under a base path (e.g. `/api/auth/login`).
    pub fn classify(&self, path: &str) -> EndpointKind {
        let path = path.trim_end_matches('/');
        if path.ends_with(self.login_path.trim_end_matches('/')) {
            EndpointKind::Login
        } else if path.ends_with(self.refresh_path.trim_end_matches('/')) {
            EndpointKind::Refresh
        } else {
            EndpointKind::Protected
        }
    }
}

/// Where a logical call is in its authorization retry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAttempt {
    Fresh,
    Retried,
    Done,
}

/// What the transport should do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Hand the response to the caller as-is.
    PassThrough,
    /// Refresh the credential and resubmit the request once.
    RefreshAndRetry,
    /// Give up and end the session.
    Terminate,
}

impl RequestAttempt {
    pub fn new() -> Self {
        RequestAttempt::Fresh
    }

    /// Advance on a response and decide what to do with it.
    pub fn on_response(&mut self, status: StatusCode, endpoint: EndpointKind) -> Recovery {
        if status != StatusCode::UNAUTHORIZED {
            *self = RequestAttempt::Done;
            return Recovery::PassThrough;
        }

        match (endpoint, *self) {
            // A failed login is an ordinary user-facing error
            (EndpointKind::Login, _) => {
                *self = RequestAttempt::Done;
                Recovery::PassThrough
            }
            (EndpointKind::Refresh, _) => {
                *self = RequestAttempt::Done;
                Recovery::Terminate
            }
            (EndpointKind::Protected, RequestAttempt::Fresh) => {
                *self = RequestAttempt::Retried;
                Recovery::RefreshAndRetry
            }
            (EndpointKind::Protected, RequestAttempt::Retried) => {
                *self = RequestAttempt::Done;
                Recovery::Terminate
            }
            (EndpointKind::Protected, RequestAttempt::Done) => Recovery::PassThrough,
        }
    }
}

impl Default for RequestAttempt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Endpoints {
        Endpoints {
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh-token".to_string(),
        }
    }

    #[test]
    fn test_classify() {
        let endpoints = endpoints();
        assert_eq!(endpoints.classify("/api/auth/login"), EndpointKind::Login);
        assert_eq!(endpoints.classify("/auth/refresh-token/"), EndpointKind::Refresh);
        assert_eq!(endpoints.classify("/api/tasks/7"), EndpointKind::Protected);
    }

    #[test]
    fn test_success_passes_through() {
        let mut attempt = RequestAttempt::new();
        assert_eq!(
            attempt.on_response(StatusCode::OK, EndpointKind::Protected),
            Recovery::PassThrough
        );
        assert_eq!(attempt, RequestAttempt::Done);
    }

    #[test]
    fn test_other_errors_are_not_recovered() {
        let mut attempt = RequestAttempt::new();
        assert_eq!(
            attempt.on_response(StatusCode::FORBIDDEN, EndpointKind::Protected),
            Recovery::PassThrough
        );
    }

    #[test]
    fn test_retries_once_then_terminates() {
        let mut attempt = RequestAttempt::new();
        assert_eq!(
            attempt.on_response(StatusCode::UNAUTHORIZED, EndpointKind::Protected),
            Recovery::RefreshAndRetry
        );
        assert_eq!(attempt, RequestAttempt::Retried);

        assert_eq!(
            attempt.on_response(StatusCode::UNAUTHORIZED, EndpointKind::Protected),
            Recovery::Terminate
        );
        assert_eq!(attempt, RequestAttempt::Done);
    }

    #[test]
    fn test_retry_success_finishes() {
        let mut attempt = RequestAttempt::new();
        attempt.on_response(StatusCode::UNAUTHORIZED, EndpointKind::Protected);
        assert_eq!(
            attempt.on_response(StatusCode::OK, EndpointKind::Protected),
            Recovery::PassThrough
        );
        assert_eq!(attempt, RequestAttempt::Done);
    }

    #[test]
    fn test_refresh_endpoint_never_refreshes_itself() {
        let mut attempt = RequestAttempt::new();
        assert_eq!(
            attempt.on_response(StatusCode::UNAUTHORIZED, EndpointKind::Refresh),
            Recovery::Terminate
        );
    }

    #[test]
    fn test_failed_login_is_not_escalated() {
        let mut attempt = RequestAttempt::new();
        assert_eq!(
            attempt.on_response(StatusCode::UNAUTHORIZED, EndpointKind::Login),
            Recovery::PassThrough
        );
    }
}
