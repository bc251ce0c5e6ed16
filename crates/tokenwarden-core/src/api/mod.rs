//! HTTP transport for the application's REST API.
//!
//! This module provides the `ApiClient`, which every outbound call goes
//! through. The client carries the session: it refreshes the bearer
//! credential before it expires, recovers once from a rejected credential,
//! and ends the session when recovery isn't possible.

pub mod attempt;
pub mod client;
pub mod error;

pub use attempt::{EndpointKind, Endpoints, Recovery, RequestAttempt};
pub use client::ApiClient;
pub use error::ApiError;
