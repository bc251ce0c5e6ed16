//! Core library for tokenwarden.
//!
//! Keeps a short-lived bearer credential valid across any number of
//! concurrent API calls: proactive refresh before expiry, a single shared
//! token exchange under concurrency, one refresh-and-retry on a rejected
//! credential, and a clean logout when none of that works.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError};
pub use auth::{Session, SessionListener, SessionStore, TerminationReason};
pub use config::Config;
