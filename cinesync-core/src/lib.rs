//! Core services for the CineSync playback coordinator.
//!
//! This crate carries the authoritative master timeline, drift control,
//! session auth, and the video catalog. It knows nothing about HTTP or
//! WebSockets; the connection layer binds to it through
//! [`service::StateObserver`].

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod service;
pub mod validation;

pub use config::Config;
pub use error::{Error, Result};
