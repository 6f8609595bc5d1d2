#![forbid(unsafe_code)]

//! Shared library for the ViewTube backend.
//!
//! The backend binary wires these modules together: the [`youtube`] client
//! fetches the channel's uploads playlist, statistics and comment threads,
//! [`aggregate`] joins them into [`metadata::VideoRecord`]s, and [`refresh`]
//! decides when a trigger is served from the [`cache`] versus when a single
//! live aggregation runs.

pub mod aggregate;
pub mod cache;
pub mod comments;
pub mod config;
pub mod metadata;
pub mod refresh;
pub mod security;
pub mod youtube;
