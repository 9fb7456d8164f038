//! depthcast: a render broker for depth-parallax videos.
//!
//! Jobs are fingerprinted, deduplicated through a shared result store and
//! rendered by a fixed pool of worker threads in priority order.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
