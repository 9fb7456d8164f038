#![deny(clippy::all, clippy::pedantic)]

pub mod bench;
pub mod fingerprint;
pub mod health;
pub mod render;
