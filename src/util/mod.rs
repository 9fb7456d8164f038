//! Small helpers shared across layers.

pub mod bytes;
pub(crate) mod lock;
