//! Request brokering: queueing, the render workers and the polling gateway.

pub mod command;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod renderer;
pub mod worker;

pub use command::CommandRenderer;
pub use gateway::{GatewayPolicy, GatewayResponse, RequestGateway};
pub use queue::{PendingJob, PriorityQueue, QueueError};
pub use renderer::{RenderError, Renderer};
pub use worker::WorkerPool;
