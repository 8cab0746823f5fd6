pub mod coordinator;
pub mod handlers;
pub mod queue;
pub mod template;
pub mod worker;

pub use coordinator::RunCoordinator;
pub use handlers::{ExecContext, HandlerDeps, Outcome};
pub use queue::MemoryQueue;
pub use worker::WorkerPool;
