pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, TrellisError};
pub use event::{EventBus, WorkflowEvent};
pub use graph::{EdgeSpec, Graph, NodeSpec, NodeType};
pub use types::*;
