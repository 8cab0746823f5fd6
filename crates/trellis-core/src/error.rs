use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Graph errors
    #[error("Graph validation failed: {0}")]
    Validation(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Node config error: {node}: {message}")]
    NodeConfig { node: String, message: String },

    // Template errors
    #[error("Template error: {0}")]
    Template(String),

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool invocation failed: {tool}: {message}")]
    ToolInvocation { tool: String, message: String },

    #[error("tool_call_limit_exceeded")]
    ToolCallLimit,

    // Handler errors
    #[error("timeout")]
    NodeTimeout,

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Queue errors
    #[error("Queue error: {0}")]
    Queue(String),

    // Approval errors
    #[error("Approval already resumed for run {0}")]
    AlreadyResumed(String),

    #[error("Run {0} is not awaiting approval")]
    NotAwaitingApproval(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrellisError>;
