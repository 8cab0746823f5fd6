pub mod defs;
pub mod invoker;

pub use defs::tool_definitions;
pub use invoker::HttpToolInvoker;
