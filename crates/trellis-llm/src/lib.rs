pub mod openai;
pub mod retry;
pub mod stub;

pub use openai::OpenAiClient;
pub use retry::RetryingClient;
pub use stub::{EchoClient, ScriptedClient};
