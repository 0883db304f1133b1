pub mod backend;
pub mod client;
pub mod ollama;

pub use backend::HttpBackend;
pub use client::build_http_client;
pub use ollama::OllamaClient;
