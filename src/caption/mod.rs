pub mod client;
pub mod provider;

pub use client::CaptionClient;
pub use provider::{
    create_provider, AnthropicProvider, CaptionError, CaptionKind, CaptionProvider, CaptionResult,
    OllamaProvider, OpenAICompatibleProvider,
};
