pub mod providers;

use std::sync::Arc;

use smartgraph_core::config::ModelConfig;
use smartgraph_core::error::{Result, SmartGraphError};
use smartgraph_core::traits::ModelClient;

pub use providers::openai::OpenAiClient;

/// Create a model client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Arc<dyn ModelClient>> {
    match config.provider.as_str() {
        // Every OpenAI-compatible server (OpenAI, Ollama, vLLM, Groq, OpenRouter)
        "openai" | "ollama" | "vllm" | "groq" | "openrouter" | "compatible" => {
            Ok(Arc::new(OpenAiClient::new(config.clone())))
        }
        other => Err(SmartGraphError::Config(format!(
            "Unsupported model provider: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.to_string(),
            model_id: "gpt-4o-mini".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: 256,
            temperature: 0.0,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_create_client() {
        assert!(create_client(&config("openai")).is_ok());
        assert!(create_client(&config("ollama")).is_ok());
        assert!(matches!(
            create_client(&config("carrier-pigeon")),
            Err(SmartGraphError::Config(_))
        ));
    }
}
