use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ProviderConfig, ProviderType};

#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("{0}")]
    NotConfigured(String),

    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Failed to parse response: {0}")]
    Response(String),

    #[error("Provider returned no text")]
    Empty,

    /// The provider is up but declined to caption (overloaded, degraded mode).
    #[error("Captioning service unavailable")]
    Unavailable,
}

pub type CaptionResult<T> = std::result::Result<T, CaptionError>;

/// Which caption variant to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionKind {
    /// Alt text, a sentence at most.
    Short,
    /// Screen-reader narration.
    Detailed,
}

impl CaptionKind {
    fn max_tokens(&self) -> u32 {
        match self {
            CaptionKind::Short => 50,
            CaptionKind::Detailed => 300,
        }
    }

    fn image_detail(&self) -> &'static str {
        match self {
            CaptionKind::Short => "low",
            CaptionKind::Detailed => "high",
        }
    }
}

const TEMPERATURE: f32 = 0.3;

/// Trait for services that can caption an image given its source reference.
pub trait CaptionProvider: Send + Sync {
    fn caption(&self, source_ref: &str, kind: CaptionKind) -> CaptionResult<String>;

    fn provider_name(&self) -> &'static str;

    /// Whether the provider has what it needs (credentials) to be called.
    fn is_configured(&self) -> bool {
        true
    }

    fn generate_short_caption(&self, source_ref: &str) -> CaptionResult<String> {
        self.caption(source_ref, CaptionKind::Short)
    }

    fn generate_detailed_caption(&self, source_ref: &str) -> CaptionResult<String> {
        self.caption(source_ref, CaptionKind::Detailed)
    }
}

#[derive(Debug, Clone, Default)]
struct Prompts {
    short: Option<String>,
    detailed: Option<String>,
}

impl Prompts {
    fn for_kind(&self, kind: CaptionKind) -> &str {
        match kind {
            CaptionKind::Short => self.short.as_deref().unwrap_or(SHORT_PROMPT),
            CaptionKind::Detailed => self.detailed.as_deref().unwrap_or(DETAILED_PROMPT),
        }
    }
}

const SHORT_PROMPT: &str =
    "Generate a concise alt text description for this image in 15 words or less. \
     Focus on the main subject and key visual elements that would be important for \
     accessibility. Do not include \"Image of\" or \"Photo of\" in your response.";

const DETAILED_PROMPT: &str =
    "Provide a detailed description of this image that could be used for screen reader \
     narration. Include information about the setting, objects, people, colors, lighting, \
     mood, and any text visible in the image. Write in a narrative style that would be \
     helpful for someone who cannot see the image.";

/// Read an image reference into base64 plus its MIME type. Data URLs pass
/// through without touching the filesystem.
fn load_image(source_ref: &str) -> CaptionResult<(String, &'static str)> {
    if let Some(rest) = source_ref.strip_prefix("data:") {
        let (header, data) = rest
            .split_once(',')
            .ok_or_else(|| CaptionError::Request("malformed data URL".to_string()))?;
        let mime = match header.split(';').next() {
            Some("image/png") => "image/png",
            Some("image/gif") => "image/gif",
            Some("image/webp") => "image/webp",
            _ => "image/jpeg",
        };
        return Ok((data.to_string(), mime));
    }

    let path = Path::new(source_ref);
    let bytes = std::fs::read(path)?;
    Ok((BASE64.encode(bytes), mime_for_path(path)))
}

fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        _ => "image/jpeg",
    }
}

fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

fn request_error(provider: &str, err: ureq::Error) -> CaptionError {
    match err {
        ureq::Error::Status(503, _) | ureq::Error::Status(529, _) => CaptionError::Unavailable,
        ureq::Error::Status(code @ (401 | 403), _) => CaptionError::NotConfigured(format!(
            "{} rejected the credentials (HTTP {})",
            provider, code
        )),
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            CaptionError::Request(format!("{} returned HTTP {}: {}", provider, code, body.trim()))
        }
        ureq::Error::Transport(t) => CaptionError::Request(format!("{}: {}", provider, t)),
    }
}

/// Trim the provider's answer and reject blanks.
fn non_empty(text: Option<String>) -> CaptionResult<String> {
    match text.map(|t| t.trim().to_string()) {
        Some(t) if !t.is_empty() => Ok(t),
        _ => Err(CaptionError::Empty),
    }
}

// ============================================================================
// OpenAI-compatible provider (OpenAI, LM Studio and compatible APIs)
// ============================================================================

pub struct OpenAICompatibleProvider {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    require_key: bool,
    timeout: Duration,
    prompts: Prompts,
}

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: Vec<OpenAIContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum OpenAIContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
    detail: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

impl OpenAICompatibleProvider {
    pub fn new(endpoint: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            require_key: true,
            timeout: Duration::from_secs(30),
            prompts: Prompts::default(),
        }
    }

    /// Local servers such as LM Studio accept unauthenticated requests.
    pub fn without_required_key(mut self) -> Self {
        self.require_key = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn with_prompts(mut self, prompts: Prompts) -> Self {
        self.prompts = prompts;
        self
    }
}

impl CaptionProvider for OpenAICompatibleProvider {
    fn caption(&self, source_ref: &str, kind: CaptionKind) -> CaptionResult<String> {
        if !self.is_configured() {
            return Err(CaptionError::NotConfigured(
                "No API key configured. Set provider.api_key or MEMORA_API_KEY.".to_string(),
            ));
        }

        let (base64_image, mime_type) = load_image(source_ref)?;
        let request = OpenAIChatRequest {
            model: self.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: vec![
                    OpenAIContentPart::Text {
                        text: self.prompts.for_kind(kind).to_string(),
                    },
                    OpenAIContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:{};base64,{}", mime_type, base64_image),
                            detail: kind.image_detail().to_string(),
                        },
                    },
                ],
            }],
            max_tokens: kind.max_tokens(),
            temperature: TEMPERATURE,
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut req = agent(self.timeout).post(&url).set("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", api_key));
        }

        let response: OpenAIChatResponse = req
            .send_json(&request)
            .map_err(|e| request_error(self.provider_name(), e))?
            .into_json()
            .map_err(|e| CaptionError::Response(e.to_string()))?;

        non_empty(response.choices.into_iter().next().and_then(|c| c.message.content))
    }

    fn provider_name(&self) -> &'static str {
        "OpenAI-compatible"
    }

    fn is_configured(&self) -> bool {
        !self.require_key || self.api_key.is_some()
    }
}

// ============================================================================
// Anthropic provider
// ============================================================================

pub struct AnthropicProvider {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    prompts: Prompts,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: AnthropicImageSource },
}

#[derive(Debug, Serialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponseContent {
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>, model: &str) -> Self {
        Self {
            endpoint: "https://api.anthropic.com/v1".to_string(),
            api_key,
            model: model.to_string(),
            timeout: Duration::from_secs(30),
            prompts: Prompts::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn with_prompts(mut self, prompts: Prompts) -> Self {
        self.prompts = prompts;
        self
    }
}

impl CaptionProvider for AnthropicProvider {
    fn caption(&self, source_ref: &str, kind: CaptionKind) -> CaptionResult<String> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            CaptionError::NotConfigured("No Anthropic API key configured".to_string())
        })?;

        let (base64_image, media_type) = load_image(source_ref)?;
        let request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: kind.max_tokens(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: vec![
                    AnthropicContent::Image {
                        source: AnthropicImageSource {
                            source_type: "base64".to_string(),
                            media_type: media_type.to_string(),
                            data: base64_image,
                        },
                    },
                    AnthropicContent::Text {
                        text: self.prompts.for_kind(kind).to_string(),
                    },
                ],
            }],
        };

        let response: AnthropicResponse = agent(self.timeout)
            .post(&format!("{}/messages", self.endpoint))
            .set("Content-Type", "application/json")
            .set("x-api-key", api_key)
            .set("anthropic-version", "2023-06-01")
            .send_json(&request)
            .map_err(|e| request_error(self.provider_name(), e))?
            .into_json()
            .map_err(|e| CaptionError::Response(e.to_string()))?;

        non_empty(response.content.into_iter().find_map(|c| c.text))
    }

    fn provider_name(&self) -> &'static str {
        "Anthropic"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

// ============================================================================
// Ollama provider
// ============================================================================

pub struct OllamaProvider {
    endpoint: String,
    model: String,
    timeout: Duration,
    prompts: Prompts,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    images: Vec<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaProvider {
    pub fn new(endpoint: Option<&str>, model: &str) -> Self {
        Self {
            endpoint: endpoint
                .unwrap_or("http://localhost:11434")
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            timeout: Duration::from_secs(60),
            prompts: Prompts::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn with_prompts(mut self, prompts: Prompts) -> Self {
        self.prompts = prompts;
        self
    }
}

impl CaptionProvider for OllamaProvider {
    fn caption(&self, source_ref: &str, kind: CaptionKind) -> CaptionResult<String> {
        let (base64_image, _mime_type) = load_image(source_ref)?;

        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: self.prompts.for_kind(kind).to_string(),
            images: vec![base64_image],
            stream: false,
        };

        let response: OllamaResponse = agent(self.timeout)
            .post(&format!("{}/api/generate", self.endpoint))
            .set("Content-Type", "application/json")
            .send_json(&request)
            .map_err(|e| request_error(self.provider_name(), e))?
            .into_json()
            .map_err(|e| CaptionError::Response(e.to_string()))?;

        non_empty(Some(response.response))
    }

    fn provider_name(&self) -> &'static str {
        "Ollama"
    }
}

// ============================================================================
// Factory function
// ============================================================================

/// Create a captioning provider based on configuration
pub fn create_provider(config: &ProviderConfig) -> Box<dyn CaptionProvider> {
    let prompts = Prompts {
        short: config.short_prompt.clone(),
        detailed: config.detailed_prompt.clone(),
    };
    let api_key = config.resolved_api_key();
    let timeout = config.timeout();

    match config.provider {
        ProviderType::OpenAI => Box::new(
            OpenAICompatibleProvider::new(&config.endpoint, &config.model, api_key)
                .with_timeout(timeout)
                .with_prompts(prompts),
        ),
        ProviderType::LmStudio => Box::new(
            OpenAICompatibleProvider::new(&config.endpoint, &config.model, api_key)
                .without_required_key()
                .with_timeout(timeout)
                .with_prompts(prompts),
        ),
        ProviderType::Anthropic => Box::new(
            AnthropicProvider::new(api_key, &config.model)
                .with_timeout(timeout)
                .with_prompts(prompts),
        ),
        ProviderType::Ollama => Box::new(
            OllamaProvider::new(Some(&config.endpoint), &config.model)
                .with_timeout(timeout)
                .with_prompts(prompts),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_key_is_not_configured() {
        let provider = OpenAICompatibleProvider::new("https://api.openai.com/v1", "gpt-4o", None);
        assert!(!provider.is_configured());
        assert!(matches!(
            provider.generate_short_caption("/nonexistent.jpg"),
            Err(CaptionError::NotConfigured(_))
        ));

        let anthropic = AnthropicProvider::new(None, "claude");
        assert!(matches!(
            anthropic.generate_detailed_caption("/nonexistent.jpg"),
            Err(CaptionError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_local_server_needs_no_key() {
        let provider = OpenAICompatibleProvider::new("http://127.0.0.1:1234/v1/", "llava", None)
            .without_required_key();
        assert!(provider.is_configured());
        assert_eq!(provider.endpoint, "http://127.0.0.1:1234/v1");
    }

    #[test]
    fn test_unreadable_image_is_io_error() {
        let provider = OllamaProvider::new(None, "llava");
        assert!(matches!(
            provider.generate_short_caption("/definitely/not/here.jpg"),
            Err(CaptionError::Io(_))
        ));
    }

    #[test]
    fn test_load_image_from_file_and_data_url() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pixel.PNG");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let (data, mime) = load_image(path.to_str().unwrap()).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, BASE64.encode([1u8, 2, 3]));

        let (data, mime) = load_image("data:image/webp;base64,AAAA").unwrap();
        assert_eq!(mime, "image/webp");
        assert_eq!(data, "AAAA");
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Some("  A cat.  ".to_string())).unwrap(), "A cat.");
        assert!(matches!(non_empty(Some("   ".to_string())), Err(CaptionError::Empty)));
        assert!(matches!(non_empty(None), Err(CaptionError::Empty)));
    }

    #[test]
    fn test_custom_prompts_override_defaults() {
        let prompts = Prompts {
            short: Some("Say something short".to_string()),
            detailed: None,
        };
        assert_eq!(prompts.for_kind(CaptionKind::Short), "Say something short");
        assert_eq!(prompts.for_kind(CaptionKind::Detailed), DETAILED_PROMPT);
    }
}
