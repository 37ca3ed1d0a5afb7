use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::backend::decode;
use crate::capture::CaptureEvidence;
use crate::config::{resolve_api_key, AnalysisConfig, BackendConfig};
use crate::error::{NutriLensError, Result};
use crate::model::AnalysisResult;

const ANALYSIS_PROMPT: &str = "Analyze this food image. Identify the food and estimate its \
calories for the portion shown. Respond with only a JSON object of the form \
{\"foodName\": string, \"calories\": integer, \"narrative\": string}, where narrative \
briefly covers the nutritional breakdown (protein, carbs, fat) and health insights.";

/// Sends capture evidence to whichever endpoint serves analysis and decodes
/// the structured result. Never retries; every failure surfaces to the caller.
pub struct AnalysisClient {
    provider: AnalysisProvider,
    config: AnalysisConfig,
    endpoint: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnalysisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisClient")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("model", &self.config.model)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnalysisProvider {
    /// The food-log backend's `/analyze_food`, authenticated with the session token.
    Backend,
    /// An OpenAI-compatible vision chat completion, authenticated with an API key.
    OpenAI,
}

impl AnalysisClient {
    pub fn from_config(config: &AnalysisConfig, backend: &BackendConfig) -> Result<Self> {
        let provider = match config.provider.as_str() {
            "backend" => AnalysisProvider::Backend,
            "openai" => AnalysisProvider::OpenAI,
            other => {
                return Err(NutriLensError::Config(format!(
                    "unknown analysis provider: '{other}' (expected 'backend' or 'openai')"
                )));
            }
        };

        let endpoint = match provider {
            AnalysisProvider::Backend => {
                let base = config.base_url.as_deref().unwrap_or(&backend.base_url);
                format!("{}/analyze_food", base.trim_end_matches('/'))
            }
            AnalysisProvider::OpenAI => {
                // the key must resolve before the first request
                resolve_api_key(config, "OPENAI_API_KEY")?;
                let base = config
                    .base_url
                    .as_deref()
                    .unwrap_or("https://api.openai.com");
                format!("{}/v1/chat/completions", base.trim_end_matches('/'))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(backend.connect_timeout())
            .build()
            .map_err(|e| NutriLensError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            provider,
            config: config.clone(),
            endpoint,
            client,
        })
    }

    /// Whether the configured endpoint authenticates with the session token.
    pub fn uses_session_token(&self) -> bool {
        self.provider == AnalysisProvider::Backend
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Analyze one capture. `session_token` is the token snapshotted at send
    /// time; it is required by the backend provider and ignored otherwise.
    ///
    /// Cancel by dropping the returned future.
    pub async fn analyze(
        &self,
        evidence: &CaptureEvidence,
        session_token: Option<&str>,
    ) -> Result<AnalysisResult> {
        let result = match self.provider {
            AnalysisProvider::Backend => self.analyze_backend(evidence, session_token).await,
            AnalysisProvider::OpenAI => self.analyze_openai(evidence).await,
        };
        match &result {
            Ok(r) => tracing::info!(food = %r.food_name, calories = r.calories, "analysis complete"),
            Err(e) => tracing::warn!(error = %e, "analysis failed"),
        }
        result
    }

    /// Backend: POST {base}/analyze_food
    async fn analyze_backend(
        &self,
        evidence: &CaptureEvidence,
        session_token: Option<&str>,
    ) -> Result<AnalysisResult> {
        let token = session_token
            .ok_or_else(|| NutriLensError::Unauthorized("no session token".into()))?;

        let body = BackendAnalysisRequest::new(evidence, self.config.send_depth);

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        decode(resp, "analyze_food").await
    }

    /// OpenAI: POST {base}/v1/chat/completions
    async fn analyze_openai(&self, evidence: &CaptureEvidence) -> Result<AnalysisResult> {
        let api_key = resolve_api_key(&self.config, "OPENAI_API_KEY")?;

        let image_url = format!(
            "data:image/jpeg;base64,{}",
            STANDARD.encode(evidence.image_bytes())
        );
        let body = ChatRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: ANALYSIS_PROMPT,
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: image_url },
                    },
                ],
            }],
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await?;

        let chat: ChatResponse = decode(resp, "chat/completions").await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                NutriLensError::MalformedResponse("chat completion has no content".into())
            })?;

        parse_result_content(&content)
    }
}

/// Decode the model's message content as an [`AnalysisResult`], tolerating a
/// surrounding Markdown code fence.
fn parse_result_content(content: &str) -> Result<AnalysisResult> {
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let result: AnalysisResult = serde_json::from_str(json).map_err(|e| {
        NutriLensError::MalformedResponse(format!("analysis content is not a valid result: {e}"))
    })?;

    if result.food_name.trim().is_empty() {
        return Err(NutriLensError::MalformedResponse(
            "analysis result has an empty food name".into(),
        ));
    }
    Ok(result)
}

// -- Request/Response types --

#[derive(Serialize)]
struct BackendAnalysisRequest {
    /// Base64-encoded JPEG.
    image: String,
    /// Row-major depth samples; empty when absent or not sent.
    lidar: Vec<f32>,
    position: [f32; 3],
}

impl BackendAnalysisRequest {
    fn new(evidence: &CaptureEvidence, send_depth: bool) -> Self {
        Self {
            image: STANDARD.encode(evidence.image_bytes()),
            lidar: if send_depth {
                evidence.depth_samples().to_vec()
            } else {
                Vec::new()
            },
            position: evidence.world_position().to_array(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
