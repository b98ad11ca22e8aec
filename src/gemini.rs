use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::GenerationConfig;
use crate::pricing::{self, ModelPrices};

/// Dynamic thinking budget: the backend decides how much to reason.
pub const DYNAMIC_THINKING_BUDGET: i32 = -1;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Opaque reasoning-state token returned by the model ("thought signature").
///
/// Replaying it on the next request lets the backend pick up the latent
/// reasoning of the previous turn. It is stored and sent as standard base64.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ContinuationToken(Vec<u8>);

impl ContinuationToken {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        BASE64.decode(encoded.trim()).map(Self)
    }
}

impl fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContinuationToken({} bytes)", self.0.len())
    }
}

impl Serialize for ContinuationToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

/// Accepted stored shapes: base64 text, a list of byte values, or null.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredToken {
    Base64(String),
    Bytes(Vec<u8>),
}

impl<'de> Deserialize<'de> for ContinuationToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<StoredToken>::deserialize(deserializer)? {
            None => Ok(Self::default()),
            Some(StoredToken::Base64(encoded)) => {
                Self::from_base64(&encoded).map_err(serde::de::Error::custom)
            }
            Some(StoredToken::Bytes(bytes)) => Ok(Self(bytes)),
        }
    }
}

/// One earlier user/model exchange replayed ahead of the current prompt.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub user_prompt: String,
    pub model_response: String,
    pub continuation_token: Option<ContinuationToken>,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub previous_turn: Option<HistoryTurn>,
    pub continuation_token: Option<ContinuationToken>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            previous_turn: None,
            continuation_token: None,
        }
    }

    #[must_use]
    pub fn with_previous_turn(mut self, turn: HistoryTurn) -> Self {
        self.previous_turn = Some(turn);
        self
    }

    #[must_use]
    pub fn with_continuation_token(mut self, token: Option<ContinuationToken>) -> Self {
        self.continuation_token = token.filter(|t| !t.is_empty());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelCallResult {
    pub text: String,
    pub continuation_token: Option<ContinuationToken>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("build gemini http client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("gemini request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("gemini API error ({status}): {message}")]
    Status {
        status: reqwest::StatusCode,
        message: String,
    },
    #[error("decode gemini response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("gemini returned no candidates")]
    NoCandidates,
    #[error("gemini returned empty content")]
    EmptyContent,
}

/// A text-generation backend.
pub trait TextModel {
    fn model_name(&self) -> &str;

    fn generate(&self, request: &GenerateRequest) -> Result<ModelCallResult, GeminiError>;
}

/// Blocking client for the Gemini `generateContent` REST API.
pub struct GeminiClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model_name: String,
    thinking_level: Option<String>,
    dump_dir: Option<PathBuf>,
}

impl GeminiClient {
    pub fn new(config: &GenerationConfig) -> Result<Self, GeminiError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(GeminiError::ClientBuild)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            model_name: config.model_name.clone(),
            thinking_level: config.thinking_level.clone(),
            dump_dir: None,
        })
    }

    /// Writes every request and response body as pretty JSON under `dir`.
    #[must_use]
    pub fn with_dump_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dump_dir = dir;
        self
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{method}", self.base_url, self.model_name)
    }

    fn post<B: Serialize>(&self, url: &str, body: &B) -> Result<String, GeminiError> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()?;

        let status = response.status();
        let raw = response.text()?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or(raw);
            return Err(GeminiError::Status { status, message });
        }
        Ok(raw)
    }

    fn count_tokens(&self, contents: &[Content<'_>]) -> Result<u64, GeminiError> {
        let raw = self.post(&self.endpoint("countTokens"), &CountTokensBody { contents })?;
        let parsed: CountTokensResponse = serde_json::from_str(&raw)?;
        Ok(parsed.total_tokens)
    }

    fn dump(&self, name: &str, body: &impl Serialize) {
        let Some(dir) = self.dump_dir.as_deref() else {
            return;
        };
        let path = dir.join(name);
        let result = serde_json::to_vec_pretty(body)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| std::fs::write(&path, bytes).map_err(anyhow::Error::from));
        match result {
            Ok(()) => tracing::debug!(path = %path.display(), "gemini body saved"),
            Err(err) => tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to save gemini body"
            ),
        }
    }
}

impl TextModel for GeminiClient {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn generate(&self, request: &GenerateRequest) -> Result<ModelCallResult, GeminiError> {
        tracing::info!(
            model = %self.model_name,
            thinking_level = ?self.thinking_level,
            prompt_chars = request.prompt.len(),
            "gemini call"
        );

        let contents = build_contents(request);
        let body = GenerateContentBody {
            contents: &contents,
            generation_config: GenerationConfigBody {
                thinking_config: thinking_config(&self.model_name, self.thinking_level.as_deref()),
            },
        };

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.6f").to_string();
        self.dump(&format!("gemini_req_{stamp}.json"), &body);

        let input_tokens = match self.count_tokens(&contents) {
            Ok(tokens) => tokens,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "failed to count input tokens; assuming 0 for cost"
                );
                0
            }
        };

        let prices = pricing::prices_for(&self.model_name, input_tokens).unwrap_or_else(|| {
            tracing::warn!(
                model = %self.model_name,
                "no pricing for model; cost will be reported as 0"
            );
            ModelPrices::ZERO
        });

        let raw = self
            .post(&self.endpoint("generateContent"), &body)
            .inspect_err(|err| tracing::warn!(error = %err, "gemini generateContent failed"))?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        self.dump(&format!("gemini_resp_{stamp}.json"), &value);

        let response: GenerateContentResponse = serde_json::from_value(value)?;
        let result = into_call_result(response, input_tokens, prices)?;

        tracing::info!(
            model = %self.model_name,
            input_tokens = result.input_tokens,
            output_tokens = result.output_tokens,
            cost = format!("${:.6}", result.cost),
            "gemini call completed"
        );
        Ok(result)
    }
}

/// Whether the model takes a named thinking level instead of a token budget.
pub fn supports_thinking_level(model: &str) -> bool {
    model.starts_with("gemini-3")
}

fn thinking_config<'a>(model: &str, level: Option<&'a str>) -> ThinkingConfigBody<'a> {
    match level.filter(|l| !l.trim().is_empty()) {
        Some(level) if supports_thinking_level(model) => ThinkingConfigBody {
            thinking_level: Some(level),
            thinking_budget: None,
        },
        _ => ThinkingConfigBody {
            thinking_level: None,
            thinking_budget: Some(DYNAMIC_THINKING_BUDGET),
        },
    }
}

fn build_contents(request: &GenerateRequest) -> Vec<Content<'_>> {
    let mut contents = Vec::with_capacity(3);

    if let Some(turn) = &request.previous_turn {
        contents.push(Content {
            role: "user",
            parts: vec![RequestPart {
                text: &turn.user_prompt,
                thought_signature: None,
            }],
        });
        contents.push(Content {
            role: "model",
            parts: vec![RequestPart {
                text: &turn.model_response,
                thought_signature: turn.continuation_token.as_ref(),
            }],
        });
    }

    contents.push(Content {
        role: "user",
        parts: vec![RequestPart {
            text: &request.prompt,
            thought_signature: request.continuation_token.as_ref(),
        }],
    });

    contents
}

fn into_call_result(
    response: GenerateContentResponse,
    input_tokens: u64,
    prices: ModelPrices,
) -> Result<ModelCallResult, GeminiError> {
    let GenerateContentResponse {
        candidates,
        usage_metadata,
    } = response;

    let candidate = candidates
        .into_iter()
        .next()
        .ok_or(GeminiError::NoCandidates)?;
    let parts = candidate.content.map(|c| c.parts).unwrap_or_default();

    let text = parts
        .iter()
        .filter(|part| !part.thought)
        .filter_map(|part| part.text.as_deref())
        .collect::<String>();
    if text.trim().is_empty() {
        return Err(GeminiError::EmptyContent);
    }

    let continuation_token = parts
        .iter()
        .find_map(|part| part.thought_signature.as_deref())
        .and_then(|encoded| match ContinuationToken::from_base64(encoded) {
            Ok(token) => Some(token),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring undecodable thought signature");
                None
            }
        });

    let output_tokens = match usage_metadata.and_then(|u| u.candidates_token_count) {
        Some(tokens) => tokens,
        None => {
            tracing::warn!("response has no output token count; assuming 0 for cost");
            0
        }
    };

    Ok(ModelCallResult {
        text,
        continuation_token,
        input_tokens,
        output_tokens,
        cost: prices.cost(input_tokens, output_tokens),
    })
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentBody<'a> {
    contents: &'a [Content<'a>],
    generation_config: GenerationConfigBody<'a>,
}

#[derive(Debug, Serialize)]
struct CountTokensBody<'a> {
    contents: &'a [Content<'a>],
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestPart<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thought_signature: Option<&'a ContinuationToken>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfigBody<'a> {
    thinking_config: ThinkingConfigBody<'a>,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfigBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_level: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountTokensResponse {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    thought_signature: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    candidates_token_count: Option<u64>,
}
