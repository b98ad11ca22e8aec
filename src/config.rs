use std::fmt;
use std::path::Path;

use anyhow::Context as _;
use serde::Deserialize;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const BASE_URL_ENV: &str = "AI_STORY_GEMINI_BASE_URL";

/// Settings for talking to the model, resolved once per invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    pub api_key: String,
    pub model_name: String,
    pub thinking_level: Option<String>,
    pub base_url: String,
}

impl fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("api_key", &"<redacted>")
            .field("model_name", &self.model_name)
            .field("thinking_level", &self.thinking_level)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// On-disk config file (`--config`). Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub api_key: String,
    pub model_name: String,
    pub thinking_level: String,
    pub base_url: String,
}

pub fn load_file(path: &Path) -> anyhow::Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse config file: {}", path.display()))
}

pub fn resolve(path: Option<&Path>) -> anyhow::Result<GenerationConfig> {
    resolve_with(
        path,
        non_empty(std::env::var(API_KEY_ENV).ok()),
        non_empty(std::env::var(BASE_URL_ENV).ok()),
    )
}

/// Resolves the config with the environment supplied by the caller.
pub fn resolve_with(
    path: Option<&Path>,
    env_api_key: Option<String>,
    env_base_url: Option<String>,
) -> anyhow::Result<GenerationConfig> {
    let Some(path) = path else {
        tracing::info!(
            default_model = DEFAULT_MODEL,
            "no --config given; using {API_KEY_ENV} and the default model"
        );
        let Some(api_key) = env_api_key else {
            anyhow::bail!("{API_KEY_ENV} is not set; set it or pass a valid --config file");
        };
        return Ok(GenerationConfig {
            api_key,
            model_name: DEFAULT_MODEL.to_owned(),
            thinking_level: None,
            base_url: base_url(None, env_base_url),
        });
    };

    let file = match load_file(path) {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %format!("{err:#}"),
                default_model = DEFAULT_MODEL,
                "could not load config file; falling back to {API_KEY_ENV} and the default model"
            );
            let Some(api_key) = env_api_key else {
                anyhow::bail!(
                    "{API_KEY_ENV} is not set and config file {} could not be loaded; set {API_KEY_ENV} or pass a valid --config file",
                    path.display()
                );
            };
            return Ok(GenerationConfig {
                api_key,
                model_name: DEFAULT_MODEL.to_owned(),
                thinking_level: None,
                base_url: base_url(None, env_base_url),
            });
        }
    };

    let api_key = match non_empty(Some(file.api_key)) {
        Some(api_key) => api_key,
        None => {
            tracing::warn!(
                path = %path.display(),
                "api_key missing in config file; trying {API_KEY_ENV}"
            );
            env_api_key.ok_or_else(|| {
                anyhow::anyhow!(
                    "api_key is missing in config file {} and {API_KEY_ENV} is not set",
                    path.display()
                )
            })?
        }
    };

    let model_name = match non_empty(Some(file.model_name)) {
        Some(model_name) => model_name,
        None => {
            tracing::warn!(
                path = %path.display(),
                default_model = DEFAULT_MODEL,
                "model_name missing in config file; using default"
            );
            DEFAULT_MODEL.to_owned()
        }
    };

    Ok(GenerationConfig {
        api_key,
        model_name,
        thinking_level: non_empty(Some(file.thinking_level)),
        base_url: base_url(non_empty(Some(file.base_url)), env_base_url),
    })
}

fn base_url(from_file: Option<String>, from_env: Option<String>) -> String {
    let raw = from_file
        .or(from_env)
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
    raw.trim_end_matches('/').to_owned()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
