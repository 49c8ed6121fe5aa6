use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{output_file_name, GenerationError, GenerationOptions, ReferenceImage};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const MODEL_TEXT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<CandidateContent>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<ResponsePart>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedImages {
    pub paths: Vec<PathBuf>,
    pub model_texts: Vec<String>,
    pub usage: Option<UsageMetadata>,
}

pub fn build_generate_content_body(
    options: &GenerationOptions,
    references: &[ReferenceImage],
) -> Value {
    let mut parts = references
        .iter()
        .map(|image| {
            json!({
                "inlineData": {
                    "mimeType": image.mime_type,
                    "data": image.data_base64,
                }
            })
        })
        .collect::<Vec<_>>();
    parts.push(json!({ "text": options.prompt_text() }));

    let mut image_config = json!({ "imageSize": options.size.as_str() });
    if let Some(aspect) = options.aspect_ratio.as_deref() {
        image_config["aspectRatio"] = json!(aspect);
    }

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "responseModalities": ["IMAGE", "TEXT"],
            "imageConfig": image_config,
        },
        "tools": [{ "googleSearch": {} }],
    })
}

#[derive(Debug, Clone)]
pub struct GeminiImageClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl GeminiImageClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(GenerationError::Http)?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: String::from(DEFAULT_API_BASE),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn endpoint_for(&self, model: &str) -> String {
        format!("{}/models/{model}:generateContent", self.base_url)
    }

    pub fn generate(
        &self,
        options: &GenerationOptions,
        references: &[ReferenceImage],
    ) -> Result<GenerateContentResponse, GenerationError> {
        let body = build_generate_content_body(options, references);
        let endpoint = self.endpoint_for(options.model.as_str());
        debug!(endpoint = %endpoint, references = references.len(), "sending generation request");

        let resp = self
            .http
            .post(endpoint.as_str())
            .header("x-goog-api-key", self.api_key.as_str())
            .json(&body)
            .send()
            .map_err(GenerationError::Http)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<GenerateContentResponse>()
            .map_err(GenerationError::Http)
    }
}

pub fn save_generated_images(
    response: &GenerateContentResponse,
    output_dir: &Path,
    output_name: &str,
) -> Result<SavedImages, GenerationError> {
    if response.candidates.is_empty() {
        return Err(GenerationError::NoCandidates);
    }
    fs::create_dir_all(output_dir).map_err(GenerationError::Io)?;

    let mut paths = Vec::new();
    let mut model_texts = Vec::new();
    let parts = response
        .candidates
        .iter()
        .filter_map(|candidate| candidate.content.as_ref())
        .flat_map(|content| content.parts.iter());
    for part in parts {
        if let Some(text) = part.text.as_deref() {
            let preview = text.chars().take(MODEL_TEXT_PREVIEW_CHARS).collect::<String>();
            info!(text = %preview, "model response");
            model_texts.push(text.to_string());
        }
        if let Some(inline) = part.inline_data.as_ref() {
            let bytes = BASE64_STANDARD
                .decode(inline.data.as_bytes())
                .map_err(GenerationError::Decode)?;
            let path = output_dir.join(output_file_name(output_name, paths.len()));
            fs::write(path.as_path(), bytes.as_slice()).map_err(GenerationError::Io)?;
            debug!(path = %path.display(), bytes = bytes.len(), "wrote generated image");
            paths.push(path);
        }
    }

    if paths.is_empty() {
        return Err(GenerationError::NoImages);
    }
    Ok(SavedImages {
        paths,
        model_texts,
        usage: response.usage_metadata,
    })
}
