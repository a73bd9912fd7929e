use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{CancelToken, GenerateError, GenerateRequest, ImageGenerator};
use crate::domain::job::ProviderKind;

const ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_VISION_MODEL: &str = "google/gemini-2.5-flash";
const DEFAULT_IMAGE_MODEL: &str = "google/gemini-2.5-flash-image-preview";

const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(60);
const IMAGE_TIMEOUT: Duration = Duration::from_secs(120);
const TARGET_IMAGES: usize = 4;

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub vision_model: String,
    pub image_model: String,
    pub site_url: String,
    pub app_name: String,
}

impl OpenRouterConfig {
    /// Reads OPENROUTER_* from the environment; `None` without an API key,
    /// in which case callers fall back to the mock backend.
    pub fn from_env() -> Option<Self> {
        let api_key = env_trimmed("OPENROUTER_API_KEY")?;
        let default_model = env_trimmed("OPENROUTER_MODEL");
        Some(Self {
            api_key,
            vision_model: env_trimmed("OPENROUTER_VISION_MODEL")
                .or_else(|| default_model.clone())
                .unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
            image_model: env_trimmed("OPENROUTER_IMAGE_MODEL")
                .or(default_model)
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            site_url: env_trimmed("OPENROUTER_SITE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            app_name: env_trimmed("OPENROUTER_APP_NAME")
                .unwrap_or_else(|| "AvatarForge".to_string()),
        })
    }
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// OpenRouter backend: describes the subject with a vision model, then asks
/// an image model for four 1:1 avatar variations weighted between likeness
/// and style.
pub struct OpenRouterGenerator {
    client: reqwest::Client,
    config: OpenRouterConfig,
}

impl OpenRouterGenerator {
    pub fn new(config: OpenRouterConfig) -> Result<Self, GenerateError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GenerateError::Request(format!("http client init failed: {e}")))?;
        Ok(Self { client, config })
    }

    async fn chat(
        &self,
        payload: Value,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ChatCompletion, GenerateError> {
        let mut cancel = cancel.clone();
        let call = async {
            let response = self
                .client
                .post(ENDPOINT)
                .bearer_auth(&self.config.api_key)
                .header("HTTP-Referer", &self.config.site_url)
                .header("X-Title", &self.config.app_name)
                .timeout(timeout)
                .json(&payload)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        GenerateError::Request("openrouter request timed out".to_string())
                    } else {
                        GenerateError::Request(format!("openrouter request failed: {e}"))
                    }
                })?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| GenerateError::Request(format!("openrouter read failed: {e}")))?;

            if !status.is_success() {
                return Err(GenerateError::Http {
                    status: status.as_u16(),
                    body: body.chars().take(500).collect(),
                });
            }

            serde_json::from_str(&body)
                .map_err(|e| GenerateError::Parse(format!("openrouter response: {e}")))
        };

        tokio::select! {
            result = call => result,
            reason = cancel.canceled() => Err(GenerateError::Canceled(reason)),
        }
    }

    /// Structured appearance description from the selfie. `Ok(None)` when the
    /// vision model cannot take image input; the image request then falls
    /// back to sending the reference image directly.
    async fn describe_subject(
        &self,
        request: &GenerateRequest,
        cancel: &CancelToken,
    ) -> Result<Option<String>, GenerateError> {
        let payload = json!({
            "model": self.config.vision_model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a visual analysis assistant. Describe a person's \
                                appearance for portrait illustration. Do not infer identity \
                                or sensitive traits.",
                },
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "text",
                            "text": "From the selfie, extract a structured appearance \
                                     description useful for drawing a cartoon avatar. Return \
                                     a concise bullet list in English, focusing on: face \
                                     shape, skin tone, hairstyle/hair color, eyebrows, eyes, \
                                     glasses/accessories, facial hair, expression, clothing \
                                     collar/top, notable unique features. Avoid guessing age, \
                                     ethnicity, nationality, or identity.",
                        },
                        { "type": "image_url", "image_url": { "url": request.input_image_url } },
                    ],
                },
            ],
            "temperature": 0.2,
            "max_tokens": 500,
        });

        match self.chat(payload, DESCRIPTION_TIMEOUT, cancel).await {
            Ok(completion) => {
                let text = extract_text(&completion).trim().to_string();
                Ok((!text.is_empty()).then_some(text))
            }
            Err(err) if is_model_unsupported(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn request_images(
        &self,
        request: &GenerateRequest,
        description: Option<&str>,
        count: usize,
        variation: Option<usize>,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, GenerateError> {
        let prompt = build_prompt(request, description, count, variation);
        let content = if description.is_none() {
            json!([
                { "type": "text", "text": prompt },
                { "type": "image_url", "image_url": { "url": request.input_image_url } },
            ])
        } else {
            json!([{ "type": "text", "text": prompt }])
        };

        let payload = json!({
            "model": self.config.image_model,
            "modalities": ["image", "text"],
            "messages": [{ "role": "user", "content": content }],
            "temperature": 0.9,
        });

        match self.chat(payload, IMAGE_TIMEOUT, cancel).await {
            Ok(completion) => Ok(extract_image_urls(&completion)),
            Err(err) if is_model_unsupported(&err) => Err(GenerateError::ModelUnsupported),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl ImageGenerator for OpenRouterGenerator {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Openrouter
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: CancelToken,
    ) -> Result<Vec<String>, GenerateError> {
        let description = self.describe_subject(request, &cancel).await?;

        let mut collected: Vec<String> = Vec::new();
        let initial = self
            .request_images(request, description.as_deref(), TARGET_IMAGES, None, &cancel)
            .await?;
        for url in initial {
            let url = url.trim().to_string();
            if !url.is_empty() && !collected.contains(&url) {
                collected.push(url);
            }
        }

        // top up with single-image variation requests until we have four
        let mut variation = collected.len() + 1;
        while collected.len() < TARGET_IMAGES && variation <= TARGET_IMAGES {
            let more = self
                .request_images(request, description.as_deref(), 1, Some(variation), &cancel)
                .await?;
            if let Some(url) = more
                .into_iter()
                .map(|u| u.trim().to_string())
                .find(|u| !u.is_empty() && !collected.contains(u))
            {
                collected.push(url);
            }
            variation += 1;
        }

        if collected.is_empty() {
            return Err(GenerateError::NoImages);
        }

        collected.truncate(TARGET_IMAGES);
        while collected.len() < TARGET_IMAGES {
            let last = collected[collected.len() - 1].clone();
            collected.push(last);
        }
        Ok(collected)
    }
}

fn build_prompt(
    request: &GenerateRequest,
    description: Option<&str>,
    count: usize,
    variation: Option<usize>,
) -> String {
    let identity = u32::from(request.identity_strength.min(100));
    let style = 100 - identity;

    let header = if count == 1 {
        "Generate 1 square (1:1) cartoon avatar portrait image.".to_string()
    } else {
        format!("Generate {count} square (1:1) cartoon avatar portrait images.")
    };

    let mut lines = vec![
        header,
        "No text, no watermark, simple clean background, head-and-shoulders framing, \
         centered composition."
            .to_string(),
        "Safety: family-friendly portrait only. No nudity, sexual content, violence, \
         hate symbols, political content, or minors."
            .to_string(),
        String::new(),
        format!("Style pack: {}", request.style_id),
        "Negative prompt: low quality, blurry, deformed, text, watermark".to_string(),
        String::new(),
        format!("Likeness priority (0-100): {identity}. Style priority (0-100): {style}."),
        "If likeness is high, preserve key facial features and accessories. If style is \
         high, lean into the style while keeping the subject recognizable."
            .to_string(),
        String::new(),
    ];

    match description {
        Some(desc) => {
            lines.push("Subject appearance description:".to_string());
            lines.push(desc.to_string());
            lines.push(String::new());
        }
        None => {
            lines.push(
                "Use the provided selfie as the identity reference. Preserve key facial \
                 features and accessories."
                    .to_string(),
            );
            lines.push(String::new());
        }
    }

    if let Some(n) = variation {
        lines.push(format!(
            "Generate a distinct variation (#{n}). Do not repeat previous outputs."
        ));
    }

    lines.join("\n")
}

fn is_model_unsupported(err: &GenerateError) -> bool {
    let text = match err {
        GenerateError::Http { body, .. } => body,
        GenerateError::Request(msg) => msg,
        _ => return false,
    };
    text.contains("not supported by this model")
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Value,
    #[serde(default)]
    images: Vec<CompletionImage>,
}

#[derive(Debug, Deserialize)]
struct CompletionImage {
    image_url: ImageUrl,
}

#[derive(Debug, Deserialize)]
struct ImageUrl {
    url: String,
}

fn extract_text(completion: &ChatCompletion) -> String {
    let Some(choice) = completion.choices.first() else {
        return String::new();
    };
    match &choice.message.content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                Value::Object(obj) => obj.get("text").and_then(Value::as_str),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn extract_image_urls(completion: &ChatCompletion) -> Vec<String> {
    let mut urls = Vec::new();
    for choice in &completion.choices {
        for image in &choice.message.images {
            urls.push(image.image_url.url.clone());
        }
        // some models return images as image_url content parts instead
        if let Value::Array(parts) = &choice.message.content {
            for part in parts {
                if part.get("type").and_then(Value::as_str) != Some("image_url") {
                    continue;
                }
                if let Some(url) = part
                    .get("image_url")
                    .and_then(|v| v.get("url"))
                    .and_then(Value::as_str)
                {
                    urls.push(url.to_string());
                }
            }
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(raw: Value) -> ChatCompletion {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_extract_text_from_string_and_parts() {
        let c = completion(json!({
            "choices": [{ "message": { "content": "a plain description" } }]
        }));
        assert_eq!(extract_text(&c), "a plain description");

        let c = completion(json!({
            "choices": [{ "message": { "content": [
                { "type": "text", "text": "line one" },
                { "type": "text", "text": "line two" },
                { "type": "image_url", "image_url": { "url": "https://x/img.png" } },
            ] } }]
        }));
        assert_eq!(extract_text(&c), "line one\nline two");
    }

    #[test]
    fn test_extract_images_from_both_shapes() {
        let c = completion(json!({
            "choices": [{ "message": {
                "content": [
                    { "type": "image_url", "image_url": { "url": "https://x/a.png" } },
                ],
                "images": [
                    { "image_url": { "url": "https://x/b.png" } },
                ],
            } }]
        }));
        let urls = extract_image_urls(&c);
        assert_eq!(urls, vec!["https://x/b.png", "https://x/a.png"]);
    }

    #[test]
    fn test_prompt_weights_and_variation() {
        let request = GenerateRequest {
            input_image_url: "data:image/png;base64,abcd".into(),
            style_id: "noir".into(),
            identity_strength: 70,
        };
        let prompt = build_prompt(&request, Some("short hair"), 1, Some(3));
        assert!(prompt.contains("Likeness priority (0-100): 70. Style priority (0-100): 30."));
        assert!(prompt.contains("Style pack: noir"));
        assert!(prompt.contains("Subject appearance description:"));
        assert!(prompt.contains("variation (#3)"));
    }

    #[test]
    fn test_model_unsupported_detection() {
        let err = GenerateError::Http {
            status: 400,
            body: "The request is not supported by this model".into(),
        };
        assert!(is_model_unsupported(&err));
        assert!(!is_model_unsupported(&GenerateError::NoImages));
    }
}
