//! Captions from a local OpenAI-compatible vision endpoint (LM Studio,
//! llama.cpp server, vLLM, ...).

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;

use super::{Capability, CapabilityError, CapabilityKind, Detection};
use crate::config::CaptionConfig;
use crate::imaging::{Variant, VariantKind};

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

pub struct ChatCaptioner {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    prompt: String,
    max_tokens: u32,
}

impl ChatCaptioner {
    pub fn new(config: &CaptionConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(anyhow!("caption endpoint is not configured"));
        }

        Ok(Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            prompt: config.prompt.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn build_request(&self, data_url: String) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text {
                        text: self.prompt.clone(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ],
            }],
            max_tokens: self.max_tokens,
            temperature: 0.2,
        }
    }

    fn describe(&self, img: &DynamicImage) -> Result<String> {
        let data_url = format!("data:image/jpeg;base64,{}", encode_jpeg(img)?);
        let request = self.build_request(data_url);

        let url = format!("{}/chat/completions", self.endpoint);
        let mut req = self.agent.post(&url).set("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", api_key));
        }

        let response = req
            .send_json(&request)
            .map_err(|e| anyhow!("Caption request failed: {}", e))?;
        let chat_response: ChatResponse = response
            .into_json()
            .map_err(|e| anyhow!("Failed to parse caption response: {}", e))?;

        chat_response
            .choices
            .first()
            .map(|c| clean_caption(&c.message.content))
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow!("Empty caption response"))
    }
}

impl Capability for ChatCaptioner {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Caption
    }

    fn variant(&self) -> VariantKind {
        VariantKind::Caption
    }

    fn detect(&mut self, variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
        let text = self
            .describe(&variant.image)
            .map_err(|e| CapabilityError::inference(CapabilityKind::Caption, e))?;
        Ok(vec![Detection::Caption {
            text,
            confidence: 1.0,
        }])
    }
}

fn encode_jpeg(img: &DynamicImage) -> Result<String> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, 85);
    DynamicImage::ImageRgb8(img.to_rgb8())
        .write_with_encoder(encoder)
        .map_err(|e| anyhow!("Failed to encode image as JPEG: {}", e))?;
    Ok(BASE64.encode(buf.into_inner()))
}

/// Models like to wrap the sentence in quotes or add a label
fn clean_caption(raw: &str) -> String {
    let text = raw.trim();
    let text = text
        .strip_prefix("Caption:")
        .or_else(|| text.strip_prefix("caption:"))
        .unwrap_or(text)
        .trim();
    text.trim_matches(|c| c == '"' || c == '\'').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_caption() {
        assert_eq!(clean_caption("  \"A dog on a beach.\"\n"), "A dog on a beach.");
        assert_eq!(clean_caption("Caption: two kids"), "two kids");
        assert_eq!(clean_caption("   "), "");
    }

    #[test]
    fn test_request_shape() {
        let captioner = ChatCaptioner::new(&CaptionConfig {
            enabled: true,
            endpoint: "http://localhost:1234/v1/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(captioner.endpoint, "http://localhost:1234/v1");

        let value = serde_json::to_value(captioner.build_request("data:x".into())).unwrap();
        assert_eq!(value["messages"][0]["content"][0]["type"], "text");
        assert_eq!(value["messages"][0]["content"][1]["type"], "image_url");
        assert_eq!(value["messages"][0]["content"][1]["image_url"]["url"], "data:x");
        assert_eq!(value["max_tokens"], 120);
    }

    #[test]
    fn test_encode_jpeg_is_base64() {
        let encoded = encode_jpeg(&DynamicImage::new_rgb8(8, 8)).unwrap();
        let bytes = BASE64.decode(encoded).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_empty_endpoint_is_rejected() {
        let config = CaptionConfig {
            endpoint: " ".to_string(),
            ..Default::default()
        };
        assert!(ChatCaptioner::new(&config).is_err());
    }
}
