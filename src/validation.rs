//! Chat request validation.
//!
//! Turns an OpenAI-style [`ChatRequest`] into a flat [`Prompt`] before it is
//! forwarded downstream. Pixels are never decoded here; an image is only
//! checked for valid base64, decoded size and a known file signature.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{AppError, AppResult};
use crate::models::{ChatRequest, MessageContent};
use crate::services::inference::Prompt;

/// Prompt used when a request carries an image but no text.
pub const DEFAULT_IMAGE_PROMPT: &str = "Describe this image.";

/// Prompt used when a request carries neither text nor image.
pub const DEFAULT_TEXT_PROMPT: &str = "Hello.";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Per-request limits, taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatLimits {
    pub max_tokens: u32,
    pub max_images: usize,
    pub max_image_mb: f64,
}

/// Image formats accepted by signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Tiff,
    Webp,
}

/// Identify an image by its leading bytes.
pub fn sniff_image_format(bytes: &[u8]) -> Option<ImageFormat> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some(ImageFormat::Jpeg),
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(ImageFormat::Png),
        [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(ImageFormat::Gif),
        [b'B', b'M', ..] => Some(ImageFormat::Bmp),
        [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => Some(ImageFormat::Tiff),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageFormat::Webp),
        _ => None,
    }
}

/// Decode and check one base64 image payload. Returns the decoded size.
pub fn validate_image(b64: &str, max_mb: f64) -> AppResult<usize> {
    let bytes = STANDARD
        .decode(b64.trim())
        .map_err(|_| AppError::DecodeError("Invalid base64 encoding".to_string()))?;

    let size_mb = bytes.len() as f64 / BYTES_PER_MB;
    if size_mb > max_mb {
        return Err(AppError::PayloadTooLarge(format!(
            "Image too large: {size_mb:.2}MB (max: {max_mb}MB)"
        )));
    }

    if sniff_image_format(&bytes).is_none() {
        return Err(AppError::UnsupportedMedia(
            "Unsupported image format or corrupted image".to_string(),
        ));
    }
    Ok(bytes.len())
}

/// Validate `request` and flatten it into a prompt.
pub fn validate_chat_request(request: &ChatRequest, limits: ChatLimits) -> AppResult<Prompt> {
    if request.max_tokens > limits.max_tokens {
        return Err(AppError::BadRequest(format!(
            "max_tokens too large. Maximum: {}",
            limits.max_tokens
        )));
    }

    let mut text_parts: Vec<&str> = Vec::new();
    let mut images: Vec<&str> = Vec::new();

    for message in &request.messages {
        match &message.content {
            Some(MessageContent::Text(text)) => text_parts.push(text),
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    match part.kind.as_str() {
                        "text" => text_parts.push(part.text.as_deref().unwrap_or_default()),
                        "image" | "image_url" => {
                            if images.len() >= limits.max_images {
                                return Err(AppError::BadRequest(format!(
                                    "Too many images. Maximum: {}",
                                    limits.max_images
                                )));
                            }
                            if let Some(b64) = part
                                .image
                                .as_ref()
                                .and_then(|image| image.b64.as_deref())
                                .filter(|b64| !b64.is_empty())
                            {
                                validate_image(b64, limits.max_image_mb)?;
                                images.push(b64);
                            }
                        }
                        _ => {}
                    }
                }
            }
            None => {}
        }
    }

    let joined = text_parts
        .iter()
        .filter(|t| !t.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    let text = match joined.trim() {
        "" if !images.is_empty() => DEFAULT_IMAGE_PROMPT.to_string(),
        "" => DEFAULT_TEXT_PROMPT.to_string(),
        trimmed => trimmed.to_string(),
    };

    Ok(Prompt {
        model: request.model.clone(),
        text,
        image_b64: images.first().map(|b64| b64.trim().to_string()),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
    })
}
