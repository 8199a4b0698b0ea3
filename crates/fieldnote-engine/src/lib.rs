use std::env;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fieldnote_contracts::chat::{ChatTurn, Transcript, TurnContent};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_MAX_TOKENS: u64 = 300;

const JPEG_QUALITY: u8 = 90;

/// Re-encodes a decoded image as RGB JPEG bytes, then base64 text. The
/// output is what gets embedded in chat payloads and the gallery file.
pub fn encode_jpeg(image: &DynamicImage) -> Result<String> {
    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(rgb))
        .context("JPEG encode failed")?;
    Ok(BASE64.encode(bytes))
}

/// Inverse of [`encode_jpeg`] for display. Fails on invalid base64 or a
/// byte stream that is not a JPEG.
pub fn decode_jpeg(text: &str) -> Result<DynamicImage> {
    let bytes = BASE64
        .decode(text.trim().as_bytes())
        .context("image base64 decode failed")?;
    image::load_from_memory_with_format(&bytes, image::ImageFormat::Jpeg)
        .context("JPEG decode failed")
}

pub fn data_url(image_b64: &str) -> String {
    format!("data:image/jpeg;base64,{image_b64}")
}

/// Hex SHA-256 of the base64 text. Event payloads carry this instead of
/// the image itself.
pub fn fingerprint(image_b64: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_b64.as_bytes());
    hex::encode(hasher.finalize())
}

/// One-shot client for the hosted chat-completions endpoint.
///
/// Each user turn issues exactly one blocking request built from the full
/// transcript. No retry, no backoff, no streaming, no request timeout: a
/// hung endpoint hangs the interaction, per the single-interactive-user
/// model.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    api_base: String,
    api_key: String,
    model: String,
    max_tokens: u64,
    http: HttpClient,
}

impl CompletionClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, max_tokens: u64) -> Self {
        Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
            http: HttpClient::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Maps every turn to the vendor message schema, in transcript order.
    /// Photo turns become one `image_url` block with a data URL; all other
    /// turns, prior assistant replies included, become one `text` block.
    /// Roles pass through literally, so replayed assistant turns keep the
    /// same typed-block shape as user turns.
    pub fn build_messages(transcript: &Transcript) -> Vec<Value> {
        transcript.turns().iter().map(turn_message).collect()
    }

    /// Sends the transcript and absorbs the reply: with at least one
    /// choice, the first choice's text is appended as an assistant turn
    /// and returned; with an empty choice list, nothing is appended and
    /// an empty string is returned.
    pub fn exchange(&self, transcript: &mut Transcript) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": Self::build_messages(transcript),
            "max_tokens": self.max_tokens,
        });
        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("completion request failed ({endpoint})"))?;

        let status = response.status();
        let body = response
            .text()
            .context("failed reading completion response body")?;
        if !status.is_success() {
            bail!(
                "completion endpoint returned {}: {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        let parsed: Value =
            serde_json::from_str(&body).context("completion response was not JSON")?;
        Ok(absorb_reply(transcript, &parsed))
    }
}

fn turn_message(turn: &ChatTurn) -> Value {
    match &turn.content {
        TurnContent::Photo(image_b64) => json!({
            "role": turn.role.as_str(),
            "content": [{"type": "image_url", "image_url": {"url": data_url(image_b64)}}],
        }),
        TurnContent::Text(text) => json!({
            "role": turn.role.as_str(),
            "content": [{"type": "text", "text": text}],
        }),
    }
}

fn absorb_reply(transcript: &mut Transcript, response: &Value) -> String {
    match first_choice_text(response) {
        Some(text) => {
            transcript.push(ChatTurn::assistant_text(text.clone()));
            text
        }
        None => String::new(),
    }
}

fn first_choice_text(response: &Value) -> Option<String> {
    let choices = response.get("choices").and_then(Value::as_array)?;
    let first = choices.first()?;
    Some(
        first
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    )
}

fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(limit).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use fieldnote_contracts::chat::{ChatTurn, Role, Transcript};
    use image::{DynamicImage, Rgb, RgbImage};
    use serde_json::{json, Value};

    use super::{
        absorb_reply, data_url, decode_jpeg, encode_jpeg, fingerprint, truncate_text,
        CompletionClient,
    };

    fn sample_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 5, Rgb([12, 180, 90])))
    }

    #[test]
    fn codec_round_trip_keeps_dimensions() -> anyhow::Result<()> {
        let image = sample_image();
        let decoded = decode_jpeg(&encode_jpeg(&image)?)?;
        assert_eq!(decoded.width(), 8);
        assert_eq!(decoded.height(), 5);
        Ok(())
    }

    #[test]
    fn decode_rejects_invalid_base64() {
        assert!(decode_jpeg("not*base64*at*all").is_err());
    }

    #[test]
    fn decode_rejects_non_jpeg_bytes() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;
        assert!(decode_jpeg(&BASE64.encode(b"plain text, no JFIF here")).is_err());
    }

    #[test]
    fn fingerprint_is_stable_hex_sha256() {
        assert_eq!(fingerprint("B1"), fingerprint("B1"));
        assert_ne!(fingerprint("B1"), fingerprint("B2"));
        assert_eq!(fingerprint("B1").len(), 64);
    }

    #[test]
    fn build_messages_maps_photo_and_text_in_order() {
        let mut transcript = Transcript::new();
        transcript.push(ChatTurn::user_photo("B1"));
        transcript.push(ChatTurn::user_text("what is this?"));

        let messages = CompletionClient::build_messages(&transcript);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], json!("user"));
        assert_eq!(messages[0]["content"][0]["type"], json!("image_url"));
        assert_eq!(
            messages[0]["content"][0]["image_url"]["url"],
            json!(data_url("B1"))
        );
        assert_eq!(messages[1]["content"][0]["type"], json!("text"));
        assert_eq!(messages[1]["content"][0]["text"], json!("what is this?"));
    }

    #[test]
    fn assistant_turns_replay_with_the_same_block_shape_as_user_turns() {
        let mut transcript = Transcript::new();
        transcript.push(ChatTurn::user_text("hello"));
        transcript.push(ChatTurn::assistant_text("a heron"));

        let messages = CompletionClient::build_messages(&transcript);
        assert_eq!(messages[1]["role"], json!("assistant"));
        assert_eq!(messages[1]["content"][0]["type"], json!("text"));
        assert_eq!(messages[1]["content"][0]["text"], json!("a heron"));
        assert_eq!(
            messages[0]["content"][0]["type"],
            messages[1]["content"][0]["type"]
        );
    }

    #[test]
    fn absorb_reply_appends_first_choice_as_assistant_turn() {
        let mut transcript = Transcript::new();
        transcript.push(ChatTurn::user_text("what is this?"));

        let response = json!({
            "choices": [
                {"message": {"role": "assistant", "content": "a grey heron"}},
                {"message": {"role": "assistant", "content": "ignored"}},
            ],
        });
        let reply = absorb_reply(&mut transcript, &response);

        assert_eq!(reply, "a grey heron");
        assert_eq!(transcript.len(), 2);
        let last = transcript.turns().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
    }

    #[test]
    fn absorb_reply_with_zero_choices_leaves_transcript_unchanged() {
        let mut transcript = Transcript::new();
        transcript.push(ChatTurn::user_text("what is this?"));
        let before = transcript.clone();

        let reply = absorb_reply(&mut transcript, &json!({"choices": []}));

        assert_eq!(reply, "");
        assert_eq!(transcript, before);
    }

    #[test]
    fn absorb_reply_without_choices_key_leaves_transcript_unchanged() {
        let mut transcript = Transcript::new();
        let reply = absorb_reply(&mut transcript, &json!({"error": {"message": "nope"}}));
        assert_eq!(reply, "");
        assert!(transcript.is_empty());
    }

    #[test]
    fn truncate_text_limits_long_bodies() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("abcdefghij", 4), "abcd...");
    }

    #[test]
    fn data_url_prefixes_the_jpeg_mime() {
        let value: Value = json!(data_url("QUJD"));
        assert_eq!(value, json!("data:image/jpeg;base64,QUJD"));
    }
}
