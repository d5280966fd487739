use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::capture::{detect_mime_type, normalize_image_mime, Portrait};
use crate::config::{Config, ANALYSIS_PROMPT};
use crate::error::{BoothError, HttpStatusError};
use crate::llm::{
    compose_transform_prompt, GeneratedImage, TransformTarget, TransformationResult, VisionBackend,
};
use crate::utils::http::get_http_client;
use crate::utils::timing::log_llm_timing;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

// Both the camelCase and snake_case spellings of the inline payload show up
// depending on the API surface that answered.
#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "inlineData", alias = "inline_data")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Debug, Deserialize)]
struct GeminiInlineData {
    #[serde(default, rename = "mimeType", alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default)]
struct ParsedParts {
    text: Option<String>,
    image: Option<GeneratedImage>,
}

pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    analysis_model: String,
    transform_model: String,
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_parts(parts: &[Value]) -> Vec<Value> {
    parts
        .iter()
        .map(|part| {
            if let Some(text) = part.get("text").and_then(|value| value.as_str()) {
                json!({ "text": truncate_for_log(text, 200) })
            } else if let Some(inline_data) = part.get("inlineData") {
                let mime_type = inline_data
                    .get("mimeType")
                    .and_then(|value| value.as_str())
                    .unwrap_or("unknown");
                let data_len = inline_data
                    .get("data")
                    .and_then(|value| value.as_str())
                    .map(|value| value.len())
                    .unwrap_or(0);
                json!({ "inlineData": { "mimeType": mime_type, "dataLen": data_len } })
            } else {
                json!({ "unknownPart": true })
            }
        })
        .collect()
}

fn summarize_payload(payload: &Value) -> Value {
    let mut summary = Map::new();
    if let Some(contents) = payload.get("contents").and_then(|value| value.as_array()) {
        let summarized: Vec<Value> = contents
            .iter()
            .map(|content| {
                let parts = content
                    .get("parts")
                    .and_then(|value| value.as_array())
                    .map(|parts| summarize_parts(parts))
                    .unwrap_or_default();
                json!({ "parts": parts })
            })
            .collect();
        summary.insert("contents".to_string(), Value::Array(summarized));
    }
    if let Some(config) = payload.get("generationConfig") {
        summary.insert("generationConfig".to_string(), config.clone());
    }
    Value::Object(summary)
}

fn build_parts(prompt: &str, portrait: &Portrait) -> Vec<Value> {
    vec![
        json!({ "text": prompt }),
        json!({
            "inlineData": {
                "mimeType": portrait.mime_type(),
                "data": portrait.to_base64()
            }
        }),
    ]
}

fn build_analysis_payload(portrait: &Portrait) -> Value {
    json!({
        "contents": [{ "role": "user", "parts": build_parts(ANALYSIS_PROMPT, portrait) }],
    })
}

fn build_transform_payload(portrait: &Portrait, prompt: &str) -> Value {
    json!({
        "contents": [{ "role": "user", "parts": build_parts(prompt, portrait) }],
        "generationConfig": {
            "responseModalities": ["TEXT", "IMAGE"]
        },
    })
}

fn parse_first_candidate(response: GeminiResponse) -> ParsedParts {
    let parts = response
        .candidates
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .and_then(|content| content.parts)
        .unwrap_or_default();

    let mut texts = Vec::new();
    let mut image = None;
    for part in parts {
        if let Some(text) = part.text {
            if !text.trim().is_empty() {
                texts.push(text);
            }
        }
        if image.is_some() {
            continue;
        }
        let Some(inline_data) = part.inline_data else {
            continue;
        };
        match general_purpose::STANDARD.decode(inline_data.data.trim()) {
            Ok(bytes) if !bytes.is_empty() => {
                let mime_type = inline_data
                    .mime_type
                    .map(|mime| normalize_image_mime(&mime))
                    .or_else(|| detect_mime_type(&bytes))
                    .unwrap_or_else(|| "image/png".to_string());
                image = Some(GeneratedImage { bytes, mime_type });
            }
            Ok(_) => warn!("Gemini returned an empty inline data part"),
            Err(err) => warn!("Gemini inline data was not valid base64: {err}"),
        }
    }

    ParsedParts {
        text: if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        },
        image,
    }
}

fn block_reason(response: &GeminiResponse) -> Option<String> {
    response
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.clone())
}

impl GeminiClient {
    pub fn new(
        client: Client,
        base_url: &str,
        api_key: &str,
        analysis_model: &str,
        transform_model: &str,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            analysis_model: analysis_model.to_string(),
            transform_model: transform_model.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, BoothError> {
        let api_key = config.require_api_key()?;
        Ok(Self::new(
            get_http_client().clone(),
            &config.gemini_base_url,
            api_key,
            &config.gemini_analysis_model,
            &config.gemini_transform_model,
        ))
    }

    async fn call_model(&self, model: &str, payload: Value) -> Result<GeminiResponse> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);

        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(target: "llm.gemini", model = model, payload = %summarize_payload(&payload));
        }

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                warn!(
                    "Gemini request failed to send: {} (timeout={}, connect={})",
                    err,
                    err.is_timeout(),
                    err.is_connect()
                );
                anyhow!("Gemini request failed: {err}")
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Gemini API error: model={}, status={}, body={}",
                model,
                status,
                truncate_for_log(&body, 2000)
            );
            return Err(anyhow::Error::new(HttpStatusError { status, body }));
        }

        let value = response
            .json::<GeminiResponse>()
            .await
            .map_err(|err| anyhow!("Gemini response could not be parsed: {err}"))?;
        Ok(value)
    }
}

#[async_trait]
impl VisionBackend for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn analyze(&self, portrait: &Portrait) -> Result<String, BoothError> {
        let model = self.analysis_model.as_str();
        let payload = build_analysis_payload(portrait);
        let response = log_llm_timing("gemini", model, "analyze", || {
            self.call_model(model, payload)
        })
        .await
        .map_err(|err| BoothError::Analysis(format!("{err:#}")))?;

        let reason = block_reason(&response);
        match parse_first_candidate(response).text {
            Some(text) => {
                info!("Portrait analysis received ({} chars)", text.chars().count());
                Ok(text)
            }
            None => Err(BoothError::Analysis(match reason {
                Some(reason) => format!("prompt was blocked: {reason}"),
                None => "model returned no analysis text".to_string(),
            })),
        }
    }

    async fn transform(
        &self,
        portrait: &Portrait,
        target: &TransformTarget,
        analysis: Option<&str>,
    ) -> Result<TransformationResult, BoothError> {
        let model = self.transform_model.as_str();
        let prompt = compose_transform_prompt(target, analysis);
        let payload = build_transform_payload(portrait, &prompt);
        let response = log_llm_timing("gemini", model, "transform", || {
            self.call_model(model, payload)
        })
        .await
        .map_err(|err| BoothError::Transform(format!("{err:#}")))?;

        let reason = block_reason(&response);
        let parsed = parse_first_candidate(response);
        let result = TransformationResult {
            image: parsed.image,
            text: parsed.text,
        };
        if result.is_empty() {
            return Err(BoothError::Transform(match reason {
                Some(reason) => format!("prompt was blocked: {reason}"),
                None => format!("no image or text returned (model: {model})"),
            }));
        }
        info!(
            "Transformation for '{}' returned image={} text={}",
            target.label(),
            result.image.is_some(),
            result.text.is_some()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::capture::tests::{sample_png, sample_portrait};
    use crate::era;

    fn parse(body: &str) -> ParsedParts {
        parse_first_candidate(serde_json::from_str(body).unwrap())
    }

    fn header_end(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                let read = socket.read(&mut chunk).await.unwrap();
                if read == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..read]);
                if let Some(end) = header_end(&buffer) {
                    let head = String::from_utf8_lossy(&buffer[..end]).to_lowercase();
                    let length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|value| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buffer.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buffer).to_string()
        });
        (format!("http://{address}/v1beta"), handle)
    }

    fn client_for(base_url: &str) -> GeminiClient {
        GeminiClient::new(Client::new(), base_url, "test-key", "analysis-model", "transform-model")
    }

    #[test]
    fn reads_camel_case_inline_data() {
        let encoded = general_purpose::STANDARD.encode(sample_png());
        let body = format!(
            r#"{{"candidates":[{{"content":{{"parts":[{{"text":"Here you go"}},{{"inlineData":{{"mimeType":"image/png","data":"{encoded}"}}}}]}}}}]}}"#
        );
        let parsed = parse(&body);
        assert_eq!(parsed.text.as_deref(), Some("Here you go"));
        let image = parsed.image.unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.bytes, sample_png());
    }

    #[test]
    fn reads_snake_case_inline_data() {
        let encoded = general_purpose::STANDARD.encode(sample_png());
        let body = format!(
            r#"{{"candidates":[{{"content":{{"parts":[{{"inline_data":{{"mime_type":"image/jpg","data":"{encoded}"}}}}]}}}}]}}"#
        );
        let parsed = parse(&body);
        assert!(parsed.text.is_none());
        assert_eq!(parsed.image.unwrap().mime_type, "image/jpeg");
    }

    #[test]
    fn text_only_response_has_no_image() {
        let parsed = parse(
            r#"{"candidates":[{"content":{"parts":[{"text":"A noble in gold"},{"text":"  "},{"text":"by the Nile"}]}}]}"#,
        );
        assert!(parsed.image.is_none());
        assert_eq!(parsed.text.as_deref(), Some("A noble in gold\nby the Nile"));
    }

    #[test]
    fn missing_mime_type_is_sniffed_from_bytes() {
        let encoded = general_purpose::STANDARD.encode(sample_png());
        let body = format!(r#"{{"candidates":[{{"content":{{"parts":[{{"inlineData":{{"data":"{encoded}"}}}}]}}}}]}}"#);
        assert_eq!(parse(&body).image.unwrap().mime_type, "image/png");
    }

    #[test]
    fn only_the_first_candidate_is_used() {
        let parsed = parse(
            r#"{"candidates":[{"content":{"parts":[{"text":"first"}]}},{"content":{"parts":[{"text":"second"}]}}]}"#,
        );
        assert_eq!(parsed.text.as_deref(), Some("first"));
    }

    #[test]
    fn empty_or_invalid_payloads_yield_nothing() {
        let parsed = parse(r#"{"candidates":[]}"#);
        assert!(parsed.text.is_none() && parsed.image.is_none());
        let parsed = parse(
            r#"{"candidates":[{"content":{"parts":[{"inlineData":{"mimeType":"image/png","data":"%%%"}}]}}]}"#,
        );
        assert!(parsed.image.is_none());
    }

    #[test]
    fn transform_payload_requests_text_and_image() {
        let payload = build_transform_payload(&sample_portrait(), "prompt");
        assert_eq!(
            payload.pointer("/generationConfig/responseModalities"),
            Some(&json!(["TEXT", "IMAGE"]))
        );
        assert_eq!(
            payload.pointer("/contents/0/parts/1/inlineData/mimeType"),
            Some(&json!("image/png"))
        );
        assert!(build_analysis_payload(&sample_portrait())
            .get("generationConfig")
            .is_none());
    }

    #[test]
    fn payload_summary_hides_image_bytes() {
        let payload = build_transform_payload(&sample_portrait(), "prompt");
        let summary = summarize_payload(&payload).to_string();
        assert!(!summary.contains(&sample_portrait().to_base64()));
        assert!(summary.contains("dataLen"));
    }

    #[test]
    fn from_config_without_key_is_a_config_error() {
        let mut config = Config::load();
        config.gemini_api_key = String::new();
        assert!(matches!(
            GeminiClient::from_config(&config),
            Err(BoothError::Config(_))
        ));
    }

    #[tokio::test]
    async fn non_success_status_surfaces_code_and_body() {
        let (base_url, server) =
            serve_once("503 Service Unavailable", r#"{"error":{"message":"overloaded"}}"#.to_string())
                .await;
        let err = client_for(&base_url)
            .analyze(&sample_portrait())
            .await
            .unwrap_err();
        let request = server.await.unwrap();

        assert!(matches!(err, BoothError::Analysis(_)));
        let message = err.to_string();
        assert!(message.contains("503"), "{message}");
        assert!(message.contains("overloaded"), "{message}");
        assert!(request.starts_with("POST /v1beta/models/analysis-model:generateContent"));
        assert!(request.to_lowercase().contains("x-goog-api-key: test-key"));
    }

    #[tokio::test]
    async fn transform_round_trips_era_description_and_image() {
        let encoded = general_purpose::STANDARD.encode(sample_png());
        let body = format!(
            r#"{{"candidates":[{{"content":{{"parts":[{{"inlineData":{{"mimeType":"image/png","data":"{encoded}"}}}}]}}}}]}}"#
        );
        let (base_url, server) = serve_once("200 OK", body).await;
        let viking = era::find("viking").unwrap();

        let result = client_for(&base_url)
            .transform(&sample_portrait(), &TransformTarget::Era(viking), Some("red beard"))
            .await
            .unwrap();
        let request = server.await.unwrap();

        assert_eq!(result.image.unwrap().bytes, sample_png());
        assert!(result.text.is_none());
        assert!(request.contains("transform-model:generateContent"));
        assert!(request.contains(viking.description));
        assert!(request.contains("red beard"));
    }

    #[tokio::test]
    async fn transform_with_empty_candidates_fails() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"{"candidates":[],"promptFeedback":{"blockReason":"SAFETY"}}"#.to_string(),
        )
        .await;
        let err = client_for(&base_url)
            .transform(
                &sample_portrait(),
                &TransformTarget::Custom("anything".to_string()),
                None,
            )
            .await
            .unwrap_err();
        server.await.unwrap();
        assert!(matches!(err, BoothError::Transform(_)));
        assert!(err.to_string().contains("SAFETY"));
    }
}
