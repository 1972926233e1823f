use crate::error::QueryError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

pub const DEFAULT_INFERENCE_URL: &str = "https://api-inference.huggingface.co/models";

/// A text generation model conditioned on a fully rendered prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_id(&self) -> &str;

    async fn generate(&self, prompt: &str, max_new_tokens: usize) -> Result<String, QueryError>;
}

/// Text generation over a Hugging Face style inference endpoint.
pub struct HuggingFaceGenerator {
    client: Client,
    endpoint: String,
    model: String,
    api_token: Option<String>,
}

impl HuggingFaceGenerator {
    /// `base_url` is the models root; the model id is appended to it.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_token: Option<String>) -> Self {
        let model = model.into();
        let endpoint = format!("{}/{}", base_url.into().trim_end_matches('/'), model);
        Self {
            client: Client::new(),
            endpoint,
            model,
            api_token: api_token.filter(|token| !token.trim().is_empty()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Generator for HuggingFaceGenerator {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, max_new_tokens: usize) -> Result<String, QueryError> {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "inputs": prompt,
            "parameters": { "max_new_tokens": max_new_tokens },
        }));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        interpret_response(&self.endpoint, status, &body)
    }
}

/// Checks the status before decoding, so a proxy error page or a plain-text
/// failure surfaces as a generation error carrying the status.
pub fn interpret_response(endpoint: &str, status: StatusCode, body: &str) -> Result<String, QueryError> {
    if !status.is_success() {
        let details = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|payload| error_message(&payload))
            .unwrap_or_else(|| body.chars().take(300).collect());
        return Err(QueryError::Generation(format!(
            "{endpoint} returned {status}: {details}"
        )));
    }

    let payload: Value = serde_json::from_str(body).map_err(|error| {
        QueryError::Generation(format!("{endpoint} returned undecodable body: {error}"))
    })?;
    parse_generated_text(&payload)
}

fn error_message(payload: &Value) -> Option<String> {
    payload.get("error").map(|error| match error.as_str() {
        Some(message) => message.to_string(),
        None => error.to_string(),
    })
}

/// Accepts `[{"generated_text": ..}]` as well as a bare `{"generated_text": ..}`.
pub fn parse_generated_text(payload: &Value) -> Result<String, QueryError> {
    if let Some(message) = error_message(payload) {
        return Err(QueryError::Generation(message));
    }

    payload
        .pointer("/0/generated_text")
        .or_else(|| payload.get("generated_text"))
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .ok_or_else(|| {
            QueryError::Generation(format!("response has no generated_text: {payload}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_payload_is_parsed() -> Result<(), QueryError> {
        let payload = json!([{ "generated_text": " Employees get 25 days. " }]);
        assert_eq!(parse_generated_text(&payload)?, "Employees get 25 days.");
        Ok(())
    }

    #[test]
    fn object_payload_is_parsed() -> Result<(), QueryError> {
        let payload = json!({ "generated_text": "yes" });
        assert_eq!(parse_generated_text(&payload)?, "yes");
        Ok(())
    }

    #[test]
    fn error_payload_is_a_generation_error() {
        let payload = json!({ "error": "Model google/flan-t5-small is currently loading" });
        assert!(matches!(
            parse_generated_text(&payload),
            Err(QueryError::Generation(message)) if message.contains("loading")
        ));
    }

    #[test]
    fn missing_text_is_a_generation_error() {
        assert!(parse_generated_text(&json!([{}])).is_err());
    }

    #[test]
    fn non_json_error_body_keeps_status() {
        let result = interpret_response(
            "https://inference.example/models/m",
            StatusCode::BAD_GATEWAY,
            "<html>upstream timed out</html>",
        );
        assert!(matches!(
            result,
            Err(QueryError::Generation(message))
                if message.contains("502") && message.contains("upstream timed out")
        ));
    }

    #[test]
    fn json_error_body_uses_its_message() {
        let result = interpret_response(
            "https://inference.example/models/m",
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"error": "Model is currently loading"}"#,
        );
        assert!(matches!(
            result,
            Err(QueryError::Generation(message))
                if message.contains("503") && message.contains("currently loading")
        ));
    }

    #[test]
    fn success_body_must_be_json() -> Result<(), QueryError> {
        assert!(matches!(
            interpret_response("e", StatusCode::OK, "not json"),
            Err(QueryError::Generation(_))
        ));
        assert_eq!(
            interpret_response("e", StatusCode::OK, r#"[{"generated_text": "ok"}]"#)?,
            "ok"
        );
        Ok(())
    }

    #[test]
    fn endpoint_joins_model_and_drops_blank_token() {
        let generator = HuggingFaceGenerator::new(
            "https://inference.example/models/",
            "google/flan-t5-small",
            Some("  ".to_string()),
        );
        assert_eq!(
            generator.endpoint(),
            "https://inference.example/models/google/flan-t5-small"
        );
        assert_eq!(generator.model_id(), "google/flan-t5-small");
        assert!(generator.api_token.is_none());
    }
}
