//! LLM normalizer client for a local Ollama endpoint.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{LlmClient, LlmRequest};

const SCHEMA_PROMPT: &str = r#"You are a precise invoice parser. Convert OCR blocks to schema JSON.
Return ONLY JSON.
SCHEMA:
{"supplier_name": str|null, "invoice_number": str|null, "invoice_date": "YYYY-MM-DD"|null,
 "currency": "GBP"|"EUR"|"USD"|null, "subtotal": float|null, "tax_amount": float|null, "total_amount": float|null,
 "lines": [{"description": str, "quantity": float|null, "unit_price": float|null, "line_total": float|null, "tax_rate": float|null}],
 "confidence": float, "notes": str|null}
RULES: dates->YYYY-MM-DD, symbol currencies to codes, floats only, null if unsure."#;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    http: reqwest::blocking::Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.into(),
            model: model.into(),
            http,
        })
    }

    /// Cheap liveness probe used by the readiness check.
    pub fn available(&self) -> bool {
        self.http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

impl LlmClient for OllamaClient {
    fn normalize(&self, request: &LlmRequest) -> anyhow::Result<Value> {
        let prompt = format!(
            "{SCHEMA_PROMPT}\nCONTEXT: region={}, industry={}, document_type={}\nOCR TEXT:\n{}",
            request.context.region, request.context.industry, request.context.document_type, request.text
        );
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: "json",
        };
        let response: GenerateResponse = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .timeout(request.timeout)
            .json(&body)
            .send()
            .context("sending normalization request")?
            .error_for_status()
            .context("normalization request rejected")?
            .json()
            .context("decoding normalization envelope")?;

        serde_json::from_str(&response.response).context("model output is not valid JSON")
    }
}
