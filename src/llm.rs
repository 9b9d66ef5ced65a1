use crate::apis::rdw::RegistryRecord;
use crate::config::Config;
use crate::error::{Result, ScraperError};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub const SENTINEL_SUMMARY: &str = "Unable to generate summary.";

const SYSTEM_PROMPT: &str = "You are a professional Dutch used-car data analysis assistant.";

// Tags that never carry children and must not get a closing tag.
const VOID_ELEMENTS: [&str; 14] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Structured result of the recommendation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub llm_summary: String,
    pub llm_score: i64,
}

impl Recommendation {
    pub fn sentinel() -> Self {
        Self {
            llm_summary: SENTINEL_SUMMARY.to_string(),
            llm_score: 0,
        }
    }

    /// Containment boundary for the whole engine: one listing's failed
    /// recommendation must never abort the run, so every error collapses
    /// into the sentinel here.
    pub fn from_outcome(outcome: Result<Recommendation>) -> Self {
        match outcome {
            Ok(recommendation) => recommendation,
            Err(e) => {
                warn!("Recommendation failed: {}", e);
                Self::sentinel()
            }
        }
    }
}

/// Chat-completion client with one declared function tool. The provider
/// speaks the OpenAI wire shape; base URL and model come from config.
pub struct LlmClient {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config.require_llm_api_key()?.to_string();
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.llm_seconds))
            .build()?;
        Ok(Self {
            http_client,
            api_key,
            base_url: config.llm.base_url.clone(),
            model: config.llm.model.clone(),
        })
    }

    /// Builds the analysis prompt, runs the completion and parses the
    /// result. Never fails: any error yields the sentinel.
    #[instrument(skip_all)]
    pub async fn recommend(
        &self,
        car: &Value,
        registry: &RegistryRecord,
        secondary_html: Option<&str>,
    ) -> Recommendation {
        Recommendation::from_outcome(self.try_recommend(car, registry, secondary_html).await)
    }

    async fn try_recommend(
        &self,
        car: &Value,
        registry: &RegistryRecord,
        secondary_html: Option<&str>,
    ) -> Result<Recommendation> {
        let request = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_analysis_prompt(car, registry, secondary_html)},
            ],
            "tools": [report_summary_tool()],
            "tool_choice": "auto",
            "temperature": 0,
        });

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ScraperError::Api {
                message: format!("completion API error ({status}): {error_text}"),
            });
        }

        let response_json: Value = response.json().await?;
        let message = &response_json["choices"][0]["message"];
        let recommendation = parse_response(message)?;
        debug!("Recommendation score: {}", recommendation.llm_score);
        Ok(recommendation)
    }
}

/// Extracts summary and score from the assistant message: the declared tool
/// invocation first, the raw content as the same JSON shape second.
fn parse_response(message: &Value) -> Result<Recommendation> {
    let raw_args = message
        .pointer("/tool_calls/0/function/arguments")
        .and_then(Value::as_str)
        .or_else(|| message.get("content").and_then(Value::as_str))
        .ok_or_else(|| {
            ScraperError::MissingField("tool call arguments or content".to_string())
        })?;
    Ok(serde_json::from_str(raw_args)?)
}

fn report_summary_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "report_summary",
            "description": "Produces a car-buying recommendation and score.",
            "parameters": {
                "type": "object",
                "properties": {
                    "llm_summary": {"type": "string"},
                    "llm_score": {"type": "integer"},
                },
                "required": ["llm_summary", "llm_score"],
            },
        },
    })
}

fn build_analysis_prompt(
    car: &Value,
    registry: &RegistryRecord,
    secondary_html: Option<&str>,
) -> String {
    let car_json = serde_json::to_string_pretty(car).unwrap_or_default();
    let registry_json = serde_json::to_string_pretty(registry).unwrap_or_default();
    let sanitized = secondary_html.map(sanitize_html).unwrap_or_default();

    format!(
        r#"
Please analyze the following information about a used car from three different sources:

1. Car listing details (price, mileage, estimated_price, etc.):
{car_json}

2. RDW data (official Dutch vehicle database):
{registry_json}

3. Finnik page HTML (sanitized):
{sanitized}

Pay special attention to:
- Year of manufacture
- First registration date
- APK (MOT) expiration date
- Mileage
- Price difference between estimated_price and selling price
- Ownership history
- Fault or damage history

Based on your professional experience, evaluate whether it's worth purchasing,
explain your reasoning, and give an evaluation score out of 100.

Please structure your analysis in the following sections:
    1. Vehicle Overview
    2. Price Analysis
    3. History & Maintenance
    4. Risk Factors
    5. Final Recommendation

Use the report_summary tool to provide your analysis and score.
"#
    )
}

/// Removes every attribute from every tag, keeping tag structure and text
/// content. Scoped to the document body (or the whole document when there is
/// none); bounds prompt size without losing the page's textual content.
pub fn sanitize_html(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }
    let document = Html::parse_document(html);
    let body_selector = Selector::parse("body").unwrap();
    let root = document
        .select(&body_selector)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut out = String::new();
    write_inner(root, &mut out);
    out
}

fn write_inner(element: ElementRef<'_>, out: &mut String) {
    for node in element.children() {
        if let Some(text) = node.value().as_text() {
            out.push_str(&text.text);
        } else if let Some(child) = ElementRef::wrap(node) {
            let name = child.value().name();
            out.push('<');
            out.push_str(name);
            out.push('>');
            if !VOID_ELEMENTS.contains(&name) {
                write_inner(child, out);
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
        }
        // Comments, doctypes and processing instructions are dropped.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitizer_strips_attributes_and_keeps_structure() {
        let html = r#"<html><body><div class="card" id="main" data-x="1"><p style="color: red">Hello <b class="hl" title="t">world</b></p></div></body></html>"#;
        assert_eq!(
            sanitize_html(html),
            "<div><p>Hello <b>world</b></p></div>"
        );
    }

    #[test]
    fn sanitizer_handles_void_elements() {
        let html = r#"<body><p>line<br class="x">break <img src="car.jpg" alt="car"></p></body>"#;
        assert_eq!(sanitize_html(html), "<p>line<br>break <img></p>");
    }

    #[test]
    fn sanitizer_of_empty_input_is_empty() {
        assert_eq!(sanitize_html(""), "");
    }

    #[test]
    fn tool_call_arguments_are_preferred() {
        let message = json!({
            "content": "ignored",
            "tool_calls": [{
                "function": {
                    "name": "report_summary",
                    "arguments": "{\"llm_summary\":\"Good value\",\"llm_score\":82}"
                }
            }]
        });
        let recommendation = parse_response(&message).unwrap();
        assert_eq!(recommendation.llm_summary, "Good value");
        assert_eq!(recommendation.llm_score, 82);
    }

    #[test]
    fn content_json_is_the_fallback() {
        let message = json!({
            "content": "{\"llm_summary\":\"Decent\",\"llm_score\":60}"
        });
        let recommendation = parse_response(&message).unwrap();
        assert_eq!(recommendation.llm_summary, "Decent");
        assert_eq!(recommendation.llm_score, 60);
    }

    #[test]
    fn absent_tool_call_and_content_degrade_to_the_sentinel() {
        let message = json!({ "role": "assistant" });
        let outcome = parse_response(&message);
        assert!(outcome.is_err());

        let recommendation = Recommendation::from_outcome(outcome);
        assert_eq!(recommendation, Recommendation::sentinel());
        assert_eq!(recommendation.llm_summary, SENTINEL_SUMMARY);
        assert_eq!(recommendation.llm_score, 0);
    }

    #[test]
    fn malformed_arguments_degrade_to_the_sentinel() {
        let message = json!({
            "tool_calls": [{ "function": { "arguments": "not json" } }]
        });
        let recommendation = Recommendation::from_outcome(parse_response(&message));
        assert_eq!(recommendation, Recommendation::sentinel());
    }
}
