//! Minimal OpenAI client for essay grading and follow-up generation.
//!
//! We only call chat.completions and request a strict JSON object.
//! Calls are instrumented and log model names, latencies and token usage (not contents).
//!
//! NOTE: We never log the API key or the respondent's answer text.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument};

use crate::config::Prompts;
use crate::domain::Question;
use crate::util::fill_template;

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub fast_model: String,
  pub strong_model: String,
}

/// Grading verdict as returned by the model.
#[derive(Debug, Deserialize)]
pub struct EssayVerdict {
  pub quality: f32,
  #[serde(default)] pub satisfied: Option<bool>,
  #[serde(default)] pub signals: Option<Value>,
  #[serde(default)] pub follow_up_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GeneratedFollowUp {
  pub prompt: String,
  #[serde(default)] pub rubric: Option<String>,
}

impl OpenAI {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env() -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let fast_model =
      std::env::var("OPENAI_FAST_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    let strong_model =
      std::env::var("OPENAI_STRONG_MODEL").unwrap_or_else(|_| "gpt-4o".into());

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(20))
      .build()
      .ok()?;

    Some(Self { client, api_key, base_url, fast_model, strong_model })
  }

  /// JSON-object chat completion. Generic over the target type T.
  #[instrument(level = "info", skip(self, system, user), fields(model = %model))]
  async fn chat_json<T: for<'a> Deserialize<'a>>(
    &self,
    model: &str,
    system: &str,
    user: &str,
    temperature: f32,
  ) -> Result<T, String> {
    let url = format!("{}/chat/completions", self.base_url);
    let req = ChatCompletionRequest {
      model: model.to_string(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: system.into() },
        ChatMessageReq { role: "user".into(), content: user.into() },
      ],
      temperature,
      response_format: Some(ResponseFormat { r#type: "json_object".into() }),
      max_tokens: None,
    };

    let start = std::time::Instant::now();
    let res = self.client.post(&url)
      .header(USER_AGENT, "survey-live/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req).send().await.map_err(|e| e.to_string())?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or(body);
      error!(target: "survey_live", elapsed = ?start.elapsed(), %status, "OpenAI call failed");
      return Err(format!("OpenAI HTTP {}: {}", status, msg));
    }

    let body: ChatCompletionResponse = res.json().await.map_err(|e| e.to_string())?;
    if let Some(usage) = &body.usage {
      info!(target: "survey_live", elapsed = ?start.elapsed(), prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    let text = body.choices.first()
      .and_then(|c| c.message.content.clone())
      .unwrap_or_default();

    serde_json::from_str::<T>(&text).map_err(|e| format!("JSON parse error: {}", e))
  }

  // --- High-level helpers (domain-specialized) ---

  #[instrument(level = "info", skip(self, prompts, q, answer), fields(key = %q.key, answer_len = answer.len()))]
  pub async fn evaluate_essay(&self, prompts: &Prompts, q: &Question, answer: &str) -> Result<EssayVerdict, String> {
    let threshold = format!("{:.2}", q.threshold_or_default());
    let user = fill_template(
      &prompts.evaluate_user_template,
      &[
        ("prompt", &q.prompt),
        ("rubric", q.rubric.as_deref().unwrap_or("(none)")),
        ("threshold", &threshold),
        ("answer", answer),
      ],
    );
    let mut v: EssayVerdict = self.chat_json(&self.strong_model, &prompts.evaluate_system, &user, 0.2).await?;
    if !v.quality.is_finite() {
      return Err("quality is not a number".into());
    }
    // Some models answer on a 0-100 scale despite the instructions.
    if v.quality > 1.0 {
      v.quality /= 100.0;
    }
    v.quality = v.quality.clamp(0.0, 1.0);
    Ok(v)
  }

  #[instrument(level = "info", skip(self, prompts, q, analytics, history), fields(key = %q.key, %bucket))]
  pub async fn generate_follow_up(
    &self,
    prompts: &Prompts,
    q: &Question,
    bucket: &str,
    analytics: &str,
    history: &str,
  ) -> Result<GeneratedFollowUp, String> {
    let user = fill_template(
      &prompts.follow_up_user_template,
      &[("prompt", &q.prompt), ("bucket", bucket), ("analytics", analytics), ("history", history)],
    );
    let g: GeneratedFollowUp = self.chat_json(&self.fast_model, &prompts.follow_up_system, &user, 0.7).await?;
    if g.prompt.trim().is_empty() {
      return Err("empty follow-up prompt".into());
    }
    Ok(g)
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: String }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  match serde_json::from_str::<EWrap>(body) {
    Ok(w) => Some(w.error.message),
    Err(_) => None,
  }
}
