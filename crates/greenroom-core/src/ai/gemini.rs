//! Google Gemini provider.
//!
//! Same surface as the OpenAI provider, against the `generateContent`
//! endpoint. The credential travels in the `x-goog-api-key` header (never in
//! the URL, which could leak into transport error strings).

use std::time::Duration;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use super::ProviderError;
use crate::session::Session;
use crate::store::{Answer, Question, QuestionDraft};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const MODEL: &str = "gemini-1.5-flash";

/// Gemini-backed generator.
#[derive(Debug)]
pub struct GeminiProvider {
    client: Client,
    api_key: SecretString,
    api_base: String,
}

impl GeminiProvider {
    /// Creates a provider with the given credential and request timeout.
    #[must_use]
    pub fn new(api_key: SecretString, timeout: Duration) -> Self {
        Self::with_api_base(api_key, timeout, DEFAULT_API_BASE)
    }

    /// Creates a provider against a custom API base (tests).
    #[must_use]
    pub fn with_api_base(api_key: SecretString, timeout: Duration, api_base: &str) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Generates one question of `question_type` for the session's role.
    ///
    /// # Errors
    ///
    /// [`ProviderError`] on transport, status, or decode failure.
    pub async fn generate_question(
        &self,
        session: &Session,
        question_type: &str,
    ) -> Result<QuestionDraft, ProviderError> {
        let prompt = format!(
            "You are an interviewer. Create one question in the given mode for a role.\n\
             Mode: {question_type}\nRole: {role}\nDifficulty: {difficulty}\n\
             Return only the question text.",
            role = session.config.role_category,
            difficulty = session.config.difficulty,
        );
        let text = self.generate(&prompt).await?;
        Ok(QuestionDraft {
            question_type: question_type.to_string(),
            text: text.trim().to_string(),
            metadata: json!({
                "difficulty": session.config.difficulty,
                "hintAvailable": true
            }),
        })
    }

    /// Generates the session summary as a JSON object.
    ///
    /// # Errors
    ///
    /// [`ProviderError`] on transport, status, or decode failure.
    pub async fn generate_summary(
        &self,
        session: &Session,
        questions: &[Question],
        answers: &[Answer],
    ) -> Result<Value, ProviderError> {
        let mut qa = String::new();
        for question in questions {
            qa.push_str(&format!("Q{}: {}\n", question.ordinal, question.text));
            if let Some(answer) = answers.iter().find(|a| a.question_id == question.id) {
                let text = answer
                    .payload
                    .get("responseText")
                    .and_then(Value::as_str)
                    .unwrap_or("(non-text answer)");
                qa.push_str(&format!("A{}: {text}\n", question.ordinal));
            }
        }
        let prompt = format!(
            "Summarize this interview session. Return a JSON object with keys: \
             rubric (communication, problemSolving, technical, each 0-5), \
             strengths (2-3 bullets), gaps (2-3 bullets), \
             scoreBreakdown (object with overall 0-100).\n\
             Role: {role}\nQ/A: {qa}",
            role = session.config.role_category,
        );
        let text = self.generate(&prompt).await?;
        super::openai::parse_json_object(&text)
    }

    /// Evaluates one answer. Returns `{score, feedback, modelAnswer}`.
    ///
    /// # Errors
    ///
    /// [`ProviderError`] on transport, status, or decode failure.
    pub async fn analyze_answer(
        &self,
        question: &Question,
        answer: &Answer,
    ) -> Result<Value, ProviderError> {
        let answer_text = answer
            .payload
            .get("responseText")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let prompt = format!(
            "Evaluate the candidate's answer to the interview question.\n\
             Return a JSON object with keys: score (0-100), feedback (1-2 sentences), \
             modelAnswer (short ideal outline).\n\
             Question type: {qtype}\nAnswer type: {atype}\n\
             Question: {question}\nAnswer: {answer}",
            qtype = question.question_type,
            atype = answer.kind,
            question = question.text,
            answer = answer_text,
        );
        let text = self.generate(&prompt).await?;
        super::openai::parse_json_object(&text)
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}]
        });
        let response = self
            .client
            .post(format!(
                "{}/models/{MODEL}:generateContent",
                self.api_base
            ))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Decode("missing candidate content".into()))
    }
}
