//! Multi-turn chat sessions with automatic context-overflow summarization.
//!
//! A session owns its message log and a handle to a text worker; it never
//! touches the engine directly. Mutations are atomic: every send builds a
//! tentative copy of history and commits it only after the engine call
//! succeeds, so a failed send leaves `messages()` byte-identical.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GenerationParams;
use crate::engine::StreamEnd;
use crate::error::VedaError;
use crate::telemetry::now_ms;
use crate::worker::{StreamingGeneration, WorkerHandle};

pub mod template;

use template::{ChatTemplate, SystemPromptPreset, summarization_prompt};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The system prompt; at most one, always first.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Synthetic digest replacing a run of older messages.
    Summary,
}

/// One immutable chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Creation time, unix milliseconds.
    pub created_at_ms: i64,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at_ms: now_ms(),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Prompt template.
    pub template: ChatTemplate,
    /// System prompt preset; `None` starts with no system message.
    pub preset: Option<SystemPromptPreset>,
    /// Context budget in tokens.
    pub max_context_tokens: u32,
    /// Fraction of the budget that triggers summarization.
    pub summarize_at_ratio: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            template: ChatTemplate::Instruct,
            preset: Some(SystemPromptPreset::Assistant),
            max_context_tokens: 2048,
            summarize_at_ratio: 0.70,
        }
    }
}

/// The last N non-system, non-summary messages that are never summarized.
const PROTECTED_TAIL: usize = 2;

/// Summarization runs with a reduced-token, low-temperature profile.
const SUMMARY_MAX_TOKENS: u32 = 256;
const SUMMARY_TEMPERATURE: f32 = 0.3;

/// Cheap context estimate: one token per four characters, rounded up.
fn estimated_tokens(messages: &[ChatMessage]) -> u32 {
    let chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    chars.div_ceil(4) as u32
}

/// Multi-turn conversation state over one text worker.
#[derive(Debug)]
pub struct ChatSession {
    worker: WorkerHandle,
    config: ChatConfig,
    messages: Vec<ChatMessage>,
    turns: usize,
}

impl ChatSession {
    /// Create a session; the preset (if any) becomes the system message.
    #[must_use]
    pub fn new(worker: WorkerHandle, config: ChatConfig) -> Self {
        let mut messages = Vec::new();
        if let Some(preset) = config.preset {
            messages.push(ChatMessage::new(Role::System, preset.text()));
        }
        Self {
            worker,
            config,
            messages,
            turns: 0,
        }
    }

    /// Read-only view of the message log.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Completed send count. Monotonic; summarization does not rewind it.
    #[must_use]
    pub fn turn_count(&self) -> usize {
        self.turns
    }

    /// Estimated context usage in `[0, 1]`.
    #[must_use]
    pub fn context_usage(&self) -> f32 {
        let est = estimated_tokens(&self.messages) as f32;
        (est / self.config.max_context_tokens.max(1) as f32).clamp(0.0, 1.0)
    }

    /// Drop all non-system messages. The engine KV cache is reset separately
    /// via the worker; the model stays loaded.
    pub fn reset(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
        self.turns = 0;
    }

    /// Swap the system prompt preset. By default the conversation resets;
    /// pass `retain_history` to keep all subsequent messages.
    pub fn set_preset(&mut self, preset: SystemPromptPreset, retain_history: bool) {
        if !retain_history {
            self.messages.clear();
            self.turns = 0;
        } else {
            self.messages.retain(|m| m.role != Role::System);
        }
        self.messages
            .insert(0, ChatMessage::new(Role::System, preset.text()));
        self.config.preset = Some(preset);
    }

    /// Send a user message and block for the assistant reply.
    ///
    /// On any failure the session is left byte-identical to its state before
    /// the call.
    pub async fn send(
        &mut self,
        user_text: &str,
        params: &GenerationParams,
    ) -> Result<String, VedaError> {
        params.validate()?;
        let (mut tentative, prompt) = self.prepare(user_text, params).await?;
        let completion = self.worker.generate(&prompt, params).await?;
        tentative.push(ChatMessage::new(Role::Assistant, completion.text.clone()));
        self.commit(tentative);
        Ok(completion.text)
    }

    /// Send a user message, streaming the reply token by token.
    ///
    /// The stream is finite and non-restartable. History commits when the
    /// stream finishes normally; a cancelled or failed stream leaves the
    /// session unchanged.
    pub async fn send_stream(
        &mut self,
        user_text: &str,
        params: &GenerationParams,
    ) -> Result<ChatStream<'_>, VedaError> {
        params.validate()?;
        let (tentative, prompt) = self.prepare(user_text, params).await?;
        let inner = self.worker.stream(&prompt, params).await?;
        Ok(ChatStream {
            session: self,
            inner,
            tentative,
            collected: String::new(),
        })
    }

    /// Build the tentative history (append + maybe summarize) and the final
    /// prompt. Does not mutate the session.
    async fn prepare(
        &self,
        user_text: &str,
        params: &GenerationParams,
    ) -> Result<(Vec<ChatMessage>, String), VedaError> {
        let mut tentative = self.messages.clone();
        tentative.push(ChatMessage::new(Role::User, user_text));

        let threshold = (f64::from(self.config.max_context_tokens)
            * f64::from(self.config.summarize_at_ratio)) as u32;
        if estimated_tokens(&tentative) >= threshold.max(1) {
            self.summarize(&mut tentative, params).await?;
        }

        let estimated = estimated_tokens(&tentative);
        if estimated > self.config.max_context_tokens {
            return Err(VedaError::ContextOverflow {
                estimated_tokens: estimated,
                max_context_tokens: self.config.max_context_tokens,
            });
        }

        let prompt = self.config.template.format(&tentative);
        Ok((tentative, prompt))
    }

    /// Replace the oldest summarizable run with a single summary message.
    /// Operates on the tentative copy only; the splice is all-or-nothing.
    async fn summarize(
        &self,
        tentative: &mut Vec<ChatMessage>,
        params: &GenerationParams,
    ) -> Result<(), VedaError> {
        let Some((start, end)) = summarizable_run(tentative) else {
            return Ok(());
        };

        let summary_params = GenerationParams {
            max_tokens: SUMMARY_MAX_TOKENS,
            temperature: params.temperature.min(SUMMARY_TEMPERATURE),
            ..params.clone()
        };
        let prompt = summarization_prompt(&tentative[start..end]);
        let completion = self.worker.generate(&prompt, &summary_params).await?;
        debug!(
            replaced = end - start,
            summary_tokens = completion.tokens_generated,
            "summarized conversation prefix"
        );

        tentative.splice(start..end, [ChatMessage::new(Role::Summary, completion.text)]);
        Ok(())
    }

    fn commit(&mut self, tentative: Vec<ChatMessage>) {
        self.messages = tentative;
        self.turns += 1;
    }
}

/// The oldest contiguous run eligible for summarization: everything except
/// the system prompt, the just-appended user message, and the last
/// [`PROTECTED_TAIL`] non-system, non-summary messages before it.
fn summarizable_run(messages: &[ChatMessage]) -> Option<(usize, usize)> {
    let len = messages.len();
    if len < 2 {
        return None;
    }

    // Index of the earliest protected message, scanning back over the tail.
    let mut protected_start = len - 1;
    let mut protected = 0;
    for idx in (0..len - 1).rev() {
        if protected == PROTECTED_TAIL {
            break;
        }
        match messages[idx].role {
            Role::User | Role::Assistant => {
                protected += 1;
                protected_start = idx;
            }
            Role::System | Role::Summary => break,
        }
    }

    let start = usize::from(messages.first().is_some_and(|m| m.role == Role::System));
    if start >= protected_start {
        return None;
    }
    Some((start, protected_start))
}

/// A lazily-consumed streaming reply bound to its session.
#[derive(Debug)]
pub struct ChatStream<'a> {
    session: &'a mut ChatSession,
    inner: StreamingGeneration,
    tentative: Vec<ChatMessage>,
    collected: String,
}

impl ChatStream<'_> {
    /// Next token, or `None` once the stream has ended.
    pub async fn next_token(&mut self) -> Option<String> {
        let token = self.inner.next_token().await;
        if let Some(token) = &token {
            self.collected.push_str(token);
        }
        token
    }

    /// Await the terminal outcome, committing history on normal completion.
    pub async fn finish(mut self) -> Result<StreamEnd, VedaError> {
        while let Some(token) = self.inner.next_token().await {
            self.collected.push_str(&token);
        }
        let end = self.inner.finish().await?;
        if let StreamEnd::Done { .. } = end {
            self.tentative
                .push(ChatMessage::new(Role::Assistant, self.collected));
            self.session.commit(self.tentative);
        }
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::scripted::ScriptedBackend;

    async fn session_with(backend: &ScriptedBackend, config: ChatConfig) -> ChatSession {
        let worker = WorkerHandle::spawn_text(
            Arc::new(backend.clone()),
            EngineConfig::new("/models/test.gguf"),
            None,
        )
        .await
        .expect("spawn");
        ChatSession::new(worker, config)
    }

    fn no_preset_config(max_context_tokens: u32) -> ChatConfig {
        ChatConfig {
            preset: None,
            max_context_tokens,
            ..ChatConfig::default()
        }
    }

    #[tokio::test]
    async fn send_commits_user_and_assistant() {
        let backend = ScriptedBackend::new();
        backend.push_reply("hello there");
        let mut session = session_with(&backend, no_preset_config(2048)).await;

        let reply = session.send("hi", &GenerationParams::default()).await.unwrap();
        assert_eq!(reply, "hello there");
        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.messages()[0].role, Role::User);
        assert_eq!(session.messages()[1].role, Role::Assistant);
        assert_eq!(session.turn_count(), 1);
    }

    #[tokio::test]
    async fn failed_send_leaves_history_untouched() {
        let backend = ScriptedBackend::new();
        backend.push_reply("first");
        let mut session = session_with(&backend, no_preset_config(2048)).await;
        session.send("one", &GenerationParams::default()).await.unwrap();
        let before = session.messages().to_vec();
        let turns_before = session.turn_count();

        backend.push_failure(VedaError::Generation("engine fault".into()));
        let err = session
            .send("two", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VedaError::Generation(_)));
        assert_eq!(session.messages(), before.as_slice());
        assert_eq!(session.turn_count(), turns_before);
    }

    #[tokio::test]
    async fn preset_seeds_the_system_message() {
        let backend = ScriptedBackend::new();
        let session = session_with(&backend, ChatConfig::default()).await;
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].role, Role::System);
        assert_eq!(
            session.messages()[0].content,
            SystemPromptPreset::Assistant.text()
        );
    }

    #[tokio::test]
    async fn overflow_triggers_exactly_one_summary_and_protects_the_tail() {
        let backend = ScriptedBackend::new();
        let mut session = session_with(&backend, no_preset_config(128)).await;

        let user_text = "tell me about item number N."; // ~29 chars
        for _ in 0..10 {
            session.send(user_text, &GenerationParams::default()).await.unwrap();
        }
        let turns_before = session.turn_count();
        session.send(user_text, &GenerationParams::default()).await.unwrap();

        let summaries = session
            .messages()
            .iter()
            .filter(|m| m.role == Role::Summary)
            .count();
        assert_eq!(summaries, 1, "summary runs fold into one message");
        assert_eq!(session.turn_count(), turns_before + 1);

        // The tail is intact: the final four non-summary messages are the
        // protected pair plus the new turn.
        let tail: Vec<Role> = session
            .messages()
            .iter()
            .rev()
            .take(3)
            .map(|m| m.role)
            .collect();
        assert_eq!(tail, vec![Role::Assistant, Role::User, Role::Assistant]);

        // And the session still fits its budget.
        assert!(estimated_tokens(session.messages()) <= 128);
    }

    #[tokio::test]
    async fn summarization_failure_aborts_the_send_atomically() {
        let backend = ScriptedBackend::new();
        let mut session = session_with(&backend, no_preset_config(128)).await;
        for _ in 0..6 {
            session
                .send("a fairly long user message here.", &GenerationParams::default())
                .await
                .unwrap();
        }
        let before = session.messages().to_vec();

        // A long enough message guarantees the next engine call is the
        // summarization; fail it.
        backend.push_failure(VedaError::Generation("summarizer down".into()));
        let result = session
            .send(&"another word ".repeat(16), &GenerationParams::default())
            .await;
        assert!(result.is_err());
        assert_eq!(session.messages(), before.as_slice());
    }

    #[tokio::test]
    async fn pathological_overflow_is_reported_and_harmless() {
        let backend = ScriptedBackend::new();
        let mut session = session_with(&backend, no_preset_config(8)).await;
        let before = session.messages().to_vec();

        let err = session
            .send(&"x".repeat(400), &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VedaError::ContextOverflow { .. }));
        assert_eq!(session.messages(), before.as_slice());
    }

    #[tokio::test]
    async fn reset_then_send_matches_a_fresh_session() {
        let backend = ScriptedBackend::new();
        let mut session = session_with(&backend, no_preset_config(2048)).await;
        session.send("warmup", &GenerationParams::default()).await.unwrap();
        session.reset();
        assert_eq!(session.turn_count(), 0);
        session.send("probe", &GenerationParams::default()).await.unwrap();

        let mut fresh = session_with(&backend, no_preset_config(2048)).await;
        fresh.send("probe", &GenerationParams::default()).await.unwrap();

        let observed: Vec<(Role, &str)> = session
            .messages()
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        let expected: Vec<(Role, &str)> = fresh
            .messages()
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(observed, expected);
    }

    #[tokio::test]
    async fn streaming_send_commits_on_done() {
        let backend = ScriptedBackend::new();
        backend.push_reply("streamed reply text");
        let mut session = session_with(&backend, no_preset_config(2048)).await;

        let mut stream = session
            .send_stream("hi", &GenerationParams::default())
            .await
            .unwrap();
        let mut tokens = 0;
        while stream.next_token().await.is_some() {
            tokens += 1;
        }
        assert_eq!(tokens, 3);
        let end = stream.finish().await.unwrap();
        assert!(matches!(end, StreamEnd::Done { .. }));

        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.messages()[1].content, "streamed reply text");
        assert_eq!(session.turn_count(), 1);
    }

    #[tokio::test]
    async fn preset_change_discards_or_retains() {
        let backend = ScriptedBackend::new();
        backend.push_reply("kept");
        let mut session = session_with(&backend, ChatConfig::default()).await;
        session.send("hello", &GenerationParams::default()).await.unwrap();

        session.set_preset(SystemPromptPreset::Coder, true);
        assert_eq!(session.messages()[0].content, SystemPromptPreset::Coder.text());
        assert_eq!(session.messages().len(), 3, "history retained");

        session.set_preset(SystemPromptPreset::Creative, false);
        assert_eq!(session.messages().len(), 1, "history discarded");
        assert_eq!(session.turn_count(), 0);
    }
}
