//! Prompt templates and system-prompt presets.
//!
//! Templates are pure functions from a message log to a prompt string; they
//! never touch the engine.

use serde::{Deserialize, Serialize};

use crate::chat::{ChatMessage, Role};

/// Prompt format for the loaded model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplate {
    /// Instruction-tuned format with BOS/EOS markers (`[INST]` style).
    #[default]
    Instruct,
    /// Role-tagged `<|im_start|>` format.
    ChatMl,
}

impl ChatTemplate {
    /// Stable identifier.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Instruct => "instruct",
            Self::ChatMl => "chatml",
        }
    }

    /// Render a message log into a prompt ending with the assistant cue.
    #[must_use]
    pub fn format(self, messages: &[ChatMessage]) -> String {
        match self {
            Self::Instruct => format_instruct(messages),
            Self::ChatMl => format_chatml(messages),
        }
    }
}

fn format_instruct(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    let mut system: Option<&str> = None;
    let mut pending_context: Vec<&str> = Vec::new();
    let mut open_inst = false;

    for message in messages {
        match message.role {
            Role::System => system = Some(&message.content),
            Role::Summary => pending_context.push(&message.content),
            Role::User => {
                out.push_str("<s>[INST] ");
                if let Some(system) = system.take() {
                    out.push_str("<<SYS>>\n");
                    out.push_str(system);
                    out.push_str("\n<</SYS>>\n\n");
                }
                for summary in pending_context.drain(..) {
                    out.push_str("[Earlier conversation summary: ");
                    out.push_str(summary);
                    out.push_str("]\n\n");
                }
                out.push_str(&message.content);
                out.push_str(" [/INST]");
                open_inst = true;
            }
            Role::Assistant => {
                out.push(' ');
                out.push_str(&message.content);
                out.push_str(" </s>");
                open_inst = false;
            }
        }
    }
    if open_inst {
        out.push(' ');
    }
    out
}

fn format_chatml(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        let (role, prefix) = match message.role {
            Role::System => ("system", ""),
            Role::User => ("user", ""),
            Role::Assistant => ("assistant", ""),
            Role::Summary => ("system", "Summary of earlier conversation:\n"),
        };
        out.push_str("<|im_start|>");
        out.push_str(role);
        out.push('\n');
        out.push_str(prefix);
        out.push_str(&message.content);
        out.push_str("<|im_end|>\n");
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

/// Prompt for the recursive summarization generation.
#[must_use]
pub fn summarization_prompt(run: &[ChatMessage]) -> String {
    let mut out = String::from(
        "Summarize the conversation below in a few sentences. Preserve names, facts, and \
         decisions; drop pleasantries.\n\n",
    );
    for message in run {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Summary => "earlier summary",
        };
        out.push_str(role);
        out.push_str(": ");
        out.push_str(&message.content);
        out.push('\n');
    }
    out.push_str("\nSummary:");
    out
}

/// Named immutable system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemPromptPreset {
    /// General-purpose concise assistant.
    #[default]
    Assistant,
    /// Programming-focused assistant.
    Coder,
    /// Creative writing partner.
    Creative,
}

impl SystemPromptPreset {
    /// The preset's system prompt text.
    #[must_use]
    pub fn text(self) -> &'static str {
        match self {
            Self::Assistant => {
                "You are a helpful assistant running fully on-device. Be accurate and concise; \
                 answer directly without filler."
            }
            Self::Coder => {
                "You are an expert programming assistant. Prefer short, correct code with a \
                 one-line explanation. Say so when you are unsure."
            }
            Self::Creative => {
                "You are a creative writing partner. Offer vivid, surprising, coherent ideas \
                 and match the user's tone."
            }
        }
    }
}
