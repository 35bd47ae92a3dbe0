//! Prompt Composition
//!
//! Turns a client task into the message list sent to the provider. The
//! wording is domain content and lives behind [`PromptComposer`] so it can
//! be replaced without touching the gateway.

use crate::backend::{ChatMessage, ChatRole};
use crate::events::Action;

/// Chat history turns forwarded to the provider
pub const MAX_HISTORY_TURNS: usize = 10;

/// What the provider is asked to do
#[derive(Clone, Debug, PartialEq)]
pub enum PromptTask {
    /// Continue the document at the cursor
    Completion {
        /// Text before the edit point
        before: String,
        /// Text after the edit point
        after: String,
    },

    /// Rewrite a passage
    Transform {
        /// The transform to apply (never [`Action::Completion`])
        action: Action,
        /// The passage
        text: String,
        /// Target language for translations
        target_language: Option<String>,
    },

    /// Answer a chat message
    Chat {
        /// The new user message
        message: String,
        /// Excerpt of the document being edited
        context: Option<String>,
        /// Earlier turns, oldest first
        history: Vec<ChatMessage>,
    },
}

/// Builds provider messages for a task
pub trait PromptComposer: Send + Sync {
    /// Compose the ordered message list
    fn compose(&self, task: &PromptTask) -> Vec<ChatMessage>;
}

/// Built-in short English prompts
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPrompts;

impl PromptComposer for DefaultPrompts {
    fn compose(&self, task: &PromptTask) -> Vec<ChatMessage> {
        match task {
            PromptTask::Completion { before, after } => vec![
                ChatMessage::system(
                    "You are a writing assistant. Continue the user's text naturally and \
                     fluently at the point where it stops. Reply with the continuation only.",
                ),
                ChatMessage::user(format!("{before}{after}")),
            ],
            PromptTask::Transform {
                action,
                text,
                target_language,
            } => {
                let (system, instruction) = match action {
                    Action::Rewrite => (
                        "You rewrite text so it reads more fluently and clearly while keeping its meaning.",
                        "Rewrite the following text:".to_string(),
                    ),
                    Action::Expand => (
                        "You expand text with more detail, examples and explanation.",
                        "Expand the following text:".to_string(),
                    ),
                    Action::Simplify => (
                        "You simplify text so it is concise and plain while keeping the core message.",
                        "Simplify the following text:".to_string(),
                    ),
                    Action::Translate => (
                        "You translate text faithfully, preserving tone and formatting.",
                        format!(
                            "Translate the following text into {}:",
                            target_language.as_deref().unwrap_or("English")
                        ),
                    ),
                    Action::Completion => (
                        "You are a writing assistant.",
                        "Process the following text:".to_string(),
                    ),
                };
                vec![
                    ChatMessage::system(system),
                    ChatMessage::user(format!("{instruction}\n\n{text}")),
                ]
            }
            PromptTask::Chat {
                message,
                context,
                history,
            } => {
                let mut system = String::from(
                    "You are the chat assistant of a writing tool. Give concrete, actionable \
                     writing advice in a friendly, concise tone.",
                );
                if let Some(context) = context.as_deref().filter(|c| !c.trim().is_empty()) {
                    system.push_str("\n\nExcerpt of the user's current document:\n\n");
                    system.push_str(context);
                }

                let mut messages = vec![ChatMessage::system(system)];
                messages.extend(normalize_history(history));
                messages.push(ChatMessage::user(message.clone()));
                messages
            }
        }
    }
}

/// Keep the recent user/assistant turns in strict alternation, starting with a user turn
///
/// System messages are dropped. An out-of-place user turn restarts the
/// sequence; an out-of-place assistant turn is skipped.
#[must_use]
pub fn normalize_history(history: &[ChatMessage]) -> Vec<ChatMessage> {
    let recent = &history[history.len().saturating_sub(MAX_HISTORY_TURNS)..];

    let mut valid: Vec<ChatMessage> = Vec::new();
    let mut expected = ChatRole::User;

    for message in recent.iter().filter(|m| m.role != ChatRole::System) {
        if message.role == expected {
            valid.push(message.clone());
            expected = match expected {
                ChatRole::User => ChatRole::Assistant,
                _ => ChatRole::User,
            };
        } else if message.role == ChatRole::User {
            valid = vec![message.clone()];
            expected = ChatRole::Assistant;
        }
    }

    valid
}
