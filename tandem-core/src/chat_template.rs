//! Role-driven prompt formatting.

use serde::{Deserialize, Serialize};

use crate::request::{Message, Role};

/// How a conversation is flattened into prompt text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatTemplate {
    /// Message contents joined by newlines, roles ignored.
    #[default]
    Raw,
    /// `<|im_start|>role ... <|im_end|>` turns, ending with an open assistant turn.
    ChatMl,
    /// `[INST] <<SYS>> ... <</SYS>> ... [/INST]` turns.
    Llama2,
}

impl ChatTemplate {
    /// Parse a template name as used in configuration.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "raw" => Some(ChatTemplate::Raw),
            "chatml" => Some(ChatTemplate::ChatMl),
            "llama2" => Some(ChatTemplate::Llama2),
            _ => None,
        }
    }

    pub fn render(&self, messages: &[Message]) -> String {
        match self {
            ChatTemplate::Raw => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            ChatTemplate::ChatMl => {
                let mut prompt = String::new();
                for m in messages {
                    prompt.push_str("<|im_start|>");
                    prompt.push_str(m.role.as_str());
                    prompt.push('\n');
                    prompt.push_str(&m.content);
                    prompt.push_str("<|im_end|>\n");
                }
                prompt.push_str("<|im_start|>assistant\n");
                prompt
            }
            ChatTemplate::Llama2 => render_llama2(messages),
        }
    }
}

fn render_llama2(messages: &[Message]) -> String {
    let mut prompt = String::new();
    let mut system: Option<&str> = None;

    for m in messages {
        match m.role {
            Role::System => system = Some(m.content.as_str()),
            Role::User => {
                prompt.push_str("[INST] ");
                // System prompt folds into the first user turn only
                if let Some(sys) = system.take() {
                    prompt.push_str("<<SYS>>\n");
                    prompt.push_str(sys);
                    prompt.push_str("\n<</SYS>>\n\n");
                }
                prompt.push_str(&m.content);
                prompt.push_str(" [/INST]");
            }
            Role::Assistant => {
                prompt.push(' ');
                prompt.push_str(&m.content);
                prompt.push_str(" </s>");
            }
        }
    }
    // System-only conversation
    if prompt.is_empty() {
        if let Some(sys) = system {
            prompt.push_str("[INST] <<SYS>>\n");
            prompt.push_str(sys);
            prompt.push_str("\n<</SYS>>\n\n [/INST]");
        }
    }
    prompt
}
