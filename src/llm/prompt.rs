//! Structured prompts and token-budget truncation.
//!
//! A prompt is kept as separate segments (system, context documents,
//! conversation turns, current query) so truncation can drop whole pieces.
//! System and query are never dropped. Conversation is fitted first,
//! newest turn first; context documents get whatever budget is left, most
//! relevant first. Both passes stop at the first segment that doesn't fit.

use crate::models::Role;

const CHARS_PER_TOKEN: usize = 4;
const GPT5_INPUT_TOKEN_LIMIT: usize = 7_000;
const DEFAULT_INPUT_TOKEN_LIMIT: usize = 100_000;

/// ceil(chars / 4)
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Gpt5,
    Generic,
}

impl ModelFamily {
    /// Namespaced ids (`openai/gpt-5-mini`) are matched on the last segment.
    pub fn of(model: &str) -> Self {
        let name = model.rsplit('/').next().unwrap_or(model).to_ascii_lowercase();
        if name.starts_with("gpt-5") {
            ModelFamily::Gpt5
        } else {
            ModelFamily::Generic
        }
    }

    pub fn input_token_limit(self) -> usize {
        match self {
            ModelFamily::Gpt5 => GPT5_INPUT_TOKEN_LIMIT,
            ModelFamily::Generic => DEFAULT_INPUT_TOKEN_LIMIT,
        }
    }

    pub fn truncation_notice(self) -> &'static str {
        match self {
            ModelFamily::Gpt5 => "[Context truncated due to GPT-5 8K input limit]\n\n",
            ModelFamily::Generic => "[Context truncated due to model input limit]\n\n",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextSegment {
    pub content: String,
    pub tokens: usize,
}

impl TextSegment {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let tokens = estimate_tokens(&content);
        Self { content, tokens }
    }

    /// Override the estimate (e.g. with a tokenizer count).
    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = tokens;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextDocumentSegment {
    /// 1-based `[CTX n]` marker.
    pub index: usize,
    pub url: String,
    pub body: TextSegment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurnSegment {
    pub role: Role,
    pub body: TextSegment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredPrompt {
    pub system: TextSegment,
    /// Most relevant first.
    pub context: Vec<ContextDocumentSegment>,
    /// Chronological.
    pub conversation: Vec<ConversationTurnSegment>,
    pub query: TextSegment,
}

impl StructuredPrompt {
    pub fn new(system: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            system: TextSegment::new(system),
            context: Vec::new(),
            conversation: Vec::new(),
            query: TextSegment::new(query),
        }
    }

    pub fn push_context(&mut self, url: impl Into<String>, body: TextSegment) {
        let index = self.context.len() + 1;
        self.context.push(ContextDocumentSegment {
            index,
            url: url.into(),
            body,
        });
    }

    pub fn push_turn(&mut self, role: Role, body: TextSegment) {
        self.conversation.push(ConversationTurnSegment { role, body });
    }

    pub fn total_tokens(&self) -> usize {
        self.system.tokens
            + self.query.tokens
            + self.context.iter().map(|c| c.body.tokens).sum::<usize>()
            + self.conversation.iter().map(|t| t.body.tokens).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TruncatedPrompt {
    pub prompt: StructuredPrompt,
    pub truncated: bool,
    pub family: ModelFamily,
}

impl TruncatedPrompt {
    /// Segments joined by blank lines: system, context, conversation, query.
    /// The family notice leads only when something was dropped.
    pub fn render(&self) -> String {
        let p = &self.prompt;
        let mut parts: Vec<String> = Vec::with_capacity(2 + p.context.len() + p.conversation.len());
        parts.push(p.system.content.clone());
        for doc in &p.context {
            parts.push(format!("[CTX {}] {}\n{}", doc.index, doc.url, doc.body.content));
        }
        for turn in &p.conversation {
            parts.push(match turn.role {
                Role::User => turn.body.content.clone(),
                Role::Assistant => format!("Assistant: {}", turn.body.content),
            });
        }
        parts.push(p.query.content.clone());

        let body = parts.join("\n\n");
        if self.truncated {
            format!("{}{body}", self.family.truncation_notice())
        } else {
            body
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PromptTruncator {
    budget: usize,
    family: ModelFamily,
}

impl PromptTruncator {
    pub fn new(budget: usize, family: ModelFamily) -> Self {
        Self { budget, family }
    }

    pub fn for_model(model: &str) -> Self {
        let family = ModelFamily::of(model);
        Self::new(family.input_token_limit(), family)
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn truncate(&self, prompt: &StructuredPrompt) -> TruncatedPrompt {
        let reserved = prompt.system.tokens + prompt.query.tokens;
        if reserved >= self.budget {
            let dropped_any = !prompt.context.is_empty() || !prompt.conversation.is_empty();
            return TruncatedPrompt {
                prompt: StructuredPrompt {
                    system: prompt.system.clone(),
                    context: Vec::new(),
                    conversation: Vec::new(),
                    query: prompt.query.clone(),
                },
                truncated: dropped_any || reserved > self.budget,
                family: self.family,
            };
        }

        let mut remaining = self.budget - reserved;

        let mut turns: Vec<ConversationTurnSegment> = Vec::new();
        for turn in prompt.conversation.iter().rev() {
            if turn.body.tokens > remaining {
                break;
            }
            remaining -= turn.body.tokens;
            turns.push(turn.clone());
        }
        turns.reverse();

        let mut context: Vec<ContextDocumentSegment> = Vec::new();
        for doc in &prompt.context {
            if doc.body.tokens > remaining {
                break;
            }
            remaining -= doc.body.tokens;
            context.push(ContextDocumentSegment {
                index: context.len() + 1,
                url: doc.url.clone(),
                body: doc.body.clone(),
            });
        }

        let truncated = turns.len() < prompt.conversation.len() || context.len() < prompt.context.len();
        TruncatedPrompt {
            prompt: StructuredPrompt {
                system: prompt.system.clone(),
                context,
                conversation: turns,
                query: prompt.query.clone(),
            },
            truncated,
            family: self.family,
        }
    }
}
