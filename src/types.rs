use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single entry in a conversation. Assistant messages under active
/// streaming grow their `content` incrementally; context and separator
/// messages are bookkeeping for branched conversations and are never sent
/// to the completion API.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub is_streaming: bool,
    pub is_context: bool,
    pub is_context_separator: bool,
}

impl Message {
    pub fn user(id: u64, content: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::User,
            content: content.into(),
            is_streaming: false,
            is_context: false,
            is_context_separator: false,
        }
    }

    /// Empty assistant message appended before a streaming request starts;
    /// fragments are appended to it as they arrive.
    pub fn streaming_placeholder(id: u64) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: String::new(),
            is_streaming: true,
            is_context: false,
            is_context_separator: false,
        }
    }

    /// Branch metadata carrier. The seed travels as JSON in `content` so the
    /// message keeps the same shape as everything else in the list.
    pub fn context(id: u64, seed: &ContextSeed) -> Self {
        let content = serde_json::to_string(seed).unwrap_or_default();
        Self {
            id,
            role: Role::System,
            content,
            is_streaming: false,
            is_context: true,
            is_context_separator: false,
        }
    }

    /// Presentational marker between replayed parent history and new branch
    /// content. Excluded from every API payload.
    pub fn separator(id: u64, label: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: label.into(),
            is_streaming: false,
            is_context: false,
            is_context_separator: true,
        }
    }

    /// True for messages that belong in an API payload.
    pub fn is_payload(&self) -> bool {
        !self.is_context && !self.is_context_separator
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: u64,
    pub title: String,
    pub messages: Vec<Message>,
    pub is_main: bool,
    /// Back-reference to the conversation this was branched from; `Some`
    /// iff `is_main` is false. Navigation only, never lifetime management.
    pub parent_id: Option<u64>,
    pub visible: bool,
}

impl Conversation {
    pub fn context_seed(&self) -> Option<ContextSeed> {
        self.messages
            .iter()
            .find(|m| m.is_context)
            .and_then(|m| serde_json::from_str(&m.content).ok())
    }

    pub fn has_stream_in_flight(&self) -> bool {
        self.messages.iter().any(|m| m.is_streaming)
    }

    /// Messages a user actually reads: everything except context carriers
    /// and separators.
    pub fn displayed_message_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_payload()).count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchKind {
    /// Concise reference answer about the selected term; auto-sends.
    Lookup,
    /// Open-ended continuation seeded with the quoted selection.
    Explore,
}

/// Branch metadata embedded in a conversation's context message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContextSeed {
    Lookup {
        term: String,
        #[serde(default)]
        overrides: SettingsOverride,
    },
    Explore {
        term: String,
        #[serde(default)]
        overrides: SettingsOverride,
    },
}

impl ContextSeed {
    pub fn new(kind: BranchKind, term: impl Into<String>) -> Self {
        match kind {
            BranchKind::Lookup => ContextSeed::Lookup {
                term: term.into(),
                overrides: SettingsOverride::for_lookup(),
            },
            BranchKind::Explore => ContextSeed::Explore {
                term: term.into(),
                overrides: SettingsOverride::for_explore(),
            },
        }
    }

    pub fn kind(&self) -> BranchKind {
        match self {
            ContextSeed::Lookup { .. } => BranchKind::Lookup,
            ContextSeed::Explore { .. } => BranchKind::Explore,
        }
    }

    pub fn term(&self) -> &str {
        match self {
            ContextSeed::Lookup { term, .. } | ContextSeed::Explore { term, .. } => term,
        }
    }

    pub fn overrides(&self) -> &SettingsOverride {
        match self {
            ContextSeed::Lookup { overrides, .. } | ContextSeed::Explore { overrides, .. } => {
                overrides
            }
        }
    }
}

/// Default generation parameters for completion requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            max_tokens: 1500,
            temperature: 0.7,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

/// Per-branch partial override of [`RequestSettings`]. Unset fields fall
/// through to the session defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
}

impl SettingsOverride {
    /// Lookups want a cheap, fast, deterministic answer.
    pub fn for_lookup() -> Self {
        Self {
            model: Some("gpt-4o-mini".to_string()),
            max_tokens: Some(600),
            temperature: Some(0.3),
            ..Self::default()
        }
    }

    /// Explorations get room to be expansive.
    pub fn for_explore() -> Self {
        Self {
            max_tokens: Some(3000),
            temperature: Some(0.9),
            ..Self::default()
        }
    }

    pub fn apply(&self, base: &RequestSettings) -> RequestSettings {
        RequestSettings {
            model: self.model.clone().unwrap_or_else(|| base.model.clone()),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            temperature: self.temperature.unwrap_or(base.temperature),
            top_p: self.top_p.unwrap_or(base.top_p),
            presence_penalty: self.presence_penalty.unwrap_or(base.presence_penalty),
            frequency_penalty: self.frequency_penalty.unwrap_or(base.frequency_penalty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_seed_round_trips_through_message_content() {
        let seed = ContextSeed::new(BranchKind::Lookup, "borrow checker");
        let msg = Message::context(7, &seed);
        assert!(msg.is_context);
        assert!(!msg.is_context_separator);
        let parsed: ContextSeed = serde_json::from_str(&msg.content).unwrap();
        assert_eq!(parsed, seed);
        assert_eq!(parsed.term(), "borrow checker");
    }

    #[test]
    fn context_seed_serializes_with_lowercase_tag() {
        let seed = ContextSeed::new(BranchKind::Explore, "lifetimes");
        let json = serde_json::to_string(&seed).unwrap();
        assert!(json.contains(r#""type":"explore""#));
        assert!(json.contains(r#""term":"lifetimes""#));
    }

    #[test]
    fn overrides_fall_through_to_base_settings() {
        let base = RequestSettings::default();
        let resolved = SettingsOverride::for_lookup().apply(&base);
        assert_eq!(resolved.model, "gpt-4o-mini");
        assert_eq!(resolved.max_tokens, 600);
        assert_eq!(resolved.top_p, base.top_p);
        assert_eq!(resolved.presence_penalty, base.presence_penalty);

        let resolved = SettingsOverride::for_explore().apply(&base);
        assert_eq!(resolved.model, base.model);
        assert_eq!(resolved.max_tokens, 3000);
    }

    #[test]
    fn a_message_is_never_both_context_and_separator() {
        let seed = ContextSeed::new(BranchKind::Explore, "x");
        for msg in [
            Message::user(1, "hi"),
            Message::streaming_placeholder(2),
            Message::context(3, &seed),
            Message::separator(4, "--- Previous Context ---"),
        ] {
            assert!(!(msg.is_context && msg.is_context_separator));
        }
    }
}
