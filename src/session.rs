//! Conversation graph manager: owns the conversation set (mains plus
//! detours), the active cursor, per-conversation pending input, and the
//! in-memory credential, and drives completion requests.
//!
//! All mutation is addressed by stable ids, so in-flight streams in
//! different conversations cannot corrupt each other. A send is split into
//! sync transitions (`begin_send` / `apply_fragment` / `complete_send` /
//! `fail_send`); `drive_exchange` sequences them against a backend through
//! the [`SessionAccess`] seam, and `run_send` is the owned-session shorthand.

use crate::api::{
    self, ApiMessage, CompletionBackend, CompletionBody, CompletionRequest,
};
use crate::types::{BranchKind, ContextSeed, Conversation, Message, RequestSettings, Role};
use futures::StreamExt;
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_TITLE: &str = "New Chat";

/// How much of a selection survives into a detour title.
const TITLE_PREVIEW_CHARS: usize = 25;

/// How many trailing parent messages a branch replays.
const BRANCH_CONTEXT_WINDOW: usize = 4;

/// Extra length a generated title needs before it displaces a non-default one.
const TITLE_LENGTH_MARGIN: usize = 3;

const SEPARATOR_PREVIOUS: &str = "--- Previous Context ---";
const SEPARATOR_LOOKUP: &str = "--- Dictionary Lookup ---";
const SEPARATOR_EXPLORE: &str = "--- Continuing Conversation ---";

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SendError {
    #[error("no such conversation")]
    UnknownConversation,
    #[error("nothing to send")]
    EmptyInput,
    #[error("Please enter your API key first")]
    MissingCredential,
    #[error("a response is already streaming in this conversation")]
    StreamInFlight,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum CloseError {
    #[error("no such conversation")]
    UnknownConversation,
    #[error("a main conversation cannot be closed")]
    MainConversation,
}

/// Result of `branch`: the new detour and whether it should auto-send.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BranchOutcome {
    pub conversation_id: u64,
    pub auto_send: bool,
}

/// State handed back by `begin_send` for the caller to drive the stream.
pub struct PendingSend {
    pub conversation_id: u64,
    /// Id of the streaming placeholder message fragments append to.
    pub message_id: u64,
    pub request: CompletionRequest,
    pub user_text: String,
    pub is_main: bool,
}

// No Debug derive: the credential must never end up in logs.
#[derive(Clone, PartialEq)]
pub struct ChatSession {
    conversations: Vec<Conversation>,
    active_id: u64,
    inputs: HashMap<u64, String>,
    credential: Option<String>,
    pub settings: RequestSettings,
    next_id: u64,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    /// A session starts with one main conversation, active but hidden until
    /// it has produced enough content to deserve a title.
    pub fn new() -> Self {
        let mut session = Self {
            conversations: Vec::new(),
            active_id: 0,
            inputs: HashMap::new(),
            credential: None,
            settings: RequestSettings::default(),
            next_id: 1,
        };
        session.new_chat();
        session
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ---------------
    // Accessors
    // ---------------

    pub fn active_id(&self) -> u64 {
        self.active_id
    }

    pub fn set_active(&mut self, id: u64) {
        if self.conversations.iter().any(|c| c.id == id) {
            self.active_id = id;
        }
    }

    pub fn active(&self) -> &Conversation {
        self.conversation(self.active_id)
            .expect("active id always points at a live conversation")
    }

    pub fn conversation(&self, id: u64) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    fn conversation_mut(&mut self, id: u64) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Conversations listed in the sidebar.
    pub fn visible_conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.iter().filter(|c| c.visible)
    }

    pub fn input(&self, id: u64) -> &str {
        self.inputs.get(&id).map(String::as_str).unwrap_or("")
    }

    pub fn set_input(&mut self, id: u64, text: impl Into<String>) {
        self.inputs.insert(id, text.into());
    }

    pub fn set_credential(&mut self, credential: impl Into<String>) {
        let credential = credential.into();
        self.credential = if credential.trim().is_empty() {
            None
        } else {
            Some(credential.trim().to_string())
        };
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    // ---------------
    // Conversation lifecycle
    // ---------------

    pub fn new_chat(&mut self) -> u64 {
        let id = self.next_id();
        self.conversations.push(Conversation {
            id,
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            is_main: true,
            parent_id: None,
            visible: false,
        });
        self.inputs.insert(id, String::new());
        self.active_id = id;
        id
    }

    /// Branch a detour off the active conversation, seeded from the selected
    /// text. Empty selections are a no-op. Lookup detours want to auto-send
    /// their synthesized question, but only when a credential is present;
    /// otherwise the question stays in the input box for the user.
    pub fn branch(&mut self, kind: BranchKind, selection: &str) -> Option<BranchOutcome> {
        let term = selection.trim();
        if term.is_empty() {
            return None;
        }

        let parent_id = self.active_id;
        let mut replayed: Vec<Message> = self
            .active()
            .messages
            .iter()
            .filter(|m| !m.is_context)
            .rev()
            .take(BRANCH_CONTEXT_WINDOW)
            .cloned()
            .collect();
        replayed.reverse();

        let seed = ContextSeed::new(kind, term);
        let mut messages = Vec::with_capacity(replayed.len() + 3);
        let context_id = self.next_id();
        messages.push(Message::context(context_id, &seed));
        let sep_id = self.next_id();
        messages.push(Message::separator(sep_id, SEPARATOR_PREVIOUS));
        for mut msg in replayed {
            // Replays are snapshots: fresh id, never streaming. Separator
            // flags survive so a re-branched detour's markers stay out of
            // payloads.
            msg.id = self.next_id();
            msg.is_streaming = false;
            messages.push(msg);
        }
        let closing_label = match kind {
            BranchKind::Lookup => SEPARATOR_LOOKUP,
            BranchKind::Explore => SEPARATOR_EXPLORE,
        };
        let sep_id = self.next_id();
        messages.push(Message::separator(sep_id, closing_label));

        let id = self.next_id();
        self.conversations.push(Conversation {
            id,
            title: branch_title(kind, term),
            messages,
            is_main: false,
            parent_id: Some(parent_id),
            visible: true,
        });

        let prefill = match kind {
            BranchKind::Lookup => format!("What does \"{term}\" mean?"),
            BranchKind::Explore => format!("\"{term}\""),
        };
        self.inputs.insert(id, prefill);
        self.active_id = id;

        Some(BranchOutcome {
            conversation_id: id,
            auto_send: kind == BranchKind::Lookup && self.has_credential(),
        })
    }

    /// Close a detour. Re-points the active cursor at the parent (or the
    /// first main if the parent is already gone) and drops the pending
    /// input. Mains cannot be closed.
    pub fn close_conversation(&mut self, id: u64) -> Result<(), CloseError> {
        let conv = self
            .conversation(id)
            .ok_or(CloseError::UnknownConversation)?;
        if conv.is_main {
            return Err(CloseError::MainConversation);
        }
        let parent_id = conv.parent_id;

        self.conversations.retain(|c| c.id != id);
        self.inputs.remove(&id);

        if self.active_id == id {
            let fallback = parent_id
                .filter(|pid| self.conversations.iter().any(|c| c.id == *pid))
                .or_else(|| self.conversations.iter().find(|c| c.is_main).map(|c| c.id));
            if let Some(next) = fallback {
                self.active_id = next;
            }
        }
        Ok(())
    }

    /// Empty the active conversation. Detours keep their context markers so
    /// the branch seed survives the reset.
    pub fn clear_active(&mut self) {
        let id = self.active_id;
        if let Some(conv) = self.conversation_mut(id) {
            if conv.is_main {
                conv.messages.clear();
            } else {
                conv.messages.retain(|m| m.is_context);
            }
        }
    }

    /// Switch the active cursor to the parent conversation; no-op for mains.
    pub fn go_to_parent(&mut self) {
        let parent_id = self.active().parent_id;
        if let Some(parent_id) = parent_id
            && self.conversations.iter().any(|c| c.id == parent_id)
        {
            self.active_id = parent_id;
        }
    }

    // ---------------
    // Send pipeline
    // ---------------

    /// Validate and stage a send: appends the user message and a streaming
    /// placeholder, clears the pending input, and returns the request for
    /// the caller to stream. On error nothing is mutated.
    pub fn begin_send(&mut self, conversation_id: u64) -> Result<PendingSend, SendError> {
        let Some(credential) = self.credential.clone() else {
            return Err(SendError::MissingCredential);
        };
        let conv = self
            .conversation(conversation_id)
            .ok_or(SendError::UnknownConversation)?;

        let text = self.input(conversation_id).trim().to_string();
        if text.is_empty() {
            return Err(SendError::EmptyInput);
        }
        if conv.has_stream_in_flight() {
            return Err(SendError::StreamInFlight);
        }

        let seed = conv.context_seed();
        let kind = if conv.is_main { None } else { seed.as_ref().map(ContextSeed::kind) };
        let settings = match &seed {
            Some(seed) => seed.overrides().apply(&self.settings),
            None => self.settings.clone(),
        };

        let mut payload = Vec::with_capacity(conv.messages.len() + 2);
        payload.push(ApiMessage {
            role: Role::System,
            content: api::system_prompt(kind).to_string(),
        });
        payload.extend(conv.messages.iter().filter(|m| m.is_payload()).map(|m| {
            ApiMessage {
                role: m.role,
                content: m.content.clone(),
            }
        }));
        payload.push(ApiMessage {
            role: Role::User,
            content: text.clone(),
        });
        let is_main = conv.is_main;

        let user_id = self.next_id();
        let placeholder_id = self.next_id();
        let conv = self
            .conversation_mut(conversation_id)
            .ok_or(SendError::UnknownConversation)?;
        conv.messages.push(Message::user(user_id, text.clone()));
        conv.messages.push(Message::streaming_placeholder(placeholder_id));
        self.inputs.insert(conversation_id, String::new());

        Ok(PendingSend {
            conversation_id,
            message_id: placeholder_id,
            request: CompletionRequest {
                credential,
                body: CompletionBody::new(&settings, payload, true),
            },
            user_text: text,
            is_main,
        })
    }

    /// Append a streamed fragment to its placeholder. Returns false when the
    /// conversation or message no longer exists, which tells the drive loop
    /// to abort (the close-during-stream case).
    pub fn apply_fragment(&mut self, conversation_id: u64, message_id: u64, piece: &str) -> bool {
        match self.conversation_mut(conversation_id) {
            Some(conv) => match conv.messages.iter_mut().find(|m| m.id == message_id) {
                Some(msg) => {
                    msg.content.push_str(piece);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Terminal stream marker observed; the placeholder is a finished
    /// assistant message now.
    pub fn complete_send(&mut self, conversation_id: u64, message_id: u64) {
        if let Some(conv) = self.conversation_mut(conversation_id)
            && let Some(msg) = conv.messages.iter_mut().find(|m| m.id == message_id)
        {
            msg.is_streaming = false;
        }
    }

    /// Replace the placeholder with a human-readable failure description.
    pub fn fail_send(&mut self, conversation_id: u64, message_id: u64, error: &str) {
        if let Some(conv) = self.conversation_mut(conversation_id)
            && let Some(msg) = conv.messages.iter_mut().find(|m| m.id == message_id)
        {
            msg.content = format!("Sorry, I encountered an error: {error}");
            msg.is_streaming = false;
        }
    }

    /// Drive a full exchange against a backend: stage the send, stream
    /// fragments into the placeholder, then refine the title for main
    /// conversations. A stream failure lands in the placeholder; it never
    /// propagates past this send.
    pub async fn run_send(
        &mut self,
        conversation_id: u64,
        backend: &dyn CompletionBackend,
    ) -> Result<(), SendError> {
        let pending = self.begin_send(conversation_id)?;
        drive_exchange(&mut *self, pending, backend).await;
        Ok(())
    }

    /// Branch and, for lookup detours with a credential, immediately issue
    /// the synthesized question.
    pub async fn branch_and_send(
        &mut self,
        kind: BranchKind,
        selection: &str,
        backend: &dyn CompletionBackend,
    ) -> Option<u64> {
        let outcome = self.branch(kind, selection)?;
        if outcome.auto_send
            && let Err(err) = self.run_send(outcome.conversation_id, backend).await
        {
            tracing::warn!("lookup auto-send failed: {err}");
        }
        Some(outcome.conversation_id)
    }

    /// Stage a title-refinement request after a completed main exchange.
    /// Completing a first exchange makes the conversation visible whether or
    /// not a better title is ultimately adopted, so the flip happens here.
    pub fn title_refresh_request(
        &mut self,
        conversation_id: u64,
        message_id: u64,
        user_text: &str,
    ) -> Option<CompletionRequest> {
        let credential = self.credential.clone()?;
        let conv = self.conversation_mut(conversation_id)?;
        conv.visible = true;
        let reply = conv
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.content.clone())?;
        Some(api::title_request(&credential, user_text, &reply))
    }

    /// Adopt a generated title if it beats the current one per
    /// [`is_better_title`].
    pub fn adopt_title(&mut self, conversation_id: u64, raw: &str) {
        let candidate = sanitize_title(raw);
        if candidate.is_empty() {
            return;
        }
        if let Some(conv) = self.conversation_mut(conversation_id)
            && is_better_title(&conv.title, &candidate)
        {
            conv.title = candidate;
        }
    }
}

/// Lets the exchange drive loop borrow its session for exactly one sync
/// transition at a time. `run_send` owns the session outright; a UI event
/// loop holds it behind a lock that must not stay held across an await.
pub trait SessionAccess {
    fn with(&mut self, op: &mut dyn FnMut(&mut ChatSession));
}

impl SessionAccess for &mut ChatSession {
    fn with(&mut self, op: &mut dyn FnMut(&mut ChatSession)) {
        op(self);
    }
}

/// The sequencing behind every staged send: stream fragments into the
/// placeholder, finish or fail it, then refine the title for mains. A
/// stream failure lands in the placeholder; it never propagates past the
/// exchange. Title failures are swallowed; the exchange itself already
/// succeeded.
pub async fn drive_exchange<A: SessionAccess>(
    mut session: A,
    pending: PendingSend,
    backend: &dyn CompletionBackend,
) {
    let PendingSend {
        conversation_id,
        message_id,
        request,
        user_text,
        is_main,
    } = pending;

    match backend.stream_completion(request).await {
        Ok(mut fragments) => {
            while let Some(item) = fragments.next().await {
                match item {
                    Ok(piece) => {
                        let mut alive = false;
                        session.with(&mut |s| {
                            alive = s.apply_fragment(conversation_id, message_id, &piece);
                        });
                        if !alive {
                            return;
                        }
                    }
                    Err(err) => {
                        session.with(&mut |s| {
                            s.fail_send(conversation_id, message_id, &err.to_string());
                        });
                        return;
                    }
                }
            }
            session.with(&mut |s| s.complete_send(conversation_id, message_id));

            if is_main {
                let mut request = None;
                session.with(&mut |s| {
                    request = s.title_refresh_request(conversation_id, message_id, &user_text);
                });
                if let Some(request) = request {
                    match backend.completion(request).await {
                        Ok(raw) => session.with(&mut |s| s.adopt_title(conversation_id, &raw)),
                        Err(err) => tracing::debug!("title generation failed: {err}"),
                    }
                }
            }
        }
        Err(err) => {
            session.with(&mut |s| s.fail_send(conversation_id, message_id, &err.to_string()));
        }
    }
}

/// Quoted, bounded-preview detour title.
fn branch_title(kind: BranchKind, term: &str) -> String {
    let label = match kind {
        BranchKind::Lookup => "Lookup",
        BranchKind::Explore => "Explore",
    };
    let mut preview: String = term.chars().take(TITLE_PREVIEW_CHARS).collect();
    if term.chars().count() > TITLE_PREVIEW_CHARS {
        preview.push_str("...");
    }
    format!("{label}: \"{preview}\"")
}

fn sanitize_title(raw: &str) -> String {
    raw.trim().replace(['"', '\''], "")
}

/// Heuristic "is this title better": the placeholder always loses; otherwise
/// the candidate must be meaningfully longer or gain a word-boundary space.
/// Length-based, not semantic.
pub fn is_better_title(current: &str, candidate: &str) -> bool {
    if current == DEFAULT_TITLE {
        return true;
    }
    if candidate == DEFAULT_TITLE {
        return false;
    }
    candidate.chars().count() > current.chars().count() + TITLE_LENGTH_MARGIN
        || (candidate.contains(' ') && !current.contains(' '))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_titles_truncate_long_selections() {
        let t = branch_title(BranchKind::Lookup, "short");
        assert_eq!(t, "Lookup: \"short\"");

        let long = "a very long selection that keeps going and going";
        let t = branch_title(BranchKind::Explore, long);
        assert!(t.starts_with("Explore: \""));
        assert!(t.ends_with("...\""));
        assert!(t.len() < long.len() + 12);
    }

    #[test]
    fn title_heuristic_always_replaces_the_placeholder() {
        assert!(is_better_title(DEFAULT_TITLE, "x"));
        assert!(is_better_title(DEFAULT_TITLE, "Rust Borrow Checker"));
    }

    #[test]
    fn title_heuristic_wants_meaningful_improvement() {
        assert!(!is_better_title("Rust lifetimes", DEFAULT_TITLE));
        assert!(!is_better_title("Rust lifetimes", "Rust lifetime"));
        assert!(is_better_title("Rust", "Rust and lifetimes"));
        // Gaining a space counts as more descriptive.
        assert!(is_better_title("Lifetimes", "Rust tips"));
    }

    #[test]
    fn branch_seeds_context_window_and_separators() {
        let mut session = ChatSession::new();
        let main_id = session.active_id();
        // Six displayed messages; only the last four may be replayed.
        if let Some(conv) = session.conversations.iter_mut().find(|c| c.id == main_id) {
            for i in 0..6 {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                conv.messages.push(Message {
                    id: 100 + i,
                    role,
                    content: format!("m{i}"),
                    is_streaming: false,
                    is_context: false,
                    is_context_separator: false,
                });
            }
        }

        let outcome = session.branch(BranchKind::Explore, "pick this").unwrap();
        let detour = session.conversation(outcome.conversation_id).unwrap();

        assert!(!detour.is_main);
        assert_eq!(detour.parent_id, Some(main_id));
        assert!(detour.visible);
        assert_eq!(session.active_id(), outcome.conversation_id);

        // Layout: context, separator, four replayed, separator.
        assert_eq!(detour.messages.len(), 7);
        assert!(detour.messages[0].is_context);
        assert_eq!(detour.messages[1].content, SEPARATOR_PREVIOUS);
        let replayed: Vec<&str> = detour.messages[2..6]
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(replayed, vec!["m2", "m3", "m4", "m5"]);
        assert_eq!(detour.messages[6].content, SEPARATOR_EXPLORE);

        // Explore pre-fills the quoted selection and never auto-sends.
        assert!(!outcome.auto_send);
        assert_eq!(session.input(outcome.conversation_id), "\"pick this\"");
    }

    #[test]
    fn lookup_without_credential_keeps_the_question_in_the_input() {
        let mut session = ChatSession::new();
        let outcome = session.branch(BranchKind::Lookup, "monad").unwrap();
        assert!(!outcome.auto_send);
        assert_eq!(
            session.input(outcome.conversation_id),
            "What does \"monad\" mean?"
        );
    }

    #[test]
    fn clear_keeps_context_markers_in_detours_only() {
        let mut session = ChatSession::new();
        session.set_credential("sk-test");
        let main_id = session.active_id();
        session.set_input(main_id, "hello");
        let pending = session.begin_send(main_id).unwrap();
        session.apply_fragment(main_id, pending.message_id, "world");
        session.complete_send(main_id, pending.message_id);

        let outcome = session.branch(BranchKind::Explore, "world").unwrap();
        session.clear_active();
        let detour = session.conversation(outcome.conversation_id).unwrap();
        assert_eq!(detour.messages.len(), 1);
        assert!(detour.messages[0].is_context);

        session.set_active(main_id);
        session.clear_active();
        assert!(session.active().messages.is_empty());
    }

    #[test]
    fn go_to_parent_is_a_noop_for_mains() {
        let mut session = ChatSession::new();
        let main_id = session.active_id();
        session.go_to_parent();
        assert_eq!(session.active_id(), main_id);

        session.branch(BranchKind::Explore, "term").unwrap();
        session.go_to_parent();
        assert_eq!(session.active_id(), main_id);
    }

    #[test]
    fn payload_excludes_context_and_separator_messages() {
        let mut session = ChatSession::new();
        session.set_credential("sk-test");
        session.branch(BranchKind::Lookup, "ownership").unwrap();
        let id = session.active_id();
        let pending = session.begin_send(id).unwrap();

        let contents: Vec<&str> = pending
            .request
            .body
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert!(!contents.iter().any(|c| c.starts_with("---")));
        assert!(!contents.iter().any(|c| c.contains("\"type\"")));
        // System prompt first, synthesized question last.
        assert_eq!(pending.request.body.messages[0].role, Role::System);
        assert_eq!(contents.last(), Some(&"What does \"ownership\" mean?"));
        // Lookup overrides bias the request parameters.
        assert_eq!(pending.request.body.model, "gpt-4o-mini");
        assert_eq!(pending.request.body.max_tokens, 600);
    }

    #[test]
    fn overlapping_sends_in_one_conversation_are_rejected() {
        let mut session = ChatSession::new();
        session.set_credential("sk-test");
        let id = session.active_id();
        session.set_input(id, "first");
        let _pending = session.begin_send(id).unwrap();
        session.set_input(id, "second");
        assert_eq!(session.begin_send(id).err(), Some(SendError::StreamInFlight));
    }
}
