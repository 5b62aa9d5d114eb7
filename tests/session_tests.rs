//! Integration tests for the conversation graph manager, driven against a
//! scripted completion backend.

use async_trait::async_trait;
use detour::api::{ApiError, ApiMessage, CompletionBackend, CompletionRequest, FragmentStream};
use detour::session::{
    ChatSession, CloseError, DEFAULT_TITLE, SendError, SessionAccess, drive_exchange,
};
use detour::types::{BranchKind, Role};
use futures::stream::{self, StreamExt};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Mutex;

struct MockBackend {
    fragments: Vec<Result<String, ApiError>>,
    title: Result<String, ApiError>,
    /// Message lists of every streaming request this backend received.
    requests: Mutex<Vec<Vec<ApiMessage>>>,
}

impl MockBackend {
    fn streaming(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| Ok(s.to_string())).collect(),
            title: Err(ApiError::Status(500)),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing_mid_stream(err: ApiError) -> Self {
        Self {
            fragments: vec![Ok("partial".to_string()), Err(err)],
            title: Err(ApiError::Status(500)),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn with_title(mut self, title: &str) -> Self {
        self.title = Ok(title.to_string());
        self
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<FragmentStream, ApiError> {
        self.requests
            .lock()
            .unwrap()
            .push(request.body.messages.clone());
        Ok(stream::iter(self.fragments.clone()).boxed())
    }

    async fn completion(&self, _request: CompletionRequest) -> Result<String, ApiError> {
        self.title.clone()
    }
}

fn ready_session() -> ChatSession {
    let mut session = ChatSession::new();
    session.set_credential("sk-test");
    session
}

#[tokio::test]
async fn streamed_fragments_assemble_into_the_assistant_message() {
    let mut session = ready_session();
    let id = session.active_id();
    session.set_input(id, "Hi");

    let backend = MockBackend::streaming(&["Hel", "lo"]);
    session.run_send(id, &backend).await.unwrap();

    let conv = session.conversation(id).unwrap();
    assert_eq!(conv.messages.len(), 2);
    assert_eq!(conv.messages[0].role, Role::User);
    assert_eq!(conv.messages[0].content, "Hi");
    let reply = &conv.messages[1];
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.content, "Hello");
    assert!(!reply.is_streaming);
    // First completed exchange flips a main conversation visible even though
    // the title request failed.
    assert!(conv.visible);
    assert_eq!(conv.title, DEFAULT_TITLE);
}

#[tokio::test]
async fn sending_without_a_credential_changes_nothing() {
    let mut session = ChatSession::new();
    let id = session.active_id();
    session.set_input(id, "hello?");

    let backend = MockBackend::streaming(&["never"]);
    let err = session.run_send(id, &backend).await.unwrap_err();
    assert_eq!(err, SendError::MissingCredential);

    let conv = session.conversation(id).unwrap();
    assert!(conv.messages.is_empty());
    // The unsent input is preserved.
    assert_eq!(session.input(id), "hello?");
    assert!(backend.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn a_stream_failure_lands_in_the_placeholder() {
    let mut session = ready_session();
    let id = session.active_id();
    session.set_input(id, "Hi");

    let backend = MockBackend::failing_mid_stream(ApiError::RateLimited);
    session.run_send(id, &backend).await.unwrap();

    let reply = session.conversation(id).unwrap().messages.last().unwrap();
    assert!(!reply.is_streaming);
    assert!(reply.content.starts_with("Sorry, I encountered an error:"));
    assert!(reply.content.contains("Rate limit exceeded"));
}

#[test]
fn branching_with_an_empty_selection_is_a_noop() {
    let mut session = ready_session();
    let before_active = session.active_id();
    let before_count = session.conversations().len();

    assert!(session.branch(BranchKind::Explore, "").is_none());
    assert!(session.branch(BranchKind::Lookup, "   \n").is_none());

    assert_eq!(session.conversations().len(), before_count);
    assert_eq!(session.active_id(), before_active);
}

#[test]
fn closing_the_active_detour_reactivates_its_parent() {
    let mut session = ready_session();
    let main_id = session.active_id();

    let outcome = session.branch(BranchKind::Explore, "some phrase").unwrap();
    let detour_id = outcome.conversation_id;
    assert_eq!(session.active_id(), detour_id);
    let before_count = session.conversations().len();

    session.close_conversation(detour_id).unwrap();

    assert_eq!(session.active_id(), main_id);
    assert_eq!(session.conversations().len(), before_count - 1);
    assert!(session.conversation(detour_id).is_none());
    // Pending input for the closed detour is discarded.
    assert_eq!(session.input(detour_id), "");
}

#[test]
fn closing_a_main_conversation_is_rejected() {
    let mut session = ready_session();
    let main_id = session.active_id();
    let before_count = session.conversations().len();

    assert_eq!(
        session.close_conversation(main_id),
        Err(CloseError::MainConversation)
    );
    assert_eq!(session.conversations().len(), before_count);
    assert_eq!(session.active_id(), main_id);
}

#[tokio::test]
async fn lookup_branch_auto_sends_and_completes() {
    let mut session = ready_session();
    let main_id = session.active_id();
    let before_count = session.conversations().len();

    let backend = MockBackend::streaming(&["Gravity is ", "a force."]);
    let detour_id = session
        .branch_and_send(BranchKind::Lookup, "gravity", &backend)
        .await
        .unwrap();

    assert_eq!(session.conversations().len(), before_count + 1);
    let detour = session.conversation(detour_id).unwrap();
    assert!(detour.visible);
    assert_eq!(detour.parent_id, Some(main_id));

    let exchange: Vec<_> = detour.messages.iter().filter(|m| m.is_payload()).collect();
    // Two separators are seeded but excluded; the exchange itself is the
    // synthesized question plus the completed reply.
    assert_eq!(exchange.len(), 2);
    assert_eq!(exchange[0].content, "What does \"gravity\" mean?");
    assert_eq!(exchange[1].content, "Gravity is a force.");
    assert!(!exchange[1].is_streaming);

    // The payload that went over the wire holds no separators and no
    // context blob, and leads with the lookup system prompt.
    let requests = backend.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let payload = &requests[0];
    assert_eq!(payload[0].role, Role::System);
    assert!(payload[0].content.contains("dictionary"));
    assert!(!payload.iter().any(|m| m.content.starts_with("---")));
    assert!(!payload.iter().any(|m| m.content.contains("\"type\"")));
}

#[tokio::test]
async fn a_generated_title_replaces_the_placeholder_and_shows_the_chat() {
    let mut session = ready_session();
    let id = session.active_id();
    assert!(!session.active().visible);
    session.set_input(id, "Tell me about lifetimes");

    let backend = MockBackend::streaming(&["Lifetimes are regions."])
        .with_title("\"Rust Lifetimes Explained\"");
    session.run_send(id, &backend).await.unwrap();

    let conv = session.conversation(id).unwrap();
    // Quotes are stripped from the generated title before adoption.
    assert_eq!(conv.title, "Rust Lifetimes Explained");
    assert!(conv.visible);
}

#[tokio::test]
async fn detour_exchanges_do_not_touch_titles() {
    let mut session = ready_session();
    session.branch(BranchKind::Explore, "a topic").unwrap();
    let detour_id = session.active_id();
    let title_before = session.active().title.clone();
    session.set_input(detour_id, "go on");

    let backend = MockBackend::streaming(&["sure"]).with_title("Should Not Appear");
    session.run_send(detour_id, &backend).await.unwrap();

    assert_eq!(session.conversation(detour_id).unwrap().title, title_before);
}

#[tokio::test]
async fn concurrent_streams_in_different_conversations_stay_isolated() {
    let mut session = ready_session();
    let main_id = session.active_id();
    session.set_input(main_id, "first question");

    // Stage the main send but do not drive it yet: its placeholder stays
    // streaming while we work in a detour.
    let pending = session.begin_send(main_id).unwrap();

    let backend = MockBackend::streaming(&["detour ", "answer"]);
    let detour_id = session
        .branch_and_send(BranchKind::Lookup, "aside", &backend)
        .await
        .unwrap();

    // The detour finished; the main placeholder is untouched.
    let detour_reply = session
        .conversation(detour_id)
        .unwrap()
        .messages
        .last()
        .unwrap()
        .clone();
    assert_eq!(detour_reply.content, "detour answer");

    session.apply_fragment(main_id, pending.message_id, "first ");
    session.apply_fragment(main_id, pending.message_id, "answer");
    session.complete_send(main_id, pending.message_id);
    let main_reply = session
        .conversation(main_id)
        .unwrap()
        .messages
        .last()
        .unwrap()
        .clone();
    assert_eq!(main_reply.content, "first answer");
    assert!(!main_reply.is_streaming);
}

#[test]
fn rebranching_from_a_detour_keeps_separators_out_of_the_payload() {
    let mut session = ready_session();
    let main_id = session.active_id();
    session.set_input(main_id, "hello");
    let pending = session.begin_send(main_id).unwrap();
    session.apply_fragment(main_id, pending.message_id, "world");
    session.complete_send(main_id, pending.message_id);

    // The first detour's own separators fall inside the second detour's
    // replay window and must stay separators there.
    session.branch(BranchKind::Explore, "world").unwrap();
    let outcome = session.branch(BranchKind::Explore, "again").unwrap();

    let child = session.conversation(outcome.conversation_id).unwrap();
    let separators = child
        .messages
        .iter()
        .filter(|m| m.is_context_separator)
        .count();
    // Two of its own plus two replayed from the parent detour.
    assert_eq!(separators, 4);
    assert!(
        child
            .messages
            .iter()
            .filter(|m| m.content.starts_with("---"))
            .all(|m| m.is_context_separator)
    );

    session.set_input(outcome.conversation_id, "one more");
    let pending = session.begin_send(outcome.conversation_id).unwrap();
    let contents: Vec<&str> = pending
        .request
        .body
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert!(!contents.iter().any(|c| c.contains("---")));
    // System prompt plus the replayed exchange plus the new question.
    assert_eq!(contents.len(), 4);
    assert_eq!(contents.last(), Some(&"one more"));
}

/// Mimics a UI event loop that can only lock its session between awaits.
struct SharedAccess(Rc<RefCell<ChatSession>>);

impl SessionAccess for SharedAccess {
    fn with(&mut self, op: &mut dyn FnMut(&mut ChatSession)) {
        op(&mut self.0.borrow_mut());
    }
}

#[tokio::test]
async fn lock_per_transition_driving_matches_direct_driving() {
    let session = Rc::new(RefCell::new(ready_session()));
    let id = session.borrow().active_id();
    session.borrow_mut().set_input(id, "Hi");
    let pending = session.borrow_mut().begin_send(id).unwrap();

    let backend = MockBackend::streaming(&["Hel", "lo"]).with_title("Streaming Basics");
    drive_exchange(SharedAccess(Rc::clone(&session)), pending, &backend).await;

    let session = session.borrow();
    let conv = session.conversation(id).unwrap();
    let reply = conv.messages.last().unwrap();
    assert_eq!(reply.content, "Hello");
    assert!(!reply.is_streaming);
    assert_eq!(conv.title, "Streaming Basics");
    assert!(conv.visible);
}

#[test]
fn fragments_for_a_closed_conversation_are_dropped() {
    let mut session = ready_session();
    session.branch(BranchKind::Explore, "aside").unwrap();
    let detour_id = session.active_id();
    session.set_input(detour_id, "question");
    let pending = session.begin_send(detour_id).unwrap();

    session.close_conversation(detour_id).unwrap();

    // The drive loop keys off this false return to abort.
    assert!(!session.apply_fragment(detour_id, pending.message_id, "late"));
}
