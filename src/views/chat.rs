use crate::api::HttpBackend;
use crate::session::{ChatSession, SessionAccess, drive_exchange};
use crate::types::{BranchKind, Role};
use crate::views::markdown::MarkdownView;
use dioxus::events::Key;
use dioxus::prelude::*;

/// Grabs the signal write lock for one sync transition at a time; the lock
/// must never stay held across an await.
struct SignalAccess(Signal<ChatSession>);

impl SessionAccess for SignalAccess {
    fn with(&mut self, op: &mut dyn FnMut(&mut ChatSession)) {
        op(&mut self.0.write());
    }
}

/// Stage a send synchronously, then stream the response into the session in
/// a background task. All mutation is by id, so switching or closing
/// conversations mid-stream is safe; a closed conversation stops the loop.
fn drive_send(mut session: Signal<ChatSession>, conversation_id: u64) {
    let pending = match session.write().begin_send(conversation_id) {
        Ok(pending) => pending,
        Err(err) => {
            tracing::warn!("send rejected: {err}");
            return;
        }
    };

    spawn(async move {
        let backend = HttpBackend::from_env();
        drive_exchange(SignalAccess(session), pending, &backend).await;
    });
}

fn branch_from_selection(mut session: Signal<ChatSession>, kind: BranchKind, selection: &str) {
    let outcome = session.write().branch(kind, selection);
    if let Some(outcome) = outcome
        && outcome.auto_send
    {
        drive_send(session, outcome.conversation_id);
    }
}

#[component]
pub fn ChatView(session: Signal<ChatSession>) -> Element {
    let mut session = session;
    // Stand-in for the selection tooltip; the selection-to-coordinates
    // plumbing lives outside this crate.
    let mut selection = use_signal(String::new);

    let conversation = session.read().active().clone();
    let conversation_id = conversation.id;
    let input_text = session.read().input(conversation_id).to_string();
    let streaming = conversation.has_stream_in_flight();

    rsx! {
        div { class: "main-container",
            div { class: "chat-header",
                if !conversation.is_main {
                    button {
                        class: "action-btn", r#type: "button",
                        onclick: move |_| session.write().go_to_parent(),
                        "Back"
                    }
                }
                h1 { class: "chat-title", "{conversation.title}" }
                button {
                    class: "action-btn", r#type: "button",
                    onclick: move |_| session.write().clear_active(),
                    "Clear"
                }
            }

            div { class: "chat-list",
                for msg in conversation.messages.iter().filter(|m| !m.is_context) {
                    if msg.is_context_separator {
                        div { key: "{msg.id}", class: "context-separator", "{msg.content}" }
                    } else {
                        div {
                            key: "{msg.id}",
                            class: format_args!(
                                "message-row {}",
                                match msg.role {
                                    Role::Assistant => "assistant",
                                    _ => "user",
                                },
                            ),
                            if matches!(msg.role, Role::Assistant) {
                                if msg.is_streaming && msg.content.is_empty() {
                                    div { class: "shimmer-text", "Thinking…" }
                                } else {
                                    MarkdownView { content: msg.content.clone() }
                                }
                            } else {
                                p { class: "user-text", "{msg.content}" }
                            }
                        }
                    }
                }
            }

            div { class: "branch-bar",
                input {
                    r#type: "text",
                    placeholder: "Selected text…",
                    value: "{selection}",
                    oninput: move |ev| selection.set(ev.value()),
                }
                button {
                    class: "action-btn", r#type: "button",
                    onclick: move |_| {
                        let text = selection();
                        branch_from_selection(session, BranchKind::Lookup, &text);
                        selection.set(String::new());
                    },
                    "Look up"
                }
                button {
                    class: "action-btn", r#type: "button",
                    onclick: move |_| {
                        let text = selection();
                        branch_from_selection(session, BranchKind::Explore, &text);
                        selection.set(String::new());
                    },
                    "Explore"
                }
            }

            form { class: "composer",
                textarea {
                    rows: "2",
                    placeholder: "Send a message…",
                    value: "{input_text}",
                    oninput: move |ev| {
                        let id = session.read().active_id();
                        session.write().set_input(id, ev.value());
                    },
                    onkeydown: move |ev| {
                        if ev.key() == Key::Enter && !ev.modifiers().shift() {
                            ev.prevent_default();
                            let id = session.read().active_id();
                            drive_send(session, id);
                        }
                    },
                    autofocus: true,
                }
                button {
                    class: "btn btn-primary", r#type: "button",
                    disabled: streaming || input_text.trim().is_empty(),
                    onclick: move |_| {
                        let id = session.read().active_id();
                        drive_send(session, id);
                    },
                    "Send"
                }
            }
        }
    }
}
