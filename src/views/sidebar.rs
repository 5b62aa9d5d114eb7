use crate::session::ChatSession;
use dioxus::prelude::*;

#[component]
pub fn Sidebar(session: Signal<ChatSession>) -> Element {
    let mut session = session;
    let mut credential_draft = use_signal(String::new);

    let active_id = session.read().active_id();
    let has_credential = session.read().has_credential();
    let entries: Vec<(u64, String, bool, usize)> = session
        .read()
        .visible_conversations()
        .map(|c| (c.id, c.title.clone(), c.is_main, c.displayed_message_count()))
        .collect();

    rsx! {
        div { class: "sidebar",
            button {
                class: "btn", r#type: "button",
                onclick: move |_| {
                    session.write().new_chat();
                },
                "New chat"
            }

            if !has_credential {
                div { class: "credential-entry",
                    input {
                        r#type: "password",
                        placeholder: "sk-…",
                        value: "{credential_draft}",
                        oninput: move |ev| credential_draft.set(ev.value()),
                    }
                    button {
                        class: "btn", r#type: "button",
                        disabled: credential_draft().trim().is_empty(),
                        onclick: move |_| {
                            session.write().set_credential(credential_draft());
                            credential_draft.set(String::new());
                        },
                        "Save API key"
                    }
                }
            }

            div { class: "conversation-list",
                for (id, title, is_main, count) in entries {
                    div {
                        key: "{id}",
                        class: format_args!(
                            "conversation-entry {}",
                            if id == active_id { "active" } else { "" },
                        ),
                        onclick: move |_| session.write().set_active(id),
                        div { class: "conversation-label",
                            p { class: "conversation-title", "{title}" }
                            if count > 0 {
                                p { class: "conversation-count", "{count} messages" }
                            }
                        }
                        if !is_main {
                            button {
                                class: "action-btn", r#type: "button",
                                onclick: move |ev| {
                                    ev.stop_propagation();
                                    if let Err(err) = session.write().close_conversation(id) {
                                        tracing::warn!("close rejected: {err}");
                                    }
                                },
                                "×"
                            }
                        }
                    }
                }
            }
        }
    }
}
