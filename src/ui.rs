use crate::session::ChatSession;
use crate::views::{ChatView, Sidebar};
use dioxus::prelude::*;

#[component]
pub fn App() -> Element {
    let session = use_signal(|| {
        let mut session = ChatSession::new();
        // Credential lives in memory for the session only; the env var is a
        // convenience for development.
        if let Ok(key) = std::env::var("DETOUR_API_KEY") {
            session.set_credential(key);
        }
        session
    });

    rsx! {
        div { class: "app-shell",
            Sidebar { session }
            ChatView { session }
        }
    }
}
