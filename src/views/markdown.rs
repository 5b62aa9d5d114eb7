use crate::markdown::{self, Block, Span};
use dioxus::prelude::*;
use std::time::Duration;

/// How long the per-code-block "Copied" acknowledgement lasts.
const COPY_ACK: Duration = Duration::from_secs(2);

/// Render a (possibly still-growing) markdown buffer. The buffer is
/// re-parsed on every render, so partial input straight off the stream is
/// fine.
#[component]
pub fn MarkdownView(content: String) -> Element {
    let copied = use_signal(|| Option::<usize>::None);
    let blocks = markdown::parse(&content);

    let mut next_code = 0usize;
    let rendered = blocks.into_iter().map(move |block| match block {
        Block::Heading { level, text } => match level {
            1 => rsx! { h1 { "{text}" } },
            2 => rsx! { h2 { "{text}" } },
            _ => rsx! { h3 { "{text}" } },
        },
        Block::CodeBlock { language, code, .. } => {
            let index = next_code;
            next_code += 1;
            rsx! {
                CodeBlockView { index, language, code, copied }
            }
        }
        Block::OrderedList(items) => rsx! {
            ol {
                for item in items {
                    li { SpanRun { spans: item } }
                }
            }
        },
        Block::UnorderedList(items) => rsx! {
            ul {
                for item in items {
                    li { SpanRun { spans: item } }
                }
            }
        },
        Block::Paragraph(spans) => rsx! {
            p { SpanRun { spans } }
        },
        Block::Spacer => rsx! {
            div { class: "spacer" }
        },
    });

    rsx! {
        div { class: "md", {rendered} }
    }
}

#[component]
fn SpanRun(spans: Vec<Span>) -> Element {
    let nodes = spans.into_iter().map(|span| match span {
        Span::Text(text) => rsx! { span { "{text}" } },
        Span::Code(code) => rsx! { code { "{code}" } },
        Span::Bold(text) => rsx! { strong { "{text}" } },
        Span::Italic(text) => rsx! { em { "{text}" } },
    });
    rsx! {
        {nodes}
    }
}

#[component]
fn CodeBlockView(
    index: usize,
    language: String,
    code: String,
    copied: Signal<Option<usize>>,
) -> Element {
    let label = if language.is_empty() {
        "code".to_string()
    } else {
        language
    };
    let is_copied = copied() == Some(index);
    let payload = code.clone();
    let on_copy = move |_| {
        if let Ok(mut clipboard) = arboard::Clipboard::new() {
            let _ = clipboard.set_text(payload.clone());
        }
        let mut copied = copied;
        copied.set(Some(index));
        spawn(async move {
            tokio::time::sleep(COPY_ACK).await;
            if copied() == Some(index) {
                copied.set(None);
            }
        });
    };

    rsx! {
        div { class: "code-block",
            div { class: "code-header",
                span { class: "code-lang", "{label}" }
                button { class: "action-btn", r#type: "button", onclick: on_copy,
                    if is_copied { "Copied" } else { "Copy" }
                }
            }
            pre {
                code { "{code}" }
            }
        }
    }
}
