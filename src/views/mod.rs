pub mod chat;
pub mod markdown;
pub mod sidebar;

pub use chat::ChatView;
pub use markdown::MarkdownView;
pub use sidebar::Sidebar;
