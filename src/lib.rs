pub mod api;
pub mod markdown;
pub mod session;
pub mod types;

#[cfg(feature = "desktop")]
pub mod ui;
#[cfg(feature = "desktop")]
pub mod views;
