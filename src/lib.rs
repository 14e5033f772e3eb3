#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod comments;
pub mod config;
pub mod content;
pub mod data;
pub mod format;
pub mod logging;
pub mod math;
pub mod mention;
pub mod model;
pub mod pagination;
pub mod session;
pub mod thread;
pub mod ui;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
