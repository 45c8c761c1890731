pub mod app;
pub mod commands;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod env;
pub mod output;
pub mod runtime;
pub mod wait;

pub use app::run;
