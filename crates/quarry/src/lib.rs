#![forbid(unsafe_code)]

pub mod cli;
pub mod compose;
pub mod config;
pub mod introspect;
pub mod llm;
pub mod models;
pub mod resolve;
pub mod scope;
pub mod sqlite;
pub mod store;
pub mod synth;
pub mod utils;
pub mod validate;

pub use cli::app::{Cli, Command};
