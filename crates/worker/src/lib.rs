// Pitboss Worker - the sandbox side of the supervisor protocol
// One process per incarnation; stdout carries protocol lines only, logs go to stderr

pub mod engine;
pub mod logging;
pub mod runtime;
pub mod snippet;

pub use engine::ScriptEngine;
pub use logging::init_logging;
pub use runtime::{serve, serve_stdio, WorkerRuntime};
pub use snippet::{SnippetEngine, SnippetError, SnippetScript};
