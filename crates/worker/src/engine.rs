// Script engine seam
// The runtime owns protocol state; engines only prepare and execute code.

use serde_json::{Map, Value};
use std::time::Duration;

/// An interpreter able to run untrusted snippets against a JSON scope
///
/// Error strings are reported to the supervisor verbatim, after the runtime
/// adds its `Syntax error: ` / `Runtime error: ` prefix.
pub trait ScriptEngine {
    /// Compiled form of the code, reused for every job of an incarnation
    type Script;

    /// Compile `code`; `timeout` bounds each later execution
    fn prepare(&self, code: &str, timeout: Option<Duration>) -> Result<Self::Script, String>;

    /// Exports of a built-in library module
    fn load_library(&self, module: &str) -> Result<Value, String>;

    /// Run `script` with `scope` as its global variables
    ///
    /// `Ok(None)` means the snippet produced no value.
    fn execute(&self, script: &Self::Script, scope: Map<String, Value>)
        -> Result<Option<Value>, String>;
}
