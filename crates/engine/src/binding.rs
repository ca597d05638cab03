//! Native functions exposed to page scripts.
//!
//! Bindings live under one global object (`window.muban` by default). A call
//! from the page arrives as a function name plus JSON arguments; handlers
//! answer by running script in the page through a [`ScriptHost`].

use crate::context::AppContext;
use crate::traits::{CapError, ScriptHost};
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_BINDING_NAME: &str = "muban";

/// Name of the native command the init script forwards calls to.
pub const INVOKE_COMMAND: &str = "muban_binding";

pub type BindingHandler = fn(&[Value], &AppContext, &dyn ScriptHost) -> Result<(), BindingError>;

#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("unknown binding function: {0}")]
    UnknownFunction(String),
    #[error("invalid arguments for {function}: {reason}")]
    InvalidArguments { function: String, reason: String },
    #[error("script execution failed: {0}")]
    Script(#[from] CapError),
}

pub struct BindingRegistry {
    name: String,
    functions: BTreeMap<String, BindingHandler>,
}

impl BindingRegistry {
    /// Registry with the built-in functions under `name`.
    pub fn new(name: &str) -> Self {
        let mut reg = Self {
            name: name.to_string(),
            functions: BTreeMap::new(),
        };
        reg.add("showSysInfo", show_sys_info);
        reg
    }

    pub fn add(&mut self, function: &str, handler: BindingHandler) {
        self.functions.insert(function.to_string(), handler);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn functions(&self) -> Vec<&str> {
        self.functions.keys().map(|s| s.as_str()).collect()
    }

    pub fn invoke(
        &self,
        function: &str,
        args: &[Value],
        ctx: &AppContext,
        host: &dyn ScriptHost,
    ) -> Result<(), BindingError> {
        let handler = self
            .functions
            .get(function)
            .ok_or_else(|| BindingError::UnknownFunction(function.to_string()))?;
        tracing::debug!(binding = %self.name, function, args = args.len(), "binding call");
        handler(args, ctx, host)
    }

    /// Script injected before any page script runs. Defines
    /// `window.<name>.<function>(...args)` for every registered function.
    pub fn init_script(&self) -> String {
        let name = js_string(&self.name);
        let functions = serde_json::to_string(&self.functions()).unwrap_or_else(|_| "[]".into());
        format!(
            r#"(function () {{
  var invoke = function (cmd, args) {{
    return window.__TAURI_INTERNALS__.invoke(cmd, args);
  }};
  var target = window[{name}] = window[{name}] || {{}};
  {functions}.forEach(function (fn) {{
    target[fn] = function () {{
      return invoke({command}, {{ name: fn, args: Array.prototype.slice.call(arguments) }});
    }};
  }});
}})();"#,
            name = name,
            functions = functions,
            command = js_string(INVOKE_COMMAND),
        )
    }
}

impl Default for BindingRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BINDING_NAME)
    }
}

/// Quote `s` as a JavaScript string literal.
pub fn js_string(s: &str) -> String {
    // JSON strings are valid JS literals; escape the line separators older
    // engines reject and `<` so the result is safe inside inline <script>.
    serde_json::to_string(s)
        .unwrap_or_else(|_| "\"\"".into())
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
        .replace('<', "\\u003c")
}

fn string_arg<'a>(function: &str, args: &'a [Value], index: usize) -> Result<&'a str, BindingError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| BindingError::InvalidArguments {
            function: function.to_string(),
            reason: format!("argument {} must be a string", index),
        })
}

// ===========================================================================
// Built-in bindings
// ===========================================================================

/// `showSysInfo(request)` – for `"cpu"`, calls `window.report(<cpu brand>)`
/// in the page. Other requests are ignored.
fn show_sys_info(args: &[Value], ctx: &AppContext, host: &dyn ScriptHost) -> Result<(), BindingError> {
    let request = string_arg("showSysInfo", args, 0)?;
    if request == "cpu" {
        let brand = ctx.cpu().brand();
        host.execute_script(&format!("window.report({})", js_string(&brand)))?;
    }
    Ok(())
}
