use super::files::RunFiles;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use weftcore::ComponentSpec;

const DEFAULT_ENTRY: &str = "Component";

/// Generates the self-contained entry script for one runtime kind
pub trait ScriptTemplate: Send + Sync {
    /// Runtime kind served, matching `ComponentSpec::runtime`.
    fn runtime(&self) -> &str;

    fn script_name(&self) -> &str;

    /// Script that loads `source`, runs it against the transfer file and
    /// writes the result or error file.
    fn render(&self, component: &ComponentSpec, source: &Path, files: &RunFiles) -> String;

    /// Command launching `script`.
    fn command(&self, interpreter: &Path, script: &Path) -> Command;
}

// ============================================================================
// Python
// ============================================================================

const PYTHON_TEMPLATE: &str = r#"import importlib.util
import json
import logging
import sys
import traceback

SOURCE_FILE = @@SOURCE@@
ENTRY = @@ENTRY@@
NODE_KEY = @@NODE_KEY@@
TRANSFER_FILE = @@TRANSFER@@
RESULT_FILE = @@RESULT@@
ERROR_FILE = @@ERROR@@
LOG_FILE = @@LOG@@

_log_stream = open(LOG_FILE, "a", buffering=1, encoding="utf-8")
sys.stdout = _log_stream
sys.stderr = _log_stream

logger = logging.getLogger(NODE_KEY)
_handler = logging.StreamHandler(_log_stream)
_handler.setFormatter(logging.Formatter("%(asctime)s %(levelname)s %(message)s"))
logger.addHandler(_handler)
logger.setLevel(logging.INFO)


def _write(path, payload):
    with open(path, "w", encoding="utf-8") as fh:
        json.dump(payload, fh, default=str)


def _fail(exc, error_type):
    _write(ERROR_FILE, {
        "error_message": str(exc),
        "traceback_text": traceback.format_exc(),
        "error_type": error_type,
    })
    sys.exit(1)


try:
    with open(TRANSFER_FILE, encoding="utf-8") as fh:
        params, inputs, variables = json.load(fh)

    spec = importlib.util.spec_from_file_location("weft_component", SOURCE_FILE)
    module = importlib.util.module_from_spec(spec)
    sys.modules["weft_component"] = module
    spec.loader.exec_module(module)

    entry = getattr(module, ENTRY)
    if isinstance(entry, type):
        component = entry()
        component.logger = logger
        component.variables = variables
        outputs = component.run(params, inputs)
    else:
        outputs = entry(params, inputs)

    if outputs is None:
        outputs = {}
    if not isinstance(outputs, dict):
        outputs = {"output": outputs}
    _write(RESULT_FILE, outputs)
except ImportError as exc:
    _fail(exc, "missing_dependency")
except Exception as exc:
    _fail(exc, type(exc).__name__)
"#;

/// Runs components written against the Python run contract
#[derive(Debug, Clone, Default)]
pub struct PythonTemplate;

impl ScriptTemplate for PythonTemplate {
    fn runtime(&self) -> &str {
        "python"
    }

    fn script_name(&self) -> &str {
        "entry.py"
    }

    fn render(&self, component: &ComponentSpec, source: &Path, files: &RunFiles) -> String {
        let entry = component.entry.as_deref().unwrap_or(DEFAULT_ENTRY);
        PYTHON_TEMPLATE
            .replace("@@SOURCE@@", &py_literal(&source.to_string_lossy()))
            .replace("@@ENTRY@@", &py_literal(entry))
            .replace("@@NODE_KEY@@", &py_literal(files.node_key()))
            .replace("@@TRANSFER@@", &py_path(&files.transfer()))
            .replace("@@RESULT@@", &py_path(&files.result()))
            .replace("@@ERROR@@", &py_path(&files.error()))
            .replace("@@LOG@@", &py_path(&files.log()))
    }

    fn command(&self, interpreter: &Path, script: &Path) -> Command {
        let mut cmd = Command::new(interpreter);
        cmd.arg("-u").arg(script);
        cmd
    }
}

/// JSON string literals are valid Python string literals.
fn py_literal(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

fn py_path(path: &Path) -> String {
    py_literal(&path.to_string_lossy())
}

// ============================================================================
// Shell
// ============================================================================

const SHELL_TEMPLATE: &str = r#"#!/bin/sh
WEFT_SOURCE=@@SOURCE@@
WEFT_NODE_KEY=@@NODE_KEY@@
WEFT_TRANSFER_FILE=@@TRANSFER@@
WEFT_RESULT_FILE=@@RESULT@@
WEFT_ERROR_FILE=@@ERROR@@
WEFT_LOG_FILE=@@LOG@@
export WEFT_NODE_KEY WEFT_TRANSFER_FILE WEFT_RESULT_FILE WEFT_ERROR_FILE WEFT_LOG_FILE

( set -e; . "$WEFT_SOURCE" ) >>"$WEFT_LOG_FILE" 2>&1
status=$?

if [ "$status" -ne 0 ] && [ ! -s "$WEFT_ERROR_FILE" ]; then
    if [ "$status" -eq 127 ]; then
        kind=missing_dependency
    else
        kind=component_error
    fi
    printf '{"error_message":"component exited with status %s","traceback_text":"","error_type":"%s"}\n' \
        "$status" "$kind" >"$WEFT_ERROR_FILE"
fi
exit "$status"
"#;

/// Runs POSIX shell components. The component script is sourced with the
/// run's file paths exported as `WEFT_*` variables.
#[derive(Debug, Clone)]
pub struct ShellTemplate {
    shell: PathBuf,
}

impl ShellTemplate {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellTemplate {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

impl ScriptTemplate for ShellTemplate {
    fn runtime(&self) -> &str {
        "shell"
    }

    fn script_name(&self) -> &str {
        "entry.sh"
    }

    fn render(&self, _component: &ComponentSpec, source: &Path, files: &RunFiles) -> String {
        SHELL_TEMPLATE
            .replace("@@SOURCE@@", &sh_literal(&source.to_string_lossy()))
            .replace("@@NODE_KEY@@", &sh_literal(files.node_key()))
            .replace("@@TRANSFER@@", &sh_path(&files.transfer()))
            .replace("@@RESULT@@", &sh_path(&files.result()))
            .replace("@@ERROR@@", &sh_path(&files.error()))
            .replace("@@LOG@@", &sh_path(&files.log()))
    }

    // the interpreter path belongs to Python components; shell ones use
    // the configured shell
    fn command(&self, _interpreter: &Path, script: &Path) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(script);
        cmd
    }
}

fn sh_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn sh_path(path: &Path) -> String {
    sh_literal(&path.to_string_lossy())
}
