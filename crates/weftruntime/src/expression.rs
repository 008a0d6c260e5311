//! Sandboxed expression evaluation
//!
//! Expressions are evaluated by a raw `rhai` engine that carries only the
//! core, string, array, map and math packages plus a short list of helper
//! functions. Modules cannot be imported, `eval` is disabled and every
//! evaluation runs under a wall-clock budget enforced from the engine's
//! progress callback.
//!
//! Variables are flattened into one namespace (`env_*`, `custom_*`,
//! `node_*`); callers add locals such as `input_<port>` per evaluation.
//! Dotted scope access (`custom.user`, `input.value`) is rewritten to the
//! flat names before evaluation.

use rhai::module_resolvers::DummyModuleResolver;
use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, CorePackage, MoreStringPackage, Package,
};
use regex::{Captures, Regex};
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Scope, FLOAT, INT};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use weftcore::{Value, VariableContext};

pub const ERROR_MARKER: &str = "ExprError";
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(2);

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const MAX_OPERATIONS: u64 = 10_000_000;

static SCOPE_ACCESS: OnceLock<Option<Regex>> = OnceLock::new();

/// Evaluates expressions and `{{ }}` templates against a variable snapshot
#[derive(Debug, Clone)]
pub struct ExpressionEngine {
    variables: HashMap<String, Value>,
    budget: Duration,
}

impl ExpressionEngine {
    pub fn new(context: &VariableContext) -> Self {
        Self::from_variables(context.flatten())
    }

    pub fn from_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            budget: DEFAULT_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Evaluate `expr` against the global variables. Failures come back as
    /// an `[ExprError: ...]` string value instead of an error.
    pub fn evaluate(&self, expr: &str) -> Value {
        self.evaluate_with(expr, &HashMap::new())
    }

    /// Like [`evaluate`](Self::evaluate) with extra local variables, which
    /// shadow globals of the same name.
    pub fn evaluate_with(&self, expr: &str, locals: &HashMap<String, Value>) -> Value {
        match self.try_evaluate(expr, locals) {
            Ok(value) => value,
            Err(message) => Value::String(error_marker(&message)),
        }
    }

    pub fn try_evaluate(
        &self,
        expr: &str,
        locals: &HashMap<String, Value>,
    ) -> Result<Value, String> {
        let engine = self.build_engine();
        let mut scope = Scope::new();
        for (name, value) in self.variables.iter().chain(locals.iter()) {
            scope.push_dynamic(name.as_str(), to_dynamic(value));
        }

        engine
            .eval_with_scope::<Dynamic>(&mut scope, &flatten_scope_access(expr))
            .map(from_dynamic)
            .map_err(|err| self.describe(*err))
    }

    /// Replace every `{{ expr }}` with its stringified value. A failing
    /// block renders as an error marker; the other blocks still render.
    pub fn evaluate_template(&self, template: &str, locals: &HashMap<String, Value>) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find(OPEN) {
            let after = &rest[start + OPEN.len()..];
            let Some(end) = after.find(CLOSE) else {
                break;
            };
            out.push_str(&rest[..start]);
            let expr = after[..end].trim();
            if !expr.is_empty() {
                match self.evaluate_with(expr, locals) {
                    Value::Null => {}
                    value => out.push_str(&value.to_string()),
                }
            }
            rest = &after[end + CLOSE.len()..];
        }

        out.push_str(rest);
        out
    }

    /// Resolve a parameter or input value. Strings that are exactly one
    /// `{{ expr }}` block keep the expression's type; other strings with
    /// blocks are rendered as templates. Arrays and objects are walked.
    pub fn resolve(&self, value: &Value, locals: &HashMap<String, Value>) -> Value {
        match value {
            Value::String(text) => match pure_block(text) {
                Some(expr) => self.evaluate_with(expr, locals),
                None if text.contains(OPEN) => {
                    Value::String(self.evaluate_template(text, locals))
                }
                None => value.clone(),
            },
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve(v, locals)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v, locals)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Evaluate a branch or loop condition. Accepts a bare expression or a
    /// single `{{ }}` block; evaluation errors count as false.
    pub fn evaluate_condition(&self, expr: &str, locals: &HashMap<String, Value>) -> bool {
        let expr = pure_block(expr).unwrap_or_else(|| expr.trim());
        if expr.is_empty() {
            return false;
        }
        match self.try_evaluate(expr, locals) {
            Ok(value) => value.is_truthy(),
            Err(message) => {
                tracing::warn!("Condition '{}' failed: {}", expr, message);
                false
            }
        }
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new_raw();
        engine.register_global_module(CorePackage::new().as_shared_module());
        engine.register_global_module(MoreStringPackage::new().as_shared_module());
        engine.register_global_module(BasicArrayPackage::new().as_shared_module());
        engine.register_global_module(BasicMapPackage::new().as_shared_module());
        engine.register_global_module(BasicMathPackage::new().as_shared_module());

        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_expr_depths(64, 32);
        engine.set_max_string_size(1 << 20);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(100_000);

        let started = Instant::now();
        let budget = self.budget;
        engine.on_progress(move |_| {
            if started.elapsed() > budget {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });

        register_helpers(&mut engine);
        engine
    }

    fn describe(&self, err: EvalAltResult) -> String {
        match err {
            EvalAltResult::ErrorTerminated(..) => {
                format!("evaluation exceeded {}ms budget", self.budget.as_millis())
            }
            EvalAltResult::ErrorTooManyOperations(..) => {
                "evaluation exceeded operation limit".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::from_variables(HashMap::new())
    }
}

pub fn error_marker(message: &str) -> String {
    format!("[{}: {}]", ERROR_MARKER, message)
}

pub fn is_error_marker(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.starts_with(&format!("[{}:", ERROR_MARKER)))
}

/// Rewrite `env.x`, `custom.x`, `input.x` and `node_vars.x` (or `node.x`)
/// to their flattened names. Property access on other values such as
/// `data.custom.x` is left alone.
pub fn flatten_scope_access(expr: &str) -> Cow<'_, str> {
    let pattern = SCOPE_ACCESS.get_or_init(|| {
        Regex::new(r"(^|[^.\w])(env|custom|input|node_vars|node)\.([A-Za-z_]\w*)").ok()
    });
    let Some(pattern) = pattern else {
        return Cow::Borrowed(expr);
    };
    pattern.replace_all(expr, |caps: &Captures| {
        let scope = match &caps[2] {
            "node_vars" => "node",
            other => other,
        };
        format!("{}{}_{}", &caps[1], scope, &caps[3])
    })
}

/// The inner expression of a string that is exactly one `{{ }}` block.
fn pure_block(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        None
    } else {
        Some(inner.trim())
    }
}

fn register_helpers(engine: &mut Engine) {
    engine.register_fn("str", |v: Dynamic| -> String { from_dynamic(v).to_string() });

    engine.register_fn("int", |v: INT| v);
    engine.register_fn("int", |v: FLOAT| v.trunc() as INT);
    engine.register_fn("int", |s: ImmutableString| -> Result<INT, Box<EvalAltResult>> {
        s.trim()
            .parse::<INT>()
            .map_err(|e| format!("int('{}'): {}", s, e).into())
    });

    engine.register_fn("float", |v: INT| v as FLOAT);
    engine.register_fn("float", |v: FLOAT| v);
    engine.register_fn("float", |s: ImmutableString| -> Result<FLOAT, Box<EvalAltResult>> {
        s.trim()
            .parse::<FLOAT>()
            .map_err(|e| format!("float('{}'): {}", s, e).into())
    });

    engine.register_fn("bool", |v: Dynamic| from_dynamic(v).is_truthy());

    engine.register_fn("upper", |s: ImmutableString| s.to_uppercase());
    engine.register_fn("lower", |s: ImmutableString| s.to_lowercase());
    engine.register_fn("strip", |s: ImmutableString| s.trim().to_string());

    engine.register_fn("min", |a: INT, b: INT| a.min(b));
    engine.register_fn("min", |a: FLOAT, b: FLOAT| a.min(b));
    engine.register_fn("max", |a: INT, b: INT| a.max(b));
    engine.register_fn("max", |a: FLOAT, b: FLOAT| a.max(b));

    engine.register_fn(
        "json_loads",
        |s: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
            serde_json::from_str::<serde_json::Value>(&s)
                .map(|json| to_dynamic(&Value::from(json)))
                .map_err(|e| format!("json_loads: {}", e).into())
        },
    );
    engine.register_fn("json_dumps", |v: Dynamic| -> String {
        from_dynamic(v).to_json().to_string()
    });

    engine.register_fn("now", || chrono::Local::now().to_rfc3339());
    engine.register_fn("timestamp", || chrono::Utc::now().timestamp());
}

fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Number(_) => match value.as_i64() {
            Some(i) => Dynamic::from_int(i),
            None => Dynamic::from_float(value.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect()),
        Value::Object(map) => {
            let mut out = rhai::Map::new();
            for (key, item) in map {
                out.insert(key.as_str().into(), to_dynamic(item));
            }
            Dynamic::from_map(out)
        }
    }
}

fn from_dynamic(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Number(i as f64);
    }
    if let Ok(f) = value.as_float() {
        return Value::Number(f);
    }
    if let Ok(c) = value.as_char() {
        return Value::String(c.to_string());
    }
    if value.is_string() {
        return Value::String(value.into_string().unwrap_or_default());
    }
    if value.is_array() {
        let items = value.into_array().unwrap_or_default();
        return Value::Array(items.into_iter().map(from_dynamic).collect());
    }
    if value.is_map() {
        if let Some(map) = value.clone().try_cast::<rhai::Map>() {
            return Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k.to_string(), from_dynamic(v)))
                    .collect(),
            );
        }
    }
    Value::String(value.to_string())
}
