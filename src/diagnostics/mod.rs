//! Structured diagnostics: leveled, lazily-interpolated error/warning objects.
//!
//! A [`Diagnostic`] bundles a `kind` (whose [`Level`] is fixed by the
//! [`KindRegistry`]), a message template, positional arguments and named
//! decorators (source [`Location`], captured stack trace, nested
//! diagnostics, owning task/future context). The human-readable message is
//! computed lazily, on first [`Diagnostic::message`] call, by interpolating
//! `${name}`/`${1}`.. against the decorators and positional arguments.
//!
//! See also:
//! - [`consumer`] for the reporting pipeline (`Reporter`, `Verifier`).
//! - [`trace`] for `pcall`/`trace`/`wrap`.
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use once_cell::unsync::OnceCell;
use serde::Serialize;

pub mod consumer;
pub mod trace;

pub use consumer::{set_consumer, Consumer, JsonReporter, Reporter, Verifier};
pub use trace::{check_error, last_error, pcall, trace, wrap};

const MAX_INTERPOLATION_DEPTH: u32 = 32;

/// Severity of a [`Diagnostic`], determined solely by its `kind` (§3 Invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Level {
    Ignored,
    Remark,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Ignored => "ignored",
            Level::Remark => "remark",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// A source position decorator.
#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
    pub code: Option<String>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)?;
        if let Some(col) = self.column {
            write!(f, ":{}", col)?;
        }
        Ok(())
    }
}

/// A value usable as a positional argument or a named decorator.
///
/// Interpolation recurses through [`Value::List`] and calls
/// [`Value::Func`] closures with the owning diagnostic, so a decorator can
/// be built from nested diagnostics or computed lazily. Recursion is
/// bounded (`MAX_INTERPOLATION_DEPTH`) to guard against accidental cycles
/// between diagnostics.
#[derive(Clone)]
pub enum Value {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Diagnostic(Diagnostic),
    List(Vec<Value>),
    Func(Rc<dyn Fn(&Diagnostic) -> Value>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "Text({:?})", s),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Float(n) => write!(f, "Float({})", n),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Diagnostic(d) => write!(f, "Diagnostic({})", d.kind()),
            Value::List(items) => write!(f, "List({:?})", items),
            Value::Func(_) => write!(f, "Func(..)"),
        }
    }
}

// `Func` wraps a closure, which has no serializable representation, so
// `Value` can't just `#[derive(Serialize)]`: it's rendered the same way
// `Debug` renders it, as an opaque placeholder.
impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Value::Text(s) => serializer.serialize_str(s),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(n) => serializer.serialize_f64(*n),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Diagnostic(d) => d.serialize(serializer),
            Value::List(items) => items.serialize(serializer),
            Value::Func(_) => serializer.serialize_str("<func>"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}
impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}
impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<Diagnostic> for Value {
    fn from(d: Diagnostic) -> Self {
        Value::Diagnostic(d)
    }
}
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

fn render_value(value: &Value, owner: &Diagnostic, depth: u32) -> String {
    if depth > MAX_INTERPOLATION_DEPTH {
        return "${...}".to_owned();
    }
    match value {
        Value::Text(s) => s.clone(),
        Value::Int(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Diagnostic(d) => d.message(),
        Value::List(items) => items
            .iter()
            .map(|item| render_value(item, owner, depth + 1))
            .collect::<Vec<_>>()
            .join(", "),
        Value::Func(f) => render_value(&f(owner), owner, depth + 1),
    }
}

/// Registry mapping diagnostic `kind` to its fixed [`Level`] (§3, §4.4.1).
///
/// Seeded with the meta-kinds (`ignored`/`remark`/`warning`/`error`/`fatal`,
/// whose level equals their name) and the built-in specific kinds
/// (`runtime_error`, `cli_error`, `subprocess_error`, `glob_error`).
/// Meta-kind names are reserved and cannot be re-registered at a different
/// level: `fatal` is always fatal.
pub struct KindRegistry {
    levels: HashMap<String, Level>,
}

impl KindRegistry {
    pub fn with_defaults() -> Self {
        let mut levels = HashMap::new();
        levels.insert("ignored".to_owned(), Level::Ignored);
        levels.insert("remark".to_owned(), Level::Remark);
        levels.insert("warning".to_owned(), Level::Warning);
        levels.insert("error".to_owned(), Level::Error);
        levels.insert("fatal".to_owned(), Level::Fatal);
        levels.insert("runtime_error".to_owned(), Level::Fatal);
        levels.insert("cli_error".to_owned(), Level::Fatal);
        levels.insert("subprocess_error".to_owned(), Level::Fatal);
        levels.insert("glob_error".to_owned(), Level::Fatal);
        Self { levels }
    }

    /// Registers `kind` at `level`. Returns `false` (no-op) if `kind` names
    /// one of the five reserved meta-kinds.
    pub fn register(&mut self, kind: &str, level: Level) -> bool {
        if is_meta_kind(kind) {
            return false;
        }
        self.levels.insert(kind.to_owned(), level);
        true
    }

    /// Looks up the level for `kind`, defaulting unregistered kinds to
    /// [`Level::Error`] (the registry forgives unknown kinds rather than
    /// panicking, since diagnostics are often constructed ad hoc).
    pub fn level_of(&self, kind: &str) -> Level {
        self.levels.get(kind).copied().unwrap_or(Level::Error)
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn is_meta_kind(kind: &str) -> bool {
    matches!(kind, "ignored" | "remark" | "warning" | "error" | "fatal")
}

thread_local! {
    static KIND_REGISTRY: RefCell<KindRegistry> = RefCell::new(KindRegistry::with_defaults());
}

/// Registers `kind` at `level` in the process-wide (thread-local) registry.
/// Returns `false` if `kind` names a reserved meta-kind.
pub fn register_kind(kind: &str, level: Level) -> bool {
    KIND_REGISTRY.with(|r| r.borrow_mut().register(kind, level))
}

fn level_for_kind(kind: &str) -> Level {
    KIND_REGISTRY.with(|r| r.borrow().level_of(kind))
}

struct Inner {
    kind: String,
    level: Level,
    template: String,
    args: Vec<Value>,
    decorators: RefCell<HashMap<String, Value>>,
    message: OnceCell<String>,
}

/// A structured error/warning object (§3, §4.4).
///
/// Cheaply `Clone`able (an `Rc` handle); every accessible field is
/// immutable except decorators, which may be attached after construction
/// (e.g. a task/future back-reference added once the diagnostic starts
/// propagating, or nested child diagnostics accumulated by a task-set).
#[derive(Clone)]
pub struct Diagnostic {
    inner: Rc<Inner>,
}

impl Diagnostic {
    /// Builds a diagnostic from a `"kind: template"` format string plus
    /// positional arguments, e.g. `Diagnostic::new("warning: ${1}+${3}!=${2}", [1, "2", remark])`.
    pub fn new<A>(format: &str, args: A) -> Self
    where
        A: IntoIterator,
        A::Item: Into<Value>,
    {
        let (kind, template) = match format.split_once(':') {
            Some((k, t)) => (k.trim(), t.trim_start()),
            None => (format, ""),
        };
        Self::from_parts(kind, template, args)
    }

    /// Builds a diagnostic from an explicit kind and template, e.g. when
    /// the kind is computed rather than embedded in a literal format
    /// string.
    pub fn from_parts<A>(kind: &str, template: &str, args: A) -> Self
    where
        A: IntoIterator,
        A::Item: Into<Value>,
    {
        Diagnostic {
            inner: Rc::new(Inner {
                kind: kind.to_owned(),
                level: level_for_kind(kind),
                template: template.to_owned(),
                args: args.into_iter().map(Into::into).collect(),
                decorators: RefCell::new(HashMap::new()),
                message: OnceCell::new(),
            }),
        }
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn level(&self) -> Level {
        self.inner.level
    }

    /// The lazily-interpolated human-readable message.
    pub fn message(&self) -> String {
        self.inner
            .message
            .get_or_init(|| {
                let mut out = String::new();
                let mut rest = self.inner.template.as_str();
                while let Some(start) = rest.find("${") {
                    out.push_str(&rest[..start]);
                    let after = &rest[start + 2..];
                    match after.find('}') {
                        Some(end) => {
                            let key = &after[..end];
                            out.push_str(&self.resolve(key));
                            rest = &after[end + 1..];
                        }
                        None => {
                            out.push_str("${");
                            rest = after;
                            break;
                        }
                    }
                }
                out.push_str(rest);
                out
            })
            .clone()
    }

    fn resolve(&self, key: &str) -> String {
        if let Ok(n) = key.parse::<usize>() {
            if n >= 1 {
                if let Some(v) = self.inner.args.get(n - 1) {
                    return render_value(v, self, 0);
                }
            }
            return format!("${{MISSING:{}}}", key);
        }
        let decorators = self.inner.decorators.borrow();
        match decorators.get(key) {
            Some(v) => render_value(v, self, 0),
            None => format!("${{MISSING:{}}}", key),
        }
    }

    /// Attaches (or overwrites) a named decorator.
    pub fn with_decorator(self, name: &str, value: impl Into<Value>) -> Self {
        self.inner
            .decorators
            .borrow_mut()
            .insert(name.to_owned(), value.into());
        self
    }

    pub fn decorator(&self, name: &str) -> Option<Value> {
        self.inner.decorators.borrow().get(name).cloned()
    }

    pub fn with_location(self, location: Location) -> Self {
        self.with_decorator("location", location.to_string())
    }

    pub fn location(&self) -> Option<String> {
        match self.decorator("location") {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn with_stack_trace(self, trace: impl Into<String>) -> Self {
        self.with_decorator("stb", trace.into())
    }

    pub fn stack_trace(&self) -> Option<String> {
        match self.decorator("stb") {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Wraps a set of rejected child diagnostics into one aggregate
    /// (§4.2 task-sets, §7 propagation policy). Collapses to the single
    /// child when there is exactly one.
    pub fn aggregate(kind: &str, children: Vec<Diagnostic>) -> Diagnostic {
        if children.len() == 1 {
            return children.into_iter().next().unwrap();
        }
        let template = "${nested.len} of ${nested.len} operations failed";
        Diagnostic::from_parts(kind, template, Vec::<Value>::new())
            .with_decorator("nested.len", children.len() as i64)
            .with_decorator("nested", Value::List(children.into_iter().map(Value::Diagnostic).collect()))
    }

    pub fn nested(&self) -> Vec<Diagnostic> {
        match self.decorator("nested") {
            Some(Value::List(items)) => items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Diagnostic(d) => Some(d),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Captures the current backtrace as the `stb` decorator.
    pub fn capture_trace(self) -> Self {
        let bt = std::backtrace::Backtrace::force_capture();
        self.with_stack_trace(bt.to_string())
    }

    /// Converts a caught panic payload into a `runtime_error` diagnostic
    /// with a captured stack trace (§4.1 error model, §4.4 `pcall`).
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Diagnostic {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Diagnostic::from_parts("runtime_error", &message, Vec::<Value>::new()).capture_trace()
    }
}

impl fmt::Debug for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostic")
            .field("kind", &self.inner.kind)
            .field("level", &self.inner.level)
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.inner.kind, self.message())
    }
}

/// Snapshots the resolved `kind`/`level`/`message` plus every decorator
/// (location, stack trace, nested children, ...) — everything a
/// machine-readable consumer needs, with the message already interpolated
/// rather than shipping the raw template and positional args.
impl Serialize for Diagnostic {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let message = self.message();
        let decorators = self.inner.decorators.borrow();
        let mut state = serializer.serialize_struct("Diagnostic", 4)?;
        state.serialize_field("kind", &self.inner.kind)?;
        state.serialize_field("level", &self.inner.level)?;
        state.serialize_field("message", &message)?;
        state.serialize_field("decorators", &*decorators)?;
        state.end()
    }
}

impl std::error::Error for Diagnostic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_positional_and_nested() {
        let remark = Diagnostic::new("remark: 3", Vec::<Value>::new());
        let d = Diagnostic::new(
            "warning: ${1}+${3}!=${2}",
            vec![Value::from(1i64), Value::from("2"), Value::from(remark)],
        );
        assert_eq!(d.message(), "1+3!=2");
        assert_eq!(d.level(), Level::Warning);
    }

    #[test]
    fn missing_key_renders_placeholder() {
        let d = Diagnostic::new("error: ${nope}", Vec::<Value>::new());
        assert_eq!(d.message(), "${MISSING:nope}");
    }

    #[test]
    fn level_is_fixed_by_kind() {
        register_kind("flaky", Level::Remark);
        let d = Diagnostic::new("flaky: hiccup", Vec::<Value>::new());
        assert_eq!(d.level(), Level::Remark);
    }

    #[test]
    fn fatal_kind_cannot_be_redefined() {
        assert!(!register_kind("fatal", Level::Remark));
        let d = Diagnostic::new("fatal: boom", Vec::<Value>::new());
        assert_eq!(d.level(), Level::Fatal);
    }

    #[test]
    fn single_child_aggregate_unwraps() {
        let child = Diagnostic::new("error: boom", Vec::<Value>::new());
        let agg = Diagnostic::aggregate("error", vec![child.clone()]);
        assert_eq!(agg.message(), "boom");
    }

    #[test]
    fn multi_child_aggregate_nests() {
        let a = Diagnostic::new("error: a", Vec::<Value>::new());
        let b = Diagnostic::new("error: b", Vec::<Value>::new());
        let agg = Diagnostic::aggregate("error", vec![a, b]);
        assert_eq!(agg.nested().len(), 2);
    }
}
