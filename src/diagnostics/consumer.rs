//! The diagnostics reporting pipeline: a pluggable [`Consumer`] sink plus
//! the two built-in consumers, [`Reporter`] (human-readable, ANSI-colored
//! output) and [`Verifier`] (in-memory accumulation for tests).
use std::cell::RefCell;
use std::fmt::Write as _;
use std::io::Write;
use std::rc::Rc;

use super::{Diagnostic, Level};

/// A sink receiving every non-`ignored` diagnostic (`fatal` diagnostics are
/// raised as an error immediately instead, see [`super::trace::pcall`]).
/// Consumers must not suspend (§5 Shared state).
pub trait Consumer {
    fn consume(&self, diagnostic: &Diagnostic);
}

thread_local! {
    static CONSUMER: RefCell<Rc<dyn Consumer>> = RefCell::new(Rc::new(NullConsumer));
}

struct NullConsumer;
impl Consumer for NullConsumer {
    fn consume(&self, _diagnostic: &Diagnostic) {}
}

/// Installs `consumer` as the process-wide (thread-local) diagnostics
/// sink, returning the previous one.
pub fn set_consumer(consumer: Rc<dyn Consumer>) -> Rc<dyn Consumer> {
    CONSUMER.with(|c| c.replace(consumer))
}

pub fn current_consumer() -> Rc<dyn Consumer> {
    CONSUMER.with(|c| c.borrow().clone())
}

/// Delivers `diagnostic` to the reporting pipeline (§4.4, §7):
/// `ignored` diagnostics are dropped, `fatal` ones are never routed here
/// (callers raise them directly), everything else reaches the current
/// consumer, and `error`-level diagnostics are additionally remembered so
/// that [`super::check_error`] can re-raise them later.
pub fn report(diagnostic: &Diagnostic) {
    if diagnostic.level() == Level::Ignored {
        return;
    }
    if diagnostic.level() == Level::Error {
        super::trace::remember_last_error(diagnostic.clone());
    }
    current_consumer().consume(diagnostic);
}

/// Formats diagnostics to a writer, colored per level when the `color`
/// feature is enabled and the stream supports it.
pub struct Reporter<W> {
    out: RefCell<W>,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: RefCell::new(out),
        }
    }

    fn format(diagnostic: &Diagnostic, path: &str) -> String {
        let mut line = String::new();
        if let Some(loc) = diagnostic.location() {
            let _ = write!(line, "\x1b[1m{}\x1b[0m ", loc);
        }
        let prefix = level_prefix(diagnostic.level());
        if !path.is_empty() {
            let _ = write!(line, "{} [{}] {}", prefix, path, diagnostic.message());
        } else {
            let _ = write!(line, "{} {}", prefix, diagnostic.message());
        }
        if let Some(trace) = diagnostic.stack_trace() {
            let _ = write!(line, "\n\x1b[33mstack traceback:\x1b[0m\n{}", trace);
        }
        for (i, child) in diagnostic.nested().iter().enumerate() {
            let child_path = if path.is_empty() {
                format!("{}", i + 1)
            } else {
                format!("{}.{}", path, i + 1)
            };
            let _ = write!(line, "\n{}", Self::format(child, &child_path));
        }
        line
    }
}

#[cfg(feature = "color")]
fn level_prefix(level: Level) -> String {
    use ansi_term::Colour::{Blue, Cyan, Red, Yellow};
    match level {
        Level::Ignored => "ignored:".to_owned(),
        Level::Remark => Blue.paint("remark:").to_string(),
        Level::Warning => Yellow.paint("warning:").to_string(),
        Level::Error => Red.paint("error:").to_string(),
        Level::Fatal => Red.bold().paint("fatal:").to_string(),
        #[allow(unreachable_patterns)]
        _ => Cyan.paint("note:").to_string(),
    }
}

#[cfg(not(feature = "color"))]
fn level_prefix(level: Level) -> String {
    format!("{}:", level)
}

impl<W: Write> Consumer for Reporter<W> {
    fn consume(&self, diagnostic: &Diagnostic) {
        let text = Self::format(diagnostic, "");
        let mut out = self.out.borrow_mut();
        let _ = writeln!(out, "{}", text);
    }
}

/// Writes each diagnostic as a single JSON line (kind/level/message/
/// decorators), for consumers that want machine-readable output instead of
/// the ANSI-formatted text [`Reporter`] produces.
pub struct JsonReporter<W> {
    out: RefCell<W>,
}

impl<W: Write> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: RefCell::new(out),
        }
    }
}

impl<W: Write> Consumer for JsonReporter<W> {
    fn consume(&self, diagnostic: &Diagnostic) {
        let mut out = self.out.borrow_mut();
        match serde_json::to_string(diagnostic) {
            Ok(line) => {
                let _ = writeln!(out, "{}", line);
            }
            Err(e) => {
                let _ = writeln!(out, "{{\"kind\":\"serialization_error\",\"message\":{:?}}}", e.to_string());
            }
        }
    }
}

/// Accumulates every consumed diagnostic for test assertions.
#[derive(Default)]
pub struct Verifier {
    messages: RefCell<Vec<String>>,
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }

    /// Asserts that every substring in `expected` appears, in order, among
    /// the consumed messages.
    pub fn verify(&self, expected: &[&str]) -> bool {
        let messages = self.messages.borrow();
        let mut cursor = 0;
        for needle in expected {
            let mut found = false;
            while cursor < messages.len() {
                if messages[cursor].contains(needle) {
                    found = true;
                    cursor += 1;
                    break;
                }
                cursor += 1;
            }
            if !found {
                return false;
            }
        }
        true
    }
}

impl Consumer for Verifier {
    fn consume(&self, diagnostic: &Diagnostic) {
        self.messages.borrow_mut().push(diagnostic.message());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Value;

    #[test]
    fn verifier_accumulates_and_checks_substrings() {
        let verifier = Rc::new(Verifier::new());
        let previous = set_consumer(verifier.clone());
        report(&Diagnostic::new("warning: disk almost full", Vec::<Value>::new()));
        report(&Diagnostic::new("error: disk full", Vec::<Value>::new()));
        assert!(verifier.verify(&["almost full", "disk full"]));
        set_consumer(previous);
    }

    #[test]
    fn ignored_diagnostics_are_dropped() {
        let verifier = Rc::new(Verifier::new());
        let previous = set_consumer(verifier.clone());
        report(&Diagnostic::new("ignored: nobody cares", Vec::<Value>::new()));
        assert!(verifier.messages().is_empty());
        set_consumer(previous);
    }

    #[test]
    fn json_reporter_emits_one_line_per_diagnostic_with_resolved_message() {
        let reporter = JsonReporter::new(Vec::new());
        reporter.consume(&Diagnostic::new("warning: ${1} chunks buffered", vec![Value::from(3i64)]));
        let out = reporter.out.into_inner();
        let text = String::from_utf8(out).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(parsed["kind"], "warning");
        assert_eq!(parsed["level"], "Warning");
        assert_eq!(parsed["message"], "3 chunks buffered");
    }
}
