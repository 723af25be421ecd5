//! Safe-call (`pcall`), tracing wrappers, and the top-level [`wrap`] driver
//! (§4.4 "Tracing", "Safe-call", "Top-level wrap").
use std::cell::{Cell, RefCell};
use std::panic;
use std::rc::Rc;
use std::time::Instant;

use super::consumer::{report, set_consumer, Consumer, Reporter};
use super::{Diagnostic, Level};

thread_local! {
    static LAST_ERROR: RefCell<Option<Diagnostic>> = RefCell::new(None);
    static TRACING_ENABLED: Cell<bool> = Cell::new(false);
}

pub(crate) fn remember_last_error(diagnostic: Diagnostic) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(diagnostic));
}

/// The last `error`-level diagnostic delivered to the consumer, if any.
pub fn last_error() -> Option<Diagnostic> {
    LAST_ERROR.with(|e| e.borrow().clone())
}

/// Raises (returns as `Err`) and clears the last remembered `error`-level
/// diagnostic, if any.
pub fn check_error() -> Result<(), Diagnostic> {
    match LAST_ERROR.with(|e| e.borrow_mut().take()) {
        Some(d) => Err(d),
        None => Ok(()),
    }
}

/// Enables or disables the global tracing switch used by [`trace`]
/// wrappers, returning the previous value.
pub fn set_tracing(enabled: bool) -> bool {
    TRACING_ENABLED.with(|t| t.replace(enabled))
}

pub fn tracing_enabled() -> bool {
    TRACING_ENABLED.with(|t| t.get())
}

/// Runs `f`, converting any panic into a `runtime_error` [`Diagnostic`]
/// with a captured stack trace (§4.4 "Safe-call"). A `Diagnostic` already
/// returned as `Err` by `f` passes through unchanged. Used by the
/// scheduler to contain fiber errors (§4.1).
pub fn pcall<F, T>(f: F) -> Result<T, Diagnostic>
where
    F: FnOnce() -> Result<T, Diagnostic> + panic::UnwindSafe,
{
    match panic::catch_unwind(f) {
        Ok(result) => result,
        Err(payload) => Err(Diagnostic::from_panic(payload)),
    }
}

/// A trace wrapper around `f`: when tracing is enabled (see
/// [`set_tracing`]), prints `pre` before calling `f` and `post` (with an
/// elapsed-time suffix) after. `pre`/`post` are interpolated against
/// `args`, a list of `(parameter name, rendered value)` pairs supplied by
/// the caller — the practical Rust stand-in for the source's "interpolated
/// against `f`'s arguments, accessed by parameter name", since Rust has no
/// runtime parameter reflection.
pub struct Trace<F> {
    pre: String,
    post: String,
    f: F,
}

pub fn trace<F, T>(pre: &str, post: &str, f: F) -> Trace<F>
where
    F: Fn(&[(&str, String)]) -> T,
{
    Trace {
        pre: pre.to_owned(),
        post: post.to_owned(),
        f,
    }
}

impl<F, T> Trace<F>
where
    F: Fn(&[(&str, String)]) -> T,
{
    pub fn call(&self, args: &[(&str, String)]) -> T {
        if tracing_enabled() {
            println!("{}", interpolate_named(&self.pre, args));
        }
        let start = Instant::now();
        let result = (self.f)(args);
        if tracing_enabled() {
            let elapsed = start.elapsed();
            println!("{} ({:?})", interpolate_named(&self.post, args), elapsed);
        }
        result
    }
}

fn interpolate_named(template: &str, args: &[(&str, String)]) -> String {
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match args.iter().find(|(name, _)| *name == key) {
                    Some((_, value)) => out.push_str(value),
                    None => out.push_str(&format!("${{MISSING:{}}}", key)),
                }
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
}

/// Installs a fresh [`Reporter`] on stderr, runs `main` via [`pcall`],
/// drives the scheduler to completion, and prints the final `fatal`
/// diagnostic (if any). Returns `true` on success. This is the crate's
/// entry point (§6 "Driver entry point"): an embedding program calls
/// `wrap(main)`, where `main` submits work via [`crate::scheduler::spawn`]
/// and returns; `wrap` owns running the scheduler to quiescence. When
/// tracing is on, also prints total wall time and peak memory (§4.4).
pub fn wrap<F>(main: F) -> bool
where
    F: FnOnce() -> Result<(), Diagnostic> + panic::UnwindSafe,
{
    let reporter = Rc::new(Reporter::new(std::io::stderr()));
    let previous = set_consumer(reporter.clone());
    let start = Instant::now();

    let result = pcall(move || {
        main()?;
        crate::scheduler::scheduler().run_with(&mut crate::io::BridgeReactor)
    });

    let ok = match &result {
        Ok(()) => true,
        Err(diagnostic) => {
            report_fatal(diagnostic, &*reporter);
            false
        }
    };

    if tracing_enabled() {
        match peak_memory_kb() {
            Some(kb) => println!("wrap: {:?} elapsed, {} KB peak memory", start.elapsed(), kb),
            None => println!("wrap: {:?} elapsed", start.elapsed()),
        }
    }

    set_consumer(previous);
    ok
}

/// Peak resident set size in KB, read from `/proc/self/status`'s `VmHWM`
/// field. `None` where that isn't available (non-Linux, or the field is
/// missing for some other reason) — there's no portable stdlib way to ask
/// the OS for this.
fn peak_memory_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status.lines().find_map(|line| {
        let rest = line.strip_prefix("VmHWM:")?;
        rest.trim().strip_suffix(" kB")?.trim().parse().ok()
    })
}

fn report_fatal(diagnostic: &Diagnostic, reporter: &Reporter<std::io::Stderr>) {
    if diagnostic.level() == Level::Fatal {
        reporter.consume(diagnostic);
    } else {
        report(diagnostic);
    }
    if diagnostic.kind() == "cli_error" {
        if let Some(crate::diagnostics::Value::Text(usage)) = diagnostic.decorator("usage") {
            eprintln!("{}", usage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Value;
    use std::cell::Cell as StdCell;
    use std::rc::Rc as StdRc;

    #[test]
    fn pcall_converts_panics() {
        let result: Result<(), Diagnostic> = pcall(|| panic!("kaboom"));
        let err = result.unwrap_err();
        assert_eq!(err.kind(), "runtime_error");
        assert!(err.message().contains("kaboom"));
    }

    #[test]
    fn pcall_passes_through_explicit_errors() {
        let result: Result<(), Diagnostic> =
            pcall(|| Err(Diagnostic::new("error: boom", Vec::<Value>::new())));
        assert_eq!(result.unwrap_err().message(), "boom");
    }

    #[test]
    fn check_error_raises_and_clears() {
        remember_last_error(Diagnostic::new("error: leftover", Vec::<Value>::new()));
        assert!(check_error().is_err());
        assert!(check_error().is_ok());
    }

    #[test]
    fn trace_runs_pre_and_post_when_enabled() {
        let calls = StdRc::new(StdCell::new(0));
        let calls2 = calls.clone();
        let was = set_tracing(true);
        let t = trace("start ${n}", "done ${n}", move |args| {
            calls2.set(calls2.get() + 1);
            args.iter().find(|(k, _)| *k == "n").map(|(_, v)| v.clone())
        });
        let result = t.call(&[("n", "42".to_owned())]);
        assert_eq!(result, Some("42".to_owned()));
        assert_eq!(calls.get(), 1);
        set_tracing(was);
    }

    #[test]
    fn wrap_reports_panics_as_runtime_error_and_fails() {
        let ok = wrap(|| {
            panic!("nope");
        });
        assert!(!ok);
    }

    #[test]
    fn wrap_succeeds_on_clean_return() {
        let ok = wrap(|| Ok(()));
        assert!(ok);
    }

    #[test]
    fn wrap_prints_timing_when_tracing_enabled_without_panicking() {
        let was = set_tracing(true);
        let ok = wrap(|| Ok(()));
        set_tracing(was);
        assert!(ok);
    }

    #[test]
    fn peak_memory_kb_is_none_or_positive() {
        // Best-effort: only meaningful on Linux, but must never panic.
        if let Some(kb) = peak_memory_kb() {
            assert!(kb > 0);
        }
    }
}
