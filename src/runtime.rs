//! The crate's single entry point, tying the scheduler, diagnostics
//! pipeline, and configuration scope into one call (§6 "Driver entry
//! point"): global state lives behind an explicit runtime entry point
//! rather than scattered statics, and the single-threaded invariant is
//! documented at every thread-local that relies on it.
//!
//! There is deliberately no monolithic `Runtime` struct threaded through
//! every module; each subsystem (scheduler, diagnostics consumer/kind
//! registry, config root) already keeps its own thread-local singleton.
//! [`wrap`] is the one place that orchestrates them, mirroring
//! `fiber/async.rs`'s `block_on` as the async runtime's sole entry point.
use std::panic::UnwindSafe;

use crate::diagnostics::Diagnostic;

/// Runs `main`, then drives the scheduler to quiescence, reporting any
/// resulting diagnostic through a fresh console [`crate::diagnostics::
/// Reporter`]. Returns `true` if `main` and every scheduled fiber
/// completed without a `fatal`-level diagnostic.
///
/// `main` typically calls [`crate::scheduler::spawn`] to schedule work
/// and returns immediately; `wrap` owns running the scheduler afterwards.
pub fn wrap<F>(main: F) -> bool
where
    F: FnOnce() -> Result<(), Diagnostic> + UnwindSafe,
{
    crate::diagnostics::wrap(main)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_runs_spawned_fibers_to_completion() {
        use std::cell::Cell;
        use std::rc::Rc;

        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        let ok = wrap(move || {
            crate::scheduler::spawn(async move {
                ran2.set(true);
            });
            Ok(())
        });
        assert!(ok);
        assert!(ran.get());
    }
}
