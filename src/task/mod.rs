//! The task engine: a hierarchical [`Namespace`] tree of named, memoized
//! tasks, plus [`TaskSet`] for running several together (§4.2 "Tasks").
//!
//! Grounded on `fiber/future.rs`'s executor (tasks are scheduled futures
//! driven to completion) and on `transaction.rs`'s begin/settle shape for
//! a task body's single entry, single settle point. Memoization and
//! cycle detection are this module's own addition: a task runs at most
//! once per (task, argument) pair, and every later request for that pair
//! joins the same in-flight (or already-settled) future. A task that
//! (directly or transitively) tries to run itself again with the same
//! argument while still running is rejected with a diagnostic instead of
//! deadlocking.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use crate::diagnostics::{Diagnostic, Value};
use crate::scheduler::{self, wait, wait_all, FiberId, LiftFuture};

/// A task's single argument (§3 "Task": "memoization table keyed by
/// argument (where the sentinel key represents 'no argument')"). Kept as
/// a small closed set of scalars, rather than an open `Any`-typed value,
/// so the memoization key is cheaply `Eq + Hash` and so that passing a
/// whole [`Namespace`] as an argument (the "method-style misuse" spec.md
/// calls out) simply doesn't type-check.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arg {
    /// The sentinel "no argument" key.
    None,
    Text(String),
    Int(i64),
    Bool(bool),
}

impl Default for Arg {
    fn default() -> Self {
        Arg::None
    }
}

impl std::fmt::Display for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::None => f.write_str("<none>"),
            Arg::Text(s) => f.write_str(s),
            Arg::Int(n) => write!(f, "{}", n),
            Arg::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<()> for Arg {
    fn from(_: ()) -> Self {
        Arg::None
    }
}
impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Text(s.to_owned())
    }
}
impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Text(s)
    }
}
impl From<i64> for Arg {
    fn from(n: i64) -> Self {
        Arg::Int(n)
    }
}
impl From<i32> for Arg {
    fn from(n: i32) -> Self {
        Arg::Int(n as i64)
    }
}
impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Arg::Bool(b)
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), Diagnostic>>>>;
type TaskBody = Rc<dyn Fn(Arg) -> TaskFuture>;

/// A registered task: its reusable body plus a memo table of the futures
/// it has been invoked with, one entry per distinct [`Arg`] (§3 "State
/// machine per (task, arg)").
struct TaskDef {
    body: TaskBody,
    memo: RefCell<HashMap<Arg, LiftFuture<()>>>,
}

struct Inner {
    name: String,
    parent: Option<Namespace>,
    children: RefCell<HashMap<String, Namespace>>,
    tasks: RefCell<HashMap<String, TaskDef>>,
}

/// A node in the task namespace tree. Cheap to clone; clones refer to the
/// same namespace.
#[derive(Clone)]
pub struct Namespace {
    inner: Rc<Inner>,
}

thread_local! {
    static ROOT: Namespace = Namespace::new_root();
    // Per-fiber call ancestry: the chain of (qualified task name, arg)
    // pairs still in flight *above* a given task-body fiber, keyed by
    // that fiber's id (§4.2 "Cycle detection"). Scoped to the calling
    // fiber's own ancestry rather than a single flat "everything
    // currently running" set, so two unrelated callers joining the same
    // in-flight task never see each other's branch as a cycle.
    static FIBER_ANCESTRY: RefCell<HashMap<FiberId, Rc<Vec<(String, Arg)>>>> =
        RefCell::new(HashMap::new());
}

/// Removes a fiber's ancestry entry once its task body has settled (or
/// been aborted); the `Cell` is filled in right after `spawn` returns,
/// before the fiber can possibly be polled, so `drop` always sees the
/// fiber's own id.
struct AncestryGuard(Rc<Cell<Option<FiberId>>>);

impl Drop for AncestryGuard {
    fn drop(&mut self) {
        if let Some(id) = self.0.get() {
            FIBER_ANCESTRY.with(|m| {
                m.borrow_mut().remove(&id);
            });
        }
    }
}

/// The process-wide (thread-local) root namespace.
pub fn root() -> Namespace {
    ROOT.with(|r| r.clone())
}

impl Namespace {
    fn new_root() -> Self {
        Namespace {
            inner: Rc::new(Inner {
                name: String::new(),
                parent: None,
                children: RefCell::new(HashMap::new()),
                tasks: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Returns the child namespace named `name`, creating it on first
    /// access.
    pub fn child(&self, name: &str) -> Namespace {
        if let Some(existing) = self.inner.children.borrow().get(name) {
            return existing.clone();
        }
        let child = Namespace {
            inner: Rc::new(Inner {
                name: name.to_owned(),
                parent: Some(self.clone()),
                children: RefCell::new(HashMap::new()),
                tasks: RefCell::new(HashMap::new()),
            }),
        };
        self.inner
            .children
            .borrow_mut()
            .insert(name.to_owned(), child.clone());
        child
    }

    /// The dotted path from the root namespace down to `name`, e.g.
    /// `"build.assets.minify"`.
    pub fn qualified_name(&self, name: &str) -> String {
        let mut parts = Vec::new();
        let mut current = Some(self.clone());
        while let Some(ns) = current {
            if !ns.inner.name.is_empty() {
                parts.push(ns.inner.name.clone());
            }
            current = ns.inner.parent.clone();
        }
        parts.reverse();
        parts.push(name.to_owned());
        parts.join(".")
    }

    /// Registers `body` as the task named `name`, after validating that
    /// `name` matches `[A-Za-z_][A-Za-z0-9_]*`. Construction-time
    /// redefinition under an invalid name is rejected rather than
    /// silently accepted. `body` is re-invoked (not re-used) once per
    /// distinct argument it's called with; it must not assume it runs
    /// only once.
    pub fn task<F, Fut>(&self, name: &str, body: F) -> Result<(), Diagnostic>
    where
        F: Fn(Arg) -> Fut + 'static,
        Fut: Future<Output = Result<(), Diagnostic>> + 'static,
    {
        validate_name(name)?;
        log::trace!("registered task '{}'", self.qualified_name(name));
        self.inner.tasks.borrow_mut().insert(
            name.to_owned(),
            TaskDef {
                body: Rc::new(move |arg| Box::pin(body(arg))),
                memo: RefCell::new(HashMap::new()),
            },
        );
        Ok(())
    }

    /// Returns the child namespace named `name`, after validating it
    /// against `[A-Za-z_][A-Za-z0-9_]*`, creating the namespace on first
    /// access.
    pub fn namespace(&self, name: &str) -> Result<Namespace, Diagnostic> {
        validate_name(name)?;
        Ok(self.child(name))
    }

    /// Runs the task named `name` with `arg` (or [`Arg::None`] for a
    /// nullary call), or joins its already-started (or already-settled)
    /// future for that exact argument if this is not the first request
    /// for the pair (§4.2 "Memoization key"). Returns an
    /// immediately-rejected future if `name` was never defined, or if
    /// running it now would form a cycle: the pair already appears in
    /// the *calling fiber's own* ancestry, not merely somewhere among
    /// every task body currently in flight.
    pub fn call(&self, name: &str, arg: impl Into<Arg>) -> LiftFuture<()> {
        let arg = arg.into();
        let qualified = self.qualified_name(name);

        let ancestry = scheduler::current_fiber()
            .and_then(|id| FIBER_ANCESTRY.with(|m| m.borrow().get(&id).cloned()))
            .unwrap_or_default();

        let cycle_path = ancestry
            .iter()
            .position(|(n, a)| n == &qualified && a == &arg)
            .map(|idx| {
                let mut names: Vec<&str> = ancestry[idx..].iter().map(|(n, _)| n.as_str()).collect();
                names.push(qualified.as_str());
                names.join(" -> ")
            });
        if let Some(path) = cycle_path {
            log::debug!("cycle detected in tasks: {}", path);
            return LiftFuture::failed(Diagnostic::new(
                "fatal: cycle detected in tasks: ${1}",
                vec![Value::from(path.as_str())],
            ));
        }

        let (body, resolver, future) = {
            let tasks = self.inner.tasks.borrow();
            let def = match tasks.get(name) {
                Some(def) => def,
                None => {
                    return LiftFuture::failed(Diagnostic::new(
                        "task_error: no task named '${1}'",
                        vec![Value::from(qualified.as_str())],
                    ))
                }
            };
            let mut memo = def.memo.borrow_mut();
            if let Some(existing) = memo.get(&arg) {
                return existing.clone();
            }
            let (future, resolver) = LiftFuture::pending();
            memo.insert(arg.clone(), future.clone());
            (def.body.clone(), resolver, future)
        };

        let mut child_ancestry = (*ancestry).clone();
        child_ancestry.push((qualified, arg.clone()));
        let child_ancestry = Rc::new(child_ancestry);

        let run_arg = arg;
        let id_slot: Rc<Cell<Option<FiberId>>> = Rc::new(Cell::new(None));
        let id_slot_body = id_slot.clone();
        let fiber_id = scheduler::spawn(async move {
            let _guard = AncestryGuard(id_slot_body);
            let result = body(run_arg).await;
            match result {
                Ok(()) => resolver.fulfill(()),
                Err(diagnostic) => resolver.reject(diagnostic),
            }
        });
        id_slot.set(Some(fiber_id));
        FIBER_ANCESTRY.with(|m| {
            m.borrow_mut().insert(fiber_id, child_ancestry);
        });

        future
    }

    /// Runs the task named `name` with no argument ([`Arg::None`]).
    pub fn run(&self, name: &str) -> LiftFuture<()> {
        self.call(name, Arg::None)
    }

    /// Awaits the task named `name`, called with no argument, to
    /// completion.
    pub async fn wait_for(&self, name: &str) -> Result<Rc<()>, Diagnostic> {
        wait(self.run(name)).await
    }

    /// Awaits the task named `name`, called with `arg`, to completion.
    pub async fn wait_for_arg(&self, name: &str, arg: impl Into<Arg>) -> Result<Rc<()>, Diagnostic> {
        wait(self.call(name, arg)).await
    }
}

fn validate_name(name: &str) -> Result<(), Diagnostic> {
    let valid = matches!(name.chars().next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(Diagnostic::new(
            "task_error: invalid task or namespace name '${1}'",
            vec![Value::from(name)],
        ))
    }
}

/// A batch of task invocations to run together, all with the same
/// argument (§4.2 "Task-sets": "calling the set with `arg` starts all
/// `Ti(arg)` concurrently").
pub struct TaskSet {
    futures: Vec<LiftFuture<()>>,
}

impl TaskSet {
    /// An empty set; build it up with [`add`](Self::add)/[`add_arg`](Self::add_arg).
    pub fn empty() -> Self {
        TaskSet { futures: Vec::new() }
    }

    /// Builds a set from a list of `(namespace, task name)` handles,
    /// starting (or joining) each immediately with no argument.
    pub fn new(tasks: &[(&Namespace, &str)]) -> Self {
        let mut set = Self::empty();
        for (namespace, name) in tasks {
            set.add(namespace, name);
        }
        set
    }

    /// Builds a set from a list of `(namespace, task name)` handles,
    /// starting (or joining) each immediately with the same `arg`.
    pub fn new_with_arg(tasks: &[(&Namespace, &str)], arg: impl Into<Arg>) -> Self {
        let arg = arg.into();
        let mut set = Self::empty();
        for (namespace, name) in tasks {
            set.add_arg(namespace, name, arg.clone());
        }
        set
    }

    /// Starts (or joins) the task named `name` in `namespace` with no
    /// argument and adds it to this set.
    pub fn add(&mut self, namespace: &Namespace, name: &str) -> &mut Self {
        self.futures.push(namespace.run(name));
        self
    }

    /// Starts (or joins) the task named `name` in `namespace` with `arg`
    /// and adds it to this set.
    pub fn add_arg(&mut self, namespace: &Namespace, name: &str, arg: impl Into<Arg>) -> &mut Self {
        self.futures.push(namespace.call(name, arg));
        self
    }

    /// Awaits every task in the set. A single failing task's diagnostic
    /// is returned as-is; more than one failure is aggregated under a
    /// `task_error` parent (§4.4 "aggregation").
    pub async fn join(self) -> Result<(), Diagnostic> {
        wait_all(self.futures).await.map(|_| ())
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::scheduler;
    use std::cell::Cell;

    #[test]
    fn task_runs_once_and_is_memoized() {
        let sched = scheduler();
        let ns = Namespace::new_root();
        let runs = Rc::new(Cell::new(0));
        let runs2 = runs.clone();
        ns.task("build", move |_arg| {
            let runs = runs2.clone();
            async move {
                runs.set(runs.get() + 1);
                Ok(())
            }
        })
        .unwrap();

        let a = Rc::new(Cell::new(false));
        let b = Rc::new(Cell::new(false));
        let (a2, b2) = (a.clone(), b.clone());
        let ns2 = ns.clone();
        sched.spawn(async move {
            ns2.wait_for("build").await.unwrap();
            a2.set(true);
        });
        let ns3 = ns.clone();
        sched.spawn(async move {
            ns3.wait_for("build").await.unwrap();
            b2.set(true);
        });
        sched.run().unwrap();

        assert_eq!(runs.get(), 1);
        assert!(a.get() && b.get());
    }

    #[test]
    fn concurrent_unrelated_callers_join_a_suspended_task_without_a_spurious_cycle() {
        // `shared`'s body suspends mid-flight (unlike every other task in
        // this suite), so by the time the second, unrelated caller below
        // runs, `shared`'s fiber has already pushed its own ancestry entry
        // and is parked on the timer. Both fibers are spawned before the
        // single `run()` call, so the scheduler polls fiber one (which
        // spawns and partially drains `shared`'s fiber) before fiber two,
        // reproducing the ordering a flat "everything in flight" stack
        // would have misread as a cycle.
        let sched = scheduler();
        let ns = Namespace::new_root();
        let runs = Rc::new(Cell::new(0));
        let runs2 = runs.clone();
        ns.task("shared", move |_arg| {
            let runs = runs2.clone();
            async move {
                crate::scheduler::sleep(std::time::Duration::from_millis(5)).await;
                runs.set(runs.get() + 1);
                Ok(())
            }
        })
        .unwrap();

        let ns_a = ns.clone();
        let first_ok = Rc::new(Cell::new(None));
        let first_ok2 = first_ok.clone();
        sched.spawn(async move {
            first_ok2.set(Some(ns_a.wait_for("shared").await.is_ok()));
        });

        let ns_b = ns.clone();
        let second_ok = Rc::new(Cell::new(None));
        let second_ok2 = second_ok.clone();
        sched.spawn(async move {
            second_ok2.set(Some(ns_b.wait_for("shared").await.is_ok()));
        });

        sched.run().unwrap();

        assert_eq!(first_ok.get(), Some(true));
        assert_eq!(second_ok.get(), Some(true));
        assert_eq!(runs.get(), 1, "body must still run exactly once");
    }

    #[test]
    fn memoization_is_keyed_by_argument() {
        let sched = scheduler();
        let ns = Namespace::new_root();
        let runs: Rc<RefCell<Vec<Arg>>> = Rc::new(RefCell::new(Vec::new()));
        let runs2 = runs.clone();
        ns.task("build", move |arg| {
            let runs = runs2.clone();
            async move {
                runs.borrow_mut().push(arg);
                Ok(())
            }
        })
        .unwrap();

        let ns2 = ns.clone();
        sched.spawn(async move {
            ns2.wait_for_arg("build", "a").await.unwrap();
            ns2.wait_for_arg("build", "a").await.unwrap();
            ns2.wait_for_arg("build", "b").await.unwrap();
        });
        sched.run().unwrap();

        assert_eq!(*runs.borrow(), vec![Arg::from("a"), Arg::from("b")]);
    }

    #[test]
    fn undefined_task_rejects() {
        let sched = scheduler();
        let ns = Namespace::new_root();
        let failed = Rc::new(Cell::new(false));
        let failed2 = failed.clone();
        sched.spawn(async move {
            if ns.wait_for("missing").await.is_err() {
                failed2.set(true);
            }
        });
        sched.run().unwrap();
        assert!(failed.get());
    }

    #[test]
    fn self_dependency_is_rejected_not_deadlocked() {
        let sched = scheduler();
        let ns = Namespace::new_root();
        let ns_def = ns.clone();
        ns.task("cyclic", move |_arg| {
            let ns = ns_def.clone();
            async move { ns.wait_for("cyclic").await.map(|_| ()) }
        })
        .unwrap();
        let failed = Rc::new(Cell::new(false));
        let failed2 = failed.clone();
        sched.spawn(async move {
            if ns.wait_for("cyclic").await.is_err() {
                failed2.set(true);
            }
        });
        sched.run().unwrap();
        assert!(failed.get());
    }

    #[test]
    fn mutual_cycle_between_two_tasks_is_rejected() {
        let sched = scheduler();
        let ns = Namespace::new_root();
        let ns_a = ns.clone();
        ns.task("a", move |_arg| {
            let ns = ns_a.clone();
            async move { ns.wait_for("b").await.map(|_| ()) }
        })
        .unwrap();
        let ns_b = ns.clone();
        ns.task("b", move |_arg| {
            let ns = ns_b.clone();
            async move { ns.wait_for("a").await.map(|_| ()) }
        })
        .unwrap();
        let message = Rc::new(RefCell::new(String::new()));
        let message2 = message.clone();
        sched.spawn(async move {
            if let Err(diagnostic) = ns.wait_for("a").await {
                *message2.borrow_mut() = diagnostic.message();
            }
        });
        sched.run().unwrap();
        assert_eq!(*message.borrow(), "cycle detected in tasks: a -> b -> a");
    }

    #[test]
    fn task_set_joins_multiple_tasks() {
        let sched = scheduler();
        let ns = Namespace::new_root();
        ns.task("a", |_| async { Ok(()) }).unwrap();
        ns.task("b", |_| async { Ok(()) }).unwrap();
        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        let ns2 = ns.clone();
        sched.spawn(async move {
            let mut set = TaskSet::empty();
            set.add(&ns2, "a").add(&ns2, "b");
            if set.join().await.is_ok() {
                done2.set(true);
            }
        });
        sched.run().unwrap();
        assert!(done.get());
    }

    #[test]
    fn task_set_new_builds_from_a_handle_list() {
        let sched = scheduler();
        let ns = Namespace::new_root();
        ns.task("a", |_| async { Ok(()) }).unwrap();
        ns.task("b", |_| async { Ok(()) }).unwrap();
        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        let ns2 = ns.clone();
        sched.spawn(async move {
            let set = TaskSet::new(&[(&ns2, "a"), (&ns2, "b")]);
            if set.join().await.is_ok() {
                done2.set(true);
            }
        });
        sched.run().unwrap();
        assert!(done.get());
    }

    #[test]
    fn task_set_new_with_arg_forwards_the_same_argument() {
        let sched = scheduler();
        let ns = Namespace::new_root();
        let seen: Rc<RefCell<Vec<Arg>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_a = seen.clone();
        ns.task("a", move |arg| {
            let seen = seen_a.clone();
            async move {
                seen.borrow_mut().push(arg);
                Ok(())
            }
        })
        .unwrap();
        let seen_b = seen.clone();
        ns.task("b", move |arg| {
            let seen = seen_b.clone();
            async move {
                seen.borrow_mut().push(arg);
                Ok(())
            }
        })
        .unwrap();
        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        let ns2 = ns.clone();
        sched.spawn(async move {
            let set = TaskSet::new_with_arg(&[(&ns2, "a"), (&ns2, "b")], "release");
            if set.join().await.is_ok() {
                done2.set(true);
            }
        });
        sched.run().unwrap();
        assert!(done.get());
        assert_eq!(seen.borrow().len(), 2);
        assert!(seen.borrow().iter().all(|a| *a == Arg::from("release")));
    }

    #[test]
    fn task_set_aggregates_a_single_failure_without_wrapping() {
        let sched = scheduler();
        let ns = Namespace::new_root();
        ns.task("ok", |_| async { Ok(()) }).unwrap();
        ns.task("fail", |_| async {
            Err(Diagnostic::new("error: boom", Vec::<Value>::new()))
        })
        .unwrap();
        let message = Rc::new(RefCell::new(String::new()));
        let message2 = message.clone();
        let ns2 = ns.clone();
        sched.spawn(async move {
            let set = TaskSet::new(&[(&ns2, "ok"), (&ns2, "fail")]);
            if let Err(d) = set.join().await {
                *message2.borrow_mut() = d.message();
            }
        });
        sched.run().unwrap();
        assert_eq!(*message.borrow(), "boom");
    }

    #[test]
    fn task_name_validation_rejects_bad_identifiers() {
        let ns = Namespace::new_root();
        assert!(ns.task("1bad", |_| async { Ok(()) }).is_err());
        assert!(ns.namespace("bad-name").is_err());
        assert!(ns.task("good_name", |_| async { Ok(()) }).is_ok());
        assert!(ns.namespace("good_name2").is_ok());
    }
}
