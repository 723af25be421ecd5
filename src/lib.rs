//! A task-automation toolkit core: a cooperative single-threaded async
//! runtime, a memoizing task engine, a backpressure-aware streaming
//! pipeline, a structured diagnostics engine, and a scoped hierarchical
//! configuration store.
//!
//! - [Scheduler: fibers, futures, timers](scheduler)
//! - [Runtime entry point (`wrap`)](runtime)
//! - [Task engine: namespaces, memoized tasks, task sets](task)
//! - [Streams: Readable/Writable/Duplex/Transform](stream)
//! - [Glob matching and variable expansion](glob)
//! - [Diagnostics: leveled, lazily-interpolated errors](diagnostics)
//! - [Scoped configuration store](config)
//! - [File/OS bridges: `read_from`, `write_to`, `spawn`, `sh`](io)
//!
//! An embedding program's `main` calls [`runtime::wrap`], inside which it
//! submits work via [`scheduler::spawn`] or [`task::Namespace::task`]/
//! [`task::root`] and returns; `wrap` drives the scheduler to quiescence
//! and reports any fatal diagnostic before returning whether the run
//! succeeded.
pub mod config;
pub mod diagnostics;
pub mod glob;
pub mod io;
pub mod runtime;
pub mod scheduler;
pub mod stream;
pub mod task;

pub use diagnostics::Diagnostic;
pub use runtime::wrap;
