//! File and subprocess bridges (§6 "External interfaces" / "File/OS
//! bridges"): `read_from`, `write_to`, `spawn`, `sh`.
//!
//! These wrap blocking OS calls (`std::fs::File`, `std::process::Command`)
//! dispatched to a dedicated helper thread per operation, and bridge their
//! completions back onto the scheduler through [`BridgeReactor`], a
//! [`Reactor`] that polls a thread-local registry of pending operations in
//! addition to the timer wheel. This is a simplified stand-in for a real
//! edge-triggered event loop: true edge-triggered wakeup would need a
//! bundled libuv/mio-style reactor, which is out of scope for this core
//! crate (§2).
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use futures::join;

use crate::diagnostics::{report, Diagnostic, Value};
use crate::scheduler::{wait, LiftFuture, Reactor};
use crate::stream::array::to_array;
use crate::stream::{
    Chunk, Queue, Readable, ReadableStream, Writable, WritableStream, DEFAULT_HIGH_WATER_MARK,
};

const DEFAULT_CHUNK_BYTES: usize = 16384;

/// A message handed from a helper thread back to the main thread. Plain
/// data only (no `Rc`/`Diagnostic` payloads): those types are thread-
/// confined, so the `Diagnostic` itself is built on the receiving side.
enum Completion {
    Chunk(Chunk),
    Eof,
    ReadError(String),
    WriteError(String),
}

/// Internal adapter letting this module push into / pull from a [`Queue`]
/// without exposing write access on [`ReadableStream`] or read access on
/// [`WritableStream`] to callers.
struct QueueWriteSide(Rc<Queue>);
impl Writable for QueueWriteSide {
    fn queue(&self) -> &Rc<Queue> {
        &self.0
    }
}

struct QueueReadSide(Rc<Queue>);
impl Readable for QueueReadSide {
    fn queue(&self) -> &Rc<Queue> {
        &self.0
    }
}

type Handler = Box<dyn FnMut(Completion) -> bool>;

struct PendingOp {
    rx: Receiver<Completion>,
    handle: Handler,
}

type Poller = Box<dyn FnMut() -> bool>;

thread_local! {
    static PENDING: RefCell<Vec<PendingOp>> = RefCell::new(Vec::new());
    // Operations with no natural channel to block on (process exit, polled
    // via `Child::try_wait` so the `Child` never has to cross a thread).
    // A poller returns `true` once it has settled and can be dropped.
    static POLLERS: RefCell<Vec<Poller>> = RefCell::new(Vec::new());
}

fn register(rx: Receiver<Completion>, handle: impl FnMut(Completion) -> bool + 'static) {
    PENDING.with(|p| {
        p.borrow_mut().push(PendingOp {
            rx,
            handle: Box::new(handle),
        })
    });
}

/// A single-shot completion: fulfills after exactly one [`Completion`]
/// (the common case for spawn failure / stream finish).
fn register_once(rx: Receiver<Completion>, mut handle: impl FnMut(Completion) + 'static) {
    register(rx, move |c| {
        handle(c);
        true
    });
}

fn register_poll(poll: impl FnMut() -> bool + 'static) {
    POLLERS.with(|p| p.borrow_mut().push(Box::new(poll)));
}

/// A [`Reactor`] that drains the pending file/process bridge operations in
/// addition to waiting on the timer wheel. Programs that use `read_from`,
/// `write_to`, `spawn` or `sh` must drive the scheduler with
/// `scheduler().run_with(&mut BridgeReactor)` instead of plain `run()`.
pub struct BridgeReactor;

impl Reactor for BridgeReactor {
    fn turn(&mut self, timeout: Duration) {
        let mut progressed = false;

        PENDING.with(|p| {
            let mut ops = p.borrow_mut();
            ops.retain_mut(|op| {
                let mut keep = true;
                loop {
                    match op.rx.try_recv() {
                        Ok(completion) => {
                            progressed = true;
                            if !(op.handle)(completion) {
                                keep = false;
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            keep = false;
                            break;
                        }
                    }
                    if !keep {
                        break;
                    }
                }
                keep
            });
        });

        POLLERS.with(|p| {
            let mut pollers = p.borrow_mut();
            let before = pollers.len();
            pollers.retain_mut(|poll| !poll());
            if pollers.len() != before {
                progressed = true;
            }
        });

        let remaining =
            PENDING.with(|p| !p.borrow().is_empty()) || POLLERS.with(|p| !p.borrow().is_empty());

        if !progressed {
            let wait_for = if remaining {
                timeout.min(Duration::from_millis(5))
            } else {
                timeout
            };
            if !wait_for.is_zero() {
                thread::sleep(wait_for);
            }
        }
    }
}

fn io_diagnostic(kind: &str, message: &str) -> Diagnostic {
    Diagnostic::new(
        &format!("{}: ${{1}}", kind),
        vec![Value::from(message.to_owned())],
    )
}

/// Opens `path` and streams it in `chunk_bytes`-sized pieces, reading on a
/// dedicated helper thread. Read errors end the stream and are reported
/// through the diagnostics consumer rather than surfaced on the stream
/// itself — the stream protocol (§4.3) has no error channel of its own.
pub fn read_from(path: impl AsRef<Path>, chunk_bytes: usize) -> Rc<ReadableStream> {
    let stream = ReadableStream::new(DEFAULT_HIGH_WATER_MARK);
    let queue = stream.queue().clone();
    let path = path.as_ref().to_path_buf();
    let chunk_bytes = chunk_bytes.max(1);
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let result = (|| -> io::Result<()> {
            let mut file = std::fs::File::open(&path)?;
            let mut buf = vec![0u8; chunk_bytes];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                if tx.send(Completion::Chunk(buf[..n].to_vec())).is_err() {
                    return Ok(());
                }
            }
            Ok(())
        })();
        let _ = match result {
            Ok(()) => tx.send(Completion::Eof),
            Err(e) => tx.send(Completion::ReadError(e.to_string())),
        };
    });

    register(rx, move |completion| {
        let side = QueueWriteSide(queue.clone());
        match completion {
            Completion::Chunk(chunk) => {
                side.write(chunk);
                false
            }
            Completion::Eof => {
                side.end();
                true
            }
            Completion::ReadError(message) => {
                report(&io_diagnostic("runtime_error", &message));
                side.end();
                true
            }
            _ => true,
        }
    });

    stream
}

/// Creates (truncating) `path` and writes every chunk pushed to the
/// returned stream, on a dedicated helper thread. Write errors are
/// reported through the diagnostics consumer.
pub fn write_to(path: impl AsRef<Path>) -> Rc<WritableStream> {
    let stream = WritableStream::new(DEFAULT_HIGH_WATER_MARK);
    let path = path.as_ref().to_path_buf();
    let (chunk_tx, chunk_rx) = mpsc::channel::<Option<Chunk>>();
    let (done_tx, done_rx) = mpsc::channel();

    thread::spawn(move || {
        let result = (|| -> io::Result<()> {
            let mut file = std::fs::File::create(&path)?;
            while let Ok(Some(chunk)) = chunk_rx.recv() {
                file.write_all(&chunk)?;
            }
            Ok(())
        })();
        let _ = match result {
            Ok(()) => done_tx.send(Completion::Eof),
            Err(e) => done_tx.send(Completion::WriteError(e.to_string())),
        };
    });

    let reader = QueueReadSide(stream.queue().clone());
    crate::scheduler::spawn(async move {
        loop {
            match reader.read_async().await {
                Some(chunk) => {
                    if chunk_tx.send(Some(chunk)).is_err() {
                        break;
                    }
                }
                None => {
                    let _ = chunk_tx.send(None);
                    break;
                }
            }
        }
    });

    register_once(done_rx, |completion| {
        if let Completion::WriteError(message) = completion {
            report(&io_diagnostic("runtime_error", &message));
        }
    });

    stream
}

fn pump_reader_thread(mut reader: impl Read + Send + 'static, queue: Rc<Queue>) {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = vec![0u8; DEFAULT_CHUNK_BYTES];
        let result = loop {
            match reader.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if tx.send(Completion::Chunk(buf[..n].to_vec())).is_err() {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        let _ = match result {
            Ok(()) => tx.send(Completion::Eof),
            Err(e) => tx.send(Completion::ReadError(e.to_string())),
        };
    });
    register(rx, move |completion| {
        let side = QueueWriteSide(queue.clone());
        match completion {
            Completion::Chunk(chunk) => {
                side.write(chunk);
                false
            }
            Completion::Eof => {
                side.end();
                true
            }
            Completion::ReadError(message) => {
                report(&io_diagnostic("subprocess_error", &message));
                side.end();
                true
            }
            _ => true,
        }
    });
}

/// How a child's standard stream is wired up (§6 "stdio options"). `Fd`
/// is omitted: the crates this workspace carries offer no portable way to
/// adopt a raw descriptor into `std::process::Stdio` without pulling in
/// `libc`; programs needing that should open the descriptor themselves
/// with the `std::os::unix::io` traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioOption {
    Pipe,
    Ignore,
    Inherit,
}

impl Default for StdioOption {
    fn default() -> Self {
        StdioOption::Pipe
    }
}

fn to_stdio(option: StdioOption) -> Stdio {
    match option {
        StdioOption::Pipe => Stdio::piped(),
        StdioOption::Ignore => Stdio::null(),
        StdioOption::Inherit => Stdio::inherit(),
    }
}

/// Options for [`spawn`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: StdioOption,
    pub stdout: StdioOption,
    pub stderr: StdioOption,
}

impl SpawnOptions {
    pub fn new(program: impl Into<String>) -> Self {
        SpawnOptions {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// A spawned child process's exit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running (or exited) child process and its wired-up stdio streams.
pub struct ProcessHandle {
    pid: u32,
    pub stdin: Option<Rc<WritableStream>>,
    pub stdout: Rc<ReadableStream>,
    pub stderr: Rc<ReadableStream>,
    exit: LiftFuture<ExitStatus>,
    child: Rc<RefCell<Option<Child>>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Awaits process exit.
    pub async fn wait(&self) -> Result<ExitStatus, Diagnostic> {
        wait(self.exit.clone()).await.map(|rc| *rc)
    }

    /// Registers `callback` to run once the process has exited.
    pub fn on_exit(&self, callback: impl FnOnce(Result<ExitStatus, Diagnostic>) + 'static) {
        let exit = self.exit.clone();
        crate::scheduler::spawn(async move {
            let result = wait(exit).await.map(|rc| *rc);
            callback(result);
        });
    }

    /// Terminates the process if it hasn't already exited. Only
    /// unconditional termination is supported (no custom signal delivery
    /// — see [`StdioOption`]'s doc comment for why `libc` was not
    /// reintroduced for this).
    pub fn kill(&self) -> io::Result<()> {
        match self.child.borrow_mut().as_mut() {
            Some(child) => child.kill(),
            None => Ok(()),
        }
    }
}

/// Launches `opts.program`, wiring its stdio into streams per
/// `opts.stdin`/`stdout`/`stderr` (§6 "spawn").
pub fn spawn(opts: SpawnOptions) -> Result<Rc<ProcessHandle>, Diagnostic> {
    let mut command = Command::new(&opts.program);
    command.args(&opts.args);
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &opts.env {
        command.env(key, value);
    }
    command.stdin(to_stdio(opts.stdin));
    command.stdout(to_stdio(opts.stdout));
    command.stderr(to_stdio(opts.stderr));

    let mut child = command.spawn().map_err(|e| {
        Diagnostic::new(
            "subprocess_error: failed to spawn '${1}': ${2}",
            vec![Value::from(opts.program.clone()), Value::from(e.to_string())],
        )
    })?;
    let pid = child.id();

    let stdin_stream = if opts.stdin == StdioOption::Pipe {
        child.stdin.take().map(|child_stdin| {
            let stream = WritableStream::new(DEFAULT_HIGH_WATER_MARK);
            let reader = QueueReadSide(stream.queue().clone());
            let (tx, rx) = mpsc::channel::<Option<Chunk>>();
            thread::spawn(move || {
                let mut sink = child_stdin;
                while let Ok(Some(chunk)) = rx.recv() {
                    if sink.write_all(&chunk).is_err() {
                        break;
                    }
                }
            });
            crate::scheduler::spawn(async move {
                loop {
                    match reader.read_async().await {
                        Some(chunk) => {
                            if tx.send(Some(chunk)).is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = tx.send(None);
                            break;
                        }
                    }
                }
            });
            stream
        })
    } else {
        None
    };

    let stdout_stream = ReadableStream::new(DEFAULT_HIGH_WATER_MARK);
    if let Some(child_stdout) = child.stdout.take() {
        pump_reader_thread(child_stdout, stdout_stream.queue().clone());
    } else {
        QueueWriteSide(stdout_stream.queue().clone()).end();
    }

    let stderr_stream = ReadableStream::new(DEFAULT_HIGH_WATER_MARK);
    if let Some(child_stderr) = child.stderr.take() {
        pump_reader_thread(child_stderr, stderr_stream.queue().clone());
    } else {
        QueueWriteSide(stderr_stream.queue().clone()).end();
    }

    let (exit_future, resolver) = LiftFuture::pending();
    let child_cell = Rc::new(RefCell::new(Some(child)));
    register_poll({
        let child_cell = child_cell.clone();
        let mut resolver = Some(resolver);
        move || {
            let mut guard = child_cell.borrow_mut();
            let child = match guard.as_mut() {
                Some(child) => child,
                None => return true,
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    if let Some(resolver) = resolver.take() {
                        resolver.fulfill(ExitStatus {
                            code: status.code(),
                        });
                    }
                    *guard = None;
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    if let Some(resolver) = resolver.take() {
                        resolver.reject(Diagnostic::new(
                            "subprocess_error: ${1}",
                            vec![Value::from(e.to_string())],
                        ));
                    }
                    *guard = None;
                    true
                }
            }
        }
    });

    Ok(Rc::new(ProcessHandle {
        pid,
        stdin: stdin_stream,
        stdout: stdout_stream,
        stderr: stderr_stream,
        exit: exit_future,
        child: child_cell,
    }))
}

/// Runs `command` through `sh -c`, collecting its stdout/stderr to
/// completion and normalizing newlines to LF (§6 "sh").
pub async fn sh(command: &str) -> Result<(String, String), Diagnostic> {
    let opts = SpawnOptions {
        program: "sh".to_owned(),
        args: vec!["-c".to_owned(), command.to_owned()],
        stdin: StdioOption::Ignore,
        stdout: StdioOption::Pipe,
        stderr: StdioOption::Pipe,
        ..Default::default()
    };
    let handle = spawn(opts)?;

    let (stdout_chunks, stderr_chunks, status) = join!(
        to_array(&*handle.stdout),
        to_array(&*handle.stderr),
        handle.wait()
    );
    let status = status?;

    let stdout = normalize_newlines(&join_chunks(stdout_chunks));
    let stderr = normalize_newlines(&join_chunks(stderr_chunks));

    if status.success() {
        Ok((stdout, stderr))
    } else {
        Err(Diagnostic::new(
            "subprocess_error: command '${1}' exited with status ${2}",
            vec![
                Value::from(command.to_owned()),
                Value::from(status.code.unwrap_or(-1) as i64),
            ],
        ))
    }
}

fn join_chunks(chunks: Vec<Chunk>) -> String {
    let bytes: Vec<u8> = chunks.into_iter().flatten().collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}
