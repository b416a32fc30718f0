// Copyright (c) The taskcheck Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution of check commands.
//!
//! [`ScriptExecutor`] is the contract the runner drives checks through; the
//! production implementation is [`ProcessExecutor`], which shells out via
//! `tokio::process`. An invocation deliberately offers no cancel path: the
//! only wall-clock bound on it is the timeout it was given, and any process
//! it spawns is its own to clean up.

use crate::errors::ExecError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{process::Stdio, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{ChildStderr, ChildStdout, Command},
};
use tracing::debug;

/// The result of one check invocation.
#[derive(Clone, Debug)]
pub struct ExecOutcome {
    /// Captured output. Implementations may bound its length; see
    /// [`ProcessExecutor`].
    pub output: Bytes,

    /// The command's exit code. Negative when the command did not exit on
    /// its own.
    pub exit_code: i32,

    /// The execution error, if the executor reported a problem.
    pub err: Option<ExecError>,
}

impl ExecOutcome {
    /// An outcome for a command that ran to completion.
    pub fn exited(output: Bytes, exit_code: i32) -> Self {
        Self {
            output,
            exit_code,
            err: None,
        }
    }

    /// An outcome for an invocation that failed with `err`.
    pub fn failed(output: Bytes, err: ExecError) -> Self {
        Self {
            output,
            exit_code: -1,
            err: Some(err),
        }
    }

    /// Returns true if the invocation ran out of its allotted timeout.
    pub fn deadline_exceeded(&self) -> bool {
        self.err
            .as_ref()
            .is_some_and(ExecError::is_deadline_exceeded)
    }
}

/// Runs one command with a deadline and captures what it printed.
///
/// Implementations must be safe for concurrent use: every check runner holds
/// the executor behind an [`Arc`] and invokes it from its own task. There is
/// no cancel path by design; callers that stop caring about an invocation
/// simply stop awaiting it, and the invocation finishes on its own.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Runs `command` with `args`, returning within approximately `timeout`
    /// of the start or reporting [`ExecError::DeadlineExceeded`].
    async fn exec(&self, timeout: Duration, command: &str, args: &[String]) -> ExecOutcome;
}

/// The `tokio::process`-backed [`ScriptExecutor`].
///
/// stdout and stderr are captured into one combined buffer, bounded at
/// [`DEFAULT_OUTPUT_LIMIT`](Self::DEFAULT_OUTPUT_LIMIT) bytes. Output past
/// the bound is read and discarded so the child never wedges on a full pipe.
/// On deadline the child is killed best-effort and reaped in the background;
/// a grandchild that survives the kill is not this executor's problem.
#[derive(Clone, Debug)]
pub struct ProcessExecutor {
    output_limit: usize,
}

impl ProcessExecutor {
    /// The default bound on captured output.
    pub const DEFAULT_OUTPUT_LIMIT: usize = 4 * 1024;

    /// How long to keep draining the pipes after the child exits.
    /// Grandchildren holding the write ends open past this are abandoned.
    const DRAIN_GRACE: Duration = Duration::from_millis(100);

    /// Creates an executor with the default output bound.
    pub fn new() -> Self {
        Self {
            output_limit: Self::DEFAULT_OUTPUT_LIMIT,
        }
    }

    /// Creates an executor that captures at most `output_limit` bytes.
    pub fn with_output_limit(output_limit: usize) -> Self {
        Self { output_limit }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptExecutor for ProcessExecutor {
    async fn exec(&self, timeout: Duration, command: &str, args: &[String]) -> ExecOutcome {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) => {
                return ExecOutcome::failed(Bytes::new(), ExecError::Spawn(Arc::new(error)));
            }
        };

        let mut acc = OutputAccumulator::new(
            child.stdout.take(),
            child.stderr.take(),
            self.output_limit,
        );

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let res = loop {
            tokio::select! {
                () = acc.fill_buf(), if !acc.is_done() => {}
                res = child.wait() => break res,
                () = &mut deadline => {
                    // There's a race between killing a slow command and its
                    // own exit, so the error is ignored. The background task
                    // reaps whatever is left.
                    let _ = child.start_kill();
                    tokio::spawn(async move {
                        let _ = child.wait().await;
                    });
                    return ExecOutcome::failed(acc.freeze(), ExecError::DeadlineExceeded);
                }
            }
        };

        // The child has exited; drain whatever is still buffered in the
        // pipes. A grandchild holding the write ends open can stall this,
        // hence the grace period.
        let _ = tokio::time::timeout(Self::DRAIN_GRACE, acc.drain()).await;

        match res {
            Ok(status) => {
                let code = exit_code(status);
                debug!(exit_code = code, "command exited");
                ExecOutcome::exited(acc.freeze(), code)
            }
            Err(error) => ExecOutcome::failed(acc.freeze(), ExecError::Wait(Arc::new(error))),
        }
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    // A signal-killed child reports no code; mirror the shell's 128+N.
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// The size of each buffered reader's buffer.
///
/// This size is not totally arbitrary, but rather the (normal) page size on
/// most systems.
const CHUNK_SIZE: usize = 4 * 1024;

/// A `BufReader` over one child pipe that remembers having reached EOF (or a
/// read error), so it can be polled past completion.
struct FusedReader<R> {
    reader: BufReader<R>,
    done: bool,
}

impl<R: AsyncRead + Unpin> FusedReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(CHUNK_SIZE, reader),
            done: false,
        }
    }

    async fn fill_buf(&mut self, acc: &mut BoundedBuf) {
        if !self.done {
            match self.reader.fill_buf().await {
                Ok(buf) => {
                    if buf.is_empty() {
                        self.done = true;
                    }
                    acc.push(buf);
                    let len = buf.len();
                    self.reader.consume(len);
                }
                // A read error ends capture for this pipe.
                Err(_) => self.done = true,
            }
        }
    }
}

/// A version of [`FusedReader::fill_buf`] that works with an
/// `Option<FusedReader>`.
async fn fill_buf_opt<R: AsyncRead + Unpin>(
    reader: Option<&mut FusedReader<R>>,
    acc: &mut BoundedBuf,
) {
    if let Some(reader) = reader {
        reader.fill_buf(acc).await;
    }
}

/// A version of "is this reader done" that works with an
/// `Option<FusedReader>`.
fn is_done_opt<R: AsyncRead + Unpin>(reader: &Option<FusedReader<R>>) -> bool {
    reader.as_ref().is_none_or(|r| r.done)
}

/// A buffer that stops growing at its limit but keeps accepting (and
/// discarding) input.
struct BoundedBuf {
    buf: BytesMut,
    limit: usize,
}

impl BoundedBuf {
    fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(CHUNK_SIZE.min(limit)),
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let take = chunk.len().min(self.limit.saturating_sub(self.buf.len()));
        self.buf.extend_from_slice(&chunk[..take]);
    }
}

/// Collects the combined output of a child process's stdout and stderr.
struct OutputAccumulator {
    stdout: Option<FusedReader<ChildStdout>>,
    stderr: Option<FusedReader<ChildStderr>>,
    stdout_buf: BoundedBuf,
    stderr_buf: BoundedBuf,
    limit: usize,
}

impl OutputAccumulator {
    fn new(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>, limit: usize) -> Self {
        Self {
            stdout: stdout.map(FusedReader::new),
            stderr: stderr.map(FusedReader::new),
            stdout_buf: BoundedBuf::new(limit),
            stderr_buf: BoundedBuf::new(limit),
            limit,
        }
    }

    fn is_done(&self) -> bool {
        is_done_opt(&self.stdout) && is_done_opt(&self.stderr)
    }

    /// Makes progress on whichever pipe has data available. Cancel-safe,
    /// since the underlying `fill_buf` operation is cancel-safe.
    async fn fill_buf(&mut self) {
        tokio::select! {
            () = fill_buf_opt(self.stdout.as_mut(), &mut self.stdout_buf), if !is_done_opt(&self.stdout) => {}
            () = fill_buf_opt(self.stderr.as_mut(), &mut self.stderr_buf), if !is_done_opt(&self.stderr) => {}
            else => {}
        }
    }

    /// Reads until both pipes reach EOF.
    async fn drain(&mut self) {
        while !self.is_done() {
            self.fill_buf().await;
        }
    }

    /// Returns what was captured so far: stdout first, then stderr, bounded
    /// by the limit. Interleaving between the two streams is not preserved.
    fn freeze(&mut self) -> Bytes {
        let mut combined = self.stdout_buf.buf.split();
        let stderr = self.stderr_buf.buf.split();
        let take = stderr.len().min(self.limit.saturating_sub(combined.len()));
        combined.extend_from_slice(&stderr[..take]);
        combined.freeze()
    }
}
