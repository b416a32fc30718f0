// Copyright (c) The taskcheck Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    check::CheckSpec,
    errors::ExecError,
    executor::{ExecOutcome, ScriptExecutor},
    heartbeat::TtlReporter,
    shutdown::ShutdownSignal,
    status::{classify, heartbeat_output},
};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

/// Supervises one script health check.
///
/// A `CheckRunner` owns the parameters of a single check and, once
/// [`run`](Self::run), one worker task that repeatedly executes the check
/// and publishes the result as a TTL heartbeat. Runners are single-use:
/// `run` consumes the runner, so at most one worker exists per check.
///
/// The worker terminates when its handle requests cancellation or when the
/// shutdown broadcast fires. Shutdown guarantees exactly one more
/// check-and-publish cycle so the registry learns the check's terminal
/// status; cancellation guarantees nothing beyond a prompt exit.
pub struct CheckRunner {
    spec: CheckSpec,
    executor: Arc<dyn ScriptExecutor>,
    heartbeat: Arc<dyn TtlReporter>,
    shutdown: ShutdownSignal,
}

impl CheckRunner {
    /// Creates a runner for `spec`.
    ///
    /// # Panics
    ///
    /// Panics if the spec's interval or timeout is zero. Those are
    /// programmer errors; surfacing them here keeps them from turning into
    /// a worker that spins or a check that can never pass.
    pub fn new(
        spec: CheckSpec,
        executor: Arc<dyn ScriptExecutor>,
        heartbeat: Arc<dyn TtlReporter>,
        shutdown: ShutdownSignal,
    ) -> Self {
        assert!(
            !spec.interval.is_zero(),
            "check `{}` has a zero interval",
            spec.name,
        );
        assert!(
            !spec.timeout.is_zero(),
            "check `{}` has a zero timeout",
            spec.name,
        );
        Self {
            spec,
            executor,
            heartbeat,
            shutdown,
        }
    }

    /// Starts the worker and returns the handle used to stop and await it.
    ///
    /// The first check runs immediately; subsequent checks wait out the
    /// interval, measured from the end of the previous invocation. Must be
    /// called from within a tokio runtime.
    pub fn run(self) -> RunnerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let worker = Worker {
            spec: self.spec,
            executor: self.executor,
            heartbeat: self.heartbeat,
            shutdown: self.shutdown,
            cancel: cancel_rx,
        };
        tokio::spawn(async move {
            worker.run().await;
            done_tx.send_replace(true);
        });
        RunnerHandle {
            cancel: cancel_tx,
            done: done_rx,
        }
    }
}

/// Controls a running check worker.
///
/// Dropping the handle cancels the worker the same way
/// [`cancel`](Self::cancel) does.
#[derive(Debug)]
pub struct RunnerHandle {
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

impl RunnerHandle {
    /// Requests termination at the worker's next suspension point.
    ///
    /// Idempotent and non-blocking. An in-flight script is not aborted: the
    /// invocation keeps running on its own task, and any process it started
    /// remains the executor's to clean up.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Completes once the worker has fully released its resources.
    ///
    /// After this returns, no further heartbeat will be published on behalf
    /// of this check. May be awaited any number of times.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        // An error means the worker task is gone without flagging done;
        // either way it is finished.
        let _ = done.wait_for(|done| *done).await;
    }
}

struct Worker {
    spec: CheckSpec,
    executor: Arc<dyn ScriptExecutor>,
    heartbeat: Arc<dyn TtlReporter>,
    shutdown: ShutdownSignal,
    cancel: watch::Receiver<bool>,
}

impl Worker {
    #[instrument(
        level = "debug",
        name = "check_worker",
        skip(self),
        fields(
            check = %self.spec.name,
            task = %self.spec.task_name,
            alloc = %self.spec.allocation_id,
        ),
    )]
    async fn run(mut self) {
        // The first tick fires immediately; afterwards the timer waits out
        // the interval, measured from the end of the previous check.
        let mut next_tick = Duration::ZERO;
        loop {
            tokio::select! {
                // Biased so that a cancel raced against shutdown or an
                // elapsed timer wins deterministically.
                biased;
                () = cancel_requested(&mut self.cancel) => {
                    debug!("check cancelled");
                    break;
                }
                () = self.shutdown.fired() => {
                    // Fall through to one final check before exiting.
                }
                () = tokio::time::sleep(next_tick) => {}
            }
            next_tick = self.spec.interval;

            let Some(outcome) = self.execute().await else {
                // Cancelled mid-check. The abandoned invocation finishes on
                // its own task; nothing is published for it.
                debug!("check cancelled while executing");
                break;
            };

            self.publish(&outcome).await;

            if cancel_pending(&self.cancel) {
                debug!("check cancelled");
                break;
            }
            if self.shutdown.is_fired() {
                debug!("delivered final heartbeat, shutting down");
                break;
            }
        }
    }

    /// Runs one invocation of the check script.
    ///
    /// The invocation runs on its own task so that nothing here can abort
    /// it; the only wall-clock bound on it is the spec's timeout, enforced
    /// by the executor. Returns `None` if cancellation arrived while the
    /// invocation was in flight.
    async fn execute(&mut self) -> Option<ExecOutcome> {
        let stopwatch = crate::time::stopwatch();
        let executor = Arc::clone(&self.executor);
        let timeout = self.spec.timeout;
        let command = self.spec.command.clone();
        let args = self.spec.args.clone();
        let invocation =
            tokio::spawn(async move { executor.exec(timeout, &command, &args).await });

        let outcome = tokio::select! {
            biased;
            () = cancel_requested(&mut self.cancel) => return None,
            res = invocation => match res {
                Ok(outcome) => outcome,
                Err(error) => {
                    // A panicking executor surfaces as a critical heartbeat,
                    // not as worker death.
                    ExecOutcome::failed(Bytes::new(), ExecError::Internal(error.to_string()))
                }
            },
        };

        let elapsed = stopwatch.snapshot().active;
        if outcome.deadline_exceeded() {
            // Deadlines get logged every time; they're a distinct problem
            // from a script that runs and reports a failure.
            warn!(?elapsed, timeout = ?self.spec.timeout, "check timed out");
        } else {
            debug!(?elapsed, exit_code = outcome.exit_code, "check finished");
        }
        Some(outcome)
    }

    async fn publish(&self, outcome: &ExecOutcome) {
        let status = classify(outcome);
        let output = heartbeat_output(outcome);
        if let Err(error) = self
            .heartbeat
            .update_ttl(&self.spec.check_id, &output, status)
            .await
        {
            // Only log; the next heartbeat retries.
            warn!(%error, %status, "TTL update failed");
        }
    }
}

/// Completes once cancellation is requested. A closed channel means the
/// handle was dropped, which counts as a cancel request.
async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

fn cancel_pending(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        doubles::{
            BlockingExec, Heartbeat, RecordingTtl, ScriptedExec, TimingOutExec, init_tracing,
            spec_with_timings,
        },
        shutdown::ShutdownBroadcast,
        status::CheckStatus,
    };
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;
    use test_case::test_case;
    use tokio::{sync::mpsc, time::timeout};

    /// How long tests are willing to wait for something that should be
    /// prompt.
    const WAIT_BUDGET: Duration = Duration::from_secs(3);

    /// A stand-in for "effectively forever".
    const LONG: Duration = Duration::from_secs(3600);

    async fn recv(inbox: &mut mpsc::UnboundedReceiver<Heartbeat>) -> Heartbeat {
        timeout(WAIT_BUDGET, inbox.recv())
            .await
            .expect("heartbeat arrives within the budget")
            .expect("channel is open")
    }

    async fn wait_within_budget(handle: &RunnerHandle) {
        timeout(WAIT_BUDGET, handle.wait())
            .await
            .expect("worker exits within the budget");
    }

    #[tokio::test]
    async fn cancel_during_exec_abandons_the_invocation() {
        init_tracing();
        let exec = Arc::new(BlockingExec::default());
        let exited = Arc::clone(&exec.exited);
        let (ttl, mut inbox) = RecordingTtl::new();
        let handle =
            CheckRunner::new(spec_with_timings(LONG, LONG), exec, ttl, ShutdownSignal::never())
                .run();

        // Give the worker time to enter the check phase before cancelling.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        wait_within_budget(&handle).await;

        assert!(!exited.load(Ordering::SeqCst), "the script is still running");
        assert_eq!(inbox.try_recv().ok(), None, "no heartbeats were published");
    }

    #[tokio::test]
    async fn timed_out_check_goes_critical() {
        init_tracing();
        let exec = Arc::new(TimingOutExec::new(LONG, "never returned"));
        let exited = Arc::clone(&exec.exited);
        let (ttl, mut inbox) = RecordingTtl::new();
        let spec = spec_with_timings(LONG, Duration::from_secs(1));
        let handle = CheckRunner::new(spec, exec, ttl, ShutdownSignal::never()).run();

        let heartbeat = recv(&mut inbox).await;
        assert_eq!(heartbeat.status, CheckStatus::Critical);
        assert!(!exited.load(Ordering::SeqCst), "the script is still running");

        handle.cancel();
        wait_within_budget(&handle).await;
        assert_eq!(inbox.try_recv().ok(), None, "no heartbeats after wait");
    }

    #[tokio::test]
    async fn timed_out_check_publishes_the_deadline_message() {
        init_tracing();
        let exec = Arc::new(TimingOutExec::new(Duration::from_millis(100), "from the script"));
        let (ttl, mut inbox) = RecordingTtl::new();
        let spec = spec_with_timings(LONG, Duration::from_nanos(1));
        let handle = CheckRunner::new(spec, exec, ttl, ShutdownSignal::never()).run();

        let heartbeat = recv(&mut inbox).await;
        assert_eq!(heartbeat.status, CheckStatus::Critical);
        assert_eq!(heartbeat.output, ExecError::DeadlineExceeded.to_string());

        handle.cancel();
        wait_within_budget(&handle).await;
    }

    #[tokio::test]
    async fn shutdown_delivers_exactly_one_final_heartbeat() {
        init_tracing();
        let exec = Arc::new(ScriptedExec::exiting(0));
        let (ttl, mut inbox) = RecordingTtl::new();
        let broadcast = ShutdownBroadcast::new();
        let runner =
            CheckRunner::new(spec_with_timings(LONG, LONG), exec, ttl, broadcast.signal());

        broadcast.fire();
        let handle = runner.run();

        let heartbeat = recv(&mut inbox).await;
        assert_eq!(heartbeat.status, CheckStatus::Passing);
        assert_eq!(heartbeat.check_id, "check-1");

        wait_within_budget(&handle).await;
        assert_eq!(inbox.try_recv().ok(), None, "exactly one heartbeat was published");
    }

    #[tokio::test]
    async fn shutdown_mid_wait_delivers_one_more_heartbeat() {
        init_tracing();
        let exec = Arc::new(ScriptedExec::exiting(2));
        let (ttl, mut inbox) = RecordingTtl::new();
        let broadcast = ShutdownBroadcast::new();
        let handle =
            CheckRunner::new(spec_with_timings(LONG, LONG), exec, ttl, broadcast.signal()).run();

        let first = recv(&mut inbox).await;
        assert_eq!(first.status, CheckStatus::Critical);

        // Let the worker park on its hour-long interval before firing, so
        // shutdown is observed in the wait phase rather than the exit check.
        tokio::time::sleep(Duration::from_millis(100)).await;
        broadcast.fire();

        let last = recv(&mut inbox).await;
        assert_eq!(last.status, CheckStatus::Critical);
        wait_within_budget(&handle).await;
        assert_eq!(inbox.try_recv().ok(), None);
    }

    #[test_case(0, false, CheckStatus::Passing ; "exit 0 passes")]
    #[test_case(1, false, CheckStatus::Warning ; "exit 1 warns")]
    #[test_case(2, false, CheckStatus::Critical ; "exit 2 is critical")]
    #[test_case(9000, false, CheckStatus::Critical ; "exit 9000 is critical")]
    #[test_case(0, true, CheckStatus::Critical ; "error dominates exit 0")]
    #[test_case(1, true, CheckStatus::Critical ; "error dominates exit 1")]
    #[test_case(2, true, CheckStatus::Critical ; "error dominates exit 2")]
    #[test_case(9000, true, CheckStatus::Critical ; "error dominates exit 9000")]
    #[tokio::test]
    async fn published_status_follows_the_exit_code(
        exit_code: i32,
        with_err: bool,
        expected: CheckStatus,
    ) {
        init_tracing();
        let err = with_err.then(|| ExecError::Internal("exec failed".to_owned()));
        let expected_output = match &err {
            Some(err) => err.to_string(),
            None => "output".to_owned(),
        };
        let exec = Arc::new(ScriptedExec {
            exit_code,
            err,
            output: "output",
        });
        let (ttl, mut inbox) = RecordingTtl::new();
        let handle =
            CheckRunner::new(spec_with_timings(LONG, LONG), exec, ttl, ShutdownSignal::never())
                .run();

        let heartbeat = recv(&mut inbox).await;
        assert_eq!(heartbeat.status, expected);
        assert_eq!(heartbeat.output, expected_output);

        handle.cancel();
        wait_within_budget(&handle).await;
    }

    #[tokio::test]
    async fn heartbeat_failures_do_not_stop_the_runner() {
        init_tracing();
        let exec = Arc::new(ScriptedExec::exiting(0));
        let (ttl, mut inbox) = RecordingTtl::failing();
        let spec = spec_with_timings(Duration::from_millis(10), LONG);
        let handle = CheckRunner::new(spec, exec, ttl, ShutdownSignal::never()).run();

        // Two delivery attempts mean the runner outlived the first failure.
        recv(&mut inbox).await;
        recv(&mut inbox).await;

        handle.cancel();
        wait_within_budget(&handle).await;
    }

    #[tokio::test]
    async fn handle_is_idempotent() {
        init_tracing();
        let exec = Arc::new(ScriptedExec::exiting(0));
        let (ttl, _inbox) = RecordingTtl::new();
        let handle =
            CheckRunner::new(spec_with_timings(LONG, LONG), exec, ttl, ShutdownSignal::never())
                .run();

        handle.cancel();
        handle.cancel();
        wait_within_budget(&handle).await;
        wait_within_budget(&handle).await;
    }

    #[tokio::test]
    async fn cancel_wins_over_shutdown_during_exec() {
        init_tracing();
        let exec = Arc::new(BlockingExec::default());
        let (ttl, mut inbox) = RecordingTtl::new();
        let broadcast = ShutdownBroadcast::new();
        let handle =
            CheckRunner::new(spec_with_timings(LONG, LONG), exec, ttl, broadcast.signal()).run();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        broadcast.fire();
        wait_within_budget(&handle).await;

        assert_eq!(
            inbox.try_recv().ok(),
            None,
            "cancel carries no final-heartbeat obligation",
        );
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels_the_worker() {
        init_tracing();
        let exec = Arc::new(ScriptedExec::exiting(0));
        let (ttl, mut inbox) = RecordingTtl::new();
        let handle =
            CheckRunner::new(spec_with_timings(LONG, LONG), exec, ttl, ShutdownSignal::never())
                .run();

        recv(&mut inbox).await;
        let mut done = handle.done.clone();
        drop(handle);

        timeout(WAIT_BUDGET, async {
            let _ = done.wait_for(|done| *done).await;
        })
        .await
        .expect("worker exits after its handle is dropped");
    }

    #[tokio::test]
    #[should_panic(expected = "zero interval")]
    async fn zero_interval_panics() {
        let exec = Arc::new(ScriptedExec::exiting(0));
        let (ttl, _inbox) = RecordingTtl::new();
        CheckRunner::new(
            spec_with_timings(Duration::ZERO, LONG),
            exec,
            ttl,
            ShutdownSignal::never(),
        );
    }

    #[tokio::test]
    #[should_panic(expected = "zero timeout")]
    async fn zero_timeout_panics() {
        let exec = Arc::new(ScriptedExec::exiting(0));
        let (ttl, _inbox) = RecordingTtl::new();
        CheckRunner::new(
            spec_with_timings(LONG, Duration::ZERO),
            exec,
            ttl,
            ShutdownSignal::never(),
        );
    }
}
