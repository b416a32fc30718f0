// Copyright (c) The taskcheck Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The shutdown broadcast.
//!
//! A [`ShutdownBroadcast`] tells every check runner to deliver one final
//! heartbeat and exit. It fires at most once and is observable by any number
//! of [`ShutdownSignal`] receivers; receivers cannot fire or reset it.

use crate::errors::SignalSetupError;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// The firing side of the shutdown broadcast.
///
/// Dropping every clone of the broadcast without calling
/// [`fire`](Self::fire) counts as firing it: runners treat a closed channel
/// as a shutdown request rather than running unsupervised forever.
#[derive(Clone, Debug)]
pub struct ShutdownBroadcast {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownBroadcast {
    /// Creates a new, unfired broadcast.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns a receiver observing this broadcast.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Fires the broadcast. Idempotent.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    /// Fires the broadcast when the process receives a termination signal.
    ///
    /// Listens for SIGINT, SIGHUP, SIGTERM and SIGQUIT on Unix and Ctrl-C on
    /// Windows. Must be called from within a tokio runtime.
    pub fn listen_for_os_signals(&self) -> Result<(), SignalSetupError> {
        let mut signals = imp::Signals::new()?;
        let broadcast = self.clone();
        tokio::spawn(async move {
            if let Some(signal) = signals.recv().await {
                debug!(signal, "received termination signal");
                broadcast.fire();
            }
        });
        Ok(())
    }
}

impl Default for ShutdownBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver for the shutdown broadcast. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// A signal that never fires. Useful for runners that are only ever
    /// cancelled, and for tests.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Completes when the broadcast fires. Completes immediately if it has
    /// already fired, or if every broadcast handle was dropped.
    pub async fn fired(&mut self) {
        match &mut self.rx {
            Some(rx) => {
                let _ = rx.wait_for(|fired| *fired).await;
            }
            None => std::future::pending().await,
        }
    }

    /// Returns true if the broadcast has fired, without suspending.
    pub fn is_fired(&self) -> bool {
        self.rx
            .as_ref()
            .is_some_and(|rx| *rx.borrow() || rx.has_changed().is_err())
    }
}

#[cfg(unix)]
mod imp {
    use std::io;
    use tokio::signal::unix::{SignalKind, signal};
    use tokio_stream::{StreamExt, StreamMap, wrappers::SignalStream};

    #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
    enum SignalId {
        Int,
        Hup,
        Term,
        Quit,
    }

    impl SignalId {
        fn name(self) -> &'static str {
            match self {
                Self::Int => "SIGINT",
                Self::Hup => "SIGHUP",
                Self::Term => "SIGTERM",
                Self::Quit => "SIGQUIT",
            }
        }
    }

    /// Streams for the termination signals on Unix.
    #[derive(Debug)]
    pub(super) struct Signals {
        // The number of streams is quite small, so a StreamMap (backed by a
        // Vec) is a good option to store the list of streams to poll.
        map: StreamMap<SignalId, SignalStream>,
    }

    impl Signals {
        pub(super) fn new() -> io::Result<Self> {
            let mut map = StreamMap::new();
            map.extend([
                (SignalId::Int, signal_stream(SignalKind::interrupt())?),
                (SignalId::Hup, signal_stream(SignalKind::hangup())?),
                (SignalId::Term, signal_stream(SignalKind::terminate())?),
                (SignalId::Quit, signal_stream(SignalKind::quit())?),
            ]);
            Ok(Self { map })
        }

        pub(super) async fn recv(&mut self) -> Option<&'static str> {
            self.map.next().await.map(|(id, _)| id.name())
        }
    }

    fn signal_stream(kind: SignalKind) -> io::Result<SignalStream> {
        Ok(SignalStream::new(signal(kind)?))
    }
}

#[cfg(windows)]
mod imp {
    use tokio::signal::windows::{CtrlC, ctrl_c};

    #[derive(Debug)]
    pub(super) struct Signals {
        ctrl_c: CtrlC,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            Ok(Self { ctrl_c: ctrl_c()? })
        }

        pub(super) async fn recv(&mut self) -> Option<&'static str> {
            self.ctrl_c.recv().await.map(|()| "ctrl-c")
        }
    }
}
