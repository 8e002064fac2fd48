//! Reconnect supervisor.
//!
//! A single task owns the [`SourceReader`] and walks it through an explicit
//! [`ConnectionState`] machine. Because exactly one task applies transitions,
//! and the retry wait only exists inside the `Reconnecting` arm, at most one
//! retry loop can be active at a time.

use std::time::Duration;

use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
};
use tracing::{Instrument, Span, debug, info, warn};

use crate::source::{ReadExit, SourceReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Reading,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Connected,
    ConnectFailed,
    ReadFailed,
    ReconnectRequested,
    RetryDue,
    StopRequested,
}

impl ConnectionState {
    /// Applies `event`, returning the new state, or `None` when the event is
    /// ignored in this state (including coalesced reconnect requests).
    pub fn next(self, event: ConnectionEvent) -> Option<Self> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (S::Stopped, _) => None,
            (_, E::StopRequested) => Some(S::Stopped),
            (S::Disconnected, E::Connect) => Some(S::Connecting),
            (S::Connecting, E::Connected) => Some(S::Reading),
            (S::Connecting, E::ConnectFailed) => Some(S::Reconnecting),
            (S::Reading, E::ReadFailed | E::ReconnectRequested) => Some(S::Reconnecting),
            (S::Reconnecting, E::RetryDue) => Some(S::Connecting),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Stopped
    }
}

enum Control {
    Reconnect,
    Stop,
}

/// Cloneable control surface for a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    control: mpsc::Sender<Control>,
    state: watch::Receiver<ConnectionState>,
}

impl SupervisorHandle {
    /// Forces the current connection down and into the retry cycle.
    ///
    /// A request made while one is already pending, or while reconnecting, is
    /// dropped.
    pub fn request_reconnect(&self) {
        match self.control.try_send(Control::Reconnect) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => debug!("reconnect already pending"),
        }
    }

    /// Stops reading and reconnecting for good. Idempotent.
    pub async fn stop(&self) {
        let _ = self.control.send(Control::Stop).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

pub struct Supervisor {
    reader: SourceReader,
    initial_address: Option<String>,
    retry_interval: Duration,
    control: mpsc::Receiver<Control>,
    state: watch::Sender<ConnectionState>,
}

impl Supervisor {
    /// Takes ownership of `reader` and starts connecting to `address`.
    pub fn spawn(
        reader: SourceReader,
        address: String,
        retry_interval: Duration,
        span: Span,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        // One slot: a second reconnect request while one is queued is a no-op.
        let (control_tx, control) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let supervisor = Supervisor {
            reader,
            initial_address: Some(address),
            retry_interval,
            control,
            state: state_tx,
        };
        let task = tokio::spawn(supervisor.run().instrument(span));
        let handle = SupervisorHandle {
            control: control_tx,
            state: state_rx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        self.apply(ConnectionEvent::Connect);
        while !self.current().is_terminal() {
            match self.current() {
                ConnectionState::Disconnected => self.apply(ConnectionEvent::Connect),
                ConnectionState::Connecting => self.connect().await,
                ConnectionState::Reading => self.read().await,
                ConnectionState::Reconnecting => self.wait_for_retry().await,
                ConnectionState::Stopped => {}
            }
        }
        self.reader.close();
        info!("supervisor stopped");
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn apply(&mut self, event: ConnectionEvent) {
        let current = self.current();
        match current.next(event) {
            Some(next) => {
                debug!(from = ?current, to = ?next, ?event, "connection state changed");
                self.state.send_replace(next);
            }
            None => debug!(state = ?current, ?event, "connection event ignored"),
        }
    }

    async fn connect(&mut self) {
        let outcome = {
            // Only the first attempt supplies the address; retries reuse it.
            let initial = self.initial_address.take();
            let reader = &mut self.reader;
            let attempt = async move {
                match initial {
                    Some(address) => reader.connect(&address).await,
                    None => reader.reconnect().await,
                }
            };
            tokio::pin!(attempt);
            loop {
                select! {
                    result = &mut attempt => break Some(result),
                    control = self.control.recv() => match control {
                        Some(Control::Reconnect) => {
                            debug!("reconnect coalesced with connect attempt")
                        }
                        // Dropping the attempt detaches a blocked open; a handle
                        // it produces late is dropped with the blocking task.
                        Some(Control::Stop) | None => break None,
                    },
                }
            }
        };

        match outcome {
            Some(Ok(())) => self.apply(ConnectionEvent::Connected),
            Some(Err(err)) => {
                warn!(error = %err, "device connection failed");
                self.apply(ConnectionEvent::ConnectFailed);
            }
            None => {
                info!("connect attempt abandoned");
                self.reader.close();
                self.apply(ConnectionEvent::StopRequested);
            }
        }
    }

    async fn read(&mut self) {
        let stop = self.reader.stop_handle();
        let mut stop_requested = false;
        let mut reconnect_requested = false;

        let exit = {
            let read = self.reader.read_loop();
            tokio::pin!(read);
            loop {
                select! {
                    exit = &mut read => break exit,
                    control = self.control.recv(), if !stop_requested => match control {
                        Some(Control::Reconnect) => {
                            reconnect_requested = true;
                            stop.stop();
                        }
                        Some(Control::Stop) | None => {
                            stop_requested = true;
                            stop.stop();
                        }
                    },
                }
            }
        };

        self.reader.close();
        if stop_requested {
            self.apply(ConnectionEvent::StopRequested);
            return;
        }
        if reconnect_requested {
            info!("reconnect requested");
            self.apply(ConnectionEvent::ReconnectRequested);
            return;
        }

        match exit {
            ReadExit::Failed(err) => {
                warn!(error = %err, "device read failed");
                self.apply(ConnectionEvent::ReadFailed);
            }
            // Nobody asked us to stop, so the hub is gone.
            ReadExit::Stopped => self.apply(ConnectionEvent::StopRequested),
        }
    }

    async fn wait_for_retry(&mut self) {
        info!(retry_in = ?self.retry_interval, "waiting to reconnect");
        let retry = tokio::time::sleep(self.retry_interval);
        tokio::pin!(retry);

        loop {
            select! {
                _ = &mut retry => {
                    self.apply(ConnectionEvent::RetryDue);
                    return;
                }
                control = self.control.recv() => match control {
                    Some(Control::Reconnect) => debug!("reconnect already in progress"),
                    Some(Control::Stop) | None => {
                        self.apply(ConnectionEvent::StopRequested);
                        return;
                    }
                },
            }
        }
    }
}
