//! Runs an [`Endpoint`] on a tokio task against the wall clock.
//!
//! The task owns the endpoint and an [`EventQueue`] whose clock is the time
//! since the task started. It sleeps until the earliest protocol deadline, an
//! inbound frame, or an application command, whichever comes first.

use std::{fmt, time::Duration};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, warn};

use crate::{
    connection::{Mode, State},
    endpoint::Endpoint,
    error::{OstError, Result},
    link::Link,
    scheduler::{EventQueue, TimerEvent},
    Address,
};

// Upper bound on an idle sleep when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// One end of an in-process full-duplex serial line.
#[derive(Debug, Clone)]
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelLink {
    /// Two connected ends, each with the receiver for frames sent by the other.
    pub fn pair() -> (
        (ChannelLink, mpsc::UnboundedReceiver<Bytes>),
        (ChannelLink, mpsc::UnboundedReceiver<Bytes>),
    ) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        ((ChannelLink { tx: b_tx }, a_rx), (ChannelLink { tx: a_tx }, b_rx))
    }
}

impl Link for ChannelLink {
    fn send(&mut self, frame: Bytes, _dest: Address) -> bool {
        self.tx.send(frame).is_ok()
    }

    fn is_ready(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[derive(Debug)]
enum Command {
    Open {
        peer: Address,
        mode: Mode,
        reply: oneshot::Sender<Result<()>>,
    },
    Write {
        peer: Address,
        payload: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        peer: Address,
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        peer: Address,
        reply: oneshot::Sender<Option<State>>,
    },
    Shutdown,
}

/// Application side of a spawned endpoint.
pub struct EndpointHandle<L> {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<Endpoint<L>>,
}

impl<L> fmt::Debug for EndpointHandle<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("commands", &self.commands)
            //.field("task", &self.task)
            .finish()
    }
}

impl<L> EndpointHandle<L> {
    /// See [`Endpoint::open`].
    pub async fn open(&self, peer: Address, mode: Mode) -> Result<()> {
        self.request(|reply| Command::Open { peer, mode, reply })
            .await?
    }

    /// See [`Endpoint::write`].
    pub async fn write(&self, peer: Address, payload: Bytes) -> Result<()> {
        self.request(|reply| Command::Write {
            peer,
            payload,
            reply,
        })
        .await?
    }

    /// See [`Endpoint::close`].
    pub async fn close(&self, peer: Address) -> Result<()> {
        self.request(|reply| Command::Close { peer, reply }).await?
    }

    /// State of the connection to `peer`, if there is one.
    pub async fn state(&self, peer: Address) -> Result<Option<State>> {
        self.request(|reply| Command::State { peer, reply }).await
    }

    /// Stops the task and hands the endpoint back.
    pub async fn shutdown(self) -> Result<Endpoint<L>> {
        // The task may already have stopped; the join below reports it.
        let _ = self.commands.send(Command::Shutdown).await;
        self.task.await.map_err(|_| OstError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| OstError::Closed)?;
        rx.await.map_err(|_| OstError::Closed)
    }
}

/// Moves `endpoint` onto a tokio task fed by `inbound`. In-order payloads
/// come out of the returned receiver as `(peer, payload)`.
pub fn spawn<L>(
    mut endpoint: Endpoint<L>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
) -> (EndpointHandle<L>, mpsc::UnboundedReceiver<(Address, Bytes)>)
where
    L: Link + Send + 'static,
{
    let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
    endpoint.on_deliver(move |peer, payload| {
        if deliver_tx.send((peer, payload)).is_err() {
            debug!(peer, "delivery receiver dropped");
        }
    });

    let (commands, command_rx) = mpsc::channel(64);
    let task = tokio::spawn(run(endpoint, inbound, command_rx));
    (EndpointHandle { commands, task }, deliver_rx)
}

async fn run<L: Link>(
    mut endpoint: Endpoint<L>,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    mut commands: mpsc::Receiver<Command>,
) -> Endpoint<L> {
    let start = Instant::now();
    let mut sched: EventQueue<TimerEvent> = EventQueue::new();
    let mut inbound_open = true;

    loop {
        sched.advance_to(start.elapsed());
        while let Some((token, event)) = sched.pop_due() {
            if let Err(err) = endpoint.on_timer(event, token, &mut sched) {
                warn!(%err, ?event, "timer handling failed");
            }
        }

        let wake = match sched.next_deadline() {
            Some(deadline) => start + deadline,
            None => Instant::now() + IDLE_WAIT,
        };

        tokio::select! {
            frame = inbound.recv(), if inbound_open => match frame {
                Some(frame) => {
                    sched.advance_to(start.elapsed());
                    if let Err(err) = endpoint.on_receive(frame, &mut sched) {
                        debug!(%err, "inbound frame rejected");
                    }
                }
                None => {
                    debug!("link closed");
                    inbound_open = false;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => {
                    sched.advance_to(start.elapsed());
                    execute(&mut endpoint, command, &mut sched);
                }
            },
            _ = sleep_until(wake) => {}
        }
    }
    endpoint
}

fn execute<L: Link>(
    endpoint: &mut Endpoint<L>,
    command: Command,
    sched: &mut EventQueue<TimerEvent>,
) {
    // A dropped reply receiver means the caller gave up waiting.
    match command {
        Command::Open { peer, mode, reply } => {
            let _ = reply.send(endpoint.open(peer, mode, sched));
        }
        Command::Write {
            peer,
            payload,
            reply,
        } => {
            let _ = reply.send(endpoint.write(peer, payload, sched));
        }
        Command::Close { peer, reply } => {
            let _ = reply.send(endpoint.close(peer, sched));
        }
        Command::State { peer, reply } => {
            let _ = reply.send(endpoint.state(peer));
        }
        Command::Shutdown => {}
    }
}
