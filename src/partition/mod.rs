//! Asynchronous partitions
//!
//! A [`Partition`] owns an [`Engine`] on its own tokio task. Commands reach it
//! through a bounded request channel and the expiry sweep is driven by a timer
//! on the same loop, so the engine never sees two inputs at once. Every record
//! the engine writes is published on a broadcast channel.
//!
//! Commands the engine addresses to other partitions are passed to a router,
//! see [`Broker`](crate::broker::Broker).

use anyhow::Context;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, span, warn, Instrument, Level};

use crate::config::Opts;
use crate::engine::{Command, Engine, Outbound, Record, Rejection};

mod channel;
mod interrupt;

use channel::{request_channel, Sender, WithReply};
use interrupt::Interrupt;

/// Capacity of the record broadcast; slower subscribers miss records
const RECORD_BUFFER: usize = 1024;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(#[from] anyhow::Error);

impl Error {
    /// The rejection, if the partition refused the command
    pub fn rejection(&self) -> Option<&Rejection> {
        self.0.downcast_ref::<Rejection>()
    }
}

type Query = Box<dyn FnOnce(&Engine) + Send>;

enum Request {
    Command(Command),
    Query(Query),
}

type Reply = Result<u64, Rejection>;

/// Channel to the router of commands between partitions
pub(crate) type Router = mpsc::UnboundedSender<Outbound>;

/// Sending side of a running partition
#[derive(Clone)]
pub(crate) struct Mailbox {
    id: u16,
    requests: Sender<Request, Reply>,
}

impl Mailbox {
    pub(crate) async fn execute(&self, command: Command) -> Result<u64, Error> {
        let name = command.name();
        let reply = self
            .requests
            .send(Request::Command(command))
            .await
            .with_context(|| format!("partition {} failed to process {name}", self.id))?;
        let key = reply.map_err(anyhow::Error::from)?;
        Ok(key)
    }
}

/// Milliseconds since the unix epoch, advancing with the tokio clock
#[derive(Clone, Copy)]
struct Clock {
    base_ms: u64,
    start: Instant,
}

impl Clock {
    fn new() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            base_ms,
            start: Instant::now(),
        }
    }

    fn now(&self) -> u64 {
        self.base_ms
            .saturating_add(self.start.elapsed().as_millis() as u64)
    }
}

pub struct Partition {
    mailbox: Mailbox,
    records: broadcast::Sender<Record>,
    interrupt: Interrupt,
    handle: JoinHandle<Engine>,
}

impl Partition {
    /// Start an empty partition
    ///
    /// A partition started on its own has no route to other partitions, the
    /// commands its engine addresses to them are dropped.
    pub fn spawn(id: u16, opts: &Opts) -> Self {
        Self::start(Engine::new(id, opts), opts, None)
    }

    /// Start a partition from the records of a previous run
    pub fn recover(id: u16, opts: &Opts, records: impl IntoIterator<Item = Record>) -> Self {
        Self::start(Engine::replay(id, opts, records), opts, None)
    }

    /// Start an empty partition passing commands for other partitions to `router`
    pub(crate) fn routed(id: u16, opts: &Opts, router: Router) -> Self {
        Self::start(Engine::new(id, opts), opts, Some(router))
    }

    fn start(engine: Engine, opts: &Opts, router: Option<Router>) -> Self {
        let id = engine.partition_id();
        let (requests, rx) = request_channel(opts.get_channel_capacity());
        let (records, _) = broadcast::channel(RECORD_BUFFER);
        let interrupt = Interrupt::new();

        let handle = tokio::spawn(
            run(
                engine,
                rx,
                records.clone(),
                router,
                interrupt.clone(),
                opts.sweep_interval(),
            )
            .instrument(span!(Level::DEBUG, "partition", id)),
        );

        Self {
            mailbox: Mailbox { id, requests },
            records,
            interrupt,
            handle,
        }
    }

    pub fn id(&self) -> u16 {
        self.mailbox.id
    }

    pub(crate) fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    /// Apply a command, returning the key of the affected entity
    ///
    /// A refused command is returned as an error carrying the [`Rejection`].
    pub async fn execute(&self, command: impl Into<Command>) -> Result<u64, Error> {
        self.mailbox.execute(command.into()).await
    }

    /// Read the engine state in between commands
    pub async fn query<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> T + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let query: Query = Box::new(move |engine| {
            let _ = tx.send(f(engine));
        });
        let id = self.id();
        self.mailbox
            .requests
            .send(Request::Query(query))
            .await
            .with_context(|| format!("partition {id} failed to run query"))?
            .map_err(anyhow::Error::from)?;
        let value = rx
            .await
            .with_context(|| format!("partition {id} dropped the query"))?;
        Ok(value)
    }

    /// Records written from now on
    pub fn records(&self) -> impl Stream<Item = Record> + Send + Unpin + 'static {
        BroadcastStream::new(self.records.subscribe()).filter_map(|r| r.ok())
    }

    /// Stop the partition, returning its engine
    ///
    /// Requests already queued are dropped.
    pub async fn stop(self) -> Result<Engine, Error> {
        let id = self.id();
        self.interrupt.set();
        let engine = self
            .handle
            .await
            .with_context(|| format!("partition {id} task panicked"))?;
        Ok(engine)
    }
}

fn publish(records: &broadcast::Sender<Record>, engine: &Engine, after: u64) {
    for record in engine.records_after(after) {
        // no subscribers is fine
        let _ = records.send(record.clone());
    }
}

fn forward(engine: &mut Engine, router: Option<&Router>) {
    for outbound in engine.take_outbound() {
        let (partition, command) = (outbound.partition, outbound.command.name());
        let sent = router.is_some_and(|tx| tx.send(outbound).is_ok());
        if !sent {
            warn!(to = partition, command, "no route to partition, command dropped");
        }
    }
}

async fn run(
    mut engine: Engine,
    mut rx: mpsc::Receiver<WithReply<Request, Reply>>,
    records: broadcast::Sender<Record>,
    router: Option<Router>,
    interrupt: Interrupt,
    sweep_interval: Duration,
) -> Engine {
    let clock = Clock::new();
    let mut sweep = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(position = engine.position(), "started");
    loop {
        tokio::select! {
            biased;

            _ = interrupt.wait() => break,

            request = rx.recv() => {
                let Some(request) = request else {
                    break;
                };
                let (request, reply) = request.into_parts();
                match request {
                    Request::Command(command) => {
                        let start = engine.position();
                        let result = engine.process(command, clock.now());
                        publish(&records, &engine, start);
                        forward(&mut engine, router.as_ref());
                        reply.send(result);
                    }
                    Request::Query(query) => {
                        query(&engine);
                        reply.send(Ok(engine.position()));
                    }
                }
            }

            _ = sweep.tick() => {
                let start = engine.position();
                engine.sweep(clock.now());
                publish(&records, &engine, start);
            }
        }
    }
    debug!(position = engine.position(), "stopped");
    engine
}
