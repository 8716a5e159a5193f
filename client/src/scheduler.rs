//! The transport scheduler (4.G): drives the outbox against a relay server
//! with backoff, and polls the mailbox on a fetch interval. Generalizes the
//! teacher's single WebSocket `Sender`/`Receiver` split into the worker/core
//! split of §5 — workers never touch `State` directly, they post updates
//! over bounded channels to a single coordinator that owns it, matching the
//! "core task serialises all mutations" concurrency contract.
//!
//! `RelayTransport` is generic rather than a trait object: nothing here
//! needs runtime polymorphism across transports within one process, and a
//! static bound keeps the scheduler's async trait methods free of the
//! boxed-future plumbing a `dyn` bound would need.

use crate::errors::SchedulerError;
use crate::lifecycle::Core;
use common::Clock;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

pub const INITIAL_BACKOFF_SECS: u64 = 30;
pub const MAX_BACKOFF_SECS: u64 = 3600;
pub const DEFAULT_FETCH_INTERVAL_SECS: u64 = 300;
pub const TRANSPORT_TIMEOUT_SECS: u64 = 60;

/// An envelope as fetched from the relay: opaque ciphertext plus the routing
/// tag the scheduler uses to find the owning contact.
#[derive(Debug, Clone)]
pub struct RelayEnvelope {
    pub to_group_tag: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub received_time: i64,
}

pub trait RelayTransport: Send + Sync {
    fn send(
        &self,
        server: &str,
        ciphertext: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<(), SchedulerError>> + Send;

    fn fetch(
        &self,
        server: &str,
    ) -> impl std::future::Future<Output = Result<Vec<RelayEnvelope>, SchedulerError>> + Send;
}

/// What a worker posts back to the coordinator after attempting a send.
pub struct SendOutcome {
    pub outbox_id: u64,
    pub result: Result<(), SchedulerError>,
}

/// The bounded channels of §5: workers only ever post to these, never touch
/// `Core` directly.
pub enum CoreEvent {
    NewMessage { from: u64, bytes: Vec<u8> },
    MessageSentResult(SendOutcome),
    PandaUpdate { contact_id: u64, card: Option<Vec<u8>> },
    Background(String),
    LogUpdate(String),
}

pub struct Scheduler<T: RelayTransport + 'static> {
    core: Arc<Mutex<Core>>,
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    fetch_interval: Duration,
    events_tx: mpsc::Sender<CoreEvent>,
    events_rx: Option<mpsc::Receiver<CoreEvent>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl<T: RelayTransport + 'static> Scheduler<T> {
    pub fn new(core: Arc<Mutex<Core>>, transport: Arc<T>, clock: Arc<dyn Clock>, fetch_interval: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Scheduler {
            core,
            transport,
            clock,
            fetch_interval,
            events_tx,
            events_rx: Some(events_rx),
            shutdown_tx: None,
        }
    }

    pub fn events_sender(&self) -> mpsc::Sender<CoreEvent> {
        self.events_tx.clone()
    }

    /// Runs the coordinator loop: drains `CoreEvent`s and applies each to
    /// `Core` under its mutex. Returns once the shutdown signal fires and
    /// the channel has drained, per the "stop accepting work, cancel
    /// in-flight polls, drain completions, return" shutdown contract.
    pub async fn run_coordinator(&mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut events_rx = self.events_rx.take().expect("coordinator already running");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    events_rx.close();
                    while let Ok(event) = events_rx.try_recv() {
                        self.apply_event(event).await;
                    }
                    return;
                }
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.apply_event(event).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn apply_event(&self, event: CoreEvent) {
        let mut core = self.core.lock().await;
        match event {
            CoreEvent::NewMessage { from, bytes } => {
                let _ = core.receive_sealed(from, bytes);
            }
            CoreEvent::MessageSentResult(outcome) => match outcome.result {
                Ok(()) => {
                    info!("outbox {} sent", outcome.outbox_id);
                    core.mark_sent(outcome.outbox_id);
                }
                Err(SchedulerError::RevokedByPeer) => {
                    warn!("outbox {} rejected: revoked by peer", outcome.outbox_id);
                    core.mark_revoked_by_peer(outcome.outbox_id);
                }
                Err(err) => warn!("outbox {} failed permanently: {err}", outcome.outbox_id),
            },
            CoreEvent::PandaUpdate { contact_id, card } => {
                if let Ok(Some(blob)) = core.apply_panda_poll(contact_id, card.as_deref()) {
                    let _ = core.complete_panda_kx(contact_id, blob);
                }
            }
            CoreEvent::Background(_) | CoreEvent::LogUpdate(_) => {}
        }
    }

    /// One pass over the outbox: sends every `Queued` entry, posting the
    /// result back through `events_tx` rather than mutating `Core` itself —
    /// only the coordinator does that.
    pub async fn drive_sends_once(&self) {
        let queued: Vec<(u64, String, Vec<u8>)> = {
            let core = self.core.lock().await;
            core.state
                .outbox
                .values()
                .filter(|e| e.status == crate::model::OutboxStatus::Queued)
                .map(|e| (e.id, e.server.clone(), e.ciphertext.clone()))
                .collect()
        };

        for (outbox_id, server, ciphertext) in queued {
            let result = self.send_with_backoff(&server, ciphertext).await;
            let _ = self
                .events_tx
                .send(CoreEvent::MessageSentResult(SendOutcome { outbox_id, result }))
                .await;
        }
    }

    async fn send_with_backoff(&self, server: &str, ciphertext: Vec<u8>) -> Result<(), SchedulerError> {
        let mut backoff = INITIAL_BACKOFF_SECS;
        loop {
            let attempt = tokio::time::timeout(
                Duration::from_secs(TRANSPORT_TIMEOUT_SECS),
                self.transport.send(server, ciphertext.clone()),
            )
            .await;
            match attempt {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(SchedulerError::RevokedByPeer)) => return Err(SchedulerError::RevokedByPeer),
                Ok(Err(err)) => {
                    let wait = jittered(backoff);
                    warn!("send to {server} failed ({err}), retrying in {wait}s");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                }
                Err(_) => {
                    let wait = jittered(backoff);
                    warn!("send to {server} timed out, retrying in {wait}s");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
    }

    /// One fetch pass against the home server, routing each envelope to its
    /// owning contact by `to_group_tag` and posting a `NewMessage` event.
    pub async fn drive_fetch_once(&self) -> Result<usize, SchedulerError> {
        let server = self.core.lock().await.state.server.clone();
        let envelopes = match tokio::time::timeout(Duration::from_secs(TRANSPORT_TIMEOUT_SECS), self.transport.fetch(&server))
            .await
        {
            Ok(Ok(envelopes)) => envelopes,
            Ok(Err(err)) => {
                warn!("fetch from {server} failed: {err}");
                return Err(err);
            }
            Err(_) => {
                warn!("fetch from {server} timed out");
                return Err(SchedulerError::Timeout);
            }
        };

        let count = envelopes.len();
        for envelope in envelopes {
            let contact_id = {
                let core = self.core.lock().await;
                route_tag_to_contact(&core, &envelope.to_group_tag)
            };
            match contact_id {
                Some(contact_id) => {
                    debug!("routed fetched envelope to contact {contact_id}");
                    let _ = self
                        .events_tx
                        .send(CoreEvent::NewMessage {
                            from: contact_id,
                            bytes: envelope.ciphertext,
                        })
                        .await;
                }
                None => warn!("fetched envelope matched no known contact tag"),
            }
        }
        Ok(count)
    }

    /// Runs the fetch loop until `shutdown` fires: polls at `fetch_interval`,
    /// or immediately whenever `fetch_now` is signalled.
    pub async fn run_fetch_loop(&self, mut fetch_now: mpsc::Receiver<()>, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => return,
                _ = fetch_now.recv() => {
                    let _ = self.drive_fetch_once().await;
                }
                _ = tokio::time::sleep(self.fetch_interval) => {
                    let _ = self.drive_fetch_once().await;
                }
            }
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now().timestamp()
    }
}

fn route_tag_to_contact(core: &Core, tag: &[u8]) -> Option<u64> {
    core.state
        .contacts
        .iter()
        .find(|(_, c)| c.peer_group_key.map(|k| k.as_bytes().as_slice() == tag).unwrap_or(false))
        .map(|(id, _)| *id)
}

/// Applies +/-20% jitter to a backoff duration, rounded to whole seconds and
/// never below 1.
fn jittered(base_secs: u64) -> u64 {
    let mut buf = [0u8; 1];
    protocol::primitives::random_bytes(&mut buf);
    let jitter_frac = (buf[0] % 41) as i64 - 20; // -20..=20 percent
    let adjusted = base_secs as i64 + (base_secs as i64 * jitter_frac) / 100;
    adjusted.max(1) as u64
}

/// An in-memory `RelayTransport` double for tests: two per-server queues
/// (one per direction) protected by a mutex, standing in for the
/// out-of-scope wire-framed relay client.
pub struct MockRelay {
    inbox: Mutex<std::collections::HashMap<String, Vec<RelayEnvelope>>>,
    fail_next: Mutex<std::collections::HashMap<String, u32>>,
}

impl Default for MockRelay {
    fn default() -> Self {
        MockRelay {
            inbox: Mutex::new(std::collections::HashMap::new()),
            fail_next: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects an envelope as if it had already arrived at `server`'s
    /// mailbox, for a test to then `drive_fetch_once` and observe.
    pub async fn deliver(&self, server: &str, envelope: RelayEnvelope) {
        self.inbox.lock().await.entry(server.to_string()).or_default().push(envelope);
    }

    /// Makes the next `n` sends to `server` fail with a transport error,
    /// to exercise the scheduler's retry/backoff path.
    pub async fn fail_next_sends(&self, server: &str, n: u32) {
        self.fail_next.lock().await.insert(server.to_string(), n);
    }
}

impl RelayTransport for MockRelay {
    async fn send(&self, server: &str, ciphertext: Vec<u8>) -> Result<(), SchedulerError> {
        let mut fail_next = self.fail_next.lock().await;
        if let Some(remaining) = fail_next.get_mut(server) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SchedulerError::Transport("mock induced failure".into()));
            }
        }
        drop(fail_next);
        self.inbox.lock().await.entry(server.to_string()).or_default().push(RelayEnvelope {
            to_group_tag: Vec::new(),
            ciphertext,
            received_time: 0,
        });
        Ok(())
    }

    async fn fetch(&self, server: &str) -> Result<Vec<RelayEnvelope>, SchedulerError> {
        let mut inbox = self.inbox.lock().await;
        Ok(inbox.remove(server).unwrap_or_default())
    }
}
