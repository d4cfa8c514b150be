use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::metrics::ARMED_WATCHES;
use crate::CacheError;
use crate::ConnectionState;
use crate::Result;
use crate::StoreClient;
use crate::WatchConfig;
use crate::WatchKind;
use crate::WatchedEvent;

/// Everything a dispatcher reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A store watch fired; the registration is already armed again
    Fired(WatchedEvent),
    /// The store refused the registration because the node is missing.
    /// The loop for `(path, kind)` has ended.
    Missing { path: String, kind: WatchKind },
    /// A registration that went stale on connection loss is armed again.
    /// Changes made while it was stale were not observed.
    Rearmed { path: String, kind: WatchKind },
    /// Connection transition, de-duplicated
    Connection(ConnectionState),
}

/// Connection as seen by the arm loops
///
/// `epoch` grows on every transition back to connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    connected: bool,
    epoch: u64,
}

struct Registration {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// What each arm loop needs from its dispatcher
#[derive(Clone)]
struct ArmContext {
    client: Arc<dyn StoreClient>,
    config: WatchConfig,
    events: mpsc::UnboundedSender<DispatchEvent>,
    link: watch::Receiver<Link>,
}

/// Turns one-shot store watches into continuous ones
///
/// Owns one re-arm loop per `(path, kind)` plus a connection relay. All
/// output goes to the single receiver returned by [`WatchDispatcher::new`].
pub struct WatchDispatcher {
    ctx: ArmContext,
    registrations: DashMap<(String, WatchKind), Registration>,
    shutdown: CancellationToken,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl WatchDispatcher {
    /// Create a dispatcher and spawn its connection relay
    ///
    /// Must be called within a Tokio runtime.
    /// Returns (dispatcher, event receiver) pair
    pub fn new(
        client: Arc<dyn StoreClient>,
        config: WatchConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DispatchEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();

        // Subscribe before reading the state so no transition falls in between
        let states = client.subscribe_connection_state();
        let initial = client.connection_state();
        let (link_tx, link_rx) = watch::channel(Link {
            connected: initial.is_connected(),
            epoch: 0,
        });

        let shutdown = CancellationToken::new();
        let relay = tokio::spawn(relay_connection_states(
            client.clone(),
            states,
            initial,
            link_tx,
            events.clone(),
            shutdown.clone(),
        ));

        let dispatcher = Self {
            ctx: ArmContext {
                client,
                config,
                events,
                link: link_rx,
            },
            registrations: DashMap::new(),
            shutdown,
            relay: Mutex::new(Some(relay)),
        };
        (dispatcher, events_rx)
    }

    /// Keeps a watch armed on `(path, kind)` until `unwatch` or `close`
    ///
    /// Resolves after the first registration attempt, so a read issued
    /// afterwards cannot miss a change. While disconnected it resolves at once
    /// and the loop arms on reconnection. Calling it again for a live loop is a
    /// no-op; a loop that ended (missing node) is restarted.
    pub async fn watch(
        &self,
        path: &str,
        kind: WatchKind,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(CacheError::Closed.into());
        }

        let armed_rx = {
            let entry = self.registrations.entry((path.to_string(), kind));
            if let Entry::Occupied(existing) = &entry {
                if !existing.get().handle.is_finished() {
                    return Ok(());
                }
            }

            let (armed_tx, armed_rx) = oneshot::channel();
            let token = self.shutdown.child_token();
            let handle = tokio::spawn(arm_loop(
                self.ctx.clone(),
                path.to_string(),
                kind,
                token.clone(),
                armed_tx,
            ));
            let _ = entry.insert(Registration { token, handle });
            armed_rx
        };

        // Sender dropped means the loop was cancelled before its first attempt
        let _ = armed_rx.await;
        Ok(())
    }

    /// Cancels one registration and releases its store watch
    pub async fn unwatch(
        &self,
        path: &str,
        kind: WatchKind,
    ) {
        let removed = self.registrations.remove(&(path.to_string(), kind));
        if let Some((_, registration)) = removed {
            registration.token.cancel();
            if let Err(e) = registration.handle.await {
                warn!(%path, ?kind, ?e, "arm loop ended abnormally");
            }
        }
    }

    /// Whether a live loop exists for `(path, kind)`
    pub fn is_watching(
        &self,
        path: &str,
        kind: WatchKind,
    ) -> bool {
        self.registrations
            .get(&(path.to_string(), kind))
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    /// Number of live arm loops
    pub fn active_count(&self) -> usize {
        self.registrations.iter().filter(|r| !r.handle.is_finished()).count()
    }

    /// Cancels every loop and waits for them to exit
    ///
    /// Every store watch held by this dispatcher is released when this
    /// returns. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let keys: Vec<(String, WatchKind)> = self.registrations.iter().map(|r| r.key().clone()).collect();
        let handles: Vec<JoinHandle<()>> = keys
            .into_iter()
            .filter_map(|key| self.registrations.remove(&key))
            .map(|(_, registration)| registration.handle)
            .collect();
        let count = handles.len();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(?e, "arm loop ended abnormally");
            }
        }

        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
        if count > 0 {
            debug!(loops = count, "watch dispatcher closed");
        }
    }

    /// Cancels every loop without waiting for them
    ///
    /// Each loop still releases its store watch as it exits.
    pub(crate) fn cancel(&self) {
        self.shutdown.cancel();
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
    }
}

impl Drop for WatchDispatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Forwards connection transitions once each and drives the loop link
async fn relay_connection_states(
    client: Arc<dyn StoreClient>,
    mut states: tokio::sync::broadcast::Receiver<ConnectionState>,
    initial: ConnectionState,
    link: watch::Sender<Link>,
    events: mpsc::UnboundedSender<DispatchEvent>,
    shutdown: CancellationToken,
) {
    let mut last = initial;
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = states.recv() => match received {
                Ok(state) => state,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection events lagged, re-reading state");
                    client.connection_state()
                }
                Err(RecvError::Closed) => break,
            },
        };

        if next == last || (next.is_connected() && last.is_connected()) {
            trace!(state = ?next, "duplicate connection event dropped");
            continue;
        }
        last = next;

        // Owner hears about the transition before any loop re-arms on it
        if events.send(DispatchEvent::Connection(next)).is_err() {
            break;
        }
        link.send_modify(|l| {
            if next.is_connected() {
                l.connected = true;
                l.epoch += 1;
            } else {
                l.connected = false;
            }
        });
        info!(state = ?next, epoch = link.borrow().epoch, "connection state relayed");
    }
}

fn link_ready(
    link: &Link,
    stale_epoch: Option<u64>,
) -> bool {
    link.connected && stale_epoch.map_or(true, |stale| link.epoch > stale)
}

fn retry_delay(config: &WatchConfig) -> Duration {
    let jitter = match config.rearm_retry_jitter_in_ms {
        0 => 0,
        max => rand::thread_rng().gen_range(0..=max),
    };
    config.rearm_retry_delay() + Duration::from_millis(jitter)
}

/// Re-arm loop of one `(path, kind)`
///
/// States: waiting for the link, armed, fired (event pending until re-armed),
/// stale (armed before a connection loss), missing, cancelled.
async fn arm_loop(
    mut ctx: ArmContext,
    path: String,
    kind: WatchKind,
    token: CancellationToken,
    armed_tx: oneshot::Sender<()>,
) {
    let mut armed_tx = Some(armed_tx);
    let mut signal_armed = move || {
        if let Some(tx) = armed_tx.take() {
            let _ = tx.send(());
        }
    };

    let mut pending: Option<WatchedEvent> = None;
    // Arming waits for a connection epoch newer than this one
    let mut stale_epoch: Option<u64> = None;
    // Changes may have been missed; report Rearmed on the next arm
    let mut missed = false;

    loop {
        if !link_ready(&ctx.link.borrow(), stale_epoch) {
            trace!(%path, ?kind, "arm deferred until reconnection");
            signal_armed();
            let ready = tokio::select! {
                _ = token.cancelled() => break,
                ready = ctx.link.wait_for(|l| link_ready(l, stale_epoch)) => ready.is_ok(),
            };
            if !ready {
                break;
            }
        }
        let epoch = ctx.link.borrow().epoch;

        match ctx.client.watch_once(&path, kind).await {
            Ok(mut watch) => {
                let watch_id = watch.id();
                ARMED_WATCHES.inc();
                trace!(%path, ?kind, watch_id = watch_id.0, epoch, "watch armed");
                signal_armed();

                stale_epoch = None;
                if std::mem::take(&mut missed) {
                    let _ = ctx.events.send(DispatchEvent::Rearmed {
                        path: path.clone(),
                        kind,
                    });
                }
                if let Some(event) = pending.take() {
                    let _ = ctx.events.send(DispatchEvent::Fired(event));
                }

                tokio::select! {
                    _ = token.cancelled() => {
                        ARMED_WATCHES.dec();
                        if let Err(e) = ctx.client.remove_watch(watch_id).await {
                            debug!(%path, ?kind, ?e, "remove_watch failed");
                        }
                        break;
                    }
                    fired = watch.fired() => {
                        ARMED_WATCHES.dec();
                        match fired {
                            Some(event) => {
                                trace!(%path, ?kind, event_type = ?event.event_type, "watch fired");
                                pending = Some(event);
                            }
                            None => {
                                debug!(%path, ?kind, epoch, "watch discarded by store, marked stale");
                                stale_epoch = Some(epoch);
                                missed = true;
                            }
                        }
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                signal_armed();
                if let Some(event) = pending.take() {
                    let _ = ctx.events.send(DispatchEvent::Fired(event));
                }
                debug!(%path, ?kind, "node missing, loop ends");
                let _ = ctx.events.send(DispatchEvent::Missing { path, kind });
                return;
            }
            Err(e) if e.is_connection_error() => {
                debug!(%path, ?kind, epoch, ?e, "arm failed on connection, retrying");
                signal_armed();
                missed = true;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(retry_delay(&ctx.config)) => {}
                }
            }
            Err(e) => {
                warn!(%path, ?kind, ?e, "arm failed, retrying");
                signal_armed();
                let delay = retry_delay(&ctx.config);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        if token.is_cancelled() {
            break;
        }
    }
    trace!(%path, ?kind, "arm loop cancelled");
}
