//! NAT punch brokering and external-port discovery.
//!
//! A punch attempt is keyed by its client-chosen 128-bit cookie and runs
//! `Requested -> {Success, Cancelled, Expired}`; the terminal states are
//! mutually exclusive because every transition removes the pending entry
//! under the same lock that checks it. Port lookups follow the same
//! lifecycle keyed by a client-chosen UUID.
//!
//! Success arrives over the UDP side channel: when a peer's punch datagram
//! reaches us, the datagram payload names the cookie (or lookup id) and the
//! datagram's source address is the observed external endpoint we report
//! back over the control channel.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{ConnectionId, PunchCookie, ServerMessage};
use crate::server::registry::ConnectionRegistry;
use crate::server::session::Session;

/// How long a punch request or port lookup may stay unresolved.
pub const PENDING_TTL: Duration = Duration::from_secs(10);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Punch brokering requires this protocol version on both ends.
const PUNCH_PROTOCOL: u32 = 7;

struct PendingPunch {
    source: ConnectionId,
    target: ConnectionId,
    deadline_secs: u64,
}

struct PendingLookup {
    source: ConnectionId,
    deadline_secs: u64,
}

enum Expiring {
    Punch(PunchCookie),
    Lookup(Uuid),
}

#[derive(Default)]
struct PunchState {
    punches: HashMap<PunchCookie, PendingPunch>,
    lookups: HashMap<Uuid, PendingLookup>,
    /// Deadline second → entries that may expire then. Entries resolved
    /// earlier (or re-created with a later deadline) are skipped at pop.
    expiry: BTreeMap<u64, Vec<Expiring>>,
}

/// Brokered punch attempts and port lookups, plus their expiry index.
pub struct PunchCoordinator {
    state: Mutex<PunchState>,
    registry: Arc<ConnectionRegistry>,
    epoch: Instant,
}

impl PunchCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            state: Mutex::new(PunchState::default()),
            registry,
            epoch: Instant::now(),
        }
    }

    fn now_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Starts brokering one punch attempt from `source`.
    pub async fn request_open(
        &self,
        source: &Arc<Session>,
        target: ConnectionId,
        purpose: String,
        cookie: PunchCookie,
        source_host: String,
        source_port: u16,
    ) {
        let cancelled = ServerMessage::PunchRequestCancelled { cookie };
        let Some(target_session) = self.registry.by_id(target).await else {
            source.send(cancelled).await;
            return;
        };
        if target_session.protocol_version < PUNCH_PROTOCOL {
            debug!(
                cid = %source.id,
                target = %target,
                target_version = target_session.protocol_version,
                "punch target too old"
            );
            source.send(cancelled).await;
            return;
        }

        {
            let mut state = self.state.lock().await;
            if state.punches.contains_key(&cookie) {
                drop(state);
                source.send(cancelled).await;
                return;
            }
            let deadline_secs = self.now_secs() + PENDING_TTL.as_secs();
            state.punches.insert(
                cookie,
                PendingPunch {
                    source: source.id,
                    target,
                    deadline_secs,
                },
            );
            state
                .expiry
                .entry(deadline_secs)
                .or_default()
                .push(Expiring::Punch(cookie));
        }

        target_session
            .send(ServerMessage::PunchOpenRequest {
                cookie,
                purpose,
                from_host: source_host,
                from_port: source_port,
                connection_id: source.id,
                user: source.account,
                security: source.security,
            })
            .await;
    }

    /// A party reports it cannot complete the punch; the other side gets a
    /// cancellation. Unknown cookies and non-parties are ignored.
    pub async fn punch_failed(&self, sender: &Arc<Session>, cookie: PunchCookie) {
        let other = {
            let mut state = self.state.lock().await;
            let Some(pending) = state.punches.get(&cookie) else {
                return;
            };
            let other = if pending.source == sender.id {
                pending.target
            } else if pending.target == sender.id {
                pending.source
            } else {
                return;
            };
            state.punches.remove(&cookie);
            other
        };
        if let Some(session) = self.registry.by_id(other).await {
            session
                .send(ServerMessage::PunchRequestCancelled { cookie })
                .await;
        }
    }

    /// The target reports where the source can reach it directly. Only the
    /// pending request's target may resolve it this way.
    pub async fn punch_succeeded(
        &self,
        sender: &Arc<Session>,
        cookie: PunchCookie,
        host: String,
        port: u16,
    ) {
        let source = {
            let mut state = self.state.lock().await;
            match state.punches.get(&cookie) {
                Some(pending) if pending.target == sender.id => {
                    let source = pending.source;
                    state.punches.remove(&cookie);
                    source
                }
                _ => return,
            }
        };
        if let Some(session) = self.registry.by_id(source).await {
            session
                .send(ServerMessage::PunchSuccess { cookie, host, port })
                .await;
        }
    }

    /// Registers an external-port discovery attempt.
    pub async fn begin_lookup(&self, source: &Arc<Session>, lookup_id: Uuid) {
        let mut state = self.state.lock().await;
        if state.lookups.contains_key(&lookup_id) {
            return;
        }
        let deadline_secs = self.now_secs() + PENDING_TTL.as_secs();
        state.lookups.insert(
            lookup_id,
            PendingLookup {
                source: source.id,
                deadline_secs,
            },
        );
        state
            .expiry
            .entry(deadline_secs)
            .or_default()
            .push(Expiring::Lookup(lookup_id));
    }

    /// One datagram from the punch port. The payload is a punch cookie or a
    /// lookup id; anything else is ignored. The datagram's source address is
    /// what we report as the observed external endpoint.
    pub async fn handle_datagram(&self, payload: &[u8], from: SocketAddr) {
        let Ok(cookie) = PunchCookie::try_from(payload) else {
            return;
        };
        let punch_source = {
            let mut state = self.state.lock().await;
            state.punches.remove(&cookie).map(|pending| pending.source)
        };
        if let Some(source) = punch_source {
            debug!(%cookie, %from, "punch confirmed by network path");
            if let Some(session) = self.registry.by_id(source).await {
                session
                    .send(ServerMessage::PunchSuccess {
                        cookie,
                        host: from.ip().to_string(),
                        port: from.port(),
                    })
                    .await;
            }
            return;
        }

        let lookup_id = Uuid::from_bytes(*cookie.as_bytes());
        let lookup_source = {
            let mut state = self.state.lock().await;
            state.lookups.remove(&lookup_id).map(|pending| pending.source)
        };
        if let Some(source) = lookup_source {
            if let Some(session) = self.registry.by_id(source).await {
                session
                    .send(ServerMessage::PortLookupSuccess {
                        lookup_id,
                        host: from.ip().to_string(),
                        port: from.port(),
                    })
                    .await;
            }
        }
    }

    /// Pops every expiry bucket at or before the current second and cancels
    /// what is still pending.
    pub async fn sweep(&self) {
        let now = self.now_secs();
        let mut cancellations = Vec::new();
        {
            let mut state = self.state.lock().await;
            let mut due = Vec::new();
            while let Some(entry) = state.expiry.first_entry() {
                if *entry.key() > now {
                    break;
                }
                due.extend(entry.remove());
            }
            for expiring in due {
                match expiring {
                    Expiring::Punch(cookie) => {
                        let expired = state
                            .punches
                            .get(&cookie)
                            .is_some_and(|pending| pending.deadline_secs <= now);
                        if expired {
                            if let Some(pending) = state.punches.remove(&cookie) {
                                cancellations.push((
                                    pending.source,
                                    ServerMessage::PunchRequestCancelled { cookie },
                                ));
                            }
                        }
                    }
                    Expiring::Lookup(lookup_id) => {
                        let expired = state
                            .lookups
                            .get(&lookup_id)
                            .is_some_and(|pending| pending.deadline_secs <= now);
                        if expired {
                            if let Some(pending) = state.lookups.remove(&lookup_id) {
                                cancellations.push((
                                    pending.source,
                                    ServerMessage::CancelPortLookup { lookup_id },
                                ));
                            }
                        }
                    }
                }
            }
        }
        for (source, message) in cancellations {
            if let Some(session) = self.registry.by_id(source).await {
                session.send(message).await;
            }
        }
    }

    /// Spawns the once-a-second expiry sweep.
    pub fn start_sweep_task(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        });
    }

    #[cfg(test)]
    async fn pending_punches(&self) -> usize {
        self.state.lock().await.punches.len()
    }

    #[cfg(test)]
    async fn pending_lookups(&self) -> usize {
        self.state.lock().await.lookups.len()
    }
}

/// Receives punch/lookup datagrams until the socket fails.
pub async fn run_udp_listener(coordinator: Arc<PunchCoordinator>, socket: UdpSocket) {
    let mut buf = [0u8; 64];
    info!(addr = ?socket.local_addr().ok(), "punch listener ready");
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if let Some(payload) = buf.get(..len) {
                    coordinator.handle_datagram(payload, from).await;
                }
            }
            Err(err) => {
                warn!(%err, "punch listener receive failed");
                return;
            }
        }
    }
}
