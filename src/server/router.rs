//! Per-message dispatch for an established control session.
//!
//! The driver owns the read loop and the session's lifecycle; every decoded
//! message lands here. Handlers touch only the shared stores and other
//! sessions' send queues, and they never close the calling session; fatal
//! conditions stay the driver's business.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::{ClientMessage, JoinType, ServerMessage};
use crate::server::friends::FriendRequestStore;
use crate::server::punch::PunchCoordinator;
use crate::server::registry::ConnectionRegistry;
use crate::server::relay::{CircuitError, RelayCircuits};
use crate::server::session::Session;

/// First version whose clients maintain a link to an external relay
/// instance. Grants from older clients always render against the local
/// relay.
const EXTERNAL_PROXY_VERSION: u32 = 3;

/// First version required to address join requests by connection id.
const DIRECT_JOIN_VERSION: u32 = 4;

/// Routes client messages against the shared server state.
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    friends: Arc<FriendRequestStore>,
    punch: Arc<PunchCoordinator>,
    circuits: Arc<RelayCircuits>,
    config: Arc<Config>,
}

impl Router {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        friends: Arc<FriendRequestStore>,
        punch: Arc<PunchCoordinator>,
        circuits: Arc<RelayCircuits>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            friends,
            punch,
            circuits,
            config,
        }
    }

    /// Applies one decoded message from `session`.
    ///
    /// `open_to_friends` is the session's own record of which accounts its
    /// world is currently published to; the driver replays it as closures
    /// when the session ends.
    pub async fn handle(
        &self,
        session: &Arc<Session>,
        open_to_friends: &mut HashSet<Uuid>,
        message: ClientMessage,
    ) {
        match message {
            ClientMessage::ListOnline { friends } => {
                self.fan_out(
                    session,
                    &friends,
                    ServerMessage::IsOnlineTo {
                        user: session.account,
                    },
                )
                .await;
            }
            ClientMessage::FriendRequest { to_user } => {
                let recipients = self.registry.by_account(to_user).await;
                if recipients.is_empty() {
                    self.friends.store_pending(session.account, to_user).await;
                    return;
                }
                let message = ServerMessage::FriendRequest {
                    from_user: session.account,
                    security: session.security,
                };
                for recipient in recipients {
                    if recipient.id != session.id {
                        recipient.send(message.clone()).await;
                    }
                }
            }
            ClientMessage::PublishedWorld { friends } => {
                open_to_friends.extend(friends.iter().copied());
                self.fan_out(
                    session,
                    &friends,
                    ServerMessage::PublishedWorld {
                        user: session.account,
                        connection_id: session.id,
                    },
                )
                .await;
            }
            ClientMessage::ClosedWorld { friends } => {
                for friend in &friends {
                    open_to_friends.remove(friend);
                }
                self.fan_out(
                    session,
                    &friends,
                    ServerMessage::ClosedWorld {
                        user: session.account,
                    },
                )
                .await;
            }
            ClientMessage::RequestJoin { friend } => {
                if session.protocol_version >= DIRECT_JOIN_VERSION {
                    warn!(
                        cid = %session.id,
                        "rejected legacy RequestJoin from a client new enough for RequestDirectJoin"
                    );
                    session
                        .send(ServerMessage::Error {
                            message: "Please use the v4+ RequestDirectJoin message instead of \
                                      the unsupported RequestJoin message"
                                .into(),
                            critical: false,
                        })
                        .await;
                    return;
                }
                let newest = self.registry.by_account(friend).await.pop();
                if let Some(target) = newest.filter(|target| target.id != session.id) {
                    target
                        .send(ServerMessage::RequestJoin {
                            user: session.account,
                            connection_id: session.id,
                        })
                        .await;
                }
            }
            ClientMessage::JoinGranted {
                connection_id,
                join_type,
            } => {
                let Some(response) = self.resolve_join(session, join_type) else {
                    session
                        .send(ServerMessage::Error {
                            message: format!("This server does not support JoinType {join_type}"),
                            critical: false,
                        })
                        .await;
                    return;
                };
                if connection_id == session.id {
                    return;
                }
                if let Some(target) = self.registry.by_id(connection_id).await {
                    target.send(response).await;
                }
            }
            ClientMessage::QueryRequest { friends } => {
                self.fan_out(
                    session,
                    &friends,
                    ServerMessage::QueryRequest {
                        friend: session.account,
                        connection_id: session.id,
                    },
                )
                .await;
            }
            ClientMessage::QueryResponse {
                connection_id,
                data,
            }
            | ClientMessage::NewQueryResponse {
                connection_id,
                data,
            } => {
                if connection_id == session.id {
                    return;
                }
                if let Some(target) = self.registry.by_id(connection_id).await {
                    // The send path downgrades this for pre-v5 recipients.
                    target
                        .send(ServerMessage::NewQueryResponse {
                            friend: session.account,
                            data,
                        })
                        .await;
                }
            }
            ClientMessage::ProxyS2CPacket { circuit_id, data } => {
                match self.circuits.send_to_client(circuit_id, session.id, data).await {
                    Ok(()) | Err(CircuitError::Missing) => {}
                    Err(CircuitError::NotOwner) => {
                        session
                            .send(ServerMessage::Error {
                                message: "Cannot send a packet to a connection that's not your own."
                                    .into(),
                                critical: false,
                            })
                            .await;
                    }
                }
            }
            ClientMessage::ProxyDisconnect { circuit_id } => {
                match self.circuits.close(circuit_id, session.id).await {
                    Ok(()) | Err(CircuitError::Missing) => {}
                    Err(CircuitError::NotOwner) => {
                        session
                            .send(ServerMessage::Error {
                                message: "Cannot disconnect a connection that's not your own."
                                    .into(),
                                critical: false,
                            })
                            .await;
                    }
                }
            }
            ClientMessage::RequestDirectJoin { connection_id } => {
                let target = self
                    .registry
                    .by_id(connection_id)
                    .await
                    .filter(|target| target.id != session.id);
                match target {
                    Some(target) => {
                        target
                            .send(ServerMessage::RequestJoin {
                                user: session.account,
                                connection_id: session.id,
                            })
                            .await;
                    }
                    None => {
                        session
                            .send(ServerMessage::ConnectionNotFound { connection_id })
                            .await;
                    }
                }
            }
            ClientMessage::RequestPunchOpen {
                target,
                purpose,
                cookie,
                my_host,
                my_port,
                // Local addresses only matter to the peers themselves.
                my_local_host: _,
                my_local_port: _,
            } => {
                self.punch
                    .request_open(session, target, purpose, cookie, my_host, my_port)
                    .await;
            }
            ClientMessage::PunchFailed { target: _, cookie } => {
                // The pending entry already knows both parties.
                self.punch.punch_failed(session, cookie).await;
            }
            ClientMessage::BeginPortLookup { lookup_id } => {
                self.punch.begin_lookup(session, lookup_id).await;
            }
            ClientMessage::PunchSuccess { cookie, host, port } => {
                self.punch.punch_succeeded(session, cookie, host, port).await;
            }
        }
    }

    /// Sends `message` to every live session of every listed friend, except
    /// the calling session when it lists its own account.
    async fn fan_out(&self, session: &Session, friends: &[Uuid], message: ServerMessage) {
        for friend in friends {
            for other in self.registry.by_account(*friend).await {
                if other.id != session.id {
                    other.send(message.clone()).await;
                }
            }
        }
    }

    /// Renders a join grant into the advert the guest will receive, or
    /// `None` when this server cannot honor the grant's join type.
    fn resolve_join(&self, granter: &Session, join_type: JoinType) -> Option<ServerMessage> {
        match join_type {
            JoinType::UPnP { port } => Some(ServerMessage::OnlineGame {
                host: granter.ip.to_string(),
                port,
                owner_connection_id: granter.id,
                punch_protocol: false,
            }),
            JoinType::Proxy => {
                let external = (granter.protocol_version >= EXTERNAL_PROXY_VERSION)
                    .then_some(granter.external_proxy.as_deref())
                    .flatten();
                let base_addr = external
                    .and_then(|proxy| proxy.base_addr.as_deref())
                    .or(self.config.base_addr.as_deref())?;
                let port = external
                    .map(|proxy| proxy.mc_port)
                    .unwrap_or(self.config.ex_java_port);
                Some(ServerMessage::OnlineGame {
                    host: format!("{}.{}", granter.id.to_words(), base_addr),
                    port,
                    owner_connection_id: granter.id,
                    punch_protocol: false,
                })
            }
            JoinType::Punch => (self.config.punch_port > 0).then(|| ServerMessage::OnlineGame {
                host: String::new(),
                port: 0,
                owner_connection_id: granter.id,
                punch_protocol: true,
            }),
        }
    }
}
