//! Server orchestration: the listeners, the per-session driver, and the
//! background tasks that keep the shared stores honest.
//!
//! One `Server` owns every shared component. The control listener accepts
//! client sessions and runs a driver for each; the relay listener terminates
//! game clients; the punch socket receives hole-punch datagrams. Everything
//! in between is message routing.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{Duration, Instant};
use tracing::{info, trace, warn};

use crate::analytics;
use crate::config::{Config, ExternalProxy};
use crate::crypto::{CryptoError, ServerKeyPair};
use crate::geo::{haversine_km, Geolocate};
use crate::identity::AccountVerifier;
use crate::protocol::{
    self, ClientMessage, SecurityLevel, ServerMessage, CURRENT_PROTOCOL_VERSION,
};
use crate::rate_limit::{connection_limiter, RateLimiter};

mod friends;
mod game_codec;
mod handshake;
mod punch;
mod registry;
mod relay;
mod router;
pub(crate) mod session;

pub use registry::ConnectionRegistry;

use friends::FriendRequestStore;
use punch::PunchCoordinator;
use relay::{RelayCircuits, RelayServer};
use router::Router;
use session::{is_disconnect, FrameError, FrameReader, Outbound, Session};

/// Delay between attempts to claim a contested connection id.
const COLLISION_RETRY: Duration = Duration::from_millis(10);

/// The assembled service.
pub struct Server {
    /// Resolved runtime configuration.
    config: Arc<Config>,
    /// Live control sessions.
    registry: Arc<ConnectionRegistry>,
    /// Friend requests waiting for their recipient to connect.
    friends: Arc<FriendRequestStore>,
    /// Pending hole punches and port lookups.
    punch: Arc<PunchCoordinator>,
    /// Relay circuits between game clients and world owners.
    circuits: Arc<RelayCircuits>,
    /// Message dispatch shared by every session driver.
    router: Router,
    /// Per-IP admission control for fresh connections.
    limiter: Arc<RateLimiter<IpAddr>>,
    /// This process's RSA identity for the auth handshake.
    keys: ServerKeyPair,
    /// Account ownership verification.
    verifier: Arc<dyn AccountVerifier>,
    /// IP location lookup for relay assignment and analytics.
    geolocate: Arc<dyn Geolocate>,
}

impl Server {
    pub fn new(
        config: Arc<Config>,
        verifier: Arc<dyn AccountVerifier>,
        geolocate: Arc<dyn Geolocate>,
    ) -> Result<Self, CryptoError> {
        info!("generating server key pair");
        let keys = ServerKeyPair::generate()?;
        let registry = Arc::new(ConnectionRegistry::new());
        let friends = Arc::new(FriendRequestStore::new());
        let punch = Arc::new(PunchCoordinator::new(Arc::clone(&registry)));
        let circuits = Arc::new(RelayCircuits::new());
        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&friends),
            Arc::clone(&punch),
            Arc::clone(&circuits),
            Arc::clone(&config),
        );
        Ok(Self {
            config,
            registry,
            friends,
            punch,
            circuits,
            router,
            limiter: Arc::new(connection_limiter()),
            keys,
            verifier,
            geolocate,
        })
    }

    /// Binds every listener and serves until the process exits.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            config = ?self.config,
            "starting server"
        );

        self.ping_external_proxies().await;
        self.spawn_relay().await?;
        self.spawn_punch().await?;
        self.spawn_analytics();
        self.spawn_shutdown_timer();
        Arc::clone(&self.limiter).start_sweep_task();

        info!(port = self.config.port, "starting control listener");
        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("failed to bind control port {}", self.config.port))?;
        info!(addr = %listener.local_addr()?, "control listener ready");
        self.serve_control(listener).await
    }

    /// Accepts control sessions on `listener` forever. `run` calls this with
    /// the configured port; tests hand in their own listener.
    pub async fn serve_control(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(server.drive_connection(stream, peer));
                }
                Err(err) => warn!(%err, "control accept failed"),
            }
        }
    }

    /// Terminates relayed game clients on `listener`.
    pub async fn serve_relay(self: Arc<Self>, listener: TcpListener) {
        let relay = Arc::new(RelayServer::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.circuits),
            self.config.base_addr.clone().unwrap_or_default(),
            self.config.relay_reconnect_grace,
        ));
        relay.run(listener).await;
    }

    /// Receives hole-punch datagrams on `socket`.
    pub async fn serve_punch(self: Arc<Self>, socket: UdpSocket) {
        Arc::clone(&self.punch).start_sweep_task();
        punch::run_udp_listener(Arc::clone(&self.punch), socket).await;
    }

    /// Best-effort reachability probe of each listed relay instance at
    /// startup. Failures are logged, not fatal; the entry stays usable.
    async fn ping_external_proxies(&self) {
        let Some(proxies) = &self.config.external_proxies else {
            return;
        };
        for proxy in proxies {
            let Some(addr) = &proxy.addr else { continue };
            info!(%addr, port = proxy.port, "pinging external proxy");
            match TcpStream::connect((addr.as_str(), proxy.port)).await {
                Ok(_) => info!(%addr, "external proxy responded"),
                Err(err) => warn!(%addr, %err, "external proxy did not respond"),
            }
        }
    }

    async fn spawn_relay(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.config.base_addr.is_none() {
            info!("relay disabled by request");
            return Ok(());
        }
        if let Some(proxies) = &self.config.external_proxies {
            if !proxies.iter().any(|proxy| proxy.addr.is_none()) {
                info!(
                    "the in-process relay is not in the external proxy list; \
                     clients will only fall back to it"
                );
            }
        }
        let port = self.config.in_java_port;
        info!(port, "starting relay");
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind relay port {port}"))?;
        info!(addr = %listener.local_addr()?, "relay listening");
        tokio::spawn(Arc::clone(self).serve_relay(listener));
        Ok(())
    }

    async fn spawn_punch(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.config.punch_port == 0 {
            info!("punch server disabled by request");
            return Ok(());
        }
        info!(port = self.config.punch_port, "starting punch server");
        let socket = UdpSocket::bind(("0.0.0.0", self.config.punch_port))
            .await
            .with_context(|| format!("failed to bind punch port {}", self.config.punch_port))?;
        tokio::spawn(Arc::clone(self).serve_punch(socket));
        Ok(())
    }

    fn spawn_analytics(&self) {
        tokio::spawn(analytics::run(
            Arc::clone(&self.registry),
            self.config.analytics_interval,
            self.config.analytics_file.clone(),
        ));
    }

    fn spawn_shutdown_timer(&self) {
        let Some(after) = self.config.shutdown_after else {
            return;
        };
        info!(seconds = after.as_secs(), "automatic shutdown scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            info!("automatic shutdown time reached, exiting");
            process::exit(0);
        });
    }

    /// Runs one control connection from accept to teardown.
    async fn drive_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(limited) = self.limiter.check(&peer.ip()).await {
            warn!(addr = %peer, %limited, "reconnecting too quickly");
            let (_, mut writer) = stream.into_split();
            let _ =
                handshake::write_raw_error(&mut writer, format!("Ratelimit exceeded! {limited}"))
                    .await;
            return;
        }

        let (mut reader, mut writer) = stream.into_split();
        let version = match handshake::read_protocol_version(&mut reader).await {
            Ok(Some(version)) => version,
            Ok(None) => {
                info!(addr = %peer, "received a ping connection (immediate disconnect)");
                return;
            }
            Err(err) => {
                warn!(addr = %peer, %err, "failed to read protocol version");
                return;
            }
        };
        if !protocol::is_supported(version) {
            let _ = handshake::write_raw_error(
                &mut writer,
                format!("Unsupported protocol version {version}"),
            )
            .await;
            return;
        }

        let credentials = match handshake::authenticate(
            &mut reader,
            &mut writer,
            version,
            &self.keys,
            self.verifier.as_ref(),
        )
        .await
        {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(addr = %peer, %err, "invalid handshake");
                let _ =
                    handshake::write_raw_error(&mut writer, format!("Invalid handshake: {err}"))
                        .await;
                return;
            }
        };

        let located = self.geolocate.locate(peer.ip());
        let country = located.map(|info| info.country);
        let external_proxy = located.and_then(|info| self.closest_proxy((info.lat, info.lon)));

        let (encryptor, decryptor) = match credentials.ciphers {
            Some((encryptor, decryptor)) => (Some(encryptor), Some(decryptor)),
            None => (None, None),
        };
        let outbound = Outbound::spawn(writer, encryptor, version);
        let mut reader = FrameReader::new(reader, decryptor);
        let session = Arc::new(Session::new(
            credentials.connection_id,
            peer.ip(),
            credentials.account,
            credentials.security,
            country,
            external_proxy,
            outbound,
        ));
        info!(
            cid = %session.id,
            account = %session.account,
            addr = %peer,
            version,
            security = ?session.security,
            "connection opened"
        );

        session
            .send(ServerMessage::ConnectionInfo {
                connection_id: session.id,
                base_ip: self.config.base_addr.clone().unwrap_or_default(),
                base_port: self.config.ex_java_port,
                user_ip: peer.ip().to_string(),
                protocol_version: CURRENT_PROTOCOL_VERSION as i32,
                punch_port: self.config.punch_port,
            })
            .await;
        if version < CURRENT_PROTOCOL_VERSION {
            warn!(
                cid = %session.id,
                client = version,
                server = CURRENT_PROTOCOL_VERSION,
                "client runs an outdated protocol"
            );
            session
                .send(ServerMessage::OutdatedWorldHost {
                    recommended_version: protocol::current_display_name().into(),
                })
                .await;
        }
        if session.security == SecurityLevel::Insecure && session.account.get_version_num() == 4 {
            session
                .send(ServerMessage::Error {
                    message: "You are using an old insecure version of World Host. It is \
                              highly recommended that you update to 0.4.14 or later."
                        .into(),
                    critical: false,
                })
                .await;
        }
        if let Some(warning) = credentials.warning {
            session
                .send(ServerMessage::Warning {
                    message: warning,
                    important: false,
                })
                .await;
        }
        if let Some(proxy) = &session.external_proxy {
            if let Some(addr) = &proxy.addr {
                session
                    .send(ServerMessage::ExternalProxyServer {
                        host: addr.clone(),
                        port: proxy.port,
                        base_addr: proxy.base_addr.clone().unwrap_or_else(|| addr.clone()),
                        mc_port: proxy.mc_port,
                    })
                    .await;
            }
        }

        if !self.register(&session).await {
            return;
        }
        let total = self.registry.len().await;
        info!(total, "session registered");

        for sender in self.friends.take_received(session.account).await {
            session
                .send(ServerMessage::FriendRequest {
                    from_user: sender,
                    security: SecurityLevel::implied_by(sender),
                })
                .await;
        }

        let mut open_to_friends = HashSet::new();
        loop {
            match reader.next_frame().await {
                Ok(Some((type_id, payload))) => {
                    match ClientMessage::decode(type_id, &payload, version) {
                        Ok(message) => {
                            trace!(cid = %session.id, ?message, "dispatching");
                            self.router
                                .handle(&session, &mut open_to_friends, message)
                                .await;
                        }
                        Err(err) => {
                            session.close_with_error(err.to_string()).await;
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(FrameError::Io(err)) => {
                    if !is_disconnect(&err) {
                        warn!(cid = %session.id, %err, "session read failed");
                    }
                    break;
                }
                Err(FrameError::Protocol(err)) => {
                    session.close_with_error(err.to_string()).await;
                    break;
                }
            }
        }

        session.close().await;
        self.registry.remove(&session).await;
        if !open_to_friends.is_empty() {
            let friends = open_to_friends.drain().collect();
            self.router
                .handle(
                    &session,
                    &mut open_to_friends,
                    ClientMessage::ClosedWorld { friends },
                )
                .await;
        }
        let total = self.registry.len().await;
        info!(cid = %session.id, total, "connection closed");
    }

    /// Claims the session's connection id, contending with any holder.
    ///
    /// A holder at the same address is evicted at once: that is the same
    /// client reconnecting before its old socket noticed. A holder at a
    /// different address keeps the id; the newcomer waits out a short grace
    /// window for a teardown in flight, then is turned away.
    async fn register(&self, session: &Arc<Session>) -> bool {
        let deadline = Instant::now() + self.config.id_collision_grace;
        loop {
            if self.registry.add(Arc::clone(session)).await {
                return true;
            }
            let Some(existing) = self.registry.by_id(session.id).await else {
                // The holder vanished between the failed add and now.
                continue;
            };
            if existing.ip == session.ip {
                existing
                    .close_with_error("Connection ID taken by same IP.")
                    .await;
                self.registry.force_add(Arc::clone(session)).await;
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    cid = %session.id,
                    addr = %session.ip,
                    "connection id held by another address"
                );
                session.close_with_error("That connection ID is taken.").await;
                return false;
            }
            tokio::time::sleep(COLLISION_RETRY).await;
        }
    }

    /// The listed relay instance nearest to `at`, unless that is this server
    /// itself (the entry without an addr).
    fn closest_proxy(&self, at: (f64, f64)) -> Option<Arc<ExternalProxy>> {
        let proxies = self.config.external_proxies.as_ref()?;
        proxies
            .iter()
            .min_by(|a, b| haversine_km(a.lat_long, at).total_cmp(&haversine_km(b.lat_long, at)))
            .filter(|proxy| proxy.addr.is_some())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::CsvGeolocate;
    use crate::identity::VerifyError;
    use crate::protocol::ConnectionId;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use tokio::io::DuplexStream;
    use uuid::Uuid;

    struct NoVerifier;

    #[async_trait]
    impl AccountVerifier for NoVerifier {
        async fn verify(&self, _username: &str, _auth_key: &str) -> Result<Uuid, VerifyError> {
            Err(VerifyError::Rejected)
        }
    }

    fn test_config(external_proxies: Option<Vec<Arc<ExternalProxy>>>) -> Config {
        Config {
            port: 9646,
            base_addr: Some("wh.example.com".into()),
            in_java_port: 25565,
            ex_java_port: 25565,
            punch_port: 9647,
            analytics_interval: Duration::ZERO,
            analytics_file: PathBuf::from("analytics.csv"),
            shutdown_after: None,
            id_collision_grace: Duration::from_millis(500),
            relay_reconnect_grace: Duration::from_secs(5),
            external_proxies,
            geo_db: None,
            log_dir: None,
            log_level: None,
        }
    }

    fn server(external_proxies: Option<Vec<Arc<ExternalProxy>>>) -> Server {
        Server::new(
            Arc::new(test_config(external_proxies)),
            Arc::new(NoVerifier),
            Arc::new(CsvGeolocate::empty()),
        )
        .expect("server")
    }

    fn proxy(addr: Option<&str>, lat_long: (f64, f64)) -> Arc<ExternalProxy> {
        Arc::new(ExternalProxy {
            addr: addr.map(str::to_owned),
            port: 9646,
            base_addr: addr.map(str::to_owned),
            mc_port: 25565,
            lat_long,
        })
    }

    fn session(raw_id: u64, ip: IpAddr) -> (Arc<Session>, FrameReader<DuplexStream>) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let outbound = Outbound::spawn(ours, None, 7);
        let session = Arc::new(Session::new(
            ConnectionId::new(raw_id).expect("id"),
            ip,
            Uuid::new_v4(),
            SecurityLevel::Secure,
            None,
            None,
            outbound,
        ));
        (session, FrameReader::new(theirs, None))
    }

    async fn next_message(reader: &mut FrameReader<DuplexStream>) -> ServerMessage {
        let (type_id, payload) = reader
            .next_frame()
            .await
            .expect("frame")
            .expect("message available");
        ServerMessage::decode(type_id, &payload).expect("decode")
    }

    #[test]
    fn closest_proxy_picks_the_nearest_reachable_entry() {
        let frankfurt = proxy(Some("eu.example.com"), (50.1, 8.7));
        let virginia = proxy(Some("us.example.com"), (38.9, -77.5));
        let listed = server(Some(vec![Arc::clone(&frankfurt), Arc::clone(&virginia)]));

        let near_paris = listed.closest_proxy((48.9, 2.4)).expect("proxy");
        assert!(Arc::ptr_eq(&near_paris, &frankfurt));
        let near_toronto = listed.closest_proxy((43.7, -79.4)).expect("proxy");
        assert!(Arc::ptr_eq(&near_toronto, &virginia));
    }

    #[test]
    fn closest_proxy_skips_the_local_entry_and_empty_lists() {
        let local = proxy(None, (50.1, 8.7));
        let virginia = proxy(Some("us.example.com"), (38.9, -77.5));
        let listed = server(Some(vec![local, virginia]));

        // Nearest to Frankfurt is the local entry, which is not sendable.
        assert!(listed.closest_proxy((50.0, 8.7)).is_none());
        assert!(listed.closest_proxy((38.9, -77.5)).is_some());

        assert!(server(None).closest_proxy((0.0, 0.0)).is_none());
        assert!(server(Some(Vec::new())).closest_proxy((0.0, 0.0)).is_none());
    }

    #[tokio::test]
    async fn register_evicts_a_same_address_holder() {
        let server = server(None);
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        let (old, mut old_rx) = session(77, ip);
        let (new, _new_rx) = session(77, ip);
        assert!(server.registry.add(Arc::clone(&old)).await);

        assert!(server.register(&new).await);

        assert_eq!(
            next_message(&mut old_rx).await,
            ServerMessage::Error {
                message: "Connection ID taken by same IP.".into(),
                critical: true,
            }
        );
        assert!(old_rx.next_frame().await.expect("eof").is_none());
        let holder = server.registry.by_id(new.id).await.expect("holder");
        assert!(Arc::ptr_eq(&holder, &new));

        // The evicted driver's cleanup must not unseat the new holder.
        server.registry.remove(&old).await;
        assert!(server.registry.by_id(new.id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn register_turns_away_a_different_address_after_the_grace() {
        let server = server(None);
        let (old, _old_rx) = session(77, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        let (new, mut new_rx) = session(77, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)));
        assert!(server.registry.add(Arc::clone(&old)).await);

        assert!(!server.register(&new).await);

        assert_eq!(
            next_message(&mut new_rx).await,
            ServerMessage::Error {
                message: "That connection ID is taken.".into(),
                critical: true,
            }
        );
        let holder = server.registry.by_id(old.id).await.expect("holder");
        assert!(Arc::ptr_eq(&holder, &old));
    }
}
