//! In-process relay harness: a proxy on loopback, mock backends that speak
//! the server side of the handshake, and a mock client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use plexus_core::crypto::{generate_salt, EncryptionContext};
use plexus_core::token::{
    parse_certificate_chain, server_handshake_token, sign_login, verify_login_chain, TrustPolicy,
};
use plexus_core::wire::{
    self, client_handshake_ack, ChangeDimension, Disconnect, LoginPacket, ServerHandshake,
    StartGame,
};
use plexus_core::{Keypair, Packet};
use plexus_services::connection::{split, FrameReader, FrameWriter};
use plexus_services::{
    refuse_upstream, serve_upstream, ConnectionPool, ProxyContext, RelaySettings, ServerDescriptor,
    ServerDirectory, Session, SessionRegistry,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side id for game traffic the backends echo.
pub const ECHO: u32 = 0x90;
/// Backend-side id for echo replies.
pub const ECHO_REPLY: u32 = 0x91;

type Reader = FrameReader<ReadHalf<TcpStream>>;
type Writer = FrameWriter<WriteHalf<TcpStream>>;

/// Await `fut` or fail the test after `TIMEOUT`.
pub async fn within<T>(what: &str, fut: impl std::future::Future<Output = T>) -> Result<T> {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .with_context(|| format!("timed out waiting for {what}"))
}

// ── Mock backend ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub name: &'static str,
    pub dimension_id: i32,
    /// Delay between the handshake ack and start-of-session.
    pub start_delay: Duration,
    /// Send a server handshake whose x5u is not a key.
    pub bad_x5u: bool,
}

impl BackendOptions {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            dimension_id: 0,
            start_delay: Duration::ZERO,
            bad_x5u: false,
        }
    }
}

#[derive(Debug)]
pub enum BackendEvent {
    /// A login arrived; carries the display name from the chain.
    Login(String),
    /// The proxy acknowledged the handshake.
    Established,
    /// A game packet arrived after the handshake.
    Packet(Packet),
    /// The proxy closed the connection.
    Closed,
}

/// A backend server on loopback. Every connection runs the server side of
/// the handshake, then echoes `ECHO` packets back as `ECHO_REPLY` prefixed
/// with the backend name.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
    /// Packets pushed to every live connection after establishment.
    push: broadcast::Sender<Packet>,
}

impl MockBackend {
    pub async fn start(opts: BackendOptions) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (events_tx, events) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel(16);

        {
            let push = push.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let opts = opts.clone();
                    let events = events_tx.clone();
                    let push = push.subscribe();
                    tokio::spawn(async move {
                        let result = serve_backend(stream, &opts, &events, push).await;
                        if let Err(e) = result {
                            eprintln!("mock backend {}: {e:#}", opts.name);
                        }
                        let _ = events.send(BackendEvent::Closed);
                    });
                }
            });
        }

        Ok(Self { addr, events, push })
    }

    pub fn descriptor(&self, name: &str) -> ServerDescriptor {
        ServerDescriptor {
            name: name.to_string(),
            address: self.addr,
        }
    }

    pub fn push(&self, packet: Packet) {
        let _ = self.push.send(packet);
    }

    pub async fn next_event(&mut self) -> Result<BackendEvent> {
        within("backend event", self.events.recv())
            .await?
            .context("backend event channel closed")
    }

    /// Skip events until a game packet arrives.
    pub async fn next_packet(&mut self) -> Result<Packet> {
        loop {
            match self.next_event().await? {
                BackendEvent::Packet(p) => return Ok(p),
                BackendEvent::Closed => bail!("backend connection closed"),
                _ => {}
            }
        }
    }

    pub async fn expect_login(&mut self) -> Result<String> {
        match self.next_event().await? {
            BackendEvent::Login(name) => Ok(name),
            other => bail!("expected a login, got {other:?}"),
        }
    }

    pub async fn expect_closed(&mut self) -> Result<()> {
        loop {
            if let BackendEvent::Closed = self.next_event().await? {
                return Ok(());
            }
        }
    }
}

async fn serve_backend(
    stream: TcpStream,
    opts: &BackendOptions,
    events: &mpsc::UnboundedSender<BackendEvent>,
    mut push: broadcast::Receiver<Packet>,
) -> Result<()> {
    let (mut reader, mut writer) = split(stream);

    let Some(first) = reader.read_packet().await? else {
        return Ok(());
    };
    let login = LoginPacket::decode(&first)?;
    let verified = verify_login_chain(
        &login.chain,
        &login.client_data,
        &TrustPolicy::Verify { anchors: vec![] },
    )?;
    let _ = events.send(BackendEvent::Login(verified.profile.display_name.clone()));

    let server = Keypair::generate();
    let salt = generate_salt();
    let token = if opts.bad_x5u {
        forged_token(r#"{"alg":"ES384","x5u":"not-a-key"}"#, r#"{"salt":"AAAA"}"#)
    } else {
        server_handshake_token(&server, &salt)?.as_str().to_string()
    };
    writer.write_packet(&ServerHandshake { token }.encode()).await?;

    let key = EncryptionContext::new(&server, verified.identity_key, salt.to_vec())?
        .into_symmetric_key();
    reader.enable_encryption(&key);
    writer.enable_encryption(&key);

    match reader.read_packet().await? {
        Some(p) if p.id() == wire::CLIENT_TO_SERVER_HANDSHAKE => {
            let _ = events.send(BackendEvent::Established);
        }
        Some(p) => bail!("expected handshake ack, got {}", p.name()),
        None => return Ok(()),
    }

    if !opts.start_delay.is_zero() {
        tokio::time::sleep(opts.start_delay).await;
    }
    writer.write_packet(&start_game(opts.dimension_id)).await?;

    loop {
        tokio::select! {
            read = reader.read_packet() => {
                let Some(packet) = read? else { return Ok(()) };
                if packet.id() == ECHO {
                    let mut body = format!("{}:", opts.name).into_bytes();
                    body.extend_from_slice(packet.payload());
                    writer.write_packet(&Packet::new(ECHO_REPLY, &body)).await?;
                }
                let _ = events.send(BackendEvent::Packet(packet));
            }
            pushed = push.recv() => match pushed {
                Ok(packet) => writer.write_packet(&packet).await?,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

pub fn start_game(dimension_id: i32) -> Packet {
    StartGame {
        unique_entity_id: -1,
        runtime_entity_id: 1,
        gamemode: 0,
        position: [0.5, 64.0, 0.5],
        rotation: [0.0, 90.0],
        seed: 1234,
        dimension_id,
        trailing: Default::default(),
    }
    .encode()
}

pub fn change_dimension(dimension_id: i32) -> Packet {
    ChangeDimension {
        dimension_id,
        position: [0.0, 64.0, 0.0],
        respawn: false,
    }
    .encode()
}

/// A structurally valid token with an arbitrary header and junk signature.
pub fn forged_token(header: &str, claims: &str) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(claims),
        URL_SAFE_NO_PAD.encode([0u8; 96])
    )
}

// ── Proxy ─────────────────────────────────────────────────────────────────────

pub struct Proxy {
    pub addr: SocketAddr,
    pub ctx: Arc<ProxyContext>,
}

impl Proxy {
    /// Start a proxy over `servers`; the first one is the default.
    pub async fn start(servers: Vec<ServerDescriptor>) -> Result<Self> {
        Self::start_with(servers, |_| {}).await
    }

    pub async fn start_with(
        servers: Vec<ServerDescriptor>,
        tweak: impl FnOnce(&mut RelaySettings),
    ) -> Result<Self> {
        let default = servers.first().map(|s| s.name.clone());
        let directory = ServerDirectory::new(servers, default.as_deref())?;
        let pool = ConnectionPool::new([127, 0, 0, 1].into(), 0, 0);
        let mut settings = RelaySettings {
            handshake_timeout: TIMEOUT,
            pending_limit: 64,
            max_sessions: 0,
            trust: TrustPolicy::Verify { anchors: vec![] },
        };
        tweak(&mut settings);

        let ctx = ProxyContext::new(
            directory,
            SessionRegistry::new(),
            pool,
            Arc::new(Keypair::generate()),
            settings,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                while let Ok((stream, peer)) = listener.accept().await {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if ctx.on_connection_request(peer) {
                            let _ = serve_upstream(ctx, stream, peer).await;
                        } else {
                            refuse_upstream(&ctx, stream).await;
                        }
                    });
                }
            });
        }

        Ok(Self { addr, ctx })
    }

    pub fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.ctx
            .registry
            .lookup(&plexus_services::ClientIdentity::new(name))
    }

    /// Wait until the registry has a session for `name`.
    pub async fn wait_for_session(&self, name: &str) -> Result<Arc<Session>> {
        within("session registration", async {
            loop {
                if let Some(s) = self.session(name) {
                    return s;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    }
}

// ── Mock client ───────────────────────────────────────────────────────────────

pub struct MockClient {
    reader: Reader,
    writer: Writer,
    keypair: Keypair,
}

impl MockClient {
    pub async fn connect(proxy: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(proxy).await?;
        let (reader, writer) = split(stream);
        Ok(Self {
            reader,
            writer,
            keypair: Keypair::generate(),
        })
    }

    pub fn login_packet(&self, name: &str) -> Result<Packet> {
        let extra = serde_json::json!({
            "displayName": name,
            "XUID": "2535400000000042",
            "identity": "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
        });
        let mut client_claims = serde_json::Map::new();
        client_claims.insert("DeviceOS".into(), 7.into());
        let tokens = sign_login(&self.keypair, extra, client_claims)?;
        Ok(LoginPacket {
            protocol_version: 800,
            chain: tokens.chain,
            client_data: tokens.client_data,
        }
        .encode()?)
    }

    /// Log in and finish the client side of the handshake.
    pub async fn login(&mut self, name: &str) -> Result<()> {
        self.start_login(name).await?;
        self.send(&client_handshake_ack()).await
    }

    /// Everything up to and including key installation, without the ack.
    pub async fn start_login(&mut self, name: &str) -> Result<()> {
        let login = self.login_packet(name)?;
        self.send(&login).await?;

        let reply = self.recv().await?;
        if reply.id() == wire::DISCONNECT {
            bail!("refused: {}", Disconnect::decode(&reply)?.message);
        }
        let handshake = ServerHandshake::decode(&reply)?;
        let token = parse_certificate_chain(&handshake.token)?;
        token.verify_self_signed()?;
        let key = EncryptionContext::new(&self.keypair, token.issuer_public_key()?, token.salt()?)?
            .into_symmetric_key();

        self.reader.enable_encryption(&key);
        self.writer.enable_encryption(&key);
        Ok(())
    }

    /// Log in and wait for start-of-session. Returns its dimension.
    pub async fn join(&mut self, name: &str) -> Result<i32> {
        self.login(name).await?;
        let start = self.recv_id(wire::START_GAME).await?;
        Ok(StartGame::decode(&start)?.dimension_id)
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        self.writer.write_packet(packet).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Packet> {
        within("packet from proxy", self.reader.read_packet())
            .await??
            .context("proxy closed the connection")
    }

    /// Skip packets until one with `id` arrives.
    pub async fn recv_id(&mut self, id: u32) -> Result<Packet> {
        loop {
            let packet = self.recv().await?;
            if packet.id() == id {
                return Ok(packet);
            }
            if packet.id() == wire::DISCONNECT {
                bail!("disconnected: {}", Disconnect::decode(&packet)?.message);
            }
        }
    }

    pub async fn echo(&mut self, body: &str) -> Result<String> {
        self.send(&Packet::new(ECHO, body.as_bytes())).await?;
        let reply = self.recv_id(ECHO_REPLY).await?;
        Ok(String::from_utf8(reply.payload().to_vec())?)
    }

    /// Read until a disconnect; returns its message.
    pub async fn expect_disconnect(&mut self) -> Result<String> {
        loop {
            let packet = self.recv().await?;
            if packet.id() == wire::DISCONNECT {
                return Ok(Disconnect::decode(&packet)?.message);
            }
        }
    }

    /// True once the proxy has closed the socket.
    pub async fn expect_eof(&mut self) -> Result<()> {
        loop {
            match within("end of stream", self.reader.read_packet()).await? {
                Ok(None) | Err(_) => return Ok(()),
                Ok(Some(_)) => {}
            }
        }
    }
}
