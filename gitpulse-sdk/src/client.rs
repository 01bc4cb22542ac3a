//! IRC client for bots.
//!
//! Manages the TCP (optionally TLS) connection, IRC registration, nick
//! fallback and keepalive, and emits [`Event`]s. Outgoing traffic goes
//! through a cloneable [`ClientHandle`] that queues commands until the
//! server has accepted registration.
//!
//! ## Reconnection
//!
//! A single connection does not reconnect by itself. Use
//! [`run_with_reconnect`] for a loop with exponential backoff that rejoins
//! configured channels after every successful registration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;

use crate::event::Event;
use crate::irc::Message;

/// Idle time before we probe the server with a PING.
const PING_INTERVAL: Duration = Duration::from_secs(60);
/// How long a probe may go unanswered before the link counts as dead.
const PING_TIMEOUT: Duration = Duration::from_secs(60);
/// Nick fallbacks tried (`nick_`, `nick__`, ...) before giving up.
const MAX_NICK_TRIES: u32 = 5;

/// Configuration for connecting to an IRC server.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Server address (host:port).
    pub server_addr: String,
    pub nick: String,
    /// Username (ident).
    pub user: String,
    pub realname: String,
    /// Use TLS. Port 6697 implies TLS regardless.
    pub tls: bool,
    /// Skip TLS certificate verification (for self-signed certs).
    pub tls_insecure: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6667".to_string(),
            nick: "gitpulse".to_string(),
            user: "gitpulse".to_string(),
            realname: "GitPulse".to_string(),
            tls: false,
            tls_insecure: false,
        }
    }
}

impl ConnectConfig {
    fn wants_tls(&self) -> bool {
        self.tls || self.server_addr.ends_with(":6697")
    }

    fn host(&self) -> &str {
        self.server_addr
            .rsplit_once(':')
            .map_or(self.server_addr.as_str(), |(host, _)| host)
    }
}

/// Commands the consumer can send to the client.
#[derive(Debug)]
pub enum Command {
    Join(String),
    Part(String),
    Privmsg { target: String, text: String },
    Raw(String),
    Quit(Option<String>),
}

impl Command {
    fn to_line(&self) -> String {
        match self {
            Command::Join(channel) => format!("JOIN {channel}"),
            Command::Part(channel) => format!("PART {channel}"),
            Command::Privmsg { target, text } => format!("PRIVMSG {target} :{text}"),
            Command::Raw(line) => line.clone(),
            Command::Quit(Some(reason)) => format!("QUIT :{reason}"),
            Command::Quit(None) => "QUIT".to_string(),
        }
    }
}

/// A handle to a running IRC client connection.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    pub async fn join(&self, channel: &str) -> Result<()> {
        self.send(Command::Join(channel.to_string())).await
    }

    pub async fn part(&self, channel: &str) -> Result<()> {
        self.send(Command::Part(channel.to_string())).await
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.send(Command::Privmsg {
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn quit(&self, message: Option<&str>) -> Result<()> {
        self.send(Command::Quit(message.map(str::to_string))).await
    }

    pub async fn raw(&self, line: &str) -> Result<()> {
        self.send(Command::Raw(line.to_string())).await
    }

    /// True once the connection task has exited.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// A handle with no connection behind it. Queued commands land in the
    /// returned receiver instead of on the wire.
    pub fn detached(buffer: usize) -> (Self, mpsc::Receiver<Command>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(buffer);
        (Self { cmd_tx }, cmd_rx)
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("IRC connection closed"))
    }
}

/// A connection that has completed TCP (and optionally TLS) but hasn't
/// started IRC registration yet.
pub enum EstablishedConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Establish TCP (and optionally TLS) connection to the server.
///
/// Kept separate from [`connect_with_stream`] so that connection errors
/// surface to the caller directly instead of as a `Disconnected` event.
pub async fn establish_connection(config: &ConnectConfig) -> Result<EstablishedConnection> {
    let tcp = TcpStream::connect(&config.server_addr)
        .await
        .with_context(|| format!("TCP connect to {} failed", config.server_addr))?;

    if !config.wants_tls() {
        tracing::debug!(server = %config.server_addr, "Connected (plain)");
        return Ok(EstablishedConnection::Plain(tcp));
    }

    let server_name = rustls::pki_types::ServerName::try_from(config.host().to_string())
        .with_context(|| format!("Invalid TLS server name {}", config.host()))?;
    let tls = tls_connector(config.tls_insecure)
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {} failed", config.server_addr))?;
    tracing::debug!(server = %config.server_addr, insecure = config.tls_insecure, "Connected (TLS)");
    Ok(EstablishedConnection::Tls(Box::new(tls)))
}

/// Connect using an already-established connection.
///
/// Returns a handle for sending commands and a receiver for events.
/// The IRC protocol runs in a spawned task.
pub fn connect_with_stream(
    conn: EstablishedConnection,
    config: ConnectConfig,
) -> (ClientHandle, mpsc::Receiver<Event>) {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let (cmd_tx, cmd_rx) = mpsc::channel(256);

    tokio::spawn(async move {
        let _ = event_tx.send(Event::Connected).await;
        let result = match conn {
            EstablishedConnection::Plain(tcp) => {
                let (reader, writer) = tokio::io::split(tcp);
                run_irc(BufReader::new(reader), writer, &config, &event_tx, cmd_rx).await
            }
            EstablishedConnection::Tls(tls) => {
                let (reader, writer) = tokio::io::split(*tls);
                run_irc(BufReader::new(reader), writer, &config, &event_tx, cmd_rx).await
            }
        };
        let reason = match result {
            Ok(reason) => reason,
            Err(e) => e.to_string(),
        };
        let _ = event_tx.send(Event::Disconnected { reason }).await;
    });

    (ClientHandle { cmd_tx }, event_rx)
}

/// Connect to an IRC server and run the client in a spawned task.
pub async fn connect(config: ConnectConfig) -> Result<(ClientHandle, mpsc::Receiver<Event>)> {
    let conn = establish_connection(&config).await?;
    Ok(connect_with_stream(conn, config))
}

fn tls_connector(insecure: bool) -> TlsConnector {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let builder = rustls::ClientConfig::builder();
    let config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// Certificate verifier for `tls_insecure`.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

// ── Protocol state ──

/// What the connection loop should do with an incoming line.
#[derive(Debug, PartialEq)]
enum Reaction {
    /// Write a line back to the server.
    Reply(String),
    /// Pass an event to the consumer.
    Emit(Event),
    /// Registration accepted under this nick.
    Welcome(String),
    /// Stop the connection.
    Close(String),
}

/// Per-connection protocol state, free of IO.
#[derive(Debug)]
struct Session {
    nick: String,
    registered: bool,
    nick_tries: u32,
    pending: Vec<Command>,
}

impl Session {
    fn new(nick: &str) -> Self {
        Self {
            nick: nick.to_string(),
            registered: false,
            nick_tries: 0,
            pending: Vec::new(),
        }
    }

    fn on_message(&mut self, msg: &Message) -> Option<Reaction> {
        let param = |i: usize| msg.params.get(i).cloned().unwrap_or_default();
        let sender = || msg.nick().unwrap_or_default().to_string();

        let reaction = match msg.command.as_str() {
            // ERR_NICKNAMEINUSE
            "433" if !self.registered => {
                self.nick_tries += 1;
                if self.nick_tries > MAX_NICK_TRIES {
                    return Some(Reaction::Close("Nick in use".to_string()));
                }
                let alt = format!("{}{}", self.nick, "_".repeat(self.nick_tries as usize));
                Reaction::Reply(format!("NICK {alt}"))
            }
            "001" => {
                self.registered = true;
                Reaction::Welcome(param(0))
            }
            "PING" => Reaction::Reply(format!("PONG :{}", param(0))),
            "JOIN" => Reaction::Emit(Event::Joined {
                channel: param(0),
                nick: sender(),
            }),
            "PART" => Reaction::Emit(Event::Parted {
                channel: param(0),
                nick: sender(),
            }),
            "KICK" if msg.params.len() >= 2 => Reaction::Emit(Event::Kicked {
                channel: param(0),
                nick: param(1),
                by: msg.nick().unwrap_or("server").to_string(),
                reason: param(2),
            }),
            "NICK" => {
                let (old_nick, new_nick) = (sender(), param(0));
                if old_nick.is_empty() || new_nick.is_empty() {
                    return None;
                }
                Reaction::Emit(Event::NickChanged { old_nick, new_nick })
            }
            "NOTICE" if !msg.prefix.as_deref().unwrap_or_default().contains('!') => {
                Reaction::Emit(Event::ServerNotice { text: param(1) })
            }
            "NOTICE" if msg.params.len() >= 2 => Reaction::Emit(Event::Notice {
                from: sender(),
                target: param(0),
                text: param(1),
            }),
            "PRIVMSG" if msg.params.len() >= 2 => Reaction::Emit(Event::Message {
                from: sender(),
                target: param(0),
                text: param(1),
                tags: msg.tags.clone(),
            }),
            "ERROR" => Reaction::Close(msg.params.join(" ")),
            numeric => {
                // Error numerics surface as notices
                let code = numeric.parse::<u16>().ok()?;
                if !(400..600).contains(&code) {
                    return None;
                }
                let text = msg
                    .params
                    .get(1..)
                    .filter(|p| !p.is_empty())
                    .unwrap_or(msg.params.as_slice());
                Reaction::Emit(Event::ServerNotice { text: text.join(" ") })
            }
        };
        Some(reaction)
    }

    /// Hold `cmd` until registration, except QUIT. Returns the command if
    /// it may go out now.
    fn admit(&mut self, cmd: Command) -> Option<Command> {
        if self.registered || matches!(cmd, Command::Quit(_)) {
            Some(cmd)
        } else {
            self.pending.push(cmd);
            None
        }
    }

    fn take_pending(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.pending)
    }
}

/// Drive one connection until it closes. Returns the close reason.
async fn run_irc<R, W>(
    reader: R,
    mut writer: W,
    config: &ConnectConfig,
    event_tx: &mpsc::Sender<Event>,
    mut cmd_rx: mpsc::Receiver<Command>,
) -> Result<String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_line(&mut writer, &format!("NICK {}", config.nick)).await?;
    send_line(&mut writer, &format!("USER {} 0 * :{}", config.user, config.realname)).await?;

    let mut session = Session::new(&config.nick);
    // `next_line` keeps a partial line buffered when another branch wins
    let mut lines = reader.lines();
    let mut probe_at = Instant::now() + PING_INTERVAL;
    let mut probing = false;

    loop {
        tokio::select! {
            read = lines.next_line() => {
                let Some(line) = read? else {
                    return Ok("EOF".to_string());
                };
                probe_at = Instant::now() + PING_INTERVAL;
                probing = false;
                tracing::trace!(line = %line, "<<");

                let reaction = Message::parse(&line).and_then(|msg| session.on_message(&msg));
                match reaction {
                    Some(Reaction::Reply(reply)) => send_line(&mut writer, &reply).await?,
                    Some(Reaction::Emit(event)) => {
                        let _ = event_tx.send(event).await;
                    }
                    Some(Reaction::Welcome(nick)) => {
                        let _ = event_tx.send(Event::Registered { nick }).await;
                        for cmd in session.take_pending() {
                            send_line(&mut writer, &cmd.to_line()).await?;
                        }
                    }
                    Some(Reaction::Close(reason)) => return Ok(reason),
                    None => {}
                }
            }
            cmd = cmd_rx.recv() => {
                // Every handle dropped
                let Some(cmd) = cmd else {
                    return Ok("Client closed".to_string());
                };
                if let Some(cmd) = session.admit(cmd) {
                    send_line(&mut writer, &cmd.to_line()).await?;
                    if matches!(cmd, Command::Quit(_)) {
                        return Ok("Quit".to_string());
                    }
                }
            }
            _ = tokio::time::sleep_until(probe_at) => {
                if probing {
                    return Ok("Ping timeout".to_string());
                }
                send_line(&mut writer, "PING :keepalive").await?;
                probing = true;
                probe_at = Instant::now() + PING_TIMEOUT;
            }
        }
    }
}

/// Strip line breaks so a single command can never smuggle a second one.
fn single_line(text: &str) -> String {
    text.chars().filter(|c| !matches!(c, '\r' | '\n' | '\0')).collect()
}

async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    tracing::trace!(line, ">>");
    let mut wire = single_line(line);
    wire.push_str("\r\n");
    writer.write_all(wire.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

// ── Reconnect helper ──

/// Configuration for automatic reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_factor: f64,
    /// Channels to (re)join after every registration.
    pub channels: Vec<String>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            channels: Vec::new(),
        }
    }
}

impl ReconnectConfig {
    fn next_delay(&self, delay: Duration) -> Duration {
        let grown = delay.mul_f64(self.backoff_factor) + jitter(delay / 4);
        grown.min(self.max_delay)
    }
}

/// Boxed future returned by a [`run_with_reconnect`] handler.
pub type HandlerFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

/// Run an event loop with automatic reconnection.
///
/// The `handler` is called for each event. When disconnected, the loop
/// reconnects with exponential backoff and rejoins configured channels.
/// Handler errors are logged and do not stop the loop; this function only
/// returns if the future is dropped.
pub async fn run_with_reconnect<F>(
    config: ConnectConfig,
    reconnect_config: ReconnectConfig,
    handler: F,
) -> Result<()>
where
    F: Fn(ClientHandle, Event) -> HandlerFuture + Send + Sync,
{
    let mut delay = reconnect_config.initial_delay;
    let mut failures = 0u32;

    loop {
        let conn = match establish_connection(&config).await {
            Ok(conn) => conn,
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    error = %e,
                    attempt = failures,
                    delay_secs = delay.as_secs(),
                    "Connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = reconnect_config.next_delay(delay);
                continue;
            }
        };

        let (handle, mut events) = connect_with_stream(conn, config.clone());
        while let Some(event) = events.recv().await {
            let disconnected = matches!(event, Event::Disconnected { .. });
            if matches!(event, Event::Registered { .. }) {
                // Only a registered session proves the server will have us
                failures = 0;
                delay = reconnect_config.initial_delay;
                // JOINs sent before registration are dropped by servers
                for channel in &reconnect_config.channels {
                    let _ = handle.join(channel).await;
                }
            }
            if let Err(e) = handler(handle.clone(), event).await {
                tracing::error!(error = %e, "Handler error");
            }
            if disconnected {
                break;
            }
        }

        tracing::info!(delay_secs = delay.as_secs(), "Disconnected, will reconnect");
        tokio::time::sleep(delay).await;
        delay = reconnect_config.next_delay(delay);
    }
}

/// Clock-derived jitter in `0..max`.
fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_millis(nanos % max_ms)
}
