use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TunnelError};
use crate::protocol::{IncomingMessage, OutgoingMessage, TunnelRequest, TunnelResponse};

use super::events::{SessionEvent, SessionExit};
use super::http_proxy::replay;

/// Timers that drive the session lifecycle
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    /// Fixed delay between a lost connection and the next attempt
    pub retry_delay: Duration,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// Lifetime of an anonymous session, counted from its first registration
    pub anonymous_ttl: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(20),
            anonymous_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Authenticated,
    Anonymous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Registered,
    Disconnected,
}

/// The single live relay session.
///
/// Built fresh for every connection and dropped when the connection is lost.
/// `outbound` feeds the writer task, which is the only owner of the socket's
/// write half.
struct Session {
    status: SessionStatus,
    alias: Option<String>,
    outbound: mpsc::Sender<Message>,
}

impl Session {
    fn new(outbound: mpsc::Sender<Message>) -> Self {
        Self {
            status: SessionStatus::Connecting,
            alias: None,
            outbound,
        }
    }
}

pub struct TunnelClient {
    relay_url: String,
    relay_domain: String,
    local_port: u16,
    token: Option<String>,
    timings: SessionTimings,
    events_tx: Option<mpsc::Sender<SessionEvent>>,
    /// Set once, on the first registration of an anonymous session
    expires_at: watch::Sender<Option<Instant>>,
}

impl TunnelClient {
    pub fn new(
        relay_url: &str,
        relay_domain: &str,
        local_port: u16,
        token: Option<String>,
        timings: SessionTimings,
        events_tx: Option<mpsc::Sender<SessionEvent>>,
    ) -> Self {
        let (expires_at, _) = watch::channel(None);

        Self {
            relay_url: relay_url.to_string(),
            relay_domain: relay_domain.to_string(),
            local_port,
            token: token.filter(|t| !t.trim().is_empty()),
            timings,
            events_tx,
            expires_at,
        }
    }

    pub fn auth_mode(&self) -> AuthMode {
        if self.token.is_some() {
            AuthMode::Authenticated
        } else {
            AuthMode::Anonymous
        }
    }

    pub fn public_url(&self, alias: &str) -> String {
        format!("https://{}.{}", alias, self.relay_domain)
    }

    /// Keep a relay session alive until `shutdown` resolves or the anonymous
    /// lifetime runs out. Lost connections are retried forever after a fixed
    /// delay. In-flight replay tasks are not awaited.
    pub async fn run<F>(&self, shutdown: F) -> SessionExit
    where
        F: Future<Output = ()>,
    {
        self.run_with(shutdown, move || self.connect_and_run()).await
    }

    async fn run_with<F, C, Fut>(&self, shutdown: F, mut connect: C) -> SessionExit
    where
        F: Future<Output = ()>,
        C: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        tokio::pin!(shutdown);
        let expiry = wait_for_expiry(self.expires_at.subscribe());
        tokio::pin!(expiry);

        loop {
            self.send_event(SessionEvent::Connecting).await;

            let result = tokio::select! {
                result = connect() => result,
                _ = &mut shutdown => return SessionExit::Interrupted,
                _ = &mut expiry => return SessionExit::Expired,
            };

            let reason = match result {
                Ok(()) => "connection closed".to_string(),
                Err(e) => e.to_string(),
            };
            warn!("Disconnected from tunnel server: {}", reason);
            self.send_event(SessionEvent::Disconnected { reason }).await;

            info!(
                "Reconnecting in {} seconds...",
                self.timings.retry_delay.as_secs_f32()
            );
            tokio::select! {
                _ = tokio::time::sleep(self.timings.retry_delay) => {}
                _ = &mut shutdown => return SessionExit::Interrupted,
                _ = &mut expiry => return SessionExit::Expired,
            }
        }
    }

    async fn send_event(&self, event: SessionEvent) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(event).await;
        }
    }

    async fn connect_and_run(&self) -> Result<()> {
        info!("Connecting to {}...", self.relay_url);

        let (ws_stream, _) = connect_async(self.relay_url.as_str())
            .await
            .map_err(|e| TunnelError::ConnectionLost(format!("connection error: {}", e)))?;

        info!("Connected to tunnel server");

        let (write, read) = ws_stream.split();
        self.run_session(write, read).await
    }

    /// Register and serve one connection until either half of the socket
    /// fails. The writer and keepalive tasks are aborted whenever this future
    /// completes or is dropped, which releases the socket.
    async fn run_session<W, R>(&self, mut write: W, mut read: R) -> Result<()>
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: fmt::Display + Send,
        R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    {
        // This task exclusively owns the write half - every other writer
        // queues frames through the channel
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(256);
        let mut writer = AbortOnDropHandle::new(tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    return format!("send failed: {}", e);
                }
            }
            "writer closed".to_string()
        }));

        let mut session = Session::new(outbound);

        let register =
            OutgoingMessage::register(self.token.as_deref(), self.local_port).to_json()?;
        if session.outbound.send(Message::Text(register)).await.is_err() {
            return Err(TunnelError::ConnectionLost("failed to register".to_string()));
        }
        debug!("Sent register for port {}", self.local_port);

        // A failed ping ends the writer, which ends the read loop below
        let keepalive_tx = session.outbound.clone();
        let keepalive_interval = self.timings.keepalive_interval;
        let _keepalive = AbortOnDropHandle::new(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + keepalive_interval, keepalive_interval);
            loop {
                ticker.tick().await;
                if keepalive_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }));

        let lost = loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_message(IncomingMessage::from_json(&text), &mut session)
                            .await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.handle_message(IncomingMessage::from_slice(&data), &mut session)
                            .await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        debug!("Received ping, sending pong");
                        let _ = session.outbound.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("Received pong");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break format!(
                            "server closed connection: {:?}",
                            frame.map(|f| f.reason.to_string())
                        );
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break format!("read error: {}", e),
                    None => break "connection closed".to_string(),
                },
                reason = &mut writer => {
                    break reason.unwrap_or_else(|e| format!("writer task failed: {}", e));
                }
            }
        };

        session.status = SessionStatus::Disconnected;
        debug!(
            "Session for {:?} ended in state {:?}",
            session.alias, session.status
        );

        Err(TunnelError::ConnectionLost(lost))
    }

    async fn handle_message(&self, decoded: Result<IncomingMessage>, session: &mut Session) {
        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => {
                error!("Failed to parse message: {}", e);
                return;
            }
        };

        match msg {
            IncomingMessage::Registered { alias } => {
                let public_url = self.public_url(&alias);
                info!(
                    "Tunnel registered: {} -> localhost:{}",
                    public_url, self.local_port
                );

                session.status = SessionStatus::Registered;
                session.alias = Some(alias);

                if self.auth_mode() == AuthMode::Anonymous {
                    let deadline = Instant::now() + self.timings.anonymous_ttl;
                    self.expires_at.send_if_modified(|expires_at| {
                        if expires_at.is_none() {
                            *expires_at = Some(deadline);
                            true
                        } else {
                            false
                        }
                    });
                }

                self.print_status(&public_url);
                self.send_event(SessionEvent::Registered { public_url }).await;
            }

            IncomingMessage::Request(request) => {
                info!(
                    "{} {} -> localhost:{}",
                    request.method, request.path, self.local_port
                );

                self.send_event(SessionEvent::RequestDispatched {
                    id: request.id.clone(),
                    method: request.method.clone(),
                    path: request.path.clone(),
                })
                .await;

                spawn_replay(self.local_port, request, session.outbound.clone());
            }
        }
    }

    fn print_status(&self, public_url: &str) {
        println!();
        println!("Tunnel established");
        println!("Public URL:     {}", public_url);
        println!("Forwarding to:  http://localhost:{}", self.local_port);

        if self.auth_mode() == AuthMode::Anonymous {
            println!(
                "Anonymous session will expire in {}",
                format_lifetime(self.timings.anonymous_ttl)
            );
        }

        println!();
        println!("Waiting for connections...");
        println!();
    }
}

/// Run one replay task. Exactly one response is queued per request, even if
/// the replay panics.
fn spawn_replay(local_port: u16, request: TunnelRequest, outbound: mpsc::Sender<Message>) {
    tokio::spawn(async move {
        let id = request.id.clone();

        let response = match AssertUnwindSafe(replay(local_port, request))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(_) => {
                error!("Replay task for request {} panicked", id);
                TunnelResponse::internal_error(id)
            }
        };

        let json = match OutgoingMessage::Response(response).to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to encode response: {}", e);
                return;
            }
        };

        if outbound.send(Message::Text(json)).await.is_err() {
            warn!("Failed to send response: connection closed");
        }
    });
}

/// Human-readable session lifetime, e.g. "1 hour" or "90 minutes"
fn format_lifetime(ttl: Duration) -> String {
    let plural = |n: u64, unit: &str| {
        if n == 1 {
            format!("1 {}", unit)
        } else {
            format!("{} {}s", n, unit)
        }
    };

    match ttl.as_secs() {
        secs if secs >= 3600 && secs % 3600 == 0 => plural(secs / 3600, "hour"),
        secs if secs >= 60 && secs % 60 == 0 => plural(secs / 60, "minute"),
        secs => plural(secs, "second"),
    }
}

/// Resolves once the anonymous deadline (if one is ever set) has passed.
async fn wait_for_expiry(mut deadline: watch::Receiver<Option<Instant>>) {
    loop {
        let current = *deadline.borrow_and_update();
        if let Some(at) = current {
            tokio::time::sleep_until(at).await;
            return;
        }
        if deadline.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
