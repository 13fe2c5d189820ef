//! IPC server implementation
//!
//! Operators connect over the Unix socket; payment terminals and slot
//! controllers connect over the optional TCP listener. Both speak the same
//! NDJSON protocol. Requests are forwarded to the daemon as
//! [`ServerMessage`]s; responses and stream frames share one writer per
//! connection.

use futures_core::Stream;
use slotkeeper_api::{
    ClientInfo, ClientRole, ErrorCode, ErrorInfo, Event, EventPayload, HardwareCommand, Request,
    Response,
};
use slotkeeper_util::{ClientId, SlotId};
use std::collections::HashMap;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{IpcError, IpcResult};

/// Keep-alive period for command streams unless configured otherwise
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Message from client to server
pub enum ServerMessage {
    Request {
        client_id: ClientId,
        request: Request,
    },
    ClientConnected {
        client_id: ClientId,
        info: ClientInfo,
    },
    ClientDisconnected {
        client_id: ClientId,
    },
}

/// IPC Server
pub struct IpcServer {
    socket_path: PathBuf,
    tcp_addr: Option<SocketAddr>,
    heartbeat: Duration,
    unix_listener: Option<UnixListener>,
    tcp_listener: Option<TcpListener>,
    clients: Arc<RwLock<HashMap<ClientId, ClientHandle>>>,
    message_tx: mpsc::UnboundedSender<ServerMessage>,
    message_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>>,
}

struct ClientHandle {
    info: ClientInfo,
    response_tx: mpsc::UnboundedSender<String>,
    /// Cancelled when the connection goes away; parent of every stream token
    cancel: CancellationToken,
    streams: HashMap<SlotId, CancellationToken>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            tcp_addr: None,
            heartbeat: DEFAULT_HEARTBEAT,
            unix_listener: None,
            tcp_listener: None,
            clients: Arc::new(RwLock::new(HashMap::new())),
            message_tx,
            message_rx: Arc::new(Mutex::new(Some(message_rx))),
        }
    }

    /// Also accept device clients on `addr`
    pub fn with_tcp_listener(mut self, addr: SocketAddr) -> Self {
        self.tcp_addr = Some(addr);
        self
    }

    /// Heartbeat period for command streams
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Start listening
    pub async fn start(&mut self) -> IpcResult<()> {
        // Remove existing socket if present
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Owner and group only
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;

        info!(path = %self.socket_path.display(), "IPC server listening");
        self.unix_listener = Some(listener);

        if let Some(addr) = self.tcp_addr {
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %listener.local_addr()?, "TCP listener started");
            self.tcp_listener = Some(listener);
        }

        Ok(())
    }

    /// Bound TCP address, if a TCP listener is running
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.tcp_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    /// Get receiver for server messages
    pub async fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.message_rx.lock().await.take()
    }

    /// Accept connections in a loop
    pub async fn run(&self) -> IpcResult<()> {
        let unix = self
            .unix_listener
            .as_ref()
            .ok_or_else(|| IpcError::ServerError("Server not started".into()))?;

        loop {
            tokio::select! {
                accepted = unix.accept() => match accepted {
                    Ok((stream, _)) => {
                        let uid = get_peer_uid(&stream);
                        let role = role_for_uid(uid);

                        let info = ClientInfo::new(role);
                        let info = if let Some(u) = uid {
                            info.with_uid(u)
                        } else {
                            info
                        };

                        info!(client_id = %info.client_id, uid = ?uid, role = ?role, "Client connected");

                        let (read_half, write_half) = stream.into_split();
                        self.handle_client(read_half, write_half, info).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },

                accepted = accept_tcp(self.tcp_listener.as_ref()) => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, "Failed to set TCP_NODELAY");
                        }

                        let info = ClientInfo::new(ClientRole::Device).with_peer_addr(addr.to_string());
                        info!(client_id = %info.client_id, peer = %addr, "TCP client connected");

                        let (read_half, write_half) = stream.into_split();
                        self.handle_client(read_half, write_half, info).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept TCP connection");
                    }
                },
            }
        }
    }

    async fn handle_client<R, W>(&self, read_half: R, write_half: W, info: ClientInfo)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let client_id = info.client_id.clone();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<String>();
        let cancel = CancellationToken::new();

        {
            let mut clients = self.clients.write().await;
            clients.insert(
                client_id.clone(),
                ClientHandle {
                    info: info.clone(),
                    response_tx: response_tx.clone(),
                    cancel: cancel.clone(),
                    streams: HashMap::new(),
                },
            );
        }

        let _ = self.message_tx.send(ServerMessage::ClientConnected {
            client_id: client_id.clone(),
            info,
        });

        // Reader task
        let message_tx = self.message_tx.clone();
        let reader_cancel = cancel.clone();
        let reader_id = client_id.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();

            loop {
                line.clear();
                let read = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    read = reader.read_line(&mut line) => read,
                };

                match read {
                    Ok(0) => {
                        debug!(client_id = %reader_id, "Client disconnected (EOF)");
                        break;
                    }
                    Ok(_) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }

                        match serde_json::from_str::<Request>(line) {
                            Ok(request) => {
                                let _ = message_tx.send(ServerMessage::Request {
                                    client_id: reader_id.clone(),
                                    request,
                                });
                            }
                            Err(e) => {
                                warn!(client_id = %reader_id, error = %e, "Invalid request");
                                let response = Response::error(
                                    0,
                                    ErrorInfo::new(
                                        ErrorCode::InvalidRequest,
                                        format!("Invalid request: {}", e),
                                    ),
                                );
                                if let Ok(json) = serde_json::to_string(&response) {
                                    let _ = response_tx.send(json);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!(client_id = %reader_id, error = %e, "Read error");
                        break;
                    }
                }
            }

            reader_cancel.cancel();
        });

        // Writer task
        let clients = self.clients.clone();
        let message_tx = self.message_tx.clone();

        tokio::spawn(async move {
            let mut writer = write_half;

            loop {
                tokio::select! {
                    biased;

                    Some(msg) = response_rx.recv() => {
                        let mut msg = msg;
                        msg.push('\n');
                        if let Err(e) = writer.write_all(msg.as_bytes()).await {
                            debug!(client_id = %client_id, error = %e, "Write error");
                            break;
                        }
                    }

                    _ = cancel.cancelled() => break,
                }
            }

            // Stops the reader and every command stream of this client
            cancel.cancel();

            clients.write().await.remove(&client_id);

            let _ = message_tx.send(ServerMessage::ClientDisconnected {
                client_id: client_id.clone(),
            });
        });
    }

    /// Send a response to a specific client
    pub async fn send_response(&self, client_id: &ClientId, response: Response) -> IpcResult<()> {
        let json = serde_json::to_string(&response)?;

        let clients = self.clients.read().await;
        if let Some(handle) = clients.get(client_id) {
            handle
                .response_tx
                .send(json)
                .map_err(|_| IpcError::ConnectionClosed)?;
        }

        Ok(())
    }

    /// Forward `commands` to the client as stream frames until the client
    /// disconnects, the stream is detached, or `commands` ends.
    ///
    /// A second stream for the same slot replaces the first. `commands` is
    /// dropped on every exit path.
    pub async fn attach_command_stream<S>(
        &self,
        client_id: &ClientId,
        slot_id: SlotId,
        commands: S,
    ) -> IpcResult<()>
    where
        S: Stream<Item = HardwareCommand> + Send + Unpin + 'static,
    {
        let (token, response_tx) = {
            let mut clients = self.clients.write().await;
            let handle = clients
                .get_mut(client_id)
                .ok_or(IpcError::ConnectionClosed)?;

            let token = handle.cancel.child_token();
            if let Some(previous) = handle.streams.insert(slot_id.clone(), token.clone()) {
                previous.cancel();
            }
            (token, handle.response_tx.clone())
        };

        let clients = Arc::clone(&self.clients);
        let client = client_id.clone();
        let heartbeat = self.heartbeat;
        tokio::spawn(async move {
            forward_commands(&client, &slot_id, commands, response_tx, &token, heartbeat).await;

            // Ended on its own or lost the connection: forget the stream
            // unless a newer one already took its place
            token.cancel();
            if let Some(handle) = clients.write().await.get_mut(&client) {
                handle.streams.retain(|_, t| !t.is_cancelled());
            }
        });

        Ok(())
    }

    /// Stop the client's stream for `slot_id`. Returns false if none was attached.
    pub async fn detach_command_stream(&self, client_id: &ClientId, slot_id: &SlotId) -> bool {
        let mut clients = self.clients.write().await;
        match clients
            .get_mut(client_id)
            .and_then(|h| h.streams.remove(slot_id))
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Tell every streaming client that the service is going away
    pub async fn broadcast_shutdown(&self) {
        let event = Event::new(EventPayload::Shutdown);
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize shutdown frame");
                return;
            }
        };

        let clients = self.clients.read().await;
        for handle in clients
            .values()
            .filter(|h| h.streams.values().any(|t| !t.is_cancelled()))
        {
            let _ = handle.response_tx.send(json.clone());
        }
    }

    /// Update a client's role (after authentication)
    pub async fn set_client_role(&self, client_id: &ClientId, role: ClientRole) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get_mut(client_id) {
            Some(handle) => {
                handle.info.role = role;
                true
            }
            None => false,
        }
    }

    /// Get client info
    pub async fn get_client_info(&self, client_id: &ClientId) -> Option<ClientInfo> {
        let clients = self.clients.read().await;
        clients.get(client_id).map(|h| h.info.clone())
    }

    /// Get connected client count
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn forward_commands<S>(
    client_id: &ClientId,
    slot_id: &SlotId,
    mut commands: S,
    response_tx: mpsc::UnboundedSender<String>,
    cancel: &CancellationToken,
    heartbeat: Duration,
) where
    S: Stream<Item = HardwareCommand> + Unpin,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(client_id = %client_id, slot_id = %slot_id, "Command stream attached");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,

            next = poll_fn(|cx| Pin::new(&mut commands).poll_next(cx)) => match next {
                Some(command) => Event::command(slot_id.clone(), command),
                None => break,
            },

            _ = ticker.tick() => Event::heartbeat(),
        };

        match serde_json::to_string(&event) {
            Ok(json) => {
                if response_tx.send(json).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize stream frame"),
        }
    }

    debug!(client_id = %client_id, slot_id = %slot_id, "Command stream closed");
}

async fn accept_tcp(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Unix peers running as root or as the service user administer the fleet
fn role_for_uid(uid: Option<u32>) -> ClientRole {
    match uid {
        Some(0) => ClientRole::Admin,
        Some(u) if u == nix::unistd::getuid().as_raw() => ClientRole::Admin,
        _ => ClientRole::Device,
    }
}

/// Get peer UID from Unix socket
fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsFd;

    let fd = stream.as_fd();

    match nix::sys::socket::getsockopt(&fd, nix::sys::socket::sockopt::PeerCredentials) {
        Ok(cred) => Some(cred.uid()),
        Err(_) => None,
    }
}
