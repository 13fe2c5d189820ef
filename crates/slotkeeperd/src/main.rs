//! slotkeeperd - The slotkeeper parking service
//!
//! This is the main entry point for the slotkeeperd service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization and first-start fleet provisioning
//! - The command fanout registry and the parking engine
//! - IPC server (Unix socket for operators, optional TCP for devices)
//! - Background overstay sweep

use anyhow::{Context, Result};
use clap::Parser;
use slotkeeper_api::{
    ClientRole, Command, ErrorCode, ErrorInfo, HealthStatus, Response, ResponsePayload,
};
use slotkeeper_config::{Settings, load_config};
use slotkeeper_core::{CommandFanout, CoreError, ParkingEngine};
use slotkeeper_ipc::{IpcServer, ServerMessage};
use slotkeeper_store::{AuditEvent, AuditEventType, SqliteStore, Store};
use slotkeeper_util::{ClientId, default_config_path};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// slotkeeperd - Parking slot state and barrier command service
#[derive(Parser, Debug)]
#[command(name = "slotkeeperd")]
#[command(about = "Parking slot state and barrier command service", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/slotkeeper/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set SLOTKEEPER_SOCKET env var)
    #[arg(short, long, env = "SLOTKEEPER_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set SLOTKEEPER_DATA_DIR env var)
    #[arg(short, long, env = "SLOTKEEPER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// TCP address for payment terminals and slot controllers
    #[arg(short, long)]
    tcp_listen: Option<SocketAddr>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Main service state
struct Service {
    engine: Arc<ParkingEngine>,
    ipc: Arc<IpcServer>,
    store: Arc<dyn Store>,
    settings: Settings,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let settings = Self::load_settings(args)?;

        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| settings.service.socket_path.clone());

        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| settings.service.data_dir.clone());

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        // Initialize store
        let db_path = data_dir.join("slotkeeper.db");
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );

        info!(db_path = %db_path.display(), "Store initialized");

        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        // The fanout registry lives exactly as long as the service
        let fanout = CommandFanout::new();
        let engine = Arc::new(ParkingEngine::new(store.clone(), fanout));

        let provisioned = engine
            .ensure_slots(&settings.slots.slot_ids(), slotkeeper_util::now())
            .context("Failed to provision slots")?;
        if provisioned > 0 {
            info!(count = provisioned, "Provisioned initial fleet");
        }

        // Initialize IPC server
        let mut ipc = IpcServer::new(&socket_path).with_heartbeat(settings.service.heartbeat);
        if let Some(addr) = args.tcp_listen.or(settings.service.tcp_listen) {
            ipc = ipc.with_tcp_listener(addr);
        }
        ipc.start().await?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        Ok(Self {
            engine,
            ipc: Arc::new(ipc),
            store,
            settings,
        })
    }

    fn load_settings(args: &Args) -> Result<Settings> {
        if !args.config.exists() && args.config == default_config_path() {
            warn!(
                config_path = %args.config.display(),
                "No configuration file found, using defaults"
            );
            return Ok(Settings::default());
        }

        let settings = load_config(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;

        info!(
            config_path = %args.config.display(),
            tcp_listen = ?settings.service.tcp_listen,
            "Configuration loaded"
        );

        Ok(settings)
    }

    async fn run(self) -> Result<()> {
        let ipc_ref = self.ipc.clone();
        let mut ipc_messages = ipc_ref
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        let engine = self.engine.clone();
        let store = self.store.clone();
        let admin_token = self.settings.service.admin_token.clone();

        // Spawn IPC accept task
        let ipc_accept = ipc_ref.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        // Set up signal handlers
        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to create SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to create SIGHUP handler")?;

        let mut sweep_timer = self.settings.service.overstay_sweep.map(tokio::time::interval);

        info!("Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, shutting down gracefully");
                    break;
                }

                // Promote overdue sessions even when nobody is reading
                _ = next_sweep(&mut sweep_timer) => {
                    if let Err(e) = engine.sweep_overstays(slotkeeper_util::now()) {
                        warn!(error = %e, "Overstay sweep failed");
                    }
                }

                Some(msg) = ipc_messages.recv() => {
                    Self::handle_ipc_message(&engine, &ipc_ref, &store, admin_token.as_deref(), msg).await;
                }
            }
        }

        info!("Shutting down slotkeeperd");

        ipc_ref.broadcast_shutdown().await;

        if let Err(e) = store.append_audit(AuditEvent::new(AuditEventType::ServiceStopped)) {
            warn!(error = %e, "Failed to log service shutdown");
        }

        info!("Shutdown complete");
        Ok(())
    }

    async fn handle_ipc_message(
        engine: &Arc<ParkingEngine>,
        ipc: &Arc<IpcServer>,
        store: &Arc<dyn Store>,
        admin_token: Option<&str>,
        msg: ServerMessage,
    ) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                let response = Self::handle_command(
                    engine,
                    ipc,
                    admin_token,
                    &client_id,
                    request.request_id,
                    request.command,
                )
                .await;

                let _ = ipc.send_response(&client_id, response).await;
            }

            ServerMessage::ClientConnected { client_id, info } => {
                info!(
                    client_id = %client_id,
                    role = ?info.role,
                    uid = ?info.uid,
                    peer = ?info.peer_addr,
                    "Client connected"
                );

                let _ = store.append_audit(AuditEvent::new(AuditEventType::ClientConnected {
                    client_id: client_id.to_string(),
                    role: format!("{:?}", info.role),
                    uid: info.uid,
                }));
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");

                let _ = store.append_audit(AuditEvent::new(AuditEventType::ClientDisconnected {
                    client_id: client_id.to_string(),
                }));
            }
        }
    }

    async fn handle_command(
        engine: &Arc<ParkingEngine>,
        ipc: &Arc<IpcServer>,
        admin_token: Option<&str>,
        client_id: &ClientId,
        request_id: u64,
        command: Command,
    ) -> Response {
        let now = slotkeeper_util::now();

        if requires_admin(&command) {
            let role = ipc
                .get_client_info(client_id)
                .await
                .map(|info| info.role)
                .unwrap_or(ClientRole::Device);
            if !role.can_administer() {
                return Response::error(
                    request_id,
                    ErrorInfo::new(ErrorCode::PermissionDenied, "Admin role required"),
                );
            }
        }

        let result = match command {
            Command::Ping => Ok(ResponsePayload::Pong),

            Command::GetHealth => {
                let store_ok = engine.is_store_healthy();
                Ok(ResponsePayload::Health(HealthStatus {
                    live: true,
                    ready: store_ok,
                    store_ok,
                    slot_count: engine.slot_count().unwrap_or(0),
                    subscriber_count: engine.subscriber_count(),
                }))
            }

            Command::Authenticate { token } => {
                if !token_matches(admin_token, &token) {
                    warn!(client_id = %client_id, "Rejected admin token");
                    return Response::error(
                        request_id,
                        ErrorInfo::new(ErrorCode::PermissionDenied, "Invalid admin token"),
                    );
                }

                ipc.set_client_role(client_id, ClientRole::Admin).await;
                info!(client_id = %client_id, "Client authenticated as admin");
                Ok(ResponsePayload::Authenticated {
                    role: ClientRole::Admin,
                })
            }

            Command::ListSlots => engine
                .list_slots(now)
                .map(|slots| ResponsePayload::Slots { slots }),

            Command::GetSlot { slot_id } => engine.get_slot(&slot_id, now).map(ResponsePayload::Slot),

            Command::InitializeSlots { count } => engine
                .initialize_slots(count, now)
                .map(|slots| ResponsePayload::Slots { slots }),

            Command::AddSlot { slot_id } => engine.add_slot(slot_id, now).map(ResponsePayload::Slot),

            Command::DeleteSlot { slot_id } => engine
                .delete_slot(&slot_id, now)
                .map(|()| ResponsePayload::SlotDeleted { slot_id }),

            Command::ConfirmPayment { slot_id, minutes } => engine
                .confirm_payment(&slot_id, minutes, now)
                .map(ResponsePayload::Slot),

            Command::ApplyEvent {
                slot_id,
                event,
                minutes,
            } => engine
                .apply_event(&slot_id, &event, minutes, now)
                .map(ResponsePayload::Slot),

            Command::ApplyAdminCommand { slot_id, command } => engine
                .apply_admin_command(&slot_id, &command, now)
                .map(ResponsePayload::Slot),

            Command::PollCommand { slot_id } => engine
                .poll_command(&slot_id, now)
                .map(ResponsePayload::Polled),

            Command::SubscribeCommands { slot_id } => match engine.subscribe_commands(&slot_id) {
                Ok(subscription) => {
                    if let Err(e) = ipc
                        .attach_command_stream(client_id, slot_id.clone(), subscription)
                        .await
                    {
                        debug!(client_id = %client_id, error = %e, "Client left before stream attached");
                    }
                    Ok(ResponsePayload::Subscribed {
                        client_id: client_id.clone(),
                        slot_id,
                    })
                }
                Err(e) => Err(e),
            },

            Command::UnsubscribeCommands { slot_id } => {
                ipc.detach_command_stream(client_id, &slot_id).await;
                Ok(ResponsePayload::Unsubscribed { slot_id })
            }
        };

        match result {
            Ok(payload) => Response::success(request_id, payload),
            Err(e) => core_error_response(request_id, e),
        }
    }
}

/// Provisioning and operator overrides are admin-only
fn requires_admin(command: &Command) -> bool {
    matches!(
        command,
        Command::InitializeSlots { .. }
            | Command::AddSlot { .. }
            | Command::DeleteSlot { .. }
            | Command::ApplyAdminCommand { .. }
    )
}

fn token_matches(configured: Option<&str>, presented: &str) -> bool {
    match configured {
        Some(expected) => {
            // Length leaks, contents do not
            let expected = expected.trim().as_bytes();
            let presented = presented.trim().as_bytes();
            expected.len() == presented.len()
                && expected
                    .iter()
                    .zip(presented)
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
        }
        None => false,
    }
}

fn core_error_response(request_id: u64, e: CoreError) -> Response {
    if let CoreError::Store(inner) = &e {
        error!(error = %inner, "Store failure while handling request");
    }
    Response::error(request_id, ErrorInfo::new(e.code(), e.to_string()))
}

async fn next_sweep(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "slotkeeperd starting");

    if slotkeeper_util::is_mock_time_active() {
        warn!(now = %slotkeeper_util::now(), "Mock time is active");
    }

    let service = Service::new(&args).await?;
    service.run().await
}
