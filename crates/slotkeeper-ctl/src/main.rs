//! slotctl - command-line client for slotkeeperd
//!
//! Operators use it to provision slots and issue overrides; on a bench it
//! stands in for the payment terminal and the barrier controller.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use slotkeeper_api::{
    Command, EventPayload, HardwareCommand, NO_COMMAND, PolledCommand, ResponsePayload, SlotView,
};
use slotkeeper_ipc::IpcClient;
use slotkeeper_util::{SlotId, default_socket_path, format_datetime_full, format_minutes};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "slotctl")]
#[command(about = "Control and inspect a slotkeeperd instance")]
#[command(version)]
struct Cli {
    /// Socket path (or set SLOTKEEPER_SOCKET env var)
    #[arg(short, long, env = "SLOTKEEPER_SOCKET", default_value_os_t = default_socket_path())]
    socket: PathBuf,

    /// Connect over TCP instead of the Unix socket, e.g. 10.0.0.5:7878
    #[arg(long)]
    tcp: Option<String>,

    /// Admin token to present before the command (needed over TCP)
    #[arg(long, env = "SLOTKEEPER_ADMIN_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Print raw JSON payloads
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every slot
    List,

    /// Show one slot
    Get { slot: String },

    /// Replace the fleet with SLOT-1..SLOT-<count>
    Init { count: u32 },

    /// Add a slot; numbered automatically when no id is given
    Add { slot: Option<String> },

    /// Delete an idle slot
    Delete { slot: String },

    /// Confirm a payment of <minutes> for a slot
    Pay { slot: String, minutes: u32 },

    /// Report a sensor event (CAR_ENTERED, CAR_EXITED, OVERSTAY)
    Event {
        slot: String,
        event: String,

        /// Paid minutes, for PAYMENT_CONFIRMED
        #[arg(long)]
        minutes: Option<u32>,
    },

    /// Issue an override (FORCE_OPEN_BARRIER, UNLOCK_SLOT, RESET_SLOT)
    Admin { slot: String, command: String },

    /// Take the pending directive for a slot, as a barrier controller would
    Poll { slot: String },

    /// Stream directives for a slot until interrupted
    Watch { slot: String },

    /// Service health
    Health,
}

impl Commands {
    /// Request to send, or `None` for `watch`
    fn to_request(&self) -> Option<Command> {
        let command = match self {
            Commands::List => Command::ListSlots,
            Commands::Get { slot } => Command::GetSlot {
                slot_id: SlotId::new(slot.as_str()),
            },
            Commands::Init { count } => Command::InitializeSlots { count: *count },
            Commands::Add { slot } => Command::AddSlot {
                slot_id: slot.as_deref().map(SlotId::new),
            },
            Commands::Delete { slot } => Command::DeleteSlot {
                slot_id: SlotId::new(slot.as_str()),
            },
            Commands::Pay { slot, minutes } => Command::ConfirmPayment {
                slot_id: SlotId::new(slot.as_str()),
                minutes: *minutes,
            },
            Commands::Event {
                slot,
                event,
                minutes,
            } => Command::ApplyEvent {
                slot_id: SlotId::new(slot.as_str()),
                event: event.clone(),
                minutes: *minutes,
            },
            Commands::Admin { slot, command } => Command::ApplyAdminCommand {
                slot_id: SlotId::new(slot.as_str()),
                command: command.clone(),
            },
            Commands::Poll { slot } => Command::PollCommand {
                slot_id: SlotId::new(slot.as_str()),
            },
            Commands::Health => Command::GetHealth,
            Commands::Watch { .. } => return None,
        };
        Some(command)
    }
}

async fn connect(cli: &Cli) -> Result<IpcClient> {
    let mut client = match &cli.tcp {
        Some(addr) => IpcClient::connect_tcp(addr.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?,
        None => IpcClient::connect(&cli.socket)
            .await
            .with_context(|| format!("Failed to connect to {:?}", cli.socket))?,
    };

    if let Some(token) = &cli.token {
        client
            .request(Command::Authenticate {
                token: token.clone(),
            })
            .await
            .context("Authentication failed")?;
        debug!("Authenticated as admin");
    }

    Ok(client)
}

async fn watch(client: &mut IpcClient, slot: &str, json: bool) -> Result<()> {
    client.subscribe(SlotId::new(slot)).await?;
    eprintln!("Watching {} (Ctrl-C to stop)", slot);

    loop {
        let event = client.next_event().await?;
        if json {
            println!("{}", serde_json::to_string(&event)?);
            if matches!(event.payload, EventPayload::Shutdown) {
                return Ok(());
            }
            continue;
        }

        let at = format_datetime_full(&event.timestamp);
        match event.payload {
            EventPayload::Command { slot_id, command } => println!("{}  {}  {}", at, slot_id, command),
            EventPayload::Heartbeat => debug!(%at, "heartbeat"),
            EventPayload::Shutdown => {
                println!("{}  service shutting down", at);
                return Ok(());
            }
        }
    }
}

fn print_payload(payload: &ResponsePayload) {
    match payload {
        ResponsePayload::Pong => println!("pong"),
        ResponsePayload::Health(health) => {
            println!("live:        {}", health.live);
            println!("ready:       {}", health.ready);
            println!("store:       {}", if health.store_ok { "ok" } else { "FAILED" });
            println!("slots:       {}", health.slot_count);
            println!("subscribers: {}", health.subscriber_count);
        }
        ResponsePayload::Authenticated { role } => println!("authenticated as {:?}", role),
        ResponsePayload::Slots { slots } => {
            println!("{}", slot_header());
            for view in slots {
                println!("{}", slot_row(view));
            }
        }
        ResponsePayload::Slot(view) => {
            println!("{}", slot_header());
            println!("{}", slot_row(view));
        }
        ResponsePayload::SlotDeleted { slot_id } => println!("deleted {}", slot_id),
        ResponsePayload::Polled(polled) => println!("{}", poll_line(polled)),
        ResponsePayload::Subscribed { slot_id, .. } => println!("subscribed to {}", slot_id),
        ResponsePayload::Unsubscribed { slot_id } => println!("unsubscribed from {}", slot_id),
    }
}

fn slot_header() -> String {
    format!(
        "{:<12} {:<10} {:>8} {:>10} {:>10} {:<20} {}",
        "SLOT", "STATUS", "PAID", "REMAINING", "EXCEEDED", "STARTED", "PENDING"
    )
}

fn slot_row(view: &SlotView) -> String {
    let started = view
        .start_time
        .as_ref()
        .map(format_datetime_full)
        .unwrap_or_else(|| "-".into());

    format!(
        "{:<12} {:<10} {:>8} {:>10} {:>10} {:<20} {}",
        view.slot_id.as_str(),
        view.status.as_str(),
        format_minutes(view.paid_minutes),
        format_minutes(view.remaining_minutes),
        format_minutes(view.exceeded_minutes),
        started,
        command_name(view.pending_command),
    )
}

fn poll_line(polled: &PolledCommand) -> String {
    format!(
        "{} {} {}",
        polled.slot_id,
        polled.status,
        command_name(polled.command)
    )
}

fn command_name(command: Option<HardwareCommand>) -> &'static str {
    command.map(|c| c.as_str()).unwrap_or(NO_COMMAND)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut client = connect(&cli).await?;

    let Some(request) = cli.command.to_request() else {
        let Commands::Watch { slot } = &cli.command else {
            bail!("nothing to do");
        };
        return watch(&mut client, slot, cli.json).await;
    };

    let payload = client.request(request).await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_payload(&payload);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use slotkeeper_api::SlotStatus;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["slotctl", "pay", "SLOT-2", "45"]).unwrap();
        assert!(matches!(
            cli.command.to_request(),
            Some(Command::ConfirmPayment { minutes: 45, .. })
        ));

        let cli = Cli::try_parse_from(["slotctl", "event", "A1", "CAR_ENTERED"]).unwrap();
        match cli.command.to_request() {
            Some(Command::ApplyEvent {
                slot_id,
                event,
                minutes,
            }) => {
                assert_eq!(slot_id.as_str(), "A1");
                assert_eq!(event, "CAR_ENTERED");
                assert_eq!(minutes, None);
            }
            other => panic!("unexpected request {:?}", other),
        }

        let cli = Cli::try_parse_from(["slotctl", "add"]).unwrap();
        assert!(matches!(
            cli.command.to_request(),
            Some(Command::AddSlot { slot_id: None })
        ));

        let cli = Cli::try_parse_from(["slotctl", "watch", "SLOT-1"]).unwrap();
        assert!(cli.command.to_request().is_none());
    }

    #[test]
    fn global_flags() {
        let cli = Cli::try_parse_from([
            "slotctl",
            "--tcp",
            "127.0.0.1:7878",
            "--token",
            "change-me-please",
            "--json",
            "list",
        ])
        .unwrap();
        assert_eq!(cli.tcp.as_deref(), Some("127.0.0.1:7878"));
        assert_eq!(cli.token.as_deref(), Some("change-me-please"));
        assert!(cli.json);
    }

    #[test]
    fn slot_rows() {
        let at = Local.with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap();
        let view = SlotView {
            slot_id: SlotId::new("SLOT-1"),
            status: SlotStatus::Overstay,
            paid_minutes: 60,
            start_time: Some(at),
            end_time: None,
            overstay_minutes: 30,
            remaining_minutes: 0,
            exceeded_minutes: 30,
            pending_command: Some(HardwareCommand::LockBarrier),
            created_at: at,
            updated_at: at,
        };

        let row = slot_row(&view);
        assert!(row.starts_with("SLOT-1"));
        assert!(row.contains("OVERSTAY"));
        assert!(row.contains("1h"));
        assert!(row.contains("30m"));
        assert!(row.contains("2025-03-14 08:00:00"));
        assert!(row.ends_with("LOCK_BARRIER"));

        let polled = PolledCommand {
            slot_id: SlotId::new("SLOT-1"),
            status: SlotStatus::Available,
            command: None,
        };
        assert_eq!(poll_line(&polled), "SLOT-1 AVAILABLE NONE");
    }
}
