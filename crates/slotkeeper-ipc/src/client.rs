//! IPC client implementation

use slotkeeper_api::{Command, Event, Request, Response, ResponsePayload, ResponseResult};
use slotkeeper_util::SlotId;
use std::collections::VecDeque;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs, UnixStream};
use tracing::debug;

use crate::{IpcError, IpcResult};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// IPC Client for connecting to slotkeeperd
///
/// Responses and stream frames share the connection; frames that arrive
/// while waiting for a response are queued for [`IpcClient::next_event`].
pub struct IpcClient {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    next_request_id: u64,
    pending_events: VecDeque<Event>,
}

enum Frame {
    Response(Response),
    Event(Event),
}

impl IpcClient {
    /// Connect over the Unix socket
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_halves(Box::new(read_half), Box::new(write_half)))
    }

    /// Connect over TCP (device role until authenticated)
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> IpcResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_halves(Box::new(read_half), Box::new(write_half)))
    }

    fn from_halves(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            next_request_id: 1,
            pending_events: VecDeque::new(),
        }
    }

    /// Send a command and wait for response
    pub async fn send(&mut self, command: Command) -> IpcResult<Response> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let request = Request::new(request_id, command);
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;

        loop {
            match self.read_frame().await? {
                Frame::Response(response) if response.request_id == request_id => {
                    return Ok(response);
                }
                Frame::Response(other) => {
                    debug!(request_id = other.request_id, "Skipping unrelated response");
                }
                Frame::Event(event) => self.pending_events.push_back(event),
            }
        }
    }

    /// Send a command and unwrap the payload; error replies become `ServerError`
    pub async fn request(&mut self, command: Command) -> IpcResult<ResponsePayload> {
        let response = self.send(command).await?;
        match response.result {
            ResponseResult::Ok(payload) => Ok(payload),
            ResponseResult::Err(e) => Err(IpcError::ServerError(format!(
                "{}: {}",
                e.code, e.message
            ))),
        }
    }

    /// Start receiving directives for `slot_id` on this connection
    pub async fn subscribe(&mut self, slot_id: SlotId) -> IpcResult<()> {
        match self.request(Command::SubscribeCommands { slot_id }).await? {
            ResponsePayload::Subscribed { .. } => Ok(()),
            other => Err(IpcError::InvalidMessage(format!(
                "unexpected reply to subscribe: {:?}",
                other
            ))),
        }
    }

    pub async fn unsubscribe(&mut self, slot_id: SlotId) -> IpcResult<()> {
        match self.request(Command::UnsubscribeCommands { slot_id }).await? {
            ResponsePayload::Unsubscribed { .. } => Ok(()),
            other => Err(IpcError::InvalidMessage(format!(
                "unexpected reply to unsubscribe: {:?}",
                other
            ))),
        }
    }

    /// Wait for the next stream frame (command, heartbeat or shutdown)
    pub async fn next_event(&mut self) -> IpcResult<Event> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }

        loop {
            match self.read_frame().await? {
                Frame::Event(event) => return Ok(event),
                Frame::Response(response) => {
                    debug!(request_id = response.request_id, "Skipping response while streaming");
                }
            }
        }
    }

    async fn read_frame(&mut self) -> IpcResult<Frame> {
        let mut line = String::new();

        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(IpcError::ConnectionClosed);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Ok(response) = serde_json::from_str::<Response>(trimmed) {
                return Ok(Frame::Response(response));
            }

            return serde_json::from_str::<Event>(trimmed)
                .map(Frame::Event)
                .map_err(|e| IpcError::InvalidMessage(e.to_string()));
        }
    }
}
