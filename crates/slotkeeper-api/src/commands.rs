//! Command types for the slotkeeperd protocol

use serde::{Deserialize, Serialize};
use slotkeeper_util::{ClientId, SlotId};

use crate::{API_VERSION, ClientRole, HealthStatus, PolledCommand, SlotView};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// The command
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Response payload or error
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Line was not a well-formed request
    InvalidRequest,
    /// Unknown slot id
    NotFound,
    /// Duplicate slot, slot in use, or transition not allowed from the current status
    Conflict,
    /// Unrecognized event or admin command name
    InvalidEvent,
    /// Missing or malformed input
    ValidationError,
    PermissionDenied,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::InvalidEvent => "invalid_event",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Ping for keepalive
    Ping,

    /// Get health status
    GetHealth,

    /// Present the operator token to gain the admin role
    Authenticate { token: String },

    /// List all slots (may promote overdue sessions to OVERSTAY)
    ListSlots,

    /// Read a single slot (may promote it to OVERSTAY)
    GetSlot { slot_id: SlotId },

    // Provisioning (admin only)

    /// Replace the fleet with SLOT-1..SLOT-count
    InitializeSlots { count: u32 },

    /// Add one slot; auto-numbered when no id is given
    AddSlot {
        #[serde(default)]
        slot_id: Option<SlotId>,
    },

    /// Delete an AVAILABLE slot
    DeleteSlot { slot_id: SlotId },

    // Payment flow and hardware

    /// A payment for `minutes` was confirmed for this slot
    ConfirmPayment { slot_id: SlotId, minutes: u32 },

    /// Sensor event: CAR_ENTERED, CAR_EXITED or OVERSTAY. Payment
    /// confirmations may also arrive here as PAYMENT_CONFIRMED with `minutes`.
    ApplyEvent {
        slot_id: SlotId,
        event: String,
        #[serde(default)]
        minutes: Option<u32>,
    },

    /// Take and clear the pending directive for this slot
    PollCommand { slot_id: SlotId },

    /// Start streaming directives for this slot on this connection
    SubscribeCommands { slot_id: SlotId },

    /// Stop streaming directives for this slot
    UnsubscribeCommands { slot_id: SlotId },

    // Admin commands

    /// FORCE_OPEN_BARRIER, UNLOCK_SLOT or RESET_SLOT (admin only)
    ApplyAdminCommand { slot_id: SlotId, command: String },
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Pong,
    Health(HealthStatus),
    Authenticated {
        role: ClientRole,
    },
    Slots {
        slots: Vec<SlotView>,
    },
    Slot(SlotView),
    SlotDeleted {
        slot_id: SlotId,
    },
    Polled(PolledCommand),
    Subscribed {
        client_id: ClientId,
        slot_id: SlotId,
    },
    Unsubscribed {
        slot_id: SlotId,
    },
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
    /// Remote address for TCP peers
    pub peer_addr: Option<String>,
}

impl ClientInfo {
    pub fn new(role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid: None,
            peer_addr: None,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_peer_addr(mut self, addr: impl Into<String>) -> Self {
        self.peer_addr = Some(addr.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HardwareCommand, SlotStatus};

    #[test]
    fn request_serialization() {
        let req = Request::new(
            1,
            Command::ConfirmPayment {
                slot_id: SlotId::new("SLOT-1"),
                minutes: 60,
            },
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"confirm_payment\""));

        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, 1);
        assert!(matches!(
            parsed.command,
            Command::ConfirmPayment { minutes: 60, .. }
        ));
    }

    #[test]
    fn hand_written_requests_parse() {
        let parsed: Request = serde_json::from_str(
            r#"{"request_id":7,"api_version":1,"command":{"type":"apply_event","slot_id":"A1","event":"CAR_ENTERED"}}"#,
        )
        .unwrap();
        match parsed.command {
            Command::ApplyEvent {
                slot_id,
                event,
                minutes,
            } => {
                assert_eq!(slot_id.as_str(), "A1");
                assert_eq!(event, "CAR_ENTERED");
                assert_eq!(minutes, None);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let parsed: Request = serde_json::from_str(
            r#"{"request_id":8,"api_version":1,"command":{"type":"add_slot"}}"#,
        )
        .unwrap();
        assert!(matches!(parsed.command, Command::AddSlot { slot_id: None }));
    }

    #[test]
    fn response_serialization() {
        let resp = Response::success(
            3,
            ResponsePayload::Polled(PolledCommand {
                slot_id: SlotId::new("SLOT-2"),
                status: SlotStatus::Overstay,
                command: Some(HardwareCommand::LockBarrier),
            }),
        );

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["result"]["ok"]["type"], "polled");
        assert_eq!(json["result"]["ok"]["command"], "LOCK_BARRIER");

        let parsed: Response = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.request_id, 3);
    }

    #[test]
    fn slot_list_serializes_as_struct_variant() {
        let resp = Response::success(1, ResponsePayload::Slots { slots: vec![] });
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed.result,
            ResponseResult::Ok(ResponsePayload::Slots { .. })
        ));
    }

    #[test]
    fn error_codes_are_snake_case() {
        let resp = Response::error(0, ErrorInfo::new(ErrorCode::InvalidEvent, "nope"));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["result"]["err"]["code"], "invalid_event");

        for code in [ErrorCode::NotFound, ErrorCode::PermissionDenied] {
            let wire = serde_json::to_value(code).unwrap();
            assert_eq!(wire, code.as_str());
        }
    }
}
