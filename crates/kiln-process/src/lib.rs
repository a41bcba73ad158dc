use std::collections::BTreeMap;

use specta::Type;

/// Reserved channel key for the fleet-wide dashboard.
///
/// NOTE: Instance names are restricted to `[A-Za-z0-9_-]`, so the leading `@`
/// can never collide with a real instance channel.
pub const DASHBOARD_CHANNEL: &str = "@dashboard";

/// Identity of one connected observer. Ephemeral: a reconnect gets a new id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct ObserverId(pub String);

impl ObserverId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Offline,
    Installing,
    Starting,
    Online,
    Stopping,
    Crashed,
}

impl ServerState {
    /// States in which a `start` must be treated as a duplicate.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ServerState::Installing
                | ServerState::Starting
                | ServerState::Online
                | ServerState::Stopping
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Online,
    /// The status query failed; the server is starting, stopping or unreachable.
    Starting,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct DashboardEntry {
    pub status: ProbeStatus,
    pub players: u32,
    pub max_players: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub restart_scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Server → observer frames.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Output {
        instance: String,
        data: String,
    },
    Status {
        instance: String,
        state: ServerState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    RestartFlag {
        instance: String,
        scheduled: bool,
    },
    History {
        instance: String,
        data: String,
    },
    Dashboard {
        servers: BTreeMap<String, DashboardEntry>,
    },
    Resp {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
}

/// Observer → server frames.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        instance: String,
    },
    JoinDashboard,
    Start {
        instance: String,
        #[serde(default)]
        id: Option<String>,
    },
    Stop {
        instance: String,
        #[serde(default)]
        id: Option<String>,
    },
    Command {
        instance: String,
        text: String,
    },
    Resize {
        instance: String,
        cols: u16,
        rows: u16,
    },
    ScheduleRestart {
        instance: String,
        #[serde(default)]
        id: Option<String>,
    },
    CancelRestart {
        instance: String,
        #[serde(default)]
        id: Option<String>,
    },
    RestartSupervisor {
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    /// Correlation id of a request/response frame, if the client asked for a reply.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientFrame::Start { id, .. }
            | ClientFrame::Stop { id, .. }
            | ClientFrame::ScheduleRestart { id, .. }
            | ClientFrame::CancelRestart { id, .. }
            | ClientFrame::RestartSupervisor { id } => id.as_deref(),
            _ => None,
        }
    }
}
