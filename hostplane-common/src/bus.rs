use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Channels / Streams
// -----------------------------------------------------------------------------

pub const CHANNEL_ORCHESTRATOR_COMMANDS: &str = "orchestrator_events";

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------
//
// Pub/Sub is only a wake-up signal: the backup_jobs row is the durable queue, and
// the orchestrator re-claims rows whose command was never delivered.

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    #[serde(rename = "CMD:BACKUP")]
    Backup,
    #[serde(rename = "CMD:RESTORE")]
    Restore,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Backup => "CMD:BACKUP",
            CommandType::Restore => "CMD:RESTORE",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JobCommand {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub job_id: Uuid,
    pub issued_at: DateTime<Utc>,
}

impl JobCommand {
    pub fn backup(job_id: Uuid) -> Self {
        Self {
            command_type: CommandType::Backup,
            job_id,
            issued_at: Utc::now(),
        }
    }

    pub fn restore(job_id: Uuid) -> Self {
        Self {
            command_type: CommandType::Restore,
            job_id,
            issued_at: Utc::now(),
        }
    }
}
