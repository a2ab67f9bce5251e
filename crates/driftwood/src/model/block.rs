use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type BlockId = u64;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlockStatus {
    Running,
    Success,
    Failure,
    Interrupted,
}

impl BlockStatus {
    /// Success exactly when the command exited 0; anything else, including
    /// negative codes, is a failure.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            BlockStatus::Success
        } else {
            BlockStatus::Failure
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BlockStatus::Running)
    }
}

/// A captured command invocation and its outcome. Created when input is
/// submitted, mutated once at finalization, immutable afterwards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub status: BlockStatus,
    /// Absolute combined-buffer line where this command's output begins.
    pub output_start: u64,
}

impl Block {
    pub fn started(id: BlockId, command: impl Into<String>, output_start: u64) -> Self {
        Block {
            id,
            command: command.into(),
            stdout: String::new(),
            stderr: String::new(),
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            status: BlockStatus::Running,
            output_start,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == BlockStatus::Running
    }
}
