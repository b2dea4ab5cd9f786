use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Subscription level resolved by the external billing collaborator. The
/// gateway only reads it; it never computes or mutates billing state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Basic,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
        }
    }

    pub fn parse(raw: &str) -> Option<Tier> {
        match raw.trim() {
            "free" => Some(Tier::Free),
            "basic" => Some(Tier::Basic),
            "premium" => Some(Tier::Premium),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    InterpretCard,
    SynthesizeReading,
    Narrate,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [
        TaskType::InterpretCard,
        TaskType::SynthesizeReading,
        TaskType::Narrate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::InterpretCard => "interpret_card",
            TaskType::SynthesizeReading => "synthesize_reading",
            TaskType::Narrate => "narrate",
        }
    }

    pub fn parse(raw: &str) -> Option<TaskType> {
        match raw.trim() {
            "interpret_card" => Some(TaskType::InterpretCard),
            "synthesize_reading" => Some(TaskType::SynthesizeReading),
            "narrate" => Some(TaskType::Narrate),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completion request as it enters the pipeline. `context` is ordered so
/// the cache key derivation is deterministic; `correlation_flagged` is the
/// external device/account correlation signal the abuse detector consumes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequest {
    pub account: String,
    pub task: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub correlation_flagged: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskReply {
    pub text: String,
    pub tokens_used: u64,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0))
            .as_secs()
    }
}
