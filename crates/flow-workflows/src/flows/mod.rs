pub mod broadcast;
pub mod orchestrator;
pub mod ping_pong;
pub mod timer;

pub use broadcast::BroadcastFlow;
pub use orchestrator::OrchestratorFlow;
pub use ping_pong::PingPongFlow;
pub use timer::TimerFlow;

use chrono::{DateTime, Duration, Utc};

/// Plazo absoluto a partir de un `timeout_ms` opcional.
pub(crate) fn deadline_from(now: DateTime<Utc>, timeout_ms: Option<u64>) -> Option<DateTime<Utc>> {
  timeout_ms.map(|ms| now + Duration::milliseconds(ms.min(i64::MAX as u64) as i64))
}
