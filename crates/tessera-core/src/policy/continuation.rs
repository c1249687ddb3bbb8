use std::fmt;
use std::time::Duration;

/// The decided response to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Retry the same work after a delay
    RetryLater(Duration),
    /// Dead-letter the offending event and carry on with the rest
    SkipEvent,
    PauseShard(Duration),
    PauseProjection(Duration),
    PauseAllProjections(Duration),
    StopShard,
    StopProjection,
    StopAllProjections,
}

impl Continuation {
    /// Stable label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Continuation::RetryLater(_) => "retry_later",
            Continuation::SkipEvent => "skip_event",
            Continuation::PauseShard(_) => "pause_shard",
            Continuation::PauseProjection(_) => "pause_projection",
            Continuation::PauseAllProjections(_) => "pause_all_projections",
            Continuation::StopShard => "stop_shard",
            Continuation::StopProjection => "stop_projection",
            Continuation::StopAllProjections => "stop_all_projections",
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        match self {
            Continuation::RetryLater(d)
            | Continuation::PauseShard(d)
            | Continuation::PauseProjection(d)
            | Continuation::PauseAllProjections(d) => Some(*d),
            _ => None,
        }
    }

    /// True for continuations that take the agent out of `Running`
    pub fn halts_agent(&self) -> bool {
        !matches!(self, Continuation::RetryLater(_) | Continuation::SkipEvent)
    }
}

impl fmt::Display for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.delay() {
            Some(d) => write!(f, "{}({:?})", self.kind(), d),
            None => f.write_str(self.kind()),
        }
    }
}
