use super::event::Sequence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key used for projections that run as a single shard
pub const ALL_SHARD_KEY: &str = "All";

/// Identity of one shard: a projection name plus a shard key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardName {
    projection_name: String,
    key: String,
    identity: String,
}

impl ShardName {
    pub fn new(projection_name: impl Into<String>, key: impl Into<String>) -> Self {
        let projection_name = projection_name.into();
        let key = key.into();
        let identity = format!("{}:{}", projection_name, key);
        Self {
            projection_name,
            key,
            identity,
        }
    }

    /// The single shard of a projection that is not partitioned
    pub fn all(projection_name: impl Into<String>) -> Self {
        Self::new(projection_name, ALL_SHARD_KEY)
    }

    pub fn projection_name(&self) -> &str {
        &self.projection_name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// `"<projection>:<key>"`, used as the registry key everywhere
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity)
    }
}

/// Lifecycle status of a shard agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Running => "running",
            AgentStatus::Paused => "paused",
            AgentStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// What last happened to a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardAction {
    Started,
    Paused,
    Stopped,
    Advanced,
}

/// Point-in-time view of one shard, as published by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub name: ShardName,
    pub status: AgentStatus,
    pub last_sequence: Sequence,
    pub paused_at: Option<DateTime<Utc>>,
    /// Earliest time a paused shard may be resumed
    pub paused_until: Option<DateTime<Utc>>,
    pub last_action: ShardAction,
    /// Consecutive failures at the current position
    pub error_count: usize,
}

impl ShardState {
    pub fn started(name: ShardName, last_sequence: Sequence) -> Self {
        Self {
            name,
            status: AgentStatus::Running,
            last_sequence,
            paused_at: None,
            paused_until: None,
            last_action: ShardAction::Started,
            error_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_format() {
        let name = ShardName::new("Trips", "2024");
        assert_eq!(name.identity(), "Trips:2024");
        assert_eq!(name.to_string(), "Trips:2024");
        assert_eq!(ShardName::all("Trips").identity(), "Trips:All");
    }

    #[test]
    fn test_equal_names_hash_the_same() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(ShardName::new("Trips", "All"));
        assert!(set.contains(&ShardName::all("Trips")));
    }
}
