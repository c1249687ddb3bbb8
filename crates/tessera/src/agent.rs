//! Shard agent: the fetch/apply pipeline for one shard
//!
//! An agent walks the log from its last durable position up to the
//! high-water mark in batches. Failures go through the exception policies;
//! retries and skips are handled in place, anything that halts the agent is
//! handed back to the daemon.

use crate::daemon::{DaemonShared, Halt, HaltScope};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::error::find_apply_error;
use tessera_core::{observe, Continuation, DeadLetterEvent, Event, EventBatch, Sequence, ShardName};
use tokio_util::sync::CancellationToken;

/// Why the pipeline returned
enum AgentExit {
    Cancelled,
    Halted {
        continuation: Continuation,
        error: anyhow::Error,
    },
}

enum Decision {
    Retry,
    Skip(Event),
    Halt(Continuation),
    Cancelled,
}

pub(crate) struct ShardAgent {
    name: ShardName,
    generation: u64,
    position: Sequence,
    shared: Arc<DaemonShared>,
    cancel: CancellationToken,
}

impl ShardAgent {
    pub(crate) fn new(
        name: ShardName,
        generation: u64,
        position: Sequence,
        shared: Arc<DaemonShared>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            generation,
            position,
            shared,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(shard = %self.name, from = self.position, "Shard agent running");
        match self.execute().await {
            AgentExit::Cancelled => {
                tracing::debug!(shard = %self.name, "Shard agent cancelled");
            }
            AgentExit::Halted {
                continuation,
                error,
            } => self.halt(continuation, &error),
        }
    }

    async fn execute(&mut self) -> AgentExit {
        let mut attempts = 0usize;
        let batch_size = self.shared.settings.batch_size.max(1);

        loop {
            if self.cancel.is_cancelled() {
                return AgentExit::Cancelled;
            }

            let high_water = match self.shared.database.events().high_water_mark().await {
                Ok(mark) => mark,
                Err(e) => match self.decide(&e, &mut attempts).await {
                    Decision::Retry => continue,
                    Decision::Cancelled => return AgentExit::Cancelled,
                    Decision::Halt(continuation) => {
                        return AgentExit::Halted {
                            continuation,
                            error: e,
                        }
                    }
                    Decision::Skip(_) => {
                        return AgentExit::Halted {
                            continuation: Continuation::StopShard,
                            error: e,
                        }
                    }
                },
            };
            self.shared.observe_high_water_mark(high_water);

            if self.position >= high_water {
                if !self.idle().await {
                    return AgentExit::Cancelled;
                }
                continue;
            }

            let ceiling = high_water.min(self.position.saturating_add(batch_size));
            let mut batch = match self
                .shared
                .database
                .events()
                .fetch_batch(&self.name, self.position, ceiling)
                .await
            {
                Ok(batch) => batch,
                Err(e) => match self.decide(&e, &mut attempts).await {
                    Decision::Retry => continue,
                    Decision::Cancelled => return AgentExit::Cancelled,
                    Decision::Halt(continuation) => {
                        return AgentExit::Halted {
                            continuation,
                            error: e,
                        }
                    }
                    // nothing to skip outside of apply
                    Decision::Skip(_) => {
                        return AgentExit::Halted {
                            continuation: Continuation::StopShard,
                            error: e,
                        }
                    }
                },
            };

            if let Some(exit) = self.apply(&mut batch, &mut attempts).await {
                return exit;
            }
        }
    }

    /// Apply one batch, retrying and skipping per policy.
    ///
    /// Returns `Some` when the agent must stop running.
    async fn apply(&mut self, batch: &mut EventBatch, attempts: &mut usize) -> Option<AgentExit> {
        loop {
            match self
                .shared
                .database
                .projections()
                .apply(&self.name, batch)
                .await
            {
                Ok(sequence) => {
                    *attempts = 0;
                    self.position = sequence.max(self.position);
                    observe::record_batch_applied(self.name.projection_name(), batch.len());
                    self.shared
                        .record_progress(&self.name, self.generation, self.position);
                    return None;
                }
                Err(e) => match self.decide(&e, attempts).await {
                    Decision::Retry => {
                        if self.cancel.is_cancelled() {
                            return Some(AgentExit::Cancelled);
                        }
                    }
                    Decision::Skip(event) => {
                        if !batch.events.iter().any(|e| e.sequence == event.sequence) {
                            // blamed event is not in this batch; skipping would not make progress
                            return Some(AgentExit::Halted {
                                continuation: Continuation::StopShard,
                                error: e,
                            });
                        }
                        if let Err(record_err) = self.dead_letter(&event, &e).await {
                            tracing::error!(
                                shard = %self.name,
                                sequence = event.sequence,
                                "Failed to record dead letter: {:#}",
                                record_err
                            );
                            return Some(AgentExit::Halted {
                                continuation: Continuation::StopShard,
                                error: record_err,
                            });
                        }
                        batch.remove(event.sequence);
                    }
                    Decision::Cancelled => return Some(AgentExit::Cancelled),
                    Decision::Halt(continuation) => {
                        return Some(AgentExit::Halted {
                            continuation,
                            error: e,
                        })
                    }
                },
            }
        }
    }

    async fn decide(&self, error: &anyhow::Error, attempts: &mut usize) -> Decision {
        let continuation = self
            .shared
            .settings
            .policies
            .determine_continuation(error.as_ref(), *attempts);
        observe::record_continuation(continuation.kind());

        match continuation {
            Continuation::RetryLater(delay) => {
                *attempts += 1;
                self.shared
                    .record_error_count(&self.name, self.generation, *attempts);
                tracing::warn!(
                    shard = %self.name,
                    attempt = *attempts,
                    ?delay,
                    "Shard failed, retrying later: {:#}",
                    error
                );
                if self.sleep(delay).await {
                    Decision::Retry
                } else {
                    Decision::Cancelled
                }
            }
            Continuation::SkipEvent => match find_apply_error(error.as_ref()) {
                Some(apply) => Decision::Skip(apply.event.clone()),
                None => Decision::Halt(Continuation::StopShard),
            },
            other => Decision::Halt(other),
        }
    }

    async fn dead_letter(&self, event: &Event, error: &anyhow::Error) -> anyhow::Result<()> {
        let summary = match find_apply_error(error.as_ref()) {
            Some(apply) => format!("{:#}", apply.source),
            None => format!("{:#}", error),
        };
        tracing::warn!(
            shard = %self.name,
            sequence = event.sequence,
            event_type = %event.event_type,
            "Skipping event: {}",
            summary
        );

        self.shared
            .database
            .dead_letters()
            .record(DeadLetterEvent {
                projection_name: self.name.projection_name().to_string(),
                shard_key: self.name.key().to_string(),
                event_sequence: event.sequence,
                event_type: event.event_type.clone(),
                error_summary: summary,
                recorded_at: Utc::now(),
            })
            .await?;
        observe::record_dead_letter(self.name.projection_name());
        Ok(())
    }

    fn halt(&self, continuation: Continuation, error: &anyhow::Error) {
        let (scope, halt) = match continuation {
            Continuation::PauseShard(d) => (HaltScope::Shard(&self.name), Halt::Pause(d)),
            Continuation::PauseProjection(d) => (
                HaltScope::Projection(self.name.projection_name()),
                Halt::Pause(d),
            ),
            Continuation::PauseAllProjections(d) => (HaltScope::All, Halt::Pause(d)),
            Continuation::StopProjection => (
                HaltScope::Projection(self.name.projection_name()),
                Halt::Stop,
            ),
            Continuation::StopAllProjections => (HaltScope::All, Halt::Stop),
            Continuation::StopShard | Continuation::RetryLater(_) | Continuation::SkipEvent => {
                (HaltScope::Shard(&self.name), Halt::Stop)
            }
        };

        tracing::warn!(
            shard = %self.name,
            continuation = %continuation,
            "Shard halted: {:#}",
            error
        );
        self.shared.halt_from_agent(&self.name, self.generation, scope, halt);
    }

    /// Wait for new events. False when cancelled.
    async fn idle(&self) -> bool {
        let mut changes = self.shared.subscribe_high_water();
        let poll = self.shared.settings.idle_polling_time();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = changes.changed() => true,
            _ = tokio::time::sleep(poll) => true,
        }
    }

    /// Sleep for `delay`. False when cancelled.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
