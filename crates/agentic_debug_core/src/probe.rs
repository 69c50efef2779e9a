//! Polling-based pause/resume inference.
//!
//! The host does not relay `thread`, `stopped` or `continued` events, so the
//! bridge polls the live session instead. [`SessionProbe`] is the injected query
//! strategy and [`PollTracker`] turns successive observations into events.
//! Detection lags the real transition by at most one poll interval.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    host::{DebugHost, HostSession},
    protocol::{stack_frame_count, threads_from_body, ThreadInfo},
    Result,
};

#[async_trait]
pub trait SessionProbe: Send + Sync {
    async fn threads(&self, session: &HostSession) -> Result<Vec<ThreadInfo>>;

    /// Number of frames on top of `thread_id`'s stack (at most one is requested).
    async fn top_frames(&self, session: &HostSession, thread_id: i64) -> Result<usize>;
}

/// Probes through the host's custom request channel.
pub struct HostProbe {
    host: Arc<dyn DebugHost>,
}

impl HostProbe {
    pub fn new(host: Arc<dyn DebugHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl SessionProbe for HostProbe {
    async fn threads(&self, session: &HostSession) -> Result<Vec<ThreadInfo>> {
        let body = self.host.custom_request(session, "threads", None).await?;
        Ok(threads_from_body(&body))
    }

    async fn top_frames(&self, session: &HostSession, thread_id: i64) -> Result<usize> {
        let body = self
            .host
            .custom_request(
                session,
                "stackTrace",
                Some(json!({ "threadId": thread_id, "startFrame": 0, "levels": 1 })),
            )
            .await?;
        Ok(stack_frame_count(&body))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PauseState {
    #[default]
    None,
    Connected,
    Paused,
}

#[derive(Debug, Default)]
pub struct PollTracker {
    known_threads: usize,
    state: PauseState,
}

impl PollTracker {
    pub fn state(&self) -> PauseState {
        self.state
    }

    pub fn reset(&mut self) {
        self.known_threads = 0;
        self.state = PauseState::None;
    }

    /// Folds one observation into the tracker and returns the events it implies.
    ///
    /// `top_frames` is `None` when the stack query failed, which is what a
    /// running thread looks like under this transport.
    pub fn observe(&mut self, threads: &[ThreadInfo], top_frames: Option<usize>) -> Vec<(String, Value)> {
        let mut events = Vec::new();

        let Some(first) = threads.first() else {
            if self.known_threads > 0 {
                self.reset();
            }
            return events;
        };

        if self.state == PauseState::None {
            self.known_threads = threads.len();
            self.state = PauseState::Connected;
            events.push((
                "thread".to_string(),
                json!({ "reason": "started", "threadId": first.id }),
            ));
        }

        match top_frames {
            Some(frames) if frames > 0 => {
                if self.state != PauseState::Paused {
                    self.state = PauseState::Paused;
                    events.push((
                        "stopped".to_string(),
                        json!({
                            "reason": "breakpoint",
                            "threadId": first.id,
                            "allThreadsStopped": true,
                        }),
                    ));
                }
            }
            _ => {
                if self.state == PauseState::Paused {
                    self.state = PauseState::Connected;
                    events.push((
                        "continued".to_string(),
                        json!({ "threadId": first.id, "allThreadsContinued": true }),
                    ));
                }
            }
        }

        events
    }
}
