// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Single-run slot shared by the recorder and the player
//
// At most one run per slot. Starting is check-and-set under the slot lock,
// so two concurrent starts can never both launch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RecorderError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnginePhase {
    Idle,
    Running,
    Stopping,
}

/// Snapshot of a slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStatus {
    pub phase: EnginePhase,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    fn idle() -> Self {
        Self {
            phase: EnginePhase::Idle,
            session_id: None,
            started_at: None,
        }
    }

    fn running(session_id: Uuid) -> Self {
        Self {
            phase: EnginePhase::Running,
            session_id: Some(session_id),
            started_at: Some(Utc::now()),
        }
    }
}

/// How a joined run ended
#[derive(Debug)]
pub struct RunExit<T> {
    pub session_id: Uuid,
    pub result: Result<T>,
}

struct ActiveRun<T> {
    session_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<Result<T>>,
}

pub struct RunSlot<T> {
    engine: &'static str,
    status: Arc<watch::Sender<RunStatus>>,
    active: Mutex<Option<ActiveRun<T>>>,
}

impl<T: Send + 'static> RunSlot<T> {
    pub fn new(engine: &'static str) -> Self {
        let (status, _) = watch::channel(RunStatus::idle());
        Self {
            engine,
            status: Arc::new(status),
            active: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// True from a successful start until the run completes or is stopped
    pub fn is_running(&self) -> bool {
        self.status.borrow().phase != EnginePhase::Idle
    }

    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    /// Follow status changes
    pub fn watch(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// Launch a run unless one is active
    ///
    /// `launch` performs the startup steps and yields the run future; its
    /// errors are returned here and leave the slot idle. The run future is
    /// spawned and must return once `cancel` fires.
    pub async fn try_start<F, Fut, R>(&self, session_id: Uuid, launch: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<R>>,
        R: Future<Output = Result<T>> + Send + 'static,
    {
        let mut active = self.active.lock().await;
        if self.is_running() {
            return Err(RecorderError::conflict(self.engine));
        }
        if let Some(finished) = active.take() {
            self.reap(finished).await;
        }

        self.status.send_replace(RunStatus::running(session_id));
        let cancel = CancellationToken::new();
        let run = match launch(cancel.clone()).await {
            Ok(run) => run,
            Err(err) => {
                self.status.send_replace(RunStatus::idle());
                return Err(err);
            }
        };

        let status = Arc::clone(&self.status);
        let handle = tokio::spawn(async move {
            let result = run.await;
            // A run ending on its own frees the slot; stop() handles its own
            status.send_if_modified(|s| {
                if s.phase == EnginePhase::Running {
                    *s = RunStatus::idle();
                    true
                } else {
                    false
                }
            });
            result
        });

        *active = Some(ActiveRun {
            session_id,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Cancel the current run and wait for it to exit
    ///
    /// Also collects a run that already ended on its own, so its error is
    /// reported here. `None` when there is nothing to stop.
    pub async fn stop(&self) -> Option<RunExit<T>> {
        let mut active = self.active.lock().await;
        let run = active.take()?;

        self.status.send_if_modified(|s| {
            if s.phase == EnginePhase::Running {
                s.phase = EnginePhase::Stopping;
                true
            } else {
                false
            }
        });
        run.cancel.cancel();

        let result = match run.handle.await {
            Ok(result) => result,
            Err(join_err) => Err(join_err.into()),
        };
        self.status.send_replace(RunStatus::idle());

        debug!(engine = self.engine, session_id = %run.session_id, "Run joined");
        Some(RunExit {
            session_id: run.session_id,
            result,
        })
    }

    /// Session of the stored run, finished or not
    pub async fn current_session(&self) -> Option<Uuid> {
        self.active.lock().await.as_ref().map(|run| run.session_id)
    }

    async fn reap(&self, finished: ActiveRun<T>) {
        let result = match finished.handle.await {
            Ok(result) => result,
            Err(join_err) => Err(join_err.into()),
        };
        match result {
            Ok(_) | Err(RecorderError::Cancelled) => {}
            Err(err) => warn!(
                engine = self.engine,
                session_id = %finished.session_id,
                error = %err,
                "Previous run ended with an error nobody collected"
            ),
        }
    }
}
