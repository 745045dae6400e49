//! Bounded-concurrency phase fan-out.
//!
//! Every phase that needs answers from several agents goes through one
//! [`PhaseExecutor::fan_out`] call: one tokio task per eligible player, a
//! semaphore capping how many run at once, a per-call timeout, and an overall
//! phase deadline bounding the fan-in. A slow, failing, or panicking call
//! surfaces as [`PhaseOutcome::Absent`] for that player only; siblings are
//! unaffected and results always come back in submission order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::sync::Semaphore;
use tokio::time::{timeout, timeout_at, Instant};

use crate::spygame::agent_proxy::AgentCallError;
use crate::spygame::state::PlayerId;

/// Result of one agent call within a fan-out.
#[derive(Debug)]
pub enum PhaseOutcome<T> {
    Present(T),
    /// The call failed; the caller substitutes its documented fallback.
    Absent(AgentCallError),
}

impl<T> PhaseOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            PhaseOutcome::Present(v) => Some(v),
            PhaseOutcome::Absent(_) => None,
        }
    }
}

/// Stateless concurrency harness shared by all phases of a game.
#[derive(Debug, Clone)]
pub struct PhaseExecutor {
    max_concurrency: usize,
    call_timeout: Duration,
    phase_deadline: Duration,
}

impl PhaseExecutor {
    pub fn new(max_concurrency: usize, call_timeout: Duration, phase_deadline: Duration) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            call_timeout,
            phase_deadline,
        }
    }

    /// Run `op` once per job, concurrently up to the configured cap.
    ///
    /// Returns one `(player, outcome)` pair per job, in the order the jobs
    /// were given regardless of completion order. The caller applies the
    /// outcomes serially, so shared state is never mutated concurrently.
    pub async fn fan_out<R, T, F, Fut>(
        &self,
        jobs: Vec<(PlayerId, R)>,
        op: F,
    ) -> Vec<(PlayerId, PhaseOutcome<T>)>
    where
        R: Send + 'static,
        T: Send + 'static,
        F: Fn(PlayerId, R) -> Fut,
        Fut: Future<Output = Result<T, AgentCallError>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let call_timeout = self.call_timeout;
        let deadline = Instant::now() + self.phase_deadline;

        let mut handles = Vec::with_capacity(jobs.len());
        for (player, request) in jobs {
            let permit_source = Arc::clone(&semaphore);
            let fut = op(player, request);
            let handle = tokio::spawn(async move {
                let _permit = match permit_source.acquire_owned().await {
                    Ok(p) => p,
                    // Semaphore closed: only happens on shutdown.
                    Err(_) => return Err(AgentCallError::Transport("executor shut down".into())),
                };
                match timeout(call_timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(AgentCallError::Timeout(call_timeout)),
                }
            });
            handles.push((player, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (player, handle) in handles {
            let outcome = match timeout_at(deadline, handle).await {
                Ok(Ok(Ok(value))) => PhaseOutcome::Present(value),
                Ok(Ok(Err(err))) => {
                    warn!("agent call for player {} failed: {}", player, err);
                    PhaseOutcome::Absent(err)
                }
                Ok(Err(join_err)) => {
                    warn!("agent task for player {} aborted: {}", player, join_err);
                    PhaseOutcome::Absent(AgentCallError::Transport(join_err.to_string()))
                }
                Err(_) => {
                    // Phase deadline hit; abandon the task, it holds no locks.
                    warn!("phase deadline exceeded waiting on player {}", player);
                    PhaseOutcome::Absent(AgentCallError::Timeout(self.phase_deadline))
                }
            };
            outcomes.push((player, outcome));
        }
        outcomes
    }
}
