//! Run lifecycle state machine
//!
//! [`RunMachine`] is a pure step function: it is fed what happened
//! ([`Observation`]) plus the current instant and answers with what to do
//! next ([`Directive`]). [`RunDriver`] owns the timer and the service calls
//! and loops the machine until a terminal state. Keeping time out of the
//! machine lets tests drive it with `tokio::time::pause`.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::RunConfig;
use crate::core::{
    DispatchMode, RelayError, Result, RunHandle, RunSnapshot, RunState, ToolCallRequest,
    ToolOutput,
};
use crate::llm::CompletionService;
use crate::tools::{ActionDispatcher, ToolContext};

/// Deadline used when `now + run_timeout` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Something the driver saw
#[derive(Debug)]
pub enum Observation {
    /// A poll answered
    Snapshot(RunSnapshot),
    /// A poll failed
    PollError(RelayError),
    /// A poll was still outstanding at the deadline
    DeadlineReached,
    /// Tool outputs were accepted
    Submitted,
}

/// What the driver must do next
#[derive(Debug)]
pub enum Directive {
    /// Wait, then poll
    Poll { after: Duration },
    /// Execute these calls and submit their outputs
    Dispatch(Vec<ToolCallRequest>),
    /// The run is over
    Finish {
        state: RunState,
        last_error: Option<String>,
    },
    /// Polling cannot continue
    Abort(RelayError),
}

/// Poll/backoff/expiry state of a single run
#[derive(Debug, Clone)]
pub struct RunMachine {
    run_id: String,
    base_interval: Duration,
    max_interval: Duration,
    backoff_factor: f64,
    retry_backoff: Duration,
    max_retries: u32,
    timeout: Duration,
    deadline: Instant,
    interval: Duration,
    consecutive_errors: u32,
    tool_rounds: u32,
    expired_locally: bool,
}

impl RunMachine {
    pub fn new(run_id: impl Into<String>, config: &RunConfig, now: Instant) -> Self {
        let timeout = config.run_timeout();
        let deadline = now
            .checked_add(timeout)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        Self {
            run_id: run_id.into(),
            base_interval: config.poll_interval(),
            max_interval: config.max_poll_interval(),
            backoff_factor: config.backoff_factor.max(1.0),
            retry_backoff: config.retry_backoff(),
            max_retries: config.max_poll_retries,
            timeout,
            deadline,
            interval: config.poll_interval(),
            consecutive_errors: 0,
            tool_rounds: 0,
            expired_locally: false,
        }
    }

    /// First directive: check the new run right away
    pub fn start(&self) -> Directive {
        Directive::Poll {
            after: Duration::ZERO,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn tool_rounds(&self) -> u32 {
        self.tool_rounds
    }

    /// True when the run was expired by the local deadline, not the service
    pub fn expired_locally(&self) -> bool {
        self.expired_locally
    }

    /// Advance on one observation
    pub fn observe(&mut self, observation: Observation, now: Instant) -> Directive {
        match observation {
            Observation::Snapshot(snapshot) => {
                self.consecutive_errors = 0;
                self.on_snapshot(snapshot, now)
            }
            Observation::PollError(error) => self.on_error(error, now),
            Observation::DeadlineReached => self.expire(),
            Observation::Submitted => {
                self.interval = self.base_interval;
                Directive::Poll {
                    after: self.clamp(self.base_interval, now),
                }
            }
        }
    }

    fn on_snapshot(&mut self, snapshot: RunSnapshot, now: Instant) -> Directive {
        if snapshot.state.is_terminal() {
            return Directive::Finish {
                state: snapshot.state,
                last_error: snapshot.last_error,
            };
        }

        if now >= self.deadline {
            return self.expire();
        }

        if snapshot.state == RunState::RequiresAction && !snapshot.pending_tool_calls.is_empty() {
            self.tool_rounds += 1;
            return Directive::Dispatch(snapshot.pending_tool_calls);
        }

        Directive::Poll {
            after: self.next_interval(now),
        }
    }

    fn on_error(&mut self, error: RelayError, now: Instant) -> Directive {
        if !error.is_transient() || self.consecutive_errors >= self.max_retries {
            return Directive::Abort(RelayError::RunPollingFailed {
                run_id: self.run_id.clone(),
                reason: error.to_string(),
            });
        }

        if now >= self.deadline {
            return self.expire();
        }

        self.consecutive_errors += 1;
        let delay = retry_delay(self.retry_backoff, self.consecutive_errors);
        warn!(
            run_id = %self.run_id,
            attempt = self.consecutive_errors,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient poll failure, retrying"
        );
        Directive::Poll {
            after: self.clamp(delay, now),
        }
    }

    fn expire(&mut self) -> Directive {
        self.expired_locally = true;
        Directive::Finish {
            state: RunState::Expired,
            last_error: Some(format!("no terminal state within {:?}", self.timeout)),
        }
    }

    /// Current interval, then grow it toward the cap
    fn next_interval(&mut self, now: Instant) -> Duration {
        let current = self.interval;
        self.interval =
            Duration::try_from_secs_f64(self.interval.as_secs_f64() * self.backoff_factor)
                .map_or(self.max_interval, |grown| grown.min(self.max_interval));
        self.clamp(current, now)
    }

    /// Never sleep past the deadline
    fn clamp(&self, delay: Duration, now: Instant) -> Duration {
        delay.min(self.deadline.saturating_duration_since(now))
    }
}

/// Exponential retry delay with up to 25% jitter
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let jitter_ms = (exp.as_millis() as u64) / 4;
    if jitter_ms == 0 {
        return exp;
    }
    exp.saturating_add(Duration::from_millis(rand::rng().random_range(0..=jitter_ms)))
}

/// How a driven run ended
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub final_state: RunState,
    pub tool_rounds: u32,
    pub last_error: Option<String>,
    pub expired_locally: bool,
}

/// Drives one run to a terminal state
pub struct RunDriver<'a> {
    service: &'a dyn CompletionService,
    dispatcher: &'a ActionDispatcher,
    config: &'a RunConfig,
    mode: DispatchMode,
}

impl<'a> RunDriver<'a> {
    pub fn new(
        service: &'a dyn CompletionService,
        dispatcher: &'a ActionDispatcher,
        config: &'a RunConfig,
        mode: DispatchMode,
    ) -> Self {
        Self {
            service,
            dispatcher,
            config,
            mode,
        }
    }

    /// Poll, dispatch and resubmit until the run ends
    pub async fn drive(&self, run: &RunHandle, ctx: &ToolContext) -> Result<RunReport> {
        let mut machine = RunMachine::new(&run.run_id, self.config, Instant::now());
        let mut directive = machine.start();

        loop {
            directive = match directive {
                Directive::Poll { after } => {
                    if !after.is_zero() {
                        tokio::time::sleep(after).await;
                    }
                    let observation = match tokio::time::timeout_at(
                        machine.deadline(),
                        self.service.get_run(run),
                    )
                    .await
                    {
                        Ok(Ok(snapshot)) => {
                            debug!(run_id = %run.run_id, state = %snapshot.state, "polled");
                            Observation::Snapshot(snapshot)
                        }
                        Ok(Err(e)) => Observation::PollError(e),
                        Err(_) => Observation::DeadlineReached,
                    };
                    machine.observe(observation, Instant::now())
                }
                Directive::Dispatch(calls) => {
                    info!(run_id = %run.run_id, calls = calls.len(), "run requires action");
                    let results = self.dispatcher.dispatch(&calls, self.mode, ctx).await;
                    let outputs: Vec<ToolOutput> =
                        results.iter().map(|r| r.to_tool_output()).collect();
                    if let Err(e) = self.submit(run, &outputs).await {
                        self.abandon(run).await;
                        return Err(e);
                    }
                    machine.observe(Observation::Submitted, Instant::now())
                }
                Directive::Finish { state, last_error } => {
                    if machine.expired_locally() {
                        self.abandon(run).await;
                    }
                    return Ok(RunReport {
                        final_state: state,
                        tool_rounds: machine.tool_rounds(),
                        last_error,
                        expired_locally: machine.expired_locally(),
                    });
                }
                Directive::Abort(e) => {
                    self.abandon(run).await;
                    return Err(e);
                }
            };
        }
    }

    /// Best-effort remote cancel of a run we stopped watching
    async fn abandon(&self, run: &RunHandle) {
        if !self.config.cancel_abandoned_runs {
            return;
        }
        if let Err(e) = self.service.cancel_run(run).await {
            warn!(run_id = %run.run_id, error = %e, "cancelling abandoned run failed");
        }
    }

    /// Submit a batch, retrying transient failures like polls do
    async fn submit(&self, run: &RunHandle, outputs: &[ToolOutput]) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.service.submit_tool_outputs(run, outputs).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_poll_retries => {
                    attempt += 1;
                    let delay = retry_delay(self.config.retry_backoff(), attempt);
                    warn!(run_id = %run.run_id, attempt, error = %e, "transient submit failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(RelayError::RunPollingFailed {
                        run_id: run.run_id.clone(),
                        reason: format!("submitting tool outputs: {}", e),
                    })
                }
            }
        }
    }
}
