//! Agent runtime.
//!
//! Every agent implements [`Agent`] and is driven by an [`AgentHandle`].
//! Starting an agent subscribes its topics into a private inbox and spawns
//! one task that owns the agent. That task multiplexes four sources:
//! - the shutdown signal
//! - the inbox (events are drained before a due tick)
//! - a one-shot deadline set through [`AgentContext::schedule_tick`]
//! - the agent's own periodic interval, if it has one
//!
//! Because handlers and ticks run on the same task, an agent never sees
//! two of its callbacks at once. Stopping signals the task, waits for the
//! in-flight callback to finish, then releases the subscriptions.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ecosmart_core::config::RuntimeConfig;
use ecosmart_core::{
    handler_fn, AgentState, EcoEvent, Envelope, Error, EventBus, HealthStatus, SubscriptionHandle,
    Topic,
};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};

use crate::error::{AgentError, Result};

/// Capability interface shared by every agent.
#[async_trait]
pub trait Agent: Send + 'static {
    fn name(&self) -> &str;

    /// Period of the agent's own timer. `None` for purely event-driven agents.
    fn tick_interval(&self) -> Option<Duration>;

    /// Topics delivered to [`Agent::handle_event`].
    fn topics(&self) -> Vec<Topic> {
        Vec::new()
    }

    async fn on_start(&mut self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    /// Handle one inbound event. Errors are logged and never count toward
    /// degradation.
    async fn handle_event(&mut self, _envelope: Arc<Envelope>, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    /// One unit of periodic work. Consecutive failures degrade the agent.
    async fn tick(&mut self, ctx: &AgentContext) -> Result<()>;

    async fn on_stop(&mut self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AgentStatus {
    state: AgentState,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Handle given to agent callbacks.
#[derive(Clone)]
pub struct AgentContext {
    name: Arc<str>,
    bus: EventBus,
    status: Arc<RwLock<AgentStatus>>,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl AgentContext {
    fn new(name: Arc<str>, bus: EventBus, state: AgentState) -> Self {
        Self {
            name,
            bus,
            status: Arc::new(RwLock::new(AgentStatus {
                state,
                consecutive_failures: 0,
                last_error: None,
            })),
            deadline: Arc::new(Mutex::new(None)),
        }
    }

    /// Running context with no task behind it, for driving an agent by hand.
    pub fn detached(name: &str, bus: EventBus) -> Self {
        Self::new(Arc::from(name), bus, AgentState::Running)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn state(&self) -> AgentState {
        self.status.read().state
    }

    /// Publish on the event's own topic with this agent as the source.
    pub fn publish(&self, event: EcoEvent) -> Result<Arc<Envelope>> {
        if self.state() == AgentState::Stopped {
            return Err(AgentError::Stopped(self.name.to_string()));
        }
        Ok(self.bus.emit(event, self.name.as_ref())?)
    }

    /// Request a tick `after` from now. Pending requests coalesce and the
    /// earliest deadline wins.
    pub fn schedule_tick(&self, after: Duration) {
        let at = Instant::now() + after;
        let mut deadline = self.deadline.lock();
        match *deadline {
            Some(existing) if existing <= at => {}
            _ => *deadline = Some(at),
        }
    }

    pub(crate) fn pending_deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    fn clear_deadline(&self) {
        self.deadline.lock().take();
    }

    fn health(&self) -> HealthStatus {
        let status = self.status.read();
        HealthStatus {
            agent: self.name.to_string(),
            state: status.state,
            consecutive_failures: status.consecutive_failures,
            last_error: status.last_error.clone(),
            timestamp: Utc::now(),
        }
    }

    fn set_state(&self, state: AgentState) {
        let changed = {
            let mut status = self.status.write();
            let changed = status.state != state;
            status.state = state;
            changed
        };
        if changed {
            self.publish_health();
        }
    }

    fn publish_health(&self) {
        let health = self.health();
        if let Err(e) = self.bus.emit(EcoEvent::HealthStatus(health), self.name.as_ref()) {
            tracing::warn!(agent = %self.name, error = %e, "failed to publish health status");
        }
    }

    fn record_success(&self) {
        let recovered = {
            let mut status = self.status.write();
            status.consecutive_failures = 0;
            status.state == AgentState::Degraded
        };
        if recovered {
            tracing::info!(agent = %self.name, "agent recovered");
            self.set_state(AgentState::Running);
        }
    }

    fn record_failure(&self, error: &AgentError, threshold: u32) {
        let (failures, degrade) = {
            let mut status = self.status.write();
            status.consecutive_failures += 1;
            status.last_error = Some(error.to_string());
            (
                status.consecutive_failures,
                status.state == AgentState::Running && status.consecutive_failures >= threshold,
            )
        };
        if degrade {
            tracing::error!(
                agent = %self.name,
                consecutive_failures = failures,
                error = %error,
                "agent degraded"
            );
            self.set_state(AgentState::Degraded);
        } else {
            tracing::warn!(
                agent = %self.name,
                consecutive_failures = failures,
                error = %error,
                "tick failed"
            );
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Box<dyn Agent>>,
    subscriptions: Vec<SubscriptionHandle>,
}

/// Spawns agents onto the Tokio runtime.
pub struct AgentRuntime;

impl AgentRuntime {
    /// Wrap `agent` in a stopped handle bound to `bus`.
    pub fn spawn<A: Agent>(agent: A, bus: EventBus, config: &RuntimeConfig) -> AgentHandle {
        let name: Arc<str> = Arc::from(agent.name());
        AgentHandle {
            ctx: AgentContext::new(name, bus, AgentState::Stopped),
            config: config.clone(),
            agent: Some(Box::new(agent)),
            running: None,
        }
    }
}

/// Owner of one agent's lifecycle.
pub struct AgentHandle {
    ctx: AgentContext,
    config: RuntimeConfig,
    agent: Option<Box<dyn Agent>>,
    running: Option<Running>,
}

impl AgentHandle {
    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn state(&self) -> AgentState {
        self.ctx.state()
    }

    pub fn health(&self) -> HealthStatus {
        self.ctx.health()
    }

    /// `Stopped → Starting → Running`, then begin ticking.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(AgentError::AlreadyRunning(self.name().to_string()));
        }
        let mut agent = self
            .agent
            .take()
            .ok_or_else(|| AgentError::AlreadyRunning(self.name().to_string()))?;

        {
            let mut status = self.ctx.status.write();
            status.consecutive_failures = 0;
            status.last_error = None;
        }
        self.ctx.clear_deadline();
        self.ctx.set_state(AgentState::Starting);

        let (inbox_tx, inbox) = mpsc::unbounded_channel::<Arc<Envelope>>();
        let subscriptions: Vec<SubscriptionHandle> = agent
            .topics()
            .into_iter()
            .map(|topic| {
                let tx = inbox_tx.clone();
                self.ctx.bus.subscribe(
                    topic,
                    handler_fn(move |envelope| {
                        let sent = tx.send(envelope);
                        async move { sent.map_err(|_| Error::Bus("agent inbox closed".into())) }
                    }),
                )
            })
            .collect();
        drop(inbox_tx);

        if let Err(e) = agent.on_start(&self.ctx).await {
            tracing::error!(agent = %self.name(), error = %e, "agent failed to start");
            for handle in &subscriptions {
                self.ctx.bus.unsubscribe(handle);
            }
            self.agent = Some(agent);
            self.ctx.set_state(AgentState::Stopped);
            return Err(e);
        }

        self.ctx.set_state(AgentState::Running);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            agent,
            self.ctx.clone(),
            self.config.clone(),
            inbox,
            shutdown_rx,
        ));
        self.running = Some(Running {
            shutdown,
            task,
            subscriptions,
        });
        tracing::info!(agent = %self.name(), "agent started");
        Ok(())
    }

    /// Finish the in-flight callback, release subscriptions, report `Stopped`.
    pub async fn stop(&mut self) -> Result<()> {
        let running = self
            .running
            .take()
            .ok_or_else(|| AgentError::NotRunning(self.name().to_string()))?;
        self.ctx.set_state(AgentState::Stopping);

        // The receiver lives inside the task, which may already be gone.
        let _ = running.shutdown.send(true);
        let joined = running.task.await;
        for handle in &running.subscriptions {
            self.ctx.bus.unsubscribe(handle);
        }
        self.ctx.set_state(AgentState::Stopped);

        match joined {
            Ok(agent) => {
                self.agent = Some(agent);
                tracing::info!(agent = %self.name(), "agent stopped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(agent = %self.name(), error = %e, "agent task aborted");
                Err(AgentError::Core(e.into()))
            }
        }
    }
}

async fn run_loop(
    mut agent: Box<dyn Agent>,
    ctx: AgentContext,
    config: RuntimeConfig,
    mut inbox: mpsc::UnboundedReceiver<Arc<Envelope>>,
    mut shutdown: watch::Receiver<bool>,
) -> Box<dyn Agent> {
    let periodic = agent.tick_interval();
    let mut ticker = tokio::time::interval(periodic.unwrap_or(Duration::from_secs(3600)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = ctx.pending_deadline();
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(envelope) = inbox.recv() => {
                let topic = envelope.topic;
                let outcome = AssertUnwindSafe(agent.handle_event(envelope, &ctx))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(
                            agent = %ctx.name(),
                            topic = %topic,
                            error = %e,
                            "event rejected"
                        );
                    }
                    Err(_) => {
                        tracing::error!(
                            agent = %ctx.name(),
                            topic = %topic,
                            "event handler panicked"
                        );
                    }
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                ctx.clear_deadline();
                run_tick(agent.as_mut(), &ctx, &config).await;
            }
            _ = ticker.tick(), if periodic.is_some() => {
                run_tick(agent.as_mut(), &ctx, &config).await;
            }
        }
    }

    if let Err(e) = agent.on_stop(&ctx).await {
        tracing::warn!(agent = %ctx.name(), error = %e, "on_stop failed");
    }
    agent
}

async fn run_tick(agent: &mut dyn Agent, ctx: &AgentContext, config: &RuntimeConfig) {
    let limit = config.tick_timeout();
    let outcome = AssertUnwindSafe(tokio::time::timeout(limit, agent.tick(ctx)))
        .catch_unwind()
        .await;
    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(AgentError::Core(Error::timeout(format!(
            "tick exceeded {limit:?}"
        )))),
        Err(_) => Err(AgentError::TickFailed {
            agent: ctx.name().to_string(),
            message: "tick panicked".to_string(),
        }),
    };
    match result {
        Ok(()) => ctx.record_success(),
        Err(e) => ctx.record_failure(&e, config.degraded_threshold),
    }
}
