//! Sensor instance: one task per sensor owning its transport, protocol
//! engine and presence filter.
//!
//! The task is the only writer of the sensor's lifecycle and pending
//! command. Everyone else talks to it through an [`InstanceHandle`]:
//! commands go in over a channel and come back on a oneshot, status is
//! published on a watch channel.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use sensord_domain::command::{
    Command, CommandKind, CommandOutcome, CommandRequest, CommandResult, FailureKind,
};
use sensord_domain::event::Event;
use sensord_domain::presence::PresenceFilter;
use sensord_domain::sample::{RawSample, Reading};
use sensord_domain::sensor::{LifecycleState, Presence, SensorConfig, SensorId, SensorStatus};
use sensord_domain::time::{MonotonicClock, now};

use crate::devices::{DeviceOutput, DeviceProtocol, Step, StepRole, protocol_for};
use crate::dispatcher::{EventDispatcher, SinkHandle};
use crate::ports::BoxTransport;
use crate::protocol::ProtocolEngine;

const READ_BUFFER: usize = 512;
const MAILBOX: usize = 16;

enum Message {
    Submit {
        request: CommandRequest,
        reply: oneshot::Sender<CommandResult>,
    },
    SetEnabled {
        enabled: bool,
        reply: oneshot::Sender<SensorStatus>,
    },
    Shutdown,
}

/// Everything a sensor task needs besides its transport.
pub struct InstanceContext {
    pub config: SensorConfig,
    pub dispatcher: Arc<EventDispatcher>,
    pub sinks: Vec<SinkHandle>,
}

/// Handle to a running sensor task.
pub struct InstanceHandle {
    id: SensorId,
    config: Arc<SensorConfig>,
    tx: mpsc::Sender<Message>,
    status: watch::Receiver<SensorStatus>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl InstanceHandle {
    #[must_use]
    pub fn id(&self) -> &SensorId {
        &self.id
    }

    #[must_use]
    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Latest status snapshot.
    #[must_use]
    pub fn status(&self) -> SensorStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SensorStatus> {
        self.status.clone()
    }

    /// Submit a command and wait for its result.
    ///
    /// Never fails: a stopped instance resolves the command as a transport
    /// failure.
    pub async fn submit(&self, request: CommandRequest) -> CommandResult {
        let (reply, rx) = oneshot::channel();
        let fallback = request.clone();
        if self.tx.send(Message::Submit { request, reply }).await.is_err() {
            return self.gone(fallback);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => self.gone(fallback),
        }
    }

    /// Toggle sample processing.
    pub async fn set_enabled(&self, enabled: bool) -> SensorStatus {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Message::SetEnabled { enabled, reply })
            .await
            .is_err()
        {
            return self.status();
        }
        rx.await.unwrap_or_else(|_| self.status())
    }

    /// Stop the task, cancelling any command in flight, and close the
    /// transport.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown).await;
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            tracing::warn!(sensor = %self.id, %err, "sensor task ended abnormally");
        }
    }

    fn gone(&self, request: CommandRequest) -> CommandResult {
        CommandResult::complete(
            self.id.clone(),
            request,
            CommandOutcome::failed(FailureKind::Transport(
                "sensor instance stopped".to_string(),
            )),
        )
    }
}

/// Spawn the task of one sensor.
///
/// `transport` is `Err(reason)` when it could not be opened; the instance
/// then starts in the error state and fails every device command.
pub fn spawn(context: InstanceContext, transport: Result<BoxTransport, String>) -> InstanceHandle {
    let InstanceContext {
        config,
        dispatcher,
        sinks,
    } = context;
    let config = Arc::new(config);
    let id = config.id();
    let device = protocol_for(&config);
    let tokens = device.tokens().with_overrides(&config.protocol);
    let timeout = config.command_timeout.unwrap_or(device.default_timeout());
    let policy = config
        .presence
        .clone()
        .unwrap_or_else(|| device.default_policy());

    let mut initial = SensorStatus::initial(&config);
    let (reader, writer) = match transport {
        Ok(transport) => {
            if config.enabled && device.scans_when_open() {
                initial.lifecycle = LifecycleState::Scanning;
            }
            let (reader, writer) = tokio::io::split(transport);
            (Some(reader), Some(writer))
        }
        Err(reason) => {
            initial.lifecycle = LifecycleState::Error { reason };
            (None, None)
        }
    };
    let (status_tx, status_rx) = watch::channel(initial);
    let (tx, rx) = mpsc::channel(MAILBOX);

    let task = SensorTask {
        id: id.clone(),
        config: Arc::clone(&config),
        device,
        engine: ProtocolEngine::new(tokens, timeout),
        filter: PresenceFilter::new(policy),
        clock: MonotonicClock::default(),
        reader,
        writer,
        status: status_tx,
        active: None,
        dispatcher,
        sinks,
        rx,
    };
    let join = tokio::spawn(task.run());

    InstanceHandle {
        id,
        config,
        tx,
        status: status_rx,
        task: std::sync::Mutex::new(Some(join)),
    }
}

/// A command being worked through its steps.
struct ActiveCommand {
    request: CommandRequest,
    reply: oneshot::Sender<CommandResult>,
    previous: LifecycleState,
    current: Step,
    remaining: VecDeque<Step>,
    retries_left: u8,
    lines: Vec<String>,
    failure: Option<CommandOutcome>,
    paused: bool,
}

struct SensorTask {
    id: SensorId,
    config: Arc<SensorConfig>,
    device: Box<dyn DeviceProtocol>,
    engine: ProtocolEngine,
    filter: PresenceFilter,
    clock: MonotonicClock,
    reader: Option<ReadHalf<BoxTransport>>,
    writer: Option<WriteHalf<BoxTransport>>,
    status: watch::Sender<SensorStatus>,
    active: Option<ActiveCommand>,
    dispatcher: Arc<EventDispatcher>,
    sinks: Vec<SinkHandle>,
    rx: mpsc::Receiver<Message>,
}

async fn read_some(
    reader: &mut Option<ReadHalf<BoxTransport>>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn with_lines(outcome: CommandOutcome, lines: Vec<String>) -> CommandOutcome {
    match outcome {
        CommandOutcome::Confirmed { .. } => CommandOutcome::Confirmed { lines },
        CommandOutcome::Failed { failure, .. } => CommandOutcome::Failed { failure, lines },
        CommandOutcome::TimedOut { .. } => CommandOutcome::TimedOut { lines },
    }
}

impl SensorTask {
    async fn run(mut self) {
        tracing::debug!(sensor = %self.id, "sensor task started");
        let mut buf = [0u8; READ_BUFFER];
        loop {
            let deadline = self.engine.deadline();
            // Device output is drained before the next command is accepted.
            tokio::select! {
                biased;
                read = read_some(&mut self.reader, &mut buf) => match read {
                    Ok(0) => self.transport_failed("transport closed".to_string()),
                    Ok(n) => self.handle_bytes(&buf[..n]).await,
                    Err(err) => self.transport_failed(err.to_string()),
                },
                () = wait_deadline(deadline) => self.handle_deadline().await,
                msg = self.rx.recv() => match msg {
                    Some(Message::Submit { request, reply }) => self.submit(request, reply).await,
                    Some(Message::SetEnabled { enabled, reply }) => {
                        self.set_enabled(enabled);
                        let _ = reply.send(self.status.borrow().clone());
                    }
                    Some(Message::Shutdown) | None => break,
                },
            }
        }
        if let Some(outcome) = self.engine.abort(FailureKind::Superseded) {
            self.finish(outcome);
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        tracing::debug!(sensor = %self.id, "sensor task stopped");
    }

    fn lifecycle(&self) -> LifecycleState {
        self.status.borrow().lifecycle.clone()
    }

    fn set_lifecycle(&self, lifecycle: LifecycleState) {
        self.status.send_modify(|status| {
            if status.lifecycle != lifecycle {
                tracing::debug!(sensor = %self.id, from = %status.lifecycle, to = %lifecycle, "lifecycle changed");
                status.lifecycle = lifecycle;
            }
        });
    }

    fn enabled(&self) -> bool {
        self.status.borrow().enabled
    }

    /// Lifecycle the sensor settles in once no transition is under way.
    fn resting(&self) -> LifecycleState {
        let enabled = self.enabled();
        if enabled && self.device.scans_when_open() {
            LifecycleState::Scanning
        } else {
            LifecycleState::idle(enabled)
        }
    }

    fn set_enabled(&self, enabled: bool) {
        let streams = self.device.scans_when_open();
        self.status.send_modify(|status| {
            status.enabled = enabled;
            match (&status.lifecycle, enabled) {
                (LifecycleState::Stopped, false) => status.lifecycle = LifecycleState::Disabled,
                (LifecycleState::Scanning, false) if streams => {
                    status.lifecycle = LifecycleState::Disabled;
                }
                (LifecycleState::Disabled, true) if streams => {
                    status.lifecycle = LifecycleState::Scanning;
                }
                (LifecycleState::Disabled, true) => status.lifecycle = LifecycleState::Stopped,
                _ => {}
            }
        });
        tracing::info!(sensor = %self.id, enabled, "reading toggled");
    }

    fn reply(
        &self,
        request: CommandRequest,
        reply: oneshot::Sender<CommandResult>,
        outcome: CommandOutcome,
    ) {
        let result = CommandResult::complete(self.id.clone(), request, outcome);
        tracing::debug!(
            sensor = %self.id,
            command = %result.request.command,
            outcome = %result.outcome,
            "command resolved"
        );
        let _ = reply.send(result);
    }

    async fn submit(&mut self, request: CommandRequest, reply: oneshot::Sender<CommandResult>) {
        let command = request.command.clone();

        if command.is_local() {
            match command {
                Command::Enable => self.set_enabled(true),
                Command::Disable => self.set_enabled(false),
                _ => {}
            }
            let outcome = CommandOutcome::Confirmed { lines: Vec::new() };
            self.reply(request, reply, outcome);
            return;
        }

        if self.active.is_some() {
            if !command.supersedes() {
                self.reply(request, reply, CommandOutcome::failed(FailureKind::Busy));
                return;
            }
            if let Some(outcome) = self.engine.abort(FailureKind::Superseded) {
                self.finish(outcome);
            }
        }

        if self.writer.is_none() {
            let reason = match self.lifecycle() {
                LifecycleState::Error { reason } => reason,
                _ => "transport unavailable".to_string(),
            };
            self.reply(request, reply, CommandOutcome::failed(FailureKind::Transport(reason)));
            return;
        }

        // A disabled sensor is enabled first; a failed one needs reset or stop.
        if command == Command::Start {
            let lifecycle = self.lifecycle();
            if matches!(lifecycle, LifecycleState::Disabled | LifecycleState::Error { .. }) {
                let failure = FailureKind::InvalidState(lifecycle.to_string());
                self.reply(request, reply, CommandOutcome::failed(failure));
                return;
            }
        }

        let previous = self.lifecycle();
        let scanning = previous == LifecycleState::Scanning;
        let mut steps: VecDeque<Step> = match self.device.plan(&command, scanning) {
            Ok(steps) => steps.into(),
            Err(failure) => {
                self.reply(request, reply, CommandOutcome::failed(failure));
                return;
            }
        };

        match command {
            Command::Start => self.set_lifecycle(LifecycleState::Starting),
            Command::Stop => self.set_lifecycle(LifecycleState::Stopping),
            _ => {}
        }

        let Some(first) = steps.pop_front() else {
            let confirmed = CommandOutcome::Confirmed { lines: Vec::new() };
            let final_state = self.final_lifecycle(&command, &previous, &confirmed, false);
            self.set_lifecycle(final_state);
            if command == Command::Reset {
                self.filter.reset();
                self.status.send_modify(|status| status.presence = Presence::Unknown);
            }
            self.reply(request, reply, confirmed);
            return;
        };

        self.status
            .send_modify(|status| status.pending_command = Some(command.kind()));
        self.active = Some(ActiveCommand {
            request,
            reply,
            previous,
            current: first,
            remaining: steps,
            retries_left: self.config.command_retries,
            lines: Vec::new(),
            failure: None,
            paused: false,
        });
        self.send_current_step().await;
    }

    async fn send_current_step(&mut self) {
        let Some(step) = self.active.as_ref().map(|active| active.current.clone()) else {
            return;
        };
        if self.writer.is_none() {
            self.transport_failed("transport unavailable".to_string());
            return;
        }
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        tracing::debug!(sensor = %self.id, line = %step.line, "sending command");
        let written = async {
            writer.write_all(&step.wire()).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            self.transport_failed(err.to_string());
            return;
        }
        if let Err(failure) = self.engine.begin(step.line, Instant::now())
            && let Some(active) = self.active.take()
        {
            self.reply(active.request, active.reply, CommandOutcome::failed(failure));
        }
    }

    async fn handle_bytes(&mut self, bytes: &[u8]) {
        for output in self.device.feed(bytes) {
            match output {
                DeviceOutput::Line(line) => {
                    tracing::trace!(sensor = %self.id, %line, "device output");
                    if let Some(outcome) = self.engine.on_line(&line) {
                        self.step_finished(outcome).await;
                    }
                }
                DeviceOutput::Reading(reading) => self.handle_reading(reading).await,
            }
        }
    }

    async fn handle_deadline(&mut self) {
        let Some(outcome) = self.engine.on_deadline(Instant::now()) else {
            return;
        };
        if let Some(active) = self.active.as_mut()
            && active.retries_left > 0
        {
            active.retries_left -= 1;
            active.lines.extend(outcome.lines().iter().cloned());
            tracing::info!(sensor = %self.id, line = %active.current.line, retries_left = active.retries_left, "command timed out, retrying");
            self.send_current_step().await;
            return;
        }
        self.step_finished(outcome).await;
    }

    async fn step_finished(&mut self, outcome: CommandOutcome) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.lines.extend(outcome.lines().iter().cloned());
        let role = active.current.role;

        if outcome.is_confirmed() {
            match role {
                StepRole::Pause => active.paused = true,
                StepRole::Resume => active.paused = false,
                StepRole::Main | StepRole::Save => {}
            }
        } else {
            if active.failure.is_none() {
                active.failure = Some(with_lines(outcome, Vec::new()));
            }
            match role {
                StepRole::Main | StepRole::Save => {
                    // Skip the save, but still resume a paused device.
                    active.remaining.retain(|step| step.role == StepRole::Resume);
                }
                StepRole::Pause | StepRole::Resume => active.remaining.clear(),
            }
        }

        match active.remaining.pop_front() {
            Some(next) => {
                active.current = next;
                active.retries_left = self.config.command_retries;
                self.send_current_step().await;
            }
            None => {
                let outcome = active
                    .failure
                    .take()
                    .unwrap_or(CommandOutcome::Confirmed { lines: Vec::new() });
                self.finish(outcome);
            }
        }
    }

    /// Resolve the active command with `outcome` and apply the lifecycle rules.
    fn finish(&mut self, outcome: CommandOutcome) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let mut lines = std::mem::take(&mut active.lines);
        lines.extend(outcome.lines().iter().cloned());
        let outcome = with_lines(outcome, lines);
        let command = active.request.command.clone();

        let transport_failed = matches!(
            outcome,
            CommandOutcome::Failed {
                failure: FailureKind::Transport(_),
                ..
            }
        );
        if !transport_failed {
            let next = self.final_lifecycle(&command, &active.previous, &outcome, active.paused);
            self.set_lifecycle(next);
        }
        if command == Command::Reset {
            self.filter.reset();
            self.status.send_modify(|status| status.presence = Presence::Unknown);
        }
        self.status.send_modify(|status| status.pending_command = None);
        self.reply(active.request, active.reply, outcome);
    }

    fn final_lifecycle(
        &self,
        command: &Command,
        previous: &LifecycleState,
        outcome: &CommandOutcome,
        paused: bool,
    ) -> LifecycleState {
        let idle = LifecycleState::idle(self.enabled());
        let reverts = matches!(
            outcome,
            CommandOutcome::TimedOut { .. }
                | CommandOutcome::Failed {
                    failure: FailureKind::Superseded,
                    ..
                }
        );
        match command.kind() {
            CommandKind::Reset => self.resting(),
            CommandKind::Start | CommandKind::Stop => {
                if outcome.is_confirmed() {
                    if command == &Command::Start {
                        LifecycleState::Scanning
                    } else {
                        idle
                    }
                } else if reverts {
                    previous.clone()
                } else {
                    LifecycleState::Error {
                        reason: format!("{} {outcome}", command.kind()),
                    }
                }
            }
            // A configuration chain that paused the device and could not
            // resume it leaves the device stopped.
            _ if paused => idle,
            _ => previous.clone(),
        }
    }

    async fn handle_reading(&mut self, reading: Reading) {
        if let Reading::Distance(cm) = reading {
            self.status.send_modify(|status| status.distance_cm = Some(cm));
        }

        let lifecycle = self.lifecycle();
        if self.device.reports_only_when_scanning() {
            if lifecycle == LifecycleState::Stopped && self.active.is_none() {
                tracing::info!(sensor = %self.id, "device already scanning");
                self.set_lifecycle(LifecycleState::Scanning);
            }
        } else if lifecycle != LifecycleState::Scanning {
            return;
        }

        if !self.enabled() {
            return;
        }

        let sample = RawSample::new(self.config.name.clone(), reading, now());
        let Some(change) = self.filter.ingest(&sample) else {
            return;
        };
        let present = change.present;
        self.status
            .send_modify(|status| status.presence = Presence::from(present));
        let event_at = self.clock.stamp(change.confirmed_at);
        if self.config.print_presence {
            tracing::info!(sensor = %self.id, presence = present, "presence changed");
        }
        let event = Event::presence_change(self.id.clone(), present, event_at);
        self.dispatcher.publish(event, &self.sinks).await;
    }

    fn transport_failed(&mut self, reason: String) {
        tracing::warn!(sensor = %self.id, %reason, "transport failed");
        self.reader = None;
        self.writer = None;
        self.set_lifecycle(LifecycleState::Error {
            reason: reason.clone(),
        });
        if let Some(outcome) = self.engine.abort(FailureKind::Transport(reason.clone())) {
            self.finish(outcome);
        } else if self.active.is_some() {
            self.finish(CommandOutcome::failed(FailureKind::Transport(reason)));
        }
    }
}
