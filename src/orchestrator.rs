//! Session orchestrator for the sorting cell
//!
//! Drives the run state machine:
//!
//! ```text
//! Idle -> Connecting -> Ready -> Running(manual|batch) -> SafetyDwell -> Ready
//!                 (any) -> EmergencyStopped -> Ready
//! ```
//!
//! Foreground calls and the per-batch monitor task share state through
//! atomics and short-lived locks. Each batch gets a generation number; a
//! monitor whose generation is no longer current never touches the state
//! machine or records an outcome.

use crate::client::RobotClient;
use crate::config::Config;
use crate::json_output::{CellEvent, NoticeLevel};
use crate::monitor;
use crate::outcome::{RunMode, RunOutcome, RunRequest};
use crate::persistence::RunStore;
use crate::program::ProgramTemplate;
use crate::{CellError, Result};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    Idle,
    Connecting,
    Ready,
    Running(RunMode),
    SafetyDwell,
    EmergencyStopped,
}

impl fmt::Display for CellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellState::Idle => write!(f, "idle"),
            CellState::Connecting => write!(f, "connecting"),
            CellState::Ready => write!(f, "ready"),
            CellState::Running(RunMode::Manual) => write!(f, "running(manual)"),
            CellState::Running(RunMode::Batch) => write!(f, "running(batch)"),
            CellState::SafetyDwell => write!(f, "safety_dwell"),
            CellState::EmergencyStopped => write!(f, "emergency_stopped"),
        }
    }
}

/// Point-in-time view of the cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellSnapshot {
    pub state: CellState,
    pub connected: bool,
    pub conveyor_on: bool,
    pub batch_active: bool,
    pub monitor_active: bool,
    pub target_cycles: u32,
    pub operator: Option<String>,
}

/// State shared between the foreground path and the batch monitor
pub(crate) struct CellShared {
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn RunStore>,
    client: RwLock<Option<Arc<RobotClient>>>,
    state: Mutex<CellState>,
    pub(crate) batch_active: AtomicBool,
    pub(crate) monitor_active: AtomicBool,
    generation: AtomicU64,
    target: AtomicU32,
    pub(crate) conveyor_on: AtomicBool,
    operator: Mutex<Option<String>>,
    emergency: watch::Sender<u64>,
    events: broadcast::Sender<CellEvent>,
}

impl CellShared {
    pub(crate) async fn client(&self) -> Option<Arc<RobotClient>> {
        self.client.read().await.clone()
    }

    async fn live_client(&self) -> Option<Arc<RobotClient>> {
        self.client().await.filter(|c| c.is_connected())
    }

    pub(crate) async fn state(&self) -> CellState {
        *self.state.lock().await
    }

    pub(crate) async fn set_state(&self, to: CellState) {
        let from = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            info!("Cell state {} -> {}", from, to);
            let _ = self.events.send(CellEvent::state_changed(from, to));
        }
    }

    /// Move to `to` only when the current state satisfies `allowed`
    async fn claim<F>(&self, allowed: F, to: CellState) -> std::result::Result<CellState, CellState>
    where
        F: Fn(CellState) -> bool,
    {
        let from = {
            let mut state = self.state.lock().await;
            if !allowed(*state) {
                return Err(*state);
            }
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            info!("Cell state {} -> {}", from, to);
            let _ = self.events.send(CellEvent::state_changed(from, to));
        }
        Ok(from)
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub(crate) fn emergency_signal(&self) -> watch::Receiver<u64> {
        self.emergency.subscribe()
    }

    /// Number of emergency stops so far
    fn emergency_epoch(&self) -> u64 {
        *self.emergency.borrow()
    }

    /// Set the state only if `generation` still owns the cell
    pub(crate) async fn set_state_if_current(&self, generation: u64, to: CellState) -> bool {
        let from = {
            let mut state = self.state.lock().await;
            if !self.is_current(generation) {
                return false;
            }
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            info!("Cell state {} -> {}", from, to);
            let _ = self.events.send(CellEvent::state_changed(from, to));
        }
        true
    }

    /// Release the monitor slot held by `generation`
    pub(crate) fn release_monitor(&self, generation: u64) {
        if self.is_current(generation) {
            self.batch_active.store(false, Ordering::SeqCst);
            self.monitor_active.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) async fn operator_name(&self) -> String {
        self.operator
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub(crate) fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Info => info!("{}", message),
            NoticeLevel::Warning => warn!("{}", message),
            NoticeLevel::Error => error!("{}", message),
        }
        let _ = self.events.send(CellEvent::notice(level, message));
    }

    pub(crate) fn publish(&self, event: CellEvent) {
        let _ = self.events.send(event);
    }

    /// Best-effort output write; failures become notices
    pub(crate) async fn set_output_logged(&self, index: u8, level: bool) -> bool {
        let Some(client) = self.live_client().await else {
            self.notify(
                NoticeLevel::Warning,
                format!("Output {} not set to {}: robot not connected", index, level),
            );
            return false;
        };
        match client.set_digital_output(index, level).await {
            Ok(()) => true,
            Err(e) => {
                self.notify(NoticeLevel::Error, format!("Output {} not set to {}: {}", index, level, e));
                false
            }
        }
    }

    async fn set_stop_output(&self, client: &RobotClient, level: bool) -> Result<()> {
        client.set_digital_output(self.config.outputs.stop, level).await?;
        if let Some(mirror) = self.config.outputs.stop_mirror {
            client.set_digital_output(mirror, level).await?;
        }
        Ok(())
    }

    pub(crate) async fn record(&self, outcome: RunOutcome) {
        match self.store.record_run(&outcome).await {
            Ok(()) => self.publish(CellEvent::run_recorded(outcome)),
            Err(e) => self.notify(NoticeLevel::Error, format!("Failed to save run: {}", e)),
        }
    }
}

/// Manual and batch run control for one robot
#[derive(Clone)]
pub struct CellOrchestrator {
    shared: Arc<CellShared>,
    monitor_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CellOrchestrator {
    pub fn new(config: Config, store: Arc<dyn RunStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (emergency, _) = watch::channel(0u64);
        let operator = config.operators.default_operator.clone();
        Self {
            shared: Arc::new(CellShared {
                config,
                store,
                client: RwLock::new(None),
                state: Mutex::new(CellState::Idle),
                batch_active: AtomicBool::new(false),
                monitor_active: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                target: AtomicU32::new(0),
                conveyor_on: AtomicBool::new(false),
                operator: Mutex::new(operator),
                emergency,
                events,
            }),
            monitor_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CellEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub async fn state(&self) -> CellState {
        self.shared.state().await
    }

    pub async fn set_operator(&self, operator: Option<String>) {
        let operator = operator.map(|o| o.trim().to_string()).filter(|o| !o.is_empty());
        *self.shared.operator.lock().await = operator;
    }

    pub async fn operator(&self) -> Option<String> {
        self.shared.operator.lock().await.clone()
    }

    pub async fn snapshot(&self) -> CellSnapshot {
        CellSnapshot {
            state: self.shared.state().await,
            connected: self.shared.live_client().await.is_some(),
            conveyor_on: self.shared.conveyor_on.load(Ordering::SeqCst),
            batch_active: self.shared.batch_active.load(Ordering::SeqCst),
            monitor_active: self.shared.monitor_active.load(Ordering::SeqCst),
            target_cycles: self.shared.target.load(Ordering::SeqCst),
            operator: self.operator().await,
        }
    }

    fn reject(&self, err: CellError) -> CellError {
        self.shared.notify(NoticeLevel::Warning, err.to_string());
        err
    }

    async fn require_link(&self) -> Result<Arc<RobotClient>> {
        self.shared
            .live_client()
            .await
            .ok_or_else(|| CellError::InvalidState("Robot not connected".to_string()))
    }

    /// Open both channels and force the stop and conveyor outputs off
    pub async fn connect(&self, address: &str) -> Result<()> {
        let address = address.trim();
        if address.is_empty() {
            return Err(self.reject(CellError::Validation("IP address missing".to_string())));
        }

        let previous = self
            .shared
            .claim(|s| matches!(s, CellState::Idle | CellState::Ready), CellState::Connecting)
            .await
            .map_err(|s| self.reject(CellError::InvalidState(format!("Cannot connect while {}", s))))?;

        let config = &self.shared.config;
        let connected = RobotClient::connect(
            address,
            config.robot.ports.dashboard,
            config.robot.ports.script,
            config.robot.connect_timeout(),
        )
        .await;

        let client = match connected {
            Ok(client) => Arc::new(client.with_command_timeout(config.robot.command_timeout())),
            Err(e) => {
                self.shared.set_state(previous).await;
                self.shared.notify(NoticeLevel::Error, format!("Connect error: {}", e));
                return Err(e);
            }
        };

        let safe_outputs = async {
            self.shared.set_stop_output(&client, false).await?;
            client.set_digital_output(config.outputs.conveyor, false).await
        }
        .await;
        if let Err(e) = safe_outputs {
            client.disconnect().await;
            self.shared.set_state(previous).await;
            self.shared.notify(NoticeLevel::Error, format!("Connect error: {}", e));
            return Err(e);
        }

        if let Some(old) = self.shared.client.write().await.replace(client) {
            old.disconnect().await;
        }
        self.shared.conveyor_on.store(false, Ordering::SeqCst);
        self.shared.set_state(CellState::Ready).await;
        self.shared.notify(
            NoticeLevel::Info,
            format!(
                "Connected to {}. Dashboard={}, Script={}.",
                address, config.robot.ports.dashboard, config.robot.ports.script
            ),
        );
        Ok(())
    }

    /// Run the program without a cycle limit until stopped
    pub async fn start_manual(&self) -> Result<()> {
        let request = RunRequest::manual();
        let epoch = self.shared.emergency_epoch();
        if self.shared.monitor_active.load(Ordering::SeqCst) {
            return Err(self.reject(CellError::InvalidState(
                "A batch is still being monitored".to_string(),
            )));
        }
        self.shared
            .claim(|s| s == CellState::Ready, CellState::Running(RunMode::Manual))
            .await
            .map_err(|s| self.reject(CellError::InvalidState(format!("Cannot start while {}", s))))?;

        if let Err(e) = self.launch(request, epoch).await {
            self.restore_ready(RunMode::Manual).await;
            self.shared.notify(NoticeLevel::Error, format!("Start error: {}", e));
            return Err(e);
        }

        self.shared.batch_active.store(false, Ordering::SeqCst);
        self.shared.target.store(request.target, Ordering::SeqCst);
        self.shared.conveyor_on.store(true, Ordering::SeqCst);
        self.shared.notify(NoticeLevel::Info, "Running manual...");
        Ok(())
    }

    /// Run `cycles` cycles, then the safety dwell, then record the run
    pub async fn start_batch(&self, cycles: i64) -> Result<()> {
        let request = RunRequest::batch(cycles).map_err(|e| self.reject(e))?;
        let epoch = self.shared.emergency_epoch();

        if self
            .shared
            .monitor_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(self.reject(CellError::InvalidState(
                "A batch is already in progress".to_string(),
            )));
        }

        if let Err(s) = self
            .shared
            .claim(|s| s == CellState::Ready, CellState::Running(RunMode::Batch))
            .await
        {
            self.shared.monitor_active.store(false, Ordering::SeqCst);
            return Err(self.reject(CellError::InvalidState(format!("Cannot start batch while {}", s))));
        }

        if let Err(e) = self.launch(request, epoch).await {
            self.shared.monitor_active.store(false, Ordering::SeqCst);
            self.restore_ready(RunMode::Batch).await;
            self.shared.notify(NoticeLevel::Error, format!("RunBatch error: {}", e));
            return Err(e);
        }

        if self.shared.state().await != CellState::Running(RunMode::Batch) {
            // emergency stop or disconnect landed while the program was uploading
            self.shared.monitor_active.store(false, Ordering::SeqCst);
            return Err(self.reject(CellError::InvalidState(
                "Batch start interrupted".to_string(),
            )));
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.target.store(request.target, Ordering::SeqCst);
        self.shared.batch_active.store(true, Ordering::SeqCst);
        if self.shared.emergency_epoch() != epoch {
            self.shared.batch_active.store(false, Ordering::SeqCst);
            self.shared.monitor_active.store(false, Ordering::SeqCst);
            return Err(self.reject(CellError::InvalidState(
                "Batch start interrupted".to_string(),
            )));
        }
        self.shared.conveyor_on.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(monitor::run_batch_monitor(
            Arc::clone(&self.shared),
            generation,
            request.target,
        ));
        if let Some(previous) = self.monitor_task.lock().await.replace(handle) {
            if !previous.is_finished() {
                warn!("Replacing handle of a monitor that has not exited yet");
            }
        }

        self.shared.notify(
            NoticeLevel::Info,
            format!("Started batch for {} cycles.", request.target),
        );
        Ok(())
    }

    /// Back to `Ready` unless something else already moved the cell on
    async fn restore_ready(&self, mode: RunMode) {
        let _ = self
            .shared
            .claim(|s| s == CellState::Running(mode), CellState::Ready)
            .await;
    }

    /// Clear the stop output and upload the program for `request`.
    /// Aborts, leaving the stop output asserted, if an emergency stop lands
    /// after `epoch` was read.
    async fn launch(&self, request: RunRequest, epoch: u64) -> Result<()> {
        let client = self.require_link().await?;
        let template = ProgramTemplate::load(&self.shared.config.program)?;

        self.shared.set_stop_output(&client, false).await?;
        if self.shared.emergency_epoch() != epoch {
            self.reassert_stop(&client, false).await;
            return Err(CellError::InvalidState(
                "Start aborted by emergency stop".to_string(),
            ));
        }

        client.upload_program(&template.render(request.target)).await?;
        if self.shared.emergency_epoch() != epoch {
            self.reassert_stop(&client, true).await;
            return Err(CellError::InvalidState(
                "Start aborted by emergency stop".to_string(),
            ));
        }

        self.shared.notify(
            NoticeLevel::Info,
            format!("{} sent (max_cycles={}).", template.path().display(), request.target),
        );
        Ok(())
    }

    /// Undo a launch that raced an emergency stop
    async fn reassert_stop(&self, client: &RobotClient, uploaded: bool) {
        if let Err(e) = self.shared.set_stop_output(client, true).await {
            self.shared.notify(NoticeLevel::Error, format!("Emergency error: {}", e));
        }
        if uploaded {
            client.emergency_stop().await;
        }
    }

    /// Ask the program to halt after the current cycle
    pub async fn stop(&self) -> Result<()> {
        let state = self.shared.state().await;
        let CellState::Running(mode) = state else {
            return Err(self.reject(CellError::InvalidState(format!("Nothing to stop while {}", state))));
        };

        self.shared.batch_active.store(false, Ordering::SeqCst);

        if let Some(client) = self.shared.live_client().await {
            if let Err(e) = self.shared.set_stop_output(&client, true).await {
                self.shared.notify(NoticeLevel::Error, format!("Stop error: {}", e));
            }
        }

        match mode {
            RunMode::Manual => {
                self.shared.set_state(CellState::Ready).await;
                self.shared.notify(NoticeLevel::Info, "Stopping... robot will halt");
            }
            RunMode::Batch if self.shared.monitor_active.load(Ordering::SeqCst) => {
                self.shared.notify(
                    NoticeLevel::Info,
                    "Stopping... waiting for the robot to halt",
                );
            }
            RunMode::Batch => self.shared.set_state(CellState::Ready).await,
        }
        Ok(())
    }

    /// Cut everything: conveyor off, stop output on, dashboard hard stop.
    ///
    /// Never fails and never waits on an unresponsive robot; network errors
    /// are reported as notices. The stop is recorded when the link was live
    /// or an operator is set. The cell settles in `Ready` when the link is
    /// still up afterwards and in `Idle` otherwise.
    pub async fn emergency_stop(&self) {
        let pressed_at = Utc::now();

        // order matters: state, then epoch, then generation. A start that
        // misses the epoch bump is guaranteed a superseded generation.
        self.shared.set_state(CellState::EmergencyStopped).await;
        self.shared.emergency.send_modify(|count| *count += 1);
        self.shared.batch_active.store(false, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.monitor_active.store(false, Ordering::SeqCst);

        let client = self.shared.client().await;
        let was_live = client.as_ref().is_some_and(|c| c.is_connected());
        if let Some(client) = &client {
            // each exchange inside is already bounded by the client
            let budget = client.command_timeout() * 4;
            let cut = async {
                if let Err(e) = client
                    .set_digital_output(self.shared.config.outputs.conveyor, false)
                    .await
                {
                    self.shared.notify(NoticeLevel::Error, format!("Emergency error: {}", e));
                }
                if let Err(e) = self.shared.set_stop_output(client, true).await {
                    self.shared.notify(NoticeLevel::Error, format!("Emergency error: {}", e));
                }
                client.emergency_stop().await;
            };
            if timeout(budget, cut).await.is_err() {
                self.shared.notify(
                    NoticeLevel::Error,
                    "Emergency error: robot did not acknowledge in time",
                );
            }
        }
        self.shared.conveyor_on.store(false, Ordering::SeqCst);

        let identified = self.operator().await;
        let who = self.shared.operator_name().await;
        self.shared
            .notify(NoticeLevel::Error, format!("EMERGENCY STOP pressed by {}", who));

        if was_live || identified.is_some() {
            self.shared.record(RunOutcome::emergency(&who, pressed_at)).await;
        } else {
            self.shared.notify(
                NoticeLevel::Warning,
                "Emergency stop logged locally only (no connection or operator)",
            );
        }

        let settled = if self.shared.live_client().await.is_some() {
            CellState::Ready
        } else {
            CellState::Idle
        };
        self.shared.set_state(settled).await;
    }

    /// Flip the conveyor output
    pub async fn toggle_conveyor(&self) -> Result<bool> {
        let client = self.require_link().await.map_err(|e| {
            self.reject(CellError::InvalidState(format!("Conveyor pressed, but {}", e)))
        })?;

        let next = !self.shared.conveyor_on.load(Ordering::SeqCst);
        if let Err(e) = client
            .set_digital_output(self.shared.config.outputs.conveyor, next)
            .await
        {
            self.shared.notify(NoticeLevel::Error, format!("Conveyor error: {}", e));
            return Err(e);
        }
        self.shared.conveyor_on.store(next, Ordering::SeqCst);
        self.shared.notify(
            NoticeLevel::Info,
            format!("Conveyor {}", if next { "running" } else { "stopped" }),
        );
        Ok(next)
    }

    /// Drop the link; any monitor still running is superseded
    pub async fn disconnect(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.batch_active.store(false, Ordering::SeqCst);
        self.shared.monitor_active.store(false, Ordering::SeqCst);
        if let Some(client) = self.shared.client.write().await.take() {
            client.disconnect().await;
            self.shared.notify(NoticeLevel::Info, format!("Disconnected from {}", client.host()));
        }
        self.shared.conveyor_on.store(false, Ordering::SeqCst);
        self.shared.set_state(CellState::Idle).await;
    }

    /// Wait for the current monitor task, if any, to exit
    pub async fn join_monitor(&self) -> Result<()> {
        let handle = self.monitor_task.lock().await.take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    fn orchestrator() -> CellOrchestrator {
        CellOrchestrator::new(Config::default(), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_batch_validation_leaves_state_unchanged() {
        let cell = orchestrator();
        for n in [0, -1, -100] {
            let result = cell.start_batch(n).await;
            assert!(matches!(result, Err(CellError::Validation(_))));
            assert_eq!(cell.state().await, CellState::Idle);
            assert!(!cell.snapshot().await.monitor_active);
        }
    }

    #[tokio::test]
    async fn test_start_requires_ready() {
        let cell = orchestrator();
        assert!(matches!(cell.start_manual().await, Err(CellError::InvalidState(_))));
        assert!(matches!(cell.start_batch(2).await, Err(CellError::InvalidState(_))));
        assert!(!cell.snapshot().await.monitor_active);
        assert!(matches!(cell.stop().await, Err(CellError::InvalidState(_))));
        assert!(matches!(cell.toggle_conveyor().await, Err(CellError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_address() {
        let cell = orchestrator();
        assert!(matches!(cell.connect("   ").await, Err(CellError::Validation(_))));
        assert_eq!(cell.state().await, CellState::Idle);
    }

    #[tokio::test]
    async fn test_emergency_without_connection_only_logs() {
        let store = Arc::new(MemoryStore::new());
        let cell = CellOrchestrator::new(Config::default(), store.clone());
        let mut events = cell.subscribe();

        cell.emergency_stop().await;

        assert_eq!(cell.state().await, CellState::Idle);
        assert!(store.latest_runs(10).await.unwrap().is_empty());

        let mut messages = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CellEvent::Notice { message, .. } = event {
                messages.push(message);
            }
        }
        assert!(messages.iter().any(|m| m.contains("EMERGENCY STOP")));
    }

    #[tokio::test]
    async fn test_emergency_with_operator_is_recorded_offline() {
        let store = Arc::new(MemoryStore::new());
        let cell = CellOrchestrator::new(Config::default(), store.clone());
        cell.set_operator(Some("alice".to_string())).await;

        cell.emergency_stop().await;

        let rows = store.latest_runs(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].items_counted, -1);
        assert!(rows[0].meta.contains("user=alice"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CellState::Running(RunMode::Manual).to_string(), "running(manual)");
        assert_eq!(CellState::SafetyDwell.to_string(), "safety_dwell");
    }
}
