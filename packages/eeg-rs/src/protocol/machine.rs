// Recording stage machine - drives the timed four-stage protocol
//
// Idle -> Stage1 -> Stage2 -> Stage3 -> Stage4 -> ShuttingDown -> Idle
//
// Every transition is decided under one mutex and produces a list of effects
// (backend commands, events, output calls, buffer reset). Effects run after
// the lock is released so callbacks may call back into the machine. Timer
// callbacks hold a weak reference plus the generation they were armed in;
// any transition bumps the generation, so a late timer is ignored.

use super::stage::{MachineSettings, Stage};
use crate::bridge::BackendBridge;
use crate::error::{EegError, EegResult};
use crate::message::{ControlAction, ControlCommand, EvaluationResult};
use crate::output::StageOutput;
use crate::scheduler::{Scheduler, TimerHandle};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Externally visible machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MachineState {
    Idle,
    Active { stage: Stage },
    ShuttingDown,
}

impl Default for MachineState {
    fn default() -> Self {
        Self::Idle
    }
}

/// The one recording in progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub session_id: String,
    pub diagnosis_id: i64,
    pub current_stage: Stage,
    pub started_at: DateTime<Utc>,
    pub stage_started_at: DateTime<Utc>,
}

/// Events emitted by the stage machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    Started {
        session: RecordingSession,
    },
    StageChanged {
        session_id: String,
        from: Stage,
        to: Stage,
    },
    EvaluationRequested {
        diagnosis_id: i64,
        stage: Stage,
        automatic: bool,
    },
    EvaluationReceived {
        result: EvaluationResult,
    },
    ShuttingDown {
        session_id: String,
        stage: Stage,
    },
    Idle,
    Warning {
        message: String,
    },
}

type EventCallback = Arc<dyn Fn(SessionEvent) + Send + Sync>;
type ResetHook = Box<dyn Fn() + Send + Sync>;
type IntakeHook = Box<dyn Fn(bool) + Send + Sync>;

enum Phase {
    Idle,
    Active(RecordingSession),
    ShuttingDown(RecordingSession),
}

enum Effect {
    Notify(ControlCommand),
    Emit(SessionEvent),
    BeginOutput(Stage),
    StopOutput,
    ResetBuffers,
    Intake(bool),
}

struct Inner {
    phase: Phase,
    generation: u64,
    stage_timer: Option<TimerHandle>,
    grace_timer: Option<TimerHandle>,
    stage_entered: Option<Instant>,
    auto_evaluated: bool,
    last_error: Option<String>,
    last_evaluation: Option<EvaluationResult>,
}

struct Shared {
    settings: MachineSettings,
    scheduler: Arc<dyn Scheduler>,
    bridge: Arc<dyn BackendBridge>,
    output: Arc<dyn StageOutput>,
    inner: Mutex<Inner>,
    event_callback: RwLock<Option<EventCallback>>,
    reset_hook: RwLock<Option<ResetHook>>,
    intake_hook: RwLock<Option<IntakeHook>>,
}

/// Cloneable handle to the stage machine
#[derive(Clone)]
pub struct RecordingStageMachine {
    shared: Arc<Shared>,
}

impl RecordingStageMachine {
    pub fn new(
        settings: MachineSettings,
        scheduler: Arc<dyn Scheduler>,
        bridge: Arc<dyn BackendBridge>,
        output: Arc<dyn StageOutput>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                scheduler,
                bridge,
                output,
                inner: Mutex::new(Inner {
                    phase: Phase::Idle,
                    generation: 0,
                    stage_timer: None,
                    grace_timer: None,
                    stage_entered: None,
                    auto_evaluated: false,
                    last_error: None,
                    last_evaluation: None,
                }),
                event_callback: RwLock::new(None),
                reset_hook: RwLock::new(None),
                intake_hook: RwLock::new(None),
            }),
        }
    }

    /// Set event callback for session notifications
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        *self.shared.event_callback.write() = Some(Arc::new(callback));
    }

    /// Hook run on `start` to clear buffers before the new recording
    pub fn set_reset_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.reset_hook.write() = Some(Box::new(hook));
    }

    /// Hook told to close intake on shutdown and reopen it once idle
    pub fn set_intake_hook<F>(&self, hook: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        *self.shared.intake_hook.write() = Some(Box::new(hook));
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.shared.settings
    }

    /// Begin a recording at `stage`
    ///
    /// Only allowed from Idle. Resets buffers, notifies the backend, starts
    /// the stage output and arms the stage timer.
    pub fn start(&self, diagnosis_id: i64, stage: Stage) -> EegResult<()> {
        let shared = &self.shared;
        let result = {
            let mut inner = shared.inner.lock();
            let rejection = match &inner.phase {
                Phase::Active(session) => Some(format!(
                    "recording already active at stage {}",
                    session.current_stage
                )),
                Phase::ShuttingDown(_) => Some("cannot start while shutting down".to_string()),
                Phase::Idle => None,
            };
            match rejection {
                Some(reason) => Err(EegError::InvalidStageTransition(reason)),
                None => Ok(shared.start_locked(&mut inner, diagnosis_id, stage)),
            }
        };
        shared.finish(result)
    }

    /// Stop the active recording; a no-op when idle or already stopping
    pub fn stop(&self) {
        let shared = &self.shared;
        let effects = {
            let mut inner = shared.inner.lock();
            if matches!(inner.phase, Phase::Active(_)) {
                shared.shutdown_locked(&mut inner)
            } else {
                log::debug!("Stop requested with no active recording");
                Vec::new()
            }
        };
        shared.dispatch(effects);
    }

    /// Progress to the next stage, or into shutdown after the final stage
    pub fn advance(&self) -> EegResult<()> {
        let shared = &self.shared;
        let result = {
            let mut inner = shared.inner.lock();
            shared.advance_locked(&mut inner)
        };
        shared.finish(result)
    }

    /// Explicit stage set; only the immediately following stage is accepted
    pub fn set_stage(&self, stage: Stage) -> EegResult<()> {
        let shared = &self.shared;
        let result = {
            let mut inner = shared.inner.lock();
            let rejection = match &inner.phase {
                Phase::Active(session) if session.current_stage.next() == Some(stage) => None,
                Phase::Active(session) => Some(format!(
                    "cannot move from stage {} to stage {}",
                    session.current_stage, stage
                )),
                _ => Some(format!(
                    "cannot set stage {} without an active recording",
                    stage
                )),
            };
            match rejection {
                Some(reason) => Err(EegError::InvalidStageTransition(reason)),
                None => Ok(shared.enter_stage_locked(&mut inner, stage)),
            }
        };
        shared.finish(result)
    }

    /// On-demand evaluation request, independent of the automatic one
    pub fn evaluate(&self, diagnosis_id: i64, stage: Stage) -> EegResult<()> {
        let shared = &self.shared;
        let command = ControlCommand::new(
            &shared.settings.sensor_id,
            ControlAction::Evaluate,
            diagnosis_id,
            stage.number(),
        );

        if let Err(e) = shared.bridge.send(command) {
            let error = EegError::BackendUnavailable(e.to_string());
            shared.warn(&error);
            return Err(error);
        }

        log::info!(
            "Requested evaluation for diagnosis {} stage {}",
            diagnosis_id,
            stage
        );
        shared.emit_event(SessionEvent::EvaluationRequested {
            diagnosis_id,
            stage,
            automatic: false,
        });
        Ok(())
    }

    /// Ingestion gate
    ///
    /// Returns false while shutting down, after re-sending the stop command
    /// in case the backend missed the first one.
    pub fn accept_inbound(&self) -> bool {
        let shared = &self.shared;
        let command = {
            let inner = shared.inner.lock();
            match &inner.phase {
                Phase::ShuttingDown(session) => Some(ControlCommand::new(
                    &shared.settings.sensor_id,
                    ControlAction::Stop,
                    session.diagnosis_id,
                    session.current_stage.number(),
                )),
                _ => None,
            }
        };

        match command {
            Some(command) => {
                log::debug!("Inbound data during shutdown, repeating stop");
                shared.dispatch(vec![Effect::Notify(command)]);
                false
            }
            None => true,
        }
    }

    /// Record an evaluation result returned by the backend
    pub fn deliver_evaluation(&self, result: EvaluationResult) {
        let shared = &self.shared;
        {
            let mut inner = shared.inner.lock();
            let known = match &inner.phase {
                Phase::Active(session) | Phase::ShuttingDown(session) => {
                    session.diagnosis_id == result.diagnosis_id
                }
                Phase::Idle => false,
            };
            if !known {
                log::debug!(
                    "Evaluation result for diagnosis {} outside the current recording",
                    result.diagnosis_id
                );
            }
            inner.last_evaluation = Some(result.clone());
        }

        log::info!(
            "Evaluation result for diagnosis {} stage {}: {} ({:.2})",
            result.diagnosis_id,
            result.diagnosis_stage,
            result.prediction.label,
            result.prediction.probability
        );
        shared.emit_event(SessionEvent::EvaluationReceived { result });
    }

    pub fn state(&self) -> MachineState {
        match &self.shared.inner.lock().phase {
            Phase::Idle => MachineState::Idle,
            Phase::Active(session) => MachineState::Active {
                stage: session.current_stage,
            },
            Phase::ShuttingDown(_) => MachineState::ShuttingDown,
        }
    }

    /// Active recording, if any
    pub fn session(&self) -> Option<RecordingSession> {
        match &self.shared.inner.lock().phase {
            Phase::Active(session) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn current_stage(&self) -> Option<Stage> {
        match self.state() {
            MachineState::Active { stage } => Some(stage),
            _ => None,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(self.shared.inner.lock().phase, Phase::ShuttingDown(_))
    }

    /// Time spent in the current stage on the scheduler's clock
    pub fn stage_elapsed(&self) -> Option<Duration> {
        let entered = self.shared.inner.lock().stage_entered?;
        Some(self.shared.scheduler.now().saturating_duration_since(entered))
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.inner.lock().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.shared.inner.lock().last_error = None;
    }

    pub fn last_evaluation(&self) -> Option<EvaluationResult> {
        self.shared.inner.lock().last_evaluation.clone()
    }
}

impl Shared {
    fn command(&self, action: ControlAction, session: &RecordingSession) -> Effect {
        Effect::Notify(ControlCommand::new(
            &self.settings.sensor_id,
            action,
            session.diagnosis_id,
            session.current_stage.number(),
        ))
    }

    fn start_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        diagnosis_id: i64,
        stage: Stage,
    ) -> Vec<Effect> {
        self.cancel_timers(inner);
        inner.generation += 1;
        inner.auto_evaluated = false;

        let now = Utc::now();
        let session = RecordingSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            diagnosis_id,
            current_stage: stage,
            started_at: now,
            stage_started_at: now,
        };

        log::info!(
            "Starting recording {} for diagnosis {} at stage {}",
            session.session_id,
            diagnosis_id,
            stage
        );

        let effects = vec![
            Effect::ResetBuffers,
            self.command(ControlAction::Start, &session),
            Effect::Emit(SessionEvent::Started {
                session: session.clone(),
            }),
            Effect::BeginOutput(stage),
        ];

        inner.phase = Phase::Active(session);
        self.arm_stage_timer(inner, stage);
        effects
    }

    fn advance_locked(self: &Arc<Self>, inner: &mut Inner) -> EegResult<Vec<Effect>> {
        let current = match &inner.phase {
            Phase::Active(session) => session.current_stage,
            _ => {
                return Err(EegError::InvalidStageTransition(
                    "no active recording to advance".to_string(),
                ))
            }
        };

        Ok(match current.next() {
            Some(next) => self.enter_stage_locked(inner, next),
            None => {
                log::info!("Final stage complete");
                self.shutdown_locked(inner)
            }
        })
    }

    /// Move an active recording to `next`; callers have checked it follows
    /// the current stage
    fn enter_stage_locked(self: &Arc<Self>, inner: &mut Inner, next: Stage) -> Vec<Effect> {
        let mut effects = Vec::new();
        let auto_evaluate = !inner.auto_evaluated && next == Stage::Four;

        let (session_id, from, stage_command) = match &mut inner.phase {
            Phase::Active(session) => {
                let from = session.current_stage;
                if auto_evaluate && from == Stage::Three {
                    effects.push(self.command(ControlAction::Evaluate, session));
                    effects.push(Effect::Emit(SessionEvent::EvaluationRequested {
                        diagnosis_id: session.diagnosis_id,
                        stage: from,
                        automatic: true,
                    }));
                }

                session.current_stage = next;
                session.stage_started_at = Utc::now();
                (
                    session.session_id.clone(),
                    from,
                    self.command(ControlAction::Stage, session),
                )
            }
            _ => return effects,
        };

        if auto_evaluate && from == Stage::Three {
            inner.auto_evaluated = true;
        }
        inner.generation += 1;

        log::info!("Recording {} moved from stage {} to stage {}", session_id, from, next);

        effects.push(stage_command);
        effects.push(Effect::Emit(SessionEvent::StageChanged {
            session_id,
            from,
            to: next,
        }));
        effects.push(Effect::BeginOutput(next));

        self.arm_stage_timer(inner, next);
        effects
    }

    fn shutdown_locked(self: &Arc<Self>, inner: &mut Inner) -> Vec<Effect> {
        let session = match std::mem::replace(&mut inner.phase, Phase::Idle) {
            Phase::Active(session) => session,
            other => {
                inner.phase = other;
                return Vec::new();
            }
        };

        self.cancel_timers(inner);
        inner.generation += 1;
        inner.stage_entered = None;

        log::info!(
            "Stopping recording {} at stage {}",
            session.session_id,
            session.current_stage
        );

        let effects = vec![
            Effect::Intake(false),
            self.command(ControlAction::Stop, &session),
            Effect::Emit(SessionEvent::ShuttingDown {
                session_id: session.session_id.clone(),
                stage: session.current_stage,
            }),
            Effect::StopOutput,
        ];

        inner.phase = Phase::ShuttingDown(session);

        let weak = Arc::downgrade(self);
        let generation = inner.generation;
        inner.grace_timer = Some(self.scheduler.schedule_once(
            self.settings.shutdown_grace,
            Box::new(move || Shared::on_grace_elapsed(&weak, generation)),
        ));

        effects
    }

    /// Replace any outstanding stage timer with one for `stage`
    fn arm_stage_timer(self: &Arc<Self>, inner: &mut Inner, stage: Stage) {
        if let Some(handle) = inner.stage_timer.take() {
            self.scheduler.cancel(handle);
        }
        inner.stage_entered = Some(self.scheduler.now());

        let Some(delay) = self.settings.durations.get(stage) else {
            log::debug!("Stage {} has no timer, waiting for an explicit advance", stage);
            return;
        };

        let weak = Arc::downgrade(self);
        let generation = inner.generation;
        inner.stage_timer = Some(self.scheduler.schedule_once(
            delay,
            Box::new(move || Shared::on_stage_timer(&weak, generation)),
        ));
    }

    fn cancel_timers(&self, inner: &mut Inner) {
        for handle in [inner.stage_timer.take(), inner.grace_timer.take()]
            .into_iter()
            .flatten()
        {
            self.scheduler.cancel(handle);
        }
    }

    fn on_stage_timer(weak: &Weak<Shared>, generation: u64) {
        let Some(shared) = weak.upgrade() else {
            return;
        };

        let result = {
            let mut inner = shared.inner.lock();
            if inner.generation != generation || !matches!(inner.phase, Phase::Active(_)) {
                log::debug!("Ignoring stale stage timer");
                return;
            }
            inner.stage_timer = None;
            shared.advance_locked(&mut inner)
        };

        // Timer callbacks have nobody to return to
        let _ = shared.finish(result);
    }

    fn on_grace_elapsed(weak: &Weak<Shared>, generation: u64) {
        let Some(shared) = weak.upgrade() else {
            return;
        };

        {
            let mut inner = shared.inner.lock();
            if inner.generation != generation || !matches!(inner.phase, Phase::ShuttingDown(_)) {
                return;
            }
            inner.grace_timer = None;
            inner.phase = Phase::Idle;
        }

        log::info!("Shutdown grace period elapsed, recorder idle");
        shared.dispatch(vec![Effect::Intake(true), Effect::Emit(SessionEvent::Idle)]);
    }

    /// Dispatch effects, or record and surface the rejection
    fn finish(&self, result: EegResult<Vec<Effect>>) -> EegResult<()> {
        match result {
            Ok(effects) => {
                self.dispatch(effects);
                Ok(())
            }
            Err(error) => {
                self.warn(&error);
                Err(error)
            }
        }
    }

    fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify(command) => {
                    let action = command.action;
                    if let Err(e) = self.bridge.send(command) {
                        self.warn(&EegError::BackendUnavailable(format!(
                            "'{}' notification not delivered: {}",
                            action, e
                        )));
                    }
                }
                Effect::Emit(event) => self.emit_event(event),
                Effect::BeginOutput(stage) => {
                    self.output.begin_stage(stage, self.settings.cue(stage))
                }
                Effect::StopOutput => self.output.stop(),
                Effect::ResetBuffers => {
                    if let Some(hook) = self.reset_hook.read().as_ref() {
                        hook();
                    }
                }
                Effect::Intake(open) => {
                    if let Some(hook) = self.intake_hook.read().as_ref() {
                        hook(open);
                    }
                }
            }
        }
    }

    fn warn(&self, error: &EegError) {
        log::warn!("{}", error);
        self.inner.lock().last_error = Some(error.to_string());
        self.emit_event(SessionEvent::Warning {
            message: error.to_string(),
        });
    }

    fn emit_event(&self, event: SessionEvent) {
        // Released before the call so callbacks may replace themselves
        let callback = self.event_callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}
