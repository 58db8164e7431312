// Fire-and-forget notification path to the acquisition backend
//
// The stage machine hands each `ControlCommand` to a `BackendBridge` and moves
// on. Delivery success is never awaited; results such as evaluations come back
// later on a separate path (`AcquisitionPipeline::on_evaluation_result`).

use crate::message::{ControlAction, ControlCommand};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    #[error("bridge unavailable: {0}")]
    Unavailable(String),

    #[error("bridge rejected command: {0}")]
    Rejected(String),
}

pub trait BackendBridge: Send + Sync {
    /// Queue a command for delivery without waiting for the backend
    fn send(&self, command: ControlCommand) -> Result<(), BridgeError>;

    fn is_available(&self) -> bool {
        true
    }
}

/// Bridge used when no backend is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct DisconnectedBridge;

impl BackendBridge for DisconnectedBridge {
    fn send(&self, command: ControlCommand) -> Result<(), BridgeError> {
        Err(BridgeError::Unavailable(format!(
            "no backend attached for '{}' command",
            command.action
        )))
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// Forwards commands to an async backend task over an unbounded channel
#[derive(Clone)]
pub struct ChannelBridge {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl ChannelBridge {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BackendBridge for ChannelBridge {
    fn send(&self, command: ControlCommand) -> Result<(), BridgeError> {
        self.tx
            .send(command)
            .map_err(|_| BridgeError::Unavailable("backend task has shut down".to_string()))
    }

    fn is_available(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Captures every command; can be switched offline to exercise failure paths
#[derive(Clone, Default)]
pub struct RecordingBridge {
    sent: Arc<Mutex<Vec<ControlCommand>>>,
    offline: Arc<Mutex<bool>>,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    pub fn commands(&self) -> Vec<ControlCommand> {
        self.sent.lock().clone()
    }

    pub fn actions(&self) -> Vec<ControlAction> {
        self.sent.lock().iter().map(|c| c.action).collect()
    }

    pub fn count(&self, action: ControlAction) -> usize {
        self.sent.lock().iter().filter(|c| c.action == action).count()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl BackendBridge for RecordingBridge {
    fn send(&self, command: ControlCommand) -> Result<(), BridgeError> {
        if *self.offline.lock() {
            return Err(BridgeError::Unavailable("recording bridge offline".to_string()));
        }
        self.sent.lock().push(command);
        Ok(())
    }

    fn is_available(&self) -> bool {
        !*self.offline.lock()
    }
}
