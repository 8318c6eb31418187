//! Actuator sink: motors and corner pushers
//!
//! Controllers issue commands and trust they were attempted; physical outcome
//! is confirmed by sensor events, never by acknowledgements. A failed command
//! is reported to the caller, who logs it and moves on.

use crate::domain::types::MotorId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActuatorError {
    #[error("motor {0} not connected")]
    NotConnected(MotorId),
    #[error("speed {speed} out of range for motor {motor}")]
    SpeedOutOfRange { motor: MotorId, speed: f64 },
    #[error("driver fault on motor {motor}: {reason}")]
    Driver { motor: MotorId, reason: String },
}

/// Commands the core issues to hardware
pub trait ActuatorSink: Send + Sync {
    /// Signed speed in [-1.0, 1.0]
    fn set_speed(&self, motor: MotorId, speed: f64) -> Result<(), ActuatorError>;
    fn stop(&self, motor: MotorId) -> Result<(), ActuatorError>;
    /// Fail-safe stop of every motor
    fn stop_all(&self) -> Result<(), ActuatorError>;
    /// Drive a corner pusher out at `speed`
    fn extend(&self, pusher: MotorId, speed: f64) -> Result<(), ActuatorError>;
    /// Drive a corner pusher back at `speed`
    fn retract(&self, pusher: MotorId, speed: f64) -> Result<(), ActuatorError>;
}

/// A recorded command
#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorCommand {
    SetSpeed(MotorId, f64),
    Stop(MotorId),
    StopAll,
    Extend(MotorId),
    Retract(MotorId),
}

/// In-memory actuator sink used in simulation mode and tests
///
/// Records every command, including those it was told to fail.
#[derive(Debug, Default)]
pub struct SimulatedActuators {
    commands: Mutex<Vec<ActuatorCommand>>,
    failing: AtomicBool,
}

impl SimulatedActuators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent command fail with a driver fault
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn commands(&self) -> Vec<ActuatorCommand> {
        self.commands.lock().clone()
    }

    /// Return and clear the recorded commands
    pub fn take_commands(&self) -> Vec<ActuatorCommand> {
        std::mem::take(&mut *self.commands.lock())
    }

    fn record(&self, motor: MotorId, cmd: ActuatorCommand) -> Result<(), ActuatorError> {
        debug!(command = ?cmd, "actuator_command");
        self.commands.lock().push(cmd);
        if self.failing.load(Ordering::Relaxed) {
            return Err(ActuatorError::Driver { motor, reason: "simulated fault".to_string() });
        }
        Ok(())
    }
}

fn check_speed(motor: MotorId, speed: f64) -> Result<(), ActuatorError> {
    if !(-1.0..=1.0).contains(&speed) {
        return Err(ActuatorError::SpeedOutOfRange { motor, speed });
    }
    Ok(())
}

impl ActuatorSink for SimulatedActuators {
    fn set_speed(&self, motor: MotorId, speed: f64) -> Result<(), ActuatorError> {
        check_speed(motor, speed)?;
        self.record(motor, ActuatorCommand::SetSpeed(motor, speed))
    }

    fn stop(&self, motor: MotorId) -> Result<(), ActuatorError> {
        self.record(motor, ActuatorCommand::Stop(motor))
    }

    fn stop_all(&self) -> Result<(), ActuatorError> {
        self.record(MotorId(0), ActuatorCommand::StopAll)
    }

    fn extend(&self, pusher: MotorId, speed: f64) -> Result<(), ActuatorError> {
        check_speed(pusher, speed)?;
        self.record(pusher, ActuatorCommand::Extend(pusher))
    }

    fn retract(&self, pusher: MotorId, speed: f64) -> Result<(), ActuatorError> {
        check_speed(pusher, speed)?;
        self.record(pusher, ActuatorCommand::Retract(pusher))
    }
}
