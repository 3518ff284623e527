//! Observational port: human-readable protocol milestones for a host UI.
//! Purely informational; never feeds back into protocol state.

/// Receives one message per handshake milestone or failure.
pub trait StepObserver {
    fn on_protocol_step(&mut self, message: &str);
}

/// Observer that discards every milestone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl StepObserver for NullObserver {
    fn on_protocol_step(&mut self, _message: &str) {}
}
