//! Process lifecycle state machine.

/// Represents the lifecycle state of a spawned command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    /// Handle has been created but the spawn is not yet confirmed.
    #[default]
    Created,
    /// The underlying process is alive.
    Running,
    /// The process exited on its own.
    Finished,
    /// The process was terminated on caller request.
    Killed,
}

impl ProcessState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Created -> Running
    /// - Running -> Finished
    /// - Running -> Killed
    pub fn can_transition_to(&self, target: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (*self, target),
            (Created, Running) | (Running, Finished) | (Running, Killed)
        )
    }

    /// Attempt to transition to a new state.
    ///
    /// Returns `Ok(())` if the transition is valid, or an error otherwise.
    pub fn transition_to(&mut self, target: ProcessState) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::ExecError::InvalidStateTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// Check if this is a terminal state. Terminal states are final;
    /// a process exit code is defined if and only if the state is
    /// terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Finished | ProcessState::Killed)
    }
}
