//! CiA 402 drive profile state machine.
//!
//! The drive reports its state in the status word (object `0x6041`); the
//! master commands transitions through the control word (object `0x6040`).
//! [`transition`] is a pure function from the observed state and the intended
//! action to the control word to write in the next cycle.

bitflags::bitflags! {
    /// CiA 402 control word, object `0x6040:00`.
    ///
    /// The `STATE_*` constants are the composite command patterns from the
    /// CiA 402 transition table.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ControlWord: u16 {
        /// Switch on.
        const SWITCH_ON = 1 << 0;
        /// Enable voltage.
        const ENABLE_VOLTAGE = 1 << 1;
        /// Quick stop, active low.
        const QUICK_STOP = 1 << 2;
        /// Enable operation.
        const ENABLE_OP = 1 << 3;
        /// Fault reset, rising edge triggered.
        const FAULT_RESET = 1 << 7;
        /// Halt.
        const HALT = 1 << 8;

        /// Transition 2/6/8: ready the drive for switch on.
        const STATE_SHUTDOWN = Self::ENABLE_VOLTAGE.bits() | Self::QUICK_STOP.bits();
        /// Transition 3: switch on, operation still disabled.
        const STATE_SWITCH_ON = Self::ENABLE_VOLTAGE.bits() | Self::QUICK_STOP.bits() | Self::SWITCH_ON.bits();
        /// Transition 7/9/10/12: remove power stage voltage.
        const STATE_DISABLE_VOLTAGE = 0;
        /// Transition 11: quick stop ramp.
        const STATE_QUICK_STOP = Self::ENABLE_VOLTAGE.bits();
        /// Transition 5: disable operation, keep the stage switched on.
        const STATE_DISABLE_OP = Self::ENABLE_VOLTAGE.bits() | Self::QUICK_STOP.bits() | Self::SWITCH_ON.bits();
        /// Transition 4/16: enable operation.
        const STATE_ENABLE_OP = Self::ENABLE_VOLTAGE.bits()
            | Self::QUICK_STOP.bits()
            | Self::SWITCH_ON.bits()
            | Self::ENABLE_OP.bits();
        /// Transition 15: fault reset edge.
        const STATE_FAULT_RESET = Self::FAULT_RESET.bits();
    }
}

bitflags::bitflags! {
    /// CiA 402 status word, object `0x6041:00`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct StatusWord: u16 {
        /// Ready to switch on.
        const READY_TO_SWITCH_ON = 1 << 0;
        /// Switched on.
        const SWITCHED_ON = 1 << 1;
        /// Operation enabled.
        const OP_ENABLED = 1 << 2;
        /// Fault.
        const FAULT = 1 << 3;
        /// Voltage enabled.
        const VOLTAGE_ENABLED = 1 << 4;
        /// Quick stop, active low.
        const QUICK_STOP = 1 << 5;
        /// Switch on disabled.
        const SWITCH_ON_DISABLED = 1 << 6;
        /// Warning.
        const WARNING = 1 << 7;
        /// Remote.
        const REMOTE = 1 << 9;
        /// Target reached.
        const TARGET_REACHED = 1 << 10;
        /// Internal limit active.
        const INTERNAL_LIMIT = 1 << 11;
    }
}

/// State mask ignoring the quick stop bit.
const STATE_MASK: u16 = 0b0100_1111;
/// State mask including the quick stop bit.
const STATE_MASK_QUICK_STOP: u16 = 0b0110_1111;

impl StatusWord {
    /// Derive the drive state from the low status word bits.
    ///
    /// Patterns that match no CiA 402 state map to
    /// [`State::NotReadyToSwitchOn`].
    pub fn parse_state(self) -> State {
        match self.bits() & STATE_MASK {
            0b0000_0000 => State::NotReadyToSwitchOn,
            0b0100_0000 => State::SwitchOnDisabled,
            0b0000_1111 => State::FaultReactionActive,
            0b0000_1000 => State::Fault,
            // Quick stop must equal 0 to be active
            _ => match self.bits() & STATE_MASK_QUICK_STOP {
                0b0010_0001 => State::ReadyToSwitchOn,
                0b0010_0011 => State::SwitchedOn,
                0b0010_0111 => State::OperationEnabled,
                0b0000_0111 => State::QuickStopActive,
                _ => State::NotReadyToSwitchOn,
            },
        }
    }
}

/// Drive state parsed from the status word.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// Power stage initialising, no commands accepted.
    NotReadyToSwitchOn,
    /// Power stage disabled, waiting for shutdown command.
    SwitchOnDisabled,
    /// Shutdown accepted, main power may be applied.
    ReadyToSwitchOn,
    /// Power stage switched on, operation disabled.
    SwitchedOn,
    /// Drive follows the reference.
    OperationEnabled,
    /// Quick stop ramp in progress.
    QuickStopActive,
    /// The drive is reacting to a fault.
    FaultReactionActive,
    /// Fault latched, waiting for a reset edge.
    Fault,
}

impl core::fmt::Display for State {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            State::NotReadyToSwitchOn => f.write_str("Not ready to switch on"),
            State::SwitchOnDisabled => f.write_str("Switch on disabled"),
            State::ReadyToSwitchOn => f.write_str("Ready to switch on"),
            State::SwitchedOn => f.write_str("Switched on"),
            State::OperationEnabled => f.write_str("Operation enabled"),
            State::QuickStopActive => f.write_str("Quick stop active"),
            State::FaultReactionActive => f.write_str("Fault reaction active"),
            State::Fault => f.write_str("Fault"),
        }
    }
}

/// What the motion layer currently wants from the drive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TransitionAction {
    /// Hold the current state.
    #[default]
    None,
    /// Drive towards operation enabled.
    Run,
    /// Ramp down on the configured deceleration ramp.
    Stop,
    /// Ramp down on the quick stop ramp.
    QuickStop,
}

/// Compute the control word for one cycle.
///
/// `reset_permitted` drives the fault reset bit; the caller is responsible
/// for lowering it again, the bit is only effective on its rising edge.
pub const fn transition(
    state: State,
    action: TransitionAction,
    reset_permitted: bool,
) -> ControlWord {
    use TransitionAction as Action;

    match state {
        State::Fault => {
            if reset_permitted {
                ControlWord::STATE_FAULT_RESET
            } else {
                ControlWord::STATE_DISABLE_VOLTAGE
            }
        }
        State::FaultReactionActive => ControlWord::STATE_DISABLE_VOLTAGE,
        State::NotReadyToSwitchOn | State::SwitchOnDisabled => match action {
            Action::Run | Action::Stop => ControlWord::STATE_SHUTDOWN,
            Action::None | Action::QuickStop => ControlWord::STATE_DISABLE_VOLTAGE,
        },
        State::ReadyToSwitchOn => ControlWord::STATE_SWITCH_ON,
        State::SwitchedOn => match action {
            Action::Run => ControlWord::STATE_ENABLE_OP,
            Action::None | Action::Stop | Action::QuickStop => ControlWord::STATE_SWITCH_ON,
        },
        State::OperationEnabled => match action {
            Action::QuickStop => ControlWord::STATE_QUICK_STOP,
            Action::Stop => ControlWord::STATE_DISABLE_OP,
            Action::Run | Action::None => ControlWord::STATE_ENABLE_OP,
        },
        State::QuickStopActive => match action {
            Action::Run => ControlWord::STATE_ENABLE_OP,
            Action::None | Action::Stop | Action::QuickStop => ControlWord::STATE_QUICK_STOP,
        },
    }
}
