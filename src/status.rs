//! Published drive status.
//!
//! Each signal is a watch channel updated only when the underlying value
//! changes, so subscribers see one notification per change rather than one
//! per cycle.

use crate::{
    cia402::{State, StatusWord},
    pdo::{Hmis, InputPdo, Lft},
};
use tokio::sync::watch;

/// Mask of the six digital inputs in the `1LIR` word.
const DI_MASK: u16 = 0b11_1111;

/// Publish side of the drive status signals.
pub struct StatusSignals {
    state_402: watch::Sender<State>,
    hmis: watch::Sender<Hmis>,
    last_error: watch::Sender<Lft>,
    frequency: watch::Sender<f64>,
    current: watch::Sender<f64>,
    digital_inputs: watch::Sender<u16>,
}

impl StatusSignals {
    /// Create the signal set with idle defaults.
    pub fn new() -> Self {
        Self {
            state_402: watch::channel(State::NotReadyToSwitchOn).0,
            hmis: watch::channel(Hmis::Ready).0,
            last_error: watch::channel(Lft::NoFault).0,
            frequency: watch::channel(0.0).0,
            current: watch::channel(0.0).0,
            digital_inputs: watch::channel(0).0,
        }
    }

    /// Publish one cycle of drive input, signalling only changed values.
    pub fn publish(&self, input: &InputPdo) {
        send_if_changed(
            &self.state_402,
            StatusWord::from_bits_retain(input.status_word).parse_state(),
        );
        send_if_changed(&self.hmis, input.drive_state);
        send_if_changed(&self.last_error, input.last_error);
        send_if_changed(&self.frequency, f64::from(input.frequency) / 10.0);
        send_if_changed(&self.current, f64::from(input.current) / 10.0);
        send_if_changed(&self.digital_inputs, input.digital_inputs & DI_MASK);
    }

    /// Subscribe to the parsed CiA 402 state.
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state_402.subscribe()
    }

    /// Subscribe to the HMI drive state.
    pub fn subscribe_hmis(&self) -> watch::Receiver<Hmis> {
        self.hmis.subscribe()
    }

    /// Subscribe to the last fault code.
    pub fn subscribe_last_error(&self) -> watch::Receiver<Lft> {
        self.last_error.subscribe()
    }

    /// Subscribe to the output frequency in hertz.
    pub fn subscribe_frequency(&self) -> watch::Receiver<f64> {
        self.frequency.subscribe()
    }

    /// Subscribe to the motor current in amperes.
    pub fn subscribe_current(&self) -> watch::Receiver<f64> {
        self.current.subscribe()
    }

    /// Subscribe to the DI1 to DI6 bitmask.
    pub fn subscribe_digital_inputs(&self) -> watch::Receiver<u16> {
        self.digital_inputs.subscribe()
    }
}

impl Default for StatusSignals {
    fn default() -> Self {
        Self::new()
    }
}

fn send_if_changed<T: PartialEq>(sender: &watch::Sender<T>, new: T) {
    sender.send_if_modified(|value| {
        if *value == new {
            false
        } else {
            *value = new;
            true
        }
    });
}
