//! Displacement tracking from frequency feedback.
//!
//! The positioner integrates the drive's reported output frequency over the
//! cycle time into an absolute displacement in micrometres, tracks the homing
//! reference, and resolves positional notifications registered by the command
//! layer. Homing and limit switch sensors are digital inputs of the drive;
//! the positioner turns the per cycle DI bitmask into edge reports for the
//! controller.

use serde::{Deserialize, Serialize};
use std::{
    sync::Mutex,
    time::Duration,
};
use tokio::sync::oneshot;

/// One of the six ATV320 digital inputs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigitalInput {
    /// Terminal DI1.
    Di1,
    /// Terminal DI2.
    Di2,
    /// Terminal DI3.
    Di3,
    /// Terminal DI4.
    Di4,
    /// Terminal DI5.
    Di5,
    /// Terminal DI6.
    Di6,
}

impl DigitalInput {
    /// Bit mask of this input in the `1LIR` PDO word.
    pub const fn mask(self) -> u16 {
        1 << self as u16
    }
}

/// Positioner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionerConfig {
    /// Process data cycle period.
    pub cycle_time: Duration,
    /// Displacement per motor revolution in micrometres. The output frequency
    /// in hertz is taken as revolutions per second.
    pub displacement_per_revolution: i64,
    /// Positional tolerance in micrometres. Placements within this window of
    /// the current position complete without motion.
    pub resolution: i64,
    /// Unsigned travel after which the homing reference expires, in
    /// micrometres. `None` keeps the reference valid forever.
    pub needs_homing_after: Option<i64>,
    /// Speed ratio used by `move_home`, in percent.
    pub homing_travel_speed: Option<f64>,
    /// Digital input wired to the homing sensor.
    pub homing_sensor: Option<DigitalInput>,
    /// Digital input wired to the positive limit switch.
    pub positive_limit_switch: Option<DigitalInput>,
    /// Digital input wired to the negative limit switch.
    pub negative_limit_switch: Option<DigitalInput>,
}

impl Default for PositionerConfig {
    fn default() -> Self {
        Self {
            cycle_time: Duration::from_millis(1),
            displacement_per_revolution: 1000,
            resolution: 100,
            needs_homing_after: None,
            homing_travel_speed: None,
            homing_sensor: None,
            positive_limit_switch: None,
            negative_limit_switch: None,
        }
    }
}

/// Sensor value changes observed in one cycle.
///
/// `Some(value)` is reported for the first sample and for every change
/// afterwards.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SensorChanges {
    /// Homing sensor level.
    pub homing: Option<bool>,
    /// Positive limit switch level.
    pub positive_limit: Option<bool>,
    /// Negative limit switch level.
    pub negative_limit: Option<bool>,
}

/// Which limit switch a shared sensor channel is checked against.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LimitSide {
    /// Positive limit switch.
    Positive,
    /// Negative limit switch.
    Negative,
}

struct NotifyTarget {
    /// Absolute position that resolves this notification, in micrometres.
    target: i64,
    /// Crossing direction; `true` waits for `absolute >= target`.
    positive: bool,
    tx: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct PositionState {
    /// Absolute displacement since initialisation, micrometres.
    absolute: i64,
    /// Sub-micrometre integration remainder, scaled by `FRACTION_SCALE`.
    remainder: i64,
    /// Absolute position captured when homing last completed.
    home: Option<i64>,
    /// Unsigned travel since the last homing, micrometres.
    travel_since_home: i64,
    /// DI bitmask from the previous cycle.
    last_inputs: Option<u16>,
    pending: Vec<NotifyTarget>,
}

/// Displacement integrator and homing reference.
pub struct Positioner {
    config: PositionerConfig,
    state: Mutex<PositionState>,
}

/// Deci-hertz to hertz (10) times microseconds to seconds (1_000_000).
const FRACTION_SCALE: i64 = 10_000_000;

impl Positioner {
    /// Create a positioner with zeroed displacement and no home reference.
    pub fn new(config: PositionerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PositionState::default()),
        }
    }

    /// Integrate one cycle of frequency feedback, in deci-hertz.
    ///
    /// Resolves every registered notification whose target was crossed this
    /// cycle.
    pub fn freq_update(&self, frequency: i16) {
        let numerator = i64::from(frequency)
            * self.config.cycle_time.as_micros() as i64
            * self.config.displacement_per_revolution;

        let mut state = self.state.lock().unwrap();
        state.remainder += numerator;
        let delta = state.remainder / FRACTION_SCALE;
        state.remainder -= delta * FRACTION_SCALE;
        state.absolute += delta;
        state.travel_since_home = state.travel_since_home.saturating_add(delta.abs());

        let absolute = state.absolute;
        state.pending.retain_mut(|notify| {
            let Some(tx) = notify.tx.take() else {
                return false;
            };
            if tx.is_closed() {
                return false;
            }

            let reached = if notify.positive {
                absolute >= notify.target
            } else {
                absolute <= notify.target
            };

            if reached {
                let _ = tx.send(());
                false
            } else {
                notify.tx = Some(tx);
                true
            }
        });
    }

    /// Track the drive's digital inputs and report sensor level changes.
    pub fn update_digital_inputs(&self, inputs: u16) -> SensorChanges {
        let mut state = self.state.lock().unwrap();
        let previous = state.last_inputs;
        state.last_inputs = Some(inputs);
        drop(state);

        let changed = |channel: Option<DigitalInput>| {
            let channel = channel?;
            let value = inputs & channel.mask() != 0;
            match previous {
                Some(prev) if (prev & channel.mask() != 0) == value => None,
                _ => Some(value),
            }
        };

        SensorChanges {
            homing: changed(self.config.homing_sensor),
            positive_limit: changed(self.config.positive_limit_switch),
            negative_limit: changed(self.config.negative_limit_switch),
        }
    }

    /// Absolute displacement since initialisation, micrometres.
    pub fn position(&self) -> i64 {
        self.state.lock().unwrap().absolute
    }

    /// Displacement relative to the home reference, or `None` before the
    /// first homing.
    pub fn position_from_home(&self) -> Option<i64> {
        let state = self.state.lock().unwrap();
        state.home.map(|home| state.absolute - home)
    }

    /// Record a completed homing at the given absolute position.
    pub fn home(&self, at: i64) {
        let mut state = self.state.lock().unwrap();
        state.home = Some(at);
        state.travel_since_home = 0;
    }

    /// `true` while no valid home reference exists.
    pub fn needs_homing(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.home.is_none() {
            return true;
        }
        match self.config.needs_homing_after {
            Some(budget) => state.travel_since_home > budget,
            None => false,
        }
    }

    /// Predict whether a move of `travel` micrometres would exhaust the
    /// homing travel budget.
    pub fn would_need_homing(&self, travel: i64) -> bool {
        let state = self.state.lock().unwrap();
        if state.home.is_none() {
            return true;
        }
        match self.config.needs_homing_after {
            Some(budget) => state.travel_since_home.saturating_add(travel.abs()) > budget,
            None => false,
        }
    }

    /// Resolve once the absolute position has advanced `travel` micrometres
    /// in the sign of `travel`. Zero travel resolves immediately.
    pub fn notify_after(&self, travel: i64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();

        if travel == 0 {
            let _ = tx.send(());
            return rx;
        }

        let target = state.absolute + travel;
        state.pending.push(NotifyTarget {
            target,
            positive: travel > 0,
            tx: Some(tx),
        });

        rx
    }

    /// Resolve once the position from home crosses `placement` micrometres,
    /// approached from the current side. Requires a home reference.
    pub fn notify_from_home(&self, placement: i64) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        let home = state.home?;
        let target = home + placement;

        if target == state.absolute {
            let _ = tx.send(());
            return Some(rx);
        }

        let positive = target > state.absolute;
        state.pending.push(NotifyTarget {
            target,
            positive,
            tx: Some(tx),
        });

        Some(rx)
    }

    /// Current homing sensor level, `None` when no sensor is configured.
    pub fn homing_sensor_level(&self) -> Option<bool> {
        let channel = self.config.homing_sensor?;
        let inputs = self.state.lock().unwrap().last_inputs.unwrap_or(0);

        Some(inputs & channel.mask() != 0)
    }

    /// `true` when the homing sensor shares its digital input with the given
    /// limit switch.
    pub fn homing_shares_channel(&self, side: LimitSide) -> bool {
        let limit = match side {
            LimitSide::Positive => self.config.positive_limit_switch,
            LimitSide::Negative => self.config.negative_limit_switch,
        };

        match (self.config.homing_sensor, limit) {
            (Some(sensor), Some(limit)) => sensor == limit,
            _ => false,
        }
    }

    /// Positional tolerance, micrometres.
    pub fn resolution(&self) -> i64 {
        self.config.resolution
    }

    /// Speed ratio used for homing travel.
    pub fn homing_travel_speed(&self) -> Option<f64> {
        self.config.homing_travel_speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positioner() -> Positioner {
        Positioner::new(PositionerConfig {
            cycle_time: Duration::from_millis(1),
            // 10 um per cycle at 500 dHz
            displacement_per_revolution: 200,
            resolution: 10,
            ..PositionerConfig::default()
        })
    }

    #[test]
    fn integrates_frequency_over_cycles() {
        let pos = positioner();

        for _ in 0..100 {
            pos.freq_update(500);
        }
        assert_eq!(pos.position(), 1000);

        for _ in 0..50 {
            pos.freq_update(-500);
        }
        assert_eq!(pos.position(), 500);
    }

    #[test]
    fn sub_micrometre_remainder_does_not_drift() {
        let pos = Positioner::new(PositionerConfig {
            cycle_time: Duration::from_millis(1),
            displacement_per_revolution: 3,
            ..PositionerConfig::default()
        });

        // 0.15 um per cycle; 1000 cycles must accumulate exactly 150 um
        for _ in 0..1000 {
            pos.freq_update(500);
        }

        assert_eq!(pos.position(), 150);
    }

    #[test]
    fn notify_after_resolves_at_travel() {
        let pos = positioner();
        let mut rx = pos.notify_after(25);

        pos.freq_update(500);
        pos.freq_update(500);
        assert!(rx.try_recv().is_err());

        pos.freq_update(500);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn notify_after_negative_direction() {
        let pos = positioner();
        let mut rx = pos.notify_after(-15);

        pos.freq_update(-500);
        assert!(rx.try_recv().is_err());

        pos.freq_update(-500);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn notify_after_zero_travel_is_immediate() {
        let pos = positioner();
        let mut rx = pos.notify_after(0);

        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn notify_from_home_requires_home() {
        let pos = positioner();
        assert!(pos.notify_from_home(100).is_none());

        pos.home(0);
        let mut rx = pos.notify_from_home(30).expect("homed");

        for _ in 0..3 {
            pos.freq_update(500);
        }
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn homing_budget_expires() {
        let pos = Positioner::new(PositionerConfig {
            cycle_time: Duration::from_millis(1),
            displacement_per_revolution: 200,
            needs_homing_after: Some(100),
            ..PositionerConfig::default()
        });

        assert!(pos.needs_homing());
        pos.home(pos.position());
        assert!(!pos.needs_homing());
        assert!(pos.would_need_homing(150));
        assert!(!pos.would_need_homing(50));

        // 110 um forward, unsigned travel exceeds the budget
        for _ in 0..11 {
            pos.freq_update(500);
        }
        assert!(pos.needs_homing());

        pos.home(pos.position());
        assert!(!pos.needs_homing());
    }

    #[test]
    fn reports_sensor_changes_and_edges() {
        let pos = Positioner::new(PositionerConfig {
            homing_sensor: Some(DigitalInput::Di3),
            positive_limit_switch: Some(DigitalInput::Di1),
            ..PositionerConfig::default()
        });

        let first = pos.update_digital_inputs(0b000);
        assert_eq!(first.homing, Some(false));
        assert_eq!(first.positive_limit, Some(false));
        assert_eq!(first.negative_limit, None);

        let unchanged = pos.update_digital_inputs(0b000);
        assert_eq!(unchanged, SensorChanges::default());

        let rising = pos.update_digital_inputs(0b100);
        assert_eq!(rising.homing, Some(true));
        assert_eq!(rising.positive_limit, None);

        let falling = pos.update_digital_inputs(0b001);
        assert_eq!(falling.homing, Some(false));
        assert_eq!(falling.positive_limit, Some(true));
    }

    #[test]
    fn shared_homing_and_limit_channel() {
        let pos = Positioner::new(PositionerConfig {
            homing_sensor: Some(DigitalInput::Di2),
            positive_limit_switch: Some(DigitalInput::Di2),
            negative_limit_switch: Some(DigitalInput::Di4),
            ..PositionerConfig::default()
        });

        assert!(pos.homing_shares_channel(LimitSide::Positive));
        assert!(!pos.homing_shares_channel(LimitSide::Negative));
    }
}
