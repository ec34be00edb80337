//! Drive configuration.
//!
//! Values carry the raw units of the ATV320 registers they are written to:
//! frequencies in deci-hertz, currents in deci-amperes, ramps in
//! deci-seconds. Persistence is outside this crate; the types only need to
//! serialise.

use crate::{positioner::PositionerConfig, sdo, sdo::SdoWrite};
use serde::{Deserialize, Serialize};

/// Nameplate and behaviour parameters pushed to the drive over SDO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveConfig {
    /// NPR, nominal motor power in units of 10 W.
    pub nominal_motor_power: u16,
    /// UNS, nominal motor voltage in volts.
    pub nominal_motor_voltage: u16,
    /// NCR, nominal motor current in deci-amperes.
    pub nominal_motor_current: u16,
    /// FRS, nominal motor frequency in deci-hertz.
    pub nominal_motor_frequency: u16,
    /// NSP, nominal motor speed in rpm.
    pub nominal_motor_speed: u16,
    /// TFR, maximum output frequency in deci-hertz.
    pub max_frequency: u16,
    /// ITH, motor thermal protection current in deci-amperes.
    pub motor_thermal_current: Option<u16>,
    /// CLI, current limitation in deci-amperes.
    pub current_limitation: Option<u16>,
    /// HSP, frequency at 100 % speed ratio, deci-hertz.
    pub high_speed: u16,
    /// LSP, frequency at 1 % speed ratio, deci-hertz.
    pub low_speed: u16,
    /// COS, motor cosine phi in hundredths.
    pub motor_cos_phi: u16,
    /// ACC, ramp time from zero to nominal frequency in deci-seconds.
    pub acceleration: u16,
    /// DEC, ramp time from nominal frequency to zero in deci-seconds.
    pub deceleration: u16,
    /// Speed ratio in percent used by commands that do not carry their own.
    pub default_speedratio: f64,
    /// DCF, divider applied to the deceleration ramp on fast stop, 0 to 10.
    pub fast_stop_ramp_divider: u16,
    /// LFA, async motor leakage inductance in mH.
    pub async_motor_leakage_inductance: u16,
    /// RSA, async motor stator resistance in mOhm.
    pub async_motor_stator_resistance: u16,
    /// TRA, rotor time constant in ms.
    pub rotor_time_constant: u16,
    /// SSB, stop mode on torque or current limitation.
    pub torque_or_current_limit_stop: u16,
    /// Positioner setup.
    pub positioner: PositionerConfig,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            nominal_motor_power: 15,
            nominal_motor_voltage: 400,
            nominal_motor_current: 20,
            nominal_motor_frequency: 500,
            nominal_motor_speed: 1500,
            max_frequency: 800,
            motor_thermal_current: Some(20),
            current_limitation: Some(20),
            high_speed: 800,
            low_speed: 200,
            motor_cos_phi: 80,
            acceleration: 1,
            deceleration: 1,
            default_speedratio: 1.0,
            fast_stop_ramp_divider: 4,
            async_motor_leakage_inductance: 0,
            async_motor_stator_resistance: 0,
            rotor_time_constant: 0,
            torque_or_current_limit_stop: 0,
            positioner: PositionerConfig::default(),
        }
    }
}

impl DriveConfig {
    /// SDO writes for every nameplate field that changed relative to `old`.
    ///
    /// The writes are meant to be queued and executed from the cycle loop,
    /// never at the place the change was observed.
    pub fn diff(&self, old: &Self) -> Vec<SdoWrite> {
        let mut writes = Vec::new();

        let mut push_u16 = |address, new: u16, old: u16| {
            if new != old {
                writes.push(SdoWrite::u16(address, new));
            }
        };

        push_u16(
            sdo::NOMINAL_MOTOR_POWER,
            self.nominal_motor_power,
            old.nominal_motor_power,
        );
        push_u16(
            sdo::NOMINAL_MOTOR_VOLTAGE,
            self.nominal_motor_voltage,
            old.nominal_motor_voltage,
        );
        push_u16(
            sdo::NOMINAL_MOTOR_CURRENT,
            self.nominal_motor_current,
            old.nominal_motor_current,
        );
        push_u16(
            sdo::NOMINAL_MOTOR_FREQUENCY,
            self.nominal_motor_frequency,
            old.nominal_motor_frequency,
        );
        push_u16(
            sdo::NOMINAL_MOTOR_SPEED,
            self.nominal_motor_speed,
            old.nominal_motor_speed,
        );
        push_u16(sdo::MAX_FREQUENCY, self.max_frequency, old.max_frequency);
        push_u16(sdo::HIGH_SPEED, self.high_speed, old.high_speed);
        push_u16(sdo::LOW_SPEED, self.low_speed, old.low_speed);
        push_u16(sdo::MOTOR_COS_PHI, self.motor_cos_phi, old.motor_cos_phi);
        push_u16(
            sdo::FAST_STOP_RAMP_DIVIDER,
            self.fast_stop_ramp_divider,
            old.fast_stop_ramp_divider,
        );
        push_u16(
            sdo::MOTOR_LEAKAGE_INDUCTANCE,
            self.async_motor_leakage_inductance,
            old.async_motor_leakage_inductance,
        );
        push_u16(
            sdo::MOTOR_STATOR_RESISTANCE,
            self.async_motor_stator_resistance,
            old.async_motor_stator_resistance,
        );
        push_u16(
            sdo::ROTOR_TIME_CONSTANT,
            self.rotor_time_constant,
            old.rotor_time_constant,
        );
        push_u16(
            sdo::TORQUE_LIMIT_STOP,
            self.torque_or_current_limit_stop,
            old.torque_or_current_limit_stop,
        );

        if self.motor_thermal_current != old.motor_thermal_current {
            if let Some(value) = self.motor_thermal_current {
                writes.push(SdoWrite::u16(sdo::MOTOR_THERMAL_CURRENT, value));
            }
        }
        if self.current_limitation != old.current_limitation {
            if let Some(value) = self.current_limitation {
                writes.push(SdoWrite::u16(sdo::CURRENT_LIMITATION, value));
            }
        }

        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_drive_factory_values() {
        let config = DriveConfig::default();

        assert_eq!(config.nominal_motor_frequency, 500);
        assert_eq!(config.high_speed, 800);
        assert_eq!(config.low_speed, 200);
        assert_eq!(config.fast_stop_ramp_divider, 4);
        assert_eq!(config.default_speedratio, 1.0);
    }

    #[test]
    fn diff_is_empty_for_identical_configs() {
        let config = DriveConfig::default();

        assert!(config.diff(&config.clone()).is_empty());
    }

    #[test]
    fn diff_emits_only_changed_fields() {
        let old = DriveConfig::default();
        let mut new = old.clone();
        new.high_speed = 600;
        new.acceleration = 35;

        // Ramps travel in the cyclic data, not over SDO
        let writes = new.diff(&old);

        assert_eq!(writes, vec![SdoWrite::u16(sdo::HIGH_SPEED, 600)]);
    }

    #[test]
    fn diff_covers_optional_fields() {
        let old = DriveConfig::default();
        let mut new = old.clone();
        new.current_limitation = Some(35);

        assert_eq!(
            new.diff(&old),
            vec![SdoWrite::u16(sdo::CURRENT_LIMITATION, 35)]
        );
    }
}
