//! ATV320 acyclic parameter access.
//!
//! The crate never talks to the mailbox itself. It produces [`SdoWrite`]
//! values, at startup through [`startup_writes`] and at runtime through
//! [`crate::config::DriveConfig::diff`], for the owning EtherCAT master to
//! execute.

use crate::config::DriveConfig;

/// An object dictionary address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SdoAddress {
    /// Object index.
    pub index: u16,
    /// Object subindex.
    pub subindex: u8,
}

/// Value of a single SDO download.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SdoValue {
    /// One byte value.
    U8(u8),
    /// Two byte value.
    U16(u16),
    /// Four byte value.
    U32(u32),
}

/// One SDO download for the transport to perform.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SdoWrite {
    /// Target object.
    pub address: SdoAddress,
    /// Value to download.
    pub value: SdoValue,
}

impl SdoWrite {
    /// A one byte download.
    pub const fn u8(address: SdoAddress, value: u8) -> Self {
        Self {
            address,
            value: SdoValue::U8(value),
        }
    }

    /// A two byte download.
    pub const fn u16(address: SdoAddress, value: u16) -> Self {
        Self {
            address,
            value: SdoValue::U16(value),
        }
    }

    /// A four byte download.
    pub const fn u32(address: SdoAddress, value: u32) -> Self {
        Self {
            address,
            value: SdoValue::U32(value),
        }
    }
}

const fn address(index: u16, subindex: u8) -> SdoAddress {
    SdoAddress { index, subindex }
}

/// RX PDO assignment object.
pub const RX_PDO_ASSIGN: u16 = 0x1C12;
/// TX PDO assignment object.
pub const TX_PDO_ASSIGN: u16 = 0x1C13;
/// RX PDO mapping object used for the drive command data.
pub const RX_PDO_MAPPING: u16 = 0x1605;
/// TX PDO mapping object used for the drive status data.
pub const TX_PDO_MAPPING: u16 = 0x1A05;

/// FR1, reference frequency channel 1.
pub const REFERENCE_FREQUENCY_CHANNEL: SdoAddress = address(0x2036, 0x0E);
/// Reference frequency via the communication module, FR1 value `nEt`.
pub const REFERENCE_VIA_COM_MODULE: u16 = 169;
/// R1, relay 1 assignment.
pub const RELAY_1_ASSIGNMENT: SdoAddress = address(0x2014, 0x02);
/// AQ1, analog output 1 assignment.
pub const ANALOG_OUTPUT_1_ASSIGNMENT: SdoAddress = address(0x2014, 0x16);
/// HRFC, extended fault reset activation.
pub const EXTENDED_FAULT_RESET: SdoAddress = address(0x2029, 0x33);

/// NPR, nominal motor power.
pub const NOMINAL_MOTOR_POWER: SdoAddress = address(0x2042, 0x0E);
/// UNS, nominal motor voltage.
pub const NOMINAL_MOTOR_VOLTAGE: SdoAddress = address(0x2042, 0x02);
/// NCR, nominal motor current.
pub const NOMINAL_MOTOR_CURRENT: SdoAddress = address(0x2042, 0x04);
/// FRS, nominal motor frequency.
pub const NOMINAL_MOTOR_FREQUENCY: SdoAddress = address(0x2042, 0x03);
/// NSP, nominal motor speed.
pub const NOMINAL_MOTOR_SPEED: SdoAddress = address(0x2042, 0x05);
/// TFR, maximum output frequency.
pub const MAX_FREQUENCY: SdoAddress = address(0x2001, 0x04);
/// ITH, motor thermal protection current.
pub const MOTOR_THERMAL_CURRENT: SdoAddress = address(0x2042, 0x17);
/// CLI, current limitation.
pub const CURRENT_LIMITATION: SdoAddress = address(0x203E, 0x02);
/// HSP, high speed.
pub const HIGH_SPEED: SdoAddress = address(0x2001, 0x05);
/// LSP, low speed.
pub const LOW_SPEED: SdoAddress = address(0x2001, 0x06);
/// COS, motor 1 cosine phi.
pub const MOTOR_COS_PHI: SdoAddress = address(0x2042, 0x07);
/// ACC, acceleration ramp time.
pub const ACCELERATION_RAMP: SdoAddress = address(0x203C, 0x02);
/// DEC, deceleration ramp time.
pub const DECELERATION_RAMP: SdoAddress = address(0x203C, 0x03);
/// DCF, fast stop ramp divider.
pub const FAST_STOP_RAMP_DIVIDER: SdoAddress = address(0x2052, 0x1F);
/// LFA, async motor leakage inductance.
pub const MOTOR_LEAKAGE_INDUCTANCE: SdoAddress = address(0x2042, 0x3F);
/// RSA, async motor stator resistance.
pub const MOTOR_STATOR_RESISTANCE: SdoAddress = address(0x2042, 0x2B);
/// TRA, rotor time constant.
pub const ROTOR_TIME_CONSTANT: SdoAddress = address(0x2042, 0x44);
/// SSB, stop mode on torque or current limitation.
pub const TORQUE_LIMIT_STOP: SdoAddress = address(0x203E, 0x29);

/// TX PDO entries, `0x1A05:01..`, in mapping order.
const TX_MAPPING: [u32; 6] = [
    0x6041_0010, // ETA, status word
    0x2002_0310, // RFR, output frequency
    0x2002_0510, // LCR, motor current
    0x2016_0310, // 1LIR, DI1 to DI6
    0x2029_1610, // LFT, last fault
    0x2002_2910, // HMIS, drive state
];

/// RX PDO entries, `0x1605:01..`, in mapping order.
const RX_MAPPING: [u32; 5] = [
    0x6040_0010, // CMD, control word
    0x2037_0310, // LFR, reference frequency
    0x2016_0D10, // OL1R, logic outputs
    0x203C_0210, // ACC, acceleration ramp
    0x203C_0310, // DEC, deceleration ramp
];

/// The SDO downloads to perform while the drive is in PRE-OP, in order.
///
/// Maps the PDOs, routes the frequency reference to the communication
/// module, clears the built in relay and analog output assignments, enables
/// the extended fault reset and pushes the motor nameplate.
pub fn startup_writes(config: &DriveConfig) -> Vec<SdoWrite> {
    let mut writes = vec![
        // Clear both PDO assignments before touching the mappings
        SdoWrite::u8(address(RX_PDO_ASSIGN, 0x00), 0),
        SdoWrite::u8(address(TX_PDO_ASSIGN, 0x00), 0),
        SdoWrite::u8(address(TX_PDO_MAPPING, 0x00), 0),
    ];

    for (i, entry) in TX_MAPPING.iter().enumerate() {
        writes.push(SdoWrite::u32(address(TX_PDO_MAPPING, i as u8 + 1), *entry));
    }
    writes.push(SdoWrite::u8(
        address(TX_PDO_MAPPING, 0x00),
        TX_MAPPING.len() as u8,
    ));

    writes.push(SdoWrite::u8(address(RX_PDO_MAPPING, 0x00), 0));
    for (i, entry) in RX_MAPPING.iter().enumerate() {
        writes.push(SdoWrite::u32(address(RX_PDO_MAPPING, i as u8 + 1), *entry));
    }
    writes.push(SdoWrite::u8(
        address(RX_PDO_MAPPING, 0x00),
        RX_MAPPING.len() as u8,
    ));

    writes.extend([
        SdoWrite::u16(address(RX_PDO_ASSIGN, 0x01), RX_PDO_MAPPING),
        SdoWrite::u8(address(RX_PDO_ASSIGN, 0x00), 1),
        SdoWrite::u16(address(TX_PDO_ASSIGN, 0x01), TX_PDO_MAPPING),
        SdoWrite::u8(address(TX_PDO_ASSIGN, 0x00), 1),
        SdoWrite::u16(REFERENCE_FREQUENCY_CHANNEL, REFERENCE_VIA_COM_MODULE),
        // Clear internal drive functionality for the outputs
        SdoWrite::u16(RELAY_1_ASSIGNMENT, 0),
        SdoWrite::u16(ANALOG_OUTPUT_1_ASSIGNMENT, 0),
        // Allows resetting OCF, SCF1 and SCF3 class faults remotely
        SdoWrite::u16(EXTENDED_FAULT_RESET, 1),
        SdoWrite::u16(NOMINAL_MOTOR_POWER, config.nominal_motor_power),
        SdoWrite::u16(NOMINAL_MOTOR_VOLTAGE, config.nominal_motor_voltage),
        SdoWrite::u16(NOMINAL_MOTOR_CURRENT, config.nominal_motor_current),
        SdoWrite::u16(NOMINAL_MOTOR_FREQUENCY, config.nominal_motor_frequency),
        SdoWrite::u16(NOMINAL_MOTOR_SPEED, config.nominal_motor_speed),
        SdoWrite::u16(MAX_FREQUENCY, config.max_frequency),
    ]);

    if let Some(value) = config.motor_thermal_current {
        writes.push(SdoWrite::u16(MOTOR_THERMAL_CURRENT, value));
    }
    if let Some(value) = config.current_limitation {
        writes.push(SdoWrite::u16(CURRENT_LIMITATION, value));
    }

    writes.extend([
        SdoWrite::u16(HIGH_SPEED, config.high_speed),
        SdoWrite::u16(LOW_SPEED, config.low_speed),
        SdoWrite::u16(MOTOR_COS_PHI, config.motor_cos_phi),
        SdoWrite::u16(FAST_STOP_RAMP_DIVIDER, config.fast_stop_ramp_divider),
        SdoWrite::u16(
            MOTOR_LEAKAGE_INDUCTANCE,
            config.async_motor_leakage_inductance,
        ),
        SdoWrite::u16(
            MOTOR_STATOR_RESISTANCE,
            config.async_motor_stator_resistance,
        ),
        SdoWrite::u16(ROTOR_TIME_CONSTANT, config.rotor_time_constant),
        SdoWrite::u16(TORQUE_LIMIT_STOP, config.torque_or_current_limit_stop),
    ]);

    writes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_clears_assignments_first() {
        let writes = startup_writes(&DriveConfig::default());

        assert_eq!(writes[0], SdoWrite::u8(address(RX_PDO_ASSIGN, 0x00), 0));
        assert_eq!(writes[1], SdoWrite::u8(address(TX_PDO_ASSIGN, 0x00), 0));
    }

    #[test]
    fn startup_maps_all_pdo_entries() {
        let writes = startup_writes(&DriveConfig::default());

        let tx_entries: Vec<_> = writes
            .iter()
            .filter(|w| w.address.index == TX_PDO_MAPPING && w.address.subindex > 0)
            .collect();
        assert_eq!(tx_entries.len(), 6);
        assert_eq!(tx_entries[0].value, SdoValue::U32(0x6041_0010));

        let rx_entries: Vec<_> = writes
            .iter()
            .filter(|w| w.address.index == RX_PDO_MAPPING && w.address.subindex > 0)
            .collect();
        assert_eq!(rx_entries.len(), 5);
        assert_eq!(rx_entries[0].value, SdoValue::U32(0x6040_0010));
    }

    #[test]
    fn startup_reassigns_and_sets_entry_counts() {
        let writes = startup_writes(&DriveConfig::default());

        assert!(writes.contains(&SdoWrite::u8(address(TX_PDO_MAPPING, 0x00), 6)));
        assert!(writes.contains(&SdoWrite::u8(address(RX_PDO_MAPPING, 0x00), 5)));
        assert!(writes.contains(&SdoWrite::u16(address(RX_PDO_ASSIGN, 0x01), 0x1605)));
        assert!(writes.contains(&SdoWrite::u16(address(TX_PDO_ASSIGN, 0x01), 0x1A05)));
    }

    #[test]
    fn startup_pushes_nameplate() {
        let mut config = DriveConfig::default();
        config.nominal_motor_current = 42;
        config.motor_thermal_current = None;

        let writes = startup_writes(&config);

        assert!(writes.contains(&SdoWrite::u16(NOMINAL_MOTOR_CURRENT, 42)));
        assert!(
            !writes
                .iter()
                .any(|w| w.address == MOTOR_THERMAL_CURRENT)
        );
        assert!(writes.contains(&SdoWrite::u16(
            REFERENCE_FREQUENCY_CHANNEL,
            REFERENCE_VIA_COM_MODULE
        )));
    }
}
