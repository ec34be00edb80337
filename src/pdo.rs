//! ATV320 process data layout.
//!
//! The mappings written during startup (see [`crate::sdo`]) put the objects
//! below on the wire in this exact order, all as 16 bit little endian values.

use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

/// Process data sent by the drive every cycle.
#[derive(Debug, Copy, Clone, Default, PartialEq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 12)]
pub struct InputPdo {
    /// ETA, CiA 402 status word (`0x6041:00`).
    #[wire(bits = 16)]
    pub status_word: u16,
    /// RFR, output frequency in deci-hertz (`0x2002:03`), two's complement
    /// for reverse rotation.
    #[wire(bits = 16)]
    pub frequency: i16,
    /// LCR, motor current in deci-amperes (`0x2002:05`).
    #[wire(bits = 16)]
    pub current: u16,
    /// 1LIR, DI1 to DI6 states (`0x2016:03`).
    #[wire(bits = 16)]
    pub digital_inputs: u16,
    /// LFT, last fault code (`0x2029:16`).
    #[wire(bits = 16)]
    pub last_error: Lft,
    /// HMIS, drive state as shown on the HMI (`0x2002:29`).
    #[wire(bits = 16)]
    pub drive_state: Hmis,
}

impl InputPdo {
    /// Packed size on the wire.
    pub const LEN: usize = 12;

    /// Decode from the raw cyclic data.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        Self::unpack_from_slice(buf).ok()
    }
}

/// Process data sent to the drive every cycle.
#[derive(Debug, Copy, Clone, Default, PartialEq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 10)]
pub struct OutputPdo {
    /// CMD, CiA 402 control word (`0x6040:00`).
    #[wire(bits = 16)]
    pub control_word: u16,
    /// LFR, reference frequency in deci-hertz (`0x2037:03`), two's complement
    /// for reverse rotation.
    #[wire(bits = 16)]
    pub frequency: i16,
    /// OL1R, logic output states (`0x2016:0D`).
    #[wire(bits = 16)]
    pub logic_outputs: u16,
    /// ACC, acceleration ramp time in deci-seconds from zero to nominal
    /// frequency (`0x203C:02`).
    #[wire(bits = 16)]
    pub acceleration: u16,
    /// DEC, deceleration ramp time in deci-seconds (`0x203C:03`).
    #[wire(bits = 16)]
    pub deceleration: u16,
}

impl OutputPdo {
    /// Packed size on the wire.
    pub const LEN: usize = 10;

    /// Encode into the raw cyclic data.
    pub fn write_to(&self, buf: &mut [u8]) -> bool {
        self.pack_to_slice(buf).is_ok()
    }
}

/// ATV320 last fault codes, register LFT (`0x2029:16`).
///
/// Only the codes this crate reacts to are named; everything else decodes
/// into [`Lft::Other`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u16)]
pub enum Lft {
    /// No fault stored.
    NoFault = 0,
    /// EEPROM control fault.
    Eef1 = 2,
    /// Incorrect configuration.
    Cff = 3,
    /// Fieldbus communication interruption.
    Cnf = 4,
    /// CANopen communication interruption.
    Cof = 5,
    /// Modbus communication interruption.
    Slf1 = 6,
    /// Internal link fault.
    Ilf = 7,
    /// Overcurrent.
    Ocf = 16,
    /// Motor short circuit.
    Scf1 = 17,
    /// Ground short circuit.
    Scf3 = 19,
    /// Any other drive fault code.
    #[wire(catch_all)]
    Other(u16),
}

impl Default for Lft {
    fn default() -> Self {
        Self::NoFault
    }
}

/// ATV320 drive state as reported to the HMI, register HMIS (`0x2002:29`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u16)]
pub enum Hmis {
    /// Autotuning in progress.
    Autotuning = 0,
    /// DC injection braking.
    DcInjection = 1,
    /// Ready to run.
    Ready = 2,
    /// Freewheel stop.
    Freewheel = 3,
    /// Running.
    Running = 4,
    /// Accelerating.
    Accelerating = 5,
    /// Decelerating.
    Decelerating = 6,
    /// Current limit active.
    CurrentLimit = 7,
    /// Fast stop in progress.
    FastStop = 8,
    /// Fluxing the motor.
    Fluxing = 9,
    /// No line power.
    NoLinePower = 10,
    /// Controlled stop.
    ControlledStop = 11,
    /// Adapted deceleration.
    DecAdaptation = 12,
    /// Output cut.
    OutputCut = 13,
    /// Undervoltage warning.
    UndervoltageWarning = 14,
    /// TC mode active.
    TcMode = 15,
    /// Autotest in progress.
    Autotest = 16,
    /// Autotest error.
    AutotestError = 17,
    /// Autotest done.
    AutotestOk = 18,
    /// EEPROM test in progress.
    EepromTest = 19,
    /// Fault latched.
    Fault = 20,
    /// Safe torque off active.
    Sto = 22,
    /// Any other state code.
    #[wire(catch_all)]
    Other(u16),
}

impl Default for Hmis {
    fn default() -> Self {
        Self::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_pdo_round_trip() {
        let input = InputPdo {
            status_word: 0x0627,
            frequency: -500,
            current: 23,
            digital_inputs: 0b10_0001,
            last_error: Lft::Ocf,
            drive_state: Hmis::Running,
        };

        let mut buf = [0u8; InputPdo::LEN];
        input.pack_to_slice(&mut buf).expect("pack");

        assert_eq!(
            buf,
            [
                0x27, 0x06, // status word
                0x0C, 0xFE, // -500 dHz
                0x17, 0x00, // current
                0x21, 0x00, // DI1 and DI6
                0x10, 0x00, // OCF
                0x04, 0x00, // running
            ]
        );
        assert_eq!(InputPdo::parse(&buf), Some(input));
    }

    #[test]
    fn output_pdo_layout() {
        let output = OutputPdo {
            control_word: 0x000F,
            frequency: 400,
            logic_outputs: 0,
            acceleration: 10,
            deceleration: 35,
        };

        let mut buf = [0u8; OutputPdo::LEN];
        assert!(output.write_to(&mut buf));
        assert_eq!(
            buf,
            [0x0F, 0x00, 0x90, 0x01, 0x00, 0x00, 0x0A, 0x00, 0x23, 0x00]
        );
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert_eq!(InputPdo::parse(&[0u8; 4]), None);

        let output = OutputPdo::default();
        assert!(!output.write_to(&mut [0u8; 4]));
    }

    #[test]
    fn unknown_fault_codes_are_preserved() {
        let raw = 0x1234u16.to_le_bytes();
        let decoded = Lft::unpack_from_slice(&raw).expect("unpack");

        assert_eq!(decoded, Lft::Other(0x1234));

        let known = 4u16.to_le_bytes();
        assert_eq!(Lft::unpack_from_slice(&known).expect("unpack"), Lft::Cnf);
    }
}
