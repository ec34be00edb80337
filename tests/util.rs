//! Shared harness: drives an [`Atv320Drive`] with fabricated process data,
//! standing in for the EtherCAT master and the drive itself.

use atv320::{
    Atv320Drive,
    config::DriveConfig,
    pdo::{InputPdo, OutputPdo},
    positioner::{DigitalInput, PositionerConfig},
};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};
use std::time::Duration;

/// Status word patterns as the drive reports them.
#[allow(unused)]
pub mod status {
    pub const SWITCH_ON_DISABLED: u16 = 0x0040;
    pub const READY_TO_SWITCH_ON: u16 = 0x0021;
    pub const SWITCHED_ON: u16 = 0x0023;
    pub const OPERATION_ENABLED: u16 = 0x0027;
    pub const FAULT: u16 = 0x0008;
}

#[allow(unused)]
pub struct Harness {
    pub drive: Atv320Drive,
    pub input: InputPdo,
}

/// `low_speed = 200 dHz`, `high_speed = 800 dHz`, 10 um per cycle at
/// 500 dHz feedback.
#[allow(unused)]
pub fn positioning_config() -> DriveConfig {
    DriveConfig {
        positioner: PositionerConfig {
            cycle_time: Duration::from_millis(1),
            displacement_per_revolution: 200,
            resolution: 10,
            homing_travel_speed: Some(10.0),
            homing_sensor: Some(DigitalInput::Di3),
            positive_limit_switch: Some(DigitalInput::Di1),
            negative_limit_switch: Some(DigitalInput::Di2),
            ..PositionerConfig::default()
        },
        ..DriveConfig::default()
    }
}

#[allow(unused)]
impl Harness {
    pub fn new(config: DriveConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        Self {
            drive: Atv320Drive::new(1, config),
            input: InputPdo {
                status_word: status::OPERATION_ENABLED,
                ..InputPdo::default()
            },
        }
    }

    /// Claim the drive for `caller` so commands take the orchestrator path.
    pub fn connect_peer(&self, caller: &str) {
        assert!(self.drive.surface().ping(caller, false));
    }

    pub fn set_status(&mut self, status_word: u16) {
        self.input.status_word = status_word;
    }

    pub fn set_frequency(&mut self, decihertz: i16) {
        self.input.frequency = decihertz;
    }

    pub fn set_fault(&mut self, error: atv320::pdo::Lft) {
        self.input.status_word = status::FAULT;
        self.input.last_error = error;
        self.input.drive_state = atv320::pdo::Hmis::Fault;
    }

    pub fn set_digital_input(&mut self, channel: DigitalInput, level: bool) {
        if level {
            self.input.digital_inputs |= channel.mask();
        } else {
            self.input.digital_inputs &= !channel.mask();
        }
    }

    /// Let pending command futures make progress.
    pub async fn settle(&self) {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    /// One full process data cycle through the raw wire representation.
    pub async fn cycle(&mut self) -> OutputPdo {
        // Commands issued since the last cycle latch their intent first
        self.settle().await;

        let mut input = [0u8; InputPdo::LEN];
        self.input.pack_to_slice(&mut input).expect("pack input");
        let mut output = [0u8; OutputPdo::LEN];

        self.drive.pdo_cycle(&input, &mut output);

        let out = OutputPdo::unpack_from_slice(&output).expect("unpack output");

        self.settle().await;

        out
    }

    /// Run `count` cycles, returning the last output.
    pub async fn cycles(&mut self, count: usize) -> OutputPdo {
        let mut out = OutputPdo::default();
        for _ in 0..count {
            out = self.cycle().await;
        }

        out
    }
}
