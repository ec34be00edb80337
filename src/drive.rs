//! Per cycle PDO handling for one ATV320.
//!
//! [`Atv320Drive`] sits between the EtherCAT master and the motion layer.
//! The master calls [`Atv320Drive::pdo_cycle`] with the raw cyclic data every
//! cycle and [`Atv320Drive::pdo_error`] when the drive stops answering;
//! everything else (status publishing, fault bookkeeping, control word and
//! reference computation) happens here.

use crate::{
    cia402::{self, State, StatusWord, TransitionAction},
    config::DriveConfig,
    controller::{Controller, RESET_WINDOW},
    pdo::{Hmis, InputPdo, Lft, OutputPdo},
    sdo::{self, SdoWrite},
    speedratio,
    status::StatusSignals,
    surface::CommandSurface,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

/// EtherCAT identity of the ATV320.
pub const VENDOR_ID: u32 = 0x0800_005a;
/// EtherCAT product code of the ATV320.
pub const PRODUCT_CODE: u32 = 0x389;

/// Fault codes the drive may recover from without an operator acknowledging
/// the reset.
const AUTO_RESET_ERRORS: [Lft; 2] = [Lft::NoFault, Lft::Cnf];

/// Cyclic and acyclic glue for a single ATV320 drive.
pub struct Atv320Drive {
    slave: u16,
    config: DriveConfig,
    controller: Controller,
    surface: CommandSurface,
    status: StatusSignals,
    /// Last faults reported by the drive, newest first.
    last_errors: heapless::Deque<Lft, 10>,
    /// Reference frequency used while no peer is connected, deci-hertz.
    reference_frequency: i16,
    /// Run intent from the plain IO layer, effective while no peer is
    /// connected.
    ipc_running: AtomicBool,
    /// Externally requested fault reset permission.
    allow_reset: AtomicBool,
    /// When the external reset permission expires.
    reset_deadline: Option<Instant>,
    no_data: bool,
    pending_sdo: Vec<SdoWrite>,
}

impl Atv320Drive {
    /// Create the handler for the drive at `slave`.
    pub fn new(slave: u16, config: DriveConfig) -> Self {
        let controller = Controller::new(slave, config.positioner.clone());
        controller.set_configured_speedratio(config.default_speedratio);
        controller.set_motor_nominal_frequency(config.nominal_motor_frequency);

        let surface = CommandSurface::new(controller.clone(), config.default_speedratio);
        let reference_frequency = speedratio::to_deci_frequency(
            config.default_speedratio,
            config.low_speed,
            config.high_speed,
        );

        Self {
            slave,
            config,
            controller,
            surface,
            status: StatusSignals::new(),
            last_errors: heapless::Deque::new(),
            reference_frequency,
            ipc_running: AtomicBool::new(false),
            allow_reset: AtomicBool::new(false),
            reset_deadline: None,
            no_data: false,
            pending_sdo: Vec::new(),
        }
    }

    /// The SDO downloads to perform before cyclic operation starts.
    pub fn startup_writes(&self) -> Vec<SdoWrite> {
        sdo::startup_writes(&self.config)
    }

    /// Handle one process data cycle from the raw cyclic data.
    pub fn pdo_cycle(&mut self, input: &[u8], output: &mut [u8]) {
        let Some(input) = InputPdo::parse(input) else {
            log::warn!("atv320.s{}: input PDO length is not {}", self.slave, InputPdo::LEN);
            return;
        };

        let out = self.cycle(&input);

        if !out.write_to(output) {
            log::warn!(
                "atv320.s{}: output PDO length is not {}",
                self.slave,
                OutputPdo::LEN
            );
        }
    }

    /// Handle one process data cycle on parsed data.
    pub fn cycle(&mut self, input: &InputPdo) -> OutputPdo {
        self.no_data = false;

        let state = StatusWord::from_bits_retain(input.status_word).parse_state();
        let drive_in_fault_state = state == State::Fault;
        let newest = self.newest_error();

        if drive_in_fault_state && newest != input.last_error && input.last_error != Lft::NoFault {
            self.record_error(input.last_error);
            let auto_reset = AUTO_RESET_ERRORS.contains(&input.last_error);
            log::error!(
                "atv320.s{}: new fault detected: {:?}, will try to auto reset: {}",
                self.slave,
                input.last_error,
                auto_reset
            );
        } else if drive_in_fault_state && input.last_error == Lft::NoFault {
            log::warn!(
                "atv320.s{}: drive reports fault state but last fault is not set",
                self.slave
            );
        } else if input.last_error != newest {
            log::warn!(
                "atv320.s{}: not in fault state but reporting fault: {:?}, state: {}",
                self.slave,
                input.last_error,
                state
            );
            self.record_error(input.last_error);
        }

        self.status.publish(input);
        self.controller.update_status(input);

        let auto_reset_allowed = drive_in_fault_state
            && (AUTO_RESET_ERRORS.contains(&input.last_error)
                || self.allow_reset.load(Ordering::Relaxed));

        let mut out = OutputPdo::default();

        if !self.surface.has_peer() {
            let mut action = TransitionAction::None;
            if self.ipc_running.load(Ordering::Relaxed) {
                action = TransitionAction::Run;
            }
            // Quick stop when the reference is zero
            if self.reference_frequency == 0 {
                action = TransitionAction::QuickStop;
            }

            out.acceleration = self.config.acceleration;
            out.deceleration = self.config.deceleration;
            out.control_word = cia402::transition(state, action, auto_reset_allowed).bits();
            out.frequency = self.reference_frequency;
        } else {
            out.frequency = speedratio::to_deci_frequency(
                self.controller.speed_ratio(),
                self.config.low_speed,
                self.config.high_speed,
            );
            out.acceleration = self.controller.acceleration(self.config.acceleration);
            out.deceleration = self.controller.deceleration(self.config.deceleration);
            out.control_word = self.controller.control_word(auto_reset_allowed).bits();

            // The IO layer must raise its run intent again after the peer
            // disconnects
            self.ipc_running.store(false, Ordering::Relaxed);
        }

        // Lower the externally requested reset permission after its window
        if self.allow_reset.load(Ordering::Relaxed)
            && self
                .reset_deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
        {
            self.allow_reset.store(false, Ordering::Relaxed);
            self.reset_deadline = None;
        }

        out
    }

    /// Handle loss of contact with the drive.
    ///
    /// Publishes a synthetic fault status so pending commands fail with a
    /// communication fault instead of hanging.
    pub fn pdo_error(&mut self) {
        if !self.no_data {
            let synthetic = InputPdo {
                status_word: StatusWord::FAULT.bits(),
                frequency: 0,
                current: 0,
                digital_inputs: 0,
                last_error: Lft::Cnf,
                drive_state: Hmis::Fault,
            };

            self.status.publish(&synthetic);
            self.controller.update_status(&synthetic);
            log::error!("atv320.s{}: frequency drive lost contact", self.slave);
        }

        self.no_data = true;
    }

    /// Run intent from the plain IO layer. Only effective while no peer is
    /// connected.
    pub fn set_ipc_run(&self, run: bool) {
        self.ipc_running.store(run, Ordering::Relaxed);
    }

    /// Externally permit (or withdraw) a fault reset, for example from an
    /// operator acknowledge input. Auto expires after [`RESET_WINDOW`].
    pub fn set_reset_input(&mut self, allow: bool) {
        self.allow_reset.store(allow, Ordering::Relaxed);
        self.reset_deadline = allow.then(|| Instant::now() + RESET_WINDOW);
    }

    /// Replace the configured default speed ratio.
    ///
    /// Values inside the dead band are rejected; they would command a
    /// permanent quick stop.
    pub fn set_default_speedratio(&mut self, speedratio: f64) {
        if speedratio::in_dead_band(speedratio) {
            log::warn!(
                "atv320.s{}: invalid default speedratio: {speedratio}",
                self.slave
            );
            return;
        }

        self.config.default_speedratio = speedratio;
        self.reference_frequency = speedratio::to_deci_frequency(
            speedratio,
            self.config.low_speed,
            self.config.high_speed,
        );
        self.controller.set_configured_speedratio(speedratio);
        self.surface.set_configured_speedratio(speedratio);
    }

    /// Apply a new configuration, queueing the SDO writes for the changed
    /// nameplate parameters.
    ///
    /// Heavy SDO traffic can delay the cycle; prefer commissioning the drive
    /// while the fieldbus is idle.
    pub fn update_config(&mut self, new: DriveConfig) {
        let writes = new.diff(&self.config);
        if !writes.is_empty() {
            log::warn!(
                "atv320.s{}: live configuration change queues {} SDO writes",
                self.slave,
                writes.len()
            );
        }
        self.pending_sdo.extend(writes);

        self.controller
            .set_configured_speedratio(new.default_speedratio);
        self.controller
            .set_motor_nominal_frequency(new.nominal_motor_frequency);
        self.surface
            .set_configured_speedratio(new.default_speedratio);
        self.reference_frequency = speedratio::to_deci_frequency(
            new.default_speedratio,
            new.low_speed,
            new.high_speed,
        );
        self.config = new;
    }

    /// Drain the SDO writes queued by configuration changes. Called by the
    /// master between cycles.
    pub fn take_pending_sdo_writes(&mut self) -> Vec<SdoWrite> {
        std::mem::take(&mut self.pending_sdo)
    }

    /// Fault history, newest first.
    pub fn fault_history(&self) -> impl Iterator<Item = Lft> + '_ {
        self.last_errors.iter().copied()
    }

    /// The motion orchestrator of this drive.
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// The remote command surface of this drive.
    pub fn surface(&self) -> &CommandSurface {
        &self.surface
    }

    /// Published status signals of this drive.
    pub fn status(&self) -> &StatusSignals {
        &self.status
    }

    /// Current configuration.
    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    fn newest_error(&self) -> Lft {
        self.last_errors.front().copied().unwrap_or(Lft::NoFault)
    }

    fn record_error(&mut self, error: Lft) {
        if self.last_errors.is_full() {
            self.last_errors.pop_back();
        }
        let _ = self.last_errors.push_front(error);
    }
}
