//! Asynchronous motion command orchestrator.
//!
//! One [`Controller`] owns the motion intent of one drive. Commands are
//! futures; each one races its progress condition against drive errors,
//! limit switches and supersession by the next command. The cyclic layer
//! feeds drive status in through [`Controller::update_status`] and reads the
//! resulting intent back out through [`Controller::control_word`] and
//! [`Controller::speed_ratio`] when composing the output process data.
//!
//! At most one command is pending at any time. Creating a new command future
//! immediately supersedes the previous command, whose completion is
//! [`ErrorKind::OperationCanceled`]; the new intent takes effect in the next
//! cycle's output.

use crate::{
    cia402::{self, ControlWord, State, StatusWord, TransitionAction},
    error::ErrorKind,
    pdo::{InputPdo, Lft},
    positioner::{LimitSide, Positioner, PositionerConfig},
    speedratio,
};
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{Notify, watch};

/// How long a fault reset stays permitted before it is lowered again.
pub const RESET_WINDOW: Duration = Duration::from_secs(5);

#[derive(Default)]
struct MotionIntent {
    action: TransitionAction,
    /// Commanded speed ratio in percent.
    speed_ratio: f64,
    /// Speed ratio backing commands that do not carry their own.
    configured_speedratio: f64,
    /// Last observed status word.
    status_word: StatusWord,
    /// Last observed output frequency, deci-hertz.
    frequency: i16,
    /// Nominal motor frequency, deci-hertz.
    nominal_frequency: u16,
    /// Fault reset currently requested by a `reset` command.
    reset_allowed: bool,
    drive_error: ErrorKind,
    limit_error: ErrorKind,
    positive_limit: bool,
    negative_limit: bool,
    /// Commands currently awaiting a homing edge.
    homing_waiters: u32,
}

impl MotionIntent {
    /// The limit error blocking motion in the given direction, if any.
    fn limit_for(&self, positive: bool) -> ErrorKind {
        match (positive, self.limit_error) {
            (true, ErrorKind::PositioningPositiveLimitReached) => self.limit_error,
            (false, ErrorKind::PositioningNegativeLimitReached) => self.limit_error,
            _ => ErrorKind::Success,
        }
    }
}

struct Shared {
    slave: u16,
    positioner: Positioner,
    intent: Mutex<MotionIntent>,
    /// Bumped by every new command; pending commands watch for the change.
    generation: watch::Sender<u64>,
    /// Signalled when a drive or limit error is raised.
    error_raised: Notify,
    /// Signalled every cycle the drive reports zero frequency.
    stop_complete: Notify,
    /// Signalled on homing sensor rising edges.
    homing_complete: Notify,
    /// Signalled every cycle the drive reports no error.
    fault_cleared: Notify,
}

/// Motion command orchestrator for a single drive.
///
/// Cheap to clone; clones share the same pending command slot.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    /// Create an orchestrator for the drive at `slave`.
    pub fn new(slave: u16, positioner: PositionerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                slave,
                positioner: Positioner::new(positioner),
                intent: Mutex::new(MotionIntent::default()),
                generation: watch::channel(0).0,
                error_raised: Notify::new(),
                stop_complete: Notify::new(),
                homing_complete: Notify::new(),
                fault_cleared: Notify::new(),
            }),
        }
    }

    /// Run the motor at `speedratio` percent until an error or the next
    /// command stops it.
    pub fn run(&self, speedratio: f64) -> impl Future<Output = ErrorKind> + 'static {
        log::trace!("atv320.s{}: run at speedratio: {speedratio}", self.slave());
        let generation = self.supersede();
        let ctrl = self.clone();

        async move { ctrl.run_impl(generation, speedratio).await }
    }

    /// Run the motor for a duration, then stop it.
    pub fn run_for(
        &self,
        speedratio: f64,
        duration: Duration,
    ) -> impl Future<Output = ErrorKind> + 'static {
        log::trace!(
            "atv320.s{}: run at speedratio: {speedratio} for: {duration:?}",
            self.slave()
        );
        let generation = self.supersede();
        let ctrl = self.clone();

        async move {
            if duration.is_zero() {
                return ErrorKind::Success;
            }
            if let Err(err) = ctrl.start_motion(speedratio) {
                return err;
            }

            let err = ctrl
                .race(generation, Some(speedratio > 0.0), tokio::time::sleep(duration))
                .await;
            if err == ErrorKind::OperationCanceled {
                return err;
            }

            let stop_err = ctrl.stop_impl(generation, false).await;
            if err != ErrorKind::Success { err } else { stop_err }
        }
    }

    /// Ramp the motor down on the deceleration ramp.
    pub fn stop(&self) -> impl Future<Output = ErrorKind> + 'static {
        log::trace!("atv320.s{}: stop", self.slave());
        let generation = self.supersede();
        let ctrl = self.clone();

        async move { ctrl.stop_impl(generation, false).await }
    }

    /// Ramp the motor down on the quick stop ramp.
    pub fn quick_stop(&self) -> impl Future<Output = ErrorKind> + 'static {
        log::trace!("atv320.s{}: quick stop", self.slave());
        let generation = self.supersede();
        let ctrl = self.clone();

        async move { ctrl.stop_impl(generation, true).await }
    }

    /// Move a relative distance in micrometres, then stop.
    ///
    /// The sign of `travel` picks the direction; the magnitude of
    /// `speedratio` picks the speed. Completes with the actually travelled
    /// distance, measured from command entry.
    pub fn convey(
        &self,
        speedratio: f64,
        travel: i64,
    ) -> impl Future<Output = (ErrorKind, i64)> + 'static {
        log::trace!(
            "atv320.s{}: convey at speedratio: {speedratio} travel: {travel} um",
            self.slave()
        );
        let generation = self.supersede();
        let ctrl = self.clone();

        async move {
            if travel == 0 {
                return (ErrorKind::Success, 0);
            }

            let start = ctrl.shared.positioner.position();
            let positive = travel > 0;
            let signed = if positive { speedratio } else { -speedratio };

            let err = match ctrl.start_motion(signed) {
                Err(err) => err,
                Ok(()) => {
                    let reached = ctrl.shared.positioner.notify_after(travel);
                    ctrl.race(generation, Some(positive), async move {
                        let _ = reached.await;
                    })
                    .await
                }
            };

            if err == ErrorKind::OperationCanceled {
                return (err, ctrl.shared.positioner.position() - start);
            }

            let stop_err = ctrl.stop_impl(generation, false).await;
            let travelled = ctrl.shared.positioner.position() - start;
            log::trace!(
                "atv320.s{}: convey travelled: {travelled} um of {travel} um",
                ctrl.slave()
            );

            let err = if err != ErrorKind::Success { err } else { stop_err };
            (err, travelled)
        }
    }

    /// Move to an absolute placement relative to the home reference, in
    /// micrometres. Completes with the final position from home.
    ///
    /// Fails fast when no valid home reference exists or the move would
    /// exhaust the homing travel budget.
    pub fn move_to(
        &self,
        speedratio: f64,
        placement: i64,
    ) -> impl Future<Output = (ErrorKind, i64)> + 'static {
        log::trace!(
            "atv320.s{}: move at speedratio: {speedratio} to: {placement} um",
            self.slave()
        );
        let generation = self.supersede();
        let ctrl = self.clone();

        async move {
            let positioner = &ctrl.shared.positioner;
            let Some(from_home) = positioner.position_from_home() else {
                return (ErrorKind::MotorMissingHomeReference, 0);
            };
            if positioner.needs_homing() {
                return (ErrorKind::MotorMissingHomeReference, from_home);
            }
            if positioner.would_need_homing(placement - from_home) {
                log::trace!(
                    "atv320.s{}: moving to {placement} um would need homing",
                    ctrl.slave()
                );
                return (ErrorKind::MotorMissingHomeReference, from_home);
            }
            if (placement - from_home).abs() <= positioner.resolution() {
                log::trace!(
                    "atv320.s{}: already within resolution of {placement} um",
                    ctrl.slave()
                );
                return (ErrorKind::Success, placement);
            }

            let positive = placement > from_home;
            let signed = if positive { speedratio } else { -speedratio };

            let err = match ctrl.start_motion(signed) {
                Err(err) => err,
                Ok(()) => match positioner.notify_from_home(placement) {
                    None => ErrorKind::MotorMissingHomeReference,
                    Some(reached) => {
                        ctrl.race(generation, Some(positive), async move {
                            let _ = reached.await;
                        })
                        .await
                    }
                },
            };

            if err == ErrorKind::OperationCanceled {
                let now = positioner.position_from_home().unwrap_or(0);
                return (err, now);
            }

            let stop_err = ctrl.stop_impl(generation, true).await;
            let now = positioner.position_from_home().unwrap_or(0);
            log::trace!(
                "atv320.s{}: move stopped at: {now} um, target was: {placement} um",
                ctrl.slave()
            );

            let err = if err != ErrorKind::Success { err } else { stop_err };
            (err, now)
        }
    }

    /// Drive into the homing sensor and record the home reference.
    ///
    /// Completes immediately when the sensor already reads active; fails
    /// when no homing sensor or homing speed is configured.
    pub fn move_home(&self) -> impl Future<Output = ErrorKind> + 'static {
        log::trace!("atv320.s{}: move home", self.slave());
        let generation = self.supersede();
        let ctrl = self.clone();

        async move {
            let positioner = &ctrl.shared.positioner;
            let (Some(speed), Some(sensor_level)) = (
                positioner.homing_travel_speed(),
                positioner.homing_sensor_level(),
            ) else {
                return ErrorKind::MotorHomeSensorUnconfigured;
            };

            if sensor_level {
                let at = positioner.position();
                log::info!(
                    "atv320.s{}: already at home, storing position: {at} um",
                    ctrl.slave()
                );
                positioner.home(at);
                return ErrorKind::Success;
            }

            let waiting = ctrl.begin_homing_wait();
            let err = match ctrl.start_motion(speed) {
                Err(err) => err,
                Ok(()) => {
                    ctrl.race(generation, Some(speed > 0.0), ctrl.homing_edge())
                        .await
                }
            };
            drop(waiting);

            if err == ErrorKind::OperationCanceled {
                log::trace!("atv320.s{}: move home superseded", ctrl.slave());
                return err;
            }

            let at = positioner.position();
            let stop_err = ctrl.stop_impl(generation, true).await;
            if err == ErrorKind::Success {
                log::trace!("atv320.s{}: storing home position: {at} um", ctrl.slave());
                positioner.home(at);
            }

            if err != ErrorKind::Success { err } else { stop_err }
        }
    }

    /// Complete once the motor has travelled `travel` micrometres in the
    /// sign of `travel`. Commands no motion.
    pub fn notify_after(&self, travel: i64) -> impl Future<Output = ErrorKind> + 'static {
        log::trace!("atv320.s{}: notify after: {travel} um", self.slave());
        let generation = self.supersede();
        let ctrl = self.clone();

        async move {
            if travel == 0 {
                return ErrorKind::Success;
            }

            let reached = ctrl.shared.positioner.notify_after(travel);
            ctrl.race(generation, None, async move {
                let _ = reached.await;
            })
            .await
        }
    }

    /// Complete once the position from home crosses `placement` micrometres.
    /// Commands no motion.
    pub fn notify_from_home(
        &self,
        placement: i64,
    ) -> impl Future<Output = (ErrorKind, i64)> + 'static {
        log::trace!("atv320.s{}: notify from home: {placement} um", self.slave());
        let generation = self.supersede();
        let ctrl = self.clone();

        async move {
            let Some(reached) = ctrl.shared.positioner.notify_from_home(placement) else {
                return (ErrorKind::MotorMissingHomeReference, 0);
            };

            let err = ctrl
                .race(generation, None, async move {
                    let _ = reached.await;
                })
                .await;
            (err, placement)
        }
    }

    /// Permit a fault reset for up to [`RESET_WINDOW`].
    ///
    /// A no-op when the drive is not in the fault state. Completes when the
    /// drive leaves the fault state or the window elapses, reporting the
    /// then current drive error.
    pub fn reset(&self) -> impl Future<Output = ErrorKind> + 'static {
        log::trace!("atv320.s{}: reset", self.slave());
        let generation = self.supersede();
        let ctrl = self.clone();

        async move {
            {
                let intent = ctrl.shared.intent.lock().unwrap();
                if intent.status_word.parse_state() != State::Fault {
                    return ErrorKind::Success;
                }
            }

            ctrl.shared.intent.lock().unwrap().reset_allowed = true;

            tokio::select! {
                biased;
                _ = ctrl.superseded(generation) => {
                    ctrl.shared.intent.lock().unwrap().reset_allowed = false;
                    return ErrorKind::OperationCanceled;
                }
                _ = ctrl.cleared() => {}
                _ = tokio::time::sleep(RESET_WINDOW) => {}
            }

            let mut intent = ctrl.shared.intent.lock().unwrap();
            intent.reset_allowed = false;
            intent.drive_error
        }
    }

    /// Whether positioning commands would currently be rejected for a
    /// missing home reference.
    pub fn needs_homing(&self) -> ErrorKind {
        if self.shared.positioner.needs_homing() {
            ErrorKind::MotorMissingHomeReference
        } else {
            ErrorKind::Success
        }
    }

    /// Feed one cycle of drive status into the orchestrator.
    ///
    /// Latches drive and limit errors, integrates the positioner, dispatches
    /// sensor edges and wakes pending commands.
    pub fn update_status(&self, input: &InputPdo) {
        let status = StatusWord::from_bits_retain(input.status_word);
        {
            let mut intent = self.shared.intent.lock().unwrap();
            intent.status_word = status;
            intent.frequency = input.frequency;
        }

        self.shared.positioner.freq_update(input.frequency);

        let changes = self
            .shared
            .positioner
            .update_digital_inputs(input.digital_inputs);
        if let Some(level) = changes.homing {
            self.on_homing_sensor(level);
        }
        if let Some(level) = changes.positive_limit {
            self.on_limit_switch(LimitSide::Positive, level);
        }
        if let Some(level) = changes.negative_limit {
            self.on_limit_switch(LimitSide::Negative, level);
        }

        if input.frequency == 0 {
            self.shared.stop_complete.notify_waiters();
        }

        let drive_error = match status.parse_state() {
            State::Fault | State::FaultReactionActive => {
                if input.last_error == Lft::Cnf {
                    ErrorKind::FrequencyDriveCommunicationFault
                } else {
                    ErrorKind::FrequencyDriveReportsFault
                }
            }
            _ => ErrorKind::Success,
        };

        self.shared.intent.lock().unwrap().drive_error = drive_error;
        if drive_error != ErrorKind::Success {
            self.shared.error_raised.notify_waiters();
        } else {
            self.shared.fault_cleared.notify_waiters();
        }
    }

    /// Control word for the next output cycle.
    ///
    /// A run intent inside the speed ratio dead band is downgraded to no
    /// action, holding the drive enabled at a zero reference.
    pub fn control_word(&self, external_reset_allowed: bool) -> ControlWord {
        let intent = self.shared.intent.lock().unwrap();
        let reset_allowed = intent.reset_allowed || external_reset_allowed;

        let action = if intent.action == TransitionAction::Run
            && speedratio::in_dead_band(intent.speed_ratio)
        {
            TransitionAction::None
        } else {
            intent.action
        };

        cia402::transition(intent.status_word.parse_state(), action, reset_allowed)
    }

    /// Currently commanded speed ratio, percent.
    pub fn speed_ratio(&self) -> f64 {
        self.shared.intent.lock().unwrap().speed_ratio
    }

    /// Currently commanded transition action.
    pub fn action(&self) -> TransitionAction {
        self.shared.intent.lock().unwrap().action
    }

    /// Acceleration ramp for the next output cycle, deci-seconds.
    ///
    /// Hook for per command ramp shaping; currently passes the configured
    /// ramp through.
    pub fn acceleration(&self, configured: u16) -> u16 {
        configured
    }

    /// Deceleration ramp for the next output cycle, deci-seconds.
    pub fn deceleration(&self, configured: u16) -> u16 {
        configured
    }

    /// Latched drive error.
    pub fn drive_error(&self) -> ErrorKind {
        self.shared.intent.lock().unwrap().drive_error
    }

    /// Latched limit switch error.
    pub fn limit_error(&self) -> ErrorKind {
        self.shared.intent.lock().unwrap().limit_error
    }

    /// The positioner owned by this orchestrator.
    pub fn positioner(&self) -> &Positioner {
        &self.shared.positioner
    }

    /// Update the configured default speed ratio.
    ///
    /// A running command that was started from the old default follows the
    /// new one.
    pub fn set_configured_speedratio(&self, speedratio: f64) {
        let mut intent = self.shared.intent.lock().unwrap();
        let old = intent.configured_speedratio;
        intent.configured_speedratio = speedratio;
        if intent.action == TransitionAction::Run && intent.speed_ratio == old {
            intent.speed_ratio = speedratio;
        }
    }

    /// Configured default speed ratio, percent.
    pub fn configured_speedratio(&self) -> f64 {
        self.shared.intent.lock().unwrap().configured_speedratio
    }

    /// Store the nominal motor frequency, deci-hertz.
    pub fn set_motor_nominal_frequency(&self, frequency: u16) {
        self.shared.intent.lock().unwrap().nominal_frequency = frequency;
    }

    /// Nominal motor frequency, deci-hertz.
    pub fn motor_nominal_frequency(&self) -> u16 {
        self.shared.intent.lock().unwrap().nominal_frequency
    }

    fn slave(&self) -> u16 {
        self.shared.slave
    }

    /// Cancel the pending command and claim the command slot.
    fn supersede(&self) -> u64 {
        let mut generation = 0;
        self.shared.generation.send_modify(|value| {
            *value += 1;
            generation = *value;
        });

        generation
    }

    /// Resolves once a newer command has claimed the slot.
    async fn superseded(&self, generation: u64) {
        let mut rx = self.shared.generation.subscribe();
        while *rx.borrow_and_update() == generation {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Validate and latch a run intent.
    fn start_motion(&self, speedratio: f64) -> Result<(), ErrorKind> {
        let mut intent = self.shared.intent.lock().unwrap();
        if intent.drive_error != ErrorKind::Success {
            log::trace!("atv320.s{}: drive in fault state, cannot run", self.slave());
            return Err(intent.drive_error);
        }
        speedratio::validate(speedratio)?;

        let limit = intent.limit_for(speedratio > 0.0);
        if limit != ErrorKind::Success {
            log::trace!("atv320.s{}: direction forbidden by {limit}", self.slave());
            return Err(limit);
        }

        intent.action = TransitionAction::Run;
        intent.speed_ratio = speedratio;

        Ok(())
    }

    async fn run_impl(&self, generation: u64, speedratio: f64) -> ErrorKind {
        if let Err(err) = self.start_motion(speedratio) {
            return err;
        }

        // Plain run has no progress condition; it resolves through errors,
        // limits or supersession, then winds the motor down.
        let err = self
            .race(
                generation,
                Some(speedratio > 0.0),
                std::future::pending::<()>(),
            )
            .await;
        if err == ErrorKind::OperationCanceled {
            return err;
        }

        let stop_err = self.stop_impl(generation, false).await;
        if err != ErrorKind::Success { err } else { stop_err }
    }

    async fn stop_impl(&self, generation: u64, use_quick_stop: bool) -> ErrorKind {
        {
            let mut intent = self.shared.intent.lock().unwrap();
            intent.action = if use_quick_stop {
                TransitionAction::QuickStop
            } else {
                TransitionAction::Stop
            };
            intent.speed_ratio = 0.0;

            if intent.drive_error != ErrorKind::Success {
                // The caller must learn the drive is latched even though the
                // command is a stop.
                log::trace!(
                    "atv320.s{}: drive in fault state, stop reports: {}",
                    self.slave(),
                    intent.drive_error
                );
                return intent.drive_error;
            }
            if intent.frequency == 0 {
                log::trace!("atv320.s{}: drive already stopped", self.slave());
                return ErrorKind::Success;
            }
        }

        self.race(generation, None, self.zero_frequency()).await
    }

    /// Race a progress condition against supersession and errors.
    ///
    /// `limit_sign` selects which limit switch aborts the wait: `Some(true)`
    /// for positive direction motion, `Some(false)` for negative,
    /// `None` when only drive errors apply. Errors win ties against
    /// progress resolved in the same cycle.
    async fn race<F>(&self, generation: u64, limit_sign: Option<bool>, progress: F) -> ErrorKind
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(progress);

        tokio::select! {
            biased;
            _ = self.superseded(generation) => ErrorKind::OperationCanceled,
            err = self.error_raised(limit_sign) => err,
            _ = &mut progress => self.current_error(limit_sign),
        }
    }

    /// The error that currently applies to a wait, or success.
    fn current_error(&self, limit_sign: Option<bool>) -> ErrorKind {
        let intent = self.shared.intent.lock().unwrap();
        if intent.drive_error != ErrorKind::Success {
            return intent.drive_error;
        }
        match limit_sign {
            Some(positive) => intent.limit_for(positive),
            None => ErrorKind::Success,
        }
    }

    /// Resolves once an applicable drive or limit error is latched.
    async fn error_raised(&self, limit_sign: Option<bool>) -> ErrorKind {
        loop {
            // Register before checking; the cycle handler may notify from
            // another thread.
            let mut notified = std::pin::pin!(self.shared.error_raised.notified());
            notified.as_mut().enable();

            let err = self.current_error(limit_sign);
            if err != ErrorKind::Success {
                return err;
            }
            notified.await;
        }
    }

    /// Resolves on the next cycle reporting zero output frequency.
    async fn zero_frequency(&self) {
        loop {
            let mut notified = std::pin::pin!(self.shared.stop_complete.notified());
            notified.as_mut().enable();

            if self.shared.intent.lock().unwrap().frequency == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Resolves on the next homing sensor rising edge.
    async fn homing_edge(&self) {
        self.shared.homing_complete.notified().await;
    }

    /// Resolves on the next cycle with no latched drive error.
    async fn cleared(&self) {
        loop {
            let mut notified = std::pin::pin!(self.shared.fault_cleared.notified());
            notified.as_mut().enable();

            if self.shared.intent.lock().unwrap().drive_error == ErrorKind::Success {
                return;
            }
            notified.await;
        }
    }

    /// Mark a command as waiting for the homing edge for as long as the
    /// returned guard lives.
    fn begin_homing_wait(&self) -> HomingWait<'_> {
        self.shared.intent.lock().unwrap().homing_waiters += 1;

        HomingWait {
            shared: &self.shared,
        }
    }

    fn on_homing_sensor(&self, level: bool) {
        log::trace!("atv320.s{}: homing sensor: {level}", self.slave());
        if level {
            self.shared.homing_complete.notify_waiters();
        }
    }

    fn on_limit_switch(&self, side: LimitSide, level: bool) {
        log::trace!("atv320.s{}: {side:?} limit switch: {level}", self.slave());

        let awaiting_homing = {
            let mut intent = self.shared.intent.lock().unwrap();
            match side {
                LimitSide::Positive => intent.positive_limit = level,
                LimitSide::Negative => intent.negative_limit = level,
            }
            intent.homing_waiters > 0
        };

        // A rising edge on a channel shared with the homing sensor is
        // consumed as homing while a homing command is waiting; it must not
        // raise a limit error.
        if level && awaiting_homing && self.shared.positioner.homing_shares_channel(side) {
            self.shared.homing_complete.notify_waiters();
            return;
        }

        let error = match side {
            LimitSide::Positive => ErrorKind::PositioningPositiveLimitReached,
            LimitSide::Negative => ErrorKind::PositioningNegativeLimitReached,
        };

        let mut intent = self.shared.intent.lock().unwrap();
        if level {
            intent.limit_error = error;
            drop(intent);
            self.shared.error_raised.notify_waiters();
        } else if !intent.positive_limit && !intent.negative_limit {
            intent.limit_error = ErrorKind::Success;
        }
    }
}

/// Keeps the homing waiter count accurate even when the owning command
/// future is dropped mid wait.
struct HomingWait<'a> {
    shared: &'a Shared,
}

impl Drop for HomingWait<'_> {
    fn drop(&mut self) {
        let mut intent = self.shared.intent.lock().unwrap();
        intent.homing_waiters = intent.homing_waiters.saturating_sub(1);
    }
}
