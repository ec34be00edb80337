//! Remote command surface.
//!
//! External callers reach the motor through this adapter. A single peer model
//! applies: the first caller to [`CommandSurface::ping`] claims the motor and
//! keeps it by pinging within the lease; every other caller is rejected with
//! [`ErrorKind::PermissionDenied`] until the peer disconnects. When the lease
//! expires the motor is stopped unconditionally and the surface becomes
//! available again.
//!
//! The concrete RPC wiring (message bus, RPC framework) is out of scope; the
//! adapter works in terms of opaque caller identities.

use crate::{controller::Controller, error::ErrorKind, speedratio::Direction};
use std::{
    future::Future,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::watch,
    time::{Instant, sleep_until},
};

/// Lease granted by a regular ping.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(15);

/// Lease granted by a long living ping. Meant for commissioning sessions
/// only, never for programs.
pub const LONG_LIVING_PEER_TIMEOUT: Duration = Duration::from_secs(60 * 60);

struct SurfaceShared {
    controller: Controller,
    peer: Mutex<Option<String>>,
    /// Current lease deadline, `None` while no peer is connected.
    lease: watch::Sender<Option<Instant>>,
    connected_peer: watch::Sender<String>,
    default_speedratio: Mutex<f64>,
    watchdog_running: AtomicBool,
}

/// Single peer command adapter in front of a [`Controller`].
///
/// Cheap to clone.
#[derive(Clone)]
pub struct CommandSurface {
    shared: Arc<SurfaceShared>,
}

impl CommandSurface {
    /// Create a surface routing commands to `controller`.
    pub fn new(controller: Controller, default_speedratio: f64) -> Self {
        Self {
            shared: Arc::new(SurfaceShared {
                controller,
                peer: Mutex::new(None),
                lease: watch::channel(None).0,
                connected_peer: watch::channel(String::new()).0,
                default_speedratio: Mutex::new(default_speedratio),
                watchdog_running: AtomicBool::new(false),
            }),
        }
    }

    /// Claim the motor or refresh the lease.
    ///
    /// Returns `false` when another peer currently holds the motor. Must be
    /// called from within a tokio runtime; the first successful ping spawns
    /// the lease watchdog.
    pub fn ping(&self, caller: &str, long_living: bool) -> bool {
        {
            let mut peer = self.shared.peer.lock().unwrap();
            let new_peer = match peer.as_deref() {
                Some(current) if current != caller => return false,
                Some(_) => false,
                None => true,
            };

            if new_peer {
                log::info!("Peer connected: {caller}");
                *peer = Some(caller.to_owned());
                self.shared.connected_peer.send_replace(caller.to_owned());
            }
        }

        let lease = if long_living {
            LONG_LIVING_PEER_TIMEOUT
        } else {
            PEER_TIMEOUT
        };
        self.shared.lease.send_replace(Some(Instant::now() + lease));
        self.ensure_watchdog();

        true
    }

    /// `true` while a peer holds the motor.
    pub fn has_peer(&self) -> bool {
        self.shared.peer.lock().unwrap().is_some()
    }

    /// The connected peer identity, empty while disconnected.
    pub fn connected_peer(&self) -> watch::Receiver<String> {
        self.shared.connected_peer.subscribe()
    }

    /// Run in the given direction at the configured default speed ratio.
    pub fn run(
        &self,
        caller: &str,
        direction: Direction,
    ) -> impl Future<Output = ErrorKind> + 'static {
        let command = self
            .validate_peer(caller)
            .then(|| self.shared.controller.run(direction.apply(self.default_speedratio())));

        async move {
            match command {
                Some(fut) => fut.await,
                None => ErrorKind::PermissionDenied,
            }
        }
    }

    /// Run at an explicit speed ratio.
    pub fn run_at_speedratio(
        &self,
        caller: &str,
        speedratio: f64,
    ) -> impl Future<Output = ErrorKind> + 'static {
        let command = self
            .validate_peer(caller)
            .then(|| self.shared.controller.run(speedratio));

        async move {
            match command {
                Some(fut) => fut.await,
                None => ErrorKind::PermissionDenied,
            }
        }
    }

    /// Run at an explicit speed ratio for a duration, then stop.
    pub fn run_at_speedratio_for(
        &self,
        caller: &str,
        speedratio: f64,
        duration: Duration,
    ) -> impl Future<Output = ErrorKind> + 'static {
        let command = self
            .validate_peer(caller)
            .then(|| self.shared.controller.run_for(speedratio, duration));

        async move {
            match command {
                Some(fut) => fut.await,
                None => ErrorKind::PermissionDenied,
            }
        }
    }

    /// Run in the given direction at the configured default speed ratio for
    /// a duration, then stop.
    pub fn run_for(
        &self,
        caller: &str,
        duration: Duration,
        direction: Direction,
    ) -> impl Future<Output = ErrorKind> + 'static {
        let command = self.validate_peer(caller).then(|| {
            self.shared
                .controller
                .run_for(direction.apply(self.default_speedratio()), duration)
        });

        async move {
            match command {
                Some(fut) => fut.await,
                None => ErrorKind::PermissionDenied,
            }
        }
    }

    /// Ramp down on the deceleration ramp.
    pub fn stop(&self, caller: &str) -> impl Future<Output = ErrorKind> + 'static {
        let command = self.validate_peer(caller).then(|| self.shared.controller.stop());

        async move {
            match command {
                Some(fut) => fut.await,
                None => ErrorKind::PermissionDenied,
            }
        }
    }

    /// Ramp down on the quick stop ramp.
    pub fn quick_stop(&self, caller: &str) -> impl Future<Output = ErrorKind> + 'static {
        let command = self
            .validate_peer(caller)
            .then(|| self.shared.controller.quick_stop());

        async move {
            match command {
                Some(fut) => fut.await,
                None => ErrorKind::PermissionDenied,
            }
        }
    }

    /// Permit a drive fault reset.
    pub fn reset(&self, caller: &str) -> impl Future<Output = ErrorKind> + 'static {
        let command = self.validate_peer(caller).then(|| self.shared.controller.reset());

        async move {
            match command {
                Some(fut) => fut.await,
                None => ErrorKind::PermissionDenied,
            }
        }
    }

    /// Home the motor onto its homing sensor.
    pub fn move_home(&self, caller: &str) -> impl Future<Output = ErrorKind> + 'static {
        let command = self
            .validate_peer(caller)
            .then(|| self.shared.controller.move_home());

        async move {
            match command {
                Some(fut) => fut.await,
                None => ErrorKind::PermissionDenied,
            }
        }
    }

    /// Convey a relative distance at the configured default speed ratio.
    /// Completes with the actually travelled micrometres.
    pub fn convey_micrometre(
        &self,
        caller: &str,
        travel: i64,
    ) -> impl Future<Output = (ErrorKind, i64)> + 'static {
        let command = self
            .validate_peer(caller)
            .then(|| self.shared.controller.convey(self.default_speedratio(), travel));

        async move {
            match command {
                Some(fut) => fut.await,
                None => (ErrorKind::PermissionDenied, 0),
            }
        }
    }

    /// Reserved: convey parameterised by velocity and duration.
    pub fn convey_velocity_for(
        &self,
        caller: &str,
        _velocity: i64,
        _duration: Duration,
    ) -> (ErrorKind, i64) {
        if !self.validate_peer(caller) {
            return (ErrorKind::PermissionDenied, 0);
        }
        log::error!("Unimplemented convey(velocity, duration) called");

        (ErrorKind::MotorMethodNotImplemented, 0)
    }

    /// Reserved: convey parameterised by velocity and distance.
    pub fn convey_velocity_micrometre(
        &self,
        caller: &str,
        _velocity: i64,
        _travel: i64,
    ) -> (ErrorKind, i64) {
        if !self.validate_peer(caller) {
            return (ErrorKind::PermissionDenied, 0);
        }
        log::error!("Unimplemented convey(velocity, travel) called");

        (ErrorKind::MotorMethodNotImplemented, 0)
    }

    /// Move to an absolute placement from home at an explicit speed ratio.
    /// Completes with the final position from home.
    pub fn move_speedratio_micrometre(
        &self,
        caller: &str,
        speedratio: f64,
        placement: i64,
    ) -> impl Future<Output = (ErrorKind, i64)> + 'static {
        let command = self
            .validate_peer(caller)
            .then(|| self.shared.controller.move_to(speedratio, placement));

        async move {
            match command {
                Some(fut) => fut.await,
                None => (ErrorKind::PermissionDenied, 0),
            }
        }
    }

    /// Move to an absolute placement from home at the configured default
    /// speed ratio.
    pub fn move_micrometre(
        &self,
        caller: &str,
        placement: i64,
    ) -> impl Future<Output = (ErrorKind, i64)> + 'static {
        let command = self
            .validate_peer(caller)
            .then(|| self.shared.controller.move_to(self.default_speedratio(), placement));

        async move {
            match command {
                Some(fut) => fut.await,
                None => (ErrorKind::PermissionDenied, 0),
            }
        }
    }

    /// Positional notification, open to any caller.
    pub fn notify_after_micrometre(
        &self,
        travel: i64,
    ) -> impl Future<Output = ErrorKind> + 'static {
        self.shared.controller.notify_after(travel)
    }

    /// Whether positioning commands require homing first.
    pub fn needs_homing(&self) -> (ErrorKind, bool) {
        let err = self.shared.controller.needs_homing();

        (err, err != ErrorKind::Success)
    }

    /// Update the speed ratio used by commands without an explicit one.
    pub fn set_configured_speedratio(&self, speedratio: f64) {
        *self.shared.default_speedratio.lock().unwrap() = speedratio;
    }

    fn default_speedratio(&self) -> f64 {
        *self.shared.default_speedratio.lock().unwrap()
    }

    fn validate_peer(&self, caller: &str) -> bool {
        let valid = self.shared.peer.lock().unwrap().as_deref() == Some(caller);
        if !valid {
            log::warn!("Peer rejected: {caller}");
        }

        valid
    }

    fn ensure_watchdog(&self) {
        if self.shared.watchdog_running.swap(true, Ordering::AcqRel) {
            return;
        }

        let lease = self.shared.lease.subscribe();
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(lease_watchdog(lease, shared));
    }
}

/// Stops the motor and releases the peer when the lease expires.
async fn lease_watchdog(
    mut lease: watch::Receiver<Option<Instant>>,
    shared: Weak<SurfaceShared>,
) {
    loop {
        let deadline = *lease.borrow_and_update();

        match deadline {
            None => {
                if lease.changed().await.is_err() {
                    return;
                }
            }
            Some(deadline) => {
                tokio::select! {
                    changed = lease.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = sleep_until(deadline) => {
                        let Some(shared) = shared.upgrade() else {
                            return;
                        };

                        let peer = shared.peer.lock().unwrap().take();
                        shared.lease.send_replace(None);

                        if let Some(peer) = peer {
                            log::info!(
                                "Peer {peer} has disconnected, stopping motor. \
                                 Now available to anyone"
                            );
                            shared.connected_peer.send_replace(String::new());

                            let err = shared.controller.stop().await;
                            if err != ErrorKind::Success && err != ErrorKind::OperationCanceled {
                                log::error!("Stop failed after peer disconnect: {err}");
                            }
                        }
                    }
                }
            }
        }
    }
}
