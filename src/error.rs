//! Motor error kinds surfaced to command callers.

/// Completion status of a motor command.
///
/// Every command completion carries one of these, [`ErrorKind::Success`]
/// included, so remote surfaces can forward the value as-is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The command ran to completion.
    Success,
    /// A superseding command took over the motor.
    OperationCanceled,
    /// The caller is not the connected peer.
    PermissionDenied,
    /// A speed ratio outside `[-100, 100]` % was requested.
    SpeedratioOutOfRange,
    /// The drive entered the fault (or fault reaction) state.
    FrequencyDriveReportsFault,
    /// The fieldbus transport lost contact with the drive.
    FrequencyDriveCommunicationFault,
    /// The positive limit switch interrupted positive direction motion.
    PositioningPositiveLimitReached,
    /// The negative limit switch interrupted negative direction motion.
    PositioningNegativeLimitReached,
    /// Positioning was requested but homing has not completed, or the homing
    /// reference has expired.
    MotorMissingHomeReference,
    /// Homing was requested but no homing sensor or homing speed is
    /// configured.
    MotorHomeSensorUnconfigured,
    /// The method is reserved but not implemented.
    MotorMethodNotImplemented,
}

impl ErrorKind {
    /// `true` for [`ErrorKind::Success`].
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl Default for ErrorKind {
    fn default() -> Self {
        Self::Success
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ErrorKind::Success => f.write_str("success"),
            ErrorKind::OperationCanceled => f.write_str("operation canceled"),
            ErrorKind::PermissionDenied => f.write_str("permission denied"),
            ErrorKind::SpeedratioOutOfRange => {
                f.write_str("speed ratio not within [-100, 100]%")
            }
            ErrorKind::FrequencyDriveReportsFault => {
                f.write_str("frequency drive reports fault")
            }
            ErrorKind::FrequencyDriveCommunicationFault => {
                f.write_str("frequency drive communication fault")
            }
            ErrorKind::PositioningPositiveLimitReached => {
                f.write_str("positive limit switch reached")
            }
            ErrorKind::PositioningNegativeLimitReached => {
                f.write_str("negative limit switch reached")
            }
            ErrorKind::MotorMissingHomeReference => {
                f.write_str("motor is missing a home reference")
            }
            ErrorKind::MotorHomeSensorUnconfigured => {
                f.write_str("no homing sensor is configured")
            }
            ErrorKind::MotorMethodNotImplemented => f.write_str("method not implemented"),
        }
    }
}
