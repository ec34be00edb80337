//! Motor control runtime for the Schneider ATV320 variable frequency drive on
//! EtherCAT fieldbuses.
//!
//! The crate is transport agnostic: an EtherCAT master (or a test harness)
//! hands [`Atv320Drive::pdo_cycle`] the drive's input process data once per
//! cycle and receives the output process data back. Acyclic configuration is
//! expressed as [`sdo::SdoWrite`] values for the master to execute, both at
//! startup ([`Atv320Drive::startup_writes`]) and when the configuration
//! changes at runtime.
//!
//! Motion commands are issued through [`controller::Controller`] or, for
//! remote callers, through the single-peer [`surface::CommandSurface`]. At
//! most one command is pending at any time; a new command synchronously
//! supersedes the previous one, which completes with
//! [`error::ErrorKind::OperationCanceled`].

pub mod cia402;
pub mod config;
pub mod controller;
pub mod drive;
pub mod error;
pub mod pdo;
pub mod positioner;
pub mod sdo;
pub mod speedratio;
pub mod status;
pub mod surface;

pub use controller::Controller;
pub use drive::Atv320Drive;
pub use error::ErrorKind;
pub use speedratio::Direction;
