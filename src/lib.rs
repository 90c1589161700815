//! # frog_daq
//!
//! Acquisition coordinator for FROG-style ultrafast pulse characterization:
//! a motorized linear delay stage and a fiber spectrometer sequenced into
//! time-resolved spectrograms. The crate is headless; the CLI binary and any
//! GUI shell are thin consumers of the coordinator's command surface and
//! event stream.
//!
//! ## Crate Structure
//!
//! - **`units`**: pure conversions between optical delay (fs) and stage
//!   displacement (um).
//! - **`error`**: the `FrogError` taxonomy and the clonable `ErrorKind`
//!   carried by terminal events.
//! - **`hardware`**: the `LinearMotor` / `Spectrometer` capability contracts,
//!   the Thorlabs Kinesis and Ocean Optics drivers, simulated devices, and
//!   the connection factory.
//! - **`stage`**: `DelayStage`, the delay-domain wrapper owning T0 and the
//!   predicted-position safety check every move passes through.
//! - **`calibration`**: file persistence for the T0 reference.
//! - **`coordinator`**: the core: device arbitration guards, the motion and
//!   continuous-spectrum monitors, the spectrogram scan sequencer, and the
//!   `FrogCoordinator` facade tying them together.
//! - **`messages`**: the `FrogEvent` notifications published on the
//!   coordinator's broadcast channel.
//! - **`scan_range`**: the fs-canonical scan range model.
//! - **`spectrogram`**: incremental spectrogram assembly, background
//!   subtraction, CSV export.
//! - **`config`**: Figment-based TOML + environment configuration.
//! - **`logging`**: tracing subscriber setup.

pub mod calibration;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod messages;
pub mod scan_range;
pub mod spectrogram;
pub mod stage;
pub mod units;

pub use coordinator::scan::AcquisitionState;
pub use coordinator::{CoordinatorOptions, FrogCoordinator};
pub use error::{ErrorKind, FrogError, FrogResult};
pub use messages::FrogEvent;
pub use scan_range::ScanRange;
