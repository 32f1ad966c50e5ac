//! Opt-in error reporting
//!
//! When `--enable-crash-reporting` is set, fatal errors are persisted as
//! structured JSON reports under `<dataDir>/.reports/` and uploaded to the
//! reporting endpoint together with a pointer to the run's log file.
//! Interrupts are never reported; a Ctrl-C is not a crash.

pub mod report;

pub use report::{ErrorReport, Reporter};
