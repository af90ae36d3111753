//! Driver and reporting for running canister artifacts outside a replica.

pub mod driver;
pub mod report;

pub use driver::{discover, Driver, DriverState, EntryKind, EntryPoint};
pub use report::{InvocationOutcome, InvocationReport, RunReport};
