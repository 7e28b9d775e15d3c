//! CLI command implementations.

mod inspect;
mod snapshot;
mod start;
mod validate;

pub use inspect::{run_inspect, InspectArgs};
pub use snapshot::{run_snapshot, SnapshotArgs};
pub use start::{run_start, StartArgs};
pub use validate::{run_validate, ValidateArgs};
