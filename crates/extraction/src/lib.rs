//! `reportflow-extraction`: the report extraction state machine.
//!
//! An [`Extraction`] walks from `INITIALIZING` to `SUCCEEDED` (or `FAILED`)
//! one guarded step at a time; a [`ScheduledReport`] decides when a new one is
//! due. All IO goes through the ports in [`ports`].

pub mod error;
pub mod export;
pub mod extraction;
pub mod ports;
pub mod query_status;
pub mod recurrence;
pub mod scheduled_report;
pub mod status;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::ExtractionError;
pub use extraction::{CompressOutcome, Extraction, QueryScope};
pub use ports::{
    Collaborators, FileSystem, PlatformSettings, PlatformSettingsProvider, ReportDefinition,
    ReportDefinitionResolver, StorageTarget, WarehouseGateway, WarehouseQueryState,
};
pub use query_status::{QueryOutcome, QueryStatus};
pub use recurrence::{Frequency, RecurrenceRule};
pub use scheduled_report::{ScheduledReport, Visibility};
pub use status::{ExtractionStatus, Operation};
