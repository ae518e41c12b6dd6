use serde::{Deserialize, Serialize};

/// Extraction status lifecycle.
///
/// Moves strictly forward; `Failed` is reachable from every non-terminal
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionStatus {
    Initializing,
    Running,
    QueryChecked,
    QueryCompleted,
    ExportCsvStarted,
    ExportCsvChecked,
    ExportCsvCompleted,
    ExportCsvContentChecked,
    ExportConverted,
    ExportConversionSkipped,
    Succeeded,
    Failed,
}

impl ExtractionStatus {
    pub const ALL: [ExtractionStatus; 12] = [
        Self::Initializing,
        Self::Running,
        Self::QueryChecked,
        Self::QueryCompleted,
        Self::ExportCsvStarted,
        Self::ExportCsvChecked,
        Self::ExportCsvCompleted,
        Self::ExportCsvContentChecked,
        Self::ExportConverted,
        Self::ExportConversionSkipped,
        Self::Succeeded,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::QueryChecked => "QUERY_CHECKED",
            Self::QueryCompleted => "QUERY_COMPLETED",
            Self::ExportCsvStarted => "EXPORT_CSV_STARTED",
            Self::ExportCsvChecked => "EXPORT_CSV_CHECKED",
            Self::ExportCsvCompleted => "EXPORT_CSV_COMPLETED",
            Self::ExportCsvContentChecked => "EXPORT_CSV_CONTENT_CHECKED",
            Self::ExportConverted => "EXPORT_CONVERTED",
            Self::ExportConversionSkipped => "EXPORT_CONVERSION_SKIPPED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// `Succeeded` and `Failed` are final; nothing moves an extraction out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl core::fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State-machine operations, each guarded by an allowed-predecessor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PerformQuery,
    CheckQueryStatus,
    ExportToCsv,
    CheckCsvExportQueryStatus,
    CheckExportedCsvContent,
    Compress,
    FinalizeWithSuccess,
    FinalizeWithError,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Self::PerformQuery,
        Self::CheckQueryStatus,
        Self::ExportToCsv,
        Self::CheckCsvExportQueryStatus,
        Self::CheckExportedCsvContent,
        Self::Compress,
        Self::FinalizeWithSuccess,
        Self::FinalizeWithError,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::PerformQuery => "perform query",
            Self::CheckQueryStatus => "check query status",
            Self::ExportToCsv => "export to csv",
            Self::CheckCsvExportQueryStatus => "check csv export query status",
            Self::CheckExportedCsvContent => "check exported csv content",
            Self::Compress => "compress",
            Self::FinalizeWithSuccess => "finalize with success",
            Self::FinalizeWithError => "finalize with error",
        }
    }

    /// Statuses in which the operation may run.
    pub fn allowed_from(&self) -> &'static [ExtractionStatus] {
        use ExtractionStatus as S;
        match self {
            Self::PerformQuery => &[S::Initializing],
            Self::CheckQueryStatus => &[S::Running, S::QueryChecked],
            Self::ExportToCsv => &[S::QueryCompleted],
            Self::CheckCsvExportQueryStatus => &[S::ExportCsvStarted, S::ExportCsvChecked],
            Self::CheckExportedCsvContent => &[S::ExportCsvCompleted],
            Self::Compress => &[S::ExportCsvContentChecked],
            Self::FinalizeWithSuccess => &[S::ExportConverted, S::ExportConversionSkipped],
            Self::FinalizeWithError => &[
                S::Initializing,
                S::Running,
                S::QueryChecked,
                S::QueryCompleted,
                S::ExportCsvStarted,
                S::ExportCsvChecked,
                S::ExportCsvCompleted,
                S::ExportCsvContentChecked,
                S::ExportConverted,
                S::ExportConversionSkipped,
            ],
        }
    }

    pub fn is_allowed_from(&self, status: ExtractionStatus) -> bool {
        self.allowed_from().contains(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&ExtractionStatus::ExportCsvContentChecked).unwrap();
        assert_eq!(json, "\"EXPORT_CSV_CONTENT_CHECKED\"");

        for status in ExtractionStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json.trim_matches('"'), status.as_str());
        }
    }

    #[test]
    fn terminal_statuses_allow_nothing() {
        for op in Operation::ALL {
            assert!(!op.is_allowed_from(ExtractionStatus::Succeeded), "{}", op.name());
            assert!(!op.is_allowed_from(ExtractionStatus::Failed), "{}", op.name());
        }
    }

    #[test]
    fn every_non_terminal_status_can_fail() {
        for status in ExtractionStatus::ALL {
            assert_eq!(
                Operation::FinalizeWithError.is_allowed_from(status),
                !status.is_terminal()
            );
        }
    }
}
