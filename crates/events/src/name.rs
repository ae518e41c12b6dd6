use core::str::FromStr;

/// Event names recognized on the extraction queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    NewExtraction,
    Initialized,
    CheckQueryStatus,
    QueryCompleted,
    QueryFailed,
    CheckExportStatus,
    ExportCompleted,
    ExportFailed,
    ExportContentChecked,
    ReportConverted,
    ReportConversionSkipped,
}

impl EventName {
    pub const ALL: [EventName; 11] = [
        Self::NewExtraction,
        Self::Initialized,
        Self::CheckQueryStatus,
        Self::QueryCompleted,
        Self::QueryFailed,
        Self::CheckExportStatus,
        Self::ExportCompleted,
        Self::ExportFailed,
        Self::ExportContentChecked,
        Self::ReportConverted,
        Self::ReportConversionSkipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewExtraction => "NewExtraction",
            Self::Initialized => "Initialized",
            Self::CheckQueryStatus => "CheckQueryStatus",
            Self::QueryCompleted => "QueryCompleted",
            Self::QueryFailed => "QueryFailed",
            Self::CheckExportStatus => "CheckExportStatus",
            Self::ExportCompleted => "ExportCompleted",
            Self::ExportFailed => "ExportFailed",
            Self::ExportContentChecked => "ExportContentChecked",
            Self::ReportConverted => "ReportConverted",
            Self::ReportConversionSkipped => "ReportConversionSkipped",
        }
    }

    /// Events addressing an existing extraction by `(extraction_id, report_id)`.
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, Self::NewExtraction)
    }
}

impl core::fmt::Display for EventName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name not in [`EventName::ALL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEventName(pub String);

impl FromStr for EventName {
    type Err = UnknownEventName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownEventName(s.to_string()))
    }
}
