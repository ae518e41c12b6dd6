//! CSV export statements and placeholder content.

use crate::ports::StorageTarget;

/// Content type of exported and synthesized CSV files.
pub const CSV_CONTENT_TYPE: &str = "text/csv";

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `COPY INTO` statement unloading the result set of `query_id` into a single
/// CSV file at `path` inside the target bucket.
pub fn copy_into_statement(
    query_id: &str,
    columns: &[String],
    sort: Option<&str>,
    target: &StorageTarget,
    path: &str,
) -> String {
    let projection = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut select = format!(
        "SELECT {projection} FROM TABLE(RESULT_SCAN({}))",
        quote_literal(query_id)
    );
    if let Some(sort) = sort.map(str::trim).filter(|s| !s.is_empty()) {
        select.push(' ');
        select.push_str(sort);
    }

    let location = quote_literal(&format!("s3://{}/{}", target.bucket, path));
    format!(
        "COPY INTO {location} FROM ({select}) \
         STORAGE_INTEGRATION = {integration} \
         FILE_FORMAT = (TYPE = CSV COMPRESSION = NONE FIELD_OPTIONALLY_ENCLOSED_BY = '\"' NULL_IF = ()) \
         HEADER = TRUE SINGLE = TRUE OVERWRITE = TRUE MAX_FILE_SIZE = 5368709120",
        integration = target.integration,
    )
}

/// Header line written in place of an export that produced no file.
pub fn header_only_csv(columns: &[String]) -> String {
    let mut header = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(",");
    header.push('\n');
    header
}
