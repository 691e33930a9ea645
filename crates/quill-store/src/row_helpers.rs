use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Deserialize a JSON blob column, returning CorruptRow on parse failure.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// RFC3339 rendering of an epoch-milliseconds entity timestamp for the
/// indexed `created_at` / `updated_at` columns.
pub fn rfc3339_from_ms(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .unwrap_or(chrono::DateTime::UNIX_EPOCH)
        .to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_success() {
        let value: serde_json::Value = parse_json(r#"{"key": "value"}"#, "part", "data_json").unwrap();
        assert_eq!(value["key"], "value");
    }

    #[test]
    fn parse_json_failure_names_column() {
        let result: Result<serde_json::Value, _> = parse_json("nope", "part", "data_json");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow {
                table: "part",
                column: "data_json",
                ..
            })
        ));
    }

    #[test]
    fn rfc3339_rendering() {
        let s = rfc3339_from_ms(0);
        assert!(s.starts_with("1970-01-01T00:00:00"));
        let s = rfc3339_from_ms(1_700_000_000_000);
        assert!(s.starts_with("2023-11-14"));
    }
}
