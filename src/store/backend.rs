use std::future::Future;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

use super::error::StoreError;
use super::remote::RemoteBackend;
use super::sqlite::SqliteBackend;

/// A dynamically typed SQLite value, shared by both backends.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Text(v.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Conversion out of a [`SqlValue`] for typed column access.
pub trait FromSql: Sized {
    fn from_sql(value: &SqlValue) -> Result<Self, String>;
}

impl FromSql for i64 {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Integer(v) => Ok(*v),
            SqlValue::Text(s) => s.parse().map_err(|_| format!("not an integer: {s}")),
            other => Err(format!("expected integer, got {other:?}")),
        }
    }
}

impl FromSql for u32 {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        let v = i64::from_sql(value)?;
        u32::try_from(v).map_err(|_| format!("{v} out of range for u32"))
    }
}

impl FromSql for f64 {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Real(v) => Ok(*v),
            SqlValue::Integer(v) => Ok(*v as f64),
            SqlValue::Text(s) => s.parse().map_err(|_| format!("not a number: {s}")),
            SqlValue::Null => Err("expected number, got NULL".into()),
        }
    }
}

impl FromSql for String {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Integer(v) => Ok(v.to_string()),
            SqlValue::Real(v) => Ok(v.to_string()),
            SqlValue::Null => Err("expected text, got NULL".into()),
        }
    }
}

impl FromSql for DateTime<Utc> {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        let text = String::from_sql(value)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&text) {
            return Ok(ts.with_timezone(&Utc));
        }
        // Rows written with CURRENT_TIMESTAMP.
        NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S")
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("bad timestamp {text:?}: {e}"))
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Null => Ok(None),
            other => T::from_sql(other).map(Some),
        }
    }
}

/// One result row with its column names.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn value(&self, column: &str) -> Result<&SqlValue, StoreError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| StoreError::Decode(format!("missing column {column}")))
    }

    pub fn get<T: FromSql>(&self, column: &str) -> Result<T, StoreError> {
        T::from_sql(self.value(column)?)
            .map_err(|e| StoreError::Decode(format!("column {column}: {e}")))
    }
}

/// Executes one SQL statement with positional `?` parameters and returns
/// whatever rows it produced (empty for statements without `RETURNING`).
pub trait SqlBackend: Send + Sync {
    fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> impl Future<Output = Result<Vec<SqlRow>, StoreError>> + Send;
}

/// Backend chosen at startup from configuration.
#[derive(Clone)]
pub enum AnyBackend {
    Local(SqliteBackend),
    Remote(RemoteBackend),
}

impl SqlBackend for AnyBackend {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, StoreError> {
        match self {
            AnyBackend::Local(b) => b.execute(sql, params).await,
            AnyBackend::Remote(b) => b.execute(sql, params).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row() -> SqlRow {
        SqlRow::new(
            vec!["id".into(), "name".into(), "paid_at".into(), "amount".into()],
            vec![
                SqlValue::Integer(3),
                SqlValue::Text("alice".into()),
                SqlValue::Null,
                SqlValue::Integer(2),
            ],
        )
    }

    #[test]
    fn typed_access_by_column_name() {
        let row = row();
        assert_eq!(row.get::<i64>("id").unwrap(), 3);
        assert_eq!(row.get::<String>("name").unwrap(), "alice");
        assert_eq!(row.get::<Option<DateTime<Utc>>>("paid_at").unwrap(), None);
        assert_eq!(row.get::<f64>("amount").unwrap(), 2.0);
    }

    #[test]
    fn missing_column_is_decode_error() {
        let err = row().get::<i64>("nope").unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[test]
    fn null_into_required_column_fails() {
        assert!(row().get::<String>("paid_at").is_err());
    }

    #[test]
    fn timestamps_accept_both_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let rfc = SqlValue::Text("2025-01-02T03:04:05.000Z".into());
        let legacy = SqlValue::Text("2025-01-02 03:04:05".into());
        assert_eq!(DateTime::<Utc>::from_sql(&rfc).unwrap(), expected);
        assert_eq!(DateTime::<Utc>::from_sql(&legacy).unwrap(), expected);
    }

    #[test]
    fn datetime_round_trips_through_value() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let value = SqlValue::from(ts);
        assert_eq!(value, SqlValue::Text("2025-06-01T12:00:00.000Z".into()));
        assert_eq!(DateTime::<Utc>::from_sql(&value).unwrap(), ts);
    }

    #[test]
    fn option_into_value() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(4_i64)), SqlValue::Integer(4));
    }
}
