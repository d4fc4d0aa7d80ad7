//! Remote SQLite-compatible store reached over HTTP.
//!
//! Speaks the libSQL pipeline protocol: each call posts one `execute`
//! request followed by `close` to `<url>/v2/pipeline` and decodes the
//! typed value cells of the response.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::backend::{SqlBackend, SqlRow, SqlValue};
use super::error::StoreError;

#[derive(Clone)]
pub struct RemoteBackend {
    client: Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl RemoteBackend {
    /// `url` may use the `libsql://` scheme; it is rewritten to `https://`.
    pub fn new(url: &str, auth_token: Option<String>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        let base = match url.strip_prefix("libsql://") {
            Some(host) => format!("https://{host}"),
            None => url.to_string(),
        };
        Ok(Self {
            client,
            endpoint: format!("{}/v2/pipeline", base.trim_end_matches('/')),
            auth_token: auth_token.filter(|t| !t.is_empty()),
        })
    }
}

#[derive(Debug, Serialize)]
struct PipelineRequest<'a> {
    requests: Vec<StreamRequest<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamRequest<'a> {
    Execute { stmt: Statement<'a> },
    Close,
}

#[derive(Debug, Serialize)]
struct Statement<'a> {
    sql: &'a str,
    args: Vec<WireValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireValue {
    Null,
    /// Integers travel as strings to survive JSON number precision.
    Integer { value: String },
    Float { value: f64 },
    Text { value: String },
    Blob { base64: String },
}

impl From<&SqlValue> for WireValue {
    fn from(value: &SqlValue) -> Self {
        match value {
            SqlValue::Null => WireValue::Null,
            SqlValue::Integer(v) => WireValue::Integer {
                value: v.to_string(),
            },
            SqlValue::Real(v) => WireValue::Float { value: *v },
            SqlValue::Text(v) => WireValue::Text { value: v.clone() },
        }
    }
}

impl TryFrom<WireValue> for SqlValue {
    type Error = StoreError;

    fn try_from(value: WireValue) -> Result<Self, Self::Error> {
        Ok(match value {
            WireValue::Null => SqlValue::Null,
            WireValue::Integer { value } => SqlValue::Integer(
                value
                    .parse()
                    .map_err(|_| StoreError::Decode(format!("bad integer cell {value:?}")))?,
            ),
            WireValue::Float { value } => SqlValue::Real(value),
            WireValue::Text { value } => SqlValue::Text(value),
            WireValue::Blob { .. } => {
                return Err(StoreError::Decode("blob cells are not supported".into()));
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct PipelineResponse {
    results: Vec<StreamResult>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamResult {
    Ok { response: StreamResponse },
    Error { error: WireError },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamResponse {
    Execute { result: StatementResult },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    cols: Vec<ColumnInfo>,
    rows: Vec<Vec<WireValue>>,
}

#[derive(Debug, Deserialize)]
struct ColumnInfo {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

impl WireError {
    fn into_store_error(self) -> StoreError {
        let unique = self.code.as_deref() == Some("SQLITE_CONSTRAINT_UNIQUE")
            || self.message.contains("UNIQUE constraint failed");
        if unique {
            StoreError::UniqueViolation(self.message)
        } else {
            StoreError::Remote {
                status: 200,
                message: self.message,
            }
        }
    }
}

impl SqlBackend for RemoteBackend {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, StoreError> {
        let body = PipelineRequest {
            requests: vec![
                StreamRequest::Execute {
                    stmt: Statement {
                        sql,
                        args: params.iter().map(WireValue::from).collect(),
                    },
                },
                StreamRequest::Close,
            ],
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(StoreError::Remote {
                status: status.as_u16(),
                message,
            });
        }

        let pipeline = response.json::<PipelineResponse>().await?;
        let first = pipeline
            .results
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode("empty pipeline response".into()))?;

        let result = match first {
            StreamResult::Error { error } => return Err(error.into_store_error()),
            StreamResult::Ok {
                response: StreamResponse::Execute { result },
            } => result,
            StreamResult::Ok { .. } => {
                return Err(StoreError::Decode("unexpected pipeline response".into()));
            }
        };

        let columns: Vec<String> = result
            .cols
            .into_iter()
            .enumerate()
            .map(|(i, c)| c.name.unwrap_or_else(|| format!("column{i}")))
            .collect();

        result
            .rows
            .into_iter()
            .map(|cells| {
                let values = cells
                    .into_iter()
                    .map(SqlValue::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlRow::new(columns.clone(), values))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok_body(cols: &[&str], rows: serde_json::Value) -> serde_json::Value {
        let cols: Vec<_> = cols.iter().map(|c| json!({ "name": c, "decltype": null })).collect();
        json!({
            "baton": null,
            "base_url": null,
            "results": [
                { "type": "ok", "response": { "type": "execute", "result": {
                    "cols": cols, "rows": rows, "affected_row_count": 1,
                    "last_insert_rowid": null, "replication_index": null
                }}},
                { "type": "ok", "response": { "type": "close" } }
            ]
        })
    }

    #[test]
    fn libsql_scheme_is_rewritten() {
        let backend = RemoteBackend::new("libsql://db.example.io/", None).unwrap();
        assert_eq!(backend.endpoint, "https://db.example.io/v2/pipeline");
    }

    #[tokio::test]
    async fn sends_typed_args_and_decodes_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/pipeline"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "requests": [
                    { "type": "execute", "stmt": {
                        "sql": "SELECT id, email, cost FROM w WHERE id = ?",
                        "args": [{ "type": "integer", "value": "7" }]
                    }},
                    { "type": "close" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(
                &["id", "email", "cost"],
                json!([[
                    { "type": "integer", "value": "7" },
                    { "type": "text", "value": "a@b.c" },
                    { "type": "float", "value": 0.5 }
                ]]),
            )))
            .expect(1)
            .mount(&server)
            .await;

        let backend = RemoteBackend::new(&server.uri(), Some("secret".into())).unwrap();
        let rows = backend
            .execute(
                "SELECT id, email, cost FROM w WHERE id = ?",
                &[SqlValue::Integer(7)],
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<i64>("id").unwrap(), 7);
        assert_eq!(rows[0].get::<String>("email").unwrap(), "a@b.c");
        assert_eq!(rows[0].get::<f64>("cost").unwrap(), 0.5);
    }

    #[tokio::test]
    async fn unique_failure_maps_to_unique_violation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    { "type": "error", "error": {
                        "message": "SQLite error: UNIQUE constraint failed: work_items.transaction_id",
                        "code": "SQLITE_CONSTRAINT"
                    }},
                    { "type": "error", "error": { "message": "stream closed" } }
                ]
            })))
            .mount(&server)
            .await;

        let backend = RemoteBackend::new(&server.uri(), None).unwrap();
        let err = backend.execute("UPDATE w SET tx = ?", &["t".into()]).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)), "{err:?}");
    }

    #[tokio::test]
    async fn http_failure_maps_to_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let backend = RemoteBackend::new(&server.uri(), Some("wrong".into())).unwrap();
        let err = backend.execute("SELECT 1", &[]).await.unwrap_err();
        match err {
            StoreError::Remote { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "bad token");
            }
            other => panic!("expected Remote, got {other:?}"),
        }
    }
}
