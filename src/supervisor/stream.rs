//! Records of the agent's line-delimited JSON output stream.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamRecord {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { name: String },
    Thinking { thinking: String },
    #[serde(other)]
    Other,
}

/// Something the running agent did, surfaced for logs and progress display.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Started {
        session_id: Option<String>,
        model: Option<String>,
    },
    Text(String),
    ToolUse(String),
    Thinking(String),
    Finished {
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    },
    /// A line that is not a stream record.
    Log(String),
}

/// Builds the textual result from the stream, one line at a time.
///
/// Assistant text blocks are appended in order. A final `result` record
/// with non-empty text replaces everything accumulated so far.
#[derive(Debug, Default)]
pub struct OutputAccumulator {
    buffer: String,
}

impl OutputAccumulator {
    pub fn ingest(&mut self, line: &str) -> Vec<ExecutionEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        let record = match serde_json::from_str::<StreamRecord>(line) {
            Ok(record) => record,
            Err(_) => return vec![ExecutionEvent::Log(line.to_string())],
        };

        match record {
            StreamRecord::System {
                subtype,
                session_id,
                model,
            } if subtype.as_deref() == Some("init") => {
                vec![ExecutionEvent::Started { session_id, model }]
            }
            StreamRecord::System { .. } | StreamRecord::Other => Vec::new(),
            StreamRecord::Assistant { message } => message
                .content
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => {
                        self.buffer.push_str(&text);
                        Some(ExecutionEvent::Text(text))
                    }
                    ContentBlock::ToolUse { name } => Some(ExecutionEvent::ToolUse(name)),
                    ContentBlock::Thinking { thinking } => Some(ExecutionEvent::Thinking(thinking)),
                    ContentBlock::Other => None,
                })
                .collect(),
            StreamRecord::Result {
                result,
                total_cost_usd,
                duration_ms,
            } => {
                if let Some(text) = result.filter(|t| !t.is_empty()) {
                    self.buffer = text;
                }
                vec![ExecutionEvent::Finished {
                    cost_usd: total_cost_usd,
                    duration_ms,
                }]
            }
        }
    }

    pub fn output(&self) -> &str {
        &self.buffer
    }

    pub fn into_output(self) -> String {
        self.buffer
    }
}
