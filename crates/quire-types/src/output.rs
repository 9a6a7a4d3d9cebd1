//! Output records written back onto blocks by executors.

use serde::{Deserialize, Serialize};

use crate::dataframe::DataFrameColumn;

/// One record of Python output, streamed incrementally from the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Output {
    /// Text written to stdout/stderr.
    Stream { name: StreamName, text: String },
    /// Rich display data keyed by MIME type (`text/html`, `image/png`, ...).
    DisplayData { mime: String, data: String },
    /// The value of the last expression.
    ExecuteResult { mime: String, data: String },
    /// An exception raised by the executed code.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl Output {
    pub fn stdout(text: impl Into<String>) -> Self {
        Output::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        }
    }

    pub fn error(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Output::Error {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Output::Error { .. })
    }
}

/// Result of a SQL block run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SqlResult {
    Success {
        columns: Vec<DataFrameColumn>,
        rows: Vec<Vec<serde_json::Value>>,
        count: u64,
        query_duration_ms: u64,
    },
    SyntaxError {
        message: String,
    },
    PythonError {
        ename: String,
        evalue: String,
    },
    AbortError {
        message: String,
    },
    EmptyQuery,
}

impl SqlResult {
    pub fn aborted() -> Self {
        SqlResult::AbortError {
            message: "Query aborted".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SqlResult::Success { .. })
    }
}
