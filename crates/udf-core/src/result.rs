use crate::{payload::RemotePayload, schema::Table, schema::TableSchema, Error};
use serde_json::Value;
use std::time::Duration;

/// The data a unit of work produced.
#[derive(Debug, Clone, PartialEq)]
pub enum UdfData {
    Table(Table),
    Payload(RemotePayload),
    Json(Value),
}

/// Everything one execution produced, success or failure.
///
/// A result with `error_message` set is a failure, whatever `data` holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub data: Option<UdfData>,
    pub sidecar: Option<Vec<u8>>,
    pub table_schema: Option<TableSchema>,
    pub time_taken: Option<Duration>,
    pub stdout: String,
    pub stderr: String,
    pub error_message: Option<String>,
    pub error_lineno: Option<u32>,
    pub exception_class: Option<String>,
    pub has_exception: bool,
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    pub fn is_failure(&self) -> bool {
        self.error_message.is_some()
    }

    /// Unwrap into the bare data, or the typed runtime error a failure represents.
    pub fn into_data(self) -> crate::Result<Option<UdfData>> {
        match self.error_message {
            Some(message) => Err(Error::UdfRuntime {
                message,
                exception_class: self.exception_class,
                lineno: self.error_lineno,
                stdout: self.stdout,
                stderr: self.stderr,
            }),
            None => Ok(self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_wins_over_data() {
        let result = ExecutionResult {
            data: Some(UdfData::Json(Value::Bool(true))),
            error_message: Some("boom".to_string()),
            exception_class: Some("ValueError".to_string()),
            ..Default::default()
        };
        assert!(result.is_failure());
        let err = result.into_data().unwrap_err();
        assert_eq!(err.to_string(), "ValueError: boom");
    }
}
