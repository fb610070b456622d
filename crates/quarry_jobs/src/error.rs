//! Error types for job processing.
//!
//! `ValidationErrors` is the user-facing error: a map from field name to
//! messages, returned unchanged to whoever submitted the job. Everything else
//! is either a contract violation by the caller or an infrastructure failure.

use std::collections::BTreeMap;
use std::fmt;

use quarry_db::AdapterError;
use serde::Serialize;
use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::streamer::StreamError;

/// Field-keyed validation messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single message on a single field.
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn extend(&mut self, field: impl Into<String>, messages: impl IntoIterator<Item = String>) {
        self.fields.entry(field.into()).or_default().extend(messages);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(JobError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|(field, messages)| format!("{}: {}", field, messages.join(" ")))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Translation failure reported by a query processor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SyntaxError {
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    /// Message shown to the submitter, with the position when known.
    pub fn user_message(&self) -> String {
        match (self.line, self.column) {
            (Some(line), Some(column)) => {
                format!("{} (line {}, column {})", self.message, line, column)
            }
            (Some(line), None) => format!("{} (line {})", self.message, line),
            _ => self.message.clone(),
        }
    }
}

impl From<SyntaxError> for ValidationErrors {
    fn from(err: SyntaxError) -> Self {
        ValidationErrors::single("query", err.user_message())
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    /// The caller broke the job protocol (e.g. `run()` before `process()`).
    #[error("{0}")]
    Contract(String),

    #[error("Backend error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid stored data: {0}")]
    Corrupt(String),
}

impl JobError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(ValidationErrors::single(field, message))
    }

    pub fn not_processed(kind: &str) -> Self {
        Self::Contract(format!("{}.process() was not called.", kind))
    }

    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            Self::Validation(errors) => Some(errors),
            _ => None,
        }
    }

    pub fn is_validation_on(&self, field: &str) -> bool {
        self.validation_errors()
            .map(|e| e.contains(field))
            .unwrap_or(false)
    }
}

impl From<ValidationErrors> for JobError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_aggregate_per_field() {
        let mut errors = ValidationErrors::new();
        errors.add("x", "Column not found.");
        errors.add("y", "Column not found.");
        errors.add("x", "Again.");

        assert_eq!(errors.fields().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(errors.get("x").unwrap().len(), 2);
        assert!(errors.into_result().is_err());
        assert!(ValidationErrors::new().into_result().is_ok());
    }

    #[test]
    fn test_syntax_error_keeps_position() {
        let err = SyntaxError::new("mismatched input 'FORM'").at(1, 9);
        let errors = ValidationErrors::from(err);
        assert_eq!(
            errors.get("query").unwrap(),
            ["mismatched input 'FORM' (line 1, column 9)"]
        );
    }

    #[test]
    fn test_validation_serializes_as_field_map() {
        let errors = ValidationErrors::single("phase", "Job is not PENDING.");
        assert_eq!(
            serde_json::to_string(&errors).unwrap(),
            r#"{"phase":["Job is not PENDING."]}"#
        );
    }

    #[test]
    fn test_contract_message() {
        let err = JobError::not_processed("job");
        assert_eq!(err.to_string(), "job.process() was not called.");
    }
}
