//! Persisted job records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use quarry_db::ColumnInfo;
use quarry_protocol::{display_name, Identity, JobId, JobType, Phase};
use serde::{Deserialize, Serialize};

use crate::processor::TableRef;

/// Fields shared by every job kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: JobType,
    /// Query job a download or archive job belongs to
    pub parent_id: Option<JobId>,
    /// `None` for anonymous submitters
    pub owner: Option<Identity>,
    pub phase: Phase,
    pub creation_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds; 0 means no budget
    pub execution_duration: f64,
    pub client_ip: Option<String>,
    pub response_format: Option<String>,
    pub max_records: Option<i64>,
    pub error_summary: Option<String>,
}

impl JobRecord {
    pub fn new(job_type: JobType, owner: Option<Identity>) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            parent_id: None,
            owner,
            phase: Phase::Pending,
            creation_time: Utc::now(),
            start_time: None,
            end_time: None,
            execution_duration: 0.0,
            client_ip: None,
            response_format: None,
            max_records: None,
            error_summary: None,
        }
    }

    pub fn owner(&self) -> Option<&Identity> {
        self.owner.as_ref()
    }

    pub fn owner_name(&self) -> &str {
        display_name(self.owner.as_ref())
    }

    /// Seconds spent waiting for a worker.
    pub fn time_queue(&self) -> Option<f64> {
        seconds_between(Some(self.creation_time), self.start_time)
    }

    /// Seconds spent executing.
    pub fn time_query(&self) -> Option<f64> {
        seconds_between(self.start_time, self.end_time)
    }
}

fn seconds_between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<f64> {
    match (start, end) {
        (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
        _ => None,
    }
}

/// Information about a query result kept alongside the job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryMetadata {
    pub display_columns: Vec<String>,
    pub tables: Vec<TableRef>,
    /// Result columns, filled in when execution completes
    pub columns: Vec<ColumnInfo>,
    /// Display name after a rename
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl QueryMetadata {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// `schema.table` of every referenced table.
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.tables.iter().map(TableRef::qualified).collect();
        sources.dedup();
        sources
    }
}

/// Query-specific fields of a query job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDetails {
    pub schema_name: String,
    pub table_name: String,
    /// Queue key; empty for uploads
    pub queue: String,
    pub query_language: String,
    pub query: String,
    pub native_query: String,
    pub actual_query: String,
    pub nrows: Option<i64>,
    pub size: Option<i64>,
    pub metadata: QueryMetadata,
    /// upload table name -> source file path
    pub uploads: BTreeMap<String, String>,
    /// Backend process running the query
    pub pid: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadDetails {
    pub format_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveDetails {
    pub column_name: String,
    pub files: Vec<String>,
}

/// A usage record written for every executed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub time: DateTime<Utc>,
    pub resource_type: String,
    pub resource: serde_json::Value,
    pub client_ip: Option<String>,
    pub user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_time_queue_and_query() {
        let mut job = JobRecord::new(JobType::Query, None);
        assert_eq!(job.time_queue(), None);
        job.start_time = Some(job.creation_time + Duration::milliseconds(1500));
        job.end_time = Some(job.creation_time + Duration::seconds(4));
        assert_eq!(job.time_queue(), Some(1.5));
        assert_eq!(job.time_query(), Some(2.5));
        assert_eq!(job.owner_name(), "anonymous");
    }

    #[test]
    fn test_metadata_sources() {
        let metadata = QueryMetadata {
            tables: vec![
                TableRef::new("gaia", "dr3"),
                TableRef::new("gaia", "dr3"),
                TableRef::new("sdss", "dr16"),
            ],
            ..QueryMetadata::default()
        };
        assert_eq!(metadata.sources(), vec!["gaia.dr3", "sdss.dr16"]);
    }
}
