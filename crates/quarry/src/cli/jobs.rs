//! Query job commands: submit, upload, inspect and manage jobs.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use quarry_jobs::{JobContext, QueryJob};
use quarry_protocol::{display_name, JobId, Phase};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::cli::context::{self, GlobalArgs};
use crate::cli::output::{
    format_optional_time, format_seconds, format_size, format_time, phase_color, print_fields,
    print_json, print_table, print_table_colored,
};
use crate::cli::worker::wait_for;

/// Arguments for the submit command
#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    /// Query string
    pub query: String,

    /// Query language, optionally with a version (e.g. adql-2.0)
    #[arg(long, default_value = "adql")]
    pub language: String,

    /// Queue to run on (default: the first queue available to the user)
    #[arg(long)]
    pub queue: Option<String>,

    /// Name of the result table (default: a timestamp)
    #[arg(long)]
    pub table: Option<String>,

    /// Schema of the result table (only the user schema is accepted)
    #[arg(long)]
    pub schema: Option<String>,

    /// Format of the synchronous response
    #[arg(long)]
    pub format: Option<String>,

    /// Row limit, reported as OVERFLOW in downloads
    #[arg(long)]
    pub max_records: Option<i64>,

    /// Run synchronously and stream the result instead of creating a table
    #[arg(long)]
    pub sync: bool,

    /// Write the synchronous response here instead of stdout
    #[arg(short = 'o', long, requires = "sync")]
    pub output: Option<PathBuf>,

    /// Wait for an asynchronous job to finish
    #[arg(long)]
    pub wait: bool,

    /// Give up waiting after this many seconds
    #[arg(long, default_value = "300")]
    pub timeout: u64,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the upload command
#[derive(Args, Debug, Clone)]
pub struct UploadArgs {
    /// CSV file with a header row
    pub file: PathBuf,

    /// Name of the table to create
    #[arg(long)]
    pub table: String,

    /// Wait for the ingest to finish
    #[arg(long)]
    pub wait: bool,

    #[arg(long, default_value = "300")]
    pub timeout: u64,

    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub owner: String,
    pub phase: Phase,
    pub creation_time: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub time_queue: Option<f64>,
    pub time_query: Option<f64>,
    pub execution_duration: f64,
    pub schema_name: String,
    pub table_name: String,
    pub queue: String,
    pub query_language: String,
    pub query: String,
    pub native_query: String,
    pub nrows: Option<i64>,
    pub size: Option<i64>,
    pub columns: Vec<String>,
    pub result_status: String,
    pub error_summary: Option<String>,
}

impl From<&QueryJob> for JobView {
    fn from(job: &QueryJob) -> Self {
        let record = &job.job;
        Self {
            id: record.id.to_string(),
            owner: record.owner_name().to_string(),
            phase: record.phase,
            creation_time: record.creation_time.to_rfc3339(),
            start_time: record.start_time.map(|t| t.to_rfc3339()),
            end_time: record.end_time.map(|t| t.to_rfc3339()),
            time_queue: record.time_queue(),
            time_query: record.time_query(),
            execution_duration: record.execution_duration,
            schema_name: job.details.schema_name.clone(),
            table_name: job.details.table_name.clone(),
            queue: job.details.queue.clone(),
            query_language: job.details.query_language.clone(),
            query: job.details.query.clone(),
            native_query: job.details.native_query.clone(),
            nrows: job.details.nrows,
            size: job.details.size,
            columns: job.column_names().into_iter().map(String::from).collect(),
            result_status: job.result_status().to_string(),
            error_summary: record.error_summary.clone(),
        }
    }
}

pub fn parse_job_id(value: &str) -> Result<JobId> {
    JobId::parse(value).with_context(|| format!("'{}' is not a job id", value))
}

pub(crate) async fn load_owned(ctx: &JobContext, global: &GlobalArgs, id: &str) -> Result<QueryJob> {
    let id = parse_job_id(id)?;
    let job = QueryJob::load(&ctx.store, &id).await?;
    let requester = global.identity();
    if job.job.owner_name() != display_name(requester.as_ref()) {
        anyhow::bail!("Job {} was not found", id);
    }
    Ok(job)
}

fn print_job(job: &QueryJob, json: bool) -> Result<()> {
    let view = JobView::from(job);
    if json {
        return print_json(&view);
    }
    let mut fields = vec![
        ("Job", view.id.clone()),
        ("Owner", view.owner.clone()),
        ("Phase", view.phase.to_string()),
        ("Created", format_time(&job.job.creation_time)),
        ("Started", format_optional_time(job.job.start_time.as_ref())),
        ("Ended", format_optional_time(job.job.end_time.as_ref())),
        ("Time in queue", format_seconds(view.time_queue)),
        ("Time in query", format_seconds(view.time_query)),
        ("Table", format!("{}.{}", view.schema_name, view.table_name)),
    ];
    if !view.queue.is_empty() {
        fields.push(("Queue", view.queue.clone()));
        fields.push(("Language", view.query_language.clone()));
        fields.push(("Query", view.query.clone()));
    }
    if let Some(nrows) = view.nrows {
        fields.push(("Rows", nrows.to_string()));
    }
    if let Some(size) = view.size {
        fields.push(("Size", format_size(size)));
    }
    if !view.columns.is_empty() {
        fields.push(("Columns", view.columns.join(", ")));
    }
    if let Some(summary) = &view.error_summary {
        fields.push(("Error", summary.clone()));
    }
    print_fields(&fields);
    Ok(())
}

pub fn submit(global: &GlobalArgs, args: SubmitArgs) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;

        let mut job = QueryJob::new(global.identity(), args.query.as_str())
            .with_language(args.language.as_str());
        if let Some(queue) = &args.queue {
            job = job.with_queue(queue.as_str());
        }
        if let Some(table) = &args.table {
            job = job.with_table_name(table.as_str());
        }
        if let Some(schema) = &args.schema {
            job = job.with_schema_name(schema.as_str());
        }
        if let Some(format) = &args.format {
            job = job.with_response_format(format.as_str());
        }
        if let Some(max_records) = args.max_records {
            job = job.with_max_records(max_records);
        }

        job.process(&ctx).await?;

        if args.sync {
            return run_sync(&ctx, job, args.output).await;
        }

        job.run(&ctx).await?;
        if args.wait {
            wait_for(&ctx, &mut job, Duration::from_secs(args.timeout)).await?;
        }
        if args.json {
            print_job(&job, true)
        } else {
            println!("Submitted job {} ({})", job.id(), job.phase());
            if job.phase() == Phase::Error {
                if let Some(summary) = &job.job.error_summary {
                    println!("  {}", summary);
                }
            }
            Ok(())
        }
    })
}

async fn run_sync(ctx: &JobContext, mut job: QueryJob, output: Option<PathBuf>) -> Result<()> {
    let mut stream = job.run_sync(ctx).await?;
    let mut writer: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut failure = None;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => writer.write_all(&bytes).await?,
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    writer.flush().await?;
    job.drop_uploads(ctx).await?;

    match failure {
        Some(err) => Err(err).context("Synchronous query failed"),
        None => Ok(()),
    }
}

pub fn upload(global: &GlobalArgs, args: UploadArgs) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let mut job = QueryJob::for_upload(global.identity(), args.table.as_str());
        job.process(&ctx).await?;
        job.ingest(&ctx, &args.file).await?;
        if args.wait {
            wait_for(&ctx, &mut job, Duration::from_secs(args.timeout)).await?;
        }
        if args.json {
            print_job(&job, true)
        } else {
            println!(
                "Upload job {} ({}) into {}.{}",
                job.id(),
                job.phase(),
                job.details.schema_name,
                job.details.table_name
            );
            Ok(())
        }
    })
}

pub fn status(global: &GlobalArgs, id: &str, json: bool) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let job = load_owned(&ctx, global, id).await?;
        print_job(&job, json)
    })
}

pub fn list(global: &GlobalArgs, limit: i64, json: bool) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let identity = global.identity();
        let jobs = QueryJob::list(&ctx.store, identity.as_ref(), limit).await?;

        if json {
            let views: Vec<JobView> = jobs.iter().map(JobView::from).collect();
            return print_json(&views);
        }
        if jobs.is_empty() {
            println!("No jobs.");
            return Ok(());
        }

        let rows = jobs
            .iter()
            .map(|job| {
                vec![
                    (job.id().to_string(), None),
                    (job.phase().to_string(), Some(phase_color(job.phase()))),
                    (job.details.table_name.clone(), None),
                    (format_time(&job.job.creation_time), None),
                    (
                        job.details.nrows.map(|n| n.to_string()).unwrap_or_default(),
                        None,
                    ),
                    (job.details.size.map(format_size).unwrap_or_default(), None),
                ]
            })
            .collect();
        print_table_colored(&["ID", "PHASE", "TABLE", "CREATED", "ROWS", "SIZE"], rows);
        Ok(())
    })
}

pub fn abort(global: &GlobalArgs, id: &str) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let mut job = load_owned(&ctx, global, id).await?;
        job.abort(&ctx).await?;
        println!("Job {} is {}", job.id(), job.phase());
        Ok(())
    })
}

pub fn archive(global: &GlobalArgs, id: &str) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let mut job = load_owned(&ctx, global, id).await?;
        job.archive(&ctx).await?;
        println!("Job {} is {}", job.id(), job.phase());
        Ok(())
    })
}

pub fn delete(global: &GlobalArgs, id: &str) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let job = load_owned(&ctx, global, id).await?;
        let id = job.id().clone();
        job.delete(&ctx).await?;
        println!("Deleted job {}", id);
        Ok(())
    })
}

pub fn rename(global: &GlobalArgs, id: &str, table: &str) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let mut job = load_owned(&ctx, global, id).await?;
        job.rename_table(&ctx, table).await?;
        println!(
            "Job {} now writes to {}.{}",
            job.id(),
            job.details.schema_name,
            job.details.table_name
        );
        Ok(())
    })
}

pub fn examples(global: &GlobalArgs, json: bool) -> Result<()> {
    let config = context::load_config(global.config.as_deref())?;
    let identity = global.identity();
    let examples = config.examples_for(identity.as_ref());

    if json {
        return print_json(&examples);
    }
    if examples.is_empty() {
        println!("No examples.");
        return Ok(());
    }
    let rows = examples
        .iter()
        .map(|example| {
            vec![
                example.name.clone(),
                example.query_language.clone(),
                example.description.clone().unwrap_or_default(),
                example.query_string.clone(),
            ]
        })
        .collect();
    print_table(&["NAME", "LANGUAGE", "DESCRIPTION", "QUERY"], rows);
    Ok(())
}

pub fn queues(global: &GlobalArgs, json: bool) -> Result<()> {
    let config = context::load_config(global.config.as_deref())?;
    let identity = global.identity();
    let queues = config.permitted_queues(identity.as_ref());

    if json {
        return print_json(&serde_json::json!({
            "queues": queues,
            "languages": config.languages,
            "download_formats": config.download_formats,
        }));
    }

    print_table(
        &["QUEUE", "LABEL", "TIMEOUT", "PRIORITY"],
        queues
            .iter()
            .map(|q| {
                vec![
                    q.key.clone(),
                    q.label.clone(),
                    format!("{}s", q.timeout),
                    q.priority.to_string(),
                ]
            })
            .collect(),
    );
    print_table(
        &["LANGUAGE", "VERSION", "LABEL"],
        config
            .languages
            .iter()
            .map(|l| {
                vec![
                    l.key.clone(),
                    l.version.clone().unwrap_or_default(),
                    l.label.clone(),
                ]
            })
            .collect(),
    );
    print_table(
        &["FORMAT", "EXTENSION", "LABEL"],
        config
            .download_formats
            .iter()
            .map(|f| vec![f.key.clone(), f.extension.clone(), f.label.clone()])
            .collect(),
    );
    Ok(())
}

pub fn records(global: &GlobalArgs, limit: i64, json: bool) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let records = ctx.store.records(limit).await?;
        if json {
            return print_json(&records);
        }
        let rows = records
            .iter()
            .map(|record| {
                vec![
                    format_time(&record.time),
                    record.resource_type.clone(),
                    record.user.clone().unwrap_or_else(|| "anonymous".to_string()),
                    record.resource["job_id"].as_str().unwrap_or("-").to_string(),
                    record.resource["query"].as_str().unwrap_or_default().to_string(),
                ]
            })
            .collect();
        print_table(&["TIME", "TYPE", "USER", "JOB", "QUERY"], rows);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_id() {
        let id = JobId::new();
        assert_eq!(parse_job_id(id.as_str()).unwrap(), id);
        assert!(parse_job_id("not-a-uuid").is_err());
    }

    #[test]
    fn test_job_view_of_a_new_job() {
        let job = QueryJob::new(None, "SELECT 1").with_table_name("t1");
        let view = JobView::from(&job);
        assert_eq!(view.phase, Phase::Pending);
        assert_eq!(view.owner, "anonymous");
        assert_eq!(view.table_name, "t1");
        assert_eq!(view.result_status, "OK");
        assert!(view.time_queue.is_none());
    }
}
