//! Result commands: page through rows, stream a result and create download
//! and archive files.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use quarry_db::{DbValue, RowFilter};
use quarry_jobs::{ArchiveJob, DownloadJob, RowPage};
use quarry_protocol::Phase;
use tokio::io::AsyncWriteExt;

use crate::cli::context::{self, GlobalArgs};
use crate::cli::jobs::load_owned;
use crate::cli::output::{print_json, print_table};
use crate::cli::worker::wait_for;

/// Arguments for the rows command
#[derive(Args, Debug, Clone)]
pub struct RowsArgs {
    /// Job ID
    pub id: String,

    /// Columns to show (default: all)
    #[arg(short = 'c', long = "column")]
    pub columns: Vec<String>,

    /// Order by this column, descending with a leading '-'
    #[arg(long, allow_hyphen_values = true)]
    pub ordering: Option<String>,

    #[arg(long, default_value = "1")]
    pub page: u64,

    /// Rows per page (0 = all)
    #[arg(long, default_value = "20")]
    pub page_size: u64,

    /// Case-insensitive substring search over the shown columns
    #[arg(long)]
    pub search: Option<String>,

    /// Exact-match filter, COLUMN=VALUE (repeatable)
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    #[arg(long)]
    pub json: bool,
}

/// Arguments for the stream command
#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    /// Job ID
    pub id: String,

    /// Download format
    #[arg(long, default_value = "csv")]
    pub format: String,

    /// Write here instead of stdout
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the download command
#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Job ID of the completed query
    pub id: String,

    /// Download format
    #[arg(long, default_value = "votable")]
    pub format: String,

    /// Wait for the file to be written
    #[arg(long)]
    pub wait: bool,

    #[arg(long, default_value = "300")]
    pub timeout: u64,
}

/// Arguments for the archive-files command
#[derive(Args, Debug, Clone)]
pub struct ArchiveFilesArgs {
    /// Job ID of the completed query
    pub id: String,

    /// Column holding the file paths
    #[arg(long)]
    pub column: String,

    /// Wait for the archive to be written
    #[arg(long)]
    pub wait: bool,

    #[arg(long, default_value = "300")]
    pub timeout: u64,
}

fn build_filter(search: Option<String>, filters: &[String]) -> Result<RowFilter> {
    let mut filter = RowFilter {
        search,
        ..RowFilter::default()
    };
    for entry in filters {
        let (column, value) = entry
            .split_once('=')
            .with_context(|| format!("Filter '{}' is not COLUMN=VALUE", entry))?;
        filter
            .filters
            .entry(column.to_string())
            .or_default()
            .push(value.to_string());
    }
    Ok(filter)
}

fn cell(value: &DbValue) -> String {
    value.to_text().unwrap_or_else(|| "NULL".to_string())
}

fn json_value(value: &DbValue) -> serde_json::Value {
    match value.to_text() {
        Some(text) => serde_json::Value::String(text),
        None => serde_json::Value::Null,
    }
}

pub fn rows(global: &GlobalArgs, args: RowsArgs) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let job = load_owned(&ctx, global, &args.id).await?;
        let filter = build_filter(args.search.clone(), &args.filters)?;
        let (count, page) = job
            .rows(
                &ctx,
                &args.columns,
                args.ordering.as_deref(),
                args.page,
                args.page_size,
                &filter,
            )
            .await?;

        let headers: Vec<String> = if args.columns.is_empty() {
            job.column_names().into_iter().map(String::from).collect()
        } else {
            args.columns.clone()
        };
        let rows: Vec<Vec<DbValue>> = match page {
            RowPage::Values(values) => values.into_iter().map(|v| vec![v]).collect(),
            RowPage::Rows(rows) => rows,
        };

        if args.json {
            let results: Vec<Vec<serde_json::Value>> = rows
                .iter()
                .map(|row| row.iter().map(json_value).collect())
                .collect();
            return print_json(&serde_json::json!({
                "count": count,
                "columns": headers,
                "results": results,
            }));
        }

        let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();
        print_table(
            &header_refs,
            rows.iter()
                .map(|row| row.iter().map(cell).collect())
                .collect(),
        );
        println!("{} rows in total", count);
        Ok(())
    })
}

pub fn stream(global: &GlobalArgs, args: StreamArgs) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let job = load_owned(&ctx, global, &args.id).await?;
        let mut stream = job.stream(&ctx, &args.format)?;

        let mut writer: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &args.output {
            Some(path) => Box::new(
                tokio::fs::File::create(path)
                    .await
                    .with_context(|| format!("Failed to create {}", path.display()))?,
            ),
            None => Box::new(tokio::io::stdout()),
        };
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.context("Streaming the result failed")?;
            writer.write_all(&bytes).await?;
        }
        writer.flush().await?;
        Ok(())
    })
}

pub fn download(global: &GlobalArgs, args: DownloadArgs) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let query = load_owned(&ctx, global, &args.id).await?;

        let mut job = DownloadJob::new(&query.job, args.format.as_str());
        job.process(&ctx).await?;
        job.run(&ctx).await?;
        if args.wait {
            wait_for(&ctx, &mut job, Duration::from_secs(args.timeout)).await?;
        }

        println!("Download job {} ({})", job.id(), job.phase());
        if job.phase() == Phase::Completed {
            if let Some(path) = job.file_path(&ctx.config) {
                println!("  {}", path.display());
            }
        }
        Ok(())
    })
}

pub fn archive_files(global: &GlobalArgs, args: ArchiveFilesArgs) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        let query = load_owned(&ctx, global, &args.id).await?;

        let mut job = ArchiveJob::new(&query.job, args.column.as_str());
        job.process(&ctx).await?;
        job.run(&ctx).await?;
        if args.wait {
            wait_for(&ctx, &mut job, Duration::from_secs(args.timeout)).await?;
        }

        println!(
            "Archive job {} ({}) with {} files",
            job.id(),
            job.phase(),
            job.details.files.len()
        );
        if job.phase() == Phase::Completed {
            if let Some(path) = job.file_path(&ctx.config) {
                println!("  {}", path.display());
            }
        }
        Ok(())
    })
}
