use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the scan2ebook binary.
#[derive(Debug, Parser)]
#[command(
    name = "scan2ebook",
    version,
    about = "Turn scanned page images into an eBook through a conversion service"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "SCAN2EBOOK_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Upload pages as one job, follow it to the end and save the eBook.
    Convert(Box<ConvertArgs>),
    /// Follow an already submitted job.
    Watch(WatchArgs),
    /// Print one status snapshot of a job as JSON.
    Status(StatusArgs),
    /// Print the recognized HTML of a single page.
    Preview(PreviewArgs),
    /// Recognize pages one at a time, then build the eBook from the text.
    Scan(ScanArgs),
    /// Fetch a finished eBook by its download reference.
    Download(DownloadArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the conversion service base URL.
    #[arg(long = "service-url", value_name = "URL", global = true)]
    pub service_url: Option<String>,

    /// Override the per-request timeout.
    #[arg(long = "request-timeout-seconds", value_name = "SECONDS", global = true)]
    pub request_timeout_seconds: Option<u64>,

    /// Override the directory eBooks are written to.
    #[arg(
        long = "output-dir",
        value_name = "PATH",
        value_hint = ValueHint::DirPath,
        global = true
    )]
    pub output_directory: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PollingOverrides {
    /// Override the delay between status requests.
    #[arg(long = "poll-interval-ms", value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Override how many failed status requests in a row are tolerated.
    #[arg(long = "poll-max-failures", value_name = "COUNT")]
    pub max_consecutive_failures: Option<u32>,

    /// Override how many polls without progress abandon the job (0 disables).
    #[arg(long = "poll-stall-ticks", value_name = "COUNT")]
    pub stall_ticks: Option<u32>,
}

#[derive(Debug, Args, Clone)]
pub struct ConvertArgs {
    /// Page images in reading order.
    #[arg(value_name = "PAGE", value_hint = ValueHint::FilePath)]
    pub pages: Vec<PathBuf>,

    /// Optional cover image.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub cover: Option<PathBuf>,

    /// Book title; blank titles use the service default.
    #[arg(long, value_name = "TITLE")]
    pub title: Option<String>,

    /// Ask the service to skip the summary for a faster conversion.
    #[arg(long = "skip-summary", action = clap::ArgAction::SetTrue)]
    pub skip_summary: bool,

    #[command(flatten)]
    pub download: DownloadTarget,

    #[command(flatten)]
    pub polling: PollingOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct WatchArgs {
    /// Identifier returned when the job was submitted.
    #[arg(value_name = "TASK_ID")]
    pub task_id: String,

    #[command(flatten)]
    pub download: DownloadTarget,

    #[command(flatten)]
    pub polling: PollingOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DownloadTarget {
    /// Where to write the eBook.
    #[arg(long, short, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    /// Print the download link instead of fetching the eBook.
    #[arg(long = "no-download", action = clap::ArgAction::SetTrue)]
    pub no_download: bool,
}

#[derive(Debug, Args, Clone)]
pub struct StatusArgs {
    #[arg(value_name = "TASK_ID")]
    pub task_id: String,
}

#[derive(Debug, Args, Clone)]
pub struct PreviewArgs {
    /// Page image to recognize.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct ScanArgs {
    /// Page images in reading order.
    #[arg(value_name = "PAGE", value_hint = ValueHint::FilePath)]
    pub pages: Vec<PathBuf>,

    #[arg(long, value_name = "TITLE")]
    pub title: Option<String>,

    /// Where to write the eBook.
    #[arg(long, short, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    /// Override how many pages are recognized at once.
    #[arg(long, value_name = "COUNT")]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Args, Clone)]
pub struct DownloadArgs {
    /// Download reference or absolute URL of a finished eBook.
    #[arg(value_name = "REFERENCE")]
    pub reference: String,

    #[arg(long, short, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,
}
