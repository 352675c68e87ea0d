use std::{
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use bytes::Bytes;
use scan2ebook::{
    application::{
        error::{AppError, PollingError, failed_job_message},
        pages,
        polling::{PollOutcome, PollSettings},
        service::ConversionService,
        session::{JobPhase, JobSubmissionClient},
    },
    config::{self, Command, ConvertArgs, DownloadTarget, Settings},
    domain::{JobHandle, JobRequest, JobStatus, PageImage, job::effective_title},
    infra::{http::HttpConversionService, telemetry},
    util::bytes::human_size,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const EPUB_EXTENSION: &str = "epub";
const FALLBACK_STEM: &str = "ebook";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let service = Arc::new(HttpConversionService::new(&settings.service)?);

    match cli_args.command {
        Command::Convert(args) => run_convert(&settings, service, *args).await,
        Command::Watch(args) => {
            let client = session_client(&settings, service);
            let handle = JobHandle::new(args.task_id.trim());
            follow_job(&settings, &client, handle, None, &args.download).await
        }
        Command::Status(args) => run_status(service.as_ref(), &JobHandle::new(args.task_id)).await,
        Command::Preview(args) => {
            let page = read_page(&args.file).await?;
            let html = pages::preview_page(service.as_ref(), &page).await?;
            println!("{html}");
            Ok(())
        }
        Command::Scan(args) => {
            let images = read_pages(&args.pages).await?;
            let title = args.title.unwrap_or_default();
            let epub = pages::scan_pages(
                service.as_ref(),
                &title,
                &images,
                settings.scan.concurrency.get(),
            )
            .await?;
            let path = args
                .output
                .unwrap_or_else(|| titled_output(&settings.output.directory, &title));
            write_artifact(&path, &epub).await
        }
        Command::Download(args) => {
            let epub = service.download(&args.reference).await?;
            let path = args.output.unwrap_or_else(|| {
                referenced_output(&settings.output.directory, &args.reference, None)
            });
            write_artifact(&path, &epub).await
        }
    }
}

fn session_client(settings: &Settings, service: Arc<HttpConversionService>) -> JobSubmissionClient {
    let service: Arc<dyn ConversionService> = service;
    JobSubmissionClient::new(service, PollSettings::from(&settings.polling))
}

async fn run_convert(
    settings: &Settings,
    service: Arc<HttpConversionService>,
    args: ConvertArgs,
) -> Result<(), AppError> {
    let images = read_pages(&args.pages).await?;
    let title = args.title.unwrap_or_default();
    let mut request = JobRequest::new(images).with_title(title.clone());
    if let Some(cover) = args.cover.as_deref() {
        request = request.with_cover(read_page(cover).await?);
    }
    if args.skip_summary {
        request = request.with_skip_summary(true);
    }

    let client = session_client(settings, service);
    let handle = client.submit(&request).await?;
    eprintln!("submitted job {handle}");

    follow_job(settings, &client, handle, Some(&title), &args.download).await
}

/// Poll `handle` to the end and save (or print) the artifact.
async fn follow_job(
    settings: &Settings,
    client: &JobSubmissionClient,
    handle: JobHandle,
    title: Option<&str>,
    target: &DownloadTarget,
) -> Result<(), AppError> {
    client.start_polling(handle.clone(), client.settings().interval, report_progress);

    match client.wait().await.ok_or(AppError::Cancelled)? {
        PollOutcome::Completed(_) => {}
        PollOutcome::Failed(status) => {
            return Err(PollingError::JobFailed(failed_job_message(status.message())).into());
        }
        PollOutcome::Abandoned(err) => return Err(err.into()),
        PollOutcome::Cancelled => return Err(AppError::Cancelled),
    }

    let JobPhase::Success {
        download_url,
        summary,
        ..
    } = client.phase()
    else {
        return Err(AppError::unexpected("job finished without a download link"));
    };

    if let Some(summary) = summary {
        eprintln!("summary: {summary}");
    }
    if target.no_download {
        println!("{download_url}");
        return Ok(());
    }

    let epub = client
        .download_artifact()
        .await?
        .ok_or_else(|| AppError::unexpected("job finished without a download link"))?;
    let path = target.output.clone().unwrap_or_else(|| match title {
        Some(title) => titled_output(&settings.output.directory, title),
        None => referenced_output(&settings.output.directory, &download_url, Some(&handle)),
    });
    write_artifact(&path, &epub).await
}

fn report_progress(status: JobStatus) {
    if status.message().is_empty() {
        eprintln!("[{:>3}%] {}", status.progress(), status.state());
    } else {
        eprintln!(
            "[{:>3}%] {}: {}",
            status.progress(),
            status.state(),
            status.message()
        );
    }
}

async fn run_status<S>(service: &S, handle: &JobHandle) -> Result<(), AppError>
where
    S: ConversionService + ?Sized,
{
    let status = service.status(handle).await?;
    let artifact = status.artifact();
    let body = serde_json::json!({
        "task_id": handle.as_str(),
        "status": status.state().as_str(),
        "progress": status.progress(),
        "message": status.message(),
        "download_url": artifact.map(|artifact| service.artifact_url(&artifact.download_url)),
        "summary": artifact.and_then(|artifact| artifact.summary.as_deref()),
    });
    let text = serde_json::to_string_pretty(&body)
        .map_err(|err| AppError::unexpected(format!("failed to render status: {err}")))?;
    println!("{text}");
    Ok(())
}

async fn read_pages(paths: &[PathBuf]) -> Result<Vec<PageImage>, AppError> {
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        images.push(read_page(path).await?);
    }
    Ok(images)
}

async fn read_page(path: &Path) -> Result<PageImage, AppError> {
    PageImage::from_path(path)
        .await
        .map_err(|err| AppError::io(path, err))
}

/// `{dir}/{slug(title)}.epub`, with blank titles replaced by the default.
fn titled_output(directory: &Path, title: &str) -> PathBuf {
    let stem = slug::slugify(effective_title(title));
    let stem = if stem.is_empty() { FALLBACK_STEM.to_string() } else { stem };
    directory.join(format!("{stem}.{EPUB_EXTENSION}"))
}

/// Name the file after the last path segment of the download reference.
fn referenced_output(directory: &Path, reference: &str, handle: Option<&JobHandle>) -> PathBuf {
    let without_query = reference.split(['?', '#']).next().unwrap_or_default();
    let name = without_query
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| {
            let stem = handle.map_or(FALLBACK_STEM, JobHandle::as_str);
            format!("{stem}.{EPUB_EXTENSION}")
        });
    directory.join(name)
}

async fn write_artifact(path: &Path, data: &Bytes) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| AppError::io(parent, err))?;
    }
    tokio::fs::write(path, data)
        .await
        .map_err(|err| AppError::io(path, err))?;
    info!(path = %path.display(), size = %human_size(data.len() as u64), "ebook saved");
    println!("{}", path.display());
    Ok(())
}
