//! Page-at-a-time flow: recognize each page on its own, then assemble the
//! eBook from the recognized texts.

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, instrument};

use crate::domain::{PageImage, ValidationError, job::effective_title};

use super::error::{ServiceError, SubmissionError};
use super::service::{ConversionService, ProcessedPage};

/// Recognize a single page and return the service's HTML rendition.
#[instrument(skip_all, fields(page = page.file_name()))]
pub async fn preview_page<S>(service: &S, page: &PageImage) -> Result<String, SubmissionError>
where
    S: ConversionService + ?Sized,
{
    page.validate()?;
    Ok(service.preview_page(page).await?)
}

/// Recognize `pages` with at most `concurrency` requests in flight and keep
/// the results in page order.
pub async fn recognize_pages<S>(
    service: &S,
    pages: &[PageImage],
    concurrency: usize,
) -> Result<Vec<ProcessedPage>, ServiceError>
where
    S: ConversionService + ?Sized,
{
    stream::iter(pages)
        .map(|page| async move {
            let processed = service.process_page(page).await?;
            debug!(page = page.file_name(), chars = processed.clean.len(), "page recognized");
            Ok::<_, ServiceError>(processed)
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

/// Recognize every page, then ask the service to build the eBook.
#[instrument(skip_all, fields(pages = pages.len(), concurrency = concurrency))]
pub async fn scan_pages<S>(
    service: &S,
    title: &str,
    pages: &[PageImage],
    concurrency: usize,
) -> Result<Bytes, SubmissionError>
where
    S: ConversionService + ?Sized,
{
    if pages.is_empty() {
        return Err(ValidationError::NoPages.into());
    }
    pages.iter().try_for_each(PageImage::validate)?;

    let texts: Vec<String> = recognize_pages(service, pages, concurrency)
        .await?
        .into_iter()
        .map(|page| page.clean)
        .collect();

    let title = effective_title(title);
    info!(title, "generating ebook from recognized pages");
    Ok(service.generate_epub(title, &texts).await?)
}
