//! Job submission inputs: page images, the request built from them, and the
//! handle the service hands back.

use std::fmt;
use std::path::Path;

use bytes::Bytes;

use super::error::ValidationError;

/// Title sent when the user leaves it blank.
pub const DEFAULT_TITLE: &str = "My Scanned Book";

const FALLBACK_FILE_NAME: &str = "page.bin";

/// One scanned image, as it will be attached to a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    file_name: String,
    content_type: String,
    data: Bytes,
}

impl PageImage {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Build an image whose content type is guessed from `file_name`.
    pub fn guessed(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let file_name = file_name.into();
        let content_type = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_owned();
        Self::new(file_name, content_type, data)
    }

    /// Read an image from disk.
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(FALLBACK_FILE_NAME)
            .to_owned();
        Ok(Self::guessed(file_name, data))
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The image must carry bytes and a parseable MIME type.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::empty_image(&self.file_name));
        }
        if self.content_type.parse::<mime_guess::Mime>().is_err() {
            return Err(ValidationError::invalid_content_type(
                &self.file_name,
                &self.content_type,
            ));
        }
        Ok(())
    }
}

/// Everything the service needs to start one conversion job.
///
/// Page order is reading order and is preserved on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pages: Vec<PageImage>,
    cover: Option<PageImage>,
    title: String,
    skip_summary: Option<bool>,
}

impl JobRequest {
    pub fn new(pages: Vec<PageImage>) -> Self {
        Self {
            pages,
            cover: None,
            title: String::new(),
            skip_summary: None,
        }
    }

    pub fn with_cover(mut self, cover: PageImage) -> Self {
        self.cover = Some(cover);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Ask the service for the faster mode that skips the summary pass.
    pub fn with_skip_summary(mut self, skip: bool) -> Self {
        self.skip_summary = Some(skip);
        self
    }

    pub fn pages(&self) -> &[PageImage] {
        &self.pages
    }

    pub fn cover(&self) -> Option<&PageImage> {
        self.cover.as_ref()
    }

    /// The title to send, with [`DEFAULT_TITLE`] substituted for a blank one.
    pub fn effective_title(&self) -> &str {
        effective_title(&self.title)
    }

    pub fn skip_summary(&self) -> Option<bool> {
        self.skip_summary
    }

    /// Total number of image bytes that will be uploaded.
    pub fn payload_len(&self) -> usize {
        self.pages.iter().chain(self.cover.iter()).map(PageImage::len).sum()
    }

    /// Local checks that must pass before any network traffic.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.pages.is_empty() {
            return Err(ValidationError::NoPages);
        }
        self.pages
            .iter()
            .chain(self.cover.iter())
            .try_for_each(PageImage::validate)
    }
}

/// Blank titles fall back to [`DEFAULT_TITLE`].
pub fn effective_title(title: &str) -> &str {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        DEFAULT_TITLE
    } else {
        trimmed
    }
}

/// Server-assigned identifier of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(name: &str) -> PageImage {
        PageImage::guessed(name, vec![1_u8, 2, 3])
    }

    #[test]
    fn blank_title_uses_default() {
        let request = JobRequest::new(vec![page("a.png")]).with_title("   ");
        assert_eq!(request.effective_title(), DEFAULT_TITLE);

        let request = JobRequest::new(vec![page("a.png")]).with_title(" Ch1 ");
        assert_eq!(request.effective_title(), "Ch1");
    }

    #[test]
    fn empty_page_list_fails_validation() {
        let request = JobRequest::new(Vec::new()).with_title("Ch1");
        assert_eq!(request.validate(), Err(ValidationError::NoPages));
    }

    #[test]
    fn zero_byte_cover_fails_validation() {
        let request = JobRequest::new(vec![page("a.png")])
            .with_cover(PageImage::guessed("cover.jpg", Vec::<u8>::new()));
        assert_eq!(
            request.validate(),
            Err(ValidationError::empty_image("cover.jpg"))
        );
    }

    #[test]
    fn unparseable_content_type_fails_validation() {
        let request = JobRequest::new(vec![
            page("a.png"),
            PageImage::new("b.png", "not a mime", vec![1_u8]),
        ]);
        assert_eq!(
            request.validate(),
            Err(ValidationError::invalid_content_type("b.png", "not a mime"))
        );
    }

    #[test]
    fn content_type_is_guessed_from_extension() {
        assert_eq!(page("scan.png").content_type(), "image/png");
        assert_eq!(page("scan.JPG").content_type(), "image/jpeg");
        assert_eq!(page("scan").content_type(), "application/octet-stream");
    }

    #[test]
    fn payload_len_counts_cover() {
        let request = JobRequest::new(vec![page("a.png"), page("b.png")])
            .with_cover(page("cover.png"));
        assert_eq!(request.payload_len(), 9);
    }
}
