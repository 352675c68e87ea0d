//! Multipart payloads for `upload` and the single-page endpoints.

use reqwest::multipart::{Form, Part};
use reqwest::Body;
use scan2ebook_api_types::fields;

use crate::application::error::ServiceError;
use crate::domain::{JobRequest, PageImage, ValidationError};

/// Value of one multipart field, before it is turned into a `reqwest` part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue<'a> {
    File(&'a PageImage),
    Text(String),
}

/// Fields of an upload in wire order: pages as repeated `files`, then the
/// cover, the title and, only when set, `skip_summary`.
pub fn form_fields(request: &JobRequest) -> Vec<(&'static str, FieldValue<'_>)> {
    let mut plan: Vec<(&'static str, FieldValue<'_>)> = request
        .pages()
        .iter()
        .map(|page| (fields::FILES, FieldValue::File(page)))
        .collect();
    if let Some(cover) = request.cover() {
        plan.push((fields::COVER, FieldValue::File(cover)));
    }
    plan.push((
        fields::TITLE,
        FieldValue::Text(request.effective_title().to_owned()),
    ));
    if let Some(skip) = request.skip_summary() {
        plan.push((fields::SKIP_SUMMARY, FieldValue::Text(skip.to_string())));
    }
    plan
}

pub(super) fn upload_form(request: &JobRequest) -> Result<Form, ServiceError> {
    form_fields(request)
        .into_iter()
        .try_fold(Form::new(), |form, (name, value)| -> Result<Form, ServiceError> {
            Ok(match value {
                FieldValue::File(page) => form.part(name, file_part(page)?),
                FieldValue::Text(text) => form.text(name, text),
            })
        })
}

pub(super) fn single_file_form(page: &PageImage) -> Result<Form, ServiceError> {
    Ok(Form::new().part(fields::FILE, file_part(page)?))
}

// The part shares the image's buffer instead of copying it.
fn file_part(page: &PageImage) -> Result<Part, ValidationError> {
    Part::stream_with_length(Body::from(page.data().clone()), page.len() as u64)
        .file_name(page.file_name().to_owned())
        .mime_str(page.content_type())
        .map_err(|_| ValidationError::invalid_content_type(page.file_name(), page.content_type()))
}
