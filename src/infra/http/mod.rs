//! HTTP transport for the conversion service.

mod form;
mod service;

pub use form::{FieldValue, form_fields};
pub use service::HttpConversionService;
