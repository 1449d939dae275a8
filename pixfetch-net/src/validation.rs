// pixfetch-net/src/validation.rs
use std::collections::BTreeSet;
use std::ops::Range;

use pixfetch_common::error::{FetchError, Result};
use pixfetch_common::{ImageRequest, OutgoingRequest, ResponseMetadata};
use url::Url;

/// Decides whether a completed response is accepted.
pub trait ResponseValidator: Send + Sync {
    /// `Err` carries the reason the response was rejected.
    fn validate(&self, response: &ResponseMetadata, body: &[u8]) -> std::result::Result<(), String>;
}

/// Produces the validator for one fetch, or `None` to accept everything.
pub trait ResponseValidatorFactory: Send + Sync {
    fn validator_for(
        &self,
        image_request: &ImageRequest,
        request: &OutgoingRequest,
    ) -> Option<Box<dyn ResponseValidator>>;
}

/// Checks the HTTP status and, optionally, the media type.
///
/// Responses without a status (file, data) pass the status check. When the
/// response carries no media type the body is sniffed.
#[derive(Debug, Clone)]
pub struct HttpResponseValidator {
    pub acceptable_status_codes: Range<u16>,
    pub acceptable_content_types: Option<Vec<String>>,
}

impl Default for HttpResponseValidator {
    fn default() -> Self {
        Self {
            acceptable_status_codes: 200..300,
            acceptable_content_types: None,
        }
    }
}

impl HttpResponseValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptable_content_types = Some(
            types
                .into_iter()
                .map(|t| t.into().trim().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    fn content_type_matches(&self, actual: &str) -> bool {
        let Some(accepted) = &self.acceptable_content_types else {
            return true;
        };
        accepted.iter().any(|pattern| {
            if pattern == "*/*" || pattern == actual {
                return true;
            }
            match pattern.strip_suffix("/*") {
                Some(top) => actual
                    .split_once('/')
                    .is_some_and(|(actual_top, _)| actual_top == top),
                None => false,
            }
        })
    }
}

impl ResponseValidator for HttpResponseValidator {
    fn validate(&self, response: &ResponseMetadata, body: &[u8]) -> std::result::Result<(), String> {
        if let Some(status) = response.status {
            if !self.acceptable_status_codes.contains(&status) {
                return Err(format!(
                    "Unacceptable status code {} for {}",
                    status, response.url
                ));
            }
        }
        if self.acceptable_content_types.is_some() {
            let actual = response
                .essence()
                .or_else(|| infer::get(body).map(|kind| kind.mime_type().to_string()));
            match actual {
                Some(ref mime) if self.content_type_matches(mime) => {}
                Some(mime) => {
                    return Err(format!(
                        "Unacceptable content type '{}' for {}",
                        mime, response.url
                    ))
                }
                None => {
                    return Err(format!(
                        "Could not determine content type for {}",
                        response.url
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Hands every fetch its own copy of a template validator.
#[derive(Debug, Clone, Default)]
pub struct HttpValidatorFactory {
    template: HttpResponseValidator,
}

impl HttpValidatorFactory {
    pub fn new(template: HttpResponseValidator) -> Self {
        Self { template }
    }
}

impl ResponseValidatorFactory for HttpValidatorFactory {
    fn validator_for(
        &self,
        _image_request: &ImageRequest,
        _request: &OutgoingRequest,
    ) -> Option<Box<dyn ResponseValidator>> {
        Some(Box::new(self.template.clone()))
    }
}

/// Fails with `UnsupportedScheme` unless the URL's scheme is in `supported`.
pub fn validate_scheme(url: &Url, supported: &BTreeSet<String>) -> Result<()> {
    if supported.contains(url.scheme()) {
        Ok(())
    } else {
        Err(FetchError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
            url: url.to_string(),
        })
    }
}
