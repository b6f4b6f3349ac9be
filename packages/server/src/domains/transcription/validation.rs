//! Submission input validation.

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use crate::kernel::jobs::{ModelSize, OutputFormat};

pub const MAX_URL_LEN: usize = 2048;

/// Characters that have no business in a video URL and are dangerous if the
/// URL ever reaches a shell.
const DENIED_URL_CHARS: &[char] = &['&', '|', ';', '`', '$', '(', ')'];

lazy_static! {
    static ref LANGUAGE_CODE: Regex = Regex::new(r"^([a-z]{2,3})(-[a-z]{2})?$").expect("valid regex");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

impl FieldError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Check a submitted URL and return its trimmed form.
pub fn validate_video_url(raw: &str, allowed_domains: &[String]) -> Result<String, FieldError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FieldError::new("video_url", "must not be empty"));
    }
    if trimmed.len() > MAX_URL_LEN {
        return Err(FieldError::new(
            "video_url",
            format!("must be at most {MAX_URL_LEN} bytes"),
        ));
    }
    if let Some(c) = trimmed.chars().find(|c| DENIED_URL_CHARS.contains(c)) {
        return Err(FieldError::new(
            "video_url",
            format!("contains forbidden character '{c}'"),
        ));
    }

    let url = Url::parse(trimmed).map_err(|e| FieldError::new("video_url", format!("is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FieldError::new("video_url", "must use http or https"));
    }
    let host = url
        .host_str()
        .map(|h| h.trim_end_matches('.').to_lowercase())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| FieldError::new("video_url", "must include a host"))?;

    if !allowed_domains.is_empty() && !allowed_domains.iter().any(|d| host_matches(&host, d)) {
        return Err(FieldError::new(
            "video_url",
            format!("host '{host}' is not an allowed video source"),
        ));
    }

    Ok(trimmed.to_string())
}

/// `host` equals `domain` or is one of its subdomains.
fn host_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim().trim_start_matches('.').to_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// `None`/"auto" mean detect; otherwise an ISO-639 code, region dropped.
pub fn normalize_language(raw: Option<&str>) -> Result<Option<String>, FieldError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let lowered = raw.to_lowercase();
    if lowered == "auto" {
        return Ok(None);
    }
    match LANGUAGE_CODE.captures(&lowered) {
        Some(caps) => Ok(Some(caps[1].to_string())),
        None => Err(FieldError::new(
            "language",
            format!("'{raw}' is not an ISO-639 language code"),
        )),
    }
}

pub fn parse_output_format(raw: Option<&str>) -> Result<OutputFormat, FieldError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(OutputFormat::default()),
        Some(value) => value
            .to_lowercase()
            .parse()
            .map_err(|_| FieldError::new("output_format", format!("'{value}' must be one of text, subtitle"))),
    }
}

pub fn parse_model_size(raw: Option<&str>) -> Result<ModelSize, FieldError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(ModelSize::default()),
        Some(value) => value.to_lowercase().parse().map_err(|_| {
            FieldError::new(
                "model_size",
                format!("'{value}' must be one of tiny, base, small, medium, large"),
            )
        }),
    }
}
