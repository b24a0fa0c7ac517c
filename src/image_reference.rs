use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A container image known by repository and tag.
///
/// Identity is `(repository, tag)`; `id` and `size_bytes` are informational and ignored by
/// equality and hashing.
#[derive(Debug, Clone, Serialize)]
pub struct ImageRef {
    repository: String,
    tag: String,
    id: String,
    size_bytes: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingRepository,
    MissingTag,
    InvalidFormat(String),
    DigestNotAllowed,
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "image reference is empty"),
            ParseError::DigestNotAllowed => write!(f, "digest references are not allowed"),
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::MissingTag => write!(f, "tag is missing"),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl PartialEq for ImageRef {
    fn eq(&self, other: &Self) -> bool {
        self.repository == other.repository && self.tag == other.tag
    }
}

impl Eq for ImageRef {}

impl Hash for ImageRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.repository.hash(state);
        self.tag.hash(state);
    }
}

impl ImageRef {
    /// Builds a reference from its two identifying parts; both must be non-empty.
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Result<Self, ParseError> {
        let repository = repository.into();
        let tag = tag.into();
        if repository.is_empty() {
            return Err(ParseError::MissingRepository);
        }
        if tag.is_empty() {
            return Err(ParseError::MissingTag);
        }
        if repository.chars().any(char::is_whitespace) || tag.contains(['/', ':', ' ']) {
            return Err(ParseError::InvalidFormat(format!("{}:{}", repository, tag)));
        }
        Ok(Self {
            repository,
            tag,
            id: String::new(),
            size_bytes: 0,
        })
    }

    pub fn with_details(mut self, id: impl Into<String>, size_bytes: u64) -> Self {
        self.id = id.into();
        self.size_bytes = size_bytes;
        self
    }

    /// Parses `repository[:tag]`, where the repository may carry a registry host with a port.
    /// A missing tag defaults to `latest`, matching the docker CLI.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        // digest references are not supported
        if s.contains('@') {
            return Err(ParseError::DigestNotAllowed);
        }

        // A colon only separates the tag when it comes after the last slash
        let (repository, tag) = match s.rfind(':') {
            Some(pos) if s.rfind('/').is_none_or(|slash| pos > slash) => (&s[..pos], &s[pos + 1..]),
            _ => (s, "latest"),
        };

        if repository.is_empty() || repository.ends_with('/') || repository.starts_with('/') {
            return Err(ParseError::MissingRepository);
        }

        Self::new(repository, tag)
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// A file-name-safe rendering, used to name per-image temporary archives.
    pub fn file_stem(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect()
    }
}

/// Narrows an image listing by repository and, optionally, tag.
#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    pub repository: Option<String>,
    pub tag: Option<String>,
}

impl ImageFilter {
    pub fn exact(image: &ImageRef) -> Self {
        Self {
            repository: Some(image.repository.clone()),
            tag: Some(image.tag.clone()),
        }
    }

    pub fn matches(&self, image: &ImageRef) -> bool {
        self.repository.as_deref().is_none_or(|r| r == image.repository)
            && self.tag.as_deref().is_none_or(|t| t == image.tag)
    }

    /// The `docker images --filter` argument equivalent to this filter, if any.
    pub fn as_reference_filter(&self) -> Option<String> {
        match (&self.repository, &self.tag) {
            (Some(repository), Some(tag)) => Some(format!("reference={}:{}", repository, tag)),
            (Some(repository), None) => Some(format!("reference={}", repository)),
            _ => None,
        }
    }
}

/// Converts docker's human-readable sizes (`"72.8MB"`, `"1.2GB"`, `"512B"`) to bytes.
/// Docker uses decimal units.
pub fn parse_human_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "KB" | "K" => 1e3,
        "MB" | "M" => 1e6,
        "GB" | "G" => 1e9,
        "TB" | "T" => 1e12,
        _ => return None,
    };
    if value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}
