//! Deterministic destination naming.
//!
//! Scheme: `[/][bucket/][root/]{id[0..8]}/{id[8..10]}/{id[10..12]}/{id[12..14]}/{id}[/filename]`
//!
//! The short prefix directories keep any one listing level from holding the
//! whole population. Identical inputs always produce identical paths, so a
//! replayed transfer lands on the object it wrote the first time.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{MigrateError, Result};

const PREFIX_WIDTHS: [usize; 4] = [8, 2, 2, 2];

/// Build the destination path for a source blob id.
pub fn build_destination_path(
    id: &str,
    filename: Option<&str>,
    root_folder: Option<&str>,
    bucket: Option<&str>,
    include_bucket: bool,
    include_leading_slash: bool,
) -> Result<String> {
    if id.is_empty() {
        return Err(MigrateError::Validation("blob id is required".into()));
    }

    let chars: Vec<char> = id.chars().collect();
    let mut segments: Vec<String> = Vec::with_capacity(8);
    let mut start = 0;
    for width in PREFIX_WIDTHS {
        let end = (start + width).min(chars.len());
        if start < end {
            segments.push(chars[start..end].iter().collect());
        }
        start = end;
    }
    segments.push(id.to_string());

    if let Some(name) = filename.filter(|f| !f.is_empty()) {
        segments.push(name.to_string());
    }

    let mut path = segments.join("/");

    let root = normalize_root(root_folder);
    if !root.is_empty() {
        path = format!("{}/{}", root, path);
    }

    if include_bucket {
        let bucket = bucket
            .filter(|b| !b.is_empty())
            .ok_or_else(|| MigrateError::Configuration("bucket name is required".into()))?;
        validate_bucket_name(bucket)?;
        path = format!("{}/{}", bucket, path);
    }

    if include_leading_slash {
        path.insert(0, '/');
    }

    Ok(path)
}

/// Strip leading and trailing separators; unset and empty both mean "no root".
pub fn normalize_root(root_folder: Option<&str>) -> &str {
    root_folder.unwrap_or("").trim_matches('/')
}

/// `attachment; filename=<name>`, or `None` when the blob has no filename.
pub fn content_disposition(filename: Option<&str>) -> Option<String> {
    filename
        .filter(|f| !f.is_empty())
        .map(|f| format!("attachment; filename={}", f))
}

fn bucket_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{1,61}[a-z0-9]$").ok())
        .as_ref()
}

/// Bucket names: 3-63 chars of `[a-z0-9._-]`, alphanumeric at both ends.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    if bucket_regex().is_some_and(|re| re.is_match(name)) {
        Ok(())
    } else {
        Err(MigrateError::Validation(format!(
            "invalid bucket name {:?}: expected 3-63 characters of a-z, 0-9, '.', '-', '_' \
             starting and ending with a letter or digit",
            name
        )))
    }
}
