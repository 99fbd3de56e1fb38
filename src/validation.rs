use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LocalLimits;
use crate::errors::{UploadError, UplinkResult};
use crate::uploader::session::FileDescriptor;

/// A single local pre-check failure, reported before any network traffic.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "camelCase")]
pub enum Violation {
    #[error("File is empty")]
    EmptyFile,

    #[error("File too large: {actual} bytes (limit {limit})")]
    FileTooLarge { actual: u64, limit: u64 },

    #[error("File type .{extension} is not accepted")]
    ExtensionNotAllowed { extension: String },

    #[error("File name has no extension")]
    MissingExtension,

    #[error("Content type {mime} is not accepted")]
    MimeNotAllowed { mime: String },
}

/// Outcome of the local pre-checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCheck {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

/// Runs every local rule against the descriptor and collects all failures,
/// so the caller can show the user the full list at once.
pub fn validate_local(descriptor: &FileDescriptor, limits: &LocalLimits) -> LocalCheck {
    let mut violations = Vec::new();

    if descriptor.byte_size == 0 {
        violations.push(Violation::EmptyFile);
    }

    if descriptor.byte_size > limits.max_file_bytes {
        violations.push(Violation::FileTooLarge {
            actual: descriptor.byte_size,
            limit: limits.max_file_bytes,
        });
    }

    match extension_of(&descriptor.name) {
        Some(extension) => {
            if !extension_allowed(&extension, &limits.allowed_extensions) {
                violations.push(Violation::ExtensionNotAllowed { extension });
            }
        }
        None => violations.push(Violation::MissingExtension),
    }

    let mime = descriptor
        .declared_mime
        .clone()
        .or_else(|| infer_mime(&descriptor.name).map(|m| m.to_string()));
    if let Some(mime) = mime {
        if !mime_allowed(&mime, &limits.allowed_mime_types) {
            violations.push(Violation::MimeNotAllowed { mime });
        }
    }

    LocalCheck {
        valid: violations.is_empty(),
        violations,
    }
}

/// Like [`validate_local`] but collapses failures into an error for call sites
/// that cannot proceed on an invalid file.
pub fn ensure_valid(descriptor: &FileDescriptor, limits: &LocalLimits) -> UplinkResult<()> {
    let check = validate_local(descriptor, limits);
    if check.valid {
        Ok(())
    } else {
        Err(UploadError::Validation {
            violations: check.violations,
        })
    }
}

fn extension_allowed(extension: &str, allowed: &[String]) -> bool {
    // An empty allow-list places no restriction.
    allowed.is_empty() || allowed.iter().any(|a| a.eq_ignore_ascii_case(extension))
}

/// Exact match, or a `type/*` entry matching the whole major type.
fn mime_allowed(mime: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    allowed.iter().any(|entry| {
        if let Some(major) = entry.strip_suffix("/*") {
            mime.split('/').next() == Some(major)
        } else {
            entry.eq_ignore_ascii_case(mime)
        }
    })
}

pub fn extension_of(name: &str) -> Option<String> {
    std::path::Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

/// Content type from the file extension, for payloads that arrive untyped.
pub fn infer_mime(name: &str) -> Option<&'static str> {
    let extension = extension_of(name)?;
    let mime = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "eps" | "ai" => "application/postscript",
        _ => return None,
    };
    Some(mime)
}

/// Strips characters that are unsafe in provider URLs and multipart filenames.
pub fn sanitize_filename(filename: &str) -> String {
    let unsafe_chars = Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap();
    let sanitized = unsafe_chars.replace_all(filename.trim(), "_");

    if sanitized.chars().count() > 120 {
        sanitized.chars().take(120).collect()
    } else {
        sanitized.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalLimits;

    fn descriptor(name: &str, byte_size: u64) -> FileDescriptor {
        FileDescriptor {
            name: name.to_string(),
            byte_size,
            declared_mime: None,
        }
    }

    #[test]
    fn empty_file_is_rejected() {
        let check = validate_local(&descriptor("poster.png", 0), &LocalLimits::default());
        assert!(!check.valid);
        assert!(check.violations.contains(&Violation::EmptyFile));
    }

    #[test]
    fn two_gigabyte_file_exceeds_ceiling() {
        let limits = LocalLimits::default();
        let check = validate_local(&descriptor("banner.pdf", 2_000_000_000), &limits);
        assert!(!check.valid);
        assert_eq!(
            check.violations,
            vec![Violation::FileTooLarge {
                actual: 2_000_000_000,
                limit: limits.max_file_bytes,
            }]
        );
    }

    #[test]
    fn executable_extension_is_rejected() {
        let check = validate_local(&descriptor("payload.exe", 1024), &LocalLimits::default());
        assert!(!check.valid);
        assert!(check.violations.iter().any(|v| matches!(
            v,
            Violation::ExtensionNotAllowed { extension } if extension == "exe"
        )));
    }

    #[test]
    fn wildcard_mime_entries_match_major_type() {
        let allowed = vec!["image/*".to_string(), "application/pdf".to_string()];
        assert!(mime_allowed("image/png", &allowed));
        assert!(mime_allowed("image/tiff", &allowed));
        assert!(mime_allowed("application/pdf", &allowed));
        assert!(!mime_allowed("application/zip", &allowed));
    }

    #[test]
    fn declared_mime_overrides_inference() {
        let mut file = descriptor("artwork.png", 1024);
        file.declared_mime = Some("application/zip".to_string());
        let check = validate_local(&file, &LocalLimits::default());
        assert!(check.violations.iter().any(|v| matches!(
            v,
            Violation::MimeNotAllowed { mime } if mime == "application/zip"
        )));
    }

    #[test]
    fn valid_print_asset_passes() {
        let check = validate_local(&descriptor("artwork.tiff", 900_000_000), &LocalLimits::default());
        assert!(check.valid);
        assert!(check.violations.is_empty());
    }

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(
            sanitize_filename("../../etc/passwd"),
            ".._.._etc_passwd"
        );
        assert_eq!(sanitize_filename("  design v2.svg "), "design v2.svg");
    }

    #[test]
    fn mime_inference_covers_print_formats() {
        assert_eq!(infer_mime("a.PNG"), Some("image/png"));
        assert_eq!(infer_mime("a.pdf"), Some("application/pdf"));
        assert_eq!(infer_mime("a.eps"), Some("application/postscript"));
        assert_eq!(infer_mime("a.unknown"), None);
        assert_eq!(infer_mime("noext"), None);
    }

    #[test]
    fn violations_serialize_with_codes() {
        let json = serde_json::to_string(&Violation::FileTooLarge {
            actual: 10,
            limit: 5,
        })
        .unwrap();
        assert!(json.contains("\"code\":\"fileTooLarge\""));
        let json = serde_json::to_string(&Violation::EmptyFile).unwrap();
        assert_eq!(json, "{\"code\":\"emptyFile\"}");
    }
}
