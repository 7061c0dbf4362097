//! Content-addressed key derivation.
//!
//! Pure functions that turn (filename, content hash, owner) into the
//! storage-backend key and public URL for a file.  Key derivation is
//! deterministic: concurrent session-creation races for the same hash
//! converge on one key, which is what lets `set_session_if_absent`
//! reconcile the losers.

use chrono::NaiveDate;
use std::path::Path;

/// Derive the object-store key for a file.
///
/// Layout: `{YYYY-MM-DD}/{owner_id}/{content_hash}{ext}`: a date
/// partition, then the owner, then the hash with the original file
/// extension preserved. Same inputs always yield the same key.
pub fn derive_object_key(
    filename: &str,
    content_hash: &str,
    owner_id: &str,
    date: NaiveDate,
) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    format!("{}/{owner_id}/{content_hash}{ext}", date.format("%Y-%m-%d"))
}

/// Guess the MIME type from the filename extension, defaulting to
/// `application/octet-stream`.
pub fn mime_type(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .to_string()
}

/// Render the public URL a completed object is reachable at.
pub fn public_url(bucket: &str, region: &str, key: &str) -> String {
    format!("https://{bucket}.s3.{region}.amazonaws.com/{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 9).unwrap()
    }

    #[test]
    fn test_derive_object_key_layout() {
        let key = derive_object_key("photo.jpg", "abc123", "42", date());
        assert_eq!(key, "2024-04-09/42/abc123.jpg");
    }

    #[test]
    fn test_derive_object_key_deterministic() {
        let a = derive_object_key("report.pdf", "deadbeef", "7", date());
        let b = derive_object_key("report.pdf", "deadbeef", "7", date());
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_object_key_no_extension() {
        let key = derive_object_key("Makefile", "cafe", "1", date());
        assert_eq!(key, "2024-04-09/1/cafe");
    }

    #[test]
    fn test_derive_object_key_ignores_directories_in_name() {
        // Only the extension of the final component matters.
        let key = derive_object_key("archive.tar.gz", "ff", "9", date());
        assert_eq!(key, "2024-04-09/9/ff.gz");
    }

    #[test]
    fn test_mime_type_known() {
        assert_eq!(mime_type("a.png"), "image/png");
        assert_eq!(mime_type("doc.pdf"), "application/pdf");
    }

    #[test]
    fn test_mime_type_unknown_defaults() {
        assert_eq!(mime_type("blob.unknownext"), "application/octet-stream");
        assert_eq!(mime_type("noext"), "application/octet-stream");
    }

    #[test]
    fn test_public_url() {
        assert_eq!(
            public_url("upstore", "eu-north-1", "2024-04-09/42/abc.jpg"),
            "https://upstore.s3.eu-north-1.amazonaws.com/2024-04-09/42/abc.jpg"
        );
    }
}
