//! File name generation and path helpers
//!
//! Turns response metadata into a safe leaf name, and builds the derived
//! paths the pipeline uses: uniquified names (`name (N).ext`) and
//! intermediate names (`name.ext.crdownload`).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use url::Url;

/// Name used when nothing better can be derived
pub const DEFAULT_FILE_NAME: &str = "download";

/// Pick a file name for a download.
///
/// Preference order: Content-Disposition, page-suggested name, last URL
/// path segment, URL host, [`DEFAULT_FILE_NAME`]. The result is a single
/// path component with no characters that are illegal on common
/// filesystems. An extension is added from the mime type when the name
/// has none.
pub fn generate_file_name(
    url: &Url,
    content_disposition: Option<&str>,
    suggested_name: Option<&str>,
    mime_type: &str,
) -> String {
    let raw = content_disposition
        .and_then(parse_content_disposition)
        .or_else(|| suggested_name.map(str::to_string))
        .or_else(|| extract_filename_from_url(url))
        .or_else(|| url.host_str().map(str::to_string))
        .unwrap_or_default();

    let mut name = sanitize_file_name(&raw);
    if name.is_empty() {
        name = DEFAULT_FILE_NAME.to_string();
    }

    if Path::new(&name).extension().is_none() {
        if let Some(ext) = extension_for_mime(mime_type) {
            name.push('.');
            name.push_str(ext);
        }
    }
    name
}

/// Extract the file name from a Content-Disposition header.
///
/// RFC 5987 `filename*=` wins over plain `filename=` when both are present.
pub fn parse_content_disposition(header: &str) -> Option<String> {
    // Look for filename*=UTF-8''... first
    if let Some(start) = find_param(header, "filename*=") {
        let rest = &header[start + 10..];
        // charset'lang'value
        if let Some(quote_start) = rest.find("''") {
            let encoded = &rest[quote_start + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded = encoded[..end].trim().trim_matches('"');
            if let Ok(decoded) = urlencoding::decode(encoded) {
                if !decoded.is_empty() {
                    return Some(decoded.into_owned());
                }
            }
        }
    }

    if let Some(start) = find_param(header, "filename=") {
        let rest = &header[start + 9..];
        let value = if let Some(stripped) = rest.strip_prefix('"') {
            // Quoted filename
            let end = stripped.find('"')?;
            &stripped[..end]
        } else {
            // Unquoted filename
            let end = rest.find(';').unwrap_or(rest.len());
            rest[..end].trim()
        };
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    None
}

// Case-insensitive search for a parameter name at a parameter boundary.
fn find_param(header: &str, name: &str) -> Option<usize> {
    let lower = header.to_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = lower[from..].find(name) {
        let at = from + pos;
        let boundary = lower[..at]
            .chars()
            .next_back()
            .map_or(true, |c| c == ';' || c.is_whitespace());
        if boundary {
            return Some(at);
        }
        from = at + name.len();
    }
    None
}

/// Extract filename from URL path
pub fn extract_filename_from_url(url: &Url) -> Option<String> {
    url.path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())
        .map(|s| {
            // URL decode the filename
            urlencoding::decode(s)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| s.to_string())
        })
}

/// Reduce `raw` to a single safe path component
pub fn sanitize_file_name(raw: &str) -> String {
    // Only the last component survives, whichever separator was used
    let leaf = raw.rsplit(['/', '\\']).next().unwrap_or("");

    let cleaned: String = leaf
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    // Leading dots would make the download a hidden file
    cleaned
        .trim_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string()
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    let ext = match essence.as_str() {
        "text/html" => "html",
        "text/plain" => "txt",
        "text/css" => "css",
        "text/csv" => "csv",
        "application/json" => "json",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/gzip" | "application/x-gzip" => "gz",
        "application/xml" | "text/xml" => "xml",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "audio/mpeg" => "mp3",
        "video/mp4" => "mp4",
        _ => return None,
    };
    Some(ext)
}

/// `dir/name.ext` with `n > 0` becomes `dir/name (n).ext`; `n == 0` is the
/// path itself.
pub fn with_uniquifier(path: &Path, n: u32) -> PathBuf {
    if n == 0 {
        return path.to_path_buf();
    }
    let suffix = format!(" ({})", n);
    let stem = path.file_stem().map(|s| s.to_os_string()).unwrap_or_default();
    let mut name = OsString::from(stem);
    name.push(&suffix);
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}

/// Path of the file while it is still being written: `suffix` appended to
/// the full name, so `a.txt` becomes `a.txt.crdownload`.
pub fn intermediate_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Name for a file whose final name is not yet known
pub fn unconfirmed_name(n: u32, suffix: &str) -> String {
    format!("Unconfirmed {}.{}", n, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_parse_content_disposition() {
        assert_eq!(
            parse_content_disposition("attachment; filename=\"test.zip\""),
            Some("test.zip".to_string())
        );

        assert_eq!(
            parse_content_disposition("attachment; filename=test.zip"),
            Some("test.zip".to_string())
        );

        assert_eq!(
            parse_content_disposition(
                "attachment; filename=\"fallback.txt\"; filename*=UTF-8''na%C3%AFve.txt"
            ),
            Some("naïve.txt".to_string())
        );

        assert_eq!(parse_content_disposition("inline"), None);
        assert_eq!(parse_content_disposition("attachment; filename=\"\""), None);
    }

    #[test]
    fn test_extract_filename_from_url() {
        assert_eq!(
            extract_filename_from_url(&url("https://example.com/path/to/file.zip")),
            Some("file.zip".to_string())
        );

        assert_eq!(
            extract_filename_from_url(&url("https://example.com/path/to/file%20name.zip")),
            Some("file name.zip".to_string())
        );

        assert_eq!(extract_filename_from_url(&url("https://example.com/")), None);
    }

    #[test]
    fn generated_names_prefer_disposition_then_url() {
        let u = url("https://example.com/dl/report.pdf");
        assert_eq!(
            generate_file_name(&u, Some("attachment; filename=\"q3.pdf\""), None, ""),
            "q3.pdf"
        );
        assert_eq!(generate_file_name(&u, None, Some("mine.pdf"), ""), "mine.pdf");
        assert_eq!(generate_file_name(&u, None, None, ""), "report.pdf");
    }

    #[test]
    fn generated_names_fall_back_to_host_and_mime() {
        let u = url("https://example.com/");
        assert_eq!(generate_file_name(&u, None, None, "text/html; charset=utf-8"), "example.com");
        assert_eq!(generate_file_name(&u, None, None, ""), "example.com");

        let u = url("https://example.com/api/export");
        assert_eq!(generate_file_name(&u, None, None, "text/csv"), "export.csv");
    }

    #[test]
    fn traversal_is_stripped() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_file_name("a<b>c?.txt"), "a_b_c_.txt");
        assert_eq!(sanitize_file_name(".."), "");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");

        let u = url("https://example.com/x");
        assert_eq!(
            generate_file_name(&u, Some("attachment; filename=\"../..\""), None, ""),
            DEFAULT_FILE_NAME
        );
    }

    #[test]
    fn uniquifier_goes_before_extension() {
        let p = Path::new("/d/foo.txt");
        assert_eq!(with_uniquifier(p, 0), PathBuf::from("/d/foo.txt"));
        assert_eq!(with_uniquifier(p, 1), PathBuf::from("/d/foo (1).txt"));
        assert_eq!(with_uniquifier(Path::new("/d/README"), 3), PathBuf::from("/d/README (3)"));
    }

    #[test]
    fn intermediate_appends_suffix() {
        assert_eq!(
            intermediate_path(Path::new("/d/foo.txt"), "crdownload"),
            PathBuf::from("/d/foo.txt.crdownload")
        );
        assert_eq!(unconfirmed_name(42, "crdownload"), "Unconfirmed 42.crdownload");
    }
}
