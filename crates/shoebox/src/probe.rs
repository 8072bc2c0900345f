//! Metadata probing behind a capability-set interface.
//!
//! The pipeline only relies on the [`MetadataProbe`] trait; concrete
//! extraction (EXIF tooling, OCR, `file(1)`) lives behind implementations
//! and failures are always non-fatal: a missing MIME yields
//! `application/octet-stream`, missing EXIF or document text yields empty.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::Command;

/// Fallback MIME when nothing can be determined.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Per-file fact extraction. Invoked at most once per file; results are
/// cached on the file record.
pub trait MetadataProbe: Send + Sync {
    /// MIME type for a path; never fails (falls back to octet-stream).
    fn probe_mime(&self, path: &Path) -> String;

    /// EXIF-style key/value facts; empty when unavailable.
    fn probe_exif(&self, _path: &Path) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Leading text of a document, up to `limit` bytes; empty when
    /// unavailable.
    fn probe_doc_head(&self, _path: &Path, _limit: usize) -> String {
        String::new()
    }
}

/// Extension table consulted before shelling out. This is MIME probing,
/// not classification policy; category decisions stay in the rules file.
const EXTENSION_MIME: &[(&str, &str)] = &[
    ("avi", "video/x-msvideo"),
    ("bmp", "image/bmp"),
    ("csv", "text/csv"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("eml", "message/rfc822"),
    ("epub", "application/epub+zip"),
    ("flac", "audio/flac"),
    ("gif", "image/gif"),
    ("gz", "application/gzip"),
    ("heic", "image/heic"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("json", "application/json"),
    ("m4a", "audio/mp4"),
    ("md", "text/markdown"),
    ("mkv", "video/x-matroska"),
    ("mov", "video/quicktime"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("odt", "application/vnd.oasis.opendocument.text"),
    ("ogg", "audio/ogg"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("ppt", "application/vnd.ms-powerpoint"),
    ("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    ("raw", "image/x-raw"),
    ("rtf", "application/rtf"),
    ("svg", "image/svg+xml"),
    ("tar", "application/x-tar"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("txt", "text/plain"),
    ("wav", "audio/wav"),
    ("webp", "image/webp"),
    ("xls", "application/vnd.ms-excel"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("xml", "application/xml"),
    ("zip", "application/zip"),
];

fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    EXTENSION_MIME
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, m)| *m)
}

/// Default probe: extension table first, then `file --brief --mime-type`
/// when available.
pub struct SystemProbe {
    /// Shell out to file(1) for unknown extensions
    pub use_file_command: bool,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self {
            use_file_command: true,
        }
    }
}

impl MetadataProbe for SystemProbe {
    fn probe_mime(&self, path: &Path) -> String {
        if let Some(mime) = mime_from_extension(path) {
            return mime.to_string();
        }
        if self.use_file_command {
            if let Ok(output) = Command::new("file")
                .args(["--brief", "--mime-type"])
                .arg(path)
                .output()
            {
                if output.status.success() {
                    let mime = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !mime.is_empty() {
                        return mime;
                    }
                }
            }
        }
        OCTET_STREAM.to_string()
    }

    fn probe_doc_head(&self, path: &Path, limit: usize) -> String {
        if limit == 0 {
            return String::new();
        }
        let mime = self.probe_mime(path);
        if !mime.starts_with("text/") && mime != "application/json" && mime != "application/xml" {
            return String::new();
        }
        let Ok(file) = std::fs::File::open(path) else {
            return String::new();
        };
        let mut buf = vec![0u8; limit];
        let mut taken = file.take(limit as u64);
        let Ok(read) = taken.read(&mut buf) else {
            return String::new();
        };
        buf.truncate(read);
        String::from_utf8_lossy(&buf).to_string()
    }
}

/// Test probe returning fixed MIME types by extension.
#[derive(Default)]
pub struct FixedProbe {
    pub mimes: BTreeMap<String, String>,
    pub exif: BTreeMap<String, BTreeMap<String, String>>,
}

impl MetadataProbe for FixedProbe {
    fn probe_mime(&self, path: &Path) -> String {
        if let Some(mime) = self.mimes.get(&path.to_string_lossy().to_string()) {
            return mime.clone();
        }
        mime_from_extension(path)
            .map(str::to_string)
            .unwrap_or_else(|| OCTET_STREAM.to_string())
    }

    fn probe_exif(&self, path: &Path) -> BTreeMap<String, String> {
        self.exif
            .get(&path.to_string_lossy().to_string())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_table_covers_common_types() {
        assert_eq!(mime_from_extension(Path::new("a.JPG")), Some("image/jpeg"));
        assert_eq!(mime_from_extension(Path::new("b.pdf")), Some("application/pdf"));
        assert_eq!(mime_from_extension(Path::new("noext")), None);
    }

    #[test]
    fn fixed_probe_falls_back_to_octet_stream() {
        let probe = FixedProbe::default();
        assert_eq!(probe.probe_mime(Path::new("/x/unknown.zzz")), OCTET_STREAM);
        assert_eq!(probe.probe_mime(Path::new("/x/song.mp3")), "audio/mpeg");
    }
}
