//! Byte-level checks for uploaded images.
//!
//! Declared MIME type and filename extension are client supplied and never
//! trusted on their own: the leading bytes must carry the signature of the
//! declared format before anything is decoded or stored.

use thiserror::Error;

/// Largest accepted upload, in bytes (10 MiB).
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

pub const ALLOWED_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];
pub const ALLOWED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

const JPEG_SIGNATURE: [Option<u8>; 3] = [Some(0xff), Some(0xd8), Some(0xff)];
const PNG_SIGNATURE: [Option<u8>; 4] = [Some(0x89), Some(0x50), Some(0x4e), Some(0x47)];
// Bytes 4..8 of a RIFF container hold the chunk length.
const WEBP_SIGNATURE: [Option<u8>; 12] = [
    Some(0x52),
    Some(0x49),
    Some(0x46),
    Some(0x46),
    None,
    None,
    None,
    None,
    Some(0x57),
    Some(0x45),
    Some(0x42),
    Some(0x50),
];

/// The raster formats accepted for upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    WebP,
}

impl ImageKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }

    fn signature(self) -> &'static [Option<u8>] {
        match self {
            Self::Jpeg => &JPEG_SIGNATURE,
            Self::Png => &PNG_SIGNATURE,
            Self::WebP => &WEBP_SIGNATURE,
        }
    }

    /// True when `bytes` starts with this format's magic bytes.
    pub fn matches(self, bytes: &[u8]) -> bool {
        let signature = self.signature();
        bytes.len() >= signature.len()
            && signature
                .iter()
                .zip(bytes)
                .all(|(expected, actual)| expected.is_none_or(|b| b == *actual))
    }
}

/// An uploaded file as received, before any processing.
#[derive(Debug, Clone, Copy)]
pub struct CandidateFile<'a> {
    pub bytes: &'a [u8],
    pub content_type: &'a str,
    pub filename: &'a str,
}

/// Why a candidate file was refused. The `Display` text is shown to users.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FileRejection {
    #[error("Invalid file type. Only JPEG, PNG, and WebP are allowed.")]
    UnsupportedType(String),
    #[error("Invalid file extension. Only jpg, jpeg, png and webp files are allowed.")]
    UnsupportedExtension(String),
    #[error("File too large. Maximum size is 10MB.")]
    TooLarge(usize),
    #[error("File is empty.")]
    Empty,
    #[error("File content does not match declared type.")]
    ContentMismatch(ImageKind),
}

/// Lowercased extension of `filename`, if it has one.
pub fn extension_of(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() && ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Check a candidate file. Pure: the same input always yields the same verdict.
pub fn validate(file: &CandidateFile<'_>) -> Result<ImageKind, FileRejection> {
    let kind = ImageKind::from_mime(file.content_type)
        .ok_or_else(|| FileRejection::UnsupportedType(file.content_type.to_string()))?;

    let extension = extension_of(file.filename).unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(FileRejection::UnsupportedExtension(extension));
    }

    if file.bytes.len() > MAX_FILE_SIZE {
        return Err(FileRejection::TooLarge(file.bytes.len()));
    }
    if file.bytes.is_empty() {
        return Err(FileRejection::Empty);
    }

    if !kind.matches(file.bytes) {
        return Err(FileRejection::ContentMismatch(kind));
    }

    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10];
    const PNG: &[u8] = &[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];
    const WEBP: &[u8] = b"RIFF\x24\x00\x00\x00WEBPVP8 ";
    const PDF: &[u8] = b"%PDF-1.7\n";

    fn candidate<'a>(bytes: &'a [u8], content_type: &'a str, filename: &'a str) -> CandidateFile<'a> {
        CandidateFile {
            bytes,
            content_type,
            filename,
        }
    }

    #[test]
    fn accepts_matching_signatures() {
        assert_eq!(validate(&candidate(JPEG, "image/jpeg", "a.jpg")), Ok(ImageKind::Jpeg));
        assert_eq!(validate(&candidate(JPEG, "image/jpeg", "a.JPEG")), Ok(ImageKind::Jpeg));
        assert_eq!(validate(&candidate(PNG, "image/png", "a.png")), Ok(ImageKind::Png));
        assert_eq!(validate(&candidate(WEBP, "image/webp", "a.webp")), Ok(ImageKind::WebP));
    }

    #[test]
    fn webp_length_field_is_unconstrained() {
        let bytes = b"RIFF\xff\xee\xdd\xccWEBP";
        assert!(ImageKind::WebP.matches(bytes));
        assert!(!ImageKind::WebP.matches(b"RIFF\x00\x00\x00\x00WAVE"));
    }

    #[test]
    fn rejects_pdf_declared_as_jpeg() {
        let err = validate(&candidate(PDF, "image/jpeg", "x.jpg")).unwrap_err();
        assert_eq!(err, FileRejection::ContentMismatch(ImageKind::Jpeg));
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn rejects_signature_of_a_different_allowed_type() {
        let err = validate(&candidate(PNG, "image/jpeg", "x.jpg")).unwrap_err();
        assert!(matches!(err, FileRejection::ContentMismatch(ImageKind::Jpeg)));
    }

    #[test]
    fn rejects_unknown_mime_and_extension() {
        assert!(matches!(
            validate(&candidate(JPEG, "image/gif", "a.jpg")),
            Err(FileRejection::UnsupportedType(_))
        ));
        assert!(matches!(
            validate(&candidate(JPEG, "image/jpeg", "a.gif")),
            Err(FileRejection::UnsupportedExtension(_))
        ));
        assert!(matches!(
            validate(&candidate(JPEG, "image/jpeg", "noextension")),
            Err(FileRejection::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn rejects_oversized_and_truncated_files() {
        let mut big = vec![0u8; MAX_FILE_SIZE + 1];
        big[..3].copy_from_slice(&[0xff, 0xd8, 0xff]);
        assert_eq!(
            validate(&candidate(&big, "image/jpeg", "a.jpg")),
            Err(FileRejection::TooLarge(MAX_FILE_SIZE + 1))
        );
        assert_eq!(
            validate(&candidate(&[0xff, 0xd8], "image/jpeg", "a.jpg")),
            Err(FileRejection::ContentMismatch(ImageKind::Jpeg))
        );
        assert_eq!(
            validate(&candidate(&[], "image/jpeg", "a.jpg")),
            Err(FileRejection::Empty)
        );
    }

    #[test]
    fn verdict_is_repeatable() {
        let file = candidate(PDF, "image/png", "scan.png");
        assert_eq!(validate(&file), validate(&file));
        let file = candidate(PNG, "image/png", "scan.png");
        assert_eq!(validate(&file), validate(&file));
    }
}
