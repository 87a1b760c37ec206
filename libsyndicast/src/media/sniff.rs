//! Content-type detection for source media
//!
//! Detection runs in two passes: a metadata-only probe of the remote
//! `Content-Type`, then a ranged fetch of the leading bytes checked against
//! file-signature magic numbers. Anything that is neither an image nor a
//! video fails fast.

use reqwest::Client;

use crate::error::{MediaError, Result};
use crate::types::MediaType;

/// How many leading bytes the signature pass requests.
pub const SNIFF_LEN: usize = 64;

/// Match the leading bytes of a file against known media signatures.
///
/// Returns the detected type and MIME string, or `None` when no signature
/// matches.
pub fn sniff_signature(bytes: &[u8]) -> Option<(MediaType, &'static str)> {
    if bytes.len() < 12 {
        return None;
    }

    // Images
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some((MediaType::Image, "image/jpeg"));
    }
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some((MediaType::Image, "image/png"));
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some((MediaType::Image, "image/gif"));
    }
    if bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        return Some((MediaType::Image, "image/webp"));
    }

    // Videos
    if bytes.starts_with(b"RIFF") && &bytes[8..12] == b"AVI " {
        return Some((MediaType::Video, "video/x-msvideo"));
    }
    if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some((MediaType::Video, "video/webm"));
    }
    // ISO BMFF: size (4 bytes) then "ftyp" and a brand
    if &bytes[4..8] == b"ftyp" {
        let brand = &bytes[8..12];
        if brand == b"qt  " {
            return Some((MediaType::Video, "video/quicktime"));
        }
        return Some((MediaType::Video, "video/mp4"));
    }

    None
}

/// Detect the media type of a remote object.
///
/// First asks the server via a HEAD request; if the reported content type is
/// inconclusive, fetches the first [`SNIFF_LEN`] bytes and matches file
/// signatures.
///
/// # Errors
///
/// `MediaError::UnsupportedType` when neither technique yields an image or
/// video type; `MediaError::Download` when the object cannot be reached at
/// all.
pub async fn detect(client: &Client, url: &str) -> Result<(MediaType, String)> {
    if let Some(detected) = probe_content_type(client, url).await {
        return Ok(detected);
    }

    let response = client
        .get(url)
        .header("Range", format!("bytes=0-{}", SNIFF_LEN - 1))
        .send()
        .await
        .map_err(|e| MediaError::Download(format!("Failed to fetch {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(MediaError::Download(format!(
            "Failed to fetch {}: HTTP {}",
            url,
            response.status()
        ))
        .into());
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| MediaError::Download(format!("Failed to read {}: {}", url, e)))?;

    match sniff_signature(&bytes) {
        Some((media_type, mime)) => Ok((media_type, mime.to_string())),
        None => Err(MediaError::UnsupportedType(format!(
            "content at {} is neither image nor video",
            url
        ))
        .into()),
    }
}

/// Metadata-only probe: trust the server's Content-Type when it clearly
/// identifies an image or video.
async fn probe_content_type(client: &Client, url: &str) -> Option<(MediaType, String)> {
    let response = client.head(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)?
        .to_str()
        .ok()?
        .split(';')
        .next()?
        .trim()
        .to_string();

    MediaType::from_mime(&content_type).map(|t| (t, content_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(prefix: &[u8]) -> Vec<u8> {
        let mut bytes = prefix.to_vec();
        bytes.resize(SNIFF_LEN, 0);
        bytes
    }

    #[test]
    fn test_sniff_jpeg() {
        let bytes = padded(&[0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(
            sniff_signature(&bytes),
            Some((MediaType::Image, "image/jpeg"))
        );
    }

    #[test]
    fn test_sniff_png() {
        let bytes = padded(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
        assert_eq!(sniff_signature(&bytes), Some((MediaType::Image, "image/png")));
    }

    #[test]
    fn test_sniff_gif_both_versions() {
        assert_eq!(
            sniff_signature(&padded(b"GIF87a")),
            Some((MediaType::Image, "image/gif"))
        );
        assert_eq!(
            sniff_signature(&padded(b"GIF89a")),
            Some((MediaType::Image, "image/gif"))
        );
    }

    #[test]
    fn test_sniff_webp_vs_avi() {
        let mut webp = padded(b"RIFF");
        webp[8..12].copy_from_slice(b"WEBP");
        assert_eq!(
            sniff_signature(&webp),
            Some((MediaType::Image, "image/webp"))
        );

        let mut avi = padded(b"RIFF");
        avi[8..12].copy_from_slice(b"AVI ");
        assert_eq!(
            sniff_signature(&avi),
            Some((MediaType::Video, "video/x-msvideo"))
        );
    }

    #[test]
    fn test_sniff_mp4_and_quicktime() {
        let mut mp4 = padded(&[0x00, 0x00, 0x00, 0x18]);
        mp4[4..8].copy_from_slice(b"ftyp");
        mp4[8..12].copy_from_slice(b"isom");
        assert_eq!(sniff_signature(&mp4), Some((MediaType::Video, "video/mp4")));

        let mut mov = padded(&[0x00, 0x00, 0x00, 0x14]);
        mov[4..8].copy_from_slice(b"ftyp");
        mov[8..12].copy_from_slice(b"qt  ");
        assert_eq!(
            sniff_signature(&mov),
            Some((MediaType::Video, "video/quicktime"))
        );
    }

    #[test]
    fn test_sniff_webm() {
        let bytes = padded(&[0x1A, 0x45, 0xDF, 0xA3]);
        assert_eq!(
            sniff_signature(&bytes),
            Some((MediaType::Video, "video/webm"))
        );
    }

    #[test]
    fn test_sniff_unknown_and_short_input() {
        assert_eq!(sniff_signature(&padded(b"%PDF-1.7")), None);
        assert_eq!(sniff_signature(b"GIF"), None);
        assert_eq!(sniff_signature(&[]), None);
    }
}
