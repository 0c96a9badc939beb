//! Magic-byte signatures per format.

use crate::format::ImageFormat;
use crate::validate::sniff::{find_ignore_case, starts_with_ignore_case};

/// Identify the true format of a file from its leading bytes.
///
/// Binary signatures are checked first; a prefix that is text and opens an
/// `<svg` root (optionally after an XML declaration, comments or a doctype)
/// is recognised as SVG.
pub fn detect(prefix: &[u8]) -> Option<ImageFormat> {
    if prefix.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some(ImageFormat::Png);
    }
    if prefix.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ImageFormat::Jpeg);
    }
    if prefix.starts_with(b"GIF87a") || prefix.starts_with(b"GIF89a") {
        return Some(ImageFormat::Gif);
    }
    if prefix.len() >= 12 && prefix.starts_with(b"RIFF") && &prefix[8..12] == b"WEBP" {
        return Some(ImageFormat::WebP);
    }
    if prefix.starts_with(b"II*\0") || prefix.starts_with(b"MM\0*") {
        return Some(ImageFormat::Tiff);
    }
    // PSB (version 2) is not supported, only classic PSD.
    if prefix.starts_with(b"8BPS\x00\x01") {
        return Some(ImageFormat::Psd);
    }
    if prefix.len() >= 14 && prefix.starts_with(b"BM") && bmp_header_is_plausible(prefix) {
        return Some(ImageFormat::Bmp);
    }
    if is_svg_document(prefix) {
        return Some(ImageFormat::Svg);
    }
    None
}

/// The two reserved words after the file size are zero in every BMP writer
/// we know of; checking them keeps "BM..." text files out.
fn bmp_header_is_plausible(prefix: &[u8]) -> bool {
    prefix[6..10] == [0, 0, 0, 0]
}

fn is_svg_document(prefix: &[u8]) -> bool {
    let text = prefix.strip_prefix(b"\xef\xbb\xbf").unwrap_or(prefix);
    let Ok(text) = std::str::from_utf8(utf8_boundary(text)) else {
        return false;
    };
    let mut rest = text.trim_start().as_bytes();

    loop {
        if starts_with_ignore_case(rest, b"<svg") {
            return rest
                .get(4)
                .is_none_or(|b| b.is_ascii_whitespace() || *b == b'>' || *b == b'/');
        }
        let close: &[u8] = if rest.starts_with(b"<?") {
            b"?>"
        } else if rest.starts_with(b"<!--") {
            b"-->"
        } else if starts_with_ignore_case(rest, b"<!doctype") {
            b">"
        } else {
            return false;
        };
        let Some(end) = find_ignore_case(rest, close) else {
            return false;
        };
        rest = trim_ascii_start(&rest[end + close.len()..]);
    }
}

/// The prefix may cut a multi-byte character in half; drop the partial tail.
fn utf8_boundary(bytes: &[u8]) -> &[u8] {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes,
        Err(e) if e.error_len().is_none() => &bytes[..e.valid_up_to()],
        Err(_) => bytes,
    }
}

fn trim_ascii_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}
