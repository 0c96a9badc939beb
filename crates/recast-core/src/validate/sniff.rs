//! Content sniffing over the leading bytes of an upload.
//!
//! Loosely follows the WHATWG mime-sniffing rules for images, with enough of
//! the text rules to tell markup and plain text apart from binary data.

/// Number of leading bytes inspected by the sniffer and the signature check.
pub const SNIFF_LEN: usize = 512;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub const TEXT_HTML: &str = "text/html; charset=utf-8";
pub const TEXT_XML: &str = "text/xml; charset=utf-8";
pub const IMAGE_SVG: &str = "image/svg+xml";

/// MIME types the validator lets through. `application/octet-stream` is
/// the fallback for containers the sniffer cannot identify (TIFF, PSD).
pub const ALLOWED_SNIFFED: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/bmp",
    "image/webp",
    IMAGE_SVG,
    OCTET_STREAM,
];

/// `(pattern, mask, mime)`; a `0x00` mask byte matches anything.
const IMAGE_PATTERNS: &[(&[u8], &[u8], &str)] = &[
    (
        b"\x89PNG\r\n\x1a\n",
        b"\xff\xff\xff\xff\xff\xff\xff\xff",
        "image/png",
    ),
    (b"\xff\xd8\xff", b"\xff\xff\xff", "image/jpeg"),
    (b"GIF87a", b"\xff\xff\xff\xff\xff\xff", "image/gif"),
    (b"GIF89a", b"\xff\xff\xff\xff\xff\xff", "image/gif"),
    (b"BM", b"\xff\xff", "image/bmp"),
    (
        b"RIFF\x00\x00\x00\x00WEBPVP",
        b"\xff\xff\xff\xff\x00\x00\x00\x00\xff\xff\xff\xff\xff\xff",
        "image/webp",
    ),
    (b"\x00\x00\x01\x00", b"\xff\xff\xff\xff", "image/x-icon"),
];

/// Markup openers that make a text prefix HTML.
const HTML_TAGS: &[&[u8]] = &[
    b"<!doctype html",
    b"<html",
    b"<head",
    b"<script",
    b"<iframe",
    b"<h1",
    b"<div",
    b"<font",
    b"<table",
    b"<a",
    b"<style",
    b"<title",
    b"<b",
    b"<body",
    b"<br",
    b"<p",
    b"<!--",
];

/// Derive a MIME type from the leading bytes of a file.
pub fn sniff(prefix: &[u8]) -> &'static str {
    let data = &prefix[..prefix.len().min(SNIFF_LEN)];

    for (pattern, mask, mime) in IMAGE_PATTERNS {
        if masked_match(data, pattern, mask) {
            return mime;
        }
    }

    let text = skip_bom_and_whitespace(data);
    if text.first() == Some(&b'<') {
        if opens_like_svg(text) && mentions_svg_root(text) {
            return IMAGE_SVG;
        }
        if starts_with_ignore_case(text, b"<?xml") {
            return TEXT_XML;
        }
        if HTML_TAGS.iter().any(|tag| starts_with_tag(text, tag)) {
            return TEXT_HTML;
        }
    }

    if !data.is_empty() && data.iter().all(|b| !is_binary_byte(*b)) {
        return TEXT_PLAIN;
    }

    OCTET_STREAM
}

fn masked_match(data: &[u8], pattern: &[u8], mask: &[u8]) -> bool {
    data.len() >= pattern.len()
        && pattern
            .iter()
            .zip(mask)
            .zip(data)
            .all(|((p, m), d)| d & m == p & m)
}

fn skip_bom_and_whitespace(data: &[u8]) -> &[u8] {
    let data = data.strip_prefix(b"\xef\xbb\xbf").unwrap_or(data);
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}

/// An SVG document opens with its root, an XML declaration, a comment or a
/// doctype. Anything else (`<html`, `<body`, ...) is not SVG even when an
/// inline `<svg` follows.
fn opens_like_svg(text: &[u8]) -> bool {
    starts_with_ignore_case(text, b"<svg")
        || starts_with_ignore_case(text, b"<?xml")
        || text.starts_with(b"<!--")
        || starts_with_ignore_case(text, b"<!doctype svg")
}

/// The `<svg` root has to appear within the sniffed window.
fn mentions_svg_root(text: &[u8]) -> bool {
    find_ignore_case(text, b"<svg").is_some_and(|at| {
        text.get(at + 4)
            .is_none_or(|b| b.is_ascii_whitespace() || *b == b'>' || *b == b'/')
    })
}

fn starts_with_tag(text: &[u8], tag: &[u8]) -> bool {
    if !starts_with_ignore_case(text, tag) {
        return false;
    }
    if tag == b"<!--" {
        return true;
    }
    // The tag name has to end here ("<a " or "<a>", not "<abc").
    matches!(text.get(tag.len()), Some(b' ') | Some(b'>'))
}

pub(crate) fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len() && data[..prefix.len()].eq_ignore_ascii_case(prefix)
}

pub(crate) fn find_ignore_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0b | 0x0e..=0x1a | 0x1c..=0x1f)
}
