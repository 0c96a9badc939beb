//! Script-injection scan for SVG uploads.
//!
//! The document is walked once as a token stream; nothing is kept except
//! the current token and a few trailing text bytes, so hostile markup
//! cannot make the scan allocate a tree.

use std::borrow::Cow;
use std::io::{BufReader, Read, Seek};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, warn};

use crate::asset::UploadedAsset;

const SCRIPT_TAG: &[u8] = b"script";
const HANDLER_PREFIX: &[u8] = b"on";
const JS_SCHEME: &[u8] = b"javascript:";

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("SVG contains forbidden script tags")]
    ScriptTag,

    #[error("SVG contains forbidden event handler: {0}")]
    EventHandler(String),

    #[error("SVG contains JavaScript code")]
    JavascriptUri,

    #[error("SVG declares its own entities")]
    EntityDeclaration,

    #[error("SVG references undefined entity: {0}")]
    UnknownEntity(String),

    #[error("malformed SVG markup: {0}")]
    Malformed(String),

    #[error("failed to read SVG: {0}")]
    Read(#[from] std::io::Error),
}

/// Rejects SVG documents that could run script when rendered.
#[derive(Debug, Clone, Default)]
pub struct SvgSanitizer;

impl SvgSanitizer {
    pub fn new() -> Self {
        Self
    }

    /// Scan `asset` and stop at the first violation.
    pub fn scan<R: Read + Seek>(&self, asset: &mut UploadedAsset<R>) -> Result<(), SanitizeError> {
        let result = {
            let mut view = asset.view()?;
            scan_markup(BufReader::new(&mut *view))
        };
        match &result {
            Ok(()) => debug!(filename = %asset.filename(), "SVG passed sanitization"),
            Err(e) => warn!(filename = %asset.filename(), error = %e, "SVG rejected"),
        }
        result
    }
}

fn scan_markup<B: std::io::BufRead>(input: B) -> Result<(), SanitizeError> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(false);

    let mut buf = Vec::with_capacity(1024);
    let mut text = TextWindow::default();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                text.reset();
                check_element(&e)?;
            }
            Ok(Event::Text(e)) => {
                text.feed(&e)?;
            }
            Ok(Event::CData(e)) => {
                text.feed(&e)?;
            }
            Ok(Event::GeneralRef(e)) => {
                let name = e
                    .decode()
                    .map_err(|err| SanitizeError::Malformed(err.to_string()))?;
                let entity = format!("&{name};");
                let resolved = quick_xml::escape::unescape(&entity)
                    .map_err(|_| SanitizeError::UnknownEntity(name.into_owned()))?;
                text.feed(resolved.as_bytes())?;
            }
            // An internal subset can declare entities that expand to markup.
            Ok(Event::DocType(e)) => {
                if e.contains(&b'[') {
                    return Err(SanitizeError::EntityDeclaration);
                }
                text.reset();
            }
            Ok(Event::Eof) => return Ok(()),
            Ok(_) => text.reset(),
            Err(err) => return Err(SanitizeError::Malformed(err.to_string())),
        }
        buf.clear();
    }
}

fn check_element(e: &BytesStart<'_>) -> Result<(), SanitizeError> {
    if e.local_name().as_ref().eq_ignore_ascii_case(SCRIPT_TAG) {
        return Err(SanitizeError::ScriptTag);
    }

    for attr in e.attributes() {
        let attr = attr.map_err(|err| SanitizeError::Malformed(err.to_string()))?;
        let name = attr.key.local_name();
        let name = name.as_ref();
        if name.len() >= HANDLER_PREFIX.len()
            && name[..HANDLER_PREFIX.len()].eq_ignore_ascii_case(HANDLER_PREFIX)
        {
            return Err(SanitizeError::EventHandler(
                String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            ));
        }
        if contains_ignore_ascii_case(&unescaped(&attr.value)?, JS_SCHEME) {
            return Err(SanitizeError::JavascriptUri);
        }
    }
    Ok(())
}

/// Attribute value with entity references resolved. Only predefined and
/// numeric references are accepted.
fn unescaped<'a>(raw: &'a [u8]) -> Result<Cow<'a, [u8]>, SanitizeError> {
    let Ok(text) = std::str::from_utf8(raw) else {
        return Ok(Cow::Borrowed(raw));
    };
    match quick_xml::escape::unescape(text) {
        Ok(Cow::Owned(s)) => Ok(Cow::Owned(s.into_bytes())),
        Ok(Cow::Borrowed(_)) => Ok(Cow::Borrowed(raw)),
        Err(err) => Err(SanitizeError::Malformed(err.to_string())),
    }
}

/// Text-run matcher that keeps the tail of the previous piece so a needle
/// split across adjacent text, CDATA and entity pieces is still found.
#[derive(Debug, Default)]
struct TextWindow {
    carry: Vec<u8>,
}

impl TextWindow {
    fn feed(&mut self, piece: &[u8]) -> Result<(), SanitizeError> {
        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(piece);
        if contains_ignore_ascii_case(&window, JS_SCHEME) {
            return Err(SanitizeError::JavascriptUri);
        }
        let keep_from = window.len().saturating_sub(JS_SCHEME.len() - 1);
        self.carry = window.split_off(keep_from);
        Ok(())
    }

    fn reset(&mut self) {
        self.carry.clear();
    }
}

fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len()
        && haystack
            .windows(needle.len())
            .any(|w| w.eq_ignore_ascii_case(needle))
}
