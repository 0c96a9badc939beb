//! Uploaded assets and the rewind guard used by every stage that inspects
//! them.

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::ops::{Deref, DerefMut};
use std::path::Path;

use bytes::Bytes;
use tracing::warn;

/// Fallback name for uploads that arrive without a usable filename.
const DEFAULT_FILENAME: &str = "upload";

/// A file received from a client, before any decoding.
///
/// The content is only reachable through [`UploadedAsset::view`], which hands
/// out a [`Rewind`] guard, so no stage can leave the cursor somewhere other
/// than the start.
#[derive(Debug)]
pub struct UploadedAsset<R = Cursor<Bytes>> {
    filename: String,
    extension: String,
    size: u64,
    content: R,
}

impl UploadedAsset<Cursor<Bytes>> {
    /// Wrap an in-memory upload. The filename is sanitized here.
    pub fn from_bytes(filename: &str, bytes: Bytes) -> Self {
        let size = bytes.len() as u64;
        Self::new(filename, size, Cursor::new(bytes))
    }

    /// The full upload content, independent of the cursor position.
    pub fn bytes(&self) -> &Bytes {
        self.content.get_ref()
    }

    /// Consume the asset, releasing its bytes for the decoder.
    pub fn into_bytes(self) -> Bytes {
        self.content.into_inner()
    }
}

impl<R: Read + Seek> UploadedAsset<R> {
    /// Build an asset over an arbitrary seekable source of `size` bytes.
    pub fn new(filename: &str, size: u64, content: R) -> Self {
        let filename = sanitize_filename(filename);
        let extension = Path::new(&filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        Self {
            filename,
            extension,
            size,
            content,
        }
    }

    /// Sanitized filename as declared by the client.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Lower-cased extension without the dot; empty when absent.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Filename without its extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(DEFAULT_FILENAME)
    }

    /// Measured size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Borrow the content positioned at its start. The cursor is rewound
    /// again when the guard is dropped.
    pub fn view(&mut self) -> io::Result<Rewind<'_, R>> {
        Rewind::new(&mut self.content)
    }
}

/// Scoped, seekable view that is reset to the start on creation and on
/// every exit path.
#[derive(Debug)]
pub struct Rewind<'a, R: Seek> {
    inner: &'a mut R,
}

impl<'a, R: Seek> Rewind<'a, R> {
    pub fn new(inner: &'a mut R) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner })
    }

    /// Read up to `limit` leading bytes. Short sources yield a short prefix.
    pub fn prefix(&mut self, limit: usize) -> io::Result<Vec<u8>>
    where
        R: Read,
    {
        let mut buf = Vec::with_capacity(limit);
        (&mut *self.inner).take(limit as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Seek> Deref for Rewind<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.inner
    }
}

impl<R: Seek> DerefMut for Rewind<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        self.inner
    }
}

impl<R: Seek> Drop for Rewind<'_, R> {
    fn drop(&mut self) {
        if let Err(e) = self.inner.seek(SeekFrom::Start(0)) {
            warn!(error = %e, "failed to rewind asset view");
        }
    }
}

/// Reduce a client-supplied filename to a safe base name.
///
/// Only the last path component is kept; separators, `:`, quotes, control
/// and non-ASCII characters become `_` so the result can be used both on
/// disk and inside a `Content-Disposition` header.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    let cleaned: String = base
        .chars()
        .map(|c| match c {
            ':' | '"' | '/' | '\\' => '_',
            c if c.is_ascii_control() || !c.is_ascii() => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        DEFAULT_FILENAME.to_owned()
    } else {
        cleaned
    }
}
