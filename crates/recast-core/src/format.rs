//! Image format tags shared by the validator, the codec registries and the
//! HTTP layer.

use strum::{AsRefStr, Display, EnumIter, EnumString};

/// A format tag understood by recast.
///
/// Tags parse case-insensitively and accept the common aliases
/// (`jpeg` for [`ImageFormat::Jpeg`], `tif` for [`ImageFormat::Tiff`]).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    AsRefStr,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ImageFormat {
    Png,
    #[strum(to_string = "jpg", serialize = "jpeg")]
    Jpeg,
    Gif,
    Bmp,
    #[strum(to_string = "tiff", serialize = "tif")]
    Tiff,
    #[strum(serialize = "webp")]
    WebP,
    Svg,
    Psd,
}

/// Extensions accepted on upload.
pub const INPUT_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp", "svg", "psd",
];

/// Formats a client may ask for.
pub const OUTPUT_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Gif,
    ImageFormat::Bmp,
];

impl ImageFormat {
    /// Canonical MIME type for this format.
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Tiff => "image/tiff",
            ImageFormat::WebP => "image/webp",
            ImageFormat::Svg => "image/svg+xml",
            ImageFormat::Psd => "image/vnd.adobe.photoshop",
        }
    }

    /// Extension used when naming converted output.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Gif => "gif",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Tiff => "tiff",
            ImageFormat::WebP => "webp",
            ImageFormat::Svg => "svg",
            ImageFormat::Psd => "psd",
        }
    }

    /// Resolve an upload extension (without the dot) against the input
    /// allow-list.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        if !INPUT_EXTENSIONS.contains(&ext.as_str()) {
            return None;
        }
        ext.parse().ok()
    }

    /// Whether the format is a vector document that must be sanitized.
    pub fn is_vector(self) -> bool {
        matches!(self, ImageFormat::Svg)
    }

    /// Whether clients may request this format as conversion output.
    pub fn is_output(self) -> bool {
        OUTPUT_FORMATS.contains(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn aliases_parse_case_insensitively() {
        assert_eq!("JPEG".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert_eq!("jpg".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert_eq!("Tif".parse::<ImageFormat>().unwrap(), ImageFormat::Tiff);
        assert_eq!("WebP".parse::<ImageFormat>().unwrap(), ImageFormat::WebP);
        assert!("heic".parse::<ImageFormat>().is_err());
    }

    #[test]
    fn display_uses_canonical_tag() {
        assert_eq!(ImageFormat::Jpeg.to_string(), "jpg");
        assert_eq!(ImageFormat::Tiff.to_string(), "tiff");
        assert_eq!(ImageFormat::WebP.as_ref(), "webp");
    }

    #[test]
    fn every_format_has_an_allowed_extension() {
        for format in ImageFormat::iter() {
            assert!(INPUT_EXTENSIONS.contains(&format.extension()), "{format}");
            assert_eq!(ImageFormat::from_extension(format.extension()), Some(format));
        }
    }

    #[test]
    fn output_list_excludes_input_only_formats() {
        assert!(ImageFormat::WebP.is_output());
        assert!(!ImageFormat::Svg.is_output());
        assert!(!ImageFormat::Tiff.is_output());
        assert!(!ImageFormat::Psd.is_output());
    }
}
