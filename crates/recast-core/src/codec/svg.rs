//! SVG rasterization at the document's native `viewBox` size.

use image::{DynamicImage, RgbaImage};
use quick_xml::events::Event;
use quick_xml::Reader;
use resvg::{tiny_skia, usvg};

use super::{CanonicalImage, CodecError, MAX_RASTER_PIXELS};
use crate::format::ImageFormat;

/// The `viewBox` of a document's root element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewBox {
    pub min_x: f32,
    pub min_y: f32,
    pub width: f32,
    pub height: f32,
}

impl ViewBox {
    /// Raster size with fractional edges rounded up.
    pub fn pixel_size(&self) -> (u32, u32) {
        (self.width.ceil() as u32, self.height.ceil() as u32)
    }
}

/// Render `bytes` into an RGBA raster sized by the root `viewBox`.
pub fn rasterize(bytes: &[u8]) -> Result<CanonicalImage, CodecError> {
    let view_box = read_view_box(bytes)?;
    let (width, height) = view_box.pixel_size();
    if u64::from(width) * u64::from(height) > MAX_RASTER_PIXELS {
        return Err(CodecError::decode(
            ImageFormat::Svg,
            format!("viewBox {width}x{height} exceeds the {MAX_RASTER_PIXELS} pixel limit"),
        ));
    }

    let tree = usvg::Tree::from_data(bytes, &render_options())
        .map_err(|e| CodecError::decode(ImageFormat::Svg, e))?;

    let mut pixmap = tiny_skia::Pixmap::new(width, height).ok_or_else(|| {
        CodecError::decode(ImageFormat::Svg, format!("cannot allocate {width}x{height} canvas"))
    })?;

    let size = tree.size();
    let transform = tiny_skia::Transform::from_scale(
        width as f32 / size.width(),
        height as f32 / size.height(),
    );
    resvg::render(&tree, transform, &mut pixmap.as_mut());

    let mut raster = Vec::with_capacity(pixmap.data().len());
    for pixel in pixmap.pixels() {
        let c = pixel.demultiply();
        raster.extend_from_slice(&[c.red(), c.green(), c.blue(), c.alpha()]);
    }
    let image = RgbaImage::from_raw(width, height, raster).ok_or_else(|| {
        CodecError::decode(ImageFormat::Svg, "rendered buffer does not match its size")
    })?;
    Ok(CanonicalImage::new(DynamicImage::ImageRgba8(image)))
}

/// Parser options that keep rendering inside the uploaded document: `data:`
/// images are still embedded, but an `href` naming a path or URL resolves
/// to nothing instead of being read from disk.
fn render_options() -> usvg::Options<'static> {
    usvg::Options {
        resources_dir: None,
        image_href_resolver: usvg::ImageHrefResolver {
            resolve_data: usvg::ImageHrefResolver::default_data_resolver(),
            resolve_string: Box::new(|_, _| None),
        },
        ..usvg::Options::default()
    }
}

/// Find the root `<svg>` element and parse its `viewBox`.
pub fn read_view_box(bytes: &[u8]) -> Result<ViewBox, CodecError> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if !e.local_name().as_ref().eq_ignore_ascii_case(b"svg") {
                    return Err(CodecError::decode(ImageFormat::Svg, "root element is not <svg>"));
                }
                let attr = e
                    .try_get_attribute("viewBox")
                    .map_err(|err| CodecError::decode(ImageFormat::Svg, err))?
                    .ok_or_else(|| CodecError::decode(ImageFormat::Svg, "missing viewBox"))?;
                let value = attr
                    .unescape_value()
                    .map_err(|err| CodecError::decode(ImageFormat::Svg, err))?;
                return parse_view_box(&value);
            }
            Ok(Event::Eof) => {
                return Err(CodecError::decode(ImageFormat::Svg, "no <svg> element"));
            }
            Ok(_) => {}
            Err(err) => return Err(CodecError::decode(ImageFormat::Svg, err)),
        }
        buf.clear();
    }
}

fn parse_view_box(value: &str) -> Result<ViewBox, CodecError> {
    let invalid = || CodecError::decode(ImageFormat::Svg, format!("invalid viewBox {value:?}"));

    let numbers = value
        .split(|c: char| c.is_ascii_whitespace() || c == ',')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<f32>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;
    let [min_x, min_y, width, height] = numbers[..] else {
        return Err(invalid());
    };
    if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
        return Err(invalid());
    }
    Ok(ViewBox {
        min_x,
        min_y,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_view_box_with_commas_and_spaces() {
        let vb = parse_view_box("0, 0 ,12.5  4").unwrap();
        assert_eq!(vb.width, 12.5);
        assert_eq!(vb.pixel_size(), (13, 4));
    }

    #[test]
    fn rejects_bad_view_boxes() {
        for value in ["", "0 0 10", "0 0 -1 5", "0 0 10 0", "a b c d", "0 0 10 10 10"] {
            assert!(parse_view_box(value).is_err(), "{value:?} should fail");
        }
    }

    #[test]
    fn missing_view_box_is_an_error() {
        let doc = br#"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"/>"#;
        let err = rasterize(doc).unwrap_err();
        assert!(err.to_string().contains("missing viewBox"), "{err}");
    }

    #[test]
    fn renders_at_view_box_size() {
        let doc = br##"<?xml version="1.0"?>
            <svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 20 10" width="200" height="100">
              <rect x="0" y="0" width="10" height="10" fill="#ff0000"/>
            </svg>"##;
        let image = rasterize(doc).unwrap();
        assert_eq!((image.width(), image.height()), (20, 10));

        let rgba = image.as_dynamic().to_rgba8();
        assert_eq!(rgba.get_pixel(5, 5).0, [255, 0, 0, 255]);
        assert_eq!(rgba.get_pixel(15, 5).0[3], 0);
    }

    #[test]
    fn external_image_href_is_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("secret.svg");
        std::fs::write(
            &secret,
            r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 4 4"><rect width="4" height="4" fill="red"/></svg>"#,
        )
        .unwrap();

        let doc = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 4 4"><image href="{}" width="4" height="4"/></svg>"#,
            secret.display()
        );
        let image = rasterize(doc.as_bytes()).unwrap();
        let rgba = image.as_dynamic().to_rgba8();
        assert!(rgba.pixels().all(|p| p.0[3] == 0), "external file was drawn");
    }

    #[test]
    fn oversized_view_box_is_refused_before_rendering() {
        let doc = br#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 100000 100000"/>"#;
        let err = rasterize(doc).unwrap_err();
        assert!(err.to_string().contains("pixel limit"), "{err}");
    }
}
