//! Photoshop (PSD) composite-image reader.
//!
//! Only the merged image stored at the end of the file is read; layers are
//! skipped. Supported: version 1 documents with 8-bit Grayscale, RGB or CMYK
//! channels, raw or PackBits-compressed.

use image::{DynamicImage, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};

use super::{CanonicalImage, CodecError, MAX_RASTER_PIXELS};
use crate::format::ImageFormat;

const SIGNATURE: &[u8; 4] = b"8BPS";
const HEADER_LEN: usize = 26;
/// Photoshop's own ceiling on channels per document.
const MAX_CHANNELS: usize = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColorMode {
    Grayscale,
    Rgb,
    Cmyk,
}

impl ColorMode {
    fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::Grayscale),
            3 => Some(Self::Rgb),
            4 => Some(Self::Cmyk),
            _ => None,
        }
    }

    fn color_channels(self) -> usize {
        match self {
            Self::Grayscale => 1,
            Self::Rgb => 3,
            Self::Cmyk => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    channels: usize,
    width: u32,
    height: u32,
    mode: ColorMode,
}

pub fn decode(bytes: &[u8]) -> Result<CanonicalImage, CodecError> {
    let mut input = ByteReader::new(bytes);
    let header = read_header(&mut input)?;

    // Color mode data, image resources, layer and mask information.
    for _ in 0..3 {
        let len = input.u32()? as usize;
        input.skip(len)?;
    }

    let compression = input.u16()?;
    // Color channels plus an optional alpha; further spot channels are ignored.
    let wanted = (header.mode.color_channels() + 1).min(header.channels);
    let planes = match compression {
        0 => read_raw_planes(&mut input, &header, wanted)?,
        1 => read_packbits_planes(&mut input, &header, wanted)?,
        other => return Err(psd_error(format!("unsupported compression method {other}"))),
    };

    compose(&header, planes).map(CanonicalImage::new)
}

fn read_header(input: &mut ByteReader<'_>) -> Result<Header, CodecError> {
    if input.remaining() < HEADER_LEN || input.take(4)? != SIGNATURE {
        return Err(psd_error("not a Photoshop document"));
    }
    let version = input.u16()?;
    if version != 1 {
        return Err(psd_error(format!("unsupported version {version}")));
    }
    input.skip(6)?;
    let channels = usize::from(input.u16()?);
    let height = input.u32()?;
    let width = input.u32()?;
    let depth = input.u16()?;
    let mode_code = input.u16()?;

    if depth != 8 {
        return Err(psd_error(format!("unsupported bit depth {depth}")));
    }
    let mode = ColorMode::from_code(mode_code)
        .ok_or_else(|| psd_error(format!("unsupported color mode {mode_code}")))?;
    if channels > MAX_CHANNELS {
        return Err(psd_error(format!(
            "{channels} channels exceeds the limit of {MAX_CHANNELS}"
        )));
    }
    if channels < mode.color_channels() {
        return Err(psd_error(format!(
            "{channels} channels is too few for {mode:?}"
        )));
    }
    if width == 0 || height == 0 {
        return Err(psd_error("empty canvas"));
    }
    if u64::from(width) * u64::from(height) > MAX_RASTER_PIXELS {
        return Err(psd_error(format!(
            "{width}x{height} exceeds the {MAX_RASTER_PIXELS} pixel limit"
        )));
    }

    Ok(Header {
        channels,
        width,
        height,
        mode,
    })
}

fn read_raw_planes(
    input: &mut ByteReader<'_>,
    header: &Header,
    wanted: usize,
) -> Result<Vec<Vec<u8>>, CodecError> {
    let plane_len = header.width as usize * header.height as usize;
    (0..wanted)
        .map(|_| input.take(plane_len).map(<[u8]>::to_vec))
        .collect()
}

fn read_packbits_planes(
    input: &mut ByteReader<'_>,
    header: &Header,
    wanted: usize,
) -> Result<Vec<Vec<u8>>, CodecError> {
    let rows = header.height as usize;
    let row_len = header.width as usize;

    // Compressed byte count of every row of every channel, stored up front.
    // Nothing is reserved until the file is known to hold the table.
    let table_rows = header.channels * rows;
    if input.remaining() / 2 < table_rows {
        return Err(psd_error("row length table runs past the end of file"));
    }
    let counts = (0..table_rows)
        .map(|_| input.u16().map(usize::from))
        .collect::<Result<Vec<_>, _>>()?;

    let packed_len: usize = counts[..wanted * rows].iter().sum();
    if packed_len > input.remaining() {
        return Err(psd_error("compressed image data runs past the end of file"));
    }

    let mut planes = Vec::with_capacity(wanted);
    for channel in 0..wanted {
        let mut plane = Vec::with_capacity(row_len * rows);
        for row in 0..rows {
            let packed = input.take(counts[channel * rows + row])?;
            unpack_bits(packed, row_len, &mut plane)?;
        }
        planes.push(plane);
    }
    Ok(planes)
}

/// Expand one PackBits row of exactly `row_len` bytes into `out`.
fn unpack_bits(mut packed: &[u8], row_len: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let target = out.len() + row_len;
    while out.len() < target {
        let Some((&n, rest)) = packed.split_first() else {
            return Err(psd_error("PackBits row ends early"));
        };
        packed = rest;
        let n = n as i8;
        if n >= 0 {
            let count = n as usize + 1;
            if packed.len() < count {
                return Err(psd_error("PackBits literal run is truncated"));
            }
            out.extend_from_slice(&packed[..count]);
            packed = &packed[count..];
        } else if n != -128 {
            let Some((&value, rest)) = packed.split_first() else {
                return Err(psd_error("PackBits repeat run is truncated"));
            };
            packed = rest;
            let count = (1 - isize::from(n)) as usize;
            out.extend(std::iter::repeat_n(value, count));
        }
    }
    if out.len() != target {
        return Err(psd_error("PackBits row overruns its width"));
    }
    Ok(())
}

fn compose(header: &Header, planes: Vec<Vec<u8>>) -> Result<DynamicImage, CodecError> {
    let (w, h) = (header.width, header.height);
    let alpha = planes.len() > header.mode.color_channels();
    let interleave = |channels: &[&Vec<u8>]| -> Vec<u8> {
        let pixels = w as usize * h as usize;
        let mut out = Vec::with_capacity(pixels * channels.len());
        for i in 0..pixels {
            out.extend(channels.iter().map(|plane| plane[i]));
        }
        out
    };
    let size_mismatch = || psd_error("channel data does not match the canvas size");

    let image = match (header.mode, alpha) {
        (ColorMode::Grayscale, false) => {
            GrayImage::from_raw(w, h, interleave(&[&planes[0]])).map(DynamicImage::ImageLuma8)
        }
        (ColorMode::Grayscale, true) => {
            GrayAlphaImage::from_raw(w, h, interleave(&[&planes[0], &planes[1]]))
                .map(DynamicImage::ImageLumaA8)
        }
        (ColorMode::Rgb, false) => {
            RgbImage::from_raw(w, h, interleave(&[&planes[0], &planes[1], &planes[2]]))
                .map(DynamicImage::ImageRgb8)
        }
        (ColorMode::Rgb, true) => RgbaImage::from_raw(
            w,
            h,
            interleave(&[&planes[0], &planes[1], &planes[2], &planes[3]]),
        )
        .map(DynamicImage::ImageRgba8),
        (ColorMode::Cmyk, _) => {
            let pixels = w as usize * h as usize;
            let mut out = Vec::with_capacity(pixels * 4);
            for i in 0..pixels {
                // Stored inverted: 255 means no ink.
                let k = u16::from(planes[3][i]);
                let ink = |c: u8| ((u16::from(c) * k + 127) / 255) as u8;
                let a = if alpha { planes[4][i] } else { 255 };
                out.extend_from_slice(&[ink(planes[0][i]), ink(planes[1][i]), ink(planes[2][i]), a]);
            }
            RgbaImage::from_raw(w, h, out).map(DynamicImage::ImageRgba8)
        }
    };
    image.ok_or_else(size_mismatch)
}

fn psd_error(message: impl std::fmt::Display) -> CodecError {
    CodecError::decode(ImageFormat::Psd, message)
}

/// Big-endian cursor over the document bytes.
struct ByteReader<'a> {
    data: &'a [u8],
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn remaining(&self) -> usize {
        self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.data.len() < len {
            return Err(psd_error("unexpected end of file"));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn skip(&mut self, len: usize) -> Result<(), CodecError> {
        self.take(len).map(|_| ())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}
