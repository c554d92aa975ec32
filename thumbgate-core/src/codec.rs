//! Codec seam between the pipeline and the `image` crate.
//!
//! The pipeline only talks to [`Codec`]: detect, decode, resize, encode.
//! [`ImageCodec`] is the production implementation; resize geometry lives
//! in the pure [`plan_resize`] so it can be tested without pixels.

use std::io::{BufReader, Read, Seek, SeekFrom, Write};

use image::codecs::bmp::BmpEncoder;
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Frame, ImageError, ImageFormat, ImageReader, Rgba, RgbaImage};

use crate::error::GatewayError;
use crate::options::{
    source_format_name, JpegEncodingColor, OutputFormat, PngColorType, PngFilterMethod, Quantizer,
    ResizeMode, ResolvedOptions, Sampler,
};

/// Bytes inspected for format magic numbers
const MAGIC_LEN: u64 = 64;

/// Any seekable byte source
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// Image operations the resize pipeline depends on
pub trait Codec: Send + Sync + 'static {
    /// Identify the source format from its leading bytes, rewinding afterwards
    fn detect_format(&self, source: &mut dyn ReadSeek) -> Result<ImageFormat, GatewayError>;

    /// Decode the whole source as `format`
    fn decode(
        &self,
        source: &mut dyn ReadSeek,
        format: ImageFormat,
    ) -> Result<DynamicImage, GatewayError>;

    /// Fit `image` into `target` according to `mode`
    fn resize(
        &self,
        image: &DynamicImage,
        target: (u32, u32),
        mode: ResizeMode,
        sampler: Sampler,
    ) -> Result<DynamicImage, GatewayError>;

    /// Encode into `out` using the resolved output format and options
    fn encode(
        &self,
        image: &DynamicImage,
        options: &ResolvedOptions,
        out: &mut dyn Write,
    ) -> Result<(), GatewayError>;
}

/// [`Codec`] backed by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl Codec for ImageCodec {
    fn detect_format(&self, source: &mut dyn ReadSeek) -> Result<ImageFormat, GatewayError> {
        let mut header = Vec::with_capacity(MAGIC_LEN as usize);
        Read::take(&mut *source, MAGIC_LEN).read_to_end(&mut header)?;
        source.seek(SeekFrom::Start(0))?;

        image::guess_format(&header)
            .ok()
            .filter(|format| source_format_name(*format).is_some())
            .ok_or_else(|| GatewayError::unsupported("Data source is not a supported image format"))
    }

    fn decode(
        &self,
        source: &mut dyn ReadSeek,
        format: ImageFormat,
    ) -> Result<DynamicImage, GatewayError> {
        ImageReader::with_format(BufReader::new(source), format)
            .decode()
            .map_err(|e| image_error("Unable to decode source image", e))
    }

    fn resize(
        &self,
        image: &DynamicImage,
        target: (u32, u32),
        mode: ResizeMode,
        sampler: Sampler,
    ) -> Result<DynamicImage, GatewayError> {
        let plan = plan_resize((image.width(), image.height()), target, mode);
        check_allocation(&plan, image.color().bytes_per_pixel())?;
        Ok(apply_plan(image, &plan, filter_for(sampler)))
    }

    fn encode(
        &self,
        image: &DynamicImage,
        options: &ResolvedOptions,
        out: &mut dyn Write,
    ) -> Result<(), GatewayError> {
        let result = match options.format {
            OutputFormat::Jpeg => encode_jpeg(image, options, out),
            OutputFormat::Png => encode_png(image, options, out),
            OutputFormat::Gif => encode_gif(image, options, out),
            OutputFormat::Bmp => encode_bmp(image, options, out),
            OutputFormat::Webp => encode_webp(image, out),
        };
        result.map_err(|e| {
            image_error(
                &format!("Unable to encode output as {}", options.format.name()),
                e,
            )
        })
    }
}

/// Keep `SizeExceeded` raised by a bounded buffer recognisable
fn image_error(context: &str, err: ImageError) -> GatewayError {
    match err {
        ImageError::IoError(io_err) => io_err.into(),
        other => GatewayError::unsupported(format!("{}: {}", context, other)),
    }
}

fn filter_for(sampler: Sampler) -> FilterType {
    match sampler {
        Sampler::Nearest => FilterType::Nearest,
        Sampler::Triangle => FilterType::Triangle,
        Sampler::Bicubic => FilterType::CatmullRom,
        Sampler::Gaussian => FilterType::Gaussian,
        Sampler::Lanczos3 => FilterType::Lanczos3,
    }
}

/// Geometry of a resize: scale, then optionally crop or pad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    /// Size the whole source is scaled to
    pub scale_to: (u32, u32),
    /// Region of the scaled image kept: x, y, width, height
    pub crop: Option<(u32, u32, u32, u32)>,
    /// Canvas size and the offset of the scaled image on it
    pub pad: Option<((u32, u32), (u32, u32))>,
}

impl ResizePlan {
    fn scale(size: (u32, u32)) -> Self {
        Self {
            scale_to: size,
            crop: None,
            pad: None,
        }
    }

    /// Dimensions of the final image
    pub fn output_size(&self) -> (u32, u32) {
        if let Some((_, _, w, h)) = self.crop {
            (w, h)
        } else if let Some((canvas, _)) = self.pad {
            canvas
        } else {
            self.scale_to
        }
    }
}

/// Compute how a `source` sized image fits into `target` for `mode`.
///
/// Except in [`ResizeMode::Stretch`] the target is first capped to the
/// source resolution, so images are never enlarged.
pub fn plan_resize(source: (u32, u32), target: (u32, u32), mode: ResizeMode) -> ResizePlan {
    let (sw, sh) = (source.0.max(1), source.1.max(1));
    let (tw, th) = (target.0.max(1), target.1.max(1));
    if mode == ResizeMode::Stretch {
        return ResizePlan::scale((tw, th));
    }

    let (tw, th) = (tw.min(sw), th.min(sh));
    let ratio_w = tw as f64 / sw as f64;
    let ratio_h = th as f64 / sh as f64;
    let scaled = |ratio: f64| {
        (
            ((sw as f64 * ratio).round() as u32).max(1),
            ((sh as f64 * ratio).round() as u32).max(1),
        )
    };

    match mode {
        ResizeMode::Max => ResizePlan::scale(scaled(ratio_w.min(ratio_h))),
        ResizeMode::Min => ResizePlan::scale(scaled(ratio_w.max(ratio_h))),
        ResizeMode::Crop => {
            let (w, h) = scaled(ratio_w.max(ratio_h));
            let (cw, ch) = (tw.min(w), th.min(h));
            let crop = if (cw, ch) == (w, h) {
                None
            } else {
                Some(((w - cw) / 2, (h - ch) / 2, cw, ch))
            };
            ResizePlan {
                scale_to: (w, h),
                crop,
                pad: None,
            }
        }
        // with the target capped to the source, boxpad never has room to
        // skip scaling and behaves like pad
        ResizeMode::Pad | ResizeMode::BoxPad => {
            let (w, h) = scaled(ratio_w.min(ratio_h));
            let (w, h) = (w.min(tw), h.min(th));
            let pad = if (w, h) == (tw, th) {
                None
            } else {
                Some(((tw, th), ((tw - w) / 2, (th - h) / 2)))
            };
            ResizePlan {
                scale_to: (w, h),
                crop: None,
                pad,
            }
        }
        ResizeMode::Stretch => ResizePlan::scale((tw, th)),
    }
}

/// Refuse a plan whose pixel buffers would outgrow the default allocation
/// budget of the `image` decoders. Stretch targets are not capped to the
/// source, so this is the only bound on them before pixels are allocated.
pub fn check_allocation(plan: &ResizePlan, bytes_per_pixel: u8) -> Result<(), GatewayError> {
    let limit = image::Limits::default().max_alloc.unwrap_or(u64::MAX);
    for (w, h) in [plan.scale_to, plan.output_size()] {
        let bytes = u64::from(w)
            .saturating_mul(u64::from(h))
            .saturating_mul(u64::from(bytes_per_pixel.max(1)));
        if bytes > limit {
            return Err(GatewayError::unsupported(format!(
                "Resize target {}x{} exceeds the {} byte allocation limit",
                w, h, limit
            )));
        }
    }
    Ok(())
}

fn apply_plan(image: &DynamicImage, plan: &ResizePlan, filter: FilterType) -> DynamicImage {
    let (w, h) = plan.scale_to;
    let mut out = if (w, h) == (image.width(), image.height()) {
        image.clone()
    } else {
        image.resize_exact(w, h, filter)
    };

    if let Some((x, y, cw, ch)) = plan.crop {
        out = out.crop_imm(x, y, cw, ch);
    }
    if let Some(((cw, ch), (x, y))) = plan.pad {
        let mut canvas = RgbaImage::new(cw, ch);
        imageops::overlay(&mut canvas, &out.to_rgba8(), x as i64, y as i64);
        out = DynamicImage::ImageRgba8(canvas);
    }
    out
}

/// Whether transparent areas should be painted over before encoding:
/// only for sources with alpha, an explicitly requested non-png output and
/// a configured replacement colour.
pub fn needs_transparency_replacement(image: &DynamicImage, options: &ResolvedOptions) -> bool {
    image.color().has_alpha()
        && options.format_requested
        && options.format != OutputFormat::Png
        && options.replace_transparency_with.is_some()
}

/// Composite `image` onto a solid background, dropping the alpha channel
pub fn replace_transparency(image: &DynamicImage, background: Rgba<u8>) -> DynamicImage {
    let mut canvas = RgbaImage::from_pixel(image.width(), image.height(), background);
    imageops::overlay(&mut canvas, &image.to_rgba8(), 0, 0);
    DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8())
}

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

const NAMED_COLORS: &[(&str, [u8; 4])] = &[
    ("black", [0, 0, 0, 255]),
    ("white", [255, 255, 255, 255]),
    ("red", [255, 0, 0, 255]),
    ("green", [0, 128, 0, 255]),
    ("lime", [0, 255, 0, 255]),
    ("blue", [0, 0, 255, 255]),
    ("yellow", [255, 255, 0, 255]),
    ("cyan", [0, 255, 255, 255]),
    ("aqua", [0, 255, 255, 255]),
    ("magenta", [255, 0, 255, 255]),
    ("fuchsia", [255, 0, 255, 255]),
    ("gray", [128, 128, 128, 255]),
    ("grey", [128, 128, 128, 255]),
    ("silver", [192, 192, 192, 255]),
    ("maroon", [128, 0, 0, 255]),
    ("olive", [128, 128, 0, 255]),
    ("navy", [0, 0, 128, 255]),
    ("purple", [128, 0, 128, 255]),
    ("teal", [0, 128, 128, 255]),
    ("orange", [255, 165, 0, 255]),
    ("pink", [255, 192, 203, 255]),
    ("transparent", [0, 0, 0, 0]),
];

/// Parse `#rgb`, `#rrggbb`, `#rrggbbaa` (hash optional) or a colour name.
/// Anything else is white.
pub fn parse_color(value: &str) -> Rgba<u8> {
    let value = value.trim();
    parse_hex(value)
        .or_else(|| {
            NAMED_COLORS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(value))
                .map(|(_, rgba)| Rgba(*rgba))
        })
        .unwrap_or(WHITE)
}

fn parse_hex(value: &str) -> Option<Rgba<u8>> {
    let hex = value.strip_prefix('#').unwrap_or(value);
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    match hex.len() {
        3 => {
            let mut rgba = [255u8; 4];
            for (i, c) in hex.chars().enumerate() {
                let nibble = c.to_digit(16)? as u8;
                rgba[i] = nibble * 17;
            }
            Some(Rgba(rgba))
        }
        6 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, 255])),
        8 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
        _ => None,
    }
}

fn encode_jpeg(
    image: &DynamicImage,
    options: &ResolvedOptions,
    out: &mut dyn Write,
) -> Result<(), ImageError> {
    let converted = match options.jpeg_encoding_color {
        Some(JpegEncodingColor::Luminance) => DynamicImage::ImageLuma8(image.to_luma8()),
        _ => DynamicImage::ImageRgb8(image.to_rgb8()),
    };
    let encoder = JpegEncoder::new_with_quality(out, options.quality);
    converted.write_with_encoder(encoder)
}

fn encode_png(
    image: &DynamicImage,
    options: &ResolvedOptions,
    out: &mut dyn Write,
) -> Result<(), ImageError> {
    let compression = match options.compression_level {
        Some(1..=3) => CompressionType::Fast,
        Some(7..=9) => CompressionType::Best,
        _ => CompressionType::Default,
    };
    let filter = match options.png_filter_method {
        Some(PngFilterMethod::NoFilter) => PngFilterType::NoFilter,
        Some(PngFilterMethod::Sub) => PngFilterType::Sub,
        Some(PngFilterMethod::Up) => PngFilterType::Up,
        Some(PngFilterMethod::Average) => PngFilterType::Avg,
        Some(PngFilterMethod::Paeth) => PngFilterType::Paeth,
        Some(PngFilterMethod::Adaptive) | None => PngFilterType::Adaptive,
    };

    let wide = options.bit_depth == Some(16);
    let color_type = options.png_color_type.unwrap_or(if image.color().has_alpha() {
        PngColorType::RgbWithAlpha
    } else {
        PngColorType::Rgb
    });
    let converted = match (color_type, wide) {
        (PngColorType::Grayscale, false) => DynamicImage::ImageLuma8(image.to_luma8()),
        (PngColorType::Grayscale, true) => DynamicImage::ImageLuma16(image.to_luma16()),
        (PngColorType::GrayscaleWithAlpha, false) => {
            DynamicImage::ImageLumaA8(image.to_luma_alpha8())
        }
        (PngColorType::GrayscaleWithAlpha, true) => {
            DynamicImage::ImageLumaA16(image.to_luma_alpha16())
        }
        (PngColorType::Rgb, false) => DynamicImage::ImageRgb8(image.to_rgb8()),
        (PngColorType::Rgb, true) => DynamicImage::ImageRgb16(image.to_rgb16()),
        // indexed png is not available from the encoder
        (PngColorType::RgbWithAlpha | PngColorType::Palette, false) => {
            DynamicImage::ImageRgba8(image.to_rgba8())
        }
        (PngColorType::RgbWithAlpha | PngColorType::Palette, true) => {
            DynamicImage::ImageRgba16(image.to_rgba16())
        }
    };

    let encoder = PngEncoder::new_with_quality(out, compression, filter);
    converted.write_with_encoder(encoder)
}

fn encode_gif(
    image: &DynamicImage,
    options: &ResolvedOptions,
    out: &mut dyn Write,
) -> Result<(), ImageError> {
    let mut rgba = image.to_rgba8();

    // gif transparency is one bit
    if let Some(threshold) = options.transparency_threshold {
        for pixel in rgba.pixels_mut() {
            pixel.0[3] = if pixel.0[3] < threshold { 0 } else { 255 };
        }
    }
    if options.quantizer == Quantizer::WebSafePalette {
        posterize(&mut rgba, 6);
    }
    if let Some(max_colors) = options.max_colors.filter(|m| *m < 256) {
        posterize(&mut rgba, levels_for(max_colors));
    }

    // lower is slower and more accurate
    let speed = match options.quantizer {
        Quantizer::Octree => 1,
        Quantizer::Wu => 10,
        Quantizer::WebSafePalette | Quantizer::WernerPalette => 30,
    };
    let mut encoder = GifEncoder::new_with_speed(out, speed);
    encoder.encode_frame(Frame::new(rgba))
}

/// Largest per-channel level count whose cube stays within `max_colors`
fn levels_for(max_colors: u16) -> u8 {
    let mut levels: u16 = 2;
    while (levels + 1).pow(3) <= max_colors {
        levels += 1;
    }
    levels as u8
}

/// Snap every colour channel to `levels` evenly spaced values
fn posterize(image: &mut RgbaImage, levels: u8) {
    let steps = (levels.max(2) - 1) as f32;
    for pixel in image.pixels_mut() {
        for channel in &mut pixel.0[..3] {
            let snapped = (*channel as f32 * steps / 255.0).round() * 255.0 / steps;
            *channel = snapped.round() as u8;
        }
    }
}

fn encode_bmp(
    image: &DynamicImage,
    options: &ResolvedOptions,
    out: &mut dyn Write,
) -> Result<(), ImageError> {
    let keep_alpha = match options.bit_depth {
        Some(32) => true,
        Some(_) => false,
        None => image.color().has_alpha(),
    };
    let converted = if keep_alpha {
        DynamicImage::ImageRgba8(image.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    };
    let mut out = out;
    let encoder = BmpEncoder::new(&mut out);
    converted.write_with_encoder(encoder)
}

fn encode_webp(image: &DynamicImage, out: &mut dyn Write) -> Result<(), ImageError> {
    let converted = if image.color().has_alpha() {
        DynamicImage::ImageRgba8(image.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    };
    converted.write_with_encoder(WebPEncoder::new_lossless(out))
}
