//! Resize request parameters, defaults and resolution.
//!
//! Three layers feed the options a resize actually runs with:
//!
//! ```text
//! query string ──> ResizeParameters (request)
//!                        │ or
//! defaults file ──> format section ──> "*" section ──> built-in table
//!                        │
//!                        v
//!                 ResolvedOptions
//! ```
//!
//! Every field of [`ResizeParameters`] is optional; [`ResizeParameters::or`]
//! fills unset fields from a fallback, which makes precedence explicit.

use std::collections::BTreeMap;
use std::str::FromStr;

use image::ImageFormat;
use serde::Serialize;
use url::{form_urlencoded, Url};

use crate::error::GatewayError;

/// Quality used when neither the request nor the defaults supply one
pub const DEFAULT_QUALITY: u8 = 85;

/// Name of the defaults section that applies to every source format
pub const GLOBAL_SECTION: &str = "*";

macro_rules! keyword_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => [$($alias:literal),+]),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Case-insensitive lookup by name or alias
            pub fn from_name(name: &str) -> Option<Self> {
                let name = name.trim();
                $(
                    if [$($alias),+].iter().any(|alias| alias.eq_ignore_ascii_case(name)) {
                        return Some(Self::$variant);
                    }
                )+
                None
            }

            /// Canonical name
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant => keyword_enum!(@first $($alias),+)),+
                }
            }
        }
    };
    (@first $first:literal $(, $rest:literal)*) => {
        $first
    };
}

keyword_enum! {
    /// How the source is fitted into the requested box
    ResizeMode {
        Crop => ["crop"],
        Pad => ["pad"],
        BoxPad => ["boxpad"],
        Max => ["max"],
        Min => ["min"],
        Stretch => ["stretch"],
    }
}

keyword_enum! {
    /// Resampling filter
    Sampler {
        Nearest => ["nearestneighbor", "nearest", "box"],
        Triangle => ["triangle", "bilinear"],
        Bicubic => ["bicubic", "catmullrom", "hermite", "mitchellnetravali", "robidoux", "robidouxsharp", "spline"],
        Gaussian => ["gaussian"],
        Lanczos3 => ["lanczos3", "lanczos", "lanczos2", "lanczos5", "lanczos8", "welch"],
    }
}

keyword_enum! {
    /// Palette reduction strategy for indexed outputs
    Quantizer {
        Wu => ["wu"],
        Octree => ["octree"],
        WebSafePalette => ["websafepalette", "websafe"],
        WernerPalette => ["wernerpalette", "werner"],
    }
}

keyword_enum! {
    /// Colour model for jpeg output
    JpegEncodingColor {
        YCbCrRatio420 => ["ycbcrratio420"],
        YCbCrRatio444 => ["ycbcrratio444"],
        YCbCrRatio422 => ["ycbcrratio422"],
        Rgb => ["rgb"],
        Luminance => ["luminance"],
    }
}

keyword_enum! {
    /// Colour type for png output
    PngColorType {
        Grayscale => ["grayscale"],
        Rgb => ["rgb"],
        Palette => ["palette"],
        GrayscaleWithAlpha => ["grayscalewithalpha"],
        RgbWithAlpha => ["rgbwithalpha"],
    }
}

keyword_enum! {
    /// Scanline filter for png output
    PngFilterMethod {
        NoFilter => ["none"],
        Sub => ["sub"],
        Up => ["up"],
        Average => ["average"],
        Paeth => ["paeth"],
        Adaptive => ["adaptive"],
    }
}

keyword_enum! {
    /// Colour table placement for gif output
    GifColorTableMode {
        Global => ["global"],
        Local => ["local"],
    }
}

/// Formats the gateway can encode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Webp,
}

impl OutputFormat {
    /// Parse a requested format. Blank means unspecified; anything that is
    /// not a known format falls back to jpeg.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        Some(match value.to_ascii_lowercase().as_str() {
            "png" => Self::Png,
            "gif" => Self::Gif,
            "bmp" => Self::Bmp,
            "webp" => Self::Webp,
            _ => Self::Jpeg,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Bmp => "bmp",
            Self::Webp => "webp",
        }
    }

    /// MIME type sent as the response `Content-Type`
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Bmp => "image/bmp",
            Self::Webp => "image/webp",
        }
    }

    pub fn image_format(&self) -> ImageFormat {
        match self {
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Png => ImageFormat::Png,
            Self::Gif => ImageFormat::Gif,
            Self::Bmp => ImageFormat::Bmp,
            Self::Webp => ImageFormat::WebP,
        }
    }
}

/// Lower-case section name for a decodable source format
pub fn source_format_name(format: ImageFormat) -> Option<&'static str> {
    Some(match format {
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Png => "png",
        ImageFormat::Gif => "gif",
        ImageFormat::Bmp => "bmp",
        ImageFormat::WebP => "webp",
        ImageFormat::Tiff => "tiff",
        ImageFormat::Pnm => "pnm",
        ImageFormat::Tga => "tga",
        ImageFormat::Ico => "ico",
        ImageFormat::Qoi => "qoi",
        _ => return None,
    })
}

/// Output format used when the request does not name one.
///
/// Formats the gateway can also encode map to themselves; legacy or
/// uncommon formats convert to jpeg (photographic) or png (graphics).
pub fn auto_output_format(source: ImageFormat) -> Option<OutputFormat> {
    match source {
        ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
        ImageFormat::Png => Some(OutputFormat::Png),
        ImageFormat::Gif => Some(OutputFormat::Gif),
        ImageFormat::WebP => Some(OutputFormat::Webp),
        ImageFormat::Bmp | ImageFormat::Tiff | ImageFormat::Pnm => Some(OutputFormat::Jpeg),
        ImageFormat::Tga | ImageFormat::Ico | ImageFormat::Qoi => Some(OutputFormat::Png),
        _ => None,
    }
}

/// Optional resize parameters, as supplied by a request or a defaults section
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize_mode: Option<ResizeMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampler: Option<Sampler>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantizer: Option<Quantizer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jpeg_encoding_color: Option<JpegEncodingColor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub png_color_type: Option<PngColorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub png_filter_method: Option<PngFilterMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gif_color_table_mode: Option<GifColorTableMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_colors: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dither: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transparency_threshold: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_transparency_with: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_pixel_ratio: Option<f64>,
}

impl ResizeParameters {
    /// Built-in defaults, the last fallback for every request
    pub fn builtin() -> Self {
        Self {
            quality: Some(DEFAULT_QUALITY),
            resize_mode: Some(ResizeMode::Max),
            sampler: Some(Sampler::Bicubic),
            quantizer: Some(Quantizer::Wu),
            device_pixel_ratio: Some(1.0),
            ..Self::default()
        }
    }

    /// Parse key/value pairs. Keys are case-insensitive and unknown keys are
    /// ignored; out-of-range values are clamped or dropped per field.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, GatewayError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            params.apply(key.as_ref(), value.as_ref())?;
        }
        Ok(params)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), GatewayError> {
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "width" => {
                self.width = parse_number::<i64>(key, value)?
                    .filter(|w| *w > 0)
                    .and_then(|w| u32::try_from(w).ok());
            }
            "height" => {
                self.height = parse_number::<i64>(key, value)?
                    .filter(|h| *h > 0)
                    .and_then(|h| u32::try_from(h).ok());
            }
            "quality" => {
                self.quality = parse_number::<i64>(key, value)?
                    .filter(|q| (1..=100).contains(q))
                    .map(|q| q as u8);
            }
            "format" => self.format = OutputFormat::parse(value),
            "resizemode" => self.resize_mode = parse_keyword(key, value, ResizeMode::from_name)?,
            // unknown filter names fall back to the default rather than failing
            "sampler" => self.sampler = Sampler::from_name(value),
            "quantizer" => self.quantizer = Quantizer::from_name(value),
            "jpegencodingcolor" | "jpegcolortype" => {
                self.jpeg_encoding_color = parse_keyword(key, value, JpegEncodingColor::from_name)?
            }
            "pngcolortype" => {
                self.png_color_type = parse_keyword(key, value, PngColorType::from_name)?
            }
            "pngfiltermethod" => {
                self.png_filter_method = parse_keyword(key, value, PngFilterMethod::from_name)?
            }
            "gifcolortablemode" => {
                self.gif_color_table_mode =
                    parse_keyword(key, value, GifColorTableMode::from_name)?
            }
            "bitdepth" => self.bit_depth = parse_number(key, value)?,
            "compressionlevel" => {
                self.compression_level = parse_number::<i64>(key, value)?
                    .filter(|c| (1..=9).contains(c))
                    .map(|c| c as u8);
            }
            "maxcolors" => self.max_colors = parse_number(key, value)?,
            "dither" => self.dither = parse_flag(key, value)?,
            "gamma" => self.gamma = parse_number(key, value)?,
            "transparencythreshold" => self.transparency_threshold = parse_number(key, value)?,
            "replacetransparencywith" => {
                self.replace_transparency_with =
                    Some(value.to_string()).filter(|v| !v.is_empty())
            }
            "devicepixelratio" => {
                self.device_pixel_ratio = parse_number::<f64>(key, value)?
                    .map(|dpr| if dpr.is_finite() && dpr >= 1.0 { dpr } else { 1.0 });
            }
            _ => {}
        }
        Ok(())
    }

    /// Fill every unset field from `fallback`
    pub fn or(self, fallback: &Self) -> Self {
        Self {
            width: self.width.or(fallback.width),
            height: self.height.or(fallback.height),
            quality: self.quality.or(fallback.quality),
            format: self.format.or(fallback.format),
            resize_mode: self.resize_mode.or(fallback.resize_mode),
            sampler: self.sampler.or(fallback.sampler),
            quantizer: self.quantizer.or(fallback.quantizer),
            jpeg_encoding_color: self.jpeg_encoding_color.or(fallback.jpeg_encoding_color),
            png_color_type: self.png_color_type.or(fallback.png_color_type),
            png_filter_method: self.png_filter_method.or(fallback.png_filter_method),
            gif_color_table_mode: self.gif_color_table_mode.or(fallback.gif_color_table_mode),
            bit_depth: self.bit_depth.or(fallback.bit_depth),
            compression_level: self.compression_level.or(fallback.compression_level),
            max_colors: self.max_colors.or(fallback.max_colors),
            dither: self.dither.or(fallback.dither),
            gamma: self.gamma.or(fallback.gamma),
            transparency_threshold: self
                .transparency_threshold
                .or(fallback.transparency_threshold),
            replace_transparency_with: self
                .replace_transparency_with
                .or_else(|| fallback.replace_transparency_with.clone()),
            device_pixel_ratio: self.device_pixel_ratio.or(fallback.device_pixel_ratio),
        }
    }
}

fn invalid(key: &str, value: &str) -> GatewayError {
    GatewayError::validation(format!("Invalid value for {}: '{}'", key, value))
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<Option<T>, GatewayError> {
    if value.is_empty() {
        return Ok(None);
    }
    value.parse().map(Some).map_err(|_| invalid(key, value))
}

fn parse_keyword<T>(
    key: &str,
    value: &str,
    lookup: fn(&str) -> Option<T>,
) -> Result<Option<T>, GatewayError> {
    if value.is_empty() {
        return Ok(None);
    }
    lookup(value).map(Some).ok_or_else(|| invalid(key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<Option<bool>, GatewayError> {
    match value.to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "true" | "1" | "yes" => Ok(Some(true)),
        "false" | "0" | "no" => Ok(Some(false)),
        _ => Err(invalid(key, value)),
    }
}

/// Coalescing key for a raw query string.
///
/// Pairs are decoded, keys lower-cased and the list sorted, so the same
/// parameters in a different order or key case produce the same key.
pub fn fingerprint(raw_query: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(raw_query.as_bytes())
        .map(|(k, v)| (k.to_ascii_lowercase(), v.into_owned()))
        .collect();
    pairs.sort();

    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// A parsed inbound resize request
#[derive(Debug, Clone, PartialEq)]
pub struct ResizeRequest {
    /// Source url, `None` when missing or not a usable absolute url
    pub url: Option<String>,
    pub params: ResizeParameters,
    pairs: Vec<(String, String)>,
}

impl ResizeRequest {
    /// Parse a raw (still percent-encoded) query string
    pub fn parse(raw_query: &str) -> Result<Self, GatewayError> {
        let pairs: Vec<(String, String)> = form_urlencoded::parse(raw_query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let url = pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("url"))
            .and_then(|(_, v)| usable_url(v));
        let params = ResizeParameters::from_pairs(
            pairs
                .iter()
                .filter(|(k, _)| !k.eq_ignore_ascii_case("url"))
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )?;

        Ok(Self { url, params, pairs })
    }

    /// The source url, or a validation error naming what was received
    pub fn require_url(&self) -> Result<&str, GatewayError> {
        match self.url.as_deref() {
            Some(url) if !url.trim().is_empty() => Ok(url),
            _ => {
                let received = self
                    .pairs
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("url"))
                    .map(|(_, v)| v.as_str())
                    .unwrap_or("");
                Err(GatewayError::validation(format!(
                    "Url is required (received: {})",
                    received
                )))
            }
        }
    }

    /// Decoded query pairs in request order
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn fingerprint(&self) -> String {
        let raw = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs.iter())
            .finish();
        fingerprint(&raw)
    }
}

/// An absolute url with a path beyond `/` or a query string
fn usable_url(value: &str) -> Option<String> {
    let parsed = Url::parse(value.trim()).ok()?;
    if parsed.cannot_be_a_base() || parsed.host_str().is_none() {
        return None;
    }
    if parsed.path() != "/" || parsed.query().is_some() {
        Some(parsed.to_string())
    } else {
        None
    }
}

/// Default parameters: a global section plus per-source-format overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResizeDefaults {
    pub global: ResizeParameters,
    pub per_format: BTreeMap<String, ResizeParameters>,
}

impl ResizeDefaults {
    /// Load from a JSON object of sections, e.g.
    /// `{"*": {"quality": "80"}, "gif": {"quantizer": "octree"}}`.
    ///
    /// Values may be strings, numbers or booleans and are parsed with the
    /// same rules as query parameters.
    pub fn from_json_str(json: &str) -> Result<Self, GatewayError> {
        let root: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| GatewayError::validation(format!("Invalid defaults file: {}", e)))?;
        let sections = root
            .as_object()
            .ok_or_else(|| GatewayError::validation("Defaults file must be a JSON object"))?;

        let mut defaults = Self::default();
        for (section, body) in sections {
            let body = body.as_object().ok_or_else(|| {
                GatewayError::validation(format!("Defaults section '{}' must be an object", section))
            })?;
            let pairs = body.iter().map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.as_str(), value)
            });
            let params = ResizeParameters::from_pairs(pairs)?;

            let name = section.trim().to_ascii_lowercase();
            if name == GLOBAL_SECTION {
                defaults.global = params;
            } else {
                let name = if name == "jpg" { "jpeg".to_string() } else { name };
                defaults.per_format.insert(name, params);
            }
        }
        Ok(defaults)
    }

    /// Defaults for a source format: format section, then global, then built-in
    pub fn for_format(&self, source_format: &str) -> ResizeParameters {
        self.per_format
            .get(&source_format.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
            .or(&self.global)
            .or(&ResizeParameters::builtin())
    }
}

/// Concrete options a resize runs with
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: u8,
    pub format: OutputFormat,
    /// Whether the output format came from the request itself
    pub format_requested: bool,
    pub resize_mode: ResizeMode,
    pub sampler: Sampler,
    pub quantizer: Quantizer,
    pub jpeg_encoding_color: Option<JpegEncodingColor>,
    pub png_color_type: Option<PngColorType>,
    pub png_filter_method: Option<PngFilterMethod>,
    pub gif_color_table_mode: Option<GifColorTableMode>,
    pub bit_depth: Option<u8>,
    pub compression_level: Option<u8>,
    pub max_colors: Option<u16>,
    pub dither: bool,
    pub gamma: Option<f32>,
    pub transparency_threshold: Option<u8>,
    pub replace_transparency_with: Option<String>,
    pub device_pixel_ratio: f64,
}

impl ResolvedOptions {
    /// Merge request parameters over the defaults for `source`, deriving the
    /// output format from the source when none is set.
    pub fn resolve(
        request: &ResizeParameters,
        defaults: &ResizeDefaults,
        source: ImageFormat,
    ) -> Result<Self, GatewayError> {
        let source_name = source_format_name(source).ok_or_else(|| {
            GatewayError::unsupported(format!("Source format {:?} is not supported", source))
        })?;
        let merged = request.clone().or(&defaults.for_format(source_name));

        let format = match merged.format {
            Some(format) => format,
            None => auto_output_format(source).ok_or_else(|| {
                GatewayError::unsupported(format!(
                    "Output format for {} sources is not supported",
                    source_name
                ))
            })?,
        };

        Ok(Self {
            width: merged.width,
            height: merged.height,
            quality: merged.quality.unwrap_or(DEFAULT_QUALITY),
            format,
            format_requested: request.format.is_some(),
            resize_mode: merged.resize_mode.unwrap_or(ResizeMode::Max),
            sampler: merged.sampler.unwrap_or(Sampler::Bicubic),
            quantizer: merged.quantizer.unwrap_or(Quantizer::Wu),
            jpeg_encoding_color: merged.jpeg_encoding_color,
            png_color_type: merged.png_color_type,
            png_filter_method: merged.png_filter_method,
            gif_color_table_mode: merged.gif_color_table_mode,
            bit_depth: merged.bit_depth,
            compression_level: merged.compression_level,
            max_colors: merged.max_colors,
            dither: merged.dither.unwrap_or(false),
            gamma: merged.gamma,
            transparency_threshold: merged.transparency_threshold,
            replace_transparency_with: merged.replace_transparency_with,
            device_pixel_ratio: merged.device_pixel_ratio.unwrap_or(1.0).max(1.0),
        })
    }

    /// Requested width scaled by the device pixel ratio
    pub fn effective_width(&self) -> Option<u32> {
        self.width.map(|w| scale_by(w, self.device_pixel_ratio))
    }

    /// Requested height scaled by the device pixel ratio
    pub fn effective_height(&self) -> Option<u32> {
        self.height.map(|h| scale_by(h, self.device_pixel_ratio))
    }

    /// Target box for a source of the given size; missing dimensions take
    /// the source's own.
    pub fn target_size(&self, source: (u32, u32)) -> (u32, u32) {
        (
            self.effective_width().unwrap_or(source.0),
            self.effective_height().unwrap_or(source.1),
        )
    }
}

fn scale_by(value: u32, ratio: f64) -> u32 {
    // tolerate float noise such as 100 * 1.1 = 110.00000000000001
    let scaled = (value as f64 * ratio - 1e-9).ceil();
    scaled.clamp(1.0, u32::MAX as f64) as u32
}
