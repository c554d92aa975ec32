//! The resize pipeline: authorize, fetch, detect, resolve, resize, encode.

use std::sync::Arc;

use axum::http::HeaderMap;
use bytes::Bytes;
use thumbgate_core::codec::{needs_transparency_replacement, parse_color, replace_transparency};
use thumbgate_core::{
    BoundedBuffer, Codec, DomainWhitelist, GatewayError, ImageCodec, ResizeDefaults,
    ResizeRequest, ResolvedOptions, Stage, StageTimer,
};
use tracing::debug;

use crate::config::GatewayConfig;
use crate::coordinator::CachedResponse;
use crate::fetcher::{FetchResult, ResilientFetcher, SourceBuffer};

/// Runs one resize request end to end
pub struct ResizePipeline<C: Codec = ImageCodec> {
    whitelist: DomainWhitelist,
    fetcher: ResilientFetcher,
    codec: Arc<C>,
    defaults: Arc<ResizeDefaults>,
    max_output_size: u64,
    verbose: bool,
}

impl ResizePipeline<ImageCodec> {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        Self::with_codec(config, ImageCodec)
    }
}

impl<C: Codec> ResizePipeline<C> {
    /// Create a pipeline using a specific codec
    pub fn with_codec(config: &GatewayConfig, codec: C) -> Result<Self, GatewayError> {
        Ok(Self {
            whitelist: DomainWhitelist::new(&config.domain_whitelist),
            fetcher: ResilientFetcher::new(config)?,
            codec: Arc::new(codec),
            defaults: Arc::new(config.resize_defaults.clone()),
            max_output_size: config.max_output_image_size,
            verbose: config.verbose,
        })
    }

    pub fn fetcher(&self) -> &ResilientFetcher {
        &self.fetcher
    }

    pub fn whitelist(&self) -> &DomainWhitelist {
        &self.whitelist
    }

    /// Fetch a whitelisted source without transforming it
    pub async fn fetch_source(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<FetchResult, GatewayError> {
        if !self.whitelist.is_allowed(url) {
            return Err(GatewayError::not_allowed(url));
        }
        self.fetcher.fetch(url, headers).await
    }

    /// Produce the resized image and its response headers
    pub async fn run(
        &self,
        request: &ResizeRequest,
        headers: &HeaderMap,
    ) -> Result<CachedResponse, GatewayError> {
        let url = request.require_url()?;
        let mut timer = StageTimer::new(self.verbose);

        let fetched = timer
            .time_async(Stage::Fetch, self.fetch_source(url, headers))
            .await?;
        let FetchResult {
            body,
            headers: upstream,
        } = fetched;

        let codec = self.codec.clone();
        let defaults = self.defaults.clone();
        let request = request.clone();
        let max_output_size = self.max_output_size;

        // decoding pulls the body through a blocking bridge
        let (encoded, options, timer) = tokio::task::spawn_blocking(move || {
            transform(&*codec, body, &request, &defaults, max_output_size, timer)
        })
        .await
        .map_err(|e| GatewayError::unhandled(format!("Resize task failed: {}", e)))??;

        debug!(
            format = options.format.name(),
            bytes = encoded.len(),
            "Encoded output image"
        );

        let mut response_headers: Vec<(String, String)> = upstream.into_iter().collect();
        response_headers.extend(timer.into_headers());
        response_headers.push((
            "content-type".to_string(),
            options.format.mime().to_string(),
        ));
        Ok(CachedResponse::new(response_headers, encoded))
    }
}

fn transform<C: Codec>(
    codec: &C,
    mut source: SourceBuffer,
    request: &ResizeRequest,
    defaults: &ResizeDefaults,
    max_output_size: u64,
    mut timer: StageTimer,
) -> Result<(Bytes, ResolvedOptions, StageTimer), GatewayError> {
    let format = timer.time(Stage::SourceFormatDetection, || {
        codec.detect_format(&mut source)
    })?;
    let options = timer.time(Stage::OutputAutoFormatDetection, || {
        ResolvedOptions::resolve(&request.params, defaults, format)
    })?;

    let image = timer.time(Stage::LoadSource, || codec.decode(&mut source, format))?;
    source.release();

    let resized = timer.time(Stage::Resize, || {
        let image = match options.replace_transparency_with.as_deref() {
            Some(color) if needs_transparency_replacement(&image, &options) => {
                replace_transparency(&image, parse_color(color))
            }
            _ => image,
        };
        let target = options.target_size((image.width(), image.height()));
        codec.resize(&image, target, options.resize_mode, options.sampler)
    })?;

    let encoded = timer.time(Stage::EncodeOutput, || {
        let mut output = BoundedBuffer::new(max_output_size);
        codec.encode(&resized, &options, &mut output)?;
        output.into_bytes().map_err(GatewayError::from)
    })?;

    Ok((encoded, options, timer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage, RgbaImage};
    use std::io::Cursor;
    use thumbgate_core::TIMING_HEADER_PREFIX;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bmp(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Bmp).unwrap();
        out.into_inner()
    }

    fn transparent_png(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    async fn serve(body: Vec<u8>) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/source"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("cache-control", "public, max-age=300")
                    .set_body_bytes(body),
            )
            .mount(&server)
            .await;
        server
    }

    fn request(server: &MockServer, extra: &str) -> ResizeRequest {
        let query = format!("url={}/source{}", server.uri(), extra);
        ResizeRequest::parse(&query).unwrap()
    }

    fn decoded(response: &CachedResponse) -> DynamicImage {
        image::load_from_memory(&response.body).unwrap()
    }

    #[tokio::test]
    async fn test_bmp_resized_to_jpeg() {
        let server = serve(bmp(800, 600)).await;
        let pipeline = ResizePipeline::new(&GatewayConfig::default()).unwrap();

        let response = pipeline
            .run(&request(&server, "&width=400"), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(response.header("content-type"), Some("image/jpeg"));
        assert_eq!(response.header("cache-control"), Some("public, max-age=300"));
        let image = decoded(&response);
        assert_eq!((image.width(), image.height()), (400, 300));
    }

    #[tokio::test]
    async fn test_device_pixel_ratio_and_explicit_format() {
        let server = serve(bmp(800, 600)).await;
        let pipeline = ResizePipeline::new(&GatewayConfig::default()).unwrap();

        let response = pipeline
            .run(
                &request(&server, "&width=100&height=100&resizeMode=crop&format=png&devicePixelRatio=2"),
                &HeaderMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.header("content-type"), Some("image/png"));
        let image = decoded(&response);
        assert_eq!((image.width(), image.height()), (200, 200));
    }

    #[tokio::test]
    async fn test_transparency_replaced_for_jpeg() {
        let server = serve(transparent_png(10, 10)).await;
        let pipeline = ResizePipeline::new(&GatewayConfig::default()).unwrap();

        let response = pipeline
            .run(
                &request(&server, "&format=jpeg&replaceTransparencyWith=%23ff0000"),
                &HeaderMap::new(),
            )
            .await
            .unwrap();

        let pixel = decoded(&response).to_rgb8().get_pixel(5, 5).0;
        assert!(pixel[0] > 200 && pixel[1] < 60 && pixel[2] < 60);
    }

    #[tokio::test]
    async fn test_timing_headers_only_when_verbose() {
        let server = serve(bmp(20, 20)).await;

        let quiet = ResizePipeline::new(&GatewayConfig::default()).unwrap();
        let response = quiet
            .run(&request(&server, ""), &HeaderMap::new())
            .await
            .unwrap();
        assert!(!response
            .headers
            .iter()
            .any(|(k, _)| k.starts_with(TIMING_HEADER_PREFIX)));

        let config = GatewayConfig {
            verbose: true,
            ..Default::default()
        };
        let verbose = ResizePipeline::new(&config).unwrap();
        let response = verbose
            .run(&request(&server, ""), &HeaderMap::new())
            .await
            .unwrap();
        let timing: Vec<&str> = response
            .headers
            .iter()
            .filter(|(k, _)| k.starts_with(TIMING_HEADER_PREFIX))
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(timing.len(), 6);
        assert_eq!(timing[0], Stage::Fetch.header_name());
    }

    #[tokio::test]
    async fn test_missing_url_is_validation_error() {
        let pipeline = ResizePipeline::new(&GatewayConfig::default()).unwrap();
        let request = ResizeRequest::parse("width=10").unwrap();
        let err = pipeline.run(&request, &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_whitelist_checked_before_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let config = GatewayConfig {
            domain_whitelist: "*.example.com".to_string(),
            ..Default::default()
        };
        let pipeline = ResizePipeline::new(&config).unwrap();
        let err = pipeline
            .run(&request(&server, ""), &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_unrecognised_source_format() {
        let server = serve(b"definitely not an image".to_vec()).await;
        let pipeline = ResizePipeline::new(&GatewayConfig::default()).unwrap();
        let err = pipeline
            .run(&request(&server, ""), &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedFeature(_)));
    }

    #[tokio::test]
    async fn test_huge_stretch_refused() {
        let server = serve(bmp(2, 2)).await;
        let pipeline = ResizePipeline::new(&GatewayConfig::default()).unwrap();
        let err = pipeline
            .run(
                &request(&server, "&width=100000&height=100000&resizeMode=stretch"),
                &HeaderMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedFeature(_)));
    }

    #[tokio::test]
    async fn test_output_size_limit() {
        let server = serve(bmp(200, 200)).await;
        let config = GatewayConfig {
            max_output_image_size: 64,
            ..Default::default()
        };
        let pipeline = ResizePipeline::new(&config).unwrap();
        let err = pipeline
            .run(&request(&server, "&format=bmp"), &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedFeature(_)));
    }
}
