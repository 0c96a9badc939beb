use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;
use image::{DynamicImage, Rgb, RgbImage};
use tracing_test::traced_test;

use super::*;
use crate::codec::psd::tests::build_psd;
use crate::format::OUTPUT_FORMATS;
use crate::storage::MemoryScratch;

const W: u32 = 6;
const H: u32 = 4;

const SVG_FIXTURE: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 6 4">
  <rect width="6" height="4" fill="#3366cc"/>
  <circle cx="3" cy="2" r="1.5" fill="#ffffff" fill-opacity="0.5"/>
</svg>"##;

const SCRIPT_SVG: &str = r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 6 4"><script>alert(1)</script></svg>"#;

fn raster(format: image::ImageFormat) -> Bytes {
    let img = RgbImage::from_fn(W, H, |x, y| Rgb([(x * 40) as u8, (y * 60) as u8, 128]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut out, format).unwrap();
    Bytes::from(out.into_inner())
}

fn fixture(source: ImageFormat) -> (String, Bytes) {
    let bytes = match source {
        ImageFormat::Png => raster(image::ImageFormat::Png),
        ImageFormat::Jpeg => raster(image::ImageFormat::Jpeg),
        ImageFormat::Gif => raster(image::ImageFormat::Gif),
        ImageFormat::Bmp => raster(image::ImageFormat::Bmp),
        ImageFormat::Tiff => raster(image::ImageFormat::Tiff),
        ImageFormat::WebP => raster(image::ImageFormat::WebP),
        ImageFormat::Svg => Bytes::from_static(SVG_FIXTURE.as_bytes()),
        ImageFormat::Psd => {
            let n = (W * H) as usize;
            Bytes::from(build_psd(W, H, 3, &[vec![200; n], vec![100; n], vec![50; n]], true))
        }
    };
    (format!("sample.{}", source.extension()), bytes)
}

fn pipeline() -> ConversionPipeline<MemoryScratch> {
    ConversionPipeline::new(PipelineConfig::default(), MemoryScratch::new())
}

/// Default decoders, counting how often any of them runs.
fn counting_decoders(calls: Arc<AtomicUsize>) -> DecoderRegistry {
    let defaults = DecoderRegistry::with_defaults();
    let mut registry = DecoderRegistry::new();
    for format in defaults.formats() {
        let defaults = defaults.clone();
        let calls = Arc::clone(&calls);
        registry.register(format, move |bytes| {
            calls.fetch_add(1, Ordering::SeqCst);
            defaults.decode(format, bytes)
        });
    }
    registry
}

async fn drain<R: AsyncRead + Unpin>(mut stream: ProgressStream<R, MemoryScratch>) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

#[tokio::test]
async fn every_source_converts_to_every_target() {
    let pipeline = pipeline();
    for &source in &[
        ImageFormat::Png,
        ImageFormat::Jpeg,
        ImageFormat::Gif,
        ImageFormat::Bmp,
        ImageFormat::Tiff,
        ImageFormat::WebP,
        ImageFormat::Svg,
        ImageFormat::Psd,
    ] {
        let (name, bytes) = fixture(source);
        for &target in OUTPUT_FORMATS {
            let mut job = pipeline.begin(None).unwrap();
            let conversion = pipeline
                .run(&mut job, UploadedAsset::from_bytes(&name, bytes.clone()), target)
                .await
                .unwrap_or_else(|e| panic!("{source} -> {target}: {e}"));

            assert_eq!(conversion.job.source_format, source);
            assert_eq!(conversion.content_type, target.mime_type());
            assert_eq!(conversion.download_name, format!("sample.{}", target.extension()));

            let length = conversion.content_length;
            let body = drain(job.stream(conversion.reader)).await;
            assert_eq!(body.len() as u64, length);

            let decoded = image::load_from_memory(&body).unwrap();
            assert_eq!(
                (decoded.width(), decoded.height()),
                (W, H),
                "{source} -> {target}"
            );
        }
    }
}

#[tokio::test]
#[traced_test]
async fn spoofed_extension_is_rejected_before_decoding() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline().with_decoders(counting_decoders(Arc::clone(&calls)));

    let mut job = pipeline.begin(Some("spoof")).unwrap();
    job.form_parsed();
    let (_, jpeg) = fixture(ImageFormat::Jpeg);
    let err = pipeline
        .run(&mut job, UploadedAsset::from_bytes("photo.png", jpeg), ImageFormat::Png)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::SignatureMismatch { .. })
    ));
    assert!(err.to_string().contains("does not match the extension"));
    assert!(err.is_client_error());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.scratch().writes(), 0);
    assert_eq!(pipeline.progress().query("spoof"), 0);
    assert_eq!(job.state(), JobState::Failed);
    assert!(logs_contain("conversion failed"));
}

#[tokio::test]
async fn scripted_svg_is_rejected_without_decoding() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline().with_decoders(counting_decoders(Arc::clone(&calls)));

    let mut job = pipeline.begin(Some("svg-job")).unwrap();
    let err = pipeline
        .run(
            &mut job,
            UploadedAsset::from_bytes("logo.svg", Bytes::from_static(SCRIPT_SVG.as_bytes())),
            ImageFormat::Png,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Sanitize(SanitizeError::ScriptTag)));
    assert!(err.to_string().contains("script"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.progress().query("svg-job"), 0);
}

#[tokio::test]
async fn clean_svg_is_decoded_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline().with_decoders(counting_decoders(Arc::clone(&calls)));

    let mut job = pipeline.begin(None).unwrap();
    let (name, bytes) = fixture(ImageFormat::Svg);
    let conversion = pipeline
        .run(&mut job, UploadedAsset::from_bytes(&name, bytes), ImageFormat::Png)
        .await
        .unwrap();
    drain(job.stream(conversion.reader)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn progress_rises_through_every_milestone() {
    let pipeline = pipeline();
    let store = pipeline.progress().clone();
    let seen = Arc::new(Mutex::new(Vec::new()));

    // Record what a poller would see while the codecs run.
    let mut decoders = DecoderRegistry::with_defaults();
    let (s, observed) = (store.clone(), Arc::clone(&seen));
    decoders.register(ImageFormat::Png, move |bytes| {
        observed.lock().unwrap().push(s.query("watched"));
        DecoderRegistry::with_defaults().decode(ImageFormat::Png, bytes)
    });
    let mut encoders = EncoderRegistry::with_defaults();
    let (s, observed) = (store.clone(), Arc::clone(&seen));
    encoders.register(ImageFormat::Jpeg, move |image| {
        observed.lock().unwrap().push(s.query("watched"));
        let bytes = EncoderRegistry::with_defaults().encode(ImageFormat::Jpeg, image)?;
        Ok(bytes.to_vec())
    });
    let pipeline = pipeline.with_decoders(decoders).with_encoders(encoders);

    let mut job = pipeline.begin(Some("watched")).unwrap();
    seen.lock().unwrap().push(store.query("watched"));
    job.form_parsed();
    seen.lock().unwrap().push(store.query("watched"));

    let (name, bytes) = fixture(ImageFormat::Png);
    let conversion = pipeline
        .run(&mut job, UploadedAsset::from_bytes(&name, bytes), ImageFormat::Jpeg)
        .await
        .unwrap();
    seen.lock().unwrap().push(store.query("watched"));
    assert_eq!(job.state(), JobState::Streaming);

    drain(job.stream(conversion.reader)).await;
    seen.lock().unwrap().push(store.query("watched"));

    assert_eq!(*seen.lock().unwrap(), [0, 10, 40, 60, 90, 100]);

    // Finished jobs stay pollable for the configured window only.
    tokio::time::sleep(DEFAULT_PROGRESS_TTL - Duration::from_secs(1)).await;
    assert_eq!(store.query("watched"), 100);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.query("watched"), 0);
}

#[tokio::test]
async fn decode_failure_clears_progress_and_upload() {
    let pipeline = pipeline();
    let mut job = pipeline.begin(Some("broken")).unwrap();
    let mut corrupt = b"\x89PNG\r\n\x1a\n".to_vec();
    corrupt.extend_from_slice(&[0u8; 64]);

    let err = pipeline
        .run(&mut job, UploadedAsset::from_bytes("broken.png", Bytes::from(corrupt)), ImageFormat::Gif)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Codec(CodecError::Decode { .. })));
    assert_eq!(pipeline.progress().query("broken"), 0);
    assert_eq!(pipeline.scratch().writes(), 1);
    assert!(pipeline.scratch().names(ScratchArea::Uploads).is_empty());
}

#[tokio::test]
async fn oversized_upload_never_reaches_scratch() {
    let config = PipelineConfig {
        max_upload_bytes: 16,
        ..PipelineConfig::default()
    };
    let pipeline = ConversionPipeline::new(config, MemoryScratch::new());
    let mut job = pipeline.begin(Some("big")).unwrap();
    let (name, bytes) = fixture(ImageFormat::Png);

    let err = pipeline
        .run(&mut job, UploadedAsset::from_bytes(&name, bytes), ImageFormat::Jpeg)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Validation(ValidationError::TooLarge { max: 16, .. })));
    assert_eq!(pipeline.scratch().writes(), 0);
    assert_eq!(pipeline.progress().query("big"), 0);
}

#[tokio::test]
async fn unsupported_target_is_rejected() {
    let pipeline = pipeline();
    let mut job = pipeline.begin(None).unwrap();
    let (name, bytes) = fixture(ImageFormat::Png);
    let err = pipeline
        .run(&mut job, UploadedAsset::from_bytes(&name, bytes), ImageFormat::Tiff)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Codec(CodecError::UnsupportedFormat(ImageFormat::Tiff))
    ));
    assert_eq!(pipeline.progress().active_jobs(), 0);
}

#[tokio::test]
async fn storage_failure_is_a_server_error() {
    let pipeline = pipeline();
    pipeline.scratch().set_failing(true);
    let mut job = pipeline.begin(Some("disk")).unwrap();
    let (name, bytes) = fixture(ImageFormat::Png);

    let err = pipeline
        .run(&mut job, UploadedAsset::from_bytes(&name, bytes), ImageFormat::Bmp)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Storage(_)));
    assert!(!err.is_client_error());
    assert_eq!(pipeline.progress().query("disk"), 0);
}

#[tokio::test]
async fn job_ids_are_checked() {
    let pipeline = pipeline();
    let _live = pipeline.begin(Some("taken")).unwrap();
    assert!(matches!(
        pipeline.begin(Some("taken")),
        Err(PipelineError::BadRequest(msg)) if msg.contains("already in use")
    ));
    for bad in ["", "has space", "semi;colon", &"x".repeat(65)] {
        assert!(
            matches!(pipeline.begin(Some(bad)), Err(PipelineError::BadRequest(_))),
            "{bad:?} should be refused"
        );
    }
    let generated = pipeline.begin(None).unwrap();
    assert_eq!(generated.id().len(), 32);
}

#[tokio::test]
async fn abandoned_stream_fails_the_job() {
    let pipeline = pipeline();
    let mut job = pipeline.begin(Some("gone")).unwrap();
    let (name, bytes) = fixture(ImageFormat::Png);
    let conversion = pipeline
        .run(&mut job, UploadedAsset::from_bytes(&name, bytes), ImageFormat::WebP)
        .await
        .unwrap();
    assert_eq!(pipeline.progress().query("gone"), 90);

    drop(job.stream(conversion.reader));
    assert_eq!(pipeline.progress().query("gone"), 0);

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(pipeline.scratch().names(ScratchArea::Uploads).is_empty());
    assert!(pipeline.scratch().names(ScratchArea::Converted).is_empty());
}

#[tokio::test]
async fn dropped_handle_releases_the_id() {
    let pipeline = pipeline();
    let mut job = pipeline.begin(Some("form")).unwrap();
    job.form_parsed();
    assert_eq!(pipeline.progress().query("form"), 10);
    drop(job);
    assert_eq!(pipeline.progress().query("form"), 0);
    assert!(pipeline.begin(Some("form")).is_ok());
}
