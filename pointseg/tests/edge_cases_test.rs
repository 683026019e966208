//! Edge case tests for pointseg

use image::{Rgba, RgbaImage};
use ndarray::Array3;
use pointseg::config::MaskPolicy;
use pointseg::models::{DecoderPrompt, EmbeddingBundle, ImageEncoder, MaskBundle, MaskDecoder};
use pointseg::processing::compositor::encode_png;
use pointseg::{LoadedModels, ModelLoader, NormalizedPoint, SegmentConfig, SegmentError, SegmentService};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct ZeroEncoder;

impl ImageEncoder for ZeroEncoder {
    fn encode(&mut self, _image: &RgbaImage) -> Result<EmbeddingBundle, SegmentError> {
        Ok(EmbeddingBundle::zeros())
    }
}

/// Decoder that fails on background-only prompts
struct PickyDecoder;

impl MaskDecoder for PickyDecoder {
    fn decode(
        &mut self,
        _embedding: &EmbeddingBundle,
        prompt: &DecoderPrompt,
        orig_height: u32,
        orig_width: u32,
    ) -> Result<MaskBundle, SegmentError> {
        if prompt.labels_array().iter().all(|&l| l == 0.0) {
            return Err(SegmentError::Inference("nothing to segment".to_string()));
        }
        let masks = Array3::from_elem((1, orig_height as usize, orig_width as usize), 1.0);
        MaskBundle::new(masks, vec![0.5])
    }
}

/// Encoder that takes longer than the configured request timeout
struct SlowEncoder {
    calls: Arc<AtomicUsize>,
}

impl ImageEncoder for SlowEncoder {
    fn encode(&mut self, _image: &RgbaImage) -> Result<EmbeddingBundle, SegmentError> {
        std::thread::sleep(Duration::from_millis(600));
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(EmbeddingBundle::zeros())
    }
}

struct Loader {
    slow: bool,
    encoder_calls: Arc<AtomicUsize>,
}

impl ModelLoader for Loader {
    fn load(&self) -> Result<LoadedModels, SegmentError> {
        let encoder: Box<dyn ImageEncoder> = if self.slow {
            Box::new(SlowEncoder {
                calls: self.encoder_calls.clone(),
            })
        } else {
            Box::new(ZeroEncoder)
        };
        Ok(LoadedModels {
            encoder,
            decoder: Box::new(PickyDecoder),
        })
    }
}

async fn service_with(config: SegmentConfig, slow: bool) -> SegmentService {
    slow_service(config, slow).await.0
}

async fn slow_service(config: SegmentConfig, slow: bool) -> (SegmentService, Arc<AtomicUsize>) {
    let encoder_calls = Arc::new(AtomicUsize::new(0));
    let loader = Loader {
        slow,
        encoder_calls: encoder_calls.clone(),
    };
    let service = SegmentService::with_loader(config, Arc::new(loader)).unwrap();
    service.initialize_models().await.unwrap();
    (service, encoder_calls)
}

fn png(width: u32, height: u32) -> Vec<u8> {
    encode_png(&RgbaImage::from_pixel(width, height, Rgba([1, 2, 3, 255])))
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn test_remove_label_without_image() {
    let service = service_with(SegmentConfig::default(), false).await;
    assert_eq!(service.remove_label(0).await.unwrap(), None);
}

#[tokio::test]
async fn test_undecodable_image() {
    let service = service_with(SegmentConfig::default(), false).await;
    let result = service
        .process_image(b"not a png".to_vec(), &[NormalizedPoint::foreground(0.5, 0.5)], 0)
        .await;
    assert!(matches!(result, Err(SegmentError::DecodeInput(_))));
}

#[tokio::test]
async fn test_empty_point_list() {
    let service = service_with(SegmentConfig::default(), false).await;
    let result = service.process_image(png(10, 10), &[], 0).await;
    assert!(matches!(result, Err(SegmentError::DecodeInput(_))));
}

#[tokio::test]
async fn test_oversized_image_rejected() {
    let config = SegmentConfig {
        max_image_pixels: 99,
        ..SegmentConfig::default()
    };
    let service = service_with(config, false).await;
    let result = service
        .process_image(png(10, 10), &[NormalizedPoint::foreground(0.5, 0.5)], 0)
        .await;
    assert!(matches!(result, Err(SegmentError::DecodeInput(_))));
}

#[tokio::test]
async fn test_decode_failure_leaves_other_labels() {
    let service = service_with(SegmentConfig::default(), false).await;
    let image = png(16, 16);

    let good = service
        .process_image(image.clone(), &[NormalizedPoint::foreground(0.5, 0.5)], 0)
        .await
        .unwrap();

    let failed = service
        .process_image(image, &[NormalizedPoint::background(0.5, 0.5)], 1)
        .await;
    assert!(matches!(failed, Err(SegmentError::Inference(_))));

    // Label 0 is still composited
    let after = service.remove_label(1).await.unwrap().unwrap();
    assert_eq!(after, good);
}

#[tokio::test]
async fn test_points_on_image_edge_are_clamped() {
    let service = service_with(SegmentConfig::default(), false).await;
    let result = service
        .process_image(
            png(16, 16),
            &[NormalizedPoint::foreground(1.0, 1.0), NormalizedPoint::foreground(-0.2, 1.7)],
            0,
        )
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_request_timeout() {
    let config = SegmentConfig {
        request_timeout_ms: Some(150),
        ..SegmentConfig::default()
    };
    let service = service_with(config, true).await;
    let result = service
        .process_image(png(8, 8), &[NormalizedPoint::foreground(0.5, 0.5)], 0)
        .await;
    assert!(matches!(result, Err(SegmentError::Timeout(150))));
}

#[tokio::test]
async fn test_timed_out_request_still_completes() {
    let config = SegmentConfig {
        request_timeout_ms: Some(150),
        ..SegmentConfig::default()
    };
    let (service, encoder_calls) = slow_service(config, true).await;
    let image = png(8, 8);
    let points = [NormalizedPoint::foreground(0.5, 0.5)];

    let result = service.process_image(image.clone(), &points, 0).await;
    assert!(matches!(result, Err(SegmentError::Timeout(150))));
    assert!(service.latest_overlay().is_none());

    // The worker finishes the encode after the caller gave up
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while service.latest_overlay().is_none() {
        assert!(tokio::time::Instant::now() < deadline, "worker never published");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let published = service.latest_overlay().unwrap();
    assert_eq!(encoder_calls.load(Ordering::SeqCst), 1);

    // Same image is served from the cache and label 0 kept its mask
    let again = service.process_image(image, &points, 0).await.unwrap();
    assert_eq!(again, published);
    assert_eq!(encoder_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
model_dir = "/tmp/pointseg-models"
mask_policy = "best_score"
overlay_alpha = 200
stale_mask_on_failure = false
"#
    )
    .unwrap();

    let config = SegmentConfig::from_file(file.path()).unwrap();
    assert_eq!(config.mask_policy, MaskPolicy::BestScore);
    assert_eq!(config.overlay_alpha, 200);
    assert!(!config.stale_mask_on_failure);
    assert_eq!(config.encoder_file, "tiny_encoder.onnx");
    assert_eq!(config.mask_threshold, 0.1);
}

#[test]
fn test_config_from_file_rejects_invalid() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "queue_depth = 0").unwrap();
    assert!(matches!(
        SegmentConfig::from_file(file.path()),
        Err(SegmentError::Config(_))
    ));
}
