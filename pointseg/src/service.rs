//! Async boundary API backed by a single inference worker
//!
//! Every operation is a message to one blocking worker that owns the models
//! and the session. Requests run strictly in arrival order, so each one sees
//! the state left by the requests before it.

use crate::config::SegmentConfig;
use crate::error::SegmentError;
use crate::models::{LoadedModels, ModelLoader, OnnxModelLoader};
use crate::processing::compositor::encode_png;
use crate::processing::coords::from_normalized;
use crate::processing::labels::{LabelId, PointType, PromptPoint};
use crate::session::SegmentSession;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Point as received at the boundary: normalized to the original image, wire label
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPoint {
    pub x: f32,
    pub y: f32,
    /// 1 = foreground, 0 = background
    pub label: i32,
}

impl NormalizedPoint {
    pub fn new(x: f32, y: f32, label: i32) -> Self {
        Self { x, y, label }
    }

    pub fn foreground(x: f32, y: f32) -> Self {
        Self::new(x, y, 1)
    }

    pub fn background(x: f32, y: f32) -> Self {
        Self::new(x, y, 0)
    }

    /// Model-pixel prompt point. Rejects non-finite coordinates and unknown labels.
    pub fn to_prompt_point(&self) -> Result<PromptPoint, SegmentError> {
        if !self.x.is_finite() || !self.y.is_finite() {
            return Err(SegmentError::DecodeInput(format!(
                "Point ({}, {}) is not finite",
                self.x, self.y
            )));
        }
        let kind = PointType::from_wire(self.label).ok_or_else(|| {
            SegmentError::DecodeInput(format!("Point label must be 0 or 1, got {}", self.label))
        })?;
        let position = from_normalized(self.x, self.y);
        Ok(PromptPoint { position, kind })
    }
}

type Reply<T> = oneshot::Sender<Result<T, SegmentError>>;

enum Command {
    Initialize {
        reply: Reply<()>,
    },
    Process {
        image: Bytes,
        points: Vec<PromptPoint>,
        label: LabelId,
        reply: Reply<Bytes>,
    },
    Clear {
        reply: Reply<()>,
    },
    RemoveLabel {
        label: LabelId,
        reply: Reply<Option<Bytes>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Initialize { .. } => "initialize_models",
            Command::Process { .. } => "process_image",
            Command::Clear { .. } => "clear_points",
            Command::RemoveLabel { .. } => "remove_label",
            Command::Shutdown { .. } => "shutdown",
        }
    }
}

/// Handle to the segmentation worker. Dropping it stops the worker once
/// queued requests drain.
pub struct SegmentService {
    config: Arc<SegmentConfig>,
    sender: mpsc::Sender<Command>,
    latest_overlay: Arc<RwLock<Option<Bytes>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SegmentService {
    /// Service backed by ONNX Runtime models. Must be called inside a tokio runtime.
    pub fn new(config: SegmentConfig) -> Result<Self, SegmentError> {
        let config = Arc::new(config);
        let loader = Arc::new(OnnxModelLoader::new(config.clone()));
        Self::start(config, loader)
    }

    /// Service with a caller-supplied model loader
    pub fn with_loader(
        config: SegmentConfig,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self, SegmentError> {
        Self::start(Arc::new(config), loader)
    }

    fn start(config: Arc<SegmentConfig>, loader: Arc<dyn ModelLoader>) -> Result<Self, SegmentError> {
        config.validate().map_err(SegmentError::Config)?;

        let (sender, receiver) = mpsc::channel(config.queue_depth);
        let latest_overlay = Arc::new(RwLock::new(None));

        let worker = Worker {
            loader,
            models: None,
            session: SegmentSession::new(config.clone()),
            latest_overlay: latest_overlay.clone(),
        };
        let handle = tokio::task::spawn_blocking(move || worker.run(receiver));
        info!("Segmentation worker started (queue depth {})", config.queue_depth);

        Ok(Self {
            config,
            sender,
            latest_overlay,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Provision and load both models. Idempotent.
    pub async fn initialize_models(&self) -> Result<(), SegmentError> {
        self.request(|reply| Command::Initialize { reply }).await
    }

    /// Set `label_id`'s prompt points on this image and return the composite as PNG
    pub async fn process_image(
        &self,
        image: impl Into<Bytes>,
        points: &[NormalizedPoint],
        label_id: LabelId,
    ) -> Result<Bytes, SegmentError> {
        let points = points
            .iter()
            .map(NormalizedPoint::to_prompt_point)
            .collect::<Result<Vec<_>, _>>()?;
        let image = image.into();

        self.request(move |reply| Command::Process {
            image,
            points,
            label: label_id,
            reply,
        })
        .await
    }

    /// Forget the image, its embedding and all labels
    pub async fn clear_points(&self) -> Result<(), SegmentError> {
        self.request(|reply| Command::Clear { reply }).await
    }

    /// Drop one label and recomposite. `None` when no image is loaded.
    pub async fn remove_label(&self, label_id: LabelId) -> Result<Option<Bytes>, SegmentError> {
        self.request(move |reply| Command::RemoveLabel {
            label: label_id,
            reply,
        })
        .await
    }

    /// Most recent composite PNG, readable without going through the worker
    pub fn latest_overlay(&self) -> Option<Bytes> {
        self.latest_overlay.read().clone()
    }

    /// Stop the worker after the requests already queued
    pub async fn shutdown(&self) -> Result<(), SegmentError> {
        let result = self.request(|reply| Command::Shutdown { reply }).await;

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Segmentation worker panicked: {}", e);
            }
        }
        result
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SegmentError> {
        let (reply, response) = oneshot::channel();
        let command = build(reply);

        let exchange = async {
            self.sender
                .send(command)
                .await
                .map_err(|_| SegmentError::WorkerUnavailable)?;
            response
                .await
                .unwrap_or(Err(SegmentError::WorkerUnavailable))
        };

        match self.config.request_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), exchange)
                .await
                .map_err(|_| SegmentError::Timeout(ms))?,
            None => exchange.await,
        }
    }
}

struct Worker {
    loader: Arc<dyn ModelLoader>,
    models: Option<LoadedModels>,
    session: SegmentSession,
    latest_overlay: Arc<RwLock<Option<Bytes>>>,
}

impl Worker {
    fn run(mut self, mut receiver: mpsc::Receiver<Command>) {
        while let Some(command) = receiver.blocking_recv() {
            let request_id = Uuid::new_v4();
            let span = info_span!("request", id = %request_id, op = command.name());
            let _enter = span.enter();

            match command {
                Command::Initialize { reply } => {
                    respond(reply, self.initialize());
                }
                Command::Process {
                    image,
                    points,
                    label,
                    reply,
                } => {
                    let result = self.process(&image, &points, label);
                    if let Err(e) = &result {
                        warn!("process_image failed for label {}: {}", label, e);
                    }
                    respond(reply, result);
                }
                Command::Clear { reply } => {
                    self.session.clear();
                    *self.latest_overlay.write() = None;
                    respond(reply, Ok(()));
                }
                Command::RemoveLabel { label, reply } => {
                    respond(reply, self.remove_label(label));
                }
                Command::Shutdown { reply } => {
                    respond(reply, Ok(()));
                    break;
                }
            }
        }
        info!("Segmentation worker stopped");
    }

    fn initialize(&mut self) -> Result<(), SegmentError> {
        if self.models.is_some() {
            debug!("Models already loaded");
            return Ok(());
        }
        match self.loader.load() {
            Ok(models) => {
                self.models = Some(models);
                info!("Models initialized");
                Ok(())
            }
            Err(e) => {
                error!("Model initialization failed: {}", e);
                Err(e)
            }
        }
    }

    fn process(&mut self, image: &[u8], points: &[PromptPoint], label: LabelId) -> Result<Bytes, SegmentError> {
        let models = self.models.as_mut().ok_or(SegmentError::NotInitialized)?;
        let composite = self.session.process_image(
            models.encoder.as_mut(),
            models.decoder.as_mut(),
            image,
            points,
            label,
        )?;
        self.publish(encode_png(&composite)?)
    }

    fn remove_label(&mut self, label: LabelId) -> Result<Option<Bytes>, SegmentError> {
        match self.session.remove_label(label) {
            Some(composite) => self.publish(encode_png(&composite)?).map(Some),
            None => Ok(None),
        }
    }

    fn publish(&self, png: Bytes) -> Result<Bytes, SegmentError> {
        *self.latest_overlay.write() = Some(png.clone());
        Ok(png)
    }
}

fn respond<T>(reply: Reply<T>, result: Result<T, SegmentError>) {
    if reply.send(result).is_err() {
        debug!("Caller went away before the reply was sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmbeddingBundle, ImageEncoder, MaskBundle, MaskDecoder, DecoderPrompt};
    use image::{Rgba, RgbaImage};
    use ndarray::Array3;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ZeroEncoder;

    impl ImageEncoder for ZeroEncoder {
        fn encode(&mut self, _image: &RgbaImage) -> Result<EmbeddingBundle, SegmentError> {
            Ok(EmbeddingBundle::zeros())
        }
    }

    struct FullDecoder;

    impl MaskDecoder for FullDecoder {
        fn decode(
            &mut self,
            _embedding: &EmbeddingBundle,
            _prompt: &DecoderPrompt,
            orig_height: u32,
            orig_width: u32,
        ) -> Result<MaskBundle, SegmentError> {
            let masks = Array3::from_elem((1, orig_height as usize, orig_width as usize), 1.0);
            MaskBundle::new(masks, vec![1.0])
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
    }

    impl ModelLoader for CountingLoader {
        fn load(&self) -> Result<LoadedModels, SegmentError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(LoadedModels {
                encoder: Box::new(ZeroEncoder),
                decoder: Box::new(FullDecoder),
            })
        }
    }

    struct FailingLoader;

    impl ModelLoader for FailingLoader {
        fn load(&self) -> Result<LoadedModels, SegmentError> {
            Err(SegmentError::Initialization("no models here".to_string()))
        }
    }

    fn png() -> Bytes {
        encode_png(&RgbaImage::from_pixel(6, 4, Rgba([10, 10, 10, 255]))).unwrap()
    }

    #[test]
    fn test_normalized_point_conversion() {
        let point = NormalizedPoint::foreground(0.5, 0.25).to_prompt_point().unwrap();
        assert_eq!(point.position.x, 512.0);
        assert_eq!(point.position.y, 256.0);
        assert_eq!(point.kind, PointType::Foreground);

        let edge = NormalizedPoint::background(1.0, 1.0).to_prompt_point().unwrap();
        assert!(edge.position.x < 1024.0);
        assert_eq!(edge.kind, PointType::Background);

        assert!(NormalizedPoint::new(0.5, 0.5, 2).to_prompt_point().is_err());
        assert!(NormalizedPoint::new(f32::INFINITY, 0.5, 1).to_prompt_point().is_err());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let loader = Arc::new(CountingLoader::default());
        let service = SegmentService::with_loader(SegmentConfig::default(), loader.clone()).unwrap();

        service.initialize_models().await.unwrap();
        service.initialize_models().await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_process_before_initialize() {
        let service =
            SegmentService::with_loader(SegmentConfig::default(), Arc::new(CountingLoader::default()))
                .unwrap();
        let result = service
            .process_image(png(), &[NormalizedPoint::foreground(0.5, 0.5)], 0)
            .await;
        assert!(matches!(result, Err(SegmentError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_initialize_failure_is_reported() {
        let service = SegmentService::with_loader(SegmentConfig::default(), Arc::new(FailingLoader)).unwrap();
        let result = service.initialize_models().await;
        assert!(matches!(result, Err(SegmentError::Initialization(_))));

        let result = service
            .process_image(png(), &[NormalizedPoint::foreground(0.5, 0.5)], 0)
            .await;
        assert!(matches!(result, Err(SegmentError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_latest_overlay_tracks_requests() {
        let service =
            SegmentService::with_loader(SegmentConfig::default(), Arc::new(CountingLoader::default()))
                .unwrap();
        service.initialize_models().await.unwrap();
        assert!(service.latest_overlay().is_none());

        let png_out = service
            .process_image(png(), &[NormalizedPoint::foreground(0.5, 0.5)], 0)
            .await
            .unwrap();
        assert_eq!(service.latest_overlay(), Some(png_out));

        service.clear_points().await.unwrap();
        assert!(service.latest_overlay().is_none());
        assert_eq!(service.remove_label(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_wire_label_rejected_before_worker() {
        let service =
            SegmentService::with_loader(SegmentConfig::default(), Arc::new(CountingLoader::default()))
                .unwrap();
        let result = service
            .process_image(png(), &[NormalizedPoint::new(0.5, 0.5, 7)], 0)
            .await;
        assert!(matches!(result, Err(SegmentError::DecodeInput(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let service =
            SegmentService::with_loader(SegmentConfig::default(), Arc::new(CountingLoader::default()))
                .unwrap();
        service.shutdown().await.unwrap();
        assert!(matches!(
            service.initialize_models().await,
            Err(SegmentError::WorkerUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = SegmentConfig {
            queue_depth: 0,
            ..SegmentConfig::default()
        };
        let result = SegmentService::with_loader(config, Arc::new(CountingLoader::default()));
        assert!(matches!(result, Err(SegmentError::Config(_))));
    }
}
