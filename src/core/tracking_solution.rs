// Tracking session: camera -> graph -> display texture
//
// Startup order is camera, GPU, textures, assets, graph. Teardown reverses it:
// stop camera, close the input stream, drain, dispose the graph, shut down the GPU.

use crate::core::asset_provisioner::{AssetError, AssetProvisioner};
use crate::core::calculator::CalculatorRegistry;
use crate::core::calculator_graph::{CalculatorGraph, OutputStreamPoller};
use crate::core::camera::{CameraBackend, WebCamera};
use crate::core::config::{ConfigError, GraphSettings, TrackingConfig};
use crate::core::gpu::{GpuBackend, GpuContext, GpuError};
use crate::core::graph_config::{GraphConfig, ValidatedGraphConfig};
use crate::core::scheduler::{FrameScheduler, Stopwatch};
use crate::models::camera::CameraError;
use crate::models::frame::{FrameError, ImageFrame, Texture, RGBA_BYTES_PER_PIXEL};
use crate::models::graph::{GraphError, Packet, Timestamp};
use std::future::Future;
use std::path::PathBuf;
use tracing::{debug, error, info, trace, warn};

/// Platform pieces a session is built from
pub struct SessionParts {
    pub camera: Box<dyn CameraBackend>,
    pub gpu: Box<dyn GpuBackend>,
    pub registry: CalculatorRegistry,
}

/// What a tick did to the display texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A processed frame with this timestamp was uploaded
    Presented(Timestamp),
    /// No output was ready; the previous frame stays on screen
    Stale,
}

pub struct TrackingSolution {
    config: TrackingConfig,
    registry: CalculatorRegistry,
    camera_backend: Option<Box<dyn CameraBackend>>,
    camera: Option<WebCamera>,
    gpu: GpuContext,
    input_texture: Option<Texture>,
    output_texture: Option<Texture>,
    output_pixels: Vec<u8>,
    staged_assets: Vec<PathBuf>,
    graph: Option<CalculatorGraph>,
    poller: Option<OutputStreamPoller>,
    stopwatch: Option<Stopwatch>,
    ticks: u64,
    dropped_frames: u64,
}

impl TrackingSolution {
    /// Create an idle session; nothing is acquired until `start`
    pub fn new(config: TrackingConfig, parts: SessionParts) -> TrackingResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            registry: parts.registry,
            camera_backend: Some(parts.camera),
            camera: None,
            gpu: GpuContext::new(parts.gpu),
            input_texture: None,
            output_texture: None,
            output_pixels: Vec::new(),
            staged_assets: Vec::new(),
            graph: None,
            poller: None,
            stopwatch: None,
            ticks: 0,
            dropped_frames: 0,
        })
    }

    /// Create and start a session, releasing whatever was acquired if startup fails
    pub async fn launch(config: TrackingConfig, parts: SessionParts) -> TrackingResult<Self> {
        let mut solution = Self::new(config, parts)?;
        if let Err(e) = solution.start().await {
            if let Err(teardown) = solution.destroy().await {
                warn!("Teardown after failed start also failed: {}", teardown);
            }
            return Err(e);
        }
        Ok(solution)
    }

    /// Acquire every resource and start the graph run
    pub async fn start(&mut self) -> TrackingResult<()> {
        let backend = self
            .camera_backend
            .take()
            .ok_or(TrackingError::AlreadyStarted)?;

        let camera = WebCamera::start(backend, &self.config.camera).await?;
        let request = camera.request();
        self.camera = Some(camera);

        self.gpu.initialize().await?;

        let (width, height) = (request.width, request.height);
        self.input_texture = Some(Texture::new(width, height));
        self.output_texture = Some(Texture::new(width, height));
        self.output_pixels = vec![0; width as usize * height as usize * RGBA_BYTES_PER_PIXEL];

        let assets = &self.config.assets;
        let provisioner =
            AssetProvisioner::new(assets.source_dir.clone(), assets.cache_dir.clone()).await?;
        self.staged_assets = provisioner.prepare_all(&assets.models).await?;
        debug!("Staged {} asset(s)", self.staged_assets.len());

        let text = load_graph_text(&self.config.graph).await?;
        let graph = {
            let graph_config = GraphConfig::parse_text(&text)?;
            check_streams(&graph_config, &self.config.graph)?;
            let validated = ValidatedGraphConfig::initialize(graph_config, &self.registry)?;
            CalculatorGraph::new(&validated)?
        };

        // Owned by the session from here on so teardown disposes it
        let graph = self.graph.insert(graph);
        graph.set_gpu_resources(self.gpu.resources()?)?;
        self.poller = Some(graph.add_output_stream_poller(&self.config.graph.output_stream)?);
        graph.start_run(self.config.pose.to_side_packet())?;

        self.stopwatch = Some(Stopwatch::start());
        info!(
            "Tracking session started ({}x{} @ {} fps)",
            width, height, request.fps
        );
        Ok(())
    }

    /// Copy the current camera frame into the graph's input stream.
    ///
    /// The frame is dropped with a warning when the graph's input queue is full.
    pub fn push_frame(&mut self) -> TrackingResult<Timestamp> {
        let (camera, texture, graph, stopwatch) = match (
            self.camera.as_mut(),
            self.input_texture.as_mut(),
            self.graph.as_mut(),
            self.stopwatch.as_mut(),
        ) {
            (Some(camera), Some(texture), Some(graph), Some(stopwatch)) => {
                (camera, texture, graph, stopwatch)
            }
            _ => return Err(TrackingError::NotStarted),
        };

        camera.read_frame(texture)?;
        let pixels = texture.raw_data().to_vec();
        let frame = ImageFrame::from_rgba(texture.width(), texture.height(), pixels)?;

        let timestamp = stopwatch.next_timestamp();
        let packet = Packet::image(frame, timestamp);
        match graph.add_packet_to_input_stream(&self.config.graph.input_stream, packet) {
            Ok(()) => trace!("Pushed frame at {}", timestamp),
            Err(GraphError::Unavailable(reason)) => {
                self.dropped_frames += 1;
                warn!("Dropping camera frame: {}", reason);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(timestamp)
    }

    /// Upload the next processed frame if one is ready; never waits
    pub fn present_latest(&mut self) -> TrackingResult<TickOutcome> {
        let (poller, texture) = match (self.poller.as_mut(), self.output_texture.as_mut()) {
            (Some(poller), Some(texture)) => (poller, texture),
            _ => return Err(TrackingError::NotStarted),
        };

        let Some(packet) = poller.try_get_next() else {
            return Ok(TickOutcome::Stale);
        };
        let Some(frame) = packet.as_image_frame() else {
            warn!(
                "Output packet at {} is not an image frame: {}",
                packet.timestamp(),
                packet.data().type_name()
            );
            return Ok(TickOutcome::Stale);
        };

        // A rotated graph output changes the display shape
        let (width, height) = (frame.width(), frame.height());
        if (texture.width(), texture.height()) != (width, height) {
            info!(
                "Resizing display texture from {}x{} to {}x{}",
                texture.width(),
                texture.height(),
                width,
                height
            );
            texture.resize(width, height);
            self.output_pixels = vec![0; width as usize * height as usize * RGBA_BYTES_PER_PIXEL];
        }
        if !frame.read_pixel_data(width, height, &mut self.output_pixels) {
            warn!(
                "Output frame at {} is {:?}, not RGBA; skipping",
                packet.timestamp(),
                frame.format()
            );
            return Ok(TickOutcome::Stale);
        }

        texture.set_pixels(&self.output_pixels)?;
        texture.apply();
        Ok(TickOutcome::Presented(packet.timestamp()))
    }

    /// One host frame: push, yield until the frame ends, present
    pub async fn tick(
        &mut self,
        scheduler: &mut dyn FrameScheduler,
    ) -> TrackingResult<TickOutcome> {
        self.push_frame()?;
        scheduler.wait_for_end_of_frame().await;
        let outcome = self.present_latest()?;
        self.ticks += 1;
        Ok(outcome)
    }

    /// Tick until an error occurs
    pub async fn run(&mut self, scheduler: &mut dyn FrameScheduler) -> TrackingResult<()> {
        loop {
            self.tick(scheduler).await?;
        }
    }

    /// Tick until `shutdown` resolves or an error occurs
    pub async fn run_until<F>(
        &mut self,
        scheduler: &mut dyn FrameScheduler,
        shutdown: F,
    ) -> TrackingResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                result = self.tick(scheduler) => {
                    result?;
                }
            }
        }
    }

    /// Release everything in reverse order. Safe to call more than once.
    ///
    /// The graph is disposed and the GPU shut down even when stopping the
    /// camera or draining the graph fails; the first such error is returned.
    pub async fn destroy(&mut self) -> TrackingResult<()> {
        let mut first_error: Option<TrackingError> = None;

        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.stop().await {
                warn!("Failed to stop camera: {}", e);
                first_error.get_or_insert(e.into());
            }
        }

        if let Some(mut graph) = self.graph.take() {
            if graph.is_running() {
                let drained = match graph.close_all_input_streams() {
                    Ok(()) => graph.wait_until_done().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = drained {
                    error!("Graph did not finish cleanly: {}", e);
                    first_error.get_or_insert(e.into());
                }
            }
            graph.dispose();
        }
        self.poller = None;
        self.stopwatch = None;

        self.gpu.shutdown();
        self.camera_backend = None;
        info!("Tracking session destroyed after {} tick(s)", self.ticks);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Texture holding the last presented frame
    pub fn output_texture(&self) -> Option<&Texture> {
        self.output_texture.as_ref()
    }

    pub fn input_texture(&self) -> Option<&Texture> {
        self.input_texture.as_ref()
    }

    pub fn camera(&self) -> Option<&WebCamera> {
        self.camera.as_ref()
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub fn has_graph(&self) -> bool {
        self.graph.is_some()
    }

    pub fn staged_assets(&self) -> &[PathBuf] {
        &self.staged_assets
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Camera frames dropped because the graph's input queue was full
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }
}

impl Drop for TrackingSolution {
    fn drop(&mut self) {
        if self.graph.is_some() {
            warn!("Tracking session dropped without destroy");
        }
        self.gpu.shutdown();
    }
}

async fn load_graph_text(settings: &GraphSettings) -> TrackingResult<String> {
    if let Some(text) = &settings.config_text {
        return Ok(text.clone());
    }

    let path = settings.config_path.as_ref().ok_or_else(|| {
        ConfigError::Invalid(
            "Either graph.config_text or graph.config_path must be set".to_string(),
        )
    })?;
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| TrackingError::GraphConfigRead {
            path: path.clone(),
            source,
        })
}

fn check_streams(graph: &GraphConfig, settings: &GraphSettings) -> Result<(), GraphError> {
    if !graph.input_streams.contains(&settings.input_stream) {
        return Err(GraphError::NotFound(format!(
            "graph has no input stream {}",
            settings.input_stream
        )));
    }
    if !graph.output_streams.contains(&settings.output_stream) {
        return Err(GraphError::NotFound(format!(
            "graph has no output stream {}",
            settings.output_stream
        )));
    }
    Ok(())
}

/// Error types for a tracking session
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to read graph config {path:?}: {source}")]
    GraphConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tracking session has not been started")]
    NotStarted,

    #[error("Tracking session was already started")]
    AlreadyStarted,
}

pub type TrackingResult<T> = Result<T, TrackingError>;
