// GPU context shared with the calculator graph
// Owned explicitly by the session: initialize once, hand out resources, shut down once

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Description of the device backing a GPU context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDeviceInfo {
    pub name: String,
    pub backend: String,
}

/// Platform hook that performs the one-time GPU setup
#[async_trait]
pub trait GpuBackend: Send + Sync {
    async fn create_resources(&self) -> GpuResult<GpuDeviceInfo>;
}

/// Handle to live GPU resources, cheap to clone.
///
/// Every clone becomes stale once the owning context shuts down.
#[derive(Debug, Clone)]
pub struct GpuResources {
    inner: Arc<ResourcesInner>,
}

#[derive(Debug)]
struct ResourcesInner {
    id: Uuid,
    device: GpuDeviceInfo,
    alive: AtomicBool,
}

impl GpuResources {
    fn new(device: GpuDeviceInfo) -> Self {
        Self {
            inner: Arc::new(ResourcesInner {
                id: Uuid::new_v4(),
                device,
                alive: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn device(&self) -> &GpuDeviceInfo {
        &self.inner.device
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
    }
}

pub struct GpuContext {
    backend: Box<dyn GpuBackend>,
    resources: Option<GpuResources>,
}

impl GpuContext {
    pub fn new(backend: Box<dyn GpuBackend>) -> Self {
        Self {
            backend,
            resources: None,
        }
    }

    /// Run the backend setup; must succeed before any graph work
    pub async fn initialize(&mut self) -> GpuResult<()> {
        if self.resources.is_some() {
            return Err(GpuError::AlreadyInitialized);
        }

        let device = self.backend.create_resources().await?;
        info!("GPU resources initialized on {} ({})", device.name, device.backend);
        self.resources = Some(GpuResources::new(device));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.resources.is_some()
    }

    pub fn resources(&self) -> GpuResult<GpuResources> {
        self.resources.clone().ok_or(GpuError::NotInitialized)
    }

    /// Release the resources; safe to call on an uninitialized context
    pub fn shutdown(&mut self) {
        if let Some(resources) = self.resources.take() {
            resources.invalidate();
            info!("GPU resources {} shut down", resources.id());
        }
    }
}

/// Error types for GPU setup
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GpuError {
    #[error("Failed to initialize GPU resources: {0}")]
    InitializationFailed(String),

    #[error("GPU resources are not initialized")]
    NotInitialized,

    #[error("GPU resources are already initialized")]
    AlreadyInitialized,
}

pub type GpuResult<T> = Result<T, GpuError>;
