pub mod config;
pub mod enhancement;
pub mod generative;
pub mod image;
pub mod manipulation;
pub mod pipelines;
pub mod result;
pub mod visualization;

use std::path::Path;
use std::sync::Arc;

use retouch_ml::{Device, ModelCache, Placement};
use tokio::sync::Mutex;
use tracing::info;

pub use config::{Config, ModelConfig};
pub use enhancement::{ControlType, Enhancement};
pub use generative::Generative;
pub use crate::image::{BoundingBox, Point};
pub use manipulation::{Manipulation, MaskInput};
pub use result::{Error, Result};

/// Model cache shared by the facade and its modules. The lock serializes
/// lookups, construction, inference and device switches.
pub type SharedCache = Arc<Mutex<ModelCache>>;

/// Entry point wiring one model cache to the enhancement, manipulation and
/// generative verbs.
pub struct Retouch {
    cache: SharedCache,
    config: Config,
    pub enhancement: Enhancement,
    pub manipulation: Manipulation,
    pub generative: Generative,
}

impl Retouch {
    pub fn new(config: Config) -> Result<Self> {
        if let Some(dir) = &config.cache_dir {
            apply_cache_dir(dir)?;
        }
        let device = config.device.unwrap_or_else(Device::detect);
        let placement = Placement::resolve(device)?;
        Ok(Self::with_placement(config, placement))
    }

    /// Builds the facade on an already created placement.
    pub fn with_placement(config: Config, placement: Placement) -> Self {
        info!(
            device = %placement.device,
            cache_dir = %retouch_ml::cache_dir().display(),
            "initializing retouch"
        );

        let cache: SharedCache = Arc::new(Mutex::new(ModelCache::with_placement(placement)));
        let enhancement = Enhancement::new(cache.clone(), config.models.clone());
        let manipulation = Manipulation::new(cache.clone(), config.models.clone());
        let generative = Generative::new(cache.clone(), config.models.clone());

        info!("retouch initialized");
        Self {
            cache,
            config,
            enhancement,
            manipulation,
            generative,
        }
    }

    /// Moves every loaded model to `device`; later loads land there too.
    pub async fn set_device(&self, device: Device) -> Result<()> {
        info!(%device, "setting device");
        self.cache.lock().await.set_device(device)?;
        Ok(())
    }

    pub async fn device(&self) -> Device {
        self.cache.lock().await.device()
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn apply_cache_dir(dir: &Path) -> Result<()> {
    if let Err(err) = retouch_ml::set_cache_dir(dir.to_path_buf()) {
        // a second facade in the same process may ask for the same directory
        if retouch_ml::cache_dir() != dir {
            return Err(err.into());
        }
    }
    Ok(())
}
