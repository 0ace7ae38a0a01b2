pub mod hf_hub;
pub mod loading;

pub mod cache;
pub mod device;
pub mod edges;
pub mod hed;
pub mod segment_anything;
pub mod stable_diffusion;

pub use cache::{Handle, Loaded, ModelCache, ModelKey, Movable, Unavailable};
pub use device::{Device, Placement, cuda_is_available};
pub use retouch_core::{cache_dir, set_cache_dir};
