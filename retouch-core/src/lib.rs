pub mod download;
pub mod hf_hub;
pub mod http;
pub mod progress;
pub mod range;

pub use download::{checkpoint, checkpoint_to, model};
pub use hf_hub::{cache_dir, set_cache_dir};
