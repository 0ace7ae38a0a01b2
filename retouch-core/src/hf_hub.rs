use std::path::{Path, PathBuf};

use hf_hub::{
    Cache, Repo,
    api::tokio::{Api, ApiBuilder, Progress},
};
use indicatif::ProgressBar;
use once_cell::sync::{Lazy, OnceCell};

use crate::progress::{Emitter, progress_bar};

static CACHE_DIR: OnceCell<PathBuf> = OnceCell::new();

static HF_API: Lazy<Api> = Lazy::new(|| {
    ApiBuilder::new()
        .with_cache_dir(cache_dir().to_path_buf())
        .high()
        .build()
        .expect("build HF API client")
});
static HF_CACHE: Lazy<Cache> = Lazy::new(|| Cache::new(cache_dir().to_path_buf()));

/// Root directory for every downloaded weight file.
pub fn cache_dir() -> &'static Path {
    CACHE_DIR.get_or_init(|| {
        dirs::cache_dir()
            .unwrap_or_default()
            .join("retouch")
            .join("models")
    })
}

pub fn set_cache_dir(path: PathBuf) -> anyhow::Result<()> {
    CACHE_DIR
        .set(path)
        .map_err(|_| anyhow::anyhow!("cache dir has already been set"))
}

pub fn api() -> &'static Api {
    &HF_API
}

pub fn cache() -> &'static Cache {
    &HF_CACHE
}

pub fn repo(name: &str) -> Repo {
    Repo::model(name.to_string())
}

#[derive(Clone)]
pub(crate) struct Reporter {
    pb: ProgressBar,
    emitter: Emitter,
}

impl Reporter {
    pub fn new(filename: &str) -> Self {
        Self {
            pb: progress_bar(filename),
            emitter: Emitter::new(filename),
        }
    }
}

impl Progress for Reporter {
    async fn init(&mut self, size: usize, _filename: &str) {
        self.emitter.begin(size as u64);
        self.pb.set_length(size as u64);
        self.pb.set_position(0);
    }

    async fn update(&mut self, size: usize) {
        self.pb.inc(size as u64);
        self.emitter.advance(size as u64);
    }

    async fn finish(&mut self) {
        self.pb.finish_and_clear();
        self.emitter.complete();
    }
}
