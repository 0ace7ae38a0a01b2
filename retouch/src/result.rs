use retouch_ml::Unavailable;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported control type `{0}`, expected canny or softedge")]
    UnsupportedControl(String),

    #[error(
        "image and mask dimensions mismatch: image is {}x{}, mask is {}x{}",
        image.0,
        image.1,
        mask.0,
        mask.1
    )]
    DimensionMismatch { image: (u32, u32), mask: (u32, u32) },

    #[error("zoom factor must be a finite number greater than 1, got {0}")]
    InvalidZoomFactor(f64),

    #[error("model `{key}` is unavailable: {reason}")]
    Unavailable { key: String, reason: String },

    #[error(transparent)]
    Inference(#[from] anyhow::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

impl From<Unavailable> for Error {
    fn from(unavailable: Unavailable) -> Self {
        Error::Unavailable {
            key: unavailable.key.to_string(),
            reason: unavailable.reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
