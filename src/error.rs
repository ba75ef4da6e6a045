use thiserror::Error;

/// Error type for plan construction and per-image processing
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid image shape: {0}")]
    InvalidShape(String),

    #[error("Unsupported pixel type: {0}")]
    UnsupportedPixelType(String),

    #[error("Image does not match the plan: {0}")]
    ImageMismatch(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("No suitable compute device: {0}")]
    DeviceUnavailable(String),

    #[error("Kernel not found: {0}")]
    KernelMissing(String),

    #[error("Buffer not found: {0}")]
    BufferMissing(String),

    #[error("GPU error: {0}")]
    Gpu(String),
}

pub type Result<T> = std::result::Result<T, Error>;
