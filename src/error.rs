//! Error types shared by the bitmap pipeline, the codec and the BLE transport.

use std::time::Duration;

use thiserror::Error;

/// Everything that can stop a print job.
///
/// Bitmap errors surface before any radio I/O happens. Transport errors after
/// sending has started are never retried; the whole job must be restarted.
#[derive(Debug, Error)]
pub enum PrintError {
    /// Unknown binarization algorithm name.
    #[error("unsupported image binarization algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Passthrough binarization needs the input already at print width.
    #[error("image width {actual} does not match print width {expected}")]
    WidthMismatch { expected: u32, actual: u32 },

    #[error("input image has no pixels")]
    EmptyImage,

    /// Scan timed out without a matching advertisement.
    #[error("unable to find printer, make sure it is turned on")]
    DeviceNotFound,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The job was delivered but the printer never reported it was done.
    #[error("timed out after {0:?} waiting for the printer to finish")]
    CompletionTimeout(Duration),

    /// Preview declined.
    #[error("print aborted by user")]
    UserAborted,

    #[error("font error: {0}")]
    Font(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Ble(#[from] btleplug::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PrintError>;
