//! catprint: print images and text on GB01/GB02/GT01 style cat thermal
//! printers over BLE.
//!
//! Main modules:
//! - bitmap: grayscale input to 1-bit print bitmap
//! - dithering: binarization algorithms
//! - protocol: frame codec and checksum
//! - job: full command stream for one print
//! - printer: transport session over a [`printer::BleDriver`]
//! - ble: btleplug backed driver
//! - font: text rasterization

pub mod bitmap;
pub mod ble;
pub mod dithering;
pub mod error;
pub mod font;
pub mod job;
pub mod printer;
pub mod protocol;

pub use bitmap::{build_bitmap, BitImage};
pub use ble::BtleplugDriver;
pub use dithering::ImageDithering;
pub use error::{PrintError, Result};
pub use job::{assemble, assemble_with, JobOptions, PrintJob, PrintMode};
pub use printer::{BleDriver, Completion, DeviceTarget, Session, TransportConfig};
pub use protocol::PRINT_WIDTH;
