//! # catprint
//!
//! ```bash
//! # auto discover the printer and print a photo
//! catprint photo.jpg
//!
//! # text, two lines, explicit device
//! catprint --text 'hello\nworld' --font Roboto-Regular.ttf -d GB02
//!
//! # check the bitmap first
//! catprint -b atkinson --preview out.png photo.jpg
//! ```

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use image::GrayImage;
use log::{error, info, warn, LevelFilter};

use catprint::{
    bitmap::open_grayscale,
    ble::{BtleplugDriver, DEFAULT_MTU},
    build_bitmap,
    font::{unescape_newlines, TextRenderer, DEFAULT_FONT_SIZE},
    assemble_with, BitImage, Completion, DeviceTarget, ImageDithering, JobOptions, PrintError,
    PrintMode, Session, TransportConfig, PRINT_WIDTH,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

/// Prints an image or text on your cat thermal printer
#[derive(Debug, Parser)]
#[command(name = "catprint", version, about, long_about = None)]
struct Args {
    /// Image file to print
    #[arg(required_unless_present = "text", conflicts_with = "text")]
    filename: Option<PathBuf>,

    /// Text to print instead of an image. Line breaks can be written as \n
    #[arg(long, requires = "font")]
    text: Option<String>,

    /// TrueType font used for --text
    #[arg(long, value_name = "TTF")]
    font: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_FONT_SIZE)]
    font_size: f32,

    #[arg(short, long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// mean-threshold, floyd-steinberg, atkinson, halftone or none. With
    /// none the image must already be 384 px wide
    #[arg(short = 'b', long, default_value = "floyd-steinberg")]
    img_binarization_algo: String,

    /// BLE address (MAC on Linux, UUID on macOS) or advertised name such as
    /// GB02. Omit to find the printer by its advertised services
    #[arg(short, long)]
    device: Option<String>,

    /// Print head energy, decimal or 0x prefixed hex
    #[arg(short, long, default_value = "0xffff", value_parser = parse_energy)]
    energy: u16,

    /// Use the image mode selector instead of the darker text mode
    #[arg(long)]
    image_mode: bool,

    /// Write the final bitmap to this PNG and ask before printing
    #[arg(long, value_name = "PATH")]
    preview: Option<PathBuf>,

    /// Seconds to scan for the printer
    #[arg(long, default_value_t = 10)]
    scan_timeout: u64,

    /// Seconds to wait for the printer to report it is done
    #[arg(long, default_value_t = 30)]
    completion_timeout: u64,

    /// ATT MTU assumed for the connection
    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: u16,
}

fn parse_energy(s: &str) -> std::result::Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid energy `{}`: {}", s, e))
}

fn load_input(args: &Args) -> Result<GrayImage> {
    if let Some(text) = &args.text {
        let font = args.font.as_ref().context("--text needs a --font")?;
        let renderer = TextRenderer::open(font, args.font_size)?;
        return Ok(renderer.render_text(&unescape_newlines(text), PRINT_WIDTH));
    }
    let path = args
        .filename
        .as_ref()
        .context("either a filename or --text is required")?;
    open_grayscale(path).with_context(|| format!("can't read {}", path.display()))
}

/// Saves the bitmap and asks for confirmation. Anything but `n` goes ahead.
fn confirm_preview(bitmap: &BitImage, path: &Path) -> Result<()> {
    bitmap
        .to_gray_image()
        .save(path)
        .with_context(|| format!("can't write preview {}", path.display()))?;
    info!("preview written to {}", path.display());

    print!("Go ahead with print? [Y/n] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    if answer.trim().eq_ignore_ascii_case("n") {
        return Err(PrintError::UserAborted.into());
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let algorithm: ImageDithering = args.img_binarization_algo.parse()?;

    let gray = load_input(&args)?;
    let bitmap = build_bitmap(&gray, PRINT_WIDTH, algorithm)?;
    info!("read image: {}x{} (w, h) pixels", bitmap.width(), bitmap.height());

    if let Some(path) = &args.preview {
        confirm_preview(&bitmap, path)?;
    }

    let options = JobOptions {
        energy: args.energy,
        mode: if args.image_mode {
            PrintMode::Image
        } else {
            PrintMode::Text
        },
        ..JobOptions::default()
    };
    let job = assemble_with(&bitmap, &options)?;
    info!("generated BLE commands: {} bytes", job.len());

    let config = TransportConfig {
        scan_timeout: Duration::from_secs(args.scan_timeout),
        completion_timeout: Duration::from_secs(args.completion_timeout),
        ..TransportConfig::default()
    };
    let driver = BtleplugDriver::new(0)
        .await
        .context("can't open the bluetooth adapter")?
        .with_mtu(args.mtu);
    let mut session = Session::new(driver, config);
    let target = DeviceTarget::parse(args.device.as_deref());

    tokio::select! {
        found = session.discover(&target) => {
            found?;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted while looking for the printer");
            return Err(PrintError::UserAborted.into());
        }
    }

    match session.deliver(&job).await? {
        Completion::Confirmed => info!("all done"),
        Completion::Unconfirmed { waited } => {
            warn!("printer did not confirm within {:?}, it may still be printing", waited)
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.log_level.into())
        .parse_default_env()
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
