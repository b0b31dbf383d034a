use std::fmt;
use std::str::FromStr;

use image::{imageops, GenericImageView, GrayImage, Luma};
use imageproc::drawing::draw_filled_circle_mut;

use crate::error::PrintError;

/// Intensities above this are paper, at or below are ink.
pub const THRESHOLD: u8 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDithering {
    /// Global mean of the resized image as threshold.
    MeanThreshold,
    FloydSteinberg,
    Atkinson,
    Halftone,
    /// Plain 127 threshold, input must already be at print width.
    None,
}

impl ImageDithering {
    pub const ALL: [ImageDithering; 5] = [
        ImageDithering::MeanThreshold,
        ImageDithering::FloydSteinberg,
        ImageDithering::Atkinson,
        ImageDithering::Halftone,
        ImageDithering::None,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ImageDithering::MeanThreshold => "mean-threshold",
            ImageDithering::FloydSteinberg => "floyd-steinberg",
            ImageDithering::Atkinson => "atkinson",
            ImageDithering::Halftone => "halftone",
            ImageDithering::None => "none",
        }
    }
}

impl fmt::Display for ImageDithering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ImageDithering {
    type Err = PrintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageDithering::ALL
            .into_iter()
            .find(|algo| algo.name() == s)
            .ok_or_else(|| PrintError::UnsupportedAlgorithm(s.to_string()))
    }
}

/// Error diffusion weights: `(dx, dy, numerator)` over a common divisor.
#[derive(Debug, Clone, Copy)]
pub struct DiffusionKernel {
    pub taps: &'static [(i32, i32, i16)],
    pub divisor: i16,
}

pub const FLOYD_STEINBERG: DiffusionKernel = DiffusionKernel {
    taps: &[(1, 0, 7), (-1, 1, 3), (0, 1, 5), (1, 1, 1)],
    divisor: 16,
};

/// Spreads 6/8 of the error; the remaining 2/8 is dropped, which is what
/// keeps Atkinson output contrasty.
pub const ATKINSON: DiffusionKernel = DiffusionKernel {
    taps: &[(1, 0, 1), (2, 0, 1), (-1, 1, 1), (0, 1, 1), (1, 1, 1), (0, 2, 1)],
    divisor: 8,
};

/// Thresholds the pixel at `(x, y)` and pushes its error to the neighbours.
///
/// Neighbours outside the image are skipped. Values are clamped to `0..=255`
/// after each update. Returns the signed error.
pub fn diffuse_pixel(img: &mut GrayImage, x: u32, y: u32, kernel: &DiffusionKernel) -> i16 {
    let (width, height) = img.dimensions();
    let old_pixel = img.get_pixel(x, y)[0];
    let new_pixel = if old_pixel > THRESHOLD { 255 } else { 0 };
    img.put_pixel(x, y, Luma([new_pixel]));
    let error = old_pixel as i16 - new_pixel as i16;

    for &(dx, dy, weight) in kernel.taps {
        let nx = x as i32 + dx;
        let ny = y as i32 + dy;
        if nx >= 0 && nx < width as i32 && ny >= 0 && ny < height as i32 {
            let pixel = img.get_pixel_mut(nx as u32, ny as u32);
            let new_val = pixel[0] as i16 + error * weight / kernel.divisor;
            pixel[0] = new_val.clamp(0, 255) as u8;
        }
    }
    error
}

/// Runs error diffusion over the whole image in-place, row by row,
/// left to right.
pub fn error_diffusion_dither(img: &mut GrayImage, kernel: &DiffusionKernel) {
    let (width, height) = img.dimensions();
    for y in 0..height {
        for x in 0..width {
            diffuse_pixel(img, x, y, kernel);
        }
    }
}

/// Applies Floyd-Steinberg dithering to a grayscale image buffer in-place.
pub fn floyd_steinberg_dither(img: &mut GrayImage) {
    error_diffusion_dither(img, &FLOYD_STEINBERG);
}

/// Applies Atkinson dithering to a grayscale image buffer in-place.
pub fn atkinson_dither(img: &mut GrayImage) {
    error_diffusion_dither(img, &ATKINSON);
}

/// Mean intensity over every pixel of the image.
pub fn mean_intensity(img: &GrayImage) -> f64 {
    let pixels = img.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|&p| p as u64).sum::<u64>() as f64 / pixels.len() as f64
}

/// Maps every pixel to 0 or 255 against the global mean.
///
/// A pixel is ink only when it is strictly darker than the mean, so a flat
/// image prints nothing.
pub fn mean_threshold(img: &mut GrayImage) {
    let mean = mean_intensity(img);
    for pixel in img.pixels_mut() {
        pixel[0] = if (pixel[0] as f64) < mean { 0 } else { 255 };
    }
}

/// Maps every pixel to 0 or 255 against [`THRESHOLD`].
pub fn threshold(img: &mut GrayImage) {
    for pixel in img.pixels_mut() {
        pixel[0] = if pixel[0] > THRESHOLD { 255 } else { 0 };
    }
}

/// Output cell edge for [`halftone_dither`].
pub const HALFTONE_SIDE: u32 = 4;
/// Source block edge sampled per cell.
pub const HALFTONE_STRIDE: u32 = 4;
const HALFTONE_ALPHA: f32 = 3.0;

/// Mean intensity of the `size`×`size` block at `(x, y)`, clipped to the
/// image.
fn block_mean(img: &GrayImage, x: u32, y: u32, size: u32) -> f32 {
    let (width, height) = img.dimensions();
    let block = img.view(x, y, size.min(width - x), size.min(height - y));
    let (count, sum) = block
        .pixels()
        .fold((0u32, 0u32), |(n, sum), (_, _, p)| (n + 1, sum + p[0] as u32));
    sum as f32 / count as f32
}

/// Redraws the image as a grid of dots, returning a new image.
///
/// Each [`HALFTONE_STRIDE`] block becomes a [`HALFTONE_SIDE`] cell with a
/// black dot whose radius grows with the block's darkness, so the result is
/// `side * ceil(h / stride)` high and `side * ceil(w / stride)` wide.
pub fn halftone_dither(img: &GrayImage) -> GrayImage {
    let (width, height) = img.dimensions();
    let cols = width.div_ceil(HALFTONE_STRIDE);
    let rows = height.div_ceil(HALFTONE_STRIDE);
    let mut out = GrayImage::from_pixel(cols * HALFTONE_SIDE, rows * HALFTONE_SIDE, Luma([255]));
    let centre = (HALFTONE_SIDE / 2) as i32;

    for row in 0..rows {
        for col in 0..cols {
            let mean = block_mean(img, col * HALFTONE_STRIDE, row * HALFTONE_STRIDE, HALFTONE_STRIDE);
            let darkness = 1.0 - mean / 255.0;
            let radius = (HALFTONE_ALPHA * darkness * HALFTONE_SIDE as f32 / 2.0) as i32;
            if radius == 0 {
                continue;
            }
            let mut cell = GrayImage::from_pixel(HALFTONE_SIDE, HALFTONE_SIDE, Luma([255]));
            draw_filled_circle_mut(&mut cell, (centre, centre), radius, Luma([0]));
            imageops::replace(
                &mut out,
                &cell,
                (col * HALFTONE_SIDE) as i64,
                (row * HALFTONE_SIDE) as i64,
            );
        }
    }
    out
}
