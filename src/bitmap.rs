//! Grayscale image to 1-bit print bitmap.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use log::{debug, info};

use crate::dithering::{
    atkinson_dither, floyd_steinberg_dither, halftone_dither, mean_threshold, threshold,
    ImageDithering, THRESHOLD,
};
use crate::error::{PrintError, Result};

/// A binarized image, `true` = ink.
///
/// Any width is accepted here; [`crate::job::assemble`] refuses anything
/// wider than the print head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitImage {
    width: u32,
    height: u32,
    pixels: Vec<bool>,
}

impl BitImage {
    /// Wraps row-major pixels. Returns `None` if the length does not match.
    pub fn new(width: u32, height: u32, pixels: Vec<bool>) -> Option<Self> {
        (pixels.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    /// Everything at or below [`THRESHOLD`] becomes ink.
    pub fn from_gray(img: &GrayImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            pixels: img.pixels().map(|p| p[0] <= THRESHOLD).collect(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.pixels[(y * self.width + x) as usize]
    }

    /// Rows top to bottom.
    pub fn rows(&self) -> impl Iterator<Item = &[bool]> {
        self.pixels.chunks(self.width.max(1) as usize)
    }

    pub fn ink_count(&self) -> usize {
        self.pixels.iter().filter(|&&ink| ink).count()
    }

    /// Renders the bitmap back to black on white, for previews.
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([if self.get(x, y) { 0 } else { 255 }])
        })
    }
}

/// Decodes any supported image format to 8-bit grayscale.
pub fn decode_grayscale(bytes: &[u8]) -> Result<GrayImage> {
    Ok(image::load_from_memory(bytes)?.to_luma8())
}

pub fn open_grayscale<P: AsRef<Path>>(path: P) -> Result<GrayImage> {
    Ok(image::open(path)?.to_luma8())
}

/// Scales `img` to `width`, keeping the aspect ratio.
///
/// Shrinking averages the covered source area, growing interpolates
/// linearly.
pub fn resize_to_width(img: &GrayImage, width: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    let height = ((h as f64 * width as f64 / w as f64) as u32).max(1);
    if (w, h) == (width, height) {
        img.clone()
    } else if width <= w && height <= h {
        imageops::thumbnail(img, width, height)
    } else {
        imageops::resize(img, width, height, FilterType::Triangle)
    }
}

/// Turns a grayscale image into a `width` wide print bitmap.
///
/// Every algorithm except [`ImageDithering::None`] resizes first. `None`
/// requires the input to already be `width` wide.
pub fn build_bitmap(image: &GrayImage, width: u32, algorithm: ImageDithering) -> Result<BitImage> {
    let (src_w, src_h) = image.dimensions();
    if src_w == 0 || src_h == 0 || width == 0 {
        return Err(PrintError::EmptyImage);
    }

    let mut gray = match algorithm {
        ImageDithering::None => {
            if src_w != width {
                return Err(PrintError::WidthMismatch {
                    expected: width,
                    actual: src_w,
                });
            }
            image.clone()
        }
        _ => resize_to_width(image, width),
    };
    debug!(target: "bitmap", "resized {}x{} to {}x{}", src_w, src_h, gray.width(), gray.height());

    info!(target: "bitmap", "applying {} binarization", algorithm);
    match algorithm {
        ImageDithering::MeanThreshold => mean_threshold(&mut gray),
        ImageDithering::FloydSteinberg => floyd_steinberg_dither(&mut gray),
        ImageDithering::Atkinson => atkinson_dither(&mut gray),
        ImageDithering::Halftone => {
            gray = halftone_dither(&gray);
            if gray.width() > width {
                gray = imageops::crop_imm(&gray, 0, 0, width, gray.height()).to_image();
            }
        }
        ImageDithering::None => threshold(&mut gray),
    }

    if gray.width() != width {
        return Err(PrintError::WidthMismatch {
            expected: width,
            actual: gray.width(),
        });
    }
    Ok(BitImage::from_gray(&gray))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PRINT_WIDTH;

    fn photo(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            Luma([((x * 255 / width.max(1)) ^ (y * 3)) as u8])
        })
    }

    #[test]
    fn shrinking_averages_blocks() {
        let img = GrayImage::from_fn(4, 2, |x, _| Luma([if x % 2 == 0 { 0 } else { 200 }]));
        let out = resize_to_width(&img, 2);
        assert_eq!(out.dimensions(), (2, 1));
        for p in out.pixels() {
            assert!((99..=101).contains(&p[0]), "{}", p[0]);
        }
    }

    #[test]
    fn shrinking_by_a_fractional_factor_tracks_a_gradient() {
        // 1000 -> 384 covers 2.6 source columns per output column
        let img = GrayImage::from_fn(1000, 300, |x, _| Luma([(x * 255 / 999) as u8]));
        let out = resize_to_width(&img, PRINT_WIDTH);
        assert_eq!(out.dimensions(), (PRINT_WIDTH, 115));

        let scale = 1000.0 / PRINT_WIDTH as f64;
        for x in 0..PRINT_WIDTH {
            let centre = (x as f64 + 0.5) * scale - 0.5;
            let expected = centre * 255.0 / 999.0;
            let got = out.get_pixel(x, 57)[0] as f64;
            assert!((got - expected).abs() <= 2.0, "column {x}: {got} vs {expected}");
        }
    }

    #[test]
    fn growing_keeps_flat_images_flat() {
        let img = GrayImage::from_pixel(7, 5, Luma([255]));
        let out = resize_to_width(&img, PRINT_WIDTH);
        assert_eq!(out.dimensions(), (PRINT_WIDTH, 274));
        assert!(out.pixels().all(|p| p[0] >= 254));
    }

    #[test]
    fn every_algorithm_yields_print_width() {
        let img = photo(500, 120);
        for algo in [
            ImageDithering::MeanThreshold,
            ImageDithering::FloydSteinberg,
            ImageDithering::Atkinson,
            ImageDithering::Halftone,
        ] {
            let bitmap = build_bitmap(&img, PRINT_WIDTH, algo).unwrap();
            assert_eq!(bitmap.width(), PRINT_WIDTH, "{algo}");
            assert!(bitmap.height() > 0);
        }
    }

    #[test]
    fn halftone_height_follows_cell_grid() {
        let img = GrayImage::from_pixel(PRINT_WIDTH, 10, Luma([0]));
        let bitmap = build_bitmap(&img, PRINT_WIDTH, ImageDithering::Halftone).unwrap();
        assert_eq!(bitmap.height(), 12);
    }

    #[test]
    fn output_is_deterministic() {
        let img = photo(300, 80);
        for algo in ImageDithering::ALL.into_iter().filter(|a| *a != ImageDithering::None) {
            assert_eq!(
                build_bitmap(&img, PRINT_WIDTH, algo).unwrap(),
                build_bitmap(&img, PRINT_WIDTH, algo).unwrap()
            );
        }
    }

    #[test]
    fn passthrough_rejects_other_widths() {
        let img = GrayImage::from_pixel(200, 10, Luma([0]));
        assert!(matches!(
            build_bitmap(&img, PRINT_WIDTH, ImageDithering::None),
            Err(PrintError::WidthMismatch { expected: 384, actual: 200 })
        ));
    }

    #[test]
    fn passthrough_only_thresholds() {
        // a mid-gray field that error diffusion would break up into a pattern
        let mut img = GrayImage::from_pixel(PRINT_WIDTH, 4, Luma([127]));
        img.put_pixel(0, 0, Luma([128]));
        let bitmap = build_bitmap(&img, PRINT_WIDTH, ImageDithering::None).unwrap();
        assert!(!bitmap.get(0, 0));
        assert_eq!(bitmap.ink_count(), PRINT_WIDTH as usize * 4 - 1);
    }

    #[test]
    fn ink_is_inverted_threshold() {
        let img = GrayImage::from_fn(2, 1, |x, _| Luma([if x == 0 { 0 } else { 255 }]));
        let bitmap = build_bitmap(&img, 2, ImageDithering::FloydSteinberg).unwrap();
        assert!(bitmap.get(0, 0));
        assert!(!bitmap.get(1, 0));
        assert_eq!(bitmap.to_gray_image().get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn white_image_has_no_ink() {
        let img = GrayImage::from_pixel(16, 16, Luma([255]));
        let bitmap = build_bitmap(&img, 16, ImageDithering::MeanThreshold).unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (16, 16));
        assert_eq!(bitmap.ink_count(), 0);
    }

    #[test]
    fn empty_input_is_rejected() {
        let img = GrayImage::new(0, 0);
        assert!(matches!(
            build_bitmap(&img, PRINT_WIDTH, ImageDithering::Atkinson),
            Err(PrintError::EmptyImage)
        ));
    }

    #[test]
    fn bit_image_checks_dimensions() {
        assert!(BitImage::new(2, 2, vec![false; 3]).is_none());
        let bitmap = BitImage::new(2, 2, vec![true, false, false, true]).unwrap();
        let rows: Vec<&[bool]> = bitmap.rows().collect();
        assert_eq!(rows, vec![&[true, false][..], &[false, true][..]]);
    }
}
