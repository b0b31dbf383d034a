//! Text rendering for `--text` prints.

use std::path::Path;

use image::{GrayImage, Luma};
use log::debug;
use rusttype::{point, Font, PositionedGlyph, Scale};

use crate::error::{PrintError, Result};

pub const DEFAULT_FONT_SIZE: f32 = 48.0;

/// Turns literal `\n` sequences (as typed on a shell) into line breaks.
pub fn unescape_newlines(text: &str) -> String {
    text.replace("\\n", "\n")
}

pub struct TextRenderer {
    font: Font<'static>,
    scale: Scale,
}

impl TextRenderer {
    pub fn from_bytes(data: Vec<u8>, size: f32) -> Result<Self> {
        let font = Font::try_from_vec(data)
            .ok_or_else(|| PrintError::Font("not a usable TrueType font".into()))?;
        Ok(Self {
            font,
            scale: Scale::uniform(size),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, size: f32) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| PrintError::Font(format!("{}: {}", path.display(), e)))?;
        Self::from_bytes(data, size)
    }

    fn line_width(&self, s: &str) -> f32 {
        s.chars()
            .map(|ch| self.font.glyph(ch).scaled(self.scale).h_metrics().advance_width)
            .sum()
    }

    /// Greedy word wrap. Explicit newlines always break, words wider than
    /// `width` get a line of their own.
    fn wrap(&self, text: &str, width: u32) -> Vec<String> {
        let mut lines = Vec::new();
        for raw_line in text.lines() {
            let mut cur = String::new();
            for word in raw_line.split_whitespace() {
                if cur.is_empty() {
                    cur.push_str(word);
                    continue;
                }
                let trial = format!("{} {}", cur, word);
                if self.line_width(&trial) <= width as f32 {
                    cur = trial;
                } else {
                    lines.push(std::mem::replace(&mut cur, word.to_string()));
                }
            }
            lines.push(cur);
        }
        lines
    }

    /// Renders `text` black on white into an image `width` pixels wide.
    ///
    /// Glyph coverage is kept as gray so the binarization step decides what
    /// becomes ink. Empty text still yields one blank line.
    pub fn render_text(&self, text: &str, width: u32) -> GrayImage {
        let v_metrics = self.font.v_metrics(self.scale);
        let line_height =
            (v_metrics.ascent - v_metrics.descent + v_metrics.line_gap).ceil().max(1.0) as u32;
        let lines = self.wrap(text, width);
        let height = line_height * lines.len().max(1) as u32;
        debug!(target: "bitmap", "text wrapped to {} lines, {}x{}", lines.len(), width, height);

        let mut img = GrayImage::from_pixel(width, height, Luma([255]));
        for (idx, line) in lines.iter().enumerate() {
            let baseline = (idx as u32 * line_height) as f32 + v_metrics.ascent;
            let glyphs: Vec<PositionedGlyph> =
                self.font.layout(line, self.scale, point(0.0, baseline)).collect();
            for glyph in glyphs {
                let Some(bb) = glyph.pixel_bounding_box() else {
                    continue;
                };
                glyph.draw(|gx, gy, coverage| {
                    let px = bb.min.x + gx as i32;
                    let py = bb.min.y + gy as i32;
                    if px < 0 || py < 0 || px as u32 >= width || py as u32 >= height {
                        return;
                    }
                    let pixel = img.get_pixel_mut(px as u32, py as u32);
                    let ink = (coverage.clamp(0.0, 1.0) * 255.0) as u8;
                    pixel[0] = pixel[0].min(255 - ink);
                });
            }
        }
        img
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescapes_shell_newlines() {
        assert_eq!(unescape_newlines("one\\ntwo"), "one\ntwo");
        assert_eq!(unescape_newlines("plain"), "plain");
    }

    #[test]
    fn rejects_garbage_fonts() {
        assert!(matches!(
            TextRenderer::from_bytes(b"definitely not a font".to_vec(), DEFAULT_FONT_SIZE),
            Err(PrintError::Font(_))
        ));
    }

    #[test]
    fn missing_font_file_is_a_font_error() {
        assert!(matches!(
            TextRenderer::open("/nonexistent/font.ttf", DEFAULT_FONT_SIZE),
            Err(PrintError::Font(_))
        ));
    }
}
