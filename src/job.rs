//! Turns a bitmap into the full command stream for one print.

use log::debug;

use crate::bitmap::BitImage;
use crate::error::{PrintError, Result};
use crate::protocol::{
    apply_energy, encode_row, feed_paper, fixed_command, set_energy, Command, FixedCommand,
    PRINT_WIDTH,
};

/// Which print mode selector follows the energy setting.
///
/// `Text` is the energy-committing selector and gives darker output; `Image`
/// is the plain image mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintMode {
    Image,
    #[default]
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub energy: u16,
    pub mode: PrintMode,
    /// Dot rows to feed after the image.
    pub feed_lines: u8,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            energy: 0xFFFF,
            mode: PrintMode::Text,
            feed_lines: 25,
        }
    }
}

/// The complete byte stream for one print, in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintJob {
    bytes: Vec<u8>,
    rows: usize,
}

impl PrintJob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of bitmap rows carried by the job.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// Assembles a job with the default mode and feed.
pub fn assemble(bitmap: &BitImage, energy: u16) -> Result<PrintJob> {
    assemble_with(
        bitmap,
        &JobOptions {
            energy,
            ..JobOptions::default()
        },
    )
}

/// Builds the job for `bitmap`.
///
/// Rows wider than [`PRINT_WIDTH`] do not fit the head and are rejected.
/// Narrower rows print left aligned.
pub fn assemble_with(bitmap: &BitImage, options: &JobOptions) -> Result<PrintJob> {
    if bitmap.width() > PRINT_WIDTH {
        return Err(PrintError::WidthMismatch {
            expected: PRINT_WIDTH,
            actual: bitmap.width(),
        });
    }

    let mode = match options.mode {
        PrintMode::Text => apply_energy(),
        PrintMode::Image => fixed_command(FixedCommand::PrintImageMode),
    };

    let mut commands: Vec<Command> = vec![
        fixed_command(FixedCommand::GetDeviceState),
        fixed_command(FixedCommand::SetQuality200Dpi),
        set_energy(options.energy),
        mode,
        fixed_command(FixedCommand::LatticeStart),
    ];
    commands.extend(bitmap.rows().map(encode_row));
    commands.push(feed_paper(options.feed_lines));
    // the firmware wants the alignment marker three times
    for _ in 0..3 {
        commands.push(fixed_command(FixedCommand::SetPaper));
    }
    commands.push(fixed_command(FixedCommand::LatticeEnd));
    commands.push(fixed_command(FixedCommand::GetDeviceState));

    let bytes: Vec<u8> = commands.into_iter().flat_map(Command::into_bytes).collect();
    debug!(target: "job", "assembled {} rows into {} bytes", bitmap.height(), bytes.len());
    Ok(PrintJob {
        bytes,
        rows: bitmap.height() as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        decode_row, split_frames, CMD_FEED_PAPER, CMD_GET_DEV_STATE, CMD_LATTICE,
        CMD_PRINT_MODE, CMD_ROW_RAW, CMD_ROW_RLE, CMD_SET_ENERGY, CMD_SET_PAPER,
        CMD_SET_QUALITY,
    };
    use pretty_assertions::assert_eq;

    fn stripes(width: u32, height: u32) -> BitImage {
        let pixels = (0..width * height)
            .map(|i| (i % width) % (2 + i / width) == 0)
            .collect();
        BitImage::new(width, height, pixels).unwrap()
    }

    #[test]
    fn job_follows_the_device_sequence() {
        let bitmap = stripes(384, 5);
        let job = assemble(&bitmap, 0x3000).unwrap();
        let frames = split_frames(job.as_bytes()).unwrap();
        let ids: Vec<u8> = frames.iter().map(|f| f.command_id).collect();

        let mut expected = vec![
            CMD_GET_DEV_STATE,
            CMD_SET_QUALITY,
            CMD_SET_ENERGY,
            CMD_PRINT_MODE,
            CMD_LATTICE,
        ];
        for frame in &frames[5..10] {
            assert!(frame.command_id == CMD_ROW_RLE || frame.command_id == CMD_ROW_RAW);
        }
        expected.extend(ids[5..10].iter().copied());
        expected.extend([
            CMD_FEED_PAPER,
            CMD_SET_PAPER,
            CMD_SET_PAPER,
            CMD_SET_PAPER,
            CMD_LATTICE,
            CMD_GET_DEV_STATE,
        ]);
        assert_eq!(ids, expected);
        assert_eq!(frames[2].payload, vec![0x30, 0x00]);
        assert_eq!(frames[10].payload, vec![25]);
        assert!(frames.iter().all(|f| f.verify()));
        assert_eq!(job.rows(), 5);
    }

    #[test]
    fn rows_are_sent_top_to_bottom() {
        let bitmap = stripes(384, 6);
        let job = assemble(&bitmap, 0xFFFF).unwrap();
        let frames = split_frames(job.as_bytes()).unwrap();
        for (frame, row) in frames[5..11].iter().zip(bitmap.rows()) {
            assert_eq!(decode_row(frame, 384).unwrap(), row);
        }
    }

    #[test]
    fn image_mode_swaps_the_selector() {
        let bitmap = stripes(384, 1);
        let text = assemble(&bitmap, 0xFFFF).unwrap();
        let image = assemble_with(
            &bitmap,
            &JobOptions {
                mode: PrintMode::Image,
                ..JobOptions::default()
            },
        )
        .unwrap();
        assert_eq!(text.len(), image.len());
        let frames = split_frames(image.as_bytes()).unwrap();
        assert_eq!(frames[3].payload, vec![0x00]);
        assert_eq!(split_frames(text.as_bytes()).unwrap()[3].payload, vec![0x01]);
    }

    #[test]
    fn empty_bitmap_still_frames_the_job() {
        let bitmap = BitImage::new(384, 0, vec![]).unwrap();
        let frames = split_frames(assemble(&bitmap, 0xFFFF).unwrap().as_bytes()).unwrap();
        assert_eq!(frames.len(), 11);
    }

    #[test]
    fn bitmaps_wider_than_the_head_are_rejected() {
        let wide = BitImage::new(1000, 2, vec![true; 2000]).unwrap();
        assert!(matches!(
            assemble(&wide, 0xFFFF),
            Err(PrintError::WidthMismatch { expected: 384, actual: 1000 })
        ));

        let narrow = BitImage::new(16, 2, vec![false; 32]).unwrap();
        assert_eq!(assemble(&narrow, 0xFFFF).unwrap().rows(), 2);
    }
}
