//! Placeholder images for jobs whose render attempts all failed.
//!
//! The canvas is a dithered vertical gradient with a border and a few
//! lines of diagnostic text, so the file is recognisably a placeholder
//! and comfortably above the minimum-size threshold.

use std::path::Path;

use image::{ImageFormat as EncodedFormat, Rgb, RgbImage};
use molview_core::render::ImageFormat;
use molview_core::types::JobId;

use crate::error::RenderError;
use crate::font::{glyph, is_set, ADVANCE, GLYPH_HEIGHT};

const TOP: [u8; 3] = [236, 240, 245];
const BOTTOM: [u8; 3] = [196, 204, 216];
const BORDER: Rgb<u8> = Rgb([120, 130, 150]);
const TEXT: Rgb<u8> = Rgb([60, 66, 80]);
const BORDER_WIDTH: u32 = 4;
const MARGIN: u32 = 24;
const MAX_REASON_LINES: usize = 4;

/// What to draw on the placeholder.
#[derive(Debug, Clone)]
pub struct PlaceholderSpec<'a> {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub job_id: JobId,
    pub session_id: &'a str,
    pub reason: &'a str,
}

/// Draw the placeholder canvas.
pub fn draw(spec: &PlaceholderSpec<'_>) -> RgbImage {
    let width = spec.width.max(1);
    let height = spec.height.max(1);
    let mut img = RgbImage::from_fn(width, height, |x, y| {
        let t = y as f32 / height.max(2).saturating_sub(1) as f32;
        let d = dither(x, y);
        Rgb(std::array::from_fn(|i| {
            let base = f32::from(TOP[i]) + (f32::from(BOTTOM[i]) - f32::from(TOP[i])) * t;
            (base as i32 + d).clamp(0, 255) as u8
        }))
    });

    for y in 0..height {
        for x in 0..width {
            let edge = x < BORDER_WIDTH
                || y < BORDER_WIDTH
                || x >= width.saturating_sub(BORDER_WIDTH)
                || y >= height.saturating_sub(BORDER_WIDTH);
            if edge {
                img.put_pixel(x, y, BORDER);
            }
        }
    }

    let title_scale = (width / 200).clamp(1, 4);
    let body_scale = (title_scale / 2).max(1);
    let line_height = (GLYPH_HEIGHT + 3) * body_scale;
    let max_chars = (width.saturating_sub(2 * MARGIN) / (ADVANCE * body_scale)).max(1) as usize;

    let mut y = MARGIN;
    draw_text(&mut img, MARGIN, y, title_scale, "RENDER UNAVAILABLE");
    y += (GLYPH_HEIGHT + 4) * title_scale;

    for line in [
        format!("JOB {}", spec.job_id),
        format!("SESSION {}", spec.session_id),
    ] {
        if let Some(first) = wrap(&line, max_chars).first() {
            draw_text(&mut img, MARGIN, y, body_scale, first);
            y += line_height;
        }
    }

    y += line_height;
    for chunk in wrap(spec.reason, max_chars).into_iter().take(MAX_REASON_LINES) {
        draw_text(&mut img, MARGIN, y, body_scale, &chunk);
        y += line_height;
    }

    img
}

/// Draw the placeholder and write it to `path` in the job's format.
///
/// Creates the parent directory if needed and returns the file size.
pub async fn write(path: &Path, spec: &PlaceholderSpec<'_>) -> Result<u64, RenderError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let img = draw(spec);
    let format = match spec.format {
        ImageFormat::Png => EncodedFormat::Png,
        ImageFormat::Jpeg => EncodedFormat::Jpeg,
    };
    let target = path.to_path_buf();

    tokio::task::spawn_blocking(move || img.save_with_format(&target, format))
        .await
        .map_err(std::io::Error::other)?
        .map_err(std::io::Error::other)?;

    Ok(tokio::fs::metadata(path).await?.len())
}

/// Draw `text` with its top-left corner at `(x, y)`, clipped to the image.
fn draw_text(img: &mut RgbImage, x: u32, y: u32, scale: u32, text: &str) {
    let (width, height) = img.dimensions();
    for (i, c) in text.chars().enumerate() {
        let origin_x = x + i as u32 * ADVANCE * scale;
        for (row_index, row) in glyph(c).iter().enumerate() {
            for col in 0..ADVANCE {
                if !is_set(*row, col) {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = origin_x + col * scale + dx;
                        let py = y + row_index as u32 * scale + dy;
                        if px < width && py < height {
                            img.put_pixel(px, py, TEXT);
                        }
                    }
                }
            }
        }
    }
}

/// Greedy word wrap; words longer than a line are split.
fn wrap(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > max_chars {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            lines.push(word.drain(..max_chars).collect());
        }
        let word: String = word.into_iter().collect();
        if word.is_empty() {
            continue;
        }

        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }

    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Small deterministic per-pixel offset in `-3..=4` to break up banding.
fn dither(x: u32, y: u32) -> i32 {
    let mut h = x.wrapping_mul(374_761_393) ^ y.wrapping_mul(668_265_263);
    h = (h ^ (h >> 13)).wrapping_mul(1_274_126_177);
    ((h >> 24) & 7) as i32 - 3
}
