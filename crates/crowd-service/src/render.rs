use crate::text::{draw_text_mut, text_height};
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::crowd::Centroid;
use crowd_engine::{HeatmapAccumulator, Zone};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

const PERSON_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const HIGH_ZONE_COLOR: Rgb<u8> = Rgb([255, 165, 0]);
const CRITICAL_ZONE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const CAPTION_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const PERSON_DOT_RADIUS: i32 = 6;
const ZONE_BORDER: u32 = 3;
const ZONE_LABEL_SCALE: u32 = 2;
const ZONE_LABEL_OFFSET: (u32, u32) = (5, 10);
const CAPTION_SCALE: u32 = 6;
const CAPTION_ORIGIN: (i32, i32) = (20, 20);

/// An annotated frame ready to be served
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub frame_index: u64,
    pub count: u32,
    pub width: u32,
    pub height: u32,
    pub jpeg: Bytes,
    pub rendered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameRenderer {
    width: u32,
    height: u32,
    quality: u8,
}

impl FrameRenderer {
    pub fn new(width: u32, height: u32, quality: u8) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    /// Annotate, overlay the heatmap, scale to the output size and encode
    pub fn render(
        &self,
        frame: &RgbImage,
        frame_index: u64,
        centroids: &[Centroid],
        zones: &[Zone],
        cell_size: u32,
        heatmap: &HeatmapAccumulator,
    ) -> Result<RenderedFrame> {
        let mut annotated = annotate(frame, centroids, zones, cell_size);
        heatmap
            .overlay(&mut annotated)
            .context("failed to overlay heatmap")?;
        draw_caption(&mut annotated, centroids.len());

        let scaled = if annotated.dimensions() == (self.width, self.height) {
            annotated
        } else {
            image::imageops::resize(&annotated, self.width, self.height, FilterType::Triangle)
        };

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode_image(&scaled)
            .context("failed to encode frame as JPEG")?;

        Ok(RenderedFrame {
            frame_index,
            count: centroids.len() as u32,
            width: self.width,
            height: self.height,
            jpeg: Bytes::from(jpeg),
            rendered_at: Utc::now(),
        })
    }
}

/// Person dots, zone borders and zone head counts drawn on a copy of the frame
pub fn annotate(frame: &RgbImage, centroids: &[Centroid], zones: &[Zone], cell_size: u32) -> RgbImage {
    let mut canvas = frame.clone();
    let (width, height) = canvas.dimensions();

    for c in centroids.iter().filter(|c| dot_touches_frame(c, width, height)) {
        draw_filled_circle_mut(&mut canvas, (c.x, c.y), PERSON_DOT_RADIUS, PERSON_COLOR);
    }

    for zone in zones {
        let color = if zone.is_critical() {
            CRITICAL_ZONE_COLOR
        } else {
            HIGH_ZONE_COLOR
        };
        let (x, y) = zone.origin(cell_size);

        for inset in 0..ZONE_BORDER {
            let side = cell_size.saturating_sub(2 * inset);
            if side == 0 {
                break;
            }
            let rect = Rect::at((x + inset) as i32, (y + inset) as i32).of_size(side, side);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }

        draw_text_mut(
            &mut canvas,
            (x + ZONE_LABEL_OFFSET.0) as i32,
            (y + ZONE_LABEL_OFFSET.1) as i32,
            ZONE_LABEL_SCALE,
            &format!("{} ppl", zone.density),
            color,
        );
    }

    canvas
}

/// Head count caption in the top-left corner, drawn over the heatmap blend
pub fn draw_caption(canvas: &mut RgbImage, count: usize) {
    let (x, y) = CAPTION_ORIGIN;
    if canvas.height() < y as u32 + text_height(CAPTION_SCALE) {
        return;
    }
    draw_text_mut(
        canvas,
        x,
        y,
        CAPTION_SCALE,
        &format!("Detected People: {}", count),
        CAPTION_COLOR,
    );
}

fn dot_touches_frame(c: &Centroid, width: u32, height: u32) -> bool {
    let r = i64::from(PERSON_DOT_RADIUS);
    let (x, y) = (i64::from(c.x), i64::from(c.y));
    x + r >= 0 && y + r >= 0 && x - r < i64::from(width) && y - r < i64::from(height)
}
