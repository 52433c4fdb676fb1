/// Cumulative "where has the crowd been" heatmap.
///
/// Every analyzed frame stamps a filled disk per person onto a float
/// accumulator the size of the frame. Rendering blurs a scaled copy and maps
/// it through a JET-style gradient; the accumulator itself is only changed by
/// stamping, decay and reset.
use crate::config::HeatmapConfig;
use anyhow::{ensure, Result};
use common::crowd::Centroid;
use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use imageproc::filter::gaussian_blur_f32;

pub type Accumulator = ImageBuffer<Luma<f32>, Vec<f32>>;

pub struct HeatmapAccumulator {
    accumulator: Accumulator,
    config: HeatmapConfig,
}

impl HeatmapAccumulator {
    pub fn new(width: u32, height: u32, config: HeatmapConfig) -> Self {
        Self {
            accumulator: ImageBuffer::new(width, height),
            config,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.accumulator.dimensions()
    }

    /// Raw accumulator value, `None` outside the frame
    pub fn value_at(&self, x: u32, y: u32) -> Option<f32> {
        self.accumulator.get_pixel_checked(x, y).map(|p| p.0[0])
    }

    pub fn stamp(&mut self, centroids: &[Centroid]) {
        if self.config.decay < 1.0 {
            let decay = self.config.decay;
            for pixel in self.accumulator.pixels_mut() {
                pixel.0[0] *= decay;
            }
        }

        let color = Luma([self.config.stamp_intensity]);
        let radius = self.config.stamp_radius;
        let visible: Vec<&Centroid> = centroids
            .iter()
            .filter(|c| self.disk_touches_frame(c))
            .collect();
        for c in visible {
            draw_filled_circle_mut(&mut self.accumulator, (c.x, c.y), radius, color);
        }
    }

    /// Disks that cannot reach the frame are skipped before drawing
    fn disk_touches_frame(&self, c: &Centroid) -> bool {
        let (width, height) = self.dimensions();
        let r = i64::from(self.config.stamp_radius.max(0));
        let (x, y) = (i64::from(c.x), i64::from(c.y));
        x + r >= 0 && y + r >= 0 && x - r < i64::from(width) && y - r < i64::from(height)
    }

    /// Scaled, blurred single-channel view used for display
    pub fn intensity(&self) -> GrayImage {
        let scale = self.config.display_scale;
        let (width, height) = self.dimensions();
        let scaled = GrayImage::from_fn(width, height, |x, y| {
            let v = self.accumulator.get_pixel(x, y).0[0] * scale;
            Luma([v.round().clamp(0.0, 255.0) as u8])
        });
        gaussian_blur_f32(&scaled, blur_sigma(self.config.blur_kernel))
    }

    /// Colour-mapped heatmap image
    pub fn render(&self) -> RgbImage {
        let intensity = self.intensity();
        RgbImage::from_fn(intensity.width(), intensity.height(), |x, y| {
            jet(intensity.get_pixel(x, y).0[0])
        })
    }

    /// Blend the colour-mapped heatmap over an annotated frame in place
    pub fn overlay(&self, frame: &mut RgbImage) -> Result<()> {
        ensure!(
            frame.dimensions() == self.dimensions(),
            "frame is {:?} but heatmap is {:?}",
            frame.dimensions(),
            self.dimensions()
        );

        let heat = self.render();
        blend(frame, &heat, self.config.overlay_alpha);
        Ok(())
    }

    pub fn reset(&mut self) {
        for pixel in self.accumulator.pixels_mut() {
            pixel.0[0] = 0.0;
        }
    }
}

/// Gaussian sigma matching a kernel size when no sigma is given explicitly
pub fn blur_sigma(kernel: u32) -> f32 {
    let k = kernel.max(1) as f32;
    (0.3 * ((k - 1.0) * 0.5 - 1.0) + 0.8).max(0.1)
}

/// JET colour map: dark blue at 0 through cyan, yellow, to dark red at 255
pub fn jet(value: u8) -> Rgb<u8> {
    let t = f32::from(value) / 255.0;
    let channel = |offset: f32| {
        let v = (1.5 - (4.0 * t - offset).abs()).clamp(0.0, 1.0);
        (v * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// `base = base * (1 - alpha) + top * alpha`, per channel
pub fn blend(base: &mut RgbImage, top: &RgbImage, alpha: f32) {
    let alpha = alpha.clamp(0.0, 1.0);
    for (b, t) in base.pixels_mut().zip(top.pixels()) {
        for c in 0..3 {
            let mixed = f32::from(b.0[c]) * (1.0 - alpha) + f32::from(t.0[c]) * alpha;
            b.0[c] = mixed.round().clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heatmap(width: u32, height: u32) -> HeatmapAccumulator {
        HeatmapAccumulator::new(width, height, HeatmapConfig::default())
    }

    #[test]
    fn test_stamp_paints_disk() {
        let mut heat = heatmap(200, 200);
        heat.stamp(&[Centroid::new(100, 100)]);

        assert_eq!(heat.value_at(100, 100), Some(255.0));
        assert_eq!(heat.value_at(115, 100), Some(255.0));
        assert_eq!(heat.value_at(130, 100), Some(0.0));
        assert_eq!(heat.value_at(0, 0), Some(0.0));
    }

    #[test]
    fn test_trace_persists_without_decay() {
        let mut heat = heatmap(200, 200);
        heat.stamp(&[Centroid::new(50, 50)]);
        for _ in 0..10 {
            heat.stamp(&[]);
        }
        assert_eq!(heat.value_at(50, 50), Some(255.0));
    }

    #[test]
    fn test_decay_fades_old_traces() {
        let config = HeatmapConfig {
            decay: 0.5,
            ..HeatmapConfig::default()
        };
        let mut heat = HeatmapAccumulator::new(100, 100, config);
        heat.stamp(&[Centroid::new(50, 50)]);
        heat.stamp(&[]);
        assert_eq!(heat.value_at(50, 50), Some(127.5));
    }

    #[test]
    fn test_stamp_near_edge_is_clipped() {
        let mut heat = heatmap(50, 50);
        heat.stamp(&[Centroid::new(0, 0), Centroid::new(49, 49), Centroid::new(-10, 60)]);
        assert_eq!(heat.value_at(0, 0), Some(255.0));
        assert_eq!(heat.value_at(49, 49), Some(255.0));
        assert_eq!(heat.value_at(50, 50), None);
    }

    #[test]
    fn test_stamp_far_outside_frame_is_skipped() {
        let mut heat = heatmap(100, 100);
        heat.stamp(&[
            Centroid::new(i32::MAX - 5, 10),
            Centroid::new(i32::MIN, i32::MIN),
            Centroid::new(10, i32::MAX),
            Centroid::new(50, 50),
        ]);
        assert_eq!(heat.value_at(50, 50), Some(255.0));
        assert_eq!(heat.value_at(99, 10), Some(0.0));
    }

    #[test]
    fn test_reset_clears_accumulator() {
        let mut heat = heatmap(100, 100);
        heat.stamp(&[Centroid::new(40, 40)]);
        heat.reset();
        assert_eq!(heat.value_at(40, 40), Some(0.0));
    }

    #[test]
    fn test_render_is_blurred_copy() {
        let mut heat = heatmap(120, 120);
        heat.stamp(&[Centroid::new(60, 60)]);
        let intensity = heat.intensity();

        // Centre is roughly 255 * 0.4, the blurred rim is dimmer but non-zero
        let centre = intensity.get_pixel(60, 60).0[0];
        assert!((95..=102).contains(&centre), "centre {centre}");
        assert!(intensity.get_pixel(82, 60).0[0] > 0);
        assert_eq!(intensity.get_pixel(0, 0).0[0], 0);

        // Rendering must not touch the accumulator
        assert_eq!(heat.value_at(60, 60), Some(255.0));
    }

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet(0), Rgb([0, 0, 128]));
        assert_eq!(jet(255), Rgb([128, 0, 0]));
    }

    #[test]
    fn test_overlay_blends_seventy_thirty() {
        let heat = heatmap(4, 4);
        let mut frame = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        heat.overlay(&mut frame).unwrap();
        assert_eq!(*frame.get_pixel(0, 0), Rgb([70, 70, 108]));
    }

    #[test]
    fn test_overlay_rejects_size_mismatch() {
        let heat = heatmap(4, 4);
        let mut frame = RgbImage::new(8, 8);
        assert!(heat.overlay(&mut frame).is_err());
    }

    #[test]
    fn test_blur_sigma_for_default_kernel() {
        assert!((blur_sigma(25) - 4.1).abs() < 1e-5);
    }
}
