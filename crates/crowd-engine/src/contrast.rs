/// Global luminance equalisation applied to frames before detection.
///
/// Histogram equalisation runs on the luma channel only, and each pixel's
/// RGB is scaled by the ratio of its new to old luma so hues are kept.
use image::{imageops, RgbImage};
use imageproc::contrast::equalize_histogram;

pub fn equalize_contrast(frame: &RgbImage) -> RgbImage {
    let luma = imageops::grayscale(frame);
    let equalized = equalize_histogram(&luma);

    let mut out = frame.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let before = f32::from(luma.get_pixel(x, y).0[0]);
        let after = f32::from(equalized.get_pixel(x, y).0[0]);
        if before == 0.0 {
            pixel.0 = [after as u8; 3];
            continue;
        }
        let gain = after / before;
        for c in pixel.0.iter_mut() {
            *c = (f32::from(*c) * gain).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}
