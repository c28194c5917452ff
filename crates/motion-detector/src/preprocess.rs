use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

/// Downsample to at most `max_width` pixels wide, preserving aspect ratio.
/// Frames already narrower are returned as-is.
pub fn downscale(frame: &RgbImage, max_width: u32) -> RgbImage {
    let (width, height) = frame.dimensions();
    if max_width == 0 || width <= max_width || height == 0 {
        return frame.clone();
    }
    let new_height = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;
    imageops::resize(frame, max_width, new_height, FilterType::Triangle)
}

/// Luminance plane used by the detector.
pub fn to_luma(frame: &RgbImage) -> GrayImage {
    imageops::grayscale(frame)
}

/// Mean pixel value of a grayscale image.
pub fn mean_luma(frame: &GrayImage) -> f32 {
    let pixels = frame.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    let sum: u64 = pixels.iter().map(|&p| p as u64).sum();
    sum as f32 / pixels.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    #[test]
    fn test_downscale_preserves_aspect() {
        let frame = RgbImage::from_pixel(1280, 720, Rgb([10, 20, 30]));
        let small = downscale(&frame, 320);
        assert_eq!(small.dimensions(), (320, 180));
    }

    #[test]
    fn test_downscale_leaves_small_frames() {
        let frame = RgbImage::new(160, 120);
        assert_eq!(downscale(&frame, 320).dimensions(), (160, 120));
    }

    #[test]
    fn test_mean_luma() {
        let mut img = GrayImage::from_pixel(10, 10, Luma([0]));
        for x in 0..10 {
            for y in 0..5 {
                img.put_pixel(x, y, Luma([200]));
            }
        }
        assert_eq!(mean_luma(&img), 100.0);
        assert_eq!(mean_luma(&GrayImage::new(0, 0)), 0.0);
    }
}
