//! Debug drawing of areas and surviving contours onto output frames.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_polygon_mut, draw_hollow_rect_mut};
use imageproc::point::Point;
use imageproc::rect::Rect;

use crate::detector::MotionDetector;

const BLOB_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Draw every area outline in its configured color, doubled for areas that
/// are currently active, plus the bounding box of each contour that kept an
/// area active on the last tick.
///
/// `detection_size` is the size of the frame the detector analyzed; contour
/// boxes are scaled from it to `frame`.
pub fn render_overlay(frame: &mut RgbImage, detector: &MotionDetector, detection_size: (u32, u32)) {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    for roi in detector.rois() {
        let mut points: Vec<Point<f32>> = roi
            .points
            .iter()
            .map(|p| {
                let (x, y) = p.to_pixel(width, height);
                Point::new(x as f32, y as f32)
            })
            .collect();
        points.dedup();
        while points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        if points.len() < 3 {
            continue;
        }

        let color = Rgb(roi.color.0);
        draw_hollow_polygon_mut(frame, &points, color);
        if detector.is_active(&roi.id) {
            let inset: Vec<Point<f32>> = points.iter().map(|p| Point::new(p.x + 1.0, p.y + 1.0)).collect();
            draw_hollow_polygon_mut(frame, &inset, color);
        }
    }

    let (dw, dh) = detection_size;
    if dw == 0 || dh == 0 {
        return;
    }
    let sx = width as f32 / dw as f32;
    let sy = height as f32 / dh as f32;
    for blobs in detector.last_blobs().values() {
        for blob in blobs {
            let rect = Rect::at((blob.x as f32 * sx) as i32, (blob.y as f32 * sy) as i32).of_size(
                ((blob.width as f32 * sx) as u32).max(1),
                ((blob.height as f32 * sy) as u32).max(1),
            );
            draw_hollow_rect_mut(frame, rect, BLOB_COLOR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use common::{Point as RoiPoint, Roi, RoiColor, RoiSettings};

    #[test]
    fn test_overlay_draws_roi_outline() {
        let roi = Roi {
            id: "a".to_string(),
            name: "A".to_string(),
            points: vec![
                RoiPoint::new(0.0, 0.0),
                RoiPoint::new(0.5, 0.0),
                RoiPoint::new(0.5, 0.5),
                RoiPoint::new(0.0, 0.5),
            ],
            color: RoiColor([0, 0, 255]),
            settings: RoiSettings::default(),
        };
        let detector = MotionDetector::new(DetectorConfig::default(), vec![roi]);
        let mut frame = RgbImage::new(101, 101);
        render_overlay(&mut frame, &detector, (101, 101));

        assert_eq!(frame.get_pixel(25, 0), &Rgb([0, 0, 255]));
        assert_eq!(frame.get_pixel(50, 25), &Rgb([0, 0, 255]));
        assert_eq!(frame.get_pixel(80, 80), &Rgb([0, 0, 0]));
    }
}
