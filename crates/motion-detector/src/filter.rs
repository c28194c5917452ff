//! Contour extraction and rejection heuristics applied inside one area.

use common::RoiSettings;
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::geometry::convex_hull;
use imageproc::point::Point;

/// A contour that passed every filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub area: f64,
    pub solidity: f32,
}

impl Blob {
    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

/// Outer contours of `binary` that satisfy the area, aspect-ratio and
/// solidity bounds. Inner (hole) borders are ignored.
pub fn surviving_blobs(binary: &GrayImage, settings: &RoiSettings, min_solidity: f32) -> Vec<Blob> {
    let min_area = settings.effective_min_area() as f64;

    find_contours::<i32>(binary)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .filter_map(|c| measure(&c.points))
        .filter(|b| b.area >= min_area)
        .filter(|b| {
            let aspect = b.aspect_ratio();
            aspect >= settings.min_aspect_ratio && aspect <= settings.max_aspect_ratio
        })
        .filter(|b| b.solidity >= min_solidity)
        .collect()
}

fn measure(points: &[Point<i32>]) -> Option<Blob> {
    if points.len() < 3 {
        return None;
    }

    let area = polygon_area(points);
    let hull = convex_hull(points);
    let hull_area = polygon_area(&hull);
    if area <= 0.0 || hull_area <= 0.0 {
        return None;
    }

    let min_x = points.iter().map(|p| p.x).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_y = points.iter().map(|p| p.y).max()?;

    Some(Blob {
        x: min_x,
        y: min_y,
        width: (max_x - min_x + 1) as u32,
        height: (max_y - min_y + 1) as u32,
        area,
        solidity: (area / hull_area).min(1.0) as f32,
    })
}

/// Shoelace area of a closed polygon given by its vertices.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
        .sum();
    (twice as f64 / 2.0).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn fill(img: &mut GrayImage, x: u32, y: u32, w: u32, h: u32) {
        for px in x..x + w {
            for py in y..y + h {
                img.put_pixel(px, py, Luma([255]));
            }
        }
    }

    fn permissive() -> RoiSettings {
        RoiSettings {
            enabled: true,
            sensitivity: 1.0,
            min_area: 50.0,
            min_aspect_ratio: 0.2,
            max_aspect_ratio: 5.0,
        }
    }

    #[test]
    fn test_polygon_area_of_square() {
        let square = [
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert_eq!(polygon_area(&square), 100.0);
    }

    #[test]
    fn test_solid_rectangle_survives() {
        let mut img = GrayImage::new(100, 100);
        fill(&mut img, 20, 20, 30, 20);
        let blobs = surviving_blobs(&img, &permissive(), 0.5);
        assert_eq!(blobs.len(), 1);
        let blob = &blobs[0];
        assert_eq!((blob.x, blob.y, blob.width, blob.height), (20, 20, 30, 20));
        assert!(blob.solidity > 0.95);
    }

    #[test]
    fn test_small_blob_rejected_by_area() {
        let mut img = GrayImage::new(100, 100);
        fill(&mut img, 10, 10, 5, 5);
        assert!(surviving_blobs(&img, &permissive(), 0.5).is_empty());
    }

    #[test]
    fn test_sensitivity_lowers_area_threshold() {
        let mut img = GrayImage::new(100, 100);
        fill(&mut img, 10, 10, 8, 8);
        let mut settings = permissive();
        settings.min_area = 100.0;
        assert!(surviving_blobs(&img, &settings, 0.5).is_empty());
        settings.sensitivity = 4.0;
        assert_eq!(surviving_blobs(&img, &settings, 0.5).len(), 1);
    }

    #[test]
    fn test_thin_strip_rejected_by_aspect_ratio() {
        let mut img = GrayImage::new(200, 100);
        fill(&mut img, 10, 40, 150, 4);
        assert!(surviving_blobs(&img, &permissive(), 0.5).is_empty());
    }

    #[test]
    fn test_comb_rejected_by_solidity() {
        // Passes area and aspect ratio, but most of its hull is empty.
        let mut img = GrayImage::new(120, 120);
        fill(&mut img, 10, 70, 52, 6);
        for tooth in 0..4 {
            fill(&mut img, 10 + tooth * 16, 30, 4, 40);
        }
        let blobs = surviving_blobs(&img, &permissive(), 0.5);
        assert!(blobs.is_empty(), "comb should be rejected: {:?}", blobs);

        // The same shape passes once solidity is not enforced.
        assert_eq!(surviving_blobs(&img, &permissive(), 0.0).len(), 1);
    }
}
