//! Star centroids: sub-pixel detections in image coordinates.
//!
//! Centroids are the output of the extractor and the input of the matcher.

use serde::{Deserialize, Serialize};

use crate::Vector3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    /// Row coordinate in pixels, measured from the top edge of the image.
    /// The centre of the top-left pixel is at row 0.5; +row points down.
    pub row: f32,
    /// Column coordinate in pixels, measured from the left edge of the image.
    /// The centre of the top-left pixel is at column 0.5; +col points right.
    pub col: f32,
    /// Optional brightness used for ordering (brighter = higher).
    /// When absent the position in the input list is taken as brightness order.
    #[serde(default)]
    pub weight: Option<f32>,
}

impl Centroid {
    pub fn new(row: f32, col: f32) -> Self {
        Self {
            row,
            col,
            weight: None,
        }
    }

    pub fn with_weight(row: f32, col: f32, weight: f32) -> Self {
        Self {
            row,
            col,
            weight: Some(weight),
        }
    }

    /// Offset from the geometric image centre, `(x, y)` = (columns, rows).
    pub fn offset_from_center(&self, image_size: (u32, u32)) -> (f32, f32) {
        let (height, width) = image_size;
        (self.col - width as f32 / 2.0, self.row - height as f32 / 2.0)
    }

    /// Unit vector in the camera frame for a pinhole camera with the given focal
    /// length (pixels). +Z is the boresight, +X follows columns, +Y follows rows.
    pub fn uvec(&self, image_size: (u32, u32), focal_length_px: f32) -> Vector3 {
        let (x, y) = self.offset_from_center(image_size);
        Vector3::new(x / focal_length_px, y / focal_length_px, 1.0).normalize()
    }
}

impl From<(f32, f32)> for Centroid {
    fn from((row, col): (f32, f32)) -> Self {
        Self::new(row, col)
    }
}

/// Focal length in pixels for a horizontal field of view across `width` pixels.
pub fn focal_length_px(fov_rad: f32, width: u32) -> f32 {
    (width as f32 / 2.0) / (fov_rad / 2.0).tan()
}

/// Horizontal field of view for a focal length across `width` pixels.
pub fn fov_from_focal_length(focal_length_px: f32, width: u32) -> f32 {
    2.0 * ((width as f32 / 2.0) / focal_length_px).atan()
}

/// Indices of `centroids` in brightness order.
///
/// Weighted centroids come first, brightest first; unweighted centroids follow
/// in input order. Equal weights are ordered by pixel position so the result
/// does not depend on how the caller listed them.
pub(crate) fn brightness_order(centroids: &[Centroid]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..centroids.len()).collect();
    order.sort_by(|&a, &b| {
        let (ca, cb) = (&centroids[a], &centroids[b]);
        match (ca.weight, cb.weight) {
            (Some(wa), Some(wb)) => wb
                .total_cmp(&wa)
                .then_with(|| ca.row.total_cmp(&cb.row))
                .then_with(|| ca.col.total_cmp(&cb.col)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.cmp(&b),
        }
    });
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_pixel_points_along_boresight() {
        let c = Centroid::new(512.0, 512.0);
        let v = c.uvec((1024, 1024), 1000.0);
        assert!((v.z - 1.0).abs() < 1e-6);
    }

    #[test]
    fn focal_length_roundtrip() {
        let fov = 20.0_f32.to_radians();
        let f = focal_length_px(fov, 2048);
        assert!((fov_from_focal_length(f, 2048) - fov).abs() < 1e-6);
    }

    #[test]
    fn brightness_order_puts_unweighted_last_in_input_order() {
        let centroids = vec![
            Centroid::new(1.0, 1.0),
            Centroid::with_weight(2.0, 2.0, 5.0),
            Centroid::new(3.0, 3.0),
            Centroid::with_weight(4.0, 4.0, 9.0),
        ];
        assert_eq!(brightness_order(&centroids), vec![3, 1, 0, 2]);
    }

    #[test]
    fn equal_weights_are_ordered_by_position() {
        let a = Centroid::with_weight(40.0, 7.0, 5.0);
        let b = Centroid::with_weight(12.0, 90.0, 5.0);
        let c = Centroid::with_weight(12.0, 30.0, 5.0);
        let first = [a, b, c];
        let second = [b, c, a];
        let pick = |list: &[Centroid]| -> Vec<Centroid> {
            brightness_order(list).into_iter().map(|i| list[i]).collect()
        };
        assert_eq!(pick(&first), vec![c, b, a]);
        assert_eq!(pick(&first), pick(&second));
    }
}
