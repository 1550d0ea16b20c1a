use geo::Coord;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use nalgebra::{SMatrix, SVector};
use tracing::instrument;

use crate::{OcrError, Result};

const IDENTITY: [f32; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// Row-major homography onto a `width` x `height` rectangle, or `None` for
/// degenerate points.
pub fn perspective_transform(src: &[Coord<f32>; 4], width: f32, height: f32) -> Option<[f32; 9]> {
    let twice_area = (0..4)
        .map(|i| {
            let (p, q) = (src[i], src[(i + 1) % 4]);
            p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64
        })
        .sum::<f64>();
    if twice_area.abs() < 1e-6 || width <= 0.0 || height <= 0.0 {
        return None;
    }

    let dst = [(0.0, 0.0), (width, 0.0), (width, height), (0.0, height)];

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for (i, (point, (u, v))) in src.iter().zip(dst).enumerate() {
        let (x, y) = (point.x as f64, point.y as f64);
        let (u, v) = (u as f64, v as f64);

        let row = 2 * i;
        a[(row, 0)] = x;
        a[(row, 1)] = y;
        a[(row, 2)] = 1.0;
        a[(row, 6)] = -x * u;
        a[(row, 7)] = -y * u;
        b[row] = u;

        a[(row + 1, 3)] = x;
        a[(row + 1, 4)] = y;
        a[(row + 1, 5)] = 1.0;
        a[(row + 1, 6)] = -x * v;
        a[(row + 1, 7)] = -y * v;
        b[row + 1] = v;
    }

    let h = a.lu().solve(&b)?;
    if h.iter().any(|value| !value.is_finite()) {
        return None;
    }
    Some([
        h[0] as f32,
        h[1] as f32,
        h[2] as f32,
        h[3] as f32,
        h[4] as f32,
        h[5] as f32,
        h[6] as f32,
        h[7] as f32,
        1.0,
    ])
}

fn is_identity(matrix: &[f32; 9]) -> bool {
    matrix
        .iter()
        .zip(IDENTITY)
        .all(|(value, expected)| (value - expected).abs() < 1e-5)
}

fn distance(a: Coord<f32>, b: Coord<f32>) -> f32 {
    (b.x - a.x).hypot(b.y - a.y)
}

/// Parts at least `tall_ratio` times taller than wide are turned a quarter.
#[instrument(level = "trace", skip(image))]
pub fn get_rotate_crop_image(
    image: &DynamicImage,
    points: &[Coord<i32>; 4],
    tall_ratio: Option<f32>,
) -> Result<DynamicImage> {
    let left = points.iter().map(|p| p.x).min().unwrap_or_default();
    let right = points.iter().map(|p| p.x).max().unwrap_or_default();
    let top = points.iter().map(|p| p.y).min().unwrap_or_default();
    let bottom = points.iter().map(|p| p.y).max().unwrap_or_default();

    let (image_width, image_height) = image.dimensions();
    if left < 0
        || top < 0
        || right <= left
        || bottom <= top
        || right as i64 > image_width as i64
        || bottom as i64 > image_height as i64
    {
        return Err(OcrError::Crop {
            x: left as i64,
            y: top as i64,
            width: right as i64 - left as i64,
            height: bottom as i64 - top as i64,
            image_width,
            image_height,
        });
    }

    let crop = image
        .crop_imm(
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        )
        .to_rgb8();

    let local = points.map(|p| Coord {
        x: (p.x - left) as f32,
        y: (p.y - top) as f32,
    });
    let width = distance(local[0], local[1]) as u32;
    let height = distance(local[0], local[3]) as u32;
    if width == 0 || height == 0 {
        return Err(OcrError::InvalidInput(format!(
            "text box {points:?} has a zero length side"
        )));
    }

    let matrix = perspective_transform(&local, width as f32, height as f32).ok_or_else(|| {
        OcrError::InvalidInput(format!("text box {points:?} has no perspective transform"))
    })?;

    let part = if is_identity(&matrix) && crop.dimensions() == (width, height) {
        crop
    } else {
        let projection = Projection::from_matrix(matrix).ok_or_else(|| {
            OcrError::InvalidInput(format!("text box {points:?} is not invertible"))
        })?;
        let mut out = RgbImage::new(width, height);
        warp_into(
            &crop,
            &projection,
            Interpolation::Bilinear,
            Rgb([255, 255, 255]),
            &mut out,
        );
        out
    };
    let part = DynamicImage::ImageRgb8(part);

    match tall_ratio {
        Some(ratio) if part.height() as f32 >= part.width() as f32 * ratio => {
            log::trace!("Turning {}x{} part image upright", part.width(), part.height());
            Ok(part.rotate90())
        }
        _ => Ok(part),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 3 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
        }))
    }

    fn c(x: i32, y: i32) -> Coord<i32> {
        Coord { x, y }
    }

    fn apply(matrix: &[f32; 9], point: Coord<f32>) -> (f32, f32) {
        let w = matrix[6] * point.x + matrix[7] * point.y + matrix[8];
        (
            (matrix[0] * point.x + matrix[1] * point.y + matrix[2]) / w,
            (matrix[3] * point.x + matrix[4] * point.y + matrix[5]) / w,
        )
    }

    #[test]
    fn transform_maps_corners_onto_rectangle() {
        let src = [
            Coord { x: 3.0, y: 5.0 },
            Coord { x: 40.0, y: 9.0 },
            Coord { x: 38.0, y: 30.0 },
            Coord { x: 1.0, y: 25.0 },
        ];
        let matrix = perspective_transform(&src, 37.0, 20.0).unwrap();
        let expected = [(0.0, 0.0), (37.0, 0.0), (37.0, 20.0), (0.0, 20.0)];
        for (point, (u, v)) in src.iter().zip(expected) {
            let (x, y) = apply(&matrix, *point);
            assert!((x - u).abs() < 1e-3 && (y - v).abs() < 1e-3, "{point:?} -> ({x}, {y})");
        }
    }

    #[test]
    fn collapsed_quad_has_no_transform() {
        let src = [Coord { x: 2.0, y: 2.0 }; 4];
        assert!(perspective_transform(&src, 10.0, 10.0).is_none());
    }

    #[test]
    fn axis_aligned_box_is_a_plain_crop() {
        let image = gradient(60, 40);
        let points = [c(10, 5), c(40, 5), c(40, 25), c(10, 25)];
        let part = get_rotate_crop_image(&image, &points, Some(1.5)).unwrap();
        assert_eq!(part.dimensions(), (30, 20));

        let source = image.to_rgb8();
        let part = part.to_rgb8();
        for (x, y) in [(0, 0), (29, 0), (15, 10), (0, 19), (29, 19)] {
            assert_eq!(part.get_pixel(x, y), source.get_pixel(x + 10, y + 5));
        }
    }

    #[test]
    fn skewed_box_takes_edge_lengths() {
        let image = gradient(80, 60);
        let points = [c(10, 10), c(50, 13), c(48, 33), c(8, 30)];
        let part = get_rotate_crop_image(&image, &points, Some(1.5)).unwrap();
        let width = (40.0f32).hypot(3.0) as u32;
        let height = (2.0f32).hypot(20.0) as u32;
        assert_eq!(part.dimensions(), (width, height));
    }

    #[test]
    fn tall_parts_are_turned() {
        let image = gradient(60, 60);
        let points = [c(5, 5), c(15, 5), c(15, 45), c(5, 45)];
        let turned = get_rotate_crop_image(&image, &points, Some(1.5)).unwrap();
        assert_eq!(turned.dimensions(), (40, 10));

        let kept = get_rotate_crop_image(&image, &points, None).unwrap();
        assert_eq!(kept.dimensions(), (10, 40));
    }

    #[test]
    fn out_of_bounds_box_is_a_crop_error() {
        let image = gradient(30, 30);
        let points = [c(10, 10), c(50, 10), c(50, 20), c(10, 20)];
        assert!(matches!(
            get_rotate_crop_image(&image, &points, None),
            Err(OcrError::Crop { .. })
        ));
    }
}
