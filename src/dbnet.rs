use std::path::Path;

use geo::Coord;
use image::{imageops::FilterType, DynamicImage, GrayImage, Luma};
use imageproc::{
    distance_transform::Norm, drawing::draw_polygon_mut, morphology::dilate_mut, point::Point,
};
use ndarray::{ArrayView2, Axis};
use ort::{inputs, Session};
use tracing::instrument;

use crate::{
    contour::find_contours,
    geometry::{mini_box, unclip},
    util::{create_session, subtract_mean_normalize, to_luma_image, ScaleParam},
    OcrError, Result, TextBox,
};

const MEAN_VALUES: [f32; 3] = [0.485, 0.456, 0.406];
const NORM_VALUES: [f32; 3] = [1.0 / 0.229, 1.0 / 0.224, 1.0 / 0.225];

/// Boxes with a shorter side below this many pixels are noise.
const MIN_SIDE_THRESHOLD: f32 = 3.0;
const MAX_CANDIDATES: usize = 1000;
const DILATE_RADIUS: u8 = 2;

/// Text detector producing a per-pixel text probability map.
pub struct DbNet {
    session: Session,
    input_name: String,
}

impl DbNet {
    #[instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
    pub fn init(path: impl AsRef<Path>, num_threads: usize) -> Result<Self> {
        let (session, input_name) = create_session(path, num_threads)?;
        Ok(Self {
            session,
            input_name,
        })
    }

    /// Runs the detector on `image`, resized to the scale's target size, and
    /// assembles text boxes in `image` coordinates.
    #[instrument(skip(self, image), level = "debug")]
    pub fn get_text_boxes(
        &self,
        image: &DynamicImage,
        scale: ScaleParam,
        box_score_thresh: f32,
        box_thresh: f32,
        unclip_ratio: f32,
    ) -> Result<Vec<TextBox>> {
        let resized = image.resize_exact(scale.dst_width, scale.dst_height, FilterType::CatmullRom);
        let input_values =
            subtract_mean_normalize(&resized, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => input_values]?)?;
        let pred = outputs
            .first_key_value()
            .ok_or_else(|| OcrError::UnexpectedOutput("detector returned no outputs".to_string()))?
            .1
            .try_extract_tensor::<f32>()?;

        let &[_, _, height, width] = pred.shape() else {
            return Err(OcrError::UnexpectedOutput(format!(
                "detector output shape {:?}, expected [1, 1, h, w]",
                pred.shape()
            )));
        };
        let pred = pred
            .to_shape((height, width))
            .map_err(|err| OcrError::UnexpectedOutput(err.to_string()))?;

        Ok(find_text_boxes(
            pred.view(),
            scale,
            box_score_thresh,
            box_thresh,
            unclip_ratio,
        ))
    }
}

/// Mean probability under the filled `contour`, read from the 8-bit
/// probability image rather than the binarized mask.
fn box_score(contour: &[Coord<i32>], pred: &GrayImage) -> f32 {
    let (Some(x_min), Some(x_max), Some(y_min), Some(y_max)) = (
        contour.iter().map(|p| p.x).min(),
        contour.iter().map(|p| p.x).max(),
        contour.iter().map(|p| p.y).min(),
        contour.iter().map(|p| p.y).max(),
    ) else {
        return 0.0;
    };
    let x_min = x_min.clamp(0, pred.width() as i32 - 1);
    let x_max = x_max.clamp(0, pred.width() as i32 - 1);
    let y_min = y_min.clamp(0, pred.height() as i32 - 1);
    let y_max = y_max.clamp(0, pred.height() as i32 - 1);

    let mut polygon = contour
        .iter()
        .map(|p| Point::new(p.x - x_min, p.y - y_min))
        .collect::<Vec<_>>();
    if polygon.len() > 1 && polygon.first() == polygon.last() {
        polygon.pop();
    }
    if polygon.len() < 3 {
        return 0.0;
    }

    let mut mask = GrayImage::new((x_max - x_min + 1) as u32, (y_max - y_min + 1) as u32);
    draw_polygon_mut(&mut mask, &polygon, Luma([u8::MAX]));

    let (sum, count) = mask
        .enumerate_pixels()
        .filter(|(_, _, value)| value.0[0] == u8::MAX)
        .map(|(x, y, _)| pred.get_pixel(x + x_min as u32, y + y_min as u32).0[0] as u64)
        .fold((0u64, 0u64), |(sum, count), value| (sum + value, count + 1));

    if count == 0 {
        0.0
    } else {
        sum as f32 / count as f32 / u8::MAX as f32
    }
}

fn to_source_space(points: [Coord<f32>; 4], scale: ScaleParam) -> [Coord<i32>; 4] {
    points.map(|point| Coord {
        x: ((point.x / scale.scale_x) as i32).clamp(0, scale.src_width as i32),
        y: ((point.y / scale.scale_y) as i32).clamp(0, scale.src_height as i32),
    })
}

/// Turns a detector probability map into text boxes.
///
/// The map is thresholded at `box_thresh` and dilated, then each connected
/// component goes through: minimum-area box, size filter, region score
/// against the unthresholded map, unclip, second minimum-area box and size
/// filter, and finally rescaling into source coordinates.
///
/// Boxes are returned in reverse discovery order.
#[instrument(skip(pred), level = "debug")]
pub fn find_text_boxes(
    pred: ArrayView2<f32>,
    scale: ScaleParam,
    box_score_thresh: f32,
    box_thresh: f32,
    unclip_ratio: f32,
) -> Vec<TextBox> {
    let height = pred.len_of(Axis(0));
    let width = pred.len_of(Axis(1));
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let mut mask = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        if pred[[y as usize, x as usize]] > box_thresh {
            Luma([u8::MAX])
        } else {
            Luma([0])
        }
    });
    dilate_mut(&mut mask, Norm::LInf, DILATE_RADIUS);

    let pred_image = to_luma_image(pred);

    let mut boxes = find_contours(&mask)
        .into_iter()
        .take(MAX_CANDIDATES)
        .filter(|contour| contour.len() > 2)
        .filter_map(|contour| {
            let mini = mini_box(&contour).ok()?;
            Some((contour, mini))
        })
        .filter(|(_, mini)| mini.min_side >= MIN_SIDE_THRESHOLD)
        .map(|(contour, mini)| {
            let score = box_score(&contour, &pred_image);
            (mini, score)
        })
        .filter(|(_, score)| *score >= box_score_thresh)
        .filter_map(|(mini, score)| Some((unclip(&mini.points, unclip_ratio)?, score)))
        .filter_map(|(clipped, score)| Some((mini_box(&clipped).ok()?, score)))
        .filter(|(clipped, _)| clipped.min_side >= MIN_SIDE_THRESHOLD + 2.0)
        .map(|(clipped, score)| TextBox {
            points: to_source_space(clipped.points, scale),
            score,
        })
        .collect::<Vec<_>>();
    boxes.reverse();

    log::debug!("Found {} text boxes", boxes.len());
    boxes
}
