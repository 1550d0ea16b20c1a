use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use angle_net::AngleNet;
use crnn_net::CrnnNet;
use crop::get_rotate_crop_image;
use dbnet::DbNet;
use geo::Coord;
use image::{DynamicImage, GenericImageView};
use rayon::prelude::*;
use tracing::instrument;
use util::{make_padding, ScaleParam};

pub mod angle_net;
pub mod contour;
pub mod crnn_net;
pub mod crop;
pub mod dbnet;
mod error;
pub mod geometry;
mod result;
pub mod util;

pub use error::*;
pub use result::*;

pub use ort as runtime;

pub struct RapidOcrBuilder {
    threads: usize,
    det_path: Option<PathBuf>,
    cls_path: Option<PathBuf>,
    rec_paths: Option<(PathBuf, PathBuf)>,
    max_side_len: u32,
}

impl RapidOcrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread hint handed to each inference session.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn det_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.det_path = Some(path.into());
        self
    }

    /// Without an orientation model every region is assumed upright.
    pub fn cls_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.cls_path = Some(path.into());
        self
    }

    pub fn rec_model(
        mut self,
        model_path: impl Into<PathBuf>,
        keys_path: impl Into<PathBuf>,
    ) -> Self {
        self.rec_paths = Some((model_path.into(), keys_path.into()));
        self
    }

    /// Longest detector input side used when a call doesn't set its own.
    /// Zero keeps the image's own size.
    pub fn max_side_len(mut self, max_side_len: u32) -> Self {
        self.max_side_len = max_side_len;
        self
    }

    #[instrument(skip(self), level = "debug")]
    fn init_models(&mut self) -> Result<(DbNet, Option<AngleNet>, CrnnNet)> {
        let det_path = self
            .det_path
            .take()
            .unwrap_or_else(|| "models/ch_PP-OCRv4_det_infer/ch_PP-OCRv4_det_infer.onnx".into());
        let cls_path = self.cls_path.take();
        let (rec_path, keys_path) = self.rec_paths.take().unwrap_or_else(|| {
            (
                "models/ch_PP-OCRv4_rec_infer/ch_PP-OCRv4_rec_infer.onnx".into(),
                "models/ppocr_keys_v1.txt".into(),
            )
        });
        Ok((
            DbNet::init(det_path, self.threads)?,
            cls_path
                .map(|cls_path| AngleNet::init(cls_path, self.threads))
                .transpose()?,
            CrnnNet::init(rec_path, keys_path, self.threads)?,
        ))
    }

    #[instrument(skip(self))]
    pub fn build(mut self) -> Result<RapidOcr> {
        let (det_model, cls_model, rec_model) = self.init_models()?;
        Ok(RapidOcr {
            det_model,
            cls_model,
            rec_model,
            max_side_len: self.max_side_len,
        })
    }
}

impl Default for RapidOcrBuilder {
    fn default() -> Self {
        Self {
            threads: 4,
            det_path: None,
            cls_path: None,
            rec_paths: None,
            max_side_len: 1024,
        }
    }
}

/// Detection, orientation and recognition models loaded together.
pub struct RapidOcr {
    det_model: DbNet,
    cls_model: Option<AngleNet>,
    rec_model: CrnnNet,
    max_side_len: u32,
}

impl RapidOcr {
    /// Opens the image at `path` and runs [`RapidOcr::detect`] on it.
    pub fn detect_file(
        &self,
        path: impl AsRef<Path>,
        options: DetectionOptions,
    ) -> Result<OcrResult> {
        let image = image::open(path)?;
        self.detect(&image, options)
    }

    /// Finds, orients and reads every text region in `image`.
    ///
    /// A region whose crop fails is dropped. A region whose orientation or
    /// recognition fails keeps a default record, so one bad region never
    /// fails the whole image.
    #[instrument(skip(self, image))]
    pub fn detect(&self, image: &DynamicImage, options: DetectionOptions) -> Result<OcrResult> {
        let start = Instant::now();
        let DetectionOptions {
            padding,
            max_side_len,
            box_score_threshold,
            box_threshold,
            unclip_ratio,
            do_angle,
            tall_crop_ratio,
            ..
        } = options;

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(OcrError::InvalidInput(format!(
                "image of {width}x{height} has no pixels"
            )));
        }

        let max_side_len = if max_side_len != 0 {
            max_side_len
        } else {
            self.max_side_len
        };
        let longest_side = width.max(height);
        let resize = if max_side_len == 0 || max_side_len > longest_side {
            longest_side
        } else {
            max_side_len
        };
        let resize = padding
            .checked_mul(2)
            .and_then(|border| resize.checked_add(border))
            .ok_or(OcrError::ImageTooLarge { width, height })?;

        let padded = make_padding(image, padding)?;
        let scale = ScaleParam::new(padded.width(), padded.height(), resize);

        let det_start = Instant::now();
        let boxes = self.det_model.get_text_boxes(
            &padded,
            scale,
            box_score_threshold,
            box_threshold,
            unclip_ratio,
        )?;
        let det_time = det_start.elapsed();
        log::debug!("Detected {} regions in {det_time:?}", boxes.len());

        let classify = self
            .cls_model
            .as_ref()
            .filter(|_| do_angle)
            .map(|cls_model| move |part: &DynamicImage| cls_model.get_angle(part));
        let text_blocks = read_regions(
            boxes,
            RegionSteps {
                crop: |text_box: &TextBox| {
                    get_rotate_crop_image(&padded, &text_box.points, tall_crop_ratio)
                },
                classify,
                recognize: |part: &DynamicImage| self.rec_model.get_text_line(part),
            },
            &options,
            (width, height),
        );
        let text = text_blocks
            .iter()
            .map(|block| block.line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(OcrResult {
            text_blocks,
            det_time,
            total_time: start.elapsed(),
            text,
        })
    }
}

/// Per-region stages run after detection.
struct RegionSteps<C, A, R> {
    crop: C,
    /// `None` leaves every region unclassified.
    classify: Option<A>,
    recognize: R,
}

/// Crops, orients and reads every box, then assembles the blocks in source
/// coordinates. Boxes whose crop fails are dropped; failed orientation or
/// recognition keeps a default record.
fn read_regions<C, A, R>(
    boxes: Vec<TextBox>,
    steps: RegionSteps<C, A, R>,
    options: &DetectionOptions,
    (width, height): (u32, u32),
) -> Vec<TextBlock>
where
    C: Fn(&TextBox) -> Result<DynamicImage> + Sync + Send,
    A: Fn(&DynamicImage) -> Result<Angle> + Sync + Send,
    R: Fn(&DynamicImage) -> Result<TextLine> + Sync + Send,
{
    let parallel = options.parallel;

    let parts = map_regions(&boxes, parallel, |text_box| {
        (steps.crop)(text_box)
            .inspect_err(|err| log::warn!("Dropping region {text_box}: {err}"))
            .ok()
    });
    let (boxes, parts): (Vec<_>, Vec<_>) = boxes
        .into_iter()
        .zip(parts)
        .filter_map(|(text_box, part)| Some((text_box, part?)))
        .unzip();

    #[cfg(feature = "debug")]
    save_part_images(&parts);

    let angles = match &steps.classify {
        Some(classify) => {
            let angles = map_regions(&parts, parallel, |part| {
                classify(part).unwrap_or_else(|err| {
                    log::warn!("Orientation failed, assuming upright: {err}");
                    Angle::default()
                })
            });
            if options.most_angle {
                angle_net::most_angle(&angles)
            } else {
                angles
            }
        }
        None => vec![Angle::default(); parts.len()],
    };

    let regions = parts.iter().zip(&angles).collect::<Vec<_>>();
    let lines = map_regions(&regions, parallel, |&(part, angle)| {
        let line = if angle.index == Some(1) {
            (steps.recognize)(&part.rotate180())
        } else {
            (steps.recognize)(part)
        };
        line.unwrap_or_else(|err| {
            log::warn!("Recognition failed, leaving region empty: {err}");
            TextLine::default()
        })
    });

    assemble_blocks(boxes, angles, lines, options.padding, width, height)
}

/// Applies `f` to every region, keeping results at their region's index.
fn map_regions<T, R, F>(items: &[T], parallel: bool, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    if parallel {
        items.par_iter().map(f).collect()
    } else {
        items.iter().map(f).collect()
    }
}

/// Zips boxes, angles and lines into blocks and moves the boxes from padded
/// coordinates back into the `width` x `height` source image.
fn assemble_blocks(
    boxes: Vec<TextBox>,
    angles: Vec<Angle>,
    lines: Vec<TextLine>,
    padding: u32,
    width: u32,
    height: u32,
) -> Vec<TextBlock> {
    let padding = padding as i64;
    let unpad = |value: i32, limit: u32| (value as i64 - padding).clamp(0, limit as i64) as i32;

    boxes
        .into_iter()
        .zip(angles)
        .zip(lines)
        .map(|((text_box, angle), line)| TextBlock {
            bounds: TextBox {
                points: text_box.points.map(|point| Coord {
                    x: unpad(point.x, width),
                    y: unpad(point.y, height),
                }),
                ..text_box
            },
            block_time: angle.time + line.time,
            angle,
            line,
        })
        .collect()
}

#[cfg(feature = "debug")]
fn save_part_images(parts: &[DynamicImage]) {
    if let Err(err) = std::fs::create_dir_all("part_images") {
        log::warn!("Can't create part image directory: {err}");
        return;
    }
    for (i, part) in parts.iter().enumerate() {
        if let Err(err) = part.save(format!("part_images/{i}.png")) {
            log::warn!("Can't save part image {i}: {err}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionOptions {
    /// White border added around the image before detection.
    pub padding: u32,
    /// Longest detector input side, excluding padding. Zero uses the
    /// engine's setting.
    pub max_side_len: u32,
    pub box_score_threshold: f32,
    pub box_threshold: f32,
    pub unclip_ratio: f32,
    pub do_angle: bool,
    /// Force every region to the majority orientation.
    pub most_angle: bool,
    /// Parts at least this many times taller than wide are turned a quarter.
    pub tall_crop_ratio: Option<f32>,
    /// Process regions on the rayon pool.
    pub parallel: bool,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            padding: 50,
            max_side_len: 0,
            box_score_threshold: 0.5,
            box_threshold: 0.3,
            unclip_ratio: 1.6,
            do_angle: true,
            most_angle: false,
            tall_crop_ratio: Some(1.5),
            parallel: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::{Rgb, RgbImage};

    use super::*;

    fn scored_box(x: i32, score: f32) -> TextBox {
        TextBox {
            points: [(x, 0), (x + 8, 0), (x + 8, 4), (x, 4)].map(|(x, y)| Coord { x, y }),
            score,
        }
    }

    /// Parts are red on the left edge and blue on the right, two pixels wide
    /// for the first box and three for the last. The middle box can't be cut.
    fn crop_part(text_box: &TextBox) -> Result<DynamicImage> {
        let width = match text_box.score {
            score if score < 0.15 => 2,
            score if score < 0.25 => {
                return Err(OcrError::InvalidInput("box outside the image".to_string()))
            }
            _ => 3,
        };
        Ok(DynamicImage::ImageRgb8(RgbImage::from_fn(width, 2, |x, _| {
            if x == 0 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        })))
    }

    fn classify_part(part: &DynamicImage) -> Result<Angle> {
        if part.width() == 2 {
            return Err(OcrError::UnexpectedOutput("no scores".to_string()));
        }
        Ok(Angle {
            index: Some(1),
            score: 0.9,
            time: Duration::from_millis(1),
        })
    }

    /// Reads back the part width and whether it arrived upright.
    fn read_part(part: &DynamicImage) -> Result<TextLine> {
        let upright = part.to_rgb8().get_pixel(0, 0) == &Rgb([255, 0, 0]);
        Ok(TextLine {
            text: format!("{}:{}", part.width(), if upright { "up" } else { "down" }),
            ..Default::default()
        })
    }

    fn three_boxes() -> Vec<TextBox> {
        vec![scored_box(0, 0.1), scored_box(20, 0.2), scored_box(40, 0.3)]
    }

    fn options(most_angle: bool, parallel: bool) -> DetectionOptions {
        DetectionOptions {
            padding: 0,
            most_angle,
            parallel,
            ..Default::default()
        }
    }

    #[test]
    fn failed_crops_drop_their_region() {
        let steps = RegionSteps {
            crop: crop_part,
            classify: Some(classify_part),
            recognize: read_part,
        };
        let blocks = read_regions(three_boxes(), steps, &options(false, true), (200, 100));

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].bounds, scored_box(0, 0.1));
        assert_eq!(blocks[1].bounds, scored_box(40, 0.3));

        // Classification failed, so the part is read as it was cut.
        assert_eq!(blocks[0].angle, Angle::default());
        assert_eq!(blocks[0].line.text, "2:up");

        assert_eq!(blocks[1].angle.index, Some(1));
        assert_eq!(blocks[1].line.text, "3:down");
        assert_eq!(blocks[1].block_time, Duration::from_millis(1));
    }

    #[test]
    fn consensus_turns_every_region() {
        let steps = RegionSteps {
            crop: crop_part,
            classify: Some(classify_part),
            recognize: read_part,
        };
        let blocks = read_regions(three_boxes(), steps, &options(true, false), (200, 100));

        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|block| block.angle.index == Some(1)));
        assert_eq!(blocks[0].line.text, "2:down");
        assert_eq!(blocks[1].line.text, "3:down");
    }

    #[test]
    fn regions_stay_upright_without_classifier() {
        let steps = RegionSteps {
            crop: crop_part,
            classify: None::<fn(&DynamicImage) -> Result<Angle>>,
            recognize: read_part,
        };
        let blocks = read_regions(three_boxes(), steps, &options(true, true), (200, 100));

        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|block| block.angle == Angle::default()));
        assert_eq!(blocks[0].line.text, "2:up");
        assert_eq!(blocks[1].line.text, "3:up");
    }

    #[test]
    fn failed_recognition_leaves_an_empty_line() {
        let steps = RegionSteps {
            crop: crop_part,
            classify: None::<fn(&DynamicImage) -> Result<Angle>>,
            recognize: |_: &DynamicImage| -> Result<TextLine> {
                Err(OcrError::UnexpectedOutput("no outputs".to_string()))
            },
        };
        let blocks = read_regions(three_boxes(), steps, &options(false, true), (200, 100));

        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|block| block.line == TextLine::default()));
    }

    fn text_box(points: [(i32, i32); 4]) -> TextBox {
        TextBox {
            points: points.map(|(x, y)| Coord { x, y }),
            score: 0.8,
        }
    }

    #[test]
    fn blocks_keep_region_order_and_lose_padding() {
        let boxes = vec![
            text_box([(60, 60), (120, 60), (120, 80), (60, 80)]),
            text_box([(40, 100), (300, 100), (300, 170), (40, 170)]),
        ];
        let angles = vec![
            Angle {
                index: Some(0),
                score: 0.9,
                time: Duration::from_millis(2),
            },
            Angle::default(),
        ];
        let lines = vec![
            TextLine {
                text: "first".to_string(),
                character_scores: vec![0.9; 5],
                time: Duration::from_millis(3),
            },
            TextLine {
                text: "second".to_string(),
                ..Default::default()
            },
        ];

        let blocks = assemble_blocks(boxes, angles, lines, 50, 200, 100);
        assert_eq!(blocks.len(), 2);

        assert_eq!(blocks[0].line.text, "first");
        assert_eq!(blocks[0].bounds.points[0], Coord { x: 10, y: 10 });
        assert_eq!(blocks[0].bounds.points[2], Coord { x: 70, y: 30 });
        assert_eq!(blocks[0].bounds.score, 0.8);
        assert_eq!(blocks[0].block_time, Duration::from_millis(5));

        // Clamped into the 200x100 source.
        assert_eq!(blocks[1].line.text, "second");
        assert_eq!(blocks[1].bounds.points[0], Coord { x: 0, y: 50 });
        assert_eq!(blocks[1].bounds.points[2], Coord { x: 200, y: 100 });
        assert_eq!(blocks[1].angle.index, None);
    }

    #[test]
    fn region_mapping_keeps_indices() {
        let items = (0..100).collect::<Vec<u32>>();
        let parallel = map_regions(&items, true, |value| value * 2);
        let sequential = map_regions(&items, false, |value| value * 2);
        assert_eq!(parallel, sequential);
        assert_eq!(parallel[37], 74);
    }

    #[test]
    fn default_options() {
        let options = DetectionOptions::default();
        assert_eq!(options.padding, 50);
        assert_eq!(options.max_side_len, 0);
        assert_eq!(options.tall_crop_ratio, Some(1.5));
        assert!(options.do_angle && !options.most_angle && options.parallel);
    }
}
