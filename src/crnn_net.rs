use std::{path::Path, time::Instant};

use image::{imageops::FilterType, DynamicImage};
use ndarray::{ArrayView2, Axis};
use ort::{inputs, Session};
use tracing::instrument;

use crate::{
    util::{create_session, subtract_mean_normalize},
    OcrError, Result, TextLine,
};

const DEST_HEIGHT: u32 = 48;

const MEAN_VALUES: [f32; 3] = [0.5, 0.5, 0.5];
const NORM_VALUES: [f32; 3] = [2.0, 2.0, 2.0];

/// Line recognizer emitting per-timestep class scores over the symbol table.
pub struct CrnnNet {
    session: Session,
    input_name: String,
    keys: Vec<String>,
}

impl CrnnNet {
    #[instrument(level = "debug", skip_all, fields(model = %model_path.as_ref().display()))]
    pub fn init(
        model_path: impl AsRef<Path>,
        keys_path: impl AsRef<Path>,
        num_threads: usize,
    ) -> Result<Self> {
        let (session, input_name) = create_session(model_path, num_threads)?;
        let keys = load_keys(keys_path)?;
        log::debug!("Loaded {} recognition symbols", keys.len());

        Ok(Self {
            session,
            input_name,
            keys,
        })
    }

    #[instrument(level = "trace", skip(self, image))]
    pub fn get_text_line(&self, image: &DynamicImage) -> Result<TextLine> {
        let start = Instant::now();
        let scale = DEST_HEIGHT as f32 / image.height().max(1) as f32;
        let dest_width = ((image.width() as f32 * scale) as u32).clamp(1, u16::MAX as u32);
        let image = image.resize_exact(dest_width, DEST_HEIGHT, FilterType::CatmullRom);

        let tensor =
            subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => tensor]?)?;
        let output = outputs
            .first_key_value()
            .ok_or_else(|| {
                OcrError::UnexpectedOutput("recognizer returned no outputs".to_string())
            })?
            .1
            .try_extract_tensor::<f32>()?;

        log::trace!("Output tensor size: {:?}", output.dim());
        let &[1, steps, classes] = output.shape() else {
            return Err(OcrError::UnexpectedOutput(format!(
                "recognizer output shape {:?}, expected [1, T, C]",
                output.shape()
            )));
        };
        let scores = output
            .to_shape((steps, classes))
            .map_err(|err| OcrError::UnexpectedOutput(err.to_string()))?;

        Ok(TextLine {
            time: start.elapsed(),
            ..score_to_text_line(scores.view(), &self.keys)
        })
    }
}

/// Reads the symbol table: one symbol per line, with the blank `#` at index 0
/// and a space appended after the last line.
pub fn load_keys(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| OcrError::Keys {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(keys_from_lines(contents.lines()))
}

pub(crate) fn keys_from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    ["#".to_string()]
        .into_iter()
        .chain(lines.into_iter().map(str::to_string))
        .chain([" ".to_string()])
        .collect()
}

/// Greedy CTC decode of a `[T, C]` score matrix.
///
/// Repeats are checked against the previous time step, blanks included, so
/// `a, blank, a` decodes to `aa`.
pub fn score_to_text_line(data: ArrayView2<f32>, keys: &[String]) -> TextLine {
    let mut text = String::new();
    let mut character_scores = Vec::new();
    let mut last_index = None;

    for step in data.outer_iter() {
        let Some((index, score)) = step.iter().enumerate().fold(None, |best, (i, &value)| {
            match best {
                Some((_, max)) if value <= max => best,
                _ => Some((i, value)),
            }
        }) else {
            continue;
        };

        if index > 0 && index < keys.len() && last_index != Some(index) {
            text.push_str(&keys[index]);
            character_scores.push(score);
        }
        last_index = Some(index);
    }

    TextLine {
        text,
        character_scores,
        ..Default::default()
    }
}
