use std::{path::Path, time::Instant};

use image::{imageops::FilterType, DynamicImage};
use ndarray::Axis;
use ort::{inputs, Session};
use tracing::instrument;

use crate::{
    util::{create_session, subtract_mean_normalize},
    Angle, OcrError, Result,
};

const DEST_WIDTH: u32 = 192;
const DEST_HEIGHT: u32 = 48;

const MEAN_VALUES: [f32; 3] = [0.5, 0.5, 0.5];
const NORM_VALUES: [f32; 3] = [2.0, 2.0, 2.0];

/// Two-class orientation classifier: upright (0) or upside down (1).
pub struct AngleNet {
    session: Session,
    input_name: String,
}

impl AngleNet {
    #[instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
    pub fn init(path: impl AsRef<Path>, num_threads: usize) -> Result<Self> {
        let (session, input_name) = create_session(path, num_threads)?;
        Ok(Self {
            session,
            input_name,
        })
    }

    #[instrument(level = "trace", skip(self, image))]
    pub fn get_angle(&self, image: &DynamicImage) -> Result<Angle> {
        let start = Instant::now();
        let image = image.resize_exact(DEST_WIDTH, DEST_HEIGHT, FilterType::CatmullRom);
        let tensor =
            subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => tensor]?)?;
        let output = outputs
            .first_key_value()
            .ok_or_else(|| {
                OcrError::UnexpectedOutput("orientation model returned no outputs".to_string())
            })?
            .1
            .try_extract_tensor::<f32>()?;

        let scores = output.iter().copied().collect::<Vec<_>>();
        let (index, score) = score_to_angle(&scores).ok_or_else(|| {
            OcrError::UnexpectedOutput("orientation model returned no scores".to_string())
        })?;

        Ok(Angle {
            index: Some(index),
            score,
            time: start.elapsed(),
        })
    }
}

/// Index and value of the highest score. The first index wins ties.
pub fn score_to_angle(scores: &[f32]) -> Option<(usize, f32)> {
    let (&first, rest) = scores.split_first()?;
    Some(
        rest.iter()
            .enumerate()
            .fold((0, first), |(best, max), (i, &value)| {
                if value > max {
                    (i + 1, value)
                } else {
                    (best, max)
                }
            }),
    )
}

/// Replaces every angle's index by the majority orientation of the
/// classified ones: upside down when at least half of them are.
///
/// Returns the input unchanged when nothing was classified.
pub fn most_angle(angles: &[Angle]) -> Vec<Angle> {
    let classified = angles
        .iter()
        .filter_map(|angle| angle.index)
        .collect::<Vec<_>>();
    if classified.is_empty() {
        return angles.to_vec();
    }

    let sum = classified.iter().sum::<usize>() as f32;
    let half = classified.len() as f32 / 2.0;
    let index = if sum < half { 0 } else { 1 };
    log::debug!("Setting all angles to index {index}");

    angles
        .iter()
        .map(|angle| Angle {
            index: Some(index),
            ..*angle
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn angle(index: Option<usize>) -> Angle {
        Angle {
            index,
            score: 0.9,
            ..Default::default()
        }
    }

    #[test]
    fn argmax_prefers_first_on_ties() {
        assert_eq!(score_to_angle(&[0.2, 0.8]), Some((1, 0.8)));
        assert_eq!(score_to_angle(&[0.5, 0.5]), Some((0, 0.5)));
        assert_eq!(score_to_angle(&[]), None);
    }

    #[test]
    fn consensus_follows_the_majority() {
        let angles = [angle(Some(1)), angle(Some(0)), angle(Some(0))];
        let agreed = most_angle(&angles);
        assert!(agreed.iter().all(|a| a.index == Some(0)));
        // The input is left as it was.
        assert_eq!(angles[0].index, Some(1));

        let angles = [angle(Some(1)), angle(Some(1)), angle(Some(0))];
        assert!(most_angle(&angles).iter().all(|a| a.index == Some(1)));
    }

    #[test]
    fn consensus_tie_goes_upside_down() {
        let angles = [angle(Some(1)), angle(Some(0))];
        assert!(most_angle(&angles).iter().all(|a| a.index == Some(1)));
    }

    #[test]
    fn consensus_covers_unclassified_regions() {
        let angles = [angle(Some(1)), angle(None), angle(Some(1))];
        let agreed = most_angle(&angles);
        assert_eq!(agreed.len(), 3);
        assert!(agreed.iter().all(|a| a.index == Some(1)));
        assert_eq!(agreed[1].score, 0.9);
    }

    #[test]
    fn consensus_without_classifications_is_a_no_op() {
        let angles = [angle(None), angle(None)];
        assert_eq!(most_angle(&angles), angles.to_vec());
    }
}
