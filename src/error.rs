use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors surfaced by the OCR pipeline.
///
/// Geometry that collapses during unclipping is not an error; it is reported
/// as `None` by [`unclip`](crate::geometry::unclip) and the candidate is
/// dropped.
#[derive(Debug, Error)]
pub enum OcrError {
    /// Empty point sets or zero-sized images handed to a routine that needs
    /// at least one element.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The inference runtime failed to load or run a model.
    #[error("inference failed: {0}")]
    Inference(#[from] ort::Error),

    /// A model produced a tensor with an unexpected rank or shape.
    #[error("model output had unexpected shape: {0}")]
    UnexpectedOutput(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// The recognition symbol table could not be read.
    #[error("failed to read symbol table {path:?}: {source}")]
    Keys {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The bounding region of a text box could not be cut out of the image.
    #[error("could not crop region ({x}, {y}, {width}x{height}) from {image_width}x{image_height} image")]
    Crop {
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        image_width: u32,
        image_height: u32,
    },

    /// Padding pushed the image dimensions past what can be addressed.
    #[error("image of {width}x{height} is too large to process")]
    ImageTooLarge { width: u32, height: u32 },
}

pub type Result<T, E = OcrError> = std::result::Result<T, E>;
