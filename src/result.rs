use std::{fmt, time::Duration};

use geo::Coord;

/// An oriented text region with corners in reading order
/// (top-left, top-right, bottom-right, bottom-left).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextBox {
    pub points: [Coord<i32>; 4],
    pub score: f32,
}

/// Orientation of one region. `index` is `None` when classification was
/// skipped or failed, otherwise 0 (upright) or 1 (upside down).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Angle {
    pub index: Option<usize>,
    pub score: f32,
    pub time: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextLine {
    pub text: String,
    /// One confidence per decoded character.
    pub character_scores: Vec<f32>,
    pub time: Duration,
}

/// Box, angle and line for one region.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub bounds: TextBox,
    pub angle: Angle,
    pub line: TextLine,
    pub block_time: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcrResult {
    pub text_blocks: Vec<TextBlock>,
    /// Detector inference plus box assembly.
    pub det_time: Duration,
    /// The whole call.
    pub total_time: Duration,
    /// Block texts, one per line.
    pub text: String,
}

impl fmt::Display for TextBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TextBox[score({})", self.score)?;
        for point in &self.points {
            write!(f, ", [x: {}, y: {}]", point.x, point.y)?;
        }
        write!(f, "]")
    }
}

impl fmt::Display for Angle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(
                f,
                "Angle[Index({index}), Score({}), Time({:?})]",
                self.score, self.time
            ),
            None => write!(f, "AngleDisabled[Score({}), Time({:?})]", self.score, self.time),
        }
    }
}

impl fmt::Display for TextLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TextLine[Text({:?}), Scores({:?}), Time({:?})]",
            self.text, self.character_scores, self.time
        )
    }
}

impl fmt::Display for OcrResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "OcrResult")?;
        for block in &self.text_blocks {
            writeln!(f, "├─TextBlock")?;
            writeln!(f, "│   ├──{}", block.bounds)?;
            writeln!(f, "│   ├──{}", block.angle)?;
            writeln!(f, "│   ├──{}", block.line)?;
            writeln!(f, "│   └──BlockTime({:?})", block.block_time)?;
        }
        writeln!(f, "├─DetectorTime({:?})", self.det_time)?;
        writeln!(f, "├─TotalTime({:?})", self.total_time)?;
        write!(f, "└─Text({:?})", self.text)
    }
}
