use std::path::PathBuf;

use clap::Parser;
use rapidocr_geometry::{DetectionOptions, RapidOcrBuilder, Result};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Detect and read text in an image.
#[derive(Debug, Parser)]
#[command(name = "rapidocr", version)]
struct Args {
    /// Image to read
    image: PathBuf,

    /// Text detection model
    #[arg(long, default_value = "models/det.onnx")]
    det: PathBuf,

    /// Orientation model; orientation is skipped without it
    #[arg(long)]
    cls: Option<PathBuf>,

    /// Recognition model
    #[arg(long, default_value = "models/rec.onnx")]
    rec: PathBuf,

    /// Recognition symbol table, one symbol per line
    #[arg(long, default_value = "models/ppocr_keys_v1.txt")]
    keys: PathBuf,

    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// White border added around the image
    #[arg(long, default_value_t = 50)]
    padding: u32,

    /// Longest detector input side, 0 keeps the image size
    #[arg(long, default_value_t = 1024)]
    max_side_len: u32,

    #[arg(long, default_value_t = 0.5)]
    box_score_threshold: f32,

    #[arg(long, default_value_t = 0.3)]
    box_threshold: f32,

    #[arg(long, default_value_t = 1.6)]
    unclip_ratio: f32,

    /// Force every region to the majority orientation
    #[arg(long)]
    most_angle: bool,

    /// Don't turn tall regions a quarter before reading them
    #[arg(long)]
    keep_tall: bool,

    /// Process regions one at a time
    #[arg(long)]
    sequential: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut builder = RapidOcrBuilder::new()
        .threads(args.threads)
        .det_model(&args.det)
        .rec_model(&args.rec, &args.keys)
        .max_side_len(args.max_side_len);
    if let Some(cls) = &args.cls {
        builder = builder.cls_model(cls);
    }
    let ocr = builder.build()?;

    let options = DetectionOptions {
        padding: args.padding,
        box_score_threshold: args.box_score_threshold,
        box_threshold: args.box_threshold,
        unclip_ratio: args.unclip_ratio,
        most_angle: args.most_angle,
        tall_crop_ratio: (!args.keep_tall).then_some(1.5),
        parallel: !args.sequential,
        ..Default::default()
    };
    let result = ocr.detect_file(&args.image, options)?;
    log::debug!("Finished in {:?}", result.total_time);
    println!("{result}");

    Ok(())
}
