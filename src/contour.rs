use geo::Coord;
use image::GrayImage;
use tracing::instrument;

use crate::geometry::graham_scan;

/// A maximal horizontal span of "on" pixels. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    row: u32,
    start: u32,
    end: u32,
}

#[derive(Debug)]
struct Blob {
    id: usize,
    runs: Vec<Run>,
    start_row: u32,
    end_row: u32,
    start_col: u32,
    end_col: u32,
}

impl Blob {
    fn new(id: usize, run: Run) -> Self {
        Self {
            id,
            runs: vec![run],
            start_row: run.row,
            end_row: run.row,
            start_col: run.start,
            end_col: run.end,
        }
    }

    fn push(&mut self, run: Run) {
        self.start_row = self.start_row.min(run.row);
        self.end_row = self.end_row.max(run.row);
        self.start_col = self.start_col.min(run.start);
        self.end_col = self.end_col.max(run.end);
        self.runs.push(run);
    }

    fn absorb(&mut self, other: Blob) {
        self.start_row = self.start_row.min(other.start_row);
        self.end_row = self.end_row.max(other.end_row);
        self.start_col = self.start_col.min(other.start_col);
        self.end_col = self.end_col.max(other.end_col);
        self.runs.extend(other.runs);
    }

    fn touches(&self, run: &Run) -> bool {
        self.end_row + 1 >= run.row && self.start_col <= run.end && run.start <= self.end_col
    }

    fn vertices(mut self) -> Vec<Coord<i32>> {
        self.runs.sort_by_key(|run| (run.row, run.start));
        // Runs in one row are disjoint, so the endpoints are already distinct.
        let mut points = Vec::with_capacity(self.runs.len() * 2);
        for run in self.runs {
            let y = run.row as i32;
            points.push(Coord {
                x: run.start as i32,
                y,
            });
            if run.end != run.start {
                points.push(Coord {
                    x: run.end as i32,
                    y,
                });
            }
        }
        points
    }
}

#[derive(Debug, Default)]
struct ContourExtractor {
    active: Vec<Blob>,
    finished: Vec<Blob>,
    next_id: usize,
}

impl ContourExtractor {
    fn scan_row(row: u32, pixels: &[u8]) -> Vec<Run> {
        let mut runs = Vec::new();
        let mut open: Option<u32> = None;
        for (column, &value) in pixels.iter().enumerate() {
            let column = column as u32;
            match (open, value != 0) {
                (None, true) => open = Some(column),
                (Some(start), false) => {
                    runs.push(Run {
                        row,
                        start,
                        end: column - 1,
                    });
                    open = None;
                }
                _ => {}
            }
        }
        if let Some(start) = open {
            runs.push(Run {
                row,
                start,
                end: pixels.len() as u32 - 1,
            });
        }
        runs
    }

    fn merge_row(&mut self, row: u32, runs: Vec<Run>) {
        // Anything that ended two or more rows ago can no longer grow.
        let (still_active, done): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|blob| blob.end_row + 1 >= row);
        self.active = still_active;
        self.finished.extend(done);

        for run in runs {
            let overlapping = self
                .active
                .iter()
                .enumerate()
                .filter(|(_, blob)| blob.touches(&run))
                .map(|(index, _)| index)
                .collect::<Vec<_>>();

            match overlapping.split_first() {
                Some((&pivot, rest)) => {
                    self.active[pivot].push(run);
                    for &index in rest.iter().rev() {
                        let merged = self.active.remove(index);
                        self.active[pivot].absorb(merged);
                    }
                }
                None => {
                    self.active.push(Blob::new(self.next_id, run));
                    self.next_id += 1;
                }
            }
        }
    }

    fn into_blobs(mut self) -> Vec<Blob> {
        self.finished.append(&mut self.active);
        // Surviving blobs keep the id of their oldest member.
        self.finished.sort_by_key(|blob| blob.id);
        self.finished
    }
}

/// Hulls of the run endpoints of each component, in discovery order.
/// Components with three or fewer endpoints are dropped.
#[instrument(level = "debug", skip(mask), fields(width = mask.width(), height = mask.height()))]
pub fn find_contours(mask: &GrayImage) -> Vec<Vec<Coord<i32>>> {
    let width = mask.width() as usize;
    let mut extractor = ContourExtractor::default();
    if width == 0 {
        return Vec::new();
    }

    for (row, pixels) in mask.as_raw().chunks_exact(width).enumerate() {
        let row = row as u32;
        let runs = ContourExtractor::scan_row(row, pixels);
        extractor.merge_row(row, runs);
    }

    let blobs = extractor.into_blobs();
    log::trace!("Found {} blobs", blobs.len());

    blobs
        .into_iter()
        .map(Blob::vertices)
        .filter(|points| points.len() > 3)
        .filter_map(|points| graham_scan(&points).ok())
        .collect()
}
