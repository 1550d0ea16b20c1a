use std::collections::BTreeMap;

use float_ord::FloatOrd;
use geo::{Area, Coord, EuclideanLength, LineString, Polygon};
use geo_clipper::{Clipper, EndType, JoinType};
use tracing::instrument;

use crate::{OcrError, Result};

/// Boxes whose sides are both below this size cannot be unclipped.
const DEGENERATE_SIDE: f32 = 1.001;

/// A minimum-area rectangle with its corners in reading order
/// (top-left, top-right, bottom-right, bottom-left).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MiniBox {
    pub points: [Coord<f32>; 4],
    /// Length of the shorter side. Zero for a degenerate (segment or point) box.
    pub min_side: f32,
}

fn ccw(a: Coord<i32>, b: Coord<i32>, c: Coord<i32>) -> bool {
    let (ax, ay) = (a.x as i64, a.y as i64);
    let (bx, by) = (b.x as i64, b.y as i64);
    let (cx, cy) = (c.x as i64, c.y as i64);
    (bx - ax) * (cy - ay) > (by - ay) * (cx - ax)
}

fn polar_angle(from: Coord<i32>, to: Coord<i32>) -> f64 {
    ((to.y - from.y) as f64).atan2((to.x - from.x) as f64) % std::f64::consts::PI
}

fn distance_squared(a: Coord<i32>, b: Coord<i32>) -> i64 {
    let dx = (b.x - a.x) as i64;
    let dy = (b.y - a.y) as i64;
    dx * dx + dy * dy
}

fn to_f64(point: Coord<i32>) -> Coord<f64> {
    Coord {
        x: point.x as f64,
        y: point.y as f64,
    }
}

fn to_f32(point: Coord<f64>) -> Coord<f32> {
    Coord {
        x: point.x as f32,
        y: point.y as f32,
    }
}

fn dot(a: Coord<f64>, b: Coord<f64>) -> f64 {
    a.x * b.x + a.y * b.y
}

/// Graham scan. Fewer than three points are returned unchanged; duplicates
/// must be removed by the caller.
pub fn graham_scan(points: &[Coord<i32>]) -> Result<Vec<Coord<i32>>> {
    if points.is_empty() {
        return Err(OcrError::InvalidInput(
            "convex hull needs at least one point".to_string(),
        ));
    }
    if points.len() < 3 {
        return Ok(points.to_vec());
    }

    let mut sorted = points.to_vec();
    sorted.sort_by_key(|point| (point.x, point.y));
    let pivot = sorted[0];

    let mut groups = BTreeMap::<FloatOrd<f64>, Coord<i32>>::new();
    for &point in &sorted[1..] {
        groups
            .entry(FloatOrd(polar_angle(pivot, point)))
            .and_modify(|kept| {
                if distance_squared(pivot, point) > distance_squared(pivot, *kept) {
                    *kept = point;
                }
            })
            .or_insert(point);
    }
    let candidates = groups.into_values().collect::<Vec<_>>();

    if candidates.len() < 2 {
        return Ok(vec![pivot, candidates[0]]);
    }

    let mut stack = vec![pivot, candidates[0], candidates[1]];
    for &point in &candidates[2..] {
        while stack.len() > 1 && !ccw(stack[stack.len() - 2], stack[stack.len() - 1], point) {
            stack.pop();
        }
        stack.push(point);
    }
    Ok(stack)
}

// One or two points give a two point result.
fn parametric_perpendicular_projection(polygon: &[Coord<i32>]) -> Result<Vec<Coord<f32>>> {
    match *polygon {
        [] => {
            return Err(OcrError::InvalidInput(
                "minimum area rectangle needs at least one point".to_string(),
            ))
        }
        [p] => return Ok(vec![to_f32(to_f64(p)); 2]),
        [a, b] => return Ok(vec![to_f32(to_f64(a)), to_f32(to_f64(b))]),
        _ => {}
    }

    let n = polygon.len();
    let mut best: Option<(f64, [Coord<f64>; 4])> = None;

    for k in 0..n {
        let pk = to_f64(polygon[k]);
        let pj = to_f64(polygon[(k + 1) % n]);
        let v = pj - pk;
        let edge_len2 = dot(v, v);
        if edge_len2 == 0.0 {
            continue;
        }
        let r = 1.0 / edge_len2;

        // The edge endpoints sit at t = 0 and t = 1.
        let (mut t_min, mut r0) = (0.0, pk);
        let (mut t_max, mut r1) = (1.0, pj);
        let mut s_max = 0.0;
        let mut farthest = None;

        for &vertex in polygon {
            let pl = to_f64(vertex);
            let t = dot(pl - pk, v) * r;
            let projected = pk + v * t;
            let perpendicular = projected - pl;
            let s = dot(perpendicular, perpendicular);

            if t < t_min {
                t_min = t;
                r0 = projected;
            }
            if t > t_max {
                t_max = t;
                r1 = projected;
            }
            if s > s_max {
                s_max = s;
                farthest = Some((pl, projected));
            }
        }

        let Some((pl, q)) = farthest else {
            continue;
        };
        let offset = pl - q;
        let r2 = r1 + offset;
        let r3 = r0 + offset;
        let base = r1 - r0;
        // Squared area, comparable across candidates.
        let area = dot(base, base) * s_max;

        if best.map_or(true, |(min_area, _)| area < min_area) {
            best = Some((area, [r0, r1, r2, r3]));
        }
    }

    Ok(match best {
        Some((_, corners)) => corners.into_iter().map(to_f32).collect(),
        None => vec![to_f32(to_f64(polygon[0])), to_f32(to_f64(polygon[n - 1]))],
    })
}

/// Corners in cyclic order. Fewer than three distinct points give a two
/// point result.
#[instrument(level = "trace", skip(points), fields(points = points.len()))]
pub fn minimum_area_rectangle(points: &[Coord<i32>]) -> Result<Vec<Coord<f32>>> {
    let mut distinct = points.to_vec();
    distinct.sort_by_key(|point| (point.x, point.y));
    distinct.dedup();
    let hull = graham_scan(&distinct)?;
    parametric_perpendicular_projection(&hull)
}

/// Near-square boxes rotated close to 45 degrees can be ordered
/// inconsistently.
pub fn order_box(mut corners: [Coord<f32>; 4]) -> [Coord<f32>; 4] {
    corners.sort_by_key(|point| FloatOrd(point.x));

    let (top_left, bottom_left) = if corners[1].y > corners[0].y {
        (0, 1)
    } else {
        (1, 0)
    };
    let (top_right, bottom_right) = if corners[3].y > corners[2].y {
        (2, 3)
    } else {
        (3, 2)
    };

    [
        corners[top_left],
        corners[top_right],
        corners[bottom_right],
        corners[bottom_left],
    ]
}

fn distance(a: Coord<f32>, b: Coord<f32>) -> f32 {
    (b.x - a.x).hypot(b.y - a.y)
}

pub fn box_size(corners: &[Coord<f32>; 4]) -> (f32, f32) {
    (
        distance(corners[0], corners[1]),
        distance(corners[1], corners[2]),
    )
}

pub fn mini_box(points: &[Coord<i32>]) -> Result<MiniBox> {
    let rect = minimum_area_rectangle(points)?;
    let corners = match *rect.as_slice() {
        [a, b, c, d] => [a, b, c, d],
        [a, b] => [a, b, b, a],
        _ => {
            return Err(OcrError::InvalidInput(format!(
                "rectangle with {} corners",
                rect.len()
            )))
        }
    };
    let (width, height) = box_size(&corners);
    Ok(MiniBox {
        points: order_box(corners),
        min_side: width.min(height),
    })
}

fn to_polygon(points: &[Coord<f32>]) -> Polygon<f32> {
    Polygon::new(LineString::new(points.to_vec()), vec![])
}

/// Shoelace area of a closed polygon. Positive for counter-clockwise rings.
pub fn signed_area(points: &[Coord<f32>]) -> f32 {
    to_polygon(points).signed_area()
}

pub fn perimeter(points: &[Coord<f32>]) -> f32 {
    to_polygon(points).exterior().euclidean_length()
}

/// `None` when the box is too small to offset.
#[instrument(level = "trace")]
pub fn unclip(box_points: &[Coord<f32>; 4], unclip_ratio: f32) -> Option<Vec<Coord<i32>>> {
    let width = distance(box_points[0], box_points[1]);
    let height = distance(box_points[0], box_points[3]);
    if width < DEGENERATE_SIDE && height < DEGENERATE_SIDE {
        return None;
    }

    let snapped = box_points
        .iter()
        .map(|point| Coord {
            x: point.x.trunc(),
            y: point.y.trunc(),
        })
        .collect::<Vec<_>>();

    let length = perimeter(box_points);
    if length <= 0.0 {
        return None;
    }
    let distance = signed_area(box_points).abs() * unclip_ratio / length;

    let offset = to_polygon(&snapped).offset(
        distance,
        JoinType::Round(0.25),
        EndType::ClosedPolygon,
        1.0,
    );
    let polygon = offset.0.first()?;

    let mut points = polygon
        .exterior()
        .coords()
        .map(|point| Coord {
            x: point.x as i32,
            y: point.y as i32,
        })
        .collect::<Vec<_>>();
    // Drop the closing coordinate of the ring.
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }

    if points.is_empty() {
        None
    } else {
        Some(points)
    }
}
