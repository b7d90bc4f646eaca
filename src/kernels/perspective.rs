//! Perspective correction from control points.
//!
//! The caller marks 4, 5, 6, 7 or 8 control points in the image (already
//! corrected for distortion); the fit recovers the orientation of the
//! photographed plane and builds a single projective kernel that re-renders
//! the image as if the camera had faced the plane straight on.
//!
//! Point semantics:
//!
//! - 4 points: two pairs, each defining a "vertical" line. Their vanishing
//!   point fixes the plane tilt; the focal length sets the aspect.
//! - 6 points: as above plus a horizontal line that levels the result.
//! - 8 points: two verticals and two horizontals; the second vanishing
//!   point determines the focal length, so the nominal value is not needed.
//! - 5 points: all on an ellipse that is a rotated circle; the axis ratio
//!   gives the tilt and the point ordering (clockwise vs counter-clockwise
//!   on screen) chooses whether the vertex lies above or below the centre.
//! - 7 points: the 5-point circle plus a horizontal line for levelling.
//!
//! When the lines built from the first four points run more horizontally
//! than vertically (for 7 points: when the levelling line runs more
//! vertically than horizontally), the roles of horizontal and vertical
//! swap; this is implemented by conjugating the whole fit with a quarter
//! turn.
//!
//! The `d` blend maps -1 to "no tilt change", 0 to the exact correction and
//! +1 to 125 % of the tilt angle.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use tracing::debug;

use super::OUT_OF_BOUNDS;

/// Near-parallel / near-degenerate threshold for homogeneous intersections
/// and conic fits.
const DEGENERATE_EPS: f64 = 1e-10;

/// Run the perspective map over an interleaved coordinate buffer.
pub(crate) fn apply(matrix: &Matrix3<f64>, focal: f64, io: &mut [f32]) {
    for p in io.chunks_exact_mut(2) {
        let v = matrix * Vector3::new(p[0] as f64, p[1] as f64, focal);
        if v.z > DEGENERATE_EPS {
            p[0] = (focal * v.x / v.z) as f32;
            p[1] = (focal * v.y / v.z) as f32;
        } else {
            p[0] = OUT_OF_BOUNDS;
            p[1] = OUT_OF_BOUNDS;
        }
    }
}

/// Fit the perspective correction. Control points are in normalized
/// coordinates, `focal` is the nominal focal length in normalized units.
///
/// Returns the target-to-source projective matrix and the focal length it
/// was built with (derived from the points themselves in the 8-point case),
/// or `None` for unsupported counts and degenerate geometry.
pub(crate) fn fit(xs: &[f64], ys: &[f64], d: f64, focal: f64) -> Option<(Matrix3<f64>, f64)> {
    let n = xs.len();
    if n != ys.len() || !(4..=8).contains(&n) {
        return None;
    }
    if !xs.iter().chain(ys).all(|v| v.is_finite()) || focal <= 0.0 {
        return None;
    }

    let d = d.clamp(-1.0, 1.0);
    // -1 -> 0 (no change), 0 -> 1 (exact), +1 -> 1.25 (overshoot).
    let blend = if d <= 0.0 { d + 1.0 } else { 1.0 + d / 4.0 };

    let mut points: Vec<Vector2<f64>> = xs
        .iter()
        .zip(ys)
        .map(|(&x, &y)| Vector2::new(x, y))
        .collect();

    let swapped = roles_swapped(&points);
    if swapped {
        for p in &mut points {
            *p = Vector2::new(p.y, -p.x);
        }
    }

    let (rotation, focal) = match n {
        4 | 6 | 8 => fit_lines(&points, blend, focal)?,
        5 | 7 => fit_circle(&points, blend, focal)?,
        _ => unreachable!(),
    };

    // Pin the image centre: translate the target frame so that the centre
    // maps to itself under the final kernel.
    let centre = rotation * Vector3::new(0.0, 0.0, focal);
    if centre.z <= DEGENERATE_EPS {
        debug!("perspective correction rejected: tilt reaches past 90 degrees");
        return None;
    }
    let offset = Vector2::new(focal * centre.x / centre.z, focal * centre.y / centre.z);
    let shift = Matrix3::new(
        1.0, 0.0, offset.x / focal,
        0.0, 1.0, offset.y / focal,
        0.0, 0.0, 1.0,
    );
    let mut matrix = rotation.transpose() * shift;

    if swapped {
        let quarter = Matrix3::new(0.0, 1.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        matrix = quarter.transpose() * matrix * quarter;
    }
    Some((matrix, focal))
}

/// `true` when the defining lines run more horizontally than vertically.
fn roles_swapped(points: &[Vector2<f64>]) -> bool {
    let spans = |a: Vector2<f64>, b: Vector2<f64>| {
        let d = b - a;
        (d.x.abs(), d.y.abs())
    };
    match points.len() {
        4 | 6 | 8 => {
            let (dx1, dy1) = spans(points[0], points[1]);
            let (dx2, dy2) = spans(points[2], points[3]);
            dx1 + dx2 > dy1 + dy2
        }
        // The levelling line of the 7-point case should be horizontal.
        7 => {
            let (dx, dy) = spans(points[5], points[6]);
            dx < dy
        }
        _ => false,
    }
}

/// 4/6/8-point fit: vanishing point of the two vertical lines, optional
/// horizontal information.
fn fit_lines(
    points: &[Vector2<f64>],
    blend: f64,
    nominal_focal: f64,
) -> Option<(Matrix3<f64>, f64)> {
    let v_vert = match intersect(points[0], points[1], points[2], points[3]) {
        Meet::Degenerate => return None,
        Meet::Parallel => None,
        Meet::Point(v) => Some(v),
    };
    let v_horiz = if points.len() == 8 {
        match intersect(points[4], points[5], points[6], points[7]) {
            Meet::Degenerate => return None,
            Meet::Parallel => None,
            Meet::Point(v) => Some(v),
        }
    } else {
        None
    };

    // Two vanishing points of orthogonal plane directions determine the
    // focal length: their image dot product equals -f^2.
    let focal = match (v_vert, v_horiz) {
        (Some(vv), Some(vh)) => {
            let dot = vv.dot(&vh);
            if dot < 0.0 {
                (-dot).sqrt()
            } else {
                nominal_focal
            }
        }
        _ => nominal_focal,
    };

    let r1 = tilt_rotation(v_vert, &points[0..4], blend, focal)?;

    let rotation = match points.len() {
        4 => r1,
        6 => level_rotation(r1, points[4], points[5], focal)? * r1,
        8 => match v_horiz {
            // Rotate about y so the horizontal vanishing direction lands
            // on the x axis.
            Some(vh) => {
                let h = r1 * Vector3::new(vh.x, vh.y, focal);
                let beta = (-h.z).atan2(h.x);
                rot_y(beta) * r1
            }
            // Parallel horizontals are already level.
            None => r1,
        },
        _ => unreachable!(),
    };
    Some((rotation, focal))
}

/// How two lines meet.
enum Meet {
    /// A finite intersection point.
    Point(Vector2<f64>),
    /// Distinct parallel lines (vanishing point at infinity).
    Parallel,
    /// Coincident or zero-length lines; no usable information.
    Degenerate,
}

/// Intersection of lines (a, b) and (c, d).
fn intersect(a: Vector2<f64>, b: Vector2<f64>, c: Vector2<f64>, d: Vector2<f64>) -> Meet {
    let l1 = Vector3::new(a.x, a.y, 1.0).cross(&Vector3::new(b.x, b.y, 1.0));
    let l2 = Vector3::new(c.x, c.y, 1.0).cross(&Vector3::new(d.x, d.y, 1.0));
    let v = l1.cross(&l2);
    let line_scale = l1.norm() * l2.norm();
    if v.norm() < DEGENERATE_EPS * line_scale.max(DEGENERATE_EPS) {
        return Meet::Degenerate;
    }
    let scale = v.x.abs().max(v.y.abs()).max(1.0);
    if v.z.abs() < DEGENERATE_EPS * scale {
        Meet::Parallel
    } else {
        Meet::Point(Vector2::new(v.x / v.z, v.y / v.z))
    }
}

/// Rotation mapping the vertical vanishing direction onto the image "down"
/// axis: an in-plane turn putting the vanishing point on +y, then a tilt
/// about x.
fn tilt_rotation(
    vanish: Option<Vector2<f64>>,
    verticals: &[Vector2<f64>],
    blend: f64,
    focal: f64,
) -> Option<Matrix3<f64>> {
    match vanish {
        Some(v) => {
            let rho = v.x.atan2(v.y);
            let delta = focal.atan2(v.norm()) * blend;
            Some(rot_x(delta) * rot_z_align(rho))
        }
        None => {
            // Parallel verticals: no tilt, only align them with the y axis.
            let mut d1 = verticals[1] - verticals[0];
            if d1.y < 0.0 {
                d1 = -d1;
            }
            let mut d2 = verticals[3] - verticals[2];
            if d2.y < 0.0 {
                d2 = -d2;
            }
            let dir = d1 + d2;
            Some(rot_z_align(dir.x.atan2(dir.y)))
        }
    }
}

/// In-plane rotation that levels the (corrected) image of the horizontal
/// line (a, b).
fn level_rotation(
    r1: Matrix3<f64>,
    a: Vector2<f64>,
    b: Vector2<f64>,
    focal: f64,
) -> Option<Matrix3<f64>> {
    let corrected = |p: Vector2<f64>| {
        let v = r1 * Vector3::new(p.x, p.y, focal);
        (v.z > DEGENERATE_EPS).then(|| Vector2::new(focal * v.x / v.z, focal * v.y / v.z))
    };
    let qa = corrected(a)?;
    let qb = corrected(b)?;
    let angle = (qb.y - qa.y).atan2(qb.x - qa.x);
    Some(rot_z(angle))
}

/// 5/7-point fit: the points lie on a rotated circle; its image ellipse
/// yields the tilt and the vanishing point.
fn fit_circle(points: &[Vector2<f64>], blend: f64, focal: f64) -> Option<(Matrix3<f64>, f64)> {
    let five = &points[0..5];

    // Exact conic through five points: the null direction of the design
    // matrix with rows [x^2, xy, y^2, x, y, 1], taken as the eigenvector
    // of the smallest eigenvalue of the normal matrix.
    let design = DMatrix::from_fn(5, 6, |r, c| {
        let (x, y) = (five[r].x, five[r].y);
        match c {
            0 => x * x,
            1 => x * y,
            2 => y * y,
            3 => x,
            4 => y,
            _ => 1.0,
        }
    });
    let normal = design.transpose() * &design;
    let eigen = nalgebra::SymmetricEigen::new(normal);
    let mut min_idx = 0;
    for i in 1..eigen.eigenvalues.len() {
        if eigen.eigenvalues[i] < eigen.eigenvalues[min_idx] {
            min_idx = i;
        }
    }
    let null = eigen.eigenvectors.column(min_idx);
    // Normalise the sign so the quadratic part is positive definite for an
    // ellipse.
    let sign = if null[0] + null[2] < 0.0 { -1.0 } else { 1.0 };
    let (a, b, c) = (sign * null[0], sign * null[1], sign * null[2]);
    let (dd, e, ff) = (sign * null[3], sign * null[4], sign * null[5]);

    // Not an ellipse (near-colinear points): refuse rather than guess.
    let det2 = a * c - b * b / 4.0;
    let norm2: f64 = null.iter().map(|v| v * v).sum();
    if det2 <= DEGENERATE_EPS * norm2 {
        debug!("perspective correction rejected: control points are not on an ellipse");
        return None;
    }

    // Ellipse centre and the conic value there.
    let denom = 4.0 * a * c - b * b;
    let cx = (b * e - 2.0 * c * dd) / denom;
    let cy = (b * dd - 2.0 * a * e) / denom;
    let g = a * cx * cx + b * cx * cy + c * cy * cy + dd * cx + e * cy + ff;

    // Eigenvalues of the quadratic part; for an ellipse both are positive
    // and g is negative. The minor axis belongs to the larger eigenvalue.
    let half_trace = (a + c) / 2.0;
    let spread = ((a - c) * (a - c) / 4.0 + b * b / 4.0).sqrt();
    let l_major = half_trace - spread;
    let l_minor = half_trace + spread;
    if g >= 0.0 || l_major <= 0.0 {
        debug!("perspective correction rejected: degenerate conic");
        return None;
    }
    let major = (-g / l_major).sqrt();
    let minor = (-g / l_minor).sqrt();

    // The circle is tilted by the angle that foreshortens major into
    // minor. 0.5 * atan2(b, a - c) is the direction of the larger
    // eigenvalue's eigenvector, i.e. the minor axis.
    let tilt = (minor / major).clamp(-1.0, 1.0).acos();
    let minor_angle = 0.5 * b.atan2(a - c);
    let mut minor_dir = Vector2::new(minor_angle.cos(), minor_angle.sin());
    if minor_dir.y > 0.0 {
        minor_dir = -minor_dir; // point "up" (negative y) in image coords
    }

    // Clockwise ordering on screen (y grows downwards) puts the vertex
    // above the centre, counter-clockwise below.
    let shoelace: f64 = (0..5)
        .map(|i| {
            let p = five[i];
            let q = five[(i + 1) % 5];
            p.x * q.y - q.x * p.y
        })
        .sum();
    let clockwise = shoelace > 0.0;
    let side = if clockwise { 1.0 } else { -1.0 };

    let rotation = if tilt < 1e-6 {
        // Frontal circle: nothing to correct.
        Matrix3::identity()
    } else {
        let centre = Vector2::new(cx, cy);
        let vanish = centre + minor_dir * side * (focal / tilt.tan());
        let rho = vanish.x.atan2(vanish.y);
        let delta = focal.atan2(vanish.norm()) * blend;
        rot_x(delta) * rot_z_align(rho)
    };
    debug!(tilt_deg = tilt.to_degrees(), clockwise, "fitted control-point circle");

    let rotation = if points.len() == 7 {
        level_rotation(rotation, points[5], points[6], focal)? * rotation
    } else {
        rotation
    };
    Some((rotation, focal))
}

/// Rotation about the x axis; maps (0, r, f) with tan(delta) = f/r into
/// the image plane.
fn rot_x(delta: f64) -> Matrix3<f64> {
    let (s, c) = delta.sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, s, 0.0, -s, c)
}

fn rot_y(beta: f64) -> Matrix3<f64> {
    let (s, c) = beta.sin_cos();
    Matrix3::new(c, 0.0, -s, 0.0, 1.0, 0.0, s, 0.0, c)
}

/// Rotation about the view axis taking the direction at angle `gamma`
/// (from the +x axis) onto +x.
fn rot_z(gamma: f64) -> Matrix3<f64> {
    let (s, c) = gamma.sin_cos();
    Matrix3::new(c, s, 0.0, -s, c, 0.0, 0.0, 0.0, 1.0)
}

/// In-plane rotation taking the direction at angle `alpha` from the +y
/// axis onto +y.
fn rot_z_align(alpha: f64) -> Matrix3<f64> {
    let (s, c) = alpha.sin_cos();
    Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
}
