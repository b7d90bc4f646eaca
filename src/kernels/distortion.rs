//! Distortion kernels.
//!
//! The forward direction evaluates the model (undistorted radius in,
//! distorted radius out), which is what image correction needs: for every
//! output pixel it yields the source position to sample. The inverse
//! direction, used when simulating a lens on a clean image, has no
//! algebraic form for most models and runs a short Newton iteration,
//! accurate to about 1e-6 of the normalized radius.

use crate::lens::DistortionModel;

use super::OUT_OF_BOUNDS;

/// Newton iteration count for the model inverses. Six steps with a warm
/// start at the distorted radius reach 1e-6 for all sensible coefficients.
const NEWTON_ITERATIONS: u32 = 6;
const NEWTON_EPS: f64 = 1e-6;

/// Run the distortion model over an interleaved coordinate buffer.
pub(crate) fn apply(
    model: DistortionModel,
    terms: &[f64; 5],
    inverse: bool,
    focal: f64,
    io: &mut [f32],
) {
    match (model, inverse) {
        (DistortionModel::Poly3, false) => forward_radial(io, |r2| {
            1.0 - terms[0] + terms[0] * r2
        }),
        (DistortionModel::Poly3, true) => inverse_newton(io, |r| {
            let k1 = terms[0];
            (k1 * r * r * r + (1.0 - k1) * r, 3.0 * k1 * r * r + (1.0 - k1))
        }),
        (DistortionModel::Poly5, false) => forward_radial(io, |r2| {
            1.0 + terms[0] * r2 + terms[1] * r2 * r2
        }),
        (DistortionModel::Poly5, true) => inverse_newton(io, |r| {
            let (k1, k2) = (terms[0], terms[1]);
            let r2 = r * r;
            (
                r * (1.0 + k1 * r2 + k2 * r2 * r2),
                1.0 + 3.0 * k1 * r2 + 5.0 * k2 * r2 * r2,
            )
        }),
        (DistortionModel::PtLens, false) => forward_radial(io, |r2| {
            let r = r2.sqrt();
            let (a, b, c) = (terms[0], terms[1], terms[2]);
            a * r2 * r + b * r2 + c * r + 1.0 - a - b - c
        }),
        (DistortionModel::PtLens, true) => inverse_newton(io, |r| {
            let (a, b, c) = (terms[0], terms[1], terms[2]);
            let d = 1.0 - a - b - c;
            let r2 = r * r;
            (
                r * (a * r2 * r + b * r2 + c * r + d),
                4.0 * a * r2 * r + 3.0 * b * r2 + 2.0 * c * r + d,
            )
        }),
        (DistortionModel::Acm, false) => acm_forward(terms, focal, io),
        // The Adobe model has no inverse kernel; installation refuses the
        // reverse direction before it gets here.
        (DistortionModel::Acm, true) | (DistortionModel::None, _) => {
            unreachable!("no kernel for this distortion model/direction")
        }
    }
}

/// Apply a radial scale `s(r^2)`: both coordinates are multiplied by the
/// scale evaluated at the squared input radius.
fn forward_radial(io: &mut [f32], scale: impl Fn(f64) -> f64) {
    for p in io.chunks_exact_mut(2) {
        let x = p[0] as f64;
        let y = p[1] as f64;
        let s = scale(x * x + y * y);
        p[0] = (x * s) as f32;
        p[1] = (y * s) as f32;
    }
}

/// Invert a radial model `rd = f(ru)` by Newton's method.
///
/// `eval` returns `(f(r), f'(r))`. The iteration starts at the distorted
/// radius and bails out to the sentinel when no real solution exists in
/// the neighbourhood (strong distortion beyond the model's valid range).
fn inverse_newton(io: &mut [f32], eval: impl Fn(f64) -> (f64, f64)) {
    for p in io.chunks_exact_mut(2) {
        let x = p[0] as f64;
        let y = p[1] as f64;
        let rd = (x * x + y * y).sqrt();
        if rd == 0.0 {
            continue;
        }

        let mut ru = rd;
        let mut converged = false;
        for _ in 0..NEWTON_ITERATIONS {
            let (f, df) = eval(ru);
            let residual = f - rd;
            if residual.abs() < NEWTON_EPS {
                converged = true;
                break;
            }
            ru -= residual / df;
        }
        // Accept the last step if it landed within tolerance.
        if !converged {
            let (f, _) = eval(ru);
            converged = (f - rd).abs() < NEWTON_EPS;
        }

        if converged && ru > 0.0 {
            let s = ru / rd;
            p[0] = (x * s) as f32;
            p[1] = (y * s) as f32;
        } else {
            p[0] = OUT_OF_BOUNDS;
            p[1] = OUT_OF_BOUNDS;
        }
    }
}

/// Adobe camera model, forward. Coordinates are converted into units of
/// the focal length, distorted radially plus tangentially, and converted
/// back.
fn acm_forward(terms: &[f64; 5], focal: f64, io: &mut [f32]) {
    let (k1, k2, k3, k4, k5) = (terms[0], terms[1], terms[2], terms[3], terms[4]);
    for p in io.chunks_exact_mut(2) {
        let x = p[0] as f64 / focal;
        let y = p[1] as f64 / focal;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let common = 2.0 * (k4 * y + k5 * x);
        let xd = x * radial + x * common + k5 * r2;
        let yd = y * radial + y * common + k4 * r2;
        p[0] = (xd * focal) as f32;
        p[1] = (yd * focal) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(model: DistortionModel, terms: [f64; 5], inverse: bool, x: f32, y: f32) -> (f32, f32) {
        let mut io = [x, y];
        apply(model, &terms, inverse, 1.0, &mut io);
        (io[0], io[1])
    }

    #[test]
    fn test_poly3_forward_known_value() {
        // Rd = Ru * (1 - k1 + k1 * Ru^2) at k1 = 0.1, Ru = 0.5:
        // 0.5 * (0.9 + 0.1 * 0.25) = 0.4625.
        let (x, y) = run(DistortionModel::Poly3, [0.1, 0.0, 0.0, 0.0, 0.0], false, 0.5, 0.0);
        assert!((x - 0.4625).abs() < 1e-6, "got {x}");
        assert_eq!(y, 0.0);
    }

    #[test]
    fn test_poly3_roundtrip_grid() {
        let terms = [0.08, 0.0, 0.0, 0.0, 0.0];
        for i in 0..32 {
            for j in 0..32 {
                let x = (i as f32 - 15.5) / 15.5;
                let y = (j as f32 - 15.5) / 15.5;
                let mut io = [x, y];
                apply(DistortionModel::Poly3, &terms, false, 1.0, &mut io);
                apply(DistortionModel::Poly3, &terms, true, 1.0, &mut io);
                assert!(
                    (io[0] - x).abs() < 1e-4 && (io[1] - y).abs() < 1e-4,
                    "roundtrip failed at ({x}, {y}): got ({}, {})",
                    io[0],
                    io[1],
                );
            }
        }
    }

    #[test]
    fn test_poly5_roundtrip_grid() {
        let terms = [0.05, -0.02, 0.0, 0.0, 0.0];
        for i in 0..32 {
            for j in 0..32 {
                let x = (i as f32 - 15.5) / 15.5;
                let y = (j as f32 - 15.5) / 15.5;
                let mut io = [x, y];
                apply(DistortionModel::Poly5, &terms, false, 1.0, &mut io);
                apply(DistortionModel::Poly5, &terms, true, 1.0, &mut io);
                assert!(
                    (io[0] - x).abs() < 1e-4 && (io[1] - y).abs() < 1e-4,
                    "roundtrip failed at ({x}, {y})",
                );
            }
        }
    }

    #[test]
    fn test_ptlens_roundtrip_grid() {
        let terms = [0.012, -0.035, 0.02, 0.0, 0.0];
        for i in 0..32 {
            for j in 0..32 {
                let x = (i as f32 - 15.5) / 15.5;
                let y = (j as f32 - 15.5) / 15.5;
                let mut io = [x, y];
                apply(DistortionModel::PtLens, &terms, false, 1.0, &mut io);
                apply(DistortionModel::PtLens, &terms, true, 1.0, &mut io);
                assert!(
                    (io[0] - x).abs() < 1e-4 && (io[1] - y).abs() < 1e-4,
                    "roundtrip failed at ({x}, {y})",
                );
            }
        }
    }

    #[test]
    fn test_ptlens_forward_identity_terms() {
        // All-zero a, b, c leave the polynomial at 1 - 0 = 1.
        let (x, y) = run(DistortionModel::PtLens, [0.0; 5], false, 0.3, -0.4);
        assert!((x - 0.3).abs() < 1e-7 && (y + 0.4).abs() < 1e-7);
    }

    #[test]
    fn test_acm_center_fixed_and_tangential() {
        // Pure radial ACM keeps the centre fixed.
        let (x, y) = run(DistortionModel::Acm, [0.1, 0.0, 0.0, 0.0, 0.0], false, 0.0, 0.0);
        assert_eq!((x, y), (0.0, 0.0));

        // A tangential k5 term shifts the centre: xd gains k5 * r^2.
        let mut io = [0.2f32, 0.0];
        apply(DistortionModel::Acm, &[0.0, 0.0, 0.0, 0.0, 0.01], false, 1.0, &mut io);
        let expected_x = 0.2 + 2.0 * 0.01 * 0.2 * 0.2 + 0.01 * 0.04;
        assert!((io[0] as f64 - expected_x).abs() < 1e-6, "got {}", io[0]);
    }

    #[test]
    fn test_acm_focal_units() {
        // The same point expressed at two focal settings: scaling the
        // focal by two halves the working radius, so the distortion term
        // shrinks accordingly.
        let terms = [0.1, 0.0, 0.0, 0.0, 0.0];
        let mut io1 = [0.5f32, 0.0];
        let mut io2 = [0.5f32, 0.0];
        apply(DistortionModel::Acm, &terms, false, 1.0, &mut io1);
        apply(DistortionModel::Acm, &terms, false, 2.0, &mut io2);
        // f = 1: x' = 0.5 * (1 + 0.1 * 0.25) = 0.5125
        // f = 2: x' = 2 * 0.25 * (1 + 0.1 * 0.0625) = 0.503125
        assert!((io1[0] - 0.5125).abs() < 1e-6);
        assert!((io2[0] - 0.503125).abs() < 1e-6);
    }
}
