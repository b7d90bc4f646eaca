//! Transversal chromatic aberration kernels.
//!
//! Subpixel kernels receive one (x, y) pair per channel in R, G, B order.
//! Green is the reference channel and is never touched; red and blue carry
//! independent coefficient sets. The forward direction evaluates the model
//! (where to sample the fringed source channel for a clean output pixel);
//! the inverse simulates the fringing on a clean image.

use crate::lens::TcaModel;

use super::OUT_OF_BOUNDS;

const NEWTON_ITERATIONS: u32 = 6;
const NEWTON_EPS: f64 = 1e-6;

/// Run the TCA model over an interleaved R/G/B coordinate buffer.
pub(crate) fn apply(model: TcaModel, terms: &[f64; 12], inverse: bool, focal: f64, io: &mut [f32]) {
    match (model, inverse) {
        (TcaModel::Linear, false) => scale_channels(io, terms[0], terms[1]),
        (TcaModel::Linear, true) => scale_channels(io, 1.0 / terms[0], 1.0 / terms[1]),
        (TcaModel::Poly3, false) => poly3_forward(terms, io),
        (TcaModel::Poly3, true) => poly3_inverse(terms, io),
        (TcaModel::Acm, false) => acm_forward(terms, focal, io),
        // No inverse for the Adobe model; installation refuses it.
        (TcaModel::Acm, true) | (TcaModel::None, _) => {
            unreachable!("no kernel for this TCA model/direction")
        }
    }
}

/// Multiply the red and blue radii by constant factors.
fn scale_channels(io: &mut [f32], kr: f64, kb: f64) {
    for px in io.chunks_exact_mut(6) {
        px[0] = (px[0] as f64 * kr) as f32;
        px[1] = (px[1] as f64 * kr) as f32;
        px[4] = (px[4] as f64 * kb) as f32;
        px[5] = (px[5] as f64 * kb) as f32;
    }
}

/// Per-channel cubic scale: rd = ru * (b * ru^2 + c * ru + v).
fn poly3_forward(terms: &[f64; 12], io: &mut [f32]) {
    let (vr, vb) = (terms[0], terms[1]);
    let (cr, cb) = (terms[2], terms[3]);
    let (br, bb) = (terms[4], terms[5]);
    for px in io.chunks_exact_mut(6) {
        let scale = |x: f64, y: f64, b: f64, c: f64, v: f64| {
            let r2 = x * x + y * y;
            b * r2 + c * r2.sqrt() + v
        };
        let sr = scale(px[0] as f64, px[1] as f64, br, cr, vr);
        px[0] = (px[0] as f64 * sr) as f32;
        px[1] = (px[1] as f64 * sr) as f32;
        let sb = scale(px[4] as f64, px[5] as f64, bb, cb, vb);
        px[4] = (px[4] as f64 * sb) as f32;
        px[5] = (px[5] as f64 * sb) as f32;
    }
}

/// Invert the per-channel cubic by Newton's method on
/// b * ru^3 + c * ru^2 + v * ru = rd.
fn poly3_inverse(terms: &[f64; 12], io: &mut [f32]) {
    let channel = |px: &mut [f32], b: f64, c: f64, v: f64| {
        let x = px[0] as f64;
        let y = px[1] as f64;
        let rd = (x * x + y * y).sqrt();
        if rd == 0.0 {
            return;
        }
        let mut ru = rd;
        let mut converged = false;
        for _ in 0..NEWTON_ITERATIONS {
            let f = b * ru * ru * ru + c * ru * ru + v * ru;
            let residual = f - rd;
            if residual.abs() < NEWTON_EPS {
                converged = true;
                break;
            }
            ru -= residual / (3.0 * b * ru * ru + 2.0 * c * ru + v);
        }
        if !converged {
            let f = b * ru * ru * ru + c * ru * ru + v * ru;
            converged = (f - rd).abs() < NEWTON_EPS;
        }
        if converged && ru > 0.0 {
            let s = ru / rd;
            px[0] = (x * s) as f32;
            px[1] = (y * s) as f32;
        } else {
            px[0] = OUT_OF_BOUNDS;
            px[1] = OUT_OF_BOUNDS;
        }
    };

    let (vr, vb) = (terms[0], terms[1]);
    let (cr, cb) = (terms[2], terms[3]);
    let (br, bb) = (terms[4], terms[5]);
    for px in io.chunks_exact_mut(6) {
        channel(&mut px[0..2], br, cr, vr);
        channel(&mut px[4..6], bb, cb, vb);
    }
}

/// Adobe camera model TCA, forward only. Per-channel cubic radial plus two
/// tangential terms, all in units of the focal length, premultiplied by the
/// channel scale (alpha0 for red, beta0 for blue).
fn acm_forward(terms: &[f64; 12], focal: f64, io: &mut [f32]) {
    let channel = |px: &mut [f32], k: [f64; 6]| {
        let x = px[0] as f64 / focal;
        let y = px[1] as f64 / focal;
        let r2 = x * x + y * y;
        let radial = 1.0 + k[1] * r2 + k[2] * r2 * r2 + k[3] * r2 * r2 * r2;
        let common = 2.0 * (k[4] * y + k[5] * x);
        let xd = k[0] * (x * radial + x * common + k[5] * r2);
        let yd = k[0] * (y * radial + y * common + k[4] * r2);
        px[0] = (xd * focal) as f32;
        px[1] = (yd * focal) as f32;
    };

    let alpha = [terms[0], terms[2], terms[4], terms[6], terms[8], terms[10]];
    let beta = [terms[1], terms[3], terms[5], terms[7], terms[9], terms[11]];
    for px in io.chunks_exact_mut(6) {
        channel(&mut px[0..2], alpha);
        channel(&mut px[4..6], beta);
    }
}
