//! Vignetting color kernel.
//!
//! Corrects (or re-applies) the radial brightness falloff
//! `1 + k1 r^2 + k2 r^4 + k3 r^6` on a row of pixels. The kernel is generic
//! over the component type; integer components saturate at their maximum on
//! write-back while floating-point components are left unclamped.
//!
//! The role word is walked once per pixel position; a `Next` slot moves to
//! the following pixel without consuming a component, which lets Bayer rows
//! reuse the same kernel.

use crate::pixels::{ComponentRole, PixelComponent, PixelData, RoleWord};

/// Run the vignetting polynomial over one pixel row.
#[allow(clippy::too_many_arguments)]
pub(crate) fn apply(
    terms: &[f64; 3],
    coord_scale: f64,
    multiply: bool,
    x0: f32,
    y: f32,
    step: f32,
    row: PixelData<'_>,
    roles: RoleWord,
) {
    match row {
        PixelData::U8(px) => run(terms, coord_scale, multiply, x0, y, step, px, roles),
        PixelData::U16(px) => run(terms, coord_scale, multiply, x0, y, step, px, roles),
        PixelData::U32(px) => run(terms, coord_scale, multiply, x0, y, step, px, roles),
        PixelData::F32(px) => run(terms, coord_scale, multiply, x0, y, step, px, roles),
        PixelData::F64(px) => run(terms, coord_scale, multiply, x0, y, step, px, roles),
    }
}

#[allow(clippy::too_many_arguments)]
fn run<T: PixelComponent>(
    terms: &[f64; 3],
    coord_scale: f64,
    multiply: bool,
    x0: f32,
    y: f32,
    step: f32,
    px: &mut [T],
    roles: RoleWord,
) {
    let plan: Vec<ComponentRole> = roles.roles().collect();
    if plan.iter().all(|&r| r == ComponentRole::Next) {
        // Nothing consumes a component; there is no pixel to touch.
        return;
    }

    let y2 = (y as f64 * coord_scale).powi(2);
    let mut x = x0 as f64;
    let step = step as f64;

    let mut idx = 0;
    while idx < px.len() {
        let mut factor = polynomial(terms, x * coord_scale, y2, multiply);
        for role in &plan {
            if idx >= px.len() {
                break;
            }
            match role {
                ComponentRole::Intensity
                | ComponentRole::Red
                | ComponentRole::Green
                | ComponentRole::Blue => {
                    px[idx] = T::from_f64(px[idx].to_f64() * factor);
                    idx += 1;
                }
                ComponentRole::Unknown => idx += 1,
                ComponentRole::Next => {
                    x += step;
                    factor = polynomial(terms, x * coord_scale, y2, multiply);
                }
                ComponentRole::End => unreachable!("role iterator stops at End"),
            }
        }
        x += step;
    }
}

fn polynomial(terms: &[f64; 3], x: f64, y2: f64, multiply: bool) -> f64 {
    let r2 = x * x + y2;
    let c = 1.0 + terms[0] * r2 + terms[1] * r2 * r2 + terms[2] * r2 * r2 * r2;
    if multiply {
        c
    } else {
        1.0 / c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_pixel_untouched() {
        let mut px = [1000u16, 1000, 1000];
        apply(
            &[-0.3, 0.0, 0.0],
            1.0,
            false,
            0.0,
            0.0,
            0.1,
            PixelData::U16(&mut px),
            RoleWord::RGB,
        );
        assert_eq!(px, [1000, 1000, 1000]);
    }

    #[test]
    fn test_correction_brightens_corners() {
        // k1 = -0.3 darkens the corner by 1 - 0.3 * r^2; the correction
        // divides by that factor.
        let mut px = [0.7f32, 0.7, 0.7];
        apply(
            &[-0.3, 0.0, 0.0],
            1.0,
            false,
            1.0,
            0.0,
            0.1,
            PixelData::F32(&mut px),
            RoleWord::RGB,
        );
        let expected = 0.7 / (1.0 - 0.3);
        for c in px {
            assert!((c - expected).abs() < 1e-6, "got {c}, want {expected}");
        }
    }

    #[test]
    fn test_multiply_is_inverse_of_divide() {
        let mut px = [0.5f64, 0.25, 0.125];
        let orig = px;
        let terms = [-0.25, 0.04, -0.01];
        apply(&terms, 1.0, false, 0.8, -0.3, 0.05, PixelData::F64(&mut px), RoleWord::RGB);
        apply(&terms, 1.0, true, 0.8, -0.3, 0.05, PixelData::F64(&mut px), RoleWord::RGB);
        for (got, want) in px.iter().zip(orig) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_integer_clamps_float_does_not() {
        // A strong multiply factor drives the value beyond the type range.
        let terms = [3.0, 0.0, 0.0];
        let mut ints = [60000u16, 60000, 60000];
        apply(&terms, 1.0, true, 1.0, 0.0, 0.1, PixelData::U16(&mut ints), RoleWord::RGB);
        assert_eq!(ints, [u16::MAX; 3]);

        let mut floats = [60000.0f32, 60000.0, 60000.0];
        apply(&terms, 1.0, true, 1.0, 0.0, 0.1, PixelData::F32(&mut floats), RoleWord::RGB);
        assert!(floats[0] > 100_000.0);
    }

    #[test]
    fn test_rgba_skips_alpha() {
        let mut px = [0.5f32, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5];
        apply(
            &[-0.3, 0.0, 0.0],
            1.0,
            false,
            1.0,
            0.0,
            10.0, // large step: the second pixel is far out
            PixelData::F32(&mut px),
            RoleWord::RGBA,
        );
        assert!((px[0] - 0.5 / 0.7).abs() < 1e-6);
        assert_eq!(px[3], 0.5, "unknown component untouched");
        assert_ne!(px[4], 0.5, "second pixel processed at its own radius");
        assert_ne!(px[0], px[4], "radius advanced between pixels");
    }

    #[test]
    fn test_bayer_row_advances_per_component() {
        // Even Bayer row [Red, Next, Green]: one component per position,
        // the radius advancing inside the pass.
        let roles = RoleWord::new(&[
            ComponentRole::Red,
            ComponentRole::Next,
            ComponentRole::Green,
        ]);
        let mut px = [0.5f32, 0.5, 0.5, 0.5];
        apply(&[-0.3, 0.0, 0.0], 1.0, false, 0.0, 0.0, 0.5, PixelData::F32(&mut px), roles);
        // Positions are x = 0, 0.5, 1.0, 1.5.
        let at = |x: f64| 0.5 / (1.0 - 0.3 * x * x);
        let want = [at(0.0), at(0.5), at(1.0), at(1.5)];
        for (got, want) in px.iter().zip(want) {
            assert!((*got as f64 - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }
}
