/// Linear interpolation through two points.
///
/// Returns `None` when the two `x` values coincide.
#[inline]
pub fn linear_interpolate(x: &[f64; 2], y: &[f64; 2], xi: f64) -> Option<f64> {
    let dx = x[1] - x[0];
    if dx.abs() < f64::EPSILON {
        return None;
    }
    let t = (xi - x[0]) / dx;
    Some(y[0] + t * (y[1] - y[0]))
}
