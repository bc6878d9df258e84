//! Grid value generators for creating synthetic weather-like data.
//!
//! These generators create predictable, verifiable patterns usable as
//! per-cell functions in the [`crate::DatasetBuilder`].

/// Temperature-like gradient in Kelvin, cold top-left to warm bottom-right.
pub fn temperature_kelvin(nx: usize, ny: usize) -> impl Fn(usize, usize, usize) -> f32 {
    move |i, j, _t| {
        let x_factor = i as f32 / nx.max(1) as f32;
        let y_factor = j as f32 / ny.max(1) as f32;
        // 283K (10C) to 313K (40C)
        283.0 + x_factor * 15.0 + y_factor * 15.0
    }
}

/// Dew point a few degrees under the temperature gradient.
pub fn dew_point_kelvin(nx: usize, ny: usize) -> impl Fn(usize, usize, usize) -> f32 {
    let temp = temperature_kelvin(nx, ny);
    move |i, j, t| temp(i, j, t) - 5.0
}

/// Accumulating precipitation: grows by `rate` mm per hourly step.
///
/// The hourly difference of this field is exactly `rate` everywhere, which
/// makes temporal-transform assertions trivial.
pub fn accumulating_precip(rate: f32) -> impl Fn(usize, usize, usize) -> f32 {
    move |_i, _j, t| rate * (t + 1) as f32
}

/// Constant field.
pub fn constant(value: f32) -> impl Fn(usize, usize, usize) -> f32 {
    move |_i, _j, _t| value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_gradient_bounds() {
        let f = temperature_kelvin(10, 10);
        assert!(f(0, 0, 0) >= 283.0);
        assert!(f(9, 9, 0) <= 313.0);
        assert!(f(9, 9, 0) > f(0, 0, 0));
    }

    #[test]
    fn test_accumulating_precip_difference() {
        let f = accumulating_precip(0.5);
        assert_eq!(f(3, 3, 1) - f(3, 3, 0), 0.5);
    }
}
