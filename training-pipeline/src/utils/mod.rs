pub mod artifacts;
pub mod resource_monitor;

/// Rounds to `places` decimals, the precision used in every reported metric.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10_f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_requested_places() {
        assert!((round_to(1.23456, 2) - 1.23).abs() < f64::EPSILON);
        assert!((round_to(2.675_01, 2) - 2.68).abs() < 1e-9);
        assert!((round_to(-0.004, 2)).abs() < f64::EPSILON);
    }
}
