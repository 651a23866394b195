//! Fixture crate for exercising volley's cargo framework adapter.
//!
//! Point a `volley.toml` at this directory with `type = "cargo"` and the
//! runner will discover and execute the tests below via cargo nextest.

pub fn add(a: i64, b: i64) -> i64 {
    a + b
}

pub fn mul(a: i64, b: i64) -> i64 {
    a * b
}

pub fn clamp_percent(value: i64) -> i64 {
    value.clamp(0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds() {
        assert_eq!(add(2, 3), 5);
    }

    #[test]
    fn adds_negative() {
        assert_eq!(add(2, -3), -1);
    }

    #[test]
    fn multiplies() {
        assert_eq!(mul(4, 5), 20);
    }

    #[test]
    fn clamps_low_and_high() {
        assert_eq!(clamp_percent(-5), 0);
        assert_eq!(clamp_percent(150), 100);
        assert_eq!(clamp_percent(42), 42);
    }

    #[test]
    #[ignore = "intentionally failing, run with include_ignored to see a failure"]
    fn always_fails() {
        assert_eq!(add(1, 1), 3);
    }
}
