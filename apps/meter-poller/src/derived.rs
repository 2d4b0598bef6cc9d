/// Magnus-formula constants (see https://en.wikipedia.org/wiki/Dew_point).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DewpointConstants {
    pub b: f64,
    pub c: f64,
}

impl Default for DewpointConstants {
    fn default() -> Self {
        Self { b: 17.27, c: 237.7 }
    }
}

impl DewpointConstants {
    pub fn gamma(&self, temp_c: f64, rh_percent: f64) -> f64 {
        (rh_percent / 100.0).ln() + (self.b * temp_c) / (self.c + temp_c)
    }

    /// Dewpoint in Celsius. Only defined for `0 < rh <= 100` and `temp_c > -c`;
    /// check with [`DewpointConstants::valid_input`] first.
    pub fn dewpoint_c(&self, temp_c: f64, rh_percent: f64) -> f64 {
        let gamma = self.gamma(temp_c, rh_percent);
        (self.c * gamma) / (self.b - gamma)
    }

    pub fn valid_input(&self, temp_c: f64, rh_percent: f64) -> bool {
        temp_c.is_finite()
            && rh_percent.is_finite()
            && rh_percent > 0.0
            && rh_percent <= 100.0
            && temp_c > -self.c
    }
}

pub fn celsius_to_fahrenheit(temp_c: f64) -> f64 {
    temp_c * (9.0 / 5.0) + 32.0
}
