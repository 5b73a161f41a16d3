// Copyright 2025 Tierguard Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

/// Exponentially weighted moving average.
///
/// `value ← α·sample + (1−α)·value`; the first sample initializes the value.
#[derive(Debug, Clone, PartialEq)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            value: None,
        }
    }

    /// Fold in one sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(current) => self.alpha * sample + (1.0 - self.alpha) * current,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    /// Drop the smoothed value; the next sample initializes it again.
    pub fn reset(&mut self) {
        self.value = None;
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_initializes() {
        let mut ewma = Ewma::new(0.3);
        assert_eq!(ewma.value(), None);
        assert_eq!(ewma.update(500.0), 500.0);
    }

    #[test]
    fn test_smoothing() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        assert_eq!(ewma.update(200.0), 150.0);
        assert_eq!(ewma.update(150.0), 150.0);
    }

    #[test]
    fn test_alpha_is_clamped() {
        assert_eq!(Ewma::new(3.0).alpha(), 1.0);
        assert!(Ewma::new(-1.0).alpha() > 0.0);
    }
}
