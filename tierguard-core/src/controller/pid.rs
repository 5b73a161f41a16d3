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

/// PID gains and the anti-windup bound on the integral term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integral_limit: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.2,
            kd: 0.1,
            integral_limit: 5_000.0,
        }
    }
}

/// Textbook PID on a latency error, in milliseconds.
#[derive(Debug, Clone)]
pub struct Pid {
    gains: PidGains,
    integral: f64,
    last_error: Option<f64>,
}

impl Pid {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            last_error: None,
        }
    }

    /// Advance by `dt` seconds and return the raw correction
    /// `Kp·e + Ki·I + Kd·D`.
    pub fn update(&mut self, error: f64, dt: f64) -> f64 {
        let limit = self.gains.integral_limit;
        self.integral = (self.integral + error * dt).clamp(-limit, limit);

        let derivative = match self.last_error {
            Some(previous) if dt > 0.0 => (error - previous) / dt,
            _ => 0.0,
        };
        self.last_error = Some(error);

        self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative
    }

    /// Forget the integral and the previous error.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_error(&self) -> f64 {
        self.last_error.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_update_has_no_derivative() {
        let mut pid = Pid::new(PidGains::default());
        // 1.0 * 250 + 0.2 * 250
        assert_eq!(pid.update(250.0, 1.0), 300.0);
        assert_eq!(pid.integral(), 250.0);
    }

    #[test]
    fn test_derivative_tracks_error_change() {
        let gains = PidGains {
            kp: 0.0,
            ki: 0.0,
            kd: 1.0,
            integral_limit: 5_000.0,
        };
        let mut pid = Pid::new(gains);
        pid.update(100.0, 1.0);
        assert_eq!(pid.update(50.0, 0.5), -100.0);
    }

    #[test]
    fn test_integral_is_clamped() {
        let mut pid = Pid::new(PidGains::default());
        for _ in 0..100 {
            pid.update(1_000.0, 1.0);
        }
        assert_eq!(pid.integral(), 5_000.0);

        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.last_error(), 0.0);
    }

    #[test]
    fn test_reset_drops_derivative_history() {
        let mut pid = Pid::new(PidGains::default());
        pid.update(400.0, 1.0);
        pid.reset();
        // same as a first update: no derivative kick from the old error
        assert_eq!(pid.update(250.0, 1.0), 300.0);
    }
}
