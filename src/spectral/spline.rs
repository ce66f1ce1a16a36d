//! Natural cubic spline through a strictly increasing set of knots.

#[derive(Clone, Debug)]
pub struct CubicSpline {
    xs: Vec<f64>,
    ys: Vec<f64>,
    second: Vec<f64>,
}

impl CubicSpline {
    pub fn new(xs: &[f64], ys: &[f64]) -> Result<Self, crate::Error> {
        if xs.len() != ys.len() {
            return Err(crate::Error::ReferenceData(format!(
                "spline knots and values differ in length ({} vs {})",
                xs.len(),
                ys.len()
            )));
        }
        if xs.len() < 2 {
            return Err(crate::Error::ReferenceData(
                "spline needs at least two knots".to_string(),
            ));
        }
        if xs.windows(2).any(|w| w[1] <= w[0]) {
            return Err(crate::Error::ReferenceData(
                "spline knots must be strictly increasing".to_string(),
            ));
        }

        let n = xs.len();
        let mut second = vec![0.0; n];
        let mut u = vec![0.0; n];
        // Tridiagonal sweep; natural boundary leaves both ends at zero.
        for i in 1..n - 1 {
            let sig = (xs[i] - xs[i - 1]) / (xs[i + 1] - xs[i - 1]);
            let p = sig * second[i - 1] + 2.0;
            second[i] = (sig - 1.0) / p;
            let slope = (ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i])
                - (ys[i] - ys[i - 1]) / (xs[i] - xs[i - 1]);
            u[i] = (6.0 * slope / (xs[i + 1] - xs[i - 1]) - sig * u[i - 1]) / p;
        }
        second[n - 1] = 0.0;
        for k in (0..n - 1).rev() {
            second[k] = second[k] * second[k + 1] + u[k];
        }

        Ok(Self {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
            second,
        })
    }

    pub fn domain(&self) -> (f64, f64) {
        (self.xs[0], self.xs[self.xs.len() - 1])
    }

    /// Evaluates the spline; `None` outside the knot range.
    pub fn eval(&self, x: f64) -> Option<f64> {
        let (lo, hi) = self.domain();
        if x < lo || x > hi {
            return None;
        }
        let hi_idx = match self.xs.partition_point(|k| *k < x) {
            0 => 1,
            i => i,
        };
        let lo_idx = hi_idx - 1;
        let h = self.xs[hi_idx] - self.xs[lo_idx];
        let a = (self.xs[hi_idx] - x) / h;
        let b = (x - self.xs[lo_idx]) / h;
        Some(
            a * self.ys[lo_idx]
                + b * self.ys[hi_idx]
                + ((a * a * a - a) * self.second[lo_idx] + (b * b * b - b) * self.second[hi_idx]) * (h * h)
                    / 6.0,
        )
    }
}
