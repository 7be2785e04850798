//! Quadrature rules for the reference cube `[0, 1]^d`.
//!
//! The transfer operators only ever integrate products of polynomial basis
//! functions on tensor-product reference cells, so this module provides
//! Gauss-Legendre rules of a requested polynomial exactness, tensorized over
//! the reference dimension.
use crate::space::ReferenceGeometry;
use nalgebra::{convert, RealField};
use serde::{Deserialize, Serialize};

/// Recurrence relation for Legendre polynomials.
///
/// Note: the derivative formula is not defined at `|x| == 1`, so it is only
/// suitable for evaluation in the open interval `(-1, 1)`.
#[derive(Debug, Default)]
struct LegendreRecurrence {
    n: usize,
    x: f64,
    // The current value, i.e. p_n(x)
    p1: f64,
    // The previous value in the recurrence, i.e. p_{n - 1}(x)
    p2: f64,
}

impl LegendreRecurrence {
    fn evaluate(n: usize, x: f64) -> Self {
        // m P_m(x) = (2m - 1) x P_{m - 1}(x) - (m - 1) P_{m - 2}(x)
        let mut p1 = 1.0;
        let mut p2 = 0.0;
        let mut p3;
        for m in 1..=n {
            let m = m as f64;
            p3 = p2;
            p2 = p1;
            p1 = ((2.0 * m - 1.0) * x * p2 - (m - 1.0) * p3) / m;
        }
        Self { n, x, p1, p2 }
    }

    fn value_and_derivative(&self) -> (f64, f64) {
        let Self { n, x, p1, p2 } = &self;
        let n = *n as f64;
        // dp_n/dx (x) = n (x p_n(x) - p_{n - 1}(x)) / (x^2 - 1)
        (*p1, n * (x * p1 - p2) / (x * x - 1.0))
    }
}

/// Gauss-Legendre points and weights on `[-1, 1]` with `n` points.
///
/// The rule integrates polynomials of order up to `2n - 1` exactly.
fn gauss_points_and_weights(n: usize) -> (Vec<f64>, Vec<f64>) {
    assert!(n > 0, "number of points must be positive");

    let m = (n + 1) / 2;
    let mut points = Vec::with_capacity(n);
    let mut weights = Vec::with_capacity(n);

    // Only find the first m roots; the rest follow by symmetry.
    for i in 0..m {
        // A fairly accurate initial guess, then Newton's method
        let mut x = (std::f64::consts::PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let (mut p, mut dp) = LegendreRecurrence::evaluate(n, x).value_and_derivative();
        loop {
            let dx = -p / dp;
            x += dx;
            let (p_new, dp_new) = LegendreRecurrence::evaluate(n, x).value_and_derivative();
            p = p_new;
            dp = dp_new;
            if dx.abs() <= 1e-15 {
                break;
            }
        }

        // With the root known, the weight is given by a standard formula
        let w = 2.0 / ((1.0 - x * x) * dp * dp);
        points.push(x);
        weights.push(w);
    }

    for i in m..n {
        let mirror = n - i - 1;
        points.push(-points[mirror]);
        weights.push(weights[mirror]);
    }

    (points, weights)
}

/// A quadrature rule on the reference cube `[0, 1]^d`.
///
/// Points are stored flattened, `dim` coordinates per point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuadratureRule<T> {
    dim: usize,
    weights: Vec<T>,
    points: Vec<T>,
}

impl<T: RealField + Copy> QuadratureRule<T> {
    /// The 1D Gauss-Legendre rule on `[0, 1]` that integrates polynomials of
    /// the given order exactly.
    pub fn gauss_1d(order: usize) -> Self {
        let n = order / 2 + 1;
        let (points, weights) = gauss_points_and_weights(n);
        // Map from [-1, 1] to [0, 1]
        let points = points.iter().map(|x| convert((x + 1.0) / 2.0)).collect();
        let weights = weights.iter().map(|w| convert(w / 2.0)).collect();
        Self {
            dim: 1,
            weights,
            points,
        }
    }

    /// The tensor-product Gauss-Legendre rule on the reference cell of the
    /// given geometry that integrates polynomials of the given total order
    /// in each variable exactly.
    pub fn gauss(geometry: ReferenceGeometry, order: usize) -> Self {
        let rule_1d = Self::gauss_1d(order);
        let d = geometry.dim();
        if d == 1 {
            return rule_1d;
        }

        let n = rule_1d.num_points();
        let mut weights = Vec::with_capacity(n.pow(d as u32));
        let mut points = Vec::with_capacity(d * n.pow(d as u32));
        match d {
            2 => {
                for (wy, y) in rule_1d.iter() {
                    for (wx, x) in rule_1d.iter() {
                        weights.push(*wy * *wx);
                        points.extend_from_slice(&[x[0], y[0]]);
                    }
                }
            }
            3 => {
                for (wz, z) in rule_1d.iter() {
                    for (wy, y) in rule_1d.iter() {
                        for (wx, x) in rule_1d.iter() {
                            weights.push(*wz * *wy * *wx);
                            points.extend_from_slice(&[x[0], y[0], z[0]]);
                        }
                    }
                }
            }
            _ => unreachable!("reference geometries are at most three-dimensional"),
        }
        Self {
            dim: d,
            weights,
            points,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_points(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[T] {
        &self.weights
    }

    /// The coordinates of quadrature point `i`.
    pub fn point(&self, i: usize) -> &[T] {
        &self.points[i * self.dim..(i + 1) * self.dim]
    }

    /// Iterates over `(weight, point)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&T, &[T])> {
        self.weights.iter().zip(self.points.chunks_exact(self.dim))
    }
}
