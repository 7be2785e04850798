use bifrost::operators::Operator;
use nalgebra::DVector;

mod cg;
mod interpolation;
mod l2_broken;
mod l2_conforming;
mod p_refinement;
mod quadrature;
mod transfer;

/// Applies an operator to a freshly allocated output vector.
pub fn apply(operator: &impl Operator<f64>, x: &DVector<f64>) -> DVector<f64> {
    let mut y = DVector::zeros(operator.nrows());
    operator
        .apply((&mut y).into(), x.into())
        .expect("operator application is a test failure if it errors");
    y
}

/// Applies an operator's transpose to a freshly allocated output vector.
pub fn apply_transpose(operator: &impl Operator<f64>, x: &DVector<f64>) -> DVector<f64> {
    let mut y = DVector::zeros(operator.ncols());
    operator
        .apply_transpose((&mut y).into(), x.into())
        .expect("operator application is a test failure if it errors");
    y
}
