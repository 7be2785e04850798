use bifrost::cg::{ConjugateGradient, JacobiPreconditioner};
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut};
use nalgebra_sparse::CsrMatrix;

fn tridiagonal(n: usize) -> CsrMatrix<f64> {
    let mut dense = DMatrix::zeros(n, n);
    for i in 0..n {
        dense[(i, i)] = 2.0;
        if i + 1 < n {
            dense[(i, i + 1)] = -1.0;
            dense[(i + 1, i)] = -1.0;
        }
    }
    CsrMatrix::from(&dense)
}

#[test]
fn solves_spd_system_to_tolerance() {
    let n = 20;
    let a = tridiagonal(n);
    let preconditioner = JacobiPreconditioner::from_csr(&a);
    let b = DVector::from_fn(n, |i, _| (i as f64).sin());

    let mut cg = ConjugateGradient::new();
    let mut x = DVector::zeros(n);
    let summary = cg
        .solve(&a, &preconditioner, DVectorView::from(&b), DVectorViewMut::from(&mut x))
        .unwrap();
    assert!(summary.converged);
    assert!(summary.iterations <= 2 * n);

    let mut residual = DVector::zeros(n);
    bifrost::operators::csr_apply(DVectorViewMut::from(&mut residual), &a, DVectorView::from(&x));
    assert_matrix_eq!(residual, b, comp = abs, tol = 1e-10);
}

#[test]
fn zero_right_hand_side_returns_zero() {
    let a = tridiagonal(5);
    let preconditioner = JacobiPreconditioner::from_csr(&a);
    let b = DVector::zeros(5);
    let mut x = DVector::from_element(5, 3.0);

    let mut cg = ConjugateGradient::new();
    let summary = cg
        .solve(&a, &preconditioner, DVectorView::from(&b), DVectorViewMut::from(&mut x))
        .unwrap();
    assert!(summary.converged);
    assert_eq!(summary.iterations, 0);
    assert_matrix_eq!(x, DVector::<f64>::zeros(5), comp = abs, tol = 0.0);
}

#[test]
fn exact_preconditioner_converges_immediately() {
    // For a diagonal operator the Jacobi preconditioner is exact, so a
    // single update suffices.
    let diagonal = CsrMatrix::from(&DMatrix::from_diagonal(&DVector::from_column_slice(&[
        4.0, 9.0, 16.0,
    ])));
    let preconditioner = JacobiPreconditioner::from_csr(&diagonal);
    let b = DVector::from_column_slice(&[1.0, 2.0, 3.0]);
    let mut x = DVector::zeros(3);

    let mut cg = ConjugateGradient::new();
    let summary = cg
        .solve(
            &diagonal,
            &preconditioner,
            DVectorView::from(&b),
            DVectorViewMut::from(&mut x),
        )
        .unwrap();
    assert!(summary.converged);
    assert!(summary.iterations <= 2);

    let expected = DVector::from_column_slice(&[0.25, 2.0 / 9.0, 3.0 / 16.0]);
    assert_matrix_eq!(x, expected, comp = abs, tol = 1e-13);
}

#[test]
fn iteration_cap_returns_best_effort_iterate() {
    let n = 50;
    let a = tridiagonal(n);
    let preconditioner = JacobiPreconditioner::from_csr(&a);
    let b = DVector::from_element(n, 1.0);
    let mut x = DVector::zeros(n);

    let mut cg = ConjugateGradient::new();
    cg.set_max_iter(2);
    let summary = cg
        .solve(&a, &preconditioner, DVectorView::from(&b), DVectorViewMut::from(&mut x))
        .unwrap();
    assert!(!summary.converged);
    assert_eq!(summary.iterations, 2);
    // The iterate is not the solution, but it is not the zero guess either
    assert!(x.norm() > 0.0);
}
