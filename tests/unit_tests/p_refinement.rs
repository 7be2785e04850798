use crate::unit_tests::{apply, apply_transpose};
use bifrost::operators::Operator;
use bifrost::space::{Continuity, TransferSpace};
use bifrost::transfer::p_refinement::{PRefinementOperator, TensorPRefinementOperator};
use bifrost::TransferError;
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};
use util::{QuadLagrangeSpace, SegmentLagrangeSpace};

#[test]
fn generic_path_interpolates_into_the_higher_order_space() {
    let low = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous);
    let high = SegmentLagrangeSpace::uniform(2, 2, Continuity::Continuous);
    let operator = PRefinementOperator::new(&low, &high);

    // A P1 function is reproduced exactly at the P2 nodes.
    let x = low.interpolate(|x| 7.0 * x - 2.0);
    let y = apply(&operator, &x);
    assert_matrix_eq!(y, high.interpolate(|x| 7.0 * x - 2.0), comp = abs, tol = 1e-13);
}

// The operator's explicit matrix form, with shared high-order DOF rows
// written consistently by every element that touches them.
fn dense_transfer_matrix(
    low: &SegmentLagrangeSpace,
    high: &SegmentLagrangeSpace,
) -> DMatrix<f64> {
    let d = 1;
    let ndof_low = low.element_dof_count(0);
    let ndof_high = high.element_dof_count(0);
    let mut nodes = vec![0.0; ndof_high * d];
    let mut shape = vec![0.0; ndof_low];
    let mut dofs_low = vec![0; ndof_low];
    let mut dofs_high = vec![0; ndof_high];

    let mut matrix = DMatrix::zeros(high.num_dofs(), low.num_dofs());
    for element in 0..high.num_elements() {
        high.populate_element_nodes(&mut nodes, element);
        low.populate_element_dofs(&mut dofs_low, element);
        high.populate_element_dofs(&mut dofs_high, element);
        for i in 0..ndof_high {
            low.populate_element_basis(element, &mut shape, &nodes[i * d..(i + 1) * d]);
            for j in 0..ndof_low {
                matrix[(dofs_high[i], dofs_low[j])] = shape[j];
            }
        }
    }
    matrix
}

#[test]
fn generic_transpose_matches_the_explicit_matrix_transpose() {
    let low = SegmentLagrangeSpace::uniform(3, 1, Continuity::Continuous);
    let high = SegmentLagrangeSpace::uniform(3, 3, Continuity::Continuous);
    let operator = PRefinementOperator::new(&low, &high);
    let matrix = dense_transfer_matrix(&low, &high);

    let x = high.interpolate(|x| (1.0 + x).powi(3));
    let y = apply_transpose(&operator, &x);
    assert_matrix_eq!(y, matrix.transpose() * &x, comp = abs, tol = 1e-12);

    // In particular, a constant-one input accumulates the correct global
    // column sums with no shared DOF counted twice.
    let ones = DVector::from_element(operator.nrows(), 1.0);
    let column_sums = apply_transpose(&operator, &ones);
    assert_matrix_eq!(
        column_sums,
        matrix.transpose() * &ones,
        comp = abs,
        tol = 1e-12
    );
}

#[test]
fn tensor_path_agrees_with_the_generic_path_in_1d() {
    let low = SegmentLagrangeSpace::uniform(4, 1, Continuity::Continuous);
    let high = SegmentLagrangeSpace::uniform(4, 3, Continuity::Continuous);
    let generic = PRefinementOperator::new(&low, &high);
    let tensor = TensorPRefinementOperator::try_new(&low, &high).unwrap();

    let x = low.interpolate(|x| (2.0 * x - 0.3).sin());
    assert_matrix_eq!(apply(&generic, &x), apply(&tensor, &x), comp = abs, tol = 1e-13);

    let u = high.interpolate(|x| x.exp());
    assert_matrix_eq!(
        apply_transpose(&generic, &u),
        apply_transpose(&tensor, &u),
        comp = abs,
        tol = 1e-13
    );
}

#[test]
fn tensor_path_agrees_with_the_generic_path_in_2d() {
    let low = QuadLagrangeSpace::uniform(2, 2, 1, Continuity::Continuous);
    let high = QuadLagrangeSpace::uniform(2, 2, 2, Continuity::Continuous);
    let generic = PRefinementOperator::new(&low, &high);
    let tensor = TensorPRefinementOperator::try_new(&low, &high).unwrap();

    let x = low.interpolate(|x, y| x * (1.0 - y) + 0.5 * y);
    assert_matrix_eq!(apply(&generic, &x), apply(&tensor, &x), comp = abs, tol = 1e-13);

    let u = high.interpolate(|x, y| (x + 2.0 * y).cos());
    assert_matrix_eq!(
        apply_transpose(&generic, &u),
        apply_transpose(&tensor, &u),
        comp = abs,
        tol = 1e-13
    );
}

#[test]
fn tensor_path_is_exact_on_low_order_functions_in_2d() {
    let low = QuadLagrangeSpace::uniform(2, 1, 1, Continuity::Continuous);
    let high = QuadLagrangeSpace::uniform(2, 1, 3, Continuity::Continuous);
    let tensor = TensorPRefinementOperator::try_new(&low, &high).unwrap();

    let f = |x: f64, y: f64| 1.0 + x - 2.0 * y;
    let y = apply(&tensor, &low.interpolate(f));
    assert_matrix_eq!(y, high.interpolate(f), comp = abs, tol = 1e-12);
}

#[test]
fn tensor_path_works_for_discontinuous_high_order_spaces() {
    let low = SegmentLagrangeSpace::uniform(3, 1, Continuity::Discontinuous);
    let high = SegmentLagrangeSpace::uniform(3, 2, Continuity::Discontinuous);
    let generic = PRefinementOperator::new(&low, &high);
    let tensor = TensorPRefinementOperator::try_new(&low, &high).unwrap();

    let x = low.interpolate(|x| 1.0 - 3.0 * x);
    assert_matrix_eq!(apply(&generic, &x), apply(&tensor, &x), comp = abs, tol = 1e-13);
}

#[test]
fn tensor_path_rejects_vector_valued_spaces() {
    let low = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous).with_vdim(2);
    let high = SegmentLagrangeSpace::uniform(2, 2, Continuity::Continuous).with_vdim(2);
    let result = TensorPRefinementOperator::try_new(&low, &high);
    assert!(matches!(
        result,
        Err(TransferError::UnsupportedConfiguration { .. })
    ));
}
