use crate::unit_tests::{apply, apply_transpose};
use bifrost::operators::{Operator, SparseOperator};
use bifrost::space::Continuity;
use bifrost::transfer::interpolation::{
    mass_kind_for, DerefinementOperator, MassKind, RefinementOperator,
};
use bifrost::space::MapType;
use bifrost::TransferError;
use matrixcompare::assert_matrix_eq;
use nalgebra::DVector;
use util::{uniform_segment_refinement, SegmentLagrangeSpace};

fn nested_p1_pair() -> (SegmentLagrangeSpace, SegmentLagrangeSpace) {
    let coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous);
    let fine = SegmentLagrangeSpace::uniform(4, 1, Continuity::Continuous);
    (coarse, fine)
}

#[test]
fn refinement_interpolates_nested_functions_exactly() {
    let (coarse, fine) = nested_p1_pair();
    let transforms = uniform_segment_refinement(2, 2);
    let forward = RefinementOperator::new(&coarse, &fine, &transforms);

    let x = coarse.interpolate(|x| 2.0 * x + 1.0);
    let y = apply(&forward, &x);
    assert_matrix_eq!(y, fine.interpolate(|x| 2.0 * x + 1.0), comp = abs, tol = 1e-13);
}

#[test]
fn refinement_is_exact_for_higher_degree_nested_bases() {
    let coarse = SegmentLagrangeSpace::uniform(1, 2, Continuity::Continuous);
    let fine = SegmentLagrangeSpace::uniform(2, 2, Continuity::Continuous);
    let transforms = uniform_segment_refinement(1, 2);
    let forward = RefinementOperator::new(&coarse, &fine, &transforms);

    let quadratic = |x: f64| 3.0 * x * x - x + 0.5;
    let y = apply(&forward, &coarse.interpolate(quadratic));
    assert_matrix_eq!(y, fine.interpolate(quadratic), comp = abs, tol = 1e-12);
}

#[test]
fn assembled_form_matches_the_action_form() {
    let (coarse, fine) = nested_p1_pair();
    let transforms = uniform_segment_refinement(2, 2);
    let forward = RefinementOperator::new(&coarse, &fine, &transforms);
    let assembled = SparseOperator::new(forward.assemble(), 1);

    let x = coarse.interpolate(|x| x * x + 0.25);
    assert_matrix_eq!(apply(&forward, &x), apply(&assembled, &x), comp = abs, tol = 1e-14);

    let u = fine.interpolate(|x| 1.0 - x);
    assert_matrix_eq!(
        apply_transpose(&forward, &u),
        apply_transpose(&assembled, &u),
        comp = abs,
        tol = 1e-14
    );
}

#[test]
fn transpose_counts_shared_fine_dofs_once() {
    let (coarse, fine) = nested_p1_pair();
    let transforms = uniform_segment_refinement(2, 2);
    let forward = RefinementOperator::new(&coarse, &fine, &transforms);
    let assembled = forward.assemble();

    let ones = DVector::from_element(forward.nrows(), 1.0);
    let y = apply_transpose(&forward, &ones);

    // Each fine DOF row of the assembled matrix appears exactly once in
    // the transpose accumulation.
    let mut expected = DVector::zeros(forward.ncols());
    for (_, j, v) in assembled.triplet_iter() {
        expected[j] += v;
    }
    assert_matrix_eq!(y, expected, comp = abs, tol = 1e-13);
}

#[test]
fn derefinement_left_inverts_refinement() {
    let (coarse, fine) = nested_p1_pair();
    let transforms = uniform_segment_refinement(2, 2);
    let forward = RefinementOperator::new(&coarse, &fine, &transforms);
    let backward =
        DerefinementOperator::new(&coarse, &fine, &transforms, MassKind::Scalar).unwrap();

    // The backward operator is a left-inverse of the forward operator for
    // every coarse input, not just smooth ones.
    let x = DVector::from_column_slice(&[1.0, -2.0, 3.0]);
    let recovered = apply(&backward, &apply(&forward, &x));
    assert_matrix_eq!(recovered, x, comp = abs, tol = 1e-12);
}

#[test]
fn derefinement_projects_fine_only_detail_away() {
    let (coarse, fine) = nested_p1_pair();
    let transforms = uniform_segment_refinement(2, 2);
    let backward =
        DerefinementOperator::new(&coarse, &fine, &transforms, MassKind::Scalar).unwrap();

    // A coarse-representable fine function comes back as its coarse DOFs.
    let y = fine.interpolate(|x| 4.0 * x);
    let recovered = apply(&backward, &y);
    assert_matrix_eq!(
        recovered,
        SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous).interpolate(|x| 4.0 * x),
        comp = abs,
        tol = 1e-12
    );
}

#[test]
fn mass_kind_selection_follows_the_field_type() {
    assert_eq!(mass_kind_for(MapType::Value), MassKind::Scalar);
    assert_eq!(mass_kind_for(MapType::Integral), MassKind::Scalar);
    assert_eq!(mass_kind_for(MapType::HDiv), MassKind::VectorField);
    assert_eq!(mass_kind_for(MapType::HCurl), MassKind::VectorField);
}

#[test]
fn vector_mass_without_vector_basis_is_a_configuration_error() {
    let (coarse, fine) = nested_p1_pair();
    let transforms = uniform_segment_refinement(2, 2);
    let result = DerefinementOperator::new(&coarse, &fine, &transforms, MassKind::VectorField);
    assert!(matches!(
        result,
        Err(TransferError::UnsupportedConfiguration { .. })
    ));
}
