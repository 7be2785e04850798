use crate::unit_tests::{apply, apply_transpose};
use bifrost::operators::Operator;
use bifrost::refinement::ElementPatchMap;
use bifrost::space::Continuity;
use bifrost::transfer::l2_conforming::{lumped_mass_inverse, ConformingL2Projection};
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use nalgebra::DVector;
use util::{uniform_segment_refinement, ConstrainedSegmentSpace, SegmentLagrangeSpace};

// The conforming scenario: two coarse P1 elements on [0, 1] and their
// uniform refinement into four fine P1 elements.
fn conforming_pair() -> (SegmentLagrangeSpace, SegmentLagrangeSpace) {
    let coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous);
    let fine = SegmentLagrangeSpace::uniform(4, 1, Continuity::Continuous);
    (coarse, fine)
}

#[test]
fn lumped_mass_inverse_is_the_exact_reciprocal() {
    let fine = SegmentLagrangeSpace::uniform(4, 1, Continuity::Continuous);
    let transforms = uniform_segment_refinement(2, 2);
    let patch = ElementPatchMap::from_transforms(2, &transforms);

    let ml_inv = lumped_mass_inverse(&fine, &patch);

    // The accumulated lumped mass of a uniform P1 mesh with h = 1/4 is h/2
    // at the boundary DOFs and h at the shared interior DOFs.
    let h = 0.25;
    let expected_mass = [h / 2.0, h, h, h, h / 2.0];
    for (dof, &mass) in expected_mass.iter().enumerate() {
        assert_scalar_eq!(ml_inv[dof] * mass, 1.0, comp = abs, tol = 1e-13);
    }
}

#[test]
fn restriction_preserves_constants() {
    let (coarse, fine) = conforming_pair();
    let transforms = uniform_segment_refinement(2, 2);
    let projection = ConformingL2Projection::new(&coarse, &fine, &transforms).unwrap();

    let x = DVector::from_element(3, 1.0);
    let y = apply(&projection, &x);
    assert_matrix_eq!(y, DVector::from_element(5, 1.0), comp = abs, tol = 1e-12);
}

#[test]
fn prolongate_inverts_the_lumped_restriction() {
    let (coarse, fine) = conforming_pair();
    let transforms = uniform_segment_refinement(2, 2);
    let projection = ConformingL2Projection::new(&coarse, &fine, &transforms).unwrap();

    // The fine-space restriction of a coarse function, prolongated back,
    // returns that same coarse function; the auxiliary solve must reach the
    // default tolerance within its iteration budget for this to hold.
    let x = coarse.interpolate(|x| 3.0 * x - 1.0);
    let y = apply(&projection, &x);

    let mut recovered = DVector::zeros(projection.ncols());
    projection
        .prolongate((&mut recovered).into(), (&y).into())
        .unwrap();
    assert_matrix_eq!(recovered, x, comp = abs, tol = 1e-10);
}

#[test]
fn prolongate_transpose_is_the_adjoint_of_prolongate() {
    let (coarse, fine) = conforming_pair();
    let transforms = uniform_segment_refinement(2, 2);
    let projection = ConformingL2Projection::new(&coarse, &fine, &transforms).unwrap();

    // <P x, u> == <x, Pᵀ u> for arbitrary vectors
    let x = fine.interpolate(|x| x * x);
    let u = coarse.interpolate(|x| 1.0 - x);

    let mut px = DVector::zeros(projection.ncols());
    projection.prolongate((&mut px).into(), (&x).into()).unwrap();
    let mut ptu = DVector::zeros(projection.nrows());
    projection
        .prolongate_transpose((&mut ptu).into(), (&u).into())
        .unwrap();

    assert_scalar_eq!(px.dot(&u), x.dot(&ptu), comp = abs, tol = 1e-10);
}

#[test]
fn transpose_accumulates_without_double_counting() {
    let (coarse, fine) = conforming_pair();
    let transforms = uniform_segment_refinement(2, 2);
    let projection = ConformingL2Projection::new(&coarse, &fine, &transforms).unwrap();

    let ones = DVector::from_element(projection.nrows(), 1.0);
    let y = apply_transpose(&projection, &ones);

    // Every row of R is visited exactly once, so the total equals the sum
    // of all entries of the assembled restriction.
    let entry_sum: f64 = projection
        .restriction_matrix()
        .triplet_iter()
        .map(|(_, _, v)| v)
        .sum();
    assert_scalar_eq!(y.sum(), entry_sum, comp = abs, tol = 1e-12);
}

#[test]
fn conforming_constraints_are_applied_by_triple_products() {
    // The same scenario, but both spaces present a redundant broken DOF
    // numbering with explicit conforming prolongation/restriction pairs.
    let coarse = ConstrainedSegmentSpace::uniform(2, 1);
    let fine = ConstrainedSegmentSpace::uniform(4, 1);
    let transforms = uniform_segment_refinement(2, 2);
    let projection = ConformingL2Projection::new(&coarse, &fine, &transforms).unwrap();

    // The assembled matrices act on true DOFs of both sides.
    assert_eq!(projection.restriction_matrix().nrows(), 5);
    assert_eq!(projection.restriction_matrix().ncols(), 3);
    assert_eq!(
        projection.normal_matrix().nrows(),
        projection.normal_matrix().ncols()
    );

    // Constants are preserved exactly, shared DOFs accumulated once.
    let x = DVector::from_element(projection.ncols(), 1.0);
    let y = apply(&projection, &x);
    assert_matrix_eq!(
        y,
        DVector::from_element(projection.nrows(), 1.0),
        comp = abs,
        tol = 1e-12
    );
}

#[test]
fn empty_coarse_mesh_short_circuits_to_zero_action() {
    let coarse = SegmentLagrangeSpace::uniform(0, 1, Continuity::Continuous);
    let fine = SegmentLagrangeSpace::uniform(0, 1, Continuity::Continuous);
    let transforms = uniform_segment_refinement(0, 2);
    let projection = ConformingL2Projection::new(&coarse, &fine, &transforms).unwrap();

    assert_eq!(projection.nrows(), 0);
    assert_eq!(projection.ncols(), 0);
    let mut y = DVector::zeros(0);
    projection
        .prolongate((&mut y).into(), DVector::zeros(0).column(0))
        .unwrap();
}

#[test]
fn tolerances_can_be_tightened_after_construction() {
    let (coarse, fine) = conforming_pair();
    let transforms = uniform_segment_refinement(2, 2);
    let mut projection = ConformingL2Projection::new(&coarse, &fine, &transforms).unwrap();
    projection.set_rel_tol(1e-8);
    projection.set_abs_tol(1e-8);

    let x = coarse.interpolate(|x| x);
    let y = apply(&projection, &x);
    let mut recovered = DVector::zeros(projection.ncols());
    projection
        .prolongate((&mut recovered).into(), (&y).into())
        .unwrap();
    assert_matrix_eq!(recovered, x, comp = abs, tol = 1e-6);
}
