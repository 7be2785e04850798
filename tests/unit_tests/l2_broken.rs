use crate::unit_tests::{apply, apply_transpose};
use bifrost::operators::Operator;
use bifrost::space::Continuity;
use bifrost::transfer::l2_broken::BrokenL2Projection;
use bifrost::TransferError;
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use nalgebra::{DMatrix, DVector};
use util::{uniform_segment_refinement, SegmentLagrangeSpace};

// The scenario from the broken projection design: two coarse P1 elements on
// [0, 1], each refined into two piecewise constant fine elements.
fn broken_p1_to_p0() -> (SegmentLagrangeSpace, SegmentLagrangeSpace) {
    let coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Discontinuous);
    let fine = SegmentLagrangeSpace::uniform(4, 0, Continuity::Discontinuous);
    (coarse, fine)
}

#[test]
fn restriction_blocks_have_full_row_rank() {
    let (coarse, fine) = broken_p1_to_p0();
    let transforms = uniform_segment_refinement(2, 2);
    let projection = BrokenL2Projection::new(&coarse, &fine, &transforms).unwrap();

    for iho in 0..2 {
        let block = projection.restriction_block(iho);
        // The patch restriction of P1 onto two P0 cells is the cell-average
        // operator; its rows are linearly independent.
        let expected = DMatrix::from_row_slice(2, 2, &[0.75, 0.25, 0.25, 0.75]);
        assert_matrix_eq!(block, expected, comp = abs, tol = 1e-13);
        let determinant = block[(0, 0)] * block[(1, 1)] - block[(0, 1)] * block[(1, 0)];
        assert!(determinant.abs() > 1e-8);
    }
}

#[test]
fn restriction_computes_cell_averages() {
    let (coarse, fine) = broken_p1_to_p0();
    let transforms = uniform_segment_refinement(2, 2);
    let projection = BrokenL2Projection::new(&coarse, &fine, &transforms).unwrap();

    let x = coarse.interpolate(|x| 1.0 + 2.0 * x);
    let y = apply(&projection, &x);

    // Projecting onto piecewise constants takes cell averages of 1 + 2x.
    let expected = DVector::from_column_slice(&[1.25, 1.75, 2.25, 2.75]);
    assert_matrix_eq!(y, expected, comp = abs, tol = 1e-13);
}

#[test]
fn prolongate_inverts_restriction_on_well_posed_patches() {
    let (coarse, fine) = broken_p1_to_p0();
    let transforms = uniform_segment_refinement(2, 2);
    let projection = BrokenL2Projection::new(&coarse, &fine, &transforms).unwrap();
    assert!(projection.has_prolongation());

    let x = coarse.interpolate(|x| 1.0 + 2.0 * x);
    let y = apply(&projection, &x);

    let mut recovered = DVector::zeros(projection.ncols());
    projection
        .prolongate((&mut recovered).into(), (&y).into())
        .unwrap();
    assert_matrix_eq!(recovered, x, comp = abs, tol = 1e-12);
}

#[test]
fn transpose_accumulates_each_fine_dof_once() {
    let (coarse, fine) = broken_p1_to_p0();
    let transforms = uniform_segment_refinement(2, 2);
    let projection = BrokenL2Projection::new(&coarse, &fine, &transforms).unwrap();

    let ones = DVector::from_element(projection.nrows(), 1.0);
    let y = apply_transpose(&projection, &ones);

    // Compare against the dense restriction assembled from the patch
    // blocks: y must equal the column sums, with no fine row visited twice.
    let mut column_sums = DVector::zeros(projection.ncols());
    for iho in 0..2 {
        let block = projection.restriction_block(iho);
        for j in 0..2 {
            column_sums[iho * 2 + j] += block.column(j).sum();
        }
    }
    assert_matrix_eq!(y, column_sums, comp = abs, tol = 1e-13);
    assert_scalar_eq!(y.sum(), 4.0, comp = abs, tol = 1e-12);
}

#[test]
fn prolongation_is_reported_unsupported_for_underdetermined_patches() {
    // Six coarse DOFs but only four fine DOFs: no prolongation blocks.
    let coarse = SegmentLagrangeSpace::uniform(2, 2, Continuity::Discontinuous);
    let fine = SegmentLagrangeSpace::uniform(4, 0, Continuity::Discontinuous);
    let transforms = uniform_segment_refinement(2, 2);
    let projection = BrokenL2Projection::new(&coarse, &fine, &transforms).unwrap();
    assert!(!projection.has_prolongation());

    let x = DVector::zeros(projection.nrows());
    let mut y = DVector::zeros(projection.ncols());
    let result = projection.prolongate((&mut y).into(), (&x).into());
    assert!(matches!(result, Err(TransferError::ProlongationNotAvailable)));
}

#[test]
fn vector_fields_transfer_component_by_component() {
    let coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Discontinuous).with_vdim(2);
    let fine = SegmentLagrangeSpace::uniform(4, 0, Continuity::Discontinuous).with_vdim(2);
    let transforms = uniform_segment_refinement(2, 2);
    let projection = BrokenL2Projection::new(&coarse, &fine, &transforms).unwrap();

    // Component-major input: component 0 is 1 + 2x, component 1 is 5 - x.
    let scalar_coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Discontinuous);
    let c0 = scalar_coarse.interpolate(|x| 1.0 + 2.0 * x);
    let c1 = scalar_coarse.interpolate(|x| 5.0 - x);
    let mut x = DVector::zeros(8);
    x.rows_mut(0, 4).copy_from(&c0);
    x.rows_mut(4, 4).copy_from(&c1);

    let y = apply(&projection, &x);

    let scalar_projection = {
        let scalar_fine = SegmentLagrangeSpace::uniform(4, 0, Continuity::Discontinuous);
        let y0 = {
            let p = BrokenL2Projection::new(&scalar_coarse, &scalar_fine, &transforms).unwrap();
            (apply(&p, &c0), apply(&p, &c1))
        };
        y0
    };
    assert_matrix_eq!(y.rows(0, 4), scalar_projection.0, comp = abs, tol = 1e-13);
    assert_matrix_eq!(y.rows(4, 4), scalar_projection.1, comp = abs, tol = 1e-13);
}

#[test]
fn empty_coarse_mesh_builds_an_empty_operator() {
    let coarse = SegmentLagrangeSpace::uniform(0, 1, Continuity::Discontinuous);
    let fine = SegmentLagrangeSpace::uniform(0, 0, Continuity::Discontinuous);
    let transforms = uniform_segment_refinement(0, 2);
    let projection = BrokenL2Projection::new(&coarse, &fine, &transforms).unwrap();
    assert_eq!(projection.nrows(), 0);
    assert_eq!(projection.ncols(), 0);
}
