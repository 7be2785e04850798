use crate::unit_tests::{apply, apply_transpose};
use bifrost::operators::{Operator, SparseOperator};
use bifrost::space::Continuity;
use bifrost::{
    ForwardOperator, OperatorStorage, PRefinementPath, RefinementStrategy, SpaceRelation, Transfer,
    TransferError, TransferOptions, TrueDofOperator,
};
use matrixcompare::assert_matrix_eq;
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use util::{
    uniform_segment_refinement, ConstrainedSegmentSpace, SegmentLagrangeSpace,
};

#[test]
fn same_mesh_transfer_selects_the_tensor_path_automatically() {
    let low = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous);
    let high = SegmentLagrangeSpace::uniform(2, 3, Continuity::Continuous);
    let mut transfer = Transfer::new(
        &low,
        &high,
        SpaceRelation::SameMesh {
            path: PRefinementPath::Auto,
        },
        TransferOptions::default(),
    )
    .unwrap();

    let forward = transfer.forward_operator().unwrap();
    assert!(matches!(forward, ForwardOperator::PRefinementTensor(_)));
}

#[test]
fn vector_valued_same_mesh_transfer_falls_back_to_the_generic_path() {
    let low = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous).with_vdim(2);
    let high = SegmentLagrangeSpace::uniform(2, 2, Continuity::Continuous).with_vdim(2);
    let mut transfer = Transfer::new(
        &low,
        &high,
        SpaceRelation::SameMesh {
            path: PRefinementPath::Auto,
        },
        TransferOptions::default(),
    )
    .unwrap();

    let forward = transfer.forward_operator().unwrap();
    assert!(matches!(forward, ForwardOperator::PRefinementGeneric(_)));
}

#[test]
fn demanding_the_tensor_path_makes_its_preconditions_fatal() {
    let low = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous).with_vdim(2);
    let high = SegmentLagrangeSpace::uniform(2, 2, Continuity::Continuous).with_vdim(2);
    let result = Transfer::new(
        &low,
        &high,
        SpaceRelation::SameMesh {
            path: PRefinementPath::Tensor,
        },
        TransferOptions::default(),
    );
    assert!(matches!(
        result,
        Err(TransferError::UnsupportedConfiguration { .. })
    ));
}

#[test]
fn mismatched_vector_dimensions_are_rejected() {
    let low = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous).with_vdim(2);
    let high = SegmentLagrangeSpace::uniform(2, 2, Continuity::Continuous);
    let result = Transfer::new(
        &low,
        &high,
        SpaceRelation::SameMesh {
            path: PRefinementPath::Auto,
        },
        TransferOptions::default(),
    );
    assert!(matches!(result, Err(TransferError::IncompatibleSpaces { .. })));
}

#[test]
fn projection_transfer_cannot_be_assembled() {
    let coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous);
    let fine = SegmentLagrangeSpace::uniform(4, 1, Continuity::Continuous);
    let transforms = uniform_segment_refinement(2, 2);
    let result = Transfer::new(
        &coarse,
        &fine,
        SpaceRelation::MeshRefinement {
            transforms: &transforms,
            strategy: RefinementStrategy::L2Projection,
        },
        TransferOptions {
            storage: OperatorStorage::SparseAssembled,
            ..Default::default()
        },
    );
    assert!(matches!(
        result,
        Err(TransferError::UnsupportedConfiguration { .. })
    ));
}

#[test]
fn projection_routing_follows_the_domain_continuity() {
    let transforms = uniform_segment_refinement(2, 2);

    let coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous);
    let fine = SegmentLagrangeSpace::uniform(4, 1, Continuity::Continuous);
    let mut transfer = Transfer::new(
        &coarse,
        &fine,
        SpaceRelation::MeshRefinement {
            transforms: &transforms,
            strategy: RefinementStrategy::L2Projection,
        },
        TransferOptions::default(),
    )
    .unwrap();
    assert!(matches!(
        transfer.forward_operator().unwrap(),
        ForwardOperator::ConformingProjection(_)
    ));

    let coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Discontinuous);
    let fine = SegmentLagrangeSpace::uniform(4, 0, Continuity::Discontinuous);
    let mut transfer = Transfer::new(
        &coarse,
        &fine,
        SpaceRelation::MeshRefinement {
            transforms: &transforms,
            strategy: RefinementStrategy::L2Projection,
        },
        TransferOptions::default(),
    )
    .unwrap();
    assert!(matches!(
        transfer.forward_operator().unwrap(),
        ForwardOperator::BrokenProjection(_)
    ));
}

#[test]
fn force_broken_overrides_the_continuity_routing() {
    let transforms = uniform_segment_refinement(2, 2);
    let coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous);
    let fine = SegmentLagrangeSpace::uniform(4, 1, Continuity::Continuous);
    let mut transfer = Transfer::new(
        &coarse,
        &fine,
        SpaceRelation::MeshRefinement {
            transforms: &transforms,
            strategy: RefinementStrategy::L2Projection,
        },
        TransferOptions {
            force_broken: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(matches!(
        transfer.forward_operator().unwrap(),
        ForwardOperator::BrokenProjection(_)
    ));
}

#[test]
fn supports_backward_compares_true_dof_counts() {
    let transforms = uniform_segment_refinement(2, 2);
    let coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous);
    let fine = SegmentLagrangeSpace::uniform(4, 1, Continuity::Continuous);

    let transfer = Transfer::new(
        &coarse,
        &fine,
        SpaceRelation::MeshRefinement {
            transforms: &transforms,
            strategy: RefinementStrategy::L2Projection,
        },
        TransferOptions::default(),
    )
    .unwrap();
    assert!(transfer.supports_backward());

    // A high-degree coarse side can out-count the refined fine side.
    let rich_coarse = SegmentLagrangeSpace::uniform(2, 3, Continuity::Continuous);
    let transfer = Transfer::new(
        &rich_coarse,
        &fine,
        SpaceRelation::MeshRefinement {
            transforms: &transforms,
            strategy: RefinementStrategy::L2Projection,
        },
        TransferOptions::default(),
    )
    .unwrap();
    assert!(!transfer.supports_backward());
}

#[test]
fn forward_then_backward_round_trips_through_the_router() {
    let transforms = uniform_segment_refinement(2, 2);
    let coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Discontinuous);
    let fine = SegmentLagrangeSpace::uniform(4, 0, Continuity::Discontinuous);
    let mut transfer = Transfer::new(
        &coarse,
        &fine,
        SpaceRelation::MeshRefinement {
            transforms: &transforms,
            strategy: RefinementStrategy::L2Projection,
        },
        TransferOptions::default(),
    )
    .unwrap();

    let x = coarse.interpolate(|x| 2.0 - x);
    let y = {
        let forward = transfer.forward_operator().unwrap();
        apply(forward, &x)
    };
    let backward = transfer.backward_operator().unwrap();
    let recovered = apply(&backward, &y);
    assert_matrix_eq!(recovered, x, comp = abs, tol = 1e-12);
}

#[test]
fn interpolation_backward_is_the_derefinement_operator() {
    let transforms = uniform_segment_refinement(2, 2);
    let coarse = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous);
    let fine = SegmentLagrangeSpace::uniform(4, 1, Continuity::Continuous);
    let mut transfer = Transfer::new(
        &coarse,
        &fine,
        SpaceRelation::MeshRefinement {
            transforms: &transforms,
            strategy: RefinementStrategy::Interpolation,
        },
        TransferOptions::default(),
    )
    .unwrap();

    let x = coarse.interpolate(|x| x + 1.0);
    let y = {
        let forward = transfer.forward_operator().unwrap();
        apply(forward, &x)
    };
    let backward = transfer.backward_operator().unwrap();
    let recovered = apply(&backward, &y);
    assert_matrix_eq!(recovered, x, comp = abs, tol = 1e-12);
}

#[test]
fn same_mesh_transfer_has_no_backward_operator() {
    let low = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous);
    let high = SegmentLagrangeSpace::uniform(2, 2, Continuity::Continuous);
    let mut transfer = Transfer::new(
        &low,
        &high,
        SpaceRelation::SameMesh {
            path: PRefinementPath::Auto,
        },
        TransferOptions::default(),
    )
    .unwrap();
    assert!(matches!(
        transfer.backward_operator(),
        Err(TransferError::UnsupportedConfiguration { .. })
    ));
}

#[test]
fn true_dof_wrapper_composes_prolongation_and_restriction() {
    let transforms = uniform_segment_refinement(2, 2);
    let coarse = ConstrainedSegmentSpace::uniform(2, 1);
    let fine = ConstrainedSegmentSpace::uniform(4, 1);
    let mut transfer = Transfer::new(
        &coarse,
        &fine,
        SpaceRelation::MeshRefinement {
            transforms: &transforms,
            strategy: RefinementStrategy::Interpolation,
        },
        TransferOptions::default(),
    )
    .unwrap();

    let f = |x: f64| 2.0 * x + 1.0;
    let x_true = DVector::from_iterator(
        3,
        coarse.true_dof_coordinates().into_iter().map(f),
    );
    let expected = DVector::from_iterator(5, fine.true_dof_coordinates().into_iter().map(f));

    let true_forward = transfer.true_forward_operator().unwrap();
    assert_eq!(true_forward.ncols(), 3);
    assert_eq!(true_forward.nrows(), 5);
    let y_true = apply(&true_forward, &x_true);
    assert_matrix_eq!(y_true, expected, comp = abs, tol = 1e-13);

    // The transpose path composes the same operators in reverse.
    let ones = DVector::from_element(5, 1.0);
    let pulled_back = apply_transpose(&true_forward, &ones);
    assert_eq!(pulled_back.len(), 3);
}

#[test]
fn prolongation_without_restriction_is_rejected() {
    let constrained = ConstrainedSegmentSpace::uniform(2, 1);
    let plain = SegmentLagrangeSpace::uniform(2, 1, Continuity::Continuous);
    let identity = SparseOperator::new(CsrMatrix::identity(4), 1);
    let result = TrueDofOperator::new(&identity, &constrained, &plain);
    assert!(matches!(result, Err(TransferError::MissingRestriction)));
}

#[test]
fn assembled_true_forward_matrix_matches_the_composed_action() {
    let transforms = uniform_segment_refinement(2, 2);
    let coarse = ConstrainedSegmentSpace::uniform(2, 1);
    let fine = ConstrainedSegmentSpace::uniform(4, 1);
    let mut transfer = Transfer::new(
        &coarse,
        &fine,
        SpaceRelation::MeshRefinement {
            transforms: &transforms,
            strategy: RefinementStrategy::Interpolation,
        },
        TransferOptions {
            storage: OperatorStorage::SparseAssembled,
            ..Default::default()
        },
    )
    .unwrap();

    let x_true = DVector::from_column_slice(&[1.0, -1.0, 2.0]);
    let expected = {
        let true_forward = transfer.true_forward_operator().unwrap();
        apply(&true_forward, &x_true)
    };

    let matrix = transfer.true_forward_matrix().unwrap();
    let assembled = SparseOperator::new(matrix.clone(), 1);
    assert_matrix_eq!(apply(&assembled, &x_true), expected, comp = abs, tol = 1e-13);
}
