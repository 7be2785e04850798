//! Routing of transfer requests to the concrete operator families.
//!
//! A [`Transfer`] is constructed from the two participating spaces, the
//! relation between them, and the requested operator storage. The concrete
//! operator family is selected exactly once, at construction; the built
//! operators are cached for the lifetime of the transfer object and must be
//! constructed before any concurrent use. Mesh or space changes require a
//! fresh transfer object.
use crate::error::TransferError;
use crate::operators::{csr_apply_componentwise, csr_apply_transpose_componentwise, Operator, SparseOperator};
use crate::refinement::RefinementTransforms;
use crate::space::{Continuity, Partition, TransferSpace};
use crate::transfer::interpolation::{
    mass_kind_for, DerefinementOperator, MassKind, RefinementOperator,
};
use crate::transfer::l2_broken::BrokenL2Projection;
use crate::transfer::l2_conforming::ConformingL2Projection;
use crate::transfer::p_refinement::{PRefinementOperator, TensorPRefinementOperator};
use log::debug;
use nalgebra::{DVector, DVectorView, DVectorViewMut, RealField};
use nalgebra_sparse::CsrMatrix;
use std::cell::RefCell;

pub mod interpolation;
pub mod l2_broken;
pub mod l2_conforming;
pub mod p_refinement;

/// How a constructed operator is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatorStorage {
    /// Matrix-free: only the operator's action is available.
    #[default]
    Action,
    /// An explicitly assembled sparse matrix is demanded.
    SparseAssembled,
}

/// How to transfer between two spaces related by mesh refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementStrategy {
    /// Exact interpolation; requires the coarse space to be nested in the
    /// fine space.
    Interpolation,
    /// L2 projection; also applicable to non-nested bases.
    L2Projection,
}

/// Path selection for same-mesh (order change) transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PRefinementPath {
    /// Use the tensor-product fast path when both spaces support it, the
    /// generic path otherwise.
    #[default]
    Auto,
    Generic,
    /// Demand the fast path; its preconditions become fatal errors.
    Tensor,
}

/// The relation between the domain (coarse / low-order) and range (fine /
/// high-order) spaces of a transfer.
#[derive(Clone, Copy)]
pub enum SpaceRelation<'a, T: RealField> {
    /// The range space lives on a refinement of the domain space's mesh.
    MeshRefinement {
        transforms: &'a RefinementTransforms<T>,
        strategy: RefinementStrategy,
    },
    /// Both spaces share one mesh and differ in polynomial order.
    SameMesh { path: PRefinementPath },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOptions {
    pub storage: OperatorStorage,
    /// Use the patch-local broken engine even for a continuous domain
    /// space.
    pub force_broken: bool,
}

/// The closed set of forward operator variants a transfer can select.
pub enum ForwardOperator<'a, T: RealField> {
    Refinement(RefinementOperator<'a, T>),
    AssembledRefinement(SparseOperator<T>),
    BrokenProjection(BrokenL2Projection<'a, T>),
    ConformingProjection(ConformingL2Projection<'a, T>),
    PRefinementGeneric(PRefinementOperator<'a, T>),
    PRefinementTensor(TensorPRefinementOperator<T>),
}

impl<'a, T: RealField + Copy + Send + Sync> Operator<T> for ForwardOperator<'a, T> {
    fn nrows(&self) -> usize {
        match self {
            Self::Refinement(op) => op.nrows(),
            Self::AssembledRefinement(op) => op.nrows(),
            Self::BrokenProjection(op) => op.nrows(),
            Self::ConformingProjection(op) => op.nrows(),
            Self::PRefinementGeneric(op) => op.nrows(),
            Self::PRefinementTensor(op) => op.nrows(),
        }
    }

    fn ncols(&self) -> usize {
        match self {
            Self::Refinement(op) => op.ncols(),
            Self::AssembledRefinement(op) => op.ncols(),
            Self::BrokenProjection(op) => op.ncols(),
            Self::ConformingProjection(op) => op.ncols(),
            Self::PRefinementGeneric(op) => op.ncols(),
            Self::PRefinementTensor(op) => op.ncols(),
        }
    }

    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        match self {
            Self::Refinement(op) => op.apply(y, x),
            Self::AssembledRefinement(op) => op.apply(y, x),
            Self::BrokenProjection(op) => op.apply(y, x),
            Self::ConformingProjection(op) => op.apply(y, x),
            Self::PRefinementGeneric(op) => op.apply(y, x),
            Self::PRefinementTensor(op) => op.apply(y, x),
        }
    }

    fn apply_transpose(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        match self {
            Self::Refinement(op) => op.apply_transpose(y, x),
            Self::AssembledRefinement(op) => op.apply_transpose(y, x),
            Self::BrokenProjection(op) => op.apply_transpose(y, x),
            Self::ConformingProjection(op) => op.apply_transpose(y, x),
            Self::PRefinementGeneric(op) => op.apply_transpose(y, x),
            Self::PRefinementTensor(op) => op.apply_transpose(y, x),
        }
    }
}

/// The backward (fine-to-coarse) operator of a transfer.
///
/// For projection-based transfers this is a view of the forward engine's
/// prolongation; for interpolation transfers it is the cached derefinement
/// operator.
pub struct BackwardOperator<'s, 'a, T: RealField> {
    kind: BackwardKind<'s, 'a, T>,
}

enum BackwardKind<'s, 'a, T: RealField> {
    Broken(&'s BrokenL2Projection<'a, T>),
    Conforming(&'s ConformingL2Projection<'a, T>),
    Derefinement(&'s DerefinementOperator<'a, T>),
}

impl<'s, 'a, T: RealField + Copy> Operator<T> for BackwardOperator<'s, 'a, T> {
    fn nrows(&self) -> usize {
        match &self.kind {
            BackwardKind::Broken(engine) => engine.ncols(),
            BackwardKind::Conforming(engine) => engine.ncols(),
            BackwardKind::Derefinement(op) => op.nrows(),
        }
    }

    fn ncols(&self) -> usize {
        match &self.kind {
            BackwardKind::Broken(engine) => engine.nrows(),
            BackwardKind::Conforming(engine) => engine.nrows(),
            BackwardKind::Derefinement(op) => op.ncols(),
        }
    }

    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        match &self.kind {
            BackwardKind::Broken(engine) => engine.prolongate(y, x),
            BackwardKind::Conforming(engine) => engine.prolongate(y, x),
            BackwardKind::Derefinement(op) => op.apply(y, x),
        }
    }

    fn apply_transpose(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        match &self.kind {
            BackwardKind::Broken(engine) => engine.prolongate_transpose(y, x),
            BackwardKind::Conforming(engine) => engine.prolongate_transpose(y, x),
            BackwardKind::Derefinement(op) => op.apply_transpose(y, x),
        }
    }
}

/// A transfer between two finite element spaces.
///
/// Forward and backward operators are constructed lazily on first request
/// and cached for the lifetime of the transfer; construct them before any
/// concurrent use.
pub struct Transfer<'a, T: RealField> {
    dom: &'a dyn TransferSpace<T>,
    ran: &'a dyn TransferSpace<T>,
    relation: SpaceRelation<'a, T>,
    options: TransferOptions,
    mass_kind: Option<MassKind>,
    forward: Option<ForwardOperator<'a, T>>,
    backward: Option<DerefinementOperator<'a, T>>,
    true_forward_mat: Option<CsrMatrix<T>>,
}

impl<'a, T: RealField + Copy + Send + Sync> Transfer<'a, T> {
    /// Routes a transfer request between `dom` (the coarse / low-order
    /// side) and `ran` (the fine / high-order side).
    ///
    /// All configuration incompatibilities are reported here; the returned
    /// transfer cannot fail on a supported operator request for reasons of
    /// configuration.
    pub fn new(
        dom: &'a dyn TransferSpace<T>,
        ran: &'a dyn TransferSpace<T>,
        relation: SpaceRelation<'a, T>,
        options: TransferOptions,
    ) -> Result<Self, TransferError> {
        if dom.partition() != ran.partition() {
            return Err(TransferError::IncompatibleSpaces {
                reason: "the domain and range spaces must both be single-process or both be \
                         distributed"
                    .into(),
            });
        }
        if dom.partition() == Partition::Distributed {
            return Err(TransferError::UnsupportedConfiguration {
                reason: "distributed spaces must be reduced through an external distributed \
                         linear algebra collaborator"
                    .into(),
            });
        }
        if dom.vdim() != ran.vdim() {
            return Err(TransferError::IncompatibleSpaces {
                reason: "the domain and range spaces must have the same vector dimension".into(),
            });
        }

        let mut transfer = Self {
            dom,
            ran,
            relation,
            options,
            mass_kind: None,
            forward: None,
            backward: None,
            true_forward_mat: None,
        };

        match relation {
            SpaceRelation::MeshRefinement { transforms, .. } => {
                if transforms.num_fine_elements() != ran.num_elements() {
                    return Err(TransferError::IncompatibleSpaces {
                        reason: "the refinement transforms must describe the range space's mesh"
                            .into(),
                    });
                }
                if matches!(
                    relation,
                    SpaceRelation::MeshRefinement {
                        strategy: RefinementStrategy::L2Projection,
                        ..
                    }
                ) && options.storage == OperatorStorage::SparseAssembled
                {
                    return Err(TransferError::UnsupportedConfiguration {
                        reason: "projection-based transfer is only available in action form".into(),
                    });
                }
            }
            SpaceRelation::SameMesh { path } => {
                if options.storage == OperatorStorage::SparseAssembled {
                    return Err(TransferError::UnsupportedConfiguration {
                        reason: "same-mesh order transfer is only available in action form".into(),
                    });
                }
                // The path is decided now, once; the generic fallback
                // happens here and never silently at call time.
                transfer.forward = Some(Self::build_p_refinement(dom, ran, path)?);
            }
        }

        Ok(transfer)
    }

    /// Overrides the automatic mass operator selection of the derefinement
    /// (backward interpolation) operator. Must be called before the
    /// backward operator is first requested.
    pub fn set_mass_kind(&mut self, mass_kind: MassKind) {
        self.mass_kind = Some(mass_kind);
    }

    /// Whether the backward direction is supported: the fine side must have
    /// at least as many true DOFs as the coarse side.
    pub fn supports_backward(&self) -> bool {
        self.ran.num_true_dofs() * self.ran.vdim() >= self.dom.num_true_dofs() * self.dom.vdim()
    }

    fn build_p_refinement(
        dom: &'a dyn TransferSpace<T>,
        ran: &'a dyn TransferSpace<T>,
        path: PRefinementPath,
    ) -> Result<ForwardOperator<'a, T>, TransferError> {
        let tensor_eligible = dom.num_elements() > 0
            && ran.num_elements() > 0
            && dom.vdim() == 1
            && ran.vdim() == 1
            && !dom.is_variable_order()
            && !ran.is_variable_order()
            && dom.tensor_product().is_some()
            && ran.tensor_product().is_some();

        match path {
            PRefinementPath::Tensor => Ok(ForwardOperator::PRefinementTensor(
                TensorPRefinementOperator::try_new(dom, ran)?,
            )),
            PRefinementPath::Auto if tensor_eligible => {
                debug!("selected the tensor-product fast path for same-mesh transfer");
                Ok(ForwardOperator::PRefinementTensor(
                    TensorPRefinementOperator::try_new(dom, ran)?,
                ))
            }
            PRefinementPath::Auto | PRefinementPath::Generic => Ok(
                ForwardOperator::PRefinementGeneric(PRefinementOperator::new(dom, ran)),
            ),
        }
    }

    fn build_forward(&self) -> Result<ForwardOperator<'a, T>, TransferError> {
        match self.relation {
            SpaceRelation::MeshRefinement {
                transforms,
                strategy: RefinementStrategy::Interpolation,
            } => match self.options.storage {
                OperatorStorage::Action => Ok(ForwardOperator::Refinement(RefinementOperator::new(
                    self.dom, self.ran, transforms,
                ))),
                OperatorStorage::SparseAssembled => {
                    let operator = RefinementOperator::new(self.dom, self.ran, transforms);
                    Ok(ForwardOperator::AssembledRefinement(SparseOperator::new(
                        operator.assemble(),
                        self.dom.vdim(),
                    )))
                }
            },
            SpaceRelation::MeshRefinement {
                transforms,
                strategy: RefinementStrategy::L2Projection,
            } => {
                if !self.options.force_broken && self.dom.continuity() == Continuity::Continuous {
                    Ok(ForwardOperator::ConformingProjection(
                        ConformingL2Projection::new(self.dom, self.ran, transforms)?,
                    ))
                } else {
                    Ok(ForwardOperator::BrokenProjection(BrokenL2Projection::new(
                        self.dom, self.ran, transforms,
                    )?))
                }
            }
            SpaceRelation::SameMesh { .. } => {
                unreachable!("same-mesh operators are built at transfer construction")
            }
        }
    }

    /// The forward (coarse-to-fine) operator, built on first request.
    pub fn forward_operator(&mut self) -> Result<&ForwardOperator<'a, T>, TransferError> {
        if self.forward.is_none() {
            self.forward = Some(self.build_forward()?);
        }
        Ok(self.forward.as_ref().expect("forward operator was just built"))
    }

    /// The backward (fine-to-coarse) operator, built on first request.
    pub fn backward_operator(&mut self) -> Result<BackwardOperator<'_, 'a, T>, TransferError> {
        let relation = self.relation;
        match relation {
            SpaceRelation::SameMesh { .. } => Err(TransferError::UnsupportedConfiguration {
                reason: "same-mesh order transfer has no backward operator; apply the transpose \
                         of the forward operator instead"
                    .into(),
            }),
            SpaceRelation::MeshRefinement {
                transforms,
                strategy: RefinementStrategy::Interpolation,
            } => {
                if self.options.storage == OperatorStorage::SparseAssembled {
                    return Err(TransferError::UnsupportedConfiguration {
                        reason: "the derefinement operator is only available in action form".into(),
                    });
                }
                if self.backward.is_none() {
                    // If no mass operator was configured, pick one that
                    // matches the fine space's field type.
                    let mass_kind = self
                        .mass_kind
                        .unwrap_or_else(|| mass_kind_for(self.ran.map_type()));
                    self.backward = Some(DerefinementOperator::new(
                        self.dom, self.ran, transforms, mass_kind,
                    )?);
                }
                let op = self.backward.as_ref().expect("backward operator was just built");
                Ok(BackwardOperator {
                    kind: BackwardKind::Derefinement(op),
                })
            }
            SpaceRelation::MeshRefinement {
                strategy: RefinementStrategy::L2Projection,
                ..
            } => {
                let forward = self.forward_operator()?;
                match forward {
                    ForwardOperator::BrokenProjection(engine) => Ok(BackwardOperator {
                        kind: BackwardKind::Broken(engine),
                    }),
                    ForwardOperator::ConformingProjection(engine) => Ok(BackwardOperator {
                        kind: BackwardKind::Conforming(engine),
                    }),
                    _ => unreachable!("projection transfers build projection operators"),
                }
            }
        }
    }

    /// The forward operator lifted to the true-DOF representation of both
    /// spaces.
    pub fn true_forward_operator(
        &mut self,
    ) -> Result<TrueDofOperator<'_, T, &ForwardOperator<'a, T>>, TransferError> {
        let dom = self.dom;
        let ran = self.ran;
        let forward = self.forward_operator()?;
        TrueDofOperator::new(forward, dom, ran)
    }

    /// The backward operator lifted to the true-DOF representation of both
    /// spaces.
    pub fn true_backward_operator(
        &mut self,
    ) -> Result<TrueDofOperator<'_, T, BackwardOperator<'_, 'a, T>>, TransferError> {
        let dom = self.dom;
        let ran = self.ran;
        let backward = self.backward_operator()?;
        // The backward operator maps the fine side to the coarse side, so
        // the roles of the two spaces swap.
        TrueDofOperator::new(backward, ran, dom)
    }

    /// The assembled true-DOF forward matrix, available when sparse storage
    /// was requested: the assembled forward matrix composed with the range
    /// restriction and domain prolongation by sparse products.
    pub fn true_forward_matrix(&mut self) -> Result<&CsrMatrix<T>, TransferError> {
        if self.true_forward_mat.is_none() {
            let dom = self.dom;
            let ran = self.ran;
            let composed = {
                let forward = self.forward_operator()?;
                let matrix = match forward {
                    ForwardOperator::AssembledRefinement(op) => op.matrix(),
                    _ => {
                        return Err(TransferError::UnsupportedConfiguration {
                            reason: "the forward operator is not an assembled sparse matrix".into(),
                        })
                    }
                };
                let matrix = match ran.conforming_restriction() {
                    Some(restriction) => restriction * matrix,
                    None => matrix.clone(),
                };
                match dom.conforming_prolongation() {
                    Some(prolongation) => &matrix * prolongation,
                    None => matrix,
                }
            };
            self.true_forward_mat = Some(composed);
        }
        Ok(self
            .true_forward_mat
            .as_ref()
            .expect("true forward matrix was just built"))
    }
}

/// Adapts a local-DOF transfer operator to the true-DOF representation by
/// composing the domain prolongation before, and the range restriction
/// after, the wrapped operator's action. Either composition is skipped when
/// the corresponding space carries no constraints.
pub struct TrueDofOperator<'m, T: RealField, Op> {
    inner: Op,
    dom_prolongation: Option<&'m CsrMatrix<T>>,
    ran_restriction: Option<&'m CsrMatrix<T>>,
    vdim: usize,
    // (domain-local, range-local) scratch vectors
    buffers: RefCell<(DVector<T>, DVector<T>)>,
}

impl<'m, T: RealField + Copy, Op: Operator<T>> TrueDofOperator<'m, T, Op> {
    /// Wraps `inner`, whose domain is `dom` and range is `ran`, both on
    /// local DOFs.
    ///
    /// A domain space with a prolongation but a range space without a
    /// restriction is rejected: the asymmetric composition would produce a
    /// local-DOF result advertised as a true-DOF one.
    pub fn new(
        inner: Op,
        dom: &'m dyn TransferSpace<T>,
        ran: &'m dyn TransferSpace<T>,
    ) -> Result<Self, TransferError> {
        let dom_prolongation = dom.conforming_prolongation();
        let ran_restriction = ran.conforming_restriction();
        if dom_prolongation.is_some() && ran_restriction.is_none() {
            return Err(TransferError::MissingRestriction);
        }
        let vdim = dom.vdim();
        let buffers = RefCell::new((
            DVector::zeros(inner.ncols()),
            DVector::zeros(inner.nrows()),
        ));
        Ok(Self {
            inner,
            dom_prolongation,
            ran_restriction,
            vdim,
            buffers,
        })
    }
}

impl<'m, T: RealField + Copy, Op: Operator<T>> Operator<T> for TrueDofOperator<'m, T, Op> {
    fn nrows(&self) -> usize {
        self.ran_restriction
            .map(|r| self.vdim * r.nrows())
            .unwrap_or_else(|| self.inner.nrows())
    }

    fn ncols(&self) -> usize {
        self.dom_prolongation
            .map(|p| self.vdim * p.ncols())
            .unwrap_or_else(|| self.inner.ncols())
    }

    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        let (local_dom, local_ran) = &mut *self.buffers.borrow_mut();
        match (self.dom_prolongation, self.ran_restriction) {
            (Some(prolongation), Some(restriction)) => {
                csr_apply_componentwise(
                    DVectorViewMut::from(&mut *local_dom),
                    prolongation,
                    x,
                    self.vdim,
                );
                self.inner.apply(
                    DVectorViewMut::from(&mut *local_ran),
                    DVectorView::from(&*local_dom),
                )?;
                csr_apply_componentwise(y, restriction, DVectorView::from(&*local_ran), self.vdim);
            }
            (None, Some(restriction)) => {
                self.inner
                    .apply(DVectorViewMut::from(&mut *local_ran), x)?;
                csr_apply_componentwise(y, restriction, DVectorView::from(&*local_ran), self.vdim);
            }
            (None, None) => {
                self.inner.apply(y, x)?;
            }
            (Some(_), None) => {
                unreachable!("rejected at construction");
            }
        }
        Ok(())
    }

    fn apply_transpose(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        let (local_dom, local_ran) = &mut *self.buffers.borrow_mut();
        match (self.dom_prolongation, self.ran_restriction) {
            (Some(prolongation), Some(restriction)) => {
                csr_apply_transpose_componentwise(
                    DVectorViewMut::from(&mut *local_ran),
                    restriction,
                    x,
                    self.vdim,
                );
                self.inner.apply_transpose(
                    DVectorViewMut::from(&mut *local_dom),
                    DVectorView::from(&*local_ran),
                )?;
                csr_apply_transpose_componentwise(
                    y,
                    prolongation,
                    DVectorView::from(&*local_dom),
                    self.vdim,
                );
            }
            (None, Some(restriction)) => {
                csr_apply_transpose_componentwise(
                    DVectorViewMut::from(&mut *local_ran),
                    restriction,
                    x,
                    self.vdim,
                );
                self.inner
                    .apply_transpose(y, DVectorView::from(&*local_ran))?;
            }
            (None, None) => {
                self.inner.apply_transpose(y, x)?;
            }
            (Some(_), None) => {
                unreachable!("rejected at construction");
            }
        }
        Ok(())
    }
}
