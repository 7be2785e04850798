//! Transfer between spaces of different polynomial order on the same mesh.
//!
//! The generic path computes a dense local transfer matrix per element
//! (cached by reference geometry) and applies it by gather/multiply/scatter.
//! When both spaces expose tensor-product bases, the same operator is
//! re-expressed as a one-dimensional basis change applied along each
//! reference axis (sum factorization), with a boolean mask excluding
//! repeated tensor-node entries from the reconstructed fine values. The
//! per-element kernels carry no cross-element coupling and run
//! data-parallel over elements.
use crate::error::TransferError;
use crate::operators::Operator;
use crate::space::{
    gather_element_values, scatter_add_element_values, scatter_element_values, LexElementRestriction,
    ReferenceGeometry, TransferSpace,
};
use davenport::{define_thread_local_workspace, with_thread_local_workspace};
use log::debug;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut, RealField};
use rayon::prelude::*;

define_thread_local_workspace!(P_REFINEMENT_WORKSPACE);

#[derive(Debug)]
struct ApplyWorkspace<T> {
    x_el: DMatrix<T>,
    y_el: DMatrix<T>,
    dofs: Vec<usize>,
    nodes: Vec<T>,
    shape: Vec<T>,
}

impl<T: RealField> Default for ApplyWorkspace<T> {
    fn default() -> Self {
        Self {
            x_el: DMatrix::zeros(0, 0),
            y_el: DMatrix::zeros(0, 0),
            dofs: Vec::new(),
            nodes: Vec::new(),
            shape: Vec::new(),
        }
    }
}

// The local transfer matrix of one element: row `i` holds the low-order
// basis evaluated at node `i` of the high-order element. Both elements
// share the same reference cell, so no embedding is involved.
fn local_transfer_matrix<T: RealField + Copy>(
    low: &dyn TransferSpace<T>,
    high: &dyn TransferSpace<T>,
    element: usize,
    nodes: &mut Vec<T>,
    shape: &mut Vec<T>,
) -> DMatrix<T> {
    let d = high.reference_dim();
    let ndof_high = high.element_dof_count(element);
    let ndof_low = low.element_dof_count(element);

    nodes.resize(d * ndof_high, T::zero());
    high.populate_element_nodes(nodes, element);
    shape.resize(ndof_low, T::zero());

    let mut local = DMatrix::zeros(ndof_high, ndof_low);
    for i in 0..ndof_high {
        low.populate_element_basis(element, shape, &nodes[i * d..(i + 1) * d]);
        for j in 0..ndof_low {
            local[(i, j)] = shape[j];
        }
    }
    local
}

/// The generic p-refinement transfer operator: per-element dense local
/// transfer matrices, recomputed whenever the element geometry changes or
/// either space uses per-element variable order.
pub struct PRefinementOperator<'a, T: RealField> {
    low: &'a dyn TransferSpace<T>,
    high: &'a dyn TransferSpace<T>,
    variable_order: bool,
}

impl<'a, T: RealField + Copy> PRefinementOperator<'a, T> {
    pub fn new(low: &'a dyn TransferSpace<T>, high: &'a dyn TransferSpace<T>) -> Self {
        let variable_order = low.is_variable_order() || high.is_variable_order();
        debug!(
            "built generic p-refinement operator over {} elements (variable order: {})",
            low.num_elements(),
            variable_order
        );
        Self {
            low,
            high,
            variable_order,
        }
    }
}

impl<'a, T: RealField + Copy> Operator<T> for PRefinementOperator<'a, T> {
    fn nrows(&self) -> usize {
        self.high.vdim() * self.high.num_dofs()
    }

    fn ncols(&self) -> usize {
        self.low.vdim() * self.low.num_dofs()
    }

    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        let vdim = self.low.vdim();
        with_thread_local_workspace(&P_REFINEMENT_WORKSPACE, |ws: &mut ApplyWorkspace<T>| {
            let mut cached_geom: Option<ReferenceGeometry> = None;
            let mut local = DMatrix::zeros(0, 0);
            for element in 0..self.high.num_elements() {
                let geom = self.high.element_geometry(element);
                if cached_geom != Some(geom) || self.variable_order {
                    local = local_transfer_matrix(self.low, self.high, element, &mut ws.nodes, &mut ws.shape);
                    cached_geom = Some(geom);
                }

                ws.x_el.resize_mut(local.ncols(), vdim, T::zero());
                ws.dofs.resize(self.low.element_dof_count(element), 0);
                self.low.populate_element_dofs(&mut ws.dofs, element);
                gather_element_values(&mut ws.x_el, x.rows(0, x.len()), 0, &ws.dofs, self.low.num_dofs());

                ws.y_el.resize_mut(local.nrows(), vdim, T::zero());
                ws.y_el.gemm(T::one(), &local, &ws.x_el, T::zero());

                ws.dofs.resize(self.high.element_dof_count(element), 0);
                self.high.populate_element_dofs(&mut ws.dofs, element);
                scatter_element_values(y.rows_mut(0, y.len()), &ws.y_el, 0, &ws.dofs, self.high.num_dofs());
            }
        });
        Ok(())
    }

    fn apply_transpose(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        let vdim = self.low.vdim();
        with_thread_local_workspace(&P_REFINEMENT_WORKSPACE, |ws: &mut ApplyWorkspace<T>| {
            y.fill(T::zero());
            // Each destination DOF receives contributions only from the
            // first element touching it; the marker is cleared at the start
            // of every pass and ties are broken by traversal order.
            let mut processed = vec![false; self.high.num_dofs()];
            let mut cached_geom: Option<ReferenceGeometry> = None;
            let mut local = DMatrix::zeros(0, 0);
            for element in 0..self.high.num_elements() {
                let geom = self.high.element_geometry(element);
                if cached_geom != Some(geom) || self.variable_order {
                    local = local_transfer_matrix(self.low, self.high, element, &mut ws.nodes, &mut ws.shape);
                    cached_geom = Some(geom);
                }

                ws.x_el.resize_mut(local.nrows(), vdim, T::zero());
                ws.dofs.resize(self.high.element_dof_count(element), 0);
                self.high.populate_element_dofs(&mut ws.dofs, element);
                gather_element_values(&mut ws.x_el, x.rows(0, x.len()), 0, &ws.dofs, self.high.num_dofs());
                for (i, &dof) in ws.dofs.iter().enumerate() {
                    if processed[dof] {
                        ws.x_el.row_mut(i).fill(T::zero());
                    }
                }
                for &dof in &ws.dofs {
                    processed[dof] = true;
                }

                ws.y_el.resize_mut(local.ncols(), vdim, T::zero());
                ws.y_el.gemm_tr(T::one(), &local, &ws.x_el, T::zero());

                ws.dofs.resize(self.low.element_dof_count(element), 0);
                self.low.populate_element_dofs(&mut ws.dofs, element);
                scatter_add_element_values(
                    y.rows_mut(0, y.len()),
                    &ws.y_el,
                    0,
                    &ws.dofs,
                    self.low.num_dofs(),
                );
            }
        });
        Ok(())
    }
}

/// The sum-factorized p-refinement transfer operator for tensor-product
/// bases.
///
/// The dense per-element transfer matrix is replaced by a one-dimensional
/// basis change matrix `B` applied successively along each reference axis,
/// reducing the per-element cost from a dense product to
/// `O(fine_dofs * coarse_1d_dofs * dim)`. Entries of the reconstructed fine
/// element vector that correspond to repeated tensor nodes are excluded by
/// a multiplicative boolean mask.
pub struct TensorPRefinementOperator<T: RealField> {
    dim: usize,
    num_elements: usize,
    dofs_1d: usize,
    quads_1d: usize,
    b: DMatrix<T>,
    bt: DMatrix<T>,
    mask: DVector<T>,
    restrict_low: LexElementRestriction,
    restrict_high: LexElementRestriction,
    low_dofs: usize,
    high_dofs: usize,
}

impl<T: RealField + Copy> TensorPRefinementOperator<T> {
    /// Construction-time precondition check: both spaces must expose the
    /// tensor-product capability, carry a single vector component and use a
    /// fixed order. Failing any precondition is reported here, never at
    /// call time.
    pub fn try_new(
        low: &dyn TransferSpace<T>,
        high: &dyn TransferSpace<T>,
    ) -> Result<Self, TransferError> {
        if low.vdim() != 1 || high.vdim() != 1 {
            return Err(TransferError::UnsupportedConfiguration {
                reason: "the tensor-product fast path requires a single vector component".into(),
            });
        }
        if low.is_variable_order() || high.is_variable_order() {
            return Err(TransferError::UnsupportedConfiguration {
                reason: "the tensor-product fast path requires a fixed polynomial order".into(),
            });
        }
        if low.num_elements() != high.num_elements() {
            return Err(TransferError::IncompatibleSpaces {
                reason: "p-refinement requires both spaces to share the mesh".into(),
            });
        }
        let (low_tp, high_tp) = match (low.tensor_product(), high.tensor_product()) {
            (Some(l), Some(h)) => (l, h),
            _ => {
                return Err(TransferError::UnsupportedConfiguration {
                    reason: "both spaces must expose a tensor-product basis and a lexicographic \
                             element restriction"
                        .into(),
                })
            }
        };

        let num_elements = low.num_elements();
        let dim = high.reference_dim();
        let dofs_1d = low_tp.dofs_1d();
        let quads_1d = high_tp.dofs_1d();

        // The 1D basis change matrix: the low-order 1D basis evaluated at
        // the high-order element's lexicographically ordered 1D nodes.
        let mut nodes = vec![T::zero(); quads_1d];
        high_tp.populate_nodes_1d(&mut nodes);
        let mut values = vec![T::zero(); dofs_1d];
        let mut b = DMatrix::zeros(quads_1d, dofs_1d);
        for (q, &node) in nodes.iter().enumerate() {
            low_tp.populate_basis_1d(&mut values, node);
            for d in 0..dofs_1d {
                b[(q, d)] = values[d];
            }
        }
        let bt = b.transpose();

        let restrict_low = low_tp.lex_restriction().clone();
        let restrict_high = high_tp.lex_restriction().clone();
        let mask = restrict_high.boolean_mask();

        debug!(
            "built tensor-product p-refinement operator: {} elements, {}d, {} -> {} DOFs per axis",
            num_elements, dim, dofs_1d, quads_1d
        );

        Ok(Self {
            dim,
            num_elements,
            dofs_1d,
            quads_1d,
            b,
            bt,
            mask,
            restrict_low,
            restrict_high,
            low_dofs: low.num_dofs(),
            high_dofs: high.num_dofs(),
        })
    }
}

impl<T: RealField + Copy + Send + Sync> Operator<T> for TensorPRefinementOperator<T> {
    fn nrows(&self) -> usize {
        self.high_dofs
    }

    fn ncols(&self) -> usize {
        self.low_dofs
    }

    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        if self.num_elements == 0 {
            return Ok(());
        }
        let mut local_low = DVector::zeros(self.restrict_low.local_len());
        let mut local_high = DVector::zeros(self.restrict_high.local_len());
        self.restrict_low.gather(x, &mut local_low);

        match self.dim {
            1 => kernels::prolongation_1d(
                self.dofs_1d,
                self.quads_1d,
                local_low.as_slice(),
                local_high.as_mut_slice(),
                &self.b,
                self.mask.as_slice(),
            ),
            2 => kernels::prolongation_2d(
                self.dofs_1d,
                self.quads_1d,
                local_low.as_slice(),
                local_high.as_mut_slice(),
                &self.b,
                self.mask.as_slice(),
            ),
            3 => kernels::prolongation_3d(
                self.dofs_1d,
                self.quads_1d,
                local_low.as_slice(),
                local_high.as_mut_slice(),
                &self.b,
                self.mask.as_slice(),
            ),
            _ => unreachable!("reference geometries are at most three-dimensional"),
        }

        self.restrict_high.scatter_transpose(&local_high, y);
        Ok(())
    }

    fn apply_transpose(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        if self.num_elements == 0 {
            return Ok(());
        }
        let mut local_high = DVector::zeros(self.restrict_high.local_len());
        let mut local_low = DVector::zeros(self.restrict_low.local_len());
        self.restrict_high.gather(x, &mut local_high);

        match self.dim {
            1 => kernels::restriction_1d(
                self.dofs_1d,
                self.quads_1d,
                local_high.as_slice(),
                local_low.as_mut_slice(),
                &self.bt,
                self.mask.as_slice(),
            ),
            2 => kernels::restriction_2d(
                self.dofs_1d,
                self.quads_1d,
                local_high.as_slice(),
                local_low.as_mut_slice(),
                &self.bt,
                self.mask.as_slice(),
            ),
            3 => kernels::restriction_3d(
                self.dofs_1d,
                self.quads_1d,
                local_high.as_slice(),
                local_low.as_mut_slice(),
                &self.bt,
                self.mask.as_slice(),
            ),
            _ => unreachable!("reference geometries are at most three-dimensional"),
        }

        self.restrict_low.scatter_transpose(&local_low, y);
        Ok(())
    }
}

/// The element-wise sum factorization kernels. Elements are independent, so
/// every kernel runs data-parallel over element chunks.
mod kernels {
    use nalgebra::{DMatrix, RealField};
    use rayon::prelude::*;

    pub fn prolongation_1d<T: RealField + Copy + Send + Sync>(
        d1d: usize,
        q1d: usize,
        local_low: &[T],
        local_high: &mut [T],
        b: &DMatrix<T>,
        mask: &[T],
    ) {
        local_high
            .par_chunks_mut(q1d)
            .zip(local_low.par_chunks(d1d))
            .zip(mask.par_chunks(q1d))
            .for_each(|((y_e, x_e), m_e)| {
                for q in 0..q1d {
                    let mut sum = T::zero();
                    for d in 0..d1d {
                        sum += b[(q, d)] * x_e[d];
                    }
                    y_e[q] = sum * m_e[q];
                }
            });
    }

    pub fn prolongation_2d<T: RealField + Copy + Send + Sync>(
        d1d: usize,
        q1d: usize,
        local_low: &[T],
        local_high: &mut [T],
        b: &DMatrix<T>,
        mask: &[T],
    ) {
        local_high
            .par_chunks_mut(q1d * q1d)
            .zip(local_low.par_chunks(d1d * d1d))
            .zip(mask.par_chunks(q1d * q1d))
            .for_each(|((y_e, x_e), m_e)| {
                y_e.fill(T::zero());
                let mut sol_x = vec![T::zero(); q1d];
                for dy in 0..d1d {
                    sol_x.fill(T::zero());
                    for dx in 0..d1d {
                        let s = x_e[dx + dy * d1d];
                        for qx in 0..q1d {
                            sol_x[qx] += b[(qx, dx)] * s;
                        }
                    }
                    for qy in 0..q1d {
                        let d2q = b[(qy, dy)];
                        for qx in 0..q1d {
                            y_e[qx + qy * q1d] += d2q * sol_x[qx];
                        }
                    }
                }
                for (y_i, &m_i) in y_e.iter_mut().zip(m_e) {
                    *y_i *= m_i;
                }
            });
    }

    pub fn prolongation_3d<T: RealField + Copy + Send + Sync>(
        d1d: usize,
        q1d: usize,
        local_low: &[T],
        local_high: &mut [T],
        b: &DMatrix<T>,
        mask: &[T],
    ) {
        local_high
            .par_chunks_mut(q1d * q1d * q1d)
            .zip(local_low.par_chunks(d1d * d1d * d1d))
            .zip(mask.par_chunks(q1d * q1d * q1d))
            .for_each(|((y_e, x_e), m_e)| {
                y_e.fill(T::zero());
                let mut sol_xy = vec![T::zero(); q1d * q1d];
                let mut sol_x = vec![T::zero(); q1d];
                for dz in 0..d1d {
                    sol_xy.fill(T::zero());
                    for dy in 0..d1d {
                        sol_x.fill(T::zero());
                        for dx in 0..d1d {
                            let s = x_e[dx + d1d * (dy + d1d * dz)];
                            for qx in 0..q1d {
                                sol_x[qx] += b[(qx, dx)] * s;
                            }
                        }
                        for qy in 0..q1d {
                            let wy = b[(qy, dy)];
                            for qx in 0..q1d {
                                sol_xy[qx + qy * q1d] += wy * sol_x[qx];
                            }
                        }
                    }
                    for qz in 0..q1d {
                        let wz = b[(qz, dz)];
                        for qy in 0..q1d {
                            for qx in 0..q1d {
                                y_e[qx + q1d * (qy + q1d * qz)] += wz * sol_xy[qx + qy * q1d];
                            }
                        }
                    }
                }
                for (y_i, &m_i) in y_e.iter_mut().zip(m_e) {
                    *y_i *= m_i;
                }
            });
    }

    pub fn restriction_1d<T: RealField + Copy + Send + Sync>(
        d1d: usize,
        q1d: usize,
        local_high: &[T],
        local_low: &mut [T],
        bt: &DMatrix<T>,
        mask: &[T],
    ) {
        local_low
            .par_chunks_mut(d1d)
            .zip(local_high.par_chunks(q1d))
            .zip(mask.par_chunks(q1d))
            .for_each(|((y_e, x_e), m_e)| {
                for d in 0..d1d {
                    let mut sum = T::zero();
                    for q in 0..q1d {
                        sum += bt[(d, q)] * m_e[q] * x_e[q];
                    }
                    y_e[d] = sum;
                }
            });
    }

    pub fn restriction_2d<T: RealField + Copy + Send + Sync>(
        d1d: usize,
        q1d: usize,
        local_high: &[T],
        local_low: &mut [T],
        bt: &DMatrix<T>,
        mask: &[T],
    ) {
        local_low
            .par_chunks_mut(d1d * d1d)
            .zip(local_high.par_chunks(q1d * q1d))
            .zip(mask.par_chunks(q1d * q1d))
            .for_each(|((y_e, x_e), m_e)| {
                y_e.fill(T::zero());
                let mut sol_x = vec![T::zero(); d1d];
                for qy in 0..q1d {
                    sol_x.fill(T::zero());
                    for qx in 0..q1d {
                        let s = m_e[qx + qy * q1d] * x_e[qx + qy * q1d];
                        for dx in 0..d1d {
                            sol_x[dx] += bt[(dx, qx)] * s;
                        }
                    }
                    for dy in 0..d1d {
                        let q2d = bt[(dy, qy)];
                        for dx in 0..d1d {
                            y_e[dx + dy * d1d] += q2d * sol_x[dx];
                        }
                    }
                }
            });
    }

    pub fn restriction_3d<T: RealField + Copy + Send + Sync>(
        d1d: usize,
        q1d: usize,
        local_high: &[T],
        local_low: &mut [T],
        bt: &DMatrix<T>,
        mask: &[T],
    ) {
        local_low
            .par_chunks_mut(d1d * d1d * d1d)
            .zip(local_high.par_chunks(q1d * q1d * q1d))
            .zip(mask.par_chunks(q1d * q1d * q1d))
            .for_each(|((y_e, x_e), m_e)| {
                y_e.fill(T::zero());
                let mut sol_xy = vec![T::zero(); d1d * d1d];
                let mut sol_x = vec![T::zero(); d1d];
                for qz in 0..q1d {
                    sol_xy.fill(T::zero());
                    for qy in 0..q1d {
                        sol_x.fill(T::zero());
                        for qx in 0..q1d {
                            let idx = qx + q1d * (qy + q1d * qz);
                            let s = m_e[idx] * x_e[idx];
                            for dx in 0..d1d {
                                sol_x[dx] += bt[(dx, qx)] * s;
                            }
                        }
                        for dy in 0..d1d {
                            let wy = bt[(dy, qy)];
                            for dx in 0..d1d {
                                sol_xy[dx + dy * d1d] += wy * sol_x[dx];
                            }
                        }
                    }
                    for dz in 0..d1d {
                        let wz = bt[(dz, qz)];
                        for dy in 0..d1d {
                            for dx in 0..d1d {
                                y_e[dx + d1d * (dy + d1d * dz)] += wz * sol_xy[dx + dy * d1d];
                            }
                        }
                    }
                }
            });
    }
}
