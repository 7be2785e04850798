//! Global L2 projection between spaces with continuous (conforming) bases.
//!
//! With inter-element continuity, fine DOFs shared between elements couple
//! patches of different coarse elements, so the patch-local reasoning of the
//! broken engine no longer applies. This engine assembles process-global
//! sparse operators instead: a lumped-mass-weighted restriction `R`, the raw
//! mixed mass `M_LH`, and the symmetric positive definite system
//! `Rᵀ M_LH` whose solution realizes the exact (non-lumped) prolongation
//! through a preconditioned conjugate gradient solve.
use crate::assembly::{
    accumulate_element_lumped_mass, assemble_element_mixed_mass_matrix, mass_quadrature_order,
    mixed_mass_quadrature_order, BasisBuffer,
};
use crate::cg::{ConjugateGradient, JacobiPreconditioner, LinearOperator};
use crate::error::TransferError;
use crate::operators::{csr_apply, csr_apply_transpose, Operator};
use crate::quadrature::QuadratureRule;
use crate::refinement::{ElementPatchMap, RefinementTransforms};
use crate::space::TransferSpace;
use log::debug;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut, RealField};
use nalgebra_sparse::CsrMatrix;
use std::cell::RefCell;

/// Global lumped-mass L2 projection engine for conforming bases.
///
/// `R` is an explicit, sparse, lumped-mass-based projection: an
/// approximation of the exact L2 projection that becomes exact when the
/// fine mass matrix is diagonal. The exact prolongation is recovered by
/// solving `Rᵀ M_LH y = M_LHᵀ x` with conjugate gradients, using a diagonal
/// smoother by default; a caller may substitute an externally supplied
/// preconditioner (e.g. algebraic multigrid in a distributed setting).
pub struct ConformingL2Projection<'a, T: RealField> {
    ho: &'a dyn TransferSpace<T>,
    lor: &'a dyn TransferSpace<T>,
    r_mat: CsrMatrix<T>,
    m_lh: CsrMatrix<T>,
    rtxm_lh: CsrMatrix<T>,
    preconditioner: Box<dyn LinearOperator<T>>,
    cg: RefCell<ConjugateGradient<T>>,
    degenerate: bool,
}

impl<'a, T: RealField + Copy> ConformingL2Projection<'a, T> {
    pub fn new(
        ho: &'a dyn TransferSpace<T>,
        lor: &'a dyn TransferSpace<T>,
        transforms: &RefinementTransforms<T>,
    ) -> Result<Self, TransferError> {
        let nel_ho = ho.num_elements();
        let ntrue_ho = ho.num_true_dofs();
        let ntrue_lor = lor.num_true_dofs();

        // An empty coarse mesh short-circuits to empty operators with zero
        // action; nothing can be assembled.
        if nel_ho == 0 {
            let rtxm_lh = CsrMatrix::zeros(ntrue_ho, ntrue_ho);
            let preconditioner = Box::new(JacobiPreconditioner::from_csr(&rtxm_lh));
            return Ok(Self {
                ho,
                lor,
                r_mat: CsrMatrix::zeros(ntrue_lor, ntrue_ho),
                m_lh: CsrMatrix::zeros(ntrue_lor, ntrue_ho),
                rtxm_lh,
                preconditioner,
                cg: RefCell::new(ConjugateGradient::new()),
                degenerate: true,
            });
        }

        let patch = ElementPatchMap::from_transforms(nel_ho, transforms);
        let ml_inv = lumped_mass_inverse(lor, &patch);
        let (mut r_mat, mut m_lh) = compute_sparse_r_and_m_lh(ho, lor, &patch, transforms, &ml_inv);

        // Couple the local-DOF matrices with the conforming constraints of
        // either side, for every combination of constrained sides.
        match (ho.conforming_prolongation(), lor.conforming_prolongation()) {
            (Some(p_ho), Some(p_lor)) => {
                let p_lor_t = p_lor.transpose();
                r_mat = &(&p_lor_t * &r_mat) * p_ho;
                m_lh = &(&p_lor_t * &m_lh) * p_ho;
            }
            (Some(p_ho), None) => {
                r_mat = &r_mat * p_ho;
                m_lh = &m_lh * p_ho;
            }
            (None, Some(p_lor)) => {
                let p_lor_t = p_lor.transpose();
                r_mat = &p_lor_t * &r_mat;
                m_lh = &p_lor_t * &m_lh;
            }
            (None, None) => {}
        }

        let rtxm_lh = &r_mat.transpose() * &m_lh;
        let preconditioner = Box::new(JacobiPreconditioner::from_csr(&rtxm_lh));

        debug!(
            "built conforming L2 projection: R is {}x{} with {} non-zeros",
            r_mat.nrows(),
            r_mat.ncols(),
            r_mat.nnz()
        );

        Ok(Self {
            ho,
            lor,
            r_mat,
            m_lh,
            rtxm_lh,
            preconditioner,
            cg: RefCell::new(ConjugateGradient::new()),
            degenerate: false,
        })
    }

    /// Relative tolerance of the prolongation solve.
    pub fn set_rel_tol(&mut self, rel_tol: T) {
        self.cg.get_mut().set_rel_tol(rel_tol);
    }

    /// Absolute tolerance of the prolongation solve.
    pub fn set_abs_tol(&mut self, abs_tol: T) {
        self.cg.get_mut().set_abs_tol(abs_tol);
    }

    /// Replaces the diagonal smoother with an externally supplied
    /// preconditioner for the `Rᵀ M_LH` system.
    pub fn set_preconditioner(&mut self, preconditioner: Box<dyn LinearOperator<T>>) {
        self.preconditioner = preconditioner;
    }

    /// The assembled restriction, on true DOFs of both sides.
    pub fn restriction_matrix(&self) -> &CsrMatrix<T> {
        &self.r_mat
    }

    /// The assembled mixed mass matrix, on true DOFs of both sides.
    pub fn mixed_mass_matrix(&self) -> &CsrMatrix<T> {
        &self.m_lh
    }

    /// The symmetric system `Rᵀ M_LH` defining the exact prolongation.
    pub fn normal_matrix(&self) -> &CsrMatrix<T> {
        &self.rtxm_lh
    }

    fn vdim(&self) -> usize {
        self.ho.vdim()
    }

    // x (local DOFs) -> X (true DOFs), through the conforming restriction.
    fn to_true_dofs(space: &dyn TransferSpace<T>, x: DVectorView<T>, x_true: &mut DVector<T>) {
        let n = space.num_dofs();
        let nt = space.num_true_dofs();
        if let Some(r) = space.conforming_restriction() {
            for d in 0..x.len() / n {
                csr_apply(x_true.rows_mut(d * nt, nt), r, x.rows(d * n, n));
            }
        } else {
            x_true.copy_from(&x);
        }
    }

    // X (true DOFs) -> x (local DOFs), through the conforming prolongation.
    fn from_true_dofs(space: &dyn TransferSpace<T>, x_true: &DVector<T>, mut x: DVectorViewMut<T>) {
        let n = space.num_dofs();
        let nt = space.num_true_dofs();
        if let Some(p) = space.conforming_prolongation() {
            for d in 0..x.len() / n {
                csr_apply(x.rows_mut(d * n, n), p, x_true.rows(d * nt, nt));
            }
        } else {
            x.copy_from(x_true);
        }
    }

    // The transpose counterparts: Pᵀ maps local to true, Rᵀ true to local.
    fn to_true_dofs_transpose(space: &dyn TransferSpace<T>, x: DVectorView<T>, x_true: &mut DVector<T>) {
        let n = space.num_dofs();
        let nt = space.num_true_dofs();
        if let Some(p) = space.conforming_prolongation() {
            for d in 0..x.len() / n {
                csr_apply_transpose(x_true.rows_mut(d * nt, nt), p, x.rows(d * n, n));
            }
        } else {
            x_true.copy_from(&x);
        }
    }

    fn from_true_dofs_transpose(
        space: &dyn TransferSpace<T>,
        x_true: &DVector<T>,
        mut x: DVectorViewMut<T>,
    ) {
        let n = space.num_dofs();
        let nt = space.num_true_dofs();
        if let Some(r) = space.conforming_restriction() {
            for d in 0..x.len() / n {
                csr_apply_transpose(x.rows_mut(d * n, n), r, x_true.rows(d * nt, nt));
            }
        } else {
            x.copy_from(x_true);
        }
    }

    /// Solves `Rᵀ M_LH y = M_LHᵀ x` per vector component, realizing the
    /// exact L2 prolongation from the fine to the coarse space.
    pub fn prolongate(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        if self.degenerate {
            y.fill(T::zero());
            return Ok(());
        }
        let vdim = self.vdim();
        let ntrue_ho = self.ho.num_true_dofs();
        let ntrue_lor = self.lor.num_true_dofs();

        let mut x_true = DVector::zeros(vdim * ntrue_lor);
        Self::to_true_dofs(self.lor, x, &mut x_true);

        let mut xbar = DVector::zeros(ntrue_ho);
        let mut y_true = DVector::zeros(vdim * ntrue_ho);
        let mut cg = self.cg.borrow_mut();
        for d in 0..vdim {
            csr_apply_transpose(
                DVectorViewMut::from(&mut xbar),
                &self.m_lh,
                x_true.rows(d * ntrue_lor, ntrue_lor),
            );
            cg.solve(
                &self.rtxm_lh,
                &*self.preconditioner,
                DVectorView::from(&xbar),
                y_true.rows_mut(d * ntrue_ho, ntrue_ho),
            )?;
        }
        drop(cg);

        Self::from_true_dofs(self.ho, &y_true, y);
        Ok(())
    }

    /// The transpose of [`prolongate`](Self::prolongate): solves the same
    /// system, then applies `M_LH`.
    pub fn prolongate_transpose(
        &self,
        mut y: DVectorViewMut<T>,
        x: DVectorView<T>,
    ) -> Result<(), TransferError> {
        if self.degenerate {
            y.fill(T::zero());
            return Ok(());
        }
        let vdim = self.vdim();
        let ntrue_ho = self.ho.num_true_dofs();
        let ntrue_lor = self.lor.num_true_dofs();

        let mut x_true = DVector::zeros(vdim * ntrue_ho);
        Self::to_true_dofs_transpose(self.ho, x, &mut x_true);

        let mut xbar = DVector::zeros(ntrue_ho);
        let mut y_true = DVector::zeros(vdim * ntrue_lor);
        let mut cg = self.cg.borrow_mut();
        for d in 0..vdim {
            xbar.fill(T::zero());
            cg.solve(
                &self.rtxm_lh,
                &*self.preconditioner,
                x_true.rows(d * ntrue_ho, ntrue_ho),
                DVectorViewMut::from(&mut xbar),
            )?;
            csr_apply(
                y_true.rows_mut(d * ntrue_lor, ntrue_lor),
                &self.m_lh,
                DVectorView::from(&xbar),
            );
        }
        drop(cg);

        Self::from_true_dofs_transpose(self.lor, &y_true, y);
        Ok(())
    }
}

impl<'a, T: RealField + Copy> Operator<T> for ConformingL2Projection<'a, T> {
    fn nrows(&self) -> usize {
        self.lor.vdim() * self.lor.num_dofs()
    }

    fn ncols(&self) -> usize {
        self.ho.vdim() * self.ho.num_dofs()
    }

    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        if self.degenerate {
            y.fill(T::zero());
            return Ok(());
        }
        let vdim = self.vdim();
        let ntrue_ho = self.ho.num_true_dofs();
        let ntrue_lor = self.lor.num_true_dofs();

        let mut x_true = DVector::zeros(vdim * ntrue_ho);
        Self::to_true_dofs(self.ho, x, &mut x_true);

        let mut y_true = DVector::zeros(vdim * ntrue_lor);
        for d in 0..vdim {
            csr_apply(
                y_true.rows_mut(d * ntrue_lor, ntrue_lor),
                &self.r_mat,
                x_true.rows(d * ntrue_ho, ntrue_ho),
            );
        }

        Self::from_true_dofs(self.lor, &y_true, y);
        Ok(())
    }

    fn apply_transpose(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        if self.degenerate {
            y.fill(T::zero());
            return Ok(());
        }
        let vdim = self.vdim();
        let ntrue_ho = self.ho.num_true_dofs();
        let ntrue_lor = self.lor.num_true_dofs();

        let mut x_true = DVector::zeros(vdim * ntrue_lor);
        Self::to_true_dofs_transpose(self.lor, x, &mut x_true);

        let mut y_true = DVector::zeros(vdim * ntrue_ho);
        for d in 0..vdim {
            csr_apply_transpose(
                y_true.rows_mut(d * ntrue_ho, ntrue_ho),
                &self.r_mat,
                x_true.rows(d * ntrue_lor, ntrue_lor),
            );
        }

        Self::from_true_dofs_transpose(self.ho, &y_true, y);
        Ok(())
    }
}

/// Accumulates every fine element's row-summed mass contributions into a
/// global lumped mass vector, inverts it entry-wise on the independent
/// (true) DOFs, and maps the result back to local DOFs.
///
/// Accumulating before inverting is what makes shared conforming DOFs come
/// out right: each shared DOF receives the contributions of every element
/// touching it before the reciprocal is taken.
pub fn lumped_mass_inverse<T: RealField + Copy>(
    lor: &dyn TransferSpace<T>,
    patch: &ElementPatchMap,
) -> DVector<T> {
    let mut ml = DVector::zeros(lor.num_dofs());
    let mut buffer = BasisBuffer::default();
    let mut ml_el: Vec<T> = Vec::new();
    let mut dofs: Vec<usize> = Vec::new();

    for els in patch.iter() {
        for &ilor in els {
            let n = lor.element_dof_count(ilor);
            ml_el.clear();
            ml_el.resize(n, T::zero());
            let rule = QuadratureRule::gauss(
                lor.element_geometry(ilor),
                mass_quadrature_order(lor, ilor),
            );
            accumulate_element_lumped_mass(&mut ml_el, lor, ilor, &rule, &mut buffer)
                .expect("lumped mass assembly cannot fail for scalar bases");
            dofs.resize(n, 0);
            lor.populate_element_dofs(&mut dofs, ilor);
            for (i, &dof) in dofs.iter().enumerate() {
                ml[dof] += ml_el[i];
            }
        }
    }

    if let Some(p) = lor.conforming_prolongation() {
        let mut ml_true = DVector::zeros(p.ncols());
        csr_apply_transpose(DVectorViewMut::from(&mut ml_true), p, DVectorView::from(&ml));
        ml_true.apply(|x| *x = T::one() / *x);
        csr_apply(DVectorViewMut::from(&mut ml), p, DVectorView::from(&ml_true));
    } else {
        ml.apply(|x| *x = T::one() / *x);
    }
    ml
}

// Snapshot of a space's element-to-DOF table in CSR-like form.
fn element_dof_table<T: RealField>(space: &dyn TransferSpace<T>) -> (Vec<usize>, Vec<usize>) {
    let nel = space.num_elements();
    let mut offsets = vec![0; nel + 1];
    for el in 0..nel {
        offsets[el + 1] = offsets[el] + space.element_dof_count(el);
    }
    let mut dofs = vec![0; offsets[nel]];
    for el in 0..nel {
        space.populate_element_dofs(&mut dofs[offsets[el]..offsets[el + 1]], el);
    }
    (offsets, dofs)
}

// The shared sparsity pattern of R and M_LH: fine DOF i couples to every
// coarse DOF of every coarse element whose patch contains a fine element
// touching i. Built by transposing the fine element-to-DOF table and
// unioning per fine DOF with a last-seen marker; rows come out sorted.
fn build_pattern<T: RealField + Copy>(
    ho: &dyn TransferSpace<T>,
    lor: &dyn TransferSpace<T>,
    transforms: &RefinementTransforms<T>,
) -> (Vec<usize>, Vec<usize>) {
    let ndof_ho = ho.num_dofs();
    let ndof_lor = lor.num_dofs();
    let (el_dof_ho_offsets, el_dof_ho) = element_dof_table(ho);
    let (el_dof_lor_offsets, el_dof_lor) = element_dof_table(lor);

    // Transpose the fine table into DOF -> elements.
    let mut dof_el_offsets = vec![0; ndof_lor + 1];
    for &dof in &el_dof_lor {
        dof_el_offsets[dof + 1] += 1;
    }
    for i in 0..ndof_lor {
        dof_el_offsets[i + 1] += dof_el_offsets[i];
    }
    let mut next = dof_el_offsets.clone();
    let mut dof_elements = vec![0; el_dof_lor.len()];
    for el in 0..lor.num_elements() {
        for &dof in &el_dof_lor[el_dof_lor_offsets[el]..el_dof_lor_offsets[el + 1]] {
            dof_elements[next[dof]] = el;
            next[dof] += 1;
        }
    }

    let mut marker = vec![usize::MAX; ndof_ho];
    let mut row_counts = vec![0; ndof_lor];
    for ilor in 0..ndof_lor {
        for &el_lor in &dof_elements[dof_el_offsets[ilor]..dof_el_offsets[ilor + 1]] {
            let iho = transforms.embedding(el_lor).parent;
            for &dof_ho in &el_dof_ho[el_dof_ho_offsets[iho]..el_dof_ho_offsets[iho + 1]] {
                if marker[dof_ho] != ilor {
                    marker[dof_ho] = ilor;
                    row_counts[ilor] += 1;
                }
            }
        }
    }

    let mut offsets = vec![0; ndof_lor + 1];
    for i in 0..ndof_lor {
        offsets[i + 1] = offsets[i] + row_counts[i];
    }

    let mut marker = vec![usize::MAX; ndof_ho];
    let mut indices = vec![0; offsets[ndof_lor]];
    let mut fill = offsets.clone();
    for ilor in 0..ndof_lor {
        for &el_lor in &dof_elements[dof_el_offsets[ilor]..dof_el_offsets[ilor + 1]] {
            let iho = transforms.embedding(el_lor).parent;
            for &dof_ho in &el_dof_ho[el_dof_ho_offsets[iho]..el_dof_ho_offsets[iho + 1]] {
                if marker[dof_ho] != ilor {
                    marker[dof_ho] = ilor;
                    indices[fill[ilor]] = dof_ho;
                    fill[ilor] += 1;
                }
            }
        }
        indices[offsets[ilor]..offsets[ilor + 1]].sort_unstable();
    }

    (offsets, indices)
}

// Adds a dense block into rows/columns of the raw CSR arrays, optionally
// scaling each block row by the lumped mass inverse of its fine DOF.
fn add_block_to_csr<T: RealField + Copy>(
    offsets: &[usize],
    indices: &[usize],
    values: &mut [T],
    row_dofs: &[usize],
    col_dofs: &[usize],
    block: &DMatrix<T>,
    row_scaling: Option<&DVector<T>>,
) {
    for (i, &row) in row_dofs.iter().enumerate() {
        let row_indices = &indices[offsets[row]..offsets[row + 1]];
        let scale = row_scaling.map(|s| s[row]).unwrap_or_else(T::one);
        for (j, &col) in col_dofs.iter().enumerate() {
            let position = row_indices
                .binary_search(&col)
                .expect("sparsity pattern must contain every assembled entry");
            values[offsets[row] + position] += scale * block[(i, j)];
        }
    }
}

// Fills M_LH with the local mixed mass blocks and R with the same blocks
// row-scaled by the inverted lumped mass.
fn compute_sparse_r_and_m_lh<T: RealField + Copy>(
    ho: &dyn TransferSpace<T>,
    lor: &dyn TransferSpace<T>,
    patch: &ElementPatchMap,
    transforms: &RefinementTransforms<T>,
    ml_inv: &DVector<T>,
) -> (CsrMatrix<T>, CsrMatrix<T>) {
    let (offsets, indices) = build_pattern(ho, lor, transforms);
    let mut r_values = vec![T::zero(); indices.len()];
    let mut m_values = vec![T::zero(); indices.len()];

    let mut buffer = BasisBuffer::default();
    let mut dofs_ho: Vec<usize> = Vec::new();
    let mut dofs_lor: Vec<usize> = Vec::new();

    for iho in 0..patch.num_coarse_elements() {
        let geom = ho.element_geometry(iho);
        let ndof_ho = ho.element_dof_count(iho);
        dofs_ho.resize(ndof_ho, 0);
        ho.populate_element_dofs(&mut dofs_ho, iho);

        for &ilor in patch.patch(iho) {
            let ndof_lor = lor.element_dof_count(ilor);
            let embedding = transforms.embedding(ilor);
            let reference_map = transforms.reference_map(geom, embedding.matrix);
            let rule = QuadratureRule::gauss(
                lor.element_geometry(ilor),
                mixed_mass_quadrature_order(ho, iho, lor, ilor),
            );

            let mut m_el = DMatrix::zeros(ndof_lor, ndof_ho);
            assemble_element_mixed_mass_matrix(
                nalgebra::DMatrixViewMut::from(&mut m_el),
                ho,
                iho,
                lor,
                ilor,
                reference_map,
                &rule,
                &mut buffer,
            )
            .expect("mixed mass assembly cannot fail for scalar bases");

            dofs_lor.resize(ndof_lor, 0);
            lor.populate_element_dofs(&mut dofs_lor, ilor);

            add_block_to_csr(&offsets, &indices, &mut m_values, &dofs_lor, &dofs_ho, &m_el, None);
            add_block_to_csr(
                &offsets,
                &indices,
                &mut r_values,
                &dofs_lor,
                &dofs_ho,
                &m_el,
                Some(ml_inv),
            );
        }
    }

    let ndof_ho = ho.num_dofs();
    let ndof_lor = lor.num_dofs();
    let r_mat = CsrMatrix::try_from_csr_data(ndof_lor, ndof_ho, offsets.clone(), indices.clone(), r_values)
        .expect("pattern construction produces valid CSR data");
    let m_lh = CsrMatrix::try_from_csr_data(ndof_lor, ndof_ho, offsets, indices, m_values)
        .expect("pattern construction produces valid CSR data");
    (r_mat, m_lh)
}
