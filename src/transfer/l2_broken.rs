//! Patch-local L2 projection between spaces with discontinuous bases.
//!
//! A broken basis has no inter-element continuity constraints, so the
//! projection onto each coarse element's patch of fine elements is
//! independent of every other patch. This engine therefore never forms a
//! global system: it stores one dense restriction block per coarse element
//! (and, when well-posed, the corresponding prolongation block) and applies
//! them by local gather/scatter.
use crate::assembly::{
    assemble_element_mass_matrix, assemble_element_mixed_mass_matrix, mass_quadrature_order,
    mixed_mass_quadrature_order, BasisBuffer,
};
use crate::error::TransferError;
use crate::operators::Operator;
use crate::quadrature::QuadratureRule;
use crate::refinement::{ElementPatchMap, RefinementTransforms};
use crate::space::{
    gather_element_values, scatter_add_element_values, scatter_element_values, TransferSpace,
};
use davenport::{define_thread_local_workspace, with_thread_local_workspace};
use log::debug;
use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, DVectorView, DVectorViewMut, Dyn, RealField, Scalar};

define_thread_local_workspace!(APPLY_WORKSPACE);

#[derive(Debug)]
struct ApplyWorkspace<T: Scalar> {
    x_el: DMatrix<T>,
    y_el: DMatrix<T>,
    dofs: Vec<usize>,
}

impl<T: RealField> Default for ApplyWorkspace<T> {
    fn default() -> Self {
        Self {
            x_el: DMatrix::zeros(0, 0),
            y_el: DMatrix::zeros(0, 0),
            dofs: Vec::new(),
        }
    }
}

/// Per-patch L2 projection (restriction) and its mass-weighted pseudo-inverse
/// (prolongation) for discontinuous bases.
///
/// The restriction of coarse element `iho` maps the element's DOF values to
/// the DOF values of the whole patch of fine elements refining it; it is the
/// patch-local L2 projection of coarse functions onto the fine space.
/// Prolongation blocks exist only when the fine space has at least as many
/// true DOFs as the coarse space; [`prolongate`](Self::prolongate) reports
/// [`TransferError::ProlongationNotAvailable`] otherwise.
pub struct BrokenL2Projection<'a, T: RealField> {
    ho: &'a dyn TransferSpace<T>,
    lor: &'a dyn TransferSpace<T>,
    patch: ElementPatchMap,
    // Flat column-major storage of the per-coarse-element blocks, addressed
    // through `offsets`. R blocks are (ndof_lor * nref) x ndof_ho; P blocks
    // have the transposed shape.
    offsets: Vec<usize>,
    r: Vec<T>,
    p: Option<Vec<T>>,
}

impl<'a, T: RealField + Copy> BrokenL2Projection<'a, T> {
    pub fn new(
        ho: &'a dyn TransferSpace<T>,
        lor: &'a dyn TransferSpace<T>,
        transforms: &RefinementTransforms<T>,
    ) -> Result<Self, TransferError> {
        let nel_ho = ho.num_elements();
        let patch = ElementPatchMap::from_transforms(nel_ho, transforms);

        // The prolongation is only well-defined when the fine space has at
        // least as many DOFs as the coarse space.
        let build_p = lor.num_true_dofs() * lor.vdim() >= ho.num_true_dofs() * ho.vdim();

        let mut engine = Self {
            ho,
            lor,
            patch,
            offsets: vec![0; nel_ho + 1],
            r: Vec::new(),
            p: None,
        };
        if nel_ho == 0 {
            return Ok(engine);
        }

        for iho in 0..nel_ho {
            let els = engine.patch.patch(iho);
            let block_len = ho.element_dof_count(iho)
                * els
                    .first()
                    .map(|&ilor| lor.element_dof_count(ilor) * els.len())
                    .unwrap_or(0);
            engine.offsets[iho + 1] = engine.offsets[iho] + block_len;
        }
        engine.r = vec![T::zero(); engine.offsets[nel_ho]];
        if build_p {
            engine.p = Some(vec![T::zero(); engine.offsets[nel_ho]]);
        }

        let mut buffer = BasisBuffer::default();
        for iho in 0..nel_ho {
            engine.build_patch_blocks(iho, transforms, build_p, &mut buffer);
        }

        debug!(
            "built broken L2 projection: {} coarse elements, {} fine elements, prolongation: {}",
            nel_ho,
            lor.num_elements(),
            build_p
        );
        Ok(engine)
    }

    fn build_patch_blocks(
        &mut self,
        iho: usize,
        transforms: &RefinementTransforms<T>,
        build_p: bool,
        buffer: &mut BasisBuffer<T>,
    ) {
        let els = self.patch.patch(iho);
        let nref = els.len();
        if nref == 0 {
            return;
        }
        let ndof_ho = self.ho.element_dof_count(iho);
        let ndof_lor = self.lor.element_dof_count(els[0]);
        let geom = self.ho.element_geometry(iho);

        let mut r_block = DMatrix::zeros(ndof_lor * nref, ndof_ho);
        let mut m_lor = build_p.then(|| DMatrix::<T>::zeros(ndof_lor * nref, ndof_lor * nref));
        let mut m_lor_el = DMatrix::zeros(ndof_lor, ndof_lor);
        let mut m_mixed_el = DMatrix::zeros(ndof_lor, ndof_ho);

        for (iref, &ilor) in els.iter().enumerate() {
            // Assemble and factor the fine element mass matrix; the block
            // rows of R are obtained by block-local solves since the patch
            // mass matrix is block diagonal.
            let mass_rule = QuadratureRule::gauss(
                self.lor.element_geometry(ilor),
                mass_quadrature_order(self.lor, ilor),
            );
            assemble_element_mass_matrix(
                DMatrixViewMut::from(&mut m_lor_el),
                self.lor,
                ilor,
                &mass_rule,
                buffer,
            )
            .expect("element mass assembly cannot fail for scalar bases");

            let embedding = transforms.embedding(ilor);
            let reference_map = transforms.reference_map(geom, embedding.matrix);
            let mixed_rule = QuadratureRule::gauss(
                self.lor.element_geometry(ilor),
                mixed_mass_quadrature_order(self.ho, iho, self.lor, ilor),
            );
            assemble_element_mixed_mass_matrix(
                DMatrixViewMut::from(&mut m_mixed_el),
                self.ho,
                iho,
                self.lor,
                ilor,
                reference_map,
                &mixed_rule,
                buffer,
            )
            .expect("mixed mass assembly cannot fail for scalar bases");

            let r_rows = m_lor_el
                .clone()
                .lu()
                .solve(&m_mixed_el)
                .expect("fine element mass matrix must be invertible");
            r_block
                .view_mut((iref * ndof_lor, 0), (ndof_lor, ndof_ho))
                .copy_from(&r_rows);

            if let Some(m_lor) = &mut m_lor {
                m_lor
                    .view_mut((iref * ndof_lor, iref * ndof_lor), (ndof_lor, ndof_lor))
                    .copy_from(&m_lor_el);
            }
        }

        let start = self.offsets[iho];
        self.r[start..start + r_block.len()].copy_from_slice(r_block.as_slice());

        if let Some(m_lor) = m_lor {
            // P = (Rᵀ M_lor R)⁻¹ Rᵀ M_lor, the patch-local pseudo-inverse:
            // it recovers coarse DOF values exactly from consistent fine data.
            let rt_m = r_block.transpose() * &m_lor;
            let rt_m_r = &rt_m * &r_block;
            let p_block = rt_m_r
                .lu()
                .solve(&rt_m)
                .expect("patch normal equations must be invertible");
            let p = self.p.as_mut().expect("P storage was allocated");
            p[start..start + p_block.len()].copy_from_slice(p_block.as_slice());
        }
    }

    fn block<'s>(&self, data: &'s [T], iho: usize, nrows: usize, ncols: usize) -> DMatrixView<'s, T> {
        let start = self.offsets[iho];
        DMatrixView::from_slice_generic(&data[start..start + nrows * ncols], Dyn(nrows), Dyn(ncols))
    }

    fn patch_dims(&self, iho: usize) -> (usize, usize, usize) {
        let els = self.patch.patch(iho);
        let nref = els.len();
        let ndof_lor = els
            .first()
            .map(|&ilor| self.lor.element_dof_count(ilor))
            .unwrap_or(0);
        (nref, ndof_lor, self.ho.element_dof_count(iho))
    }

    pub fn patch_map(&self) -> &ElementPatchMap {
        &self.patch
    }

    pub fn has_prolongation(&self) -> bool {
        self.p.is_some()
    }

    /// The restriction block of a coarse element,
    /// shape `(ndof_lor * nref) x ndof_ho`.
    pub fn restriction_block(&self, iho: usize) -> DMatrixView<'_, T> {
        let (nref, ndof_lor, ndof_ho) = self.patch_dims(iho);
        self.block(&self.r, iho, ndof_lor * nref, ndof_ho)
    }

    /// Recovers coarse DOF values from fine DOF values through the local
    /// pseudo-inverse blocks.
    pub fn prolongate(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        if self.patch.num_coarse_elements() == 0 {
            return Ok(());
        }
        let p = self.p.as_ref().ok_or(TransferError::ProlongationNotAvailable)?;
        let vdim = self.ho.vdim();

        with_thread_local_workspace(&APPLY_WORKSPACE, |ws: &mut ApplyWorkspace<T>| {
            y.fill(T::zero());
            for iho in 0..self.patch.num_coarse_elements() {
                let (nref, ndof_lor, ndof_ho) = self.patch_dims(iho);
                let p_block = self.block(p, iho, ndof_ho, ndof_lor * nref);

                ws.x_el.resize_mut(ndof_lor * nref, vdim, T::zero());
                self.gather_patch(&mut ws.x_el, x, iho, &mut ws.dofs);

                ws.y_el.resize_mut(ndof_ho, vdim, T::zero());
                ws.y_el.gemm(T::one(), &p_block, &ws.x_el, T::zero());

                self.populate_ho_dofs(&mut ws.dofs, iho);
                scatter_add_element_values(
                    y.rows_mut(0, y.len()),
                    &ws.y_el,
                    0,
                    &ws.dofs,
                    self.ho.num_dofs(),
                );
            }
        });
        Ok(())
    }

    /// The transpose action of [`prolongate`](Self::prolongate).
    pub fn prolongate_transpose(
        &self,
        mut y: DVectorViewMut<T>,
        x: DVectorView<T>,
    ) -> Result<(), TransferError> {
        if self.patch.num_coarse_elements() == 0 {
            return Ok(());
        }
        let p = self.p.as_ref().ok_or(TransferError::ProlongationNotAvailable)?;
        let vdim = self.ho.vdim();

        with_thread_local_workspace(&APPLY_WORKSPACE, |ws: &mut ApplyWorkspace<T>| {
            for iho in 0..self.patch.num_coarse_elements() {
                let (nref, ndof_lor, ndof_ho) = self.patch_dims(iho);
                let p_block = self.block(p, iho, ndof_ho, ndof_lor * nref);

                ws.x_el.resize_mut(ndof_ho, vdim, T::zero());
                self.populate_ho_dofs(&mut ws.dofs, iho);
                gather_element_values(&mut ws.x_el, x.rows(0, x.len()), 0, &ws.dofs, self.ho.num_dofs());

                ws.y_el.resize_mut(ndof_lor * nref, vdim, T::zero());
                ws.y_el.gemm_tr(T::one(), &p_block, &ws.x_el, T::zero());

                self.scatter_patch(&ws.y_el, y.rows_mut(0, y.len()), iho, &mut ws.dofs);
            }
        });
        Ok(())
    }

    fn populate_ho_dofs(&self, dofs: &mut Vec<usize>, iho: usize) {
        dofs.resize(self.ho.element_dof_count(iho), 0);
        self.ho.populate_element_dofs(dofs, iho);
    }

    // Gathers the fine DOF values of the whole patch, one fine element after
    // the other, into the rows of `x_el`.
    fn gather_patch(&self, x_el: &mut DMatrix<T>, x: DVectorView<T>, iho: usize, dofs: &mut Vec<usize>) {
        let els = self.patch.patch(iho);
        let ndof_lor = els
            .first()
            .map(|&ilor| self.lor.element_dof_count(ilor))
            .unwrap_or(0);
        for (iref, &ilor) in els.iter().enumerate() {
            dofs.resize(self.lor.element_dof_count(ilor), 0);
            self.lor.populate_element_dofs(dofs, ilor);
            gather_element_values(x_el, x.rows(0, x.len()), iref * ndof_lor, dofs, self.lor.num_dofs());
        }
    }

    // Writes patch rows of `y_el` into the fine vector, overwriting; every
    // fine DOF belongs to exactly one patch because the basis is broken.
    fn scatter_patch(&self, y_el: &DMatrix<T>, mut y: DVectorViewMut<T>, iho: usize, dofs: &mut Vec<usize>) {
        let els = self.patch.patch(iho);
        let ndof_lor = els
            .first()
            .map(|&ilor| self.lor.element_dof_count(ilor))
            .unwrap_or(0);
        for (iref, &ilor) in els.iter().enumerate() {
            dofs.resize(self.lor.element_dof_count(ilor), 0);
            self.lor.populate_element_dofs(dofs, ilor);
            scatter_element_values(y.rows_mut(0, y.len()), y_el, iref * ndof_lor, dofs, self.lor.num_dofs());
        }
    }
}

impl<'a, T: RealField + Copy> Operator<T> for BrokenL2Projection<'a, T> {
    fn nrows(&self) -> usize {
        self.lor.vdim() * self.lor.num_dofs()
    }

    fn ncols(&self) -> usize {
        self.ho.vdim() * self.ho.num_dofs()
    }

    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        let vdim = self.ho.vdim();
        with_thread_local_workspace(&APPLY_WORKSPACE, |ws: &mut ApplyWorkspace<T>| {
            for iho in 0..self.patch.num_coarse_elements() {
                let (nref, ndof_lor, ndof_ho) = self.patch_dims(iho);
                let r_block = self.block(&self.r, iho, ndof_lor * nref, ndof_ho);

                ws.x_el.resize_mut(ndof_ho, vdim, T::zero());
                self.populate_ho_dofs(&mut ws.dofs, iho);
                gather_element_values(&mut ws.x_el, x.rows(0, x.len()), 0, &ws.dofs, self.ho.num_dofs());

                ws.y_el.resize_mut(ndof_lor * nref, vdim, T::zero());
                ws.y_el.gemm(T::one(), &r_block, &ws.x_el, T::zero());

                self.scatter_patch(&ws.y_el, y.rows_mut(0, y.len()), iho, &mut ws.dofs);
            }
        });
        Ok(())
    }

    fn apply_transpose(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        let vdim = self.ho.vdim();
        with_thread_local_workspace(&APPLY_WORKSPACE, |ws: &mut ApplyWorkspace<T>| {
            // Fine DOFs are visited exactly once across patches, so the
            // accumulation below cannot double count.
            y.fill(T::zero());
            for iho in 0..self.patch.num_coarse_elements() {
                let (nref, ndof_lor, ndof_ho) = self.patch_dims(iho);
                let r_block = self.block(&self.r, iho, ndof_lor * nref, ndof_ho);

                ws.x_el.resize_mut(ndof_lor * nref, vdim, T::zero());
                self.gather_patch(&mut ws.x_el, x, iho, &mut ws.dofs);

                ws.y_el.resize_mut(ndof_ho, vdim, T::zero());
                ws.y_el.gemm_tr(T::one(), &r_block, &ws.x_el, T::zero());

                self.populate_ho_dofs(&mut ws.dofs, iho);
                scatter_add_element_values(
                    y.rows_mut(0, y.len()),
                    &ws.y_el,
                    0,
                    &ws.dofs,
                    self.ho.num_dofs(),
                );
            }
        });
        Ok(())
    }
}
