//! Interpolation-based transfer for nested conforming spaces.
//!
//! When the coarse space is exactly nested in the fine space's refinement
//! hierarchy, transfer does not require projection at all: the forward map
//! is exact interpolation through the refinement embeddings, and the
//! backward map is its left-inverse with respect to a mass inner product.
use crate::assembly::{
    assemble_element_mass_matrix, assemble_element_vector_mass_matrix, mass_quadrature_order,
    BasisBuffer,
};
use crate::error::TransferError;
use crate::operators::Operator;
use crate::quadrature::QuadratureRule;
use crate::refinement::{ElementPatchMap, RefinementTransforms};
use crate::space::{
    gather_element_values, scatter_add_element_values, scatter_element_values, MapType,
    ReferenceGeometry, TransferSpace,
};
use davenport::{define_thread_local_workspace, with_thread_local_workspace};
use log::debug;
use nalgebra::{DMatrix, DMatrixView, DVectorView, DVectorViewMut, Dyn, RealField};
use nalgebra_sparse::CsrMatrix;
use rustc_hash::FxHashMap;

define_thread_local_workspace!(INTERPOLATION_WORKSPACE);

#[derive(Debug)]
struct ApplyWorkspace<T> {
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

/// The mass operator used by the derefinement left-inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MassKind {
    /// Standard scalar mass matrix.
    Scalar,
    /// Vector-valued mass matrix for Piola/covariantly mapped bases.
    VectorField,
}

/// The mass operator matching a space's field map type.
pub fn mass_kind_for(map_type: MapType) -> MassKind {
    match map_type {
        MapType::Value | MapType::Integral => MassKind::Scalar,
        MapType::HDiv | MapType::HCurl => MassKind::VectorField,
    }
}

// The local refinement interpolation matrix of one fine element: row `i`
// holds the coarse basis evaluated at the embedded image of the fine
// element's node `i`.
fn local_interpolation_matrix<T: RealField + Copy>(
    ho: &dyn TransferSpace<T>,
    iho: usize,
    lor: &dyn TransferSpace<T>,
    ilor: usize,
    transforms: &RefinementTransforms<T>,
) -> DMatrix<T> {
    let d = lor.reference_dim();
    let ndof_lor = lor.element_dof_count(ilor);
    let ndof_ho = ho.element_dof_count(iho);
    let embedding = transforms.embedding(ilor);
    let geom = ho.element_geometry(iho);
    let reference_map = transforms.reference_map(geom, embedding.matrix);

    let mut nodes = vec![T::zero(); d * ndof_lor];
    lor.populate_element_nodes(&mut nodes, ilor);

    let mut xi_ho = vec![T::zero(); d];
    let mut shape = vec![T::zero(); ndof_ho];
    let mut local_p = DMatrix::zeros(ndof_lor, ndof_ho);
    for i in 0..ndof_lor {
        reference_map.map(&nodes[i * d..(i + 1) * d], &mut xi_ho);
        ho.populate_element_basis(iho, &mut shape, &xi_ho);
        for j in 0..ndof_ho {
            local_p[(i, j)] = shape[j];
        }
    }
    local_p
}

/// The structural, matrix-free refinement operator: exact interpolation of
/// coarse DOF values onto the fine space, computed from the refinement
/// pattern alone.
///
/// Local interpolation matrices are cached per `(geometry, embedding)`
/// pair, so the per-element work is a single dense multiply.
pub struct RefinementOperator<'a, T: RealField> {
    ho: &'a dyn TransferSpace<T>,
    lor: &'a dyn TransferSpace<T>,
    transforms: &'a RefinementTransforms<T>,
    local_p: FxHashMap<(ReferenceGeometry, usize), DMatrix<T>>,
}

impl<'a, T: RealField + Copy> RefinementOperator<'a, T> {
    pub fn new(
        ho: &'a dyn TransferSpace<T>,
        lor: &'a dyn TransferSpace<T>,
        transforms: &'a RefinementTransforms<T>,
    ) -> Self {
        let mut local_p = FxHashMap::default();
        for ilor in 0..lor.num_elements() {
            let embedding = transforms.embedding(ilor);
            let geom = ho.element_geometry(embedding.parent);
            local_p
                .entry((geom, embedding.matrix))
                .or_insert_with(|| local_interpolation_matrix(ho, embedding.parent, lor, ilor, transforms));
        }
        debug!(
            "built refinement operator with {} distinct local interpolation matrices",
            local_p.len()
        );
        Self {
            ho,
            lor,
            transforms,
            local_p,
        }
    }

    fn local_matrix(&self, ilor: usize) -> (&DMatrix<T>, usize) {
        let embedding = self.transforms.embedding(ilor);
        let geom = self.ho.element_geometry(embedding.parent);
        (
            &self.local_p[&(geom, embedding.matrix)],
            embedding.parent,
        )
    }

    /// Assembles the operator into an explicit sparse matrix over scalar
    /// DOFs. Rows of fine DOFs shared between fine elements are written by
    /// the first element touching them; the entries are consistent for
    /// conforming nested spaces.
    pub fn assemble(&self) -> CsrMatrix<T> {
        let ndof_lor = self.lor.num_dofs();
        let mut rows: Vec<Option<(Vec<usize>, Vec<T>)>> = vec![None; ndof_lor];
        let mut dofs_lor = Vec::new();
        let mut dofs_ho = Vec::new();

        for ilor in 0..self.lor.num_elements() {
            let (local_p, parent) = self.local_matrix(ilor);
            dofs_lor.resize(self.lor.element_dof_count(ilor), 0);
            self.lor.populate_element_dofs(&mut dofs_lor, ilor);
            dofs_ho.resize(self.ho.element_dof_count(parent), 0);
            self.ho.populate_element_dofs(&mut dofs_ho, parent);

            for (i, &row) in dofs_lor.iter().enumerate() {
                if rows[row].is_none() {
                    // Sort the row's columns, carrying the values along
                    let mut entries: Vec<(usize, T)> = dofs_ho
                        .iter()
                        .enumerate()
                        .map(|(j, &col)| (col, local_p[(i, j)]))
                        .collect();
                    entries.sort_unstable_by_key(|&(col, _)| col);
                    let (cols, vals): (Vec<usize>, Vec<T>) = entries.into_iter().unzip();
                    rows[row] = Some((cols, vals));
                }
            }
        }

        let mut offsets = Vec::with_capacity(ndof_lor + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        offsets.push(0);
        for row in rows {
            if let Some((cols, vals)) = row {
                indices.extend(cols);
                values.extend(vals);
            }
            offsets.push(indices.len());
        }

        CsrMatrix::try_from_csr_data(ndof_lor, self.ho.num_dofs(), offsets, indices, values)
            .expect("row-wise construction produces valid CSR data")
    }
}

impl<'a, T: RealField + Copy> Operator<T> for RefinementOperator<'a, T> {
    fn nrows(&self) -> usize {
        self.lor.vdim() * self.lor.num_dofs()
    }

    fn ncols(&self) -> usize {
        self.ho.vdim() * self.ho.num_dofs()
    }

    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        let vdim = self.ho.vdim();
        with_thread_local_workspace(&INTERPOLATION_WORKSPACE, |ws: &mut ApplyWorkspace<T>| {
            for ilor in 0..self.lor.num_elements() {
                let (local_p, parent) = self.local_matrix(ilor);

                ws.x_el.resize_mut(local_p.ncols(), vdim, T::zero());
                ws.dofs.resize(self.ho.element_dof_count(parent), 0);
                self.ho.populate_element_dofs(&mut ws.dofs, parent);
                gather_element_values(&mut ws.x_el, x.rows(0, x.len()), 0, &ws.dofs, self.ho.num_dofs());

                ws.y_el.resize_mut(local_p.nrows(), vdim, T::zero());
                ws.y_el.gemm(T::one(), local_p, &ws.x_el, T::zero());

                ws.dofs.resize(self.lor.element_dof_count(ilor), 0);
                self.lor.populate_element_dofs(&mut ws.dofs, ilor);
                scatter_element_values(y.rows_mut(0, y.len()), &ws.y_el, 0, &ws.dofs, self.lor.num_dofs());
            }
        });
        Ok(())
    }

    fn apply_transpose(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        let vdim = self.ho.vdim();
        let ndof_lor = self.lor.num_dofs();
        with_thread_local_workspace(&INTERPOLATION_WORKSPACE, |ws: &mut ApplyWorkspace<T>| {
            y.fill(T::zero());
            // Shared fine DOFs appear in several fine elements; only the
            // first element touching a DOF may contribute its value, ties
            // broken by element traversal order.
            let mut processed = vec![false; ndof_lor];
            for ilor in 0..self.lor.num_elements() {
                let (local_p, parent) = self.local_matrix(ilor);

                ws.x_el.resize_mut(local_p.nrows(), vdim, T::zero());
                ws.dofs.resize(self.lor.element_dof_count(ilor), 0);
                self.lor.populate_element_dofs(&mut ws.dofs, ilor);
                gather_element_values(&mut ws.x_el, x.rows(0, x.len()), 0, &ws.dofs, ndof_lor);
                for (i, &dof) in ws.dofs.iter().enumerate() {
                    if processed[dof] {
                        ws.x_el.row_mut(i).fill(T::zero());
                    }
                }

                ws.y_el.resize_mut(local_p.ncols(), vdim, T::zero());
                ws.y_el.gemm_tr(T::one(), local_p, &ws.x_el, T::zero());

                for &dof in &ws.dofs {
                    processed[dof] = true;
                }

                ws.dofs.resize(self.ho.element_dof_count(parent), 0);
                self.ho.populate_element_dofs(&mut ws.dofs, parent);
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

/// The derefinement operator: the left-inverse of the refinement
/// interpolation with respect to a mass inner product on the fine space,
/// `B = (Fᵀ M F)⁻¹ Fᵀ M` per coarse element patch.
///
/// Applied to fine data that interpolates a coarse function, it recovers
/// that coarse function exactly.
pub struct DerefinementOperator<'a, T: RealField> {
    ho: &'a dyn TransferSpace<T>,
    lor: &'a dyn TransferSpace<T>,
    patch: ElementPatchMap,
    offsets: Vec<usize>,
    b: Vec<T>,
}

impl<'a, T: RealField + Copy> DerefinementOperator<'a, T> {
    pub fn new(
        ho: &'a dyn TransferSpace<T>,
        lor: &'a dyn TransferSpace<T>,
        transforms: &'a RefinementTransforms<T>,
        mass_kind: MassKind,
    ) -> Result<Self, TransferError> {
        let nel_ho = ho.num_elements();
        let patch = ElementPatchMap::from_transforms(nel_ho, transforms);

        let mut offsets = vec![0; nel_ho + 1];
        for iho in 0..nel_ho {
            let els = patch.patch(iho);
            let block_len = ho.element_dof_count(iho)
                * els
                    .first()
                    .map(|&ilor| lor.element_dof_count(ilor) * els.len())
                    .unwrap_or(0);
            offsets[iho + 1] = offsets[iho] + block_len;
        }
        let mut b = vec![T::zero(); offsets[nel_ho]];

        let mut buffer = BasisBuffer::default();
        for iho in 0..nel_ho {
            let els = patch.patch(iho);
            let nref = els.len();
            if nref == 0 {
                continue;
            }
            let ndof_ho = ho.element_dof_count(iho);
            let ndof_lor = lor.element_dof_count(els[0]);

            let mut f = DMatrix::zeros(ndof_lor * nref, ndof_ho);
            let mut m = DMatrix::zeros(ndof_lor * nref, ndof_lor * nref);
            let mut m_el = DMatrix::zeros(ndof_lor, ndof_lor);

            for (iref, &ilor) in els.iter().enumerate() {
                let local_p = local_interpolation_matrix(ho, iho, lor, ilor, transforms);
                f.view_mut((iref * ndof_lor, 0), (ndof_lor, ndof_ho))
                    .copy_from(&local_p);

                let rule = QuadratureRule::gauss(
                    lor.element_geometry(ilor),
                    mass_quadrature_order(lor, ilor),
                );
                let assembly_result = match mass_kind {
                    MassKind::Scalar => assemble_element_mass_matrix(
                        nalgebra::DMatrixViewMut::from(&mut m_el),
                        lor,
                        ilor,
                        &rule,
                        &mut buffer,
                    ),
                    MassKind::VectorField => assemble_element_vector_mass_matrix(
                        nalgebra::DMatrixViewMut::from(&mut m_el),
                        lor,
                        ilor,
                        &rule,
                        &mut buffer,
                    ),
                };
                assembly_result.map_err(|err| TransferError::UnsupportedConfiguration {
                    reason: format!("cannot assemble derefinement mass matrix: {}", err),
                })?;
                m.view_mut((iref * ndof_lor, iref * ndof_lor), (ndof_lor, ndof_lor))
                    .copy_from(&m_el);
            }

            // B = (Fᵀ M F)⁻¹ Fᵀ M
            let ft_m = f.transpose() * &m;
            let ft_m_f = &ft_m * &f;
            let b_block = ft_m_f
                .lu()
                .solve(&ft_m)
                .expect("derefinement normal equations must be invertible");
            let start = offsets[iho];
            b[start..start + b_block.len()].copy_from_slice(b_block.as_slice());
        }

        Ok(Self {
            ho,
            lor,
            patch,
            offsets,
            b,
        })
    }

    fn block(&self, iho: usize) -> (DMatrixView<'_, T>, usize, usize) {
        let els = self.patch.patch(iho);
        let ndof_lor = els
            .first()
            .map(|&ilor| self.lor.element_dof_count(ilor))
            .unwrap_or(0);
        let nrows = self.ho.element_dof_count(iho);
        let ncols = ndof_lor * els.len();
        let start = self.offsets[iho];
        (
            DMatrixView::from_slice_generic(&self.b[start..start + nrows * ncols], Dyn(nrows), Dyn(ncols)),
            ndof_lor,
            nrows,
        )
    }
}

impl<'a, T: RealField + Copy> Operator<T> for DerefinementOperator<'a, T> {
    fn nrows(&self) -> usize {
        self.ho.vdim() * self.ho.num_dofs()
    }

    fn ncols(&self) -> usize {
        self.lor.vdim() * self.lor.num_dofs()
    }

    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        let vdim = self.ho.vdim();
        with_thread_local_workspace(&INTERPOLATION_WORKSPACE, |ws: &mut ApplyWorkspace<T>| {
            for iho in 0..self.patch.num_coarse_elements() {
                let (b_block, ndof_lor, ndof_ho) = self.block(iho);
                let els = self.patch.patch(iho);

                ws.x_el.resize_mut(b_block.ncols(), vdim, T::zero());
                for (iref, &ilor) in els.iter().enumerate() {
                    ws.dofs.resize(self.lor.element_dof_count(ilor), 0);
                    self.lor.populate_element_dofs(&mut ws.dofs, ilor);
                    gather_element_values(
                        &mut ws.x_el,
                        x.rows(0, x.len()),
                        iref * ndof_lor,
                        &ws.dofs,
                        self.lor.num_dofs(),
                    );
                }

                ws.y_el.resize_mut(ndof_ho, vdim, T::zero());
                ws.y_el.gemm(T::one(), &b_block, &ws.x_el, T::zero());

                ws.dofs.resize(ndof_ho, 0);
                self.ho.populate_element_dofs(&mut ws.dofs, iho);
                // Shared coarse DOFs are written by several patches with
                // consistent values for nested data.
                scatter_element_values(y.rows_mut(0, y.len()), &ws.y_el, 0, &ws.dofs, self.ho.num_dofs());
            }
        });
        Ok(())
    }

    fn apply_transpose(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        let vdim = self.ho.vdim();
        with_thread_local_workspace(&INTERPOLATION_WORKSPACE, |ws: &mut ApplyWorkspace<T>| {
            y.fill(T::zero());
            let mut processed = vec![false; self.lor.num_dofs()];
            for iho in 0..self.patch.num_coarse_elements() {
                let (b_block, ndof_lor, ndof_ho) = self.block(iho);
                let els = self.patch.patch(iho);

                ws.x_el.resize_mut(ndof_ho, vdim, T::zero());
                ws.dofs.resize(ndof_ho, 0);
                self.ho.populate_element_dofs(&mut ws.dofs, iho);
                gather_element_values(&mut ws.x_el, x.rows(0, x.len()), 0, &ws.dofs, self.ho.num_dofs());

                ws.y_el.resize_mut(b_block.ncols(), vdim, T::zero());
                ws.y_el.gemm_tr(T::one(), &b_block, &ws.x_el, T::zero());

                for (iref, &ilor) in els.iter().enumerate() {
                    ws.dofs.resize(self.lor.element_dof_count(ilor), 0);
                    self.lor.populate_element_dofs(&mut ws.dofs, ilor);
                    for (i, &dof) in ws.dofs.iter().enumerate() {
                        if !processed[dof] {
                            for d in 0..vdim {
                                y[d * self.lor.num_dofs() + dof] += ws.y_el[(iref * ndof_lor + i, d)];
                            }
                        }
                    }
                    for &dof in &ws.dofs {
                        processed[dof] = true;
                    }
                }
            }
        });
        Ok(())
    }
}
