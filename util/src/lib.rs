//! Concrete finite element space fixtures for the `bifrost` test suite.
//!
//! The fixtures implement the transfer space traits for nodal Lagrange
//! bases on structured segment and quadrilateral meshes, together with the
//! refinement transform builders that relate a mesh to its uniform
//! refinement. They are deliberately simple: affine element maps, equispaced
//! nodes, `f64` only.
use bifrost::refinement::{Embedding, ReferenceEmbedding, RefinementTransforms};
use bifrost::space::{
    Continuity, LexElementRestriction, ReferenceGeometry, TensorProductBasis, TransferSpace,
};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;

fn scalar_dof_count(num_elements: usize, degree: usize, continuity: Continuity) -> usize {
    match continuity {
        Continuity::Continuous if num_elements == 0 => 0,
        Continuity::Continuous => num_elements * degree + 1,
        Continuity::Discontinuous => num_elements * (degree + 1),
    }
}

/// Nodal coordinates of the 1D Lagrange basis of the given degree on
/// `[0, 1]`: equispaced including the endpoints, or the midpoint for the
/// piecewise constant basis.
pub fn lagrange_nodes_1d(degree: usize) -> Vec<f64> {
    if degree == 0 {
        vec![0.5]
    } else {
        (0..=degree).map(|i| i as f64 / degree as f64).collect()
    }
}

/// Evaluates all 1D Lagrange basis functions with the given nodes at `x`.
pub fn eval_lagrange_1d(nodes: &[f64], values: &mut [f64], x: f64) {
    assert_eq!(values.len(), nodes.len());
    for (i, &xi) in nodes.iter().enumerate() {
        let mut value = 1.0;
        for (j, &xj) in nodes.iter().enumerate() {
            if i != j {
                value *= (x - xj) / (xi - xj);
            }
        }
        values[i] = value;
    }
}

/// A scalar (or vector-valued, component-major) Lagrange space on a 1D mesh
/// of the unit interval.
pub struct SegmentLagrangeSpace {
    vertices: Vec<f64>,
    degree: usize,
    continuity: Continuity,
    vdim: usize,
    nodes_1d: Vec<f64>,
    restriction: LexElementRestriction,
}

impl SegmentLagrangeSpace {
    /// A space over `num_elements` uniform cells of `[0, 1]`.
    pub fn uniform(num_elements: usize, degree: usize, continuity: Continuity) -> Self {
        let vertices = (0..=num_elements)
            .map(|i| i as f64 / num_elements.max(1) as f64)
            .collect();
        Self::from_vertices(vertices, degree, continuity)
    }

    /// A space over the cells between the given ascending vertices.
    pub fn from_vertices(vertices: Vec<f64>, degree: usize, continuity: Continuity) -> Self {
        assert!(vertices.len() >= 1, "mesh must have at least one vertex");
        if continuity == Continuity::Continuous {
            assert!(degree >= 1, "a continuous space requires degree >= 1");
        }
        let num_elements = vertices.len() - 1;
        let dofs_per_element = degree + 1;
        let num_dofs = scalar_dof_count(num_elements, degree, continuity);
        let mut indices = Vec::with_capacity(num_elements * dofs_per_element);
        for e in 0..num_elements {
            for i in 0..dofs_per_element {
                indices.push(match continuity {
                    Continuity::Continuous => e * degree + i,
                    Continuity::Discontinuous => e * dofs_per_element + i,
                });
            }
        }
        Self {
            vertices,
            degree,
            continuity,
            vdim: 1,
            nodes_1d: lagrange_nodes_1d(degree),
            restriction: LexElementRestriction::new(num_dofs, dofs_per_element, indices),
        }
    }

    pub fn with_vdim(mut self, vdim: usize) -> Self {
        assert!(vdim >= 1);
        self.vdim = vdim;
        self
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    fn cell_length(&self, element: usize) -> f64 {
        self.vertices[element + 1] - self.vertices[element]
    }

    /// Physical coordinate of every scalar DOF.
    pub fn dof_coordinates(&self) -> Vec<f64> {
        let mut coordinates = vec![0.0; self.num_dofs()];
        let mut dofs = vec![0; self.degree + 1];
        for e in 0..self.num_elements() {
            self.populate_element_dofs(&mut dofs, e);
            for (i, &dof) in dofs.iter().enumerate() {
                coordinates[dof] = self.vertices[e] + self.nodes_1d[i] * self.cell_length(e);
            }
        }
        coordinates
    }

    /// Nodal interpolation of a scalar function (`vdim == 1`).
    pub fn interpolate(&self, f: impl Fn(f64) -> f64) -> DVector<f64> {
        assert_eq!(self.vdim, 1);
        DVector::from_iterator(
            self.num_dofs(),
            self.dof_coordinates().into_iter().map(f),
        )
    }
}

impl TransferSpace<f64> for SegmentLagrangeSpace {
    fn num_elements(&self) -> usize {
        self.vertices.len() - 1
    }

    fn num_dofs(&self) -> usize {
        scalar_dof_count(self.num_elements(), self.degree, self.continuity)
    }

    fn vdim(&self) -> usize {
        self.vdim
    }

    fn reference_dim(&self) -> usize {
        1
    }

    fn continuity(&self) -> Continuity {
        self.continuity
    }

    fn element_geometry(&self, _element: usize) -> ReferenceGeometry {
        ReferenceGeometry::Segment
    }

    fn element_degree(&self, _element: usize) -> usize {
        self.degree
    }

    fn element_dof_count(&self, _element: usize) -> usize {
        self.degree + 1
    }

    fn populate_element_dofs(&self, dofs: &mut [usize], element: usize) {
        for (i, dof) in dofs.iter_mut().enumerate() {
            *dof = match self.continuity {
                Continuity::Continuous => element * self.degree + i,
                Continuity::Discontinuous => element * (self.degree + 1) + i,
            };
        }
    }

    fn populate_element_nodes(&self, nodes: &mut [f64], _element: usize) {
        nodes.copy_from_slice(&self.nodes_1d);
    }

    fn populate_element_basis(&self, _element: usize, values: &mut [f64], xi: &[f64]) {
        eval_lagrange_1d(&self.nodes_1d, values, xi[0]);
    }

    fn element_weight(&self, element: usize, _xi: &[f64]) -> f64 {
        self.cell_length(element)
    }

    fn element_weight_order(&self, _element: usize) -> usize {
        0
    }

    fn tensor_product(&self) -> Option<&dyn TensorProductBasis<f64>> {
        Some(self)
    }
}

impl TensorProductBasis<f64> for SegmentLagrangeSpace {
    fn dofs_1d(&self) -> usize {
        self.degree + 1
    }

    fn populate_nodes_1d(&self, nodes: &mut [f64]) {
        nodes.copy_from_slice(&self.nodes_1d);
    }

    fn populate_basis_1d(&self, values: &mut [f64], x: f64) {
        eval_lagrange_1d(&self.nodes_1d, values, x);
    }

    fn lex_restriction(&self) -> &LexElementRestriction {
        &self.restriction
    }
}

/// A scalar Lagrange space on a structured quadrilateral mesh of the unit
/// square, with tensor-product bases.
pub struct QuadLagrangeSpace {
    nx: usize,
    ny: usize,
    degree: usize,
    continuity: Continuity,
    nodes_1d: Vec<f64>,
    restriction: LexElementRestriction,
}

impl QuadLagrangeSpace {
    pub fn uniform(nx: usize, ny: usize, degree: usize, continuity: Continuity) -> Self {
        if continuity == Continuity::Continuous {
            assert!(degree >= 1, "a continuous space requires degree >= 1");
        }
        let d1 = degree + 1;
        let num_dofs = match continuity {
            Continuity::Continuous => (nx * degree + 1) * (ny * degree + 1),
            Continuity::Discontinuous => nx * ny * d1 * d1,
        };
        let mut indices = Vec::with_capacity(nx * ny * d1 * d1);
        for ey in 0..ny {
            for ex in 0..nx {
                let e = ey * nx + ex;
                for j in 0..d1 {
                    for i in 0..d1 {
                        indices.push(match continuity {
                            Continuity::Continuous => {
                                let gx = ex * degree + i;
                                let gy = ey * degree + j;
                                gy * (nx * degree + 1) + gx
                            }
                            Continuity::Discontinuous => e * d1 * d1 + j * d1 + i,
                        });
                    }
                }
            }
        }
        Self {
            nx,
            ny,
            degree,
            continuity,
            nodes_1d: lagrange_nodes_1d(degree),
            restriction: LexElementRestriction::new(num_dofs, d1 * d1, indices),
        }
    }

    fn cell_size(&self) -> (f64, f64) {
        (1.0 / self.nx as f64, 1.0 / self.ny as f64)
    }

    /// Physical coordinates of every scalar DOF.
    pub fn dof_coordinates(&self) -> Vec<[f64; 2]> {
        let mut coordinates = vec![[0.0; 2]; self.num_dofs()];
        let d1 = self.degree + 1;
        let (hx, hy) = self.cell_size();
        let mut dofs = vec![0; d1 * d1];
        for ey in 0..self.ny {
            for ex in 0..self.nx {
                let e = ey * self.nx + ex;
                self.populate_element_dofs(&mut dofs, e);
                for j in 0..d1 {
                    for i in 0..d1 {
                        coordinates[dofs[j * d1 + i]] = [
                            (ex as f64 + self.nodes_1d[i]) * hx,
                            (ey as f64 + self.nodes_1d[j]) * hy,
                        ];
                    }
                }
            }
        }
        coordinates
    }

    /// Nodal interpolation of a scalar function.
    pub fn interpolate(&self, f: impl Fn(f64, f64) -> f64) -> DVector<f64> {
        DVector::from_iterator(
            self.num_dofs(),
            self.dof_coordinates().into_iter().map(|[x, y]| f(x, y)),
        )
    }
}

impl TransferSpace<f64> for QuadLagrangeSpace {
    fn num_elements(&self) -> usize {
        self.nx * self.ny
    }

    fn num_dofs(&self) -> usize {
        match self.continuity {
            Continuity::Continuous => (self.nx * self.degree + 1) * (self.ny * self.degree + 1),
            Continuity::Discontinuous => {
                self.nx * self.ny * (self.degree + 1) * (self.degree + 1)
            }
        }
    }

    fn vdim(&self) -> usize {
        1
    }

    fn reference_dim(&self) -> usize {
        2
    }

    fn continuity(&self) -> Continuity {
        self.continuity
    }

    fn element_geometry(&self, _element: usize) -> ReferenceGeometry {
        ReferenceGeometry::Quadrilateral
    }

    fn element_degree(&self, _element: usize) -> usize {
        self.degree
    }

    fn element_dof_count(&self, _element: usize) -> usize {
        (self.degree + 1) * (self.degree + 1)
    }

    fn populate_element_dofs(&self, dofs: &mut [usize], element: usize) {
        let d1 = self.degree + 1;
        let ex = element % self.nx;
        let ey = element / self.nx;
        for j in 0..d1 {
            for i in 0..d1 {
                dofs[j * d1 + i] = match self.continuity {
                    Continuity::Continuous => {
                        (ey * self.degree + j) * (self.nx * self.degree + 1) + ex * self.degree + i
                    }
                    Continuity::Discontinuous => element * d1 * d1 + j * d1 + i,
                };
            }
        }
    }

    fn populate_element_nodes(&self, nodes: &mut [f64], _element: usize) {
        let d1 = self.degree + 1;
        for j in 0..d1 {
            for i in 0..d1 {
                nodes[2 * (j * d1 + i)] = self.nodes_1d[i];
                nodes[2 * (j * d1 + i) + 1] = self.nodes_1d[j];
            }
        }
    }

    fn populate_element_basis(&self, _element: usize, values: &mut [f64], xi: &[f64]) {
        let d1 = self.degree + 1;
        let mut phi_x = vec![0.0; d1];
        let mut phi_y = vec![0.0; d1];
        eval_lagrange_1d(&self.nodes_1d, &mut phi_x, xi[0]);
        eval_lagrange_1d(&self.nodes_1d, &mut phi_y, xi[1]);
        for j in 0..d1 {
            for i in 0..d1 {
                values[j * d1 + i] = phi_x[i] * phi_y[j];
            }
        }
    }

    fn element_weight(&self, _element: usize, _xi: &[f64]) -> f64 {
        let (hx, hy) = self.cell_size();
        hx * hy
    }

    fn element_weight_order(&self, _element: usize) -> usize {
        0
    }

    fn tensor_product(&self) -> Option<&dyn TensorProductBasis<f64>> {
        Some(self)
    }
}

impl TensorProductBasis<f64> for QuadLagrangeSpace {
    fn dofs_1d(&self) -> usize {
        self.degree + 1
    }

    fn populate_nodes_1d(&self, nodes: &mut [f64]) {
        nodes.copy_from_slice(&self.nodes_1d);
    }

    fn populate_basis_1d(&self, values: &mut [f64], x: f64) {
        eval_lagrange_1d(&self.nodes_1d, values, x);
    }

    fn lex_restriction(&self) -> &LexElementRestriction {
        &self.restriction
    }
}

/// The refinement transforms of a 1D mesh refined uniformly into `children`
/// cells per coarse cell, with fine element `parent * children + c` covering
/// the `c`-th sub-interval.
pub fn uniform_segment_refinement(num_coarse: usize, children: usize) -> RefinementTransforms<f64> {
    assert!(children >= 1);
    let scale = 1.0 / children as f64;
    let embeddings = (0..num_coarse * children)
        .map(|fine| Embedding {
            parent: fine / children,
            matrix: fine % children,
        })
        .collect();
    let maps = (0..children)
        .map(|c| {
            ReferenceEmbedding::new(
                DMatrix::from_element(1, 1, scale),
                DVector::from_element(1, c as f64 * scale),
            )
        })
        .collect();
    RefinementTransforms::new(embeddings, [(ReferenceGeometry::Segment, maps)])
}

/// The refinement transforms of an `nx` by `ny` quadrilateral mesh refined
/// uniformly 2x2, with the fine mesh numbered row-major over the `2nx` by
/// `2ny` grid.
pub fn uniform_quad_refinement(nx: usize, ny: usize) -> RefinementTransforms<f64> {
    let mut embeddings = Vec::with_capacity(4 * nx * ny);
    for fy in 0..2 * ny {
        for fx in 0..2 * nx {
            embeddings.push(Embedding {
                parent: (fy / 2) * nx + fx / 2,
                matrix: (fy % 2) * 2 + fx % 2,
            });
        }
    }
    let maps = (0..4usize)
        .map(|m| {
            let (cx, cy) = ((m % 2) as f64, (m / 2) as f64);
            ReferenceEmbedding::new(
                DMatrix::from_diagonal_element(2, 2, 0.5),
                DVector::from_column_slice(&[cx * 0.5, cy * 0.5]),
            )
        })
        .collect();
    RefinementTransforms::new(embeddings, [(ReferenceGeometry::Quadrilateral, maps)])
}

/// A continuous 1D Lagrange space presented through a redundant, broken DOF
/// numbering plus explicit conforming prolongation/restriction matrices.
///
/// Each element carries its own copy of the shared interface DOFs; the
/// prolongation maps true (shared) DOFs to the redundant local numbering
/// and the restriction selects the first local occurrence of each true DOF.
pub struct ConstrainedSegmentSpace {
    inner: SegmentLagrangeSpace,
    prolongation: CsrMatrix<f64>,
    restriction: CsrMatrix<f64>,
}

impl ConstrainedSegmentSpace {
    pub fn uniform(num_elements: usize, degree: usize) -> Self {
        assert!(degree >= 1);
        let inner = SegmentLagrangeSpace::uniform(num_elements, degree, Continuity::Discontinuous);
        let d1 = degree + 1;
        let num_local = num_elements * d1;
        let num_true = num_elements * degree + 1;

        // P: one unit entry per local DOF, pointing at its true DOF.
        let mut p_offsets = Vec::with_capacity(num_local + 1);
        let mut p_indices = Vec::with_capacity(num_local);
        p_offsets.push(0);
        for e in 0..num_elements {
            for i in 0..d1 {
                p_indices.push(e * degree + i);
                p_offsets.push(p_indices.len());
            }
        }
        let prolongation = CsrMatrix::try_from_csr_data(
            num_local,
            num_true,
            p_offsets,
            p_indices.clone(),
            vec![1.0; num_local],
        )
        .expect("prolongation data is valid CSR");

        // R: the first local occurrence of each true DOF.
        let mut first_local = vec![usize::MAX; num_true];
        for (local, &true_dof) in p_indices.iter().enumerate() {
            if first_local[true_dof] == usize::MAX {
                first_local[true_dof] = local;
            }
        }
        let r_offsets: Vec<usize> = (0..=num_true).collect();
        let restriction = CsrMatrix::try_from_csr_data(
            num_true,
            num_local,
            r_offsets,
            first_local,
            vec![1.0; num_true],
        )
        .expect("restriction data is valid CSR");

        Self {
            inner,
            prolongation,
            restriction,
        }
    }

    /// Physical coordinate of every true DOF.
    pub fn true_dof_coordinates(&self) -> Vec<f64> {
        let broken = self.inner.dof_coordinates();
        self.restriction
            .pattern()
            .minor_indices()
            .iter()
            .map(|&local| broken[local])
            .collect()
    }
}

impl TransferSpace<f64> for ConstrainedSegmentSpace {
    fn num_elements(&self) -> usize {
        self.inner.num_elements()
    }

    fn num_dofs(&self) -> usize {
        self.inner.num_dofs()
    }

    fn vdim(&self) -> usize {
        1
    }

    fn reference_dim(&self) -> usize {
        1
    }

    fn continuity(&self) -> Continuity {
        Continuity::Continuous
    }

    fn element_geometry(&self, element: usize) -> ReferenceGeometry {
        self.inner.element_geometry(element)
    }

    fn element_degree(&self, element: usize) -> usize {
        self.inner.element_degree(element)
    }

    fn element_dof_count(&self, element: usize) -> usize {
        self.inner.element_dof_count(element)
    }

    fn populate_element_dofs(&self, dofs: &mut [usize], element: usize) {
        self.inner.populate_element_dofs(dofs, element);
    }

    fn populate_element_nodes(&self, nodes: &mut [f64], element: usize) {
        self.inner.populate_element_nodes(nodes, element);
    }

    fn populate_element_basis(&self, element: usize, values: &mut [f64], xi: &[f64]) {
        self.inner.populate_element_basis(element, values, xi);
    }

    fn element_weight(&self, element: usize, xi: &[f64]) -> f64 {
        self.inner.element_weight(element, xi)
    }

    fn element_weight_order(&self, element: usize) -> usize {
        self.inner.element_weight_order(element)
    }

    fn conforming_prolongation(&self) -> Option<&CsrMatrix<f64>> {
        Some(&self.prolongation)
    }

    fn conforming_restriction(&self) -> Option<&CsrMatrix<f64>> {
        Some(&self.restriction)
    }
}
