//! The narrow finite element space interface consumed by the transfer
//! operators.
//!
//! A discretization library makes its spaces usable with `bifrost` by
//! implementing [`TransferSpace`], and optionally [`TensorProductBasis`] to
//! enable the sum-factorized fast path of the p-refinement operator. Only
//! the information the transfer operators actually touch is exposed:
//! element-to-DOF maps, nodal bases, geometric weights and the conforming
//! constraint matrices.
use nalgebra::{DVector, DVectorView, DVectorViewMut, RealField, Scalar};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};

/// The reference cell of an element.
///
/// Only tensor-product (cube) cells participate in transfers; this matches
/// the element families for which the refinement embeddings are affine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceGeometry {
    Segment,
    Quadrilateral,
    Hexahedron,
}

impl ReferenceGeometry {
    pub fn dim(&self) -> usize {
        match self {
            Self::Segment => 1,
            Self::Quadrilateral => 2,
            Self::Hexahedron => 3,
        }
    }
}

/// Inter-element continuity of a space's basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Continuity {
    Continuous,
    Discontinuous,
}

/// How basis function values transform from the reference to the physical
/// element. Determines the mass operator used by derefinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapType {
    /// Plain function values (H1/L2 spaces).
    Value,
    /// Values scaled by the inverse geometric weight (densities).
    Integral,
    /// Vector-valued, Piola-mapped H(div) bases.
    HDiv,
    /// Vector-valued, covariantly mapped H(curl) bases.
    HCurl,
}

/// Which process partition a space's degrees of freedom live on.
///
/// The transfer operators themselves are single-process; a distributed space
/// must be reduced through an external collaborator before it can
/// participate, and pairing a distributed space with a single-process space
/// is always an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partition {
    SingleProcess,
    Distributed,
}

/// The finite element space collaborator.
///
/// Vector-valued global vectors use a component-major layout: component `d`
/// of a space with `n` scalar DOFs occupies the index range
/// `d * n .. (d + 1) * n`. True-DOF vectors use the same layout over
/// [`num_true_dofs`](TransferSpace::num_true_dofs) entries per component.
pub trait TransferSpace<T: RealField> {
    fn num_elements(&self) -> usize;

    /// Number of scalar degrees of freedom (excluding vector components).
    fn num_dofs(&self) -> usize;

    /// Number of vector components of the field.
    fn vdim(&self) -> usize;

    fn reference_dim(&self) -> usize;

    fn continuity(&self) -> Continuity;

    fn map_type(&self) -> MapType {
        MapType::Value
    }

    fn partition(&self) -> Partition {
        Partition::SingleProcess
    }

    /// Whether the polynomial order varies between elements.
    fn is_variable_order(&self) -> bool {
        false
    }

    fn element_geometry(&self, element: usize) -> ReferenceGeometry;

    /// Polynomial degree of the element's basis.
    fn element_degree(&self, element: usize) -> usize;

    /// Number of scalar DOFs on the element.
    fn element_dof_count(&self, element: usize) -> usize;

    /// Populates the global (scalar) DOF indices of the element.
    fn populate_element_dofs(&self, dofs: &mut [usize], element: usize);

    /// Populates the reference coordinates of the element's nodal points,
    /// one point of `reference_dim` coordinates per local DOF, flattened
    /// point-major. Local DOF `i` is the DOF whose associated nodal
    /// interpolation point is point `i`.
    fn populate_element_nodes(&self, nodes: &mut [T], element: usize);

    /// Evaluates all basis functions of the element at the reference point
    /// `xi`. The output has one value per local DOF.
    fn populate_element_basis(&self, element: usize, values: &mut [T], xi: &[T]);

    /// Evaluates vector-valued basis functions at `xi`, `reference_dim`
    /// components per local DOF, flattened DOF-major. Returns `false` if the
    /// space has no vector-valued basis (the default).
    fn populate_element_vector_basis(&self, _element: usize, _values: &mut [T], _xi: &[T]) -> bool {
        false
    }

    /// The geometric weight `|det J|` of the element map at `xi`.
    fn element_weight(&self, element: usize, xi: &[T]) -> T;

    /// The polynomial order of the geometric weight (zero for affine
    /// element maps).
    fn element_weight_order(&self, element: usize) -> usize;

    /// The conforming prolongation (local scalar DOFs from true DOFs), if
    /// the space carries constraints.
    fn conforming_prolongation(&self) -> Option<&CsrMatrix<T>> {
        None
    }

    /// The conforming restriction (true DOFs from local scalar DOFs).
    fn conforming_restriction(&self) -> Option<&CsrMatrix<T>> {
        None
    }

    /// Number of independent (true) scalar DOFs.
    fn num_true_dofs(&self) -> usize {
        self.conforming_restriction()
            .map(|r| r.nrows())
            .unwrap_or_else(|| self.num_dofs())
    }

    /// The tensor-product capability of the space, if any.
    fn tensor_product(&self) -> Option<&dyn TensorProductBasis<T>> {
        None
    }
}

/// Capabilities required by the sum-factorized p-refinement fast path.
///
/// A tensor-product space has a basis that factors into one-dimensional
/// bases along each reference axis, and can gather global vectors into
/// per-element-contiguous, lexicographically ordered local arrays.
pub trait TensorProductBasis<T: RealField> {
    /// Number of DOFs along one reference axis.
    fn dofs_1d(&self) -> usize;

    /// Populates the one-dimensional nodal coordinates on `[0, 1]` in
    /// lexicographic (ascending) order.
    fn populate_nodes_1d(&self, nodes: &mut [T]);

    /// Evaluates the one-dimensional basis at coordinate `x`.
    fn populate_basis_1d(&self, values: &mut [T], x: T);

    /// The lexicographic element restriction of the space.
    fn lex_restriction(&self) -> &LexElementRestriction;
}

/// Gather/scatter between a global (scalar) DOF vector and per-element
/// contiguous local arrays in lexicographic order.
///
/// This is the element restriction abstraction of the fast transfer path:
/// `gather` produces the element-wise vector, `scatter_transpose` applies
/// its transpose (summing shared DOFs), and [`boolean_mask`] marks, per
/// element entry, whether the entry is the first occurrence of its global
/// DOF in element order.
///
/// [`boolean_mask`]: LexElementRestriction::boolean_mask
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LexElementRestriction {
    num_dofs: usize,
    dofs_per_element: usize,
    // Global DOF index for each element-local slot, element-major and in
    // lexicographic order within each element.
    indices: Vec<usize>,
}

impl LexElementRestriction {
    pub fn new(num_dofs: usize, dofs_per_element: usize, indices: Vec<usize>) -> Self {
        assert!(
            dofs_per_element == 0 || indices.len() % dofs_per_element == 0,
            "index array must contain whole elements"
        );
        assert!(
            indices.iter().all(|&i| i < num_dofs),
            "element indices must be in bounds"
        );
        Self {
            num_dofs,
            dofs_per_element,
            indices,
        }
    }

    pub fn num_elements(&self) -> usize {
        if self.dofs_per_element == 0 {
            0
        } else {
            self.indices.len() / self.dofs_per_element
        }
    }

    pub fn num_dofs(&self) -> usize {
        self.num_dofs
    }

    pub fn dofs_per_element(&self) -> usize {
        self.dofs_per_element
    }

    /// Local length of the element-wise vector.
    pub fn local_len(&self) -> usize {
        self.indices.len()
    }

    /// Gathers a global vector into the element-wise local vector.
    pub fn gather<T: Scalar>(&self, global: DVectorView<T>, local: &mut DVector<T>) {
        assert_eq!(global.len(), self.num_dofs);
        assert_eq!(local.len(), self.indices.len());
        for (slot, &dof) in self.indices.iter().enumerate() {
            local[slot] = global[dof].clone();
        }
    }

    /// Applies the transpose of the restriction: zeroes `global`, then sums
    /// every local slot into its global DOF.
    pub fn scatter_transpose<T: RealField>(&self, local: &DVector<T>, mut global: DVectorViewMut<T>) {
        assert_eq!(global.len(), self.num_dofs);
        assert_eq!(local.len(), self.indices.len());
        global.fill(T::zero());
        for (slot, &dof) in self.indices.iter().enumerate() {
            global[dof] += local[slot].clone();
        }
    }

    /// A multiplicative mask over the element-wise vector: `1` where the
    /// slot is the first occurrence of its global DOF in element order,
    /// `0` for every repeated occurrence.
    pub fn boolean_mask<T: RealField>(&self) -> DVector<T> {
        let mut seen = vec![false; self.num_dofs];
        let mut mask = DVector::zeros(self.indices.len());
        for (slot, &dof) in self.indices.iter().enumerate() {
            if !seen[dof] {
                seen[dof] = true;
                mask[slot] = T::one();
            }
        }
        mask
    }
}

/// Gathers element DOF values of all vector components into rows
/// `first_row..` of a dense `.. x vdim` matrix, assuming the component-major
/// global layout.
pub fn gather_element_values<T: RealField>(
    element_values: &mut nalgebra::DMatrix<T>,
    global: DVectorView<T>,
    first_row: usize,
    dofs: &[usize],
    num_dofs: usize,
) {
    assert!(first_row + dofs.len() <= element_values.nrows());
    for d in 0..element_values.ncols() {
        for (i, &dof) in dofs.iter().enumerate() {
            element_values[(first_row + i, d)] = global[d * num_dofs + dof].clone();
        }
    }
}

/// Writes element DOF values of all vector components into the global
/// vector, overwriting previous values.
pub fn scatter_element_values<T: RealField>(
    mut global: DVectorViewMut<T>,
    element_values: &nalgebra::DMatrix<T>,
    first_row: usize,
    dofs: &[usize],
    num_dofs: usize,
) {
    assert!(first_row + dofs.len() <= element_values.nrows());
    for d in 0..element_values.ncols() {
        for (i, &dof) in dofs.iter().enumerate() {
            global[d * num_dofs + dof] = element_values[(first_row + i, d)].clone();
        }
    }
}

/// Adds element DOF values of all vector components into the global vector.
pub fn scatter_add_element_values<T: RealField>(
    mut global: DVectorViewMut<T>,
    element_values: &nalgebra::DMatrix<T>,
    first_row: usize,
    dofs: &[usize],
    num_dofs: usize,
) {
    assert!(first_row + dofs.len() <= element_values.nrows());
    for d in 0..element_values.ncols() {
        for (i, &dof) in dofs.iter().enumerate() {
            global[d * num_dofs + dof] += element_values[(first_row + i, d)].clone();
        }
    }
}
