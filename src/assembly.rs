//! Element-local mass matrix kernels.
//!
//! These are the only assembly routines the transfer operators need: the
//! square mass matrix of a single element, the mixed mass matrix coupling a
//! fine element to the coarse element it refines, and the row-summed
//! (lumped) mass contributions used by the conforming projection engine.
//! Quadrature rules are supplied by the caller, which allows patch loops to
//! reuse one rule per geometry/order combination.
use crate::quadrature::QuadratureRule;
use crate::refinement::ReferenceEmbedding;
use crate::space::TransferSpace;
use itertools::izip;
use nalgebra::{DMatrixViewMut, DVectorView, RealField};

/// Scratch space for the assembly kernels, reusable across elements.
#[derive(Debug, Clone)]
pub struct BasisBuffer<T> {
    shape_a: Vec<T>,
    shape_b: Vec<T>,
    point: Vec<T>,
}

impl<T> Default for BasisBuffer<T> {
    fn default() -> Self {
        Self {
            shape_a: Vec::new(),
            shape_b: Vec::new(),
            point: Vec::new(),
        }
    }
}

fn resize_buffer<T: RealField + Copy>(buffer: &mut Vec<T>, len: usize) -> &mut [T] {
    buffer.resize(len, T::zero());
    &mut buffer[..]
}

/// The quadrature order that integrates an element's mass matrix exactly.
pub fn mass_quadrature_order<T: RealField>(space: &dyn TransferSpace<T>, element: usize) -> usize {
    2 * space.element_degree(element) + space.element_weight_order(element)
}

/// The quadrature order that integrates the mixed mass matrix of a fine
/// element against its coarse parent exactly.
pub fn mixed_mass_quadrature_order<T: RealField>(
    ho_space: &dyn TransferSpace<T>,
    ho_element: usize,
    lor_space: &dyn TransferSpace<T>,
    lor_element: usize,
) -> usize {
    lor_space.element_degree(lor_element)
        + ho_space.element_degree(ho_element)
        + lor_space.element_weight_order(lor_element)
}

/// Assembles the mass matrix of a single element,
/// `M[i, j] = ∫ φ_i(x) φ_j(x) dx`.
pub fn assemble_element_mass_matrix<T: RealField + Copy>(
    mut output: DMatrixViewMut<T>,
    space: &dyn TransferSpace<T>,
    element: usize,
    quadrature: &QuadratureRule<T>,
    buffer: &mut BasisBuffer<T>,
) -> eyre::Result<()> {
    let n = space.element_dof_count(element);
    assert_eq!(output.nrows(), n, "output matrix dimension mismatch");
    assert_eq!(output.ncols(), n, "output matrix dimension mismatch");

    output.fill(T::zero());
    let phi = resize_buffer(&mut buffer.shape_a, n);

    for (&w, xi) in quadrature.iter() {
        space.populate_element_basis(element, phi, xi);
        let scale = w * space.element_weight(element, xi);

        // Fill only the upper triangle, then mirror at the end
        for i in 0..n {
            for j in i..n {
                output[(i, j)] += scale * phi[i] * phi[j];
            }
        }
    }
    clone_upper_to_lower(&mut output);

    Ok(())
}

/// Assembles the mass matrix of an element with a vector-valued basis,
/// `M[i, j] = ∫ φ_i(x) · φ_j(x) dx`.
///
/// Returns an error if the space cannot evaluate vector-valued basis
/// functions.
pub fn assemble_element_vector_mass_matrix<T: RealField + Copy>(
    mut output: DMatrixViewMut<T>,
    space: &dyn TransferSpace<T>,
    element: usize,
    quadrature: &QuadratureRule<T>,
    buffer: &mut BasisBuffer<T>,
) -> eyre::Result<()> {
    let n = space.element_dof_count(element);
    let d = space.reference_dim();
    assert_eq!(output.nrows(), n, "output matrix dimension mismatch");
    assert_eq!(output.ncols(), n, "output matrix dimension mismatch");

    output.fill(T::zero());
    let vshape = resize_buffer(&mut buffer.shape_a, n * d);

    for (&w, xi) in quadrature.iter() {
        if !space.populate_element_vector_basis(element, vshape, xi) {
            return Err(eyre::eyre!(
                "space does not support vector-valued basis evaluation"
            ));
        }
        let scale = w * space.element_weight(element, xi);

        for i in 0..n {
            for j in i..n {
                let mut dot = T::zero();
                for c in 0..d {
                    dot += vshape[i * d + c] * vshape[j * d + c];
                }
                output[(i, j)] += scale * dot;
            }
        }
    }
    clone_upper_to_lower(&mut output);

    Ok(())
}

/// Assembles the mixed mass matrix between a coarse element's basis and the
/// basis of one of the fine elements refining it,
/// `M[i, j] = ∫ φ_lor_i(x) φ_ho_j(x) dx`,
/// integrated over the fine element. The embedding places the fine
/// element's reference cell inside the parent's reference cell.
///
/// The geometric weight is taken from the fine element only, so the
/// resulting transfer is not exactly mass conservative on curved meshes.
pub fn assemble_element_mixed_mass_matrix<T: RealField + Copy>(
    mut output: DMatrixViewMut<T>,
    ho_space: &dyn TransferSpace<T>,
    ho_element: usize,
    lor_space: &dyn TransferSpace<T>,
    lor_element: usize,
    embedding: &ReferenceEmbedding<T>,
    quadrature: &QuadratureRule<T>,
    buffer: &mut BasisBuffer<T>,
) -> eyre::Result<()> {
    let ndof_ho = ho_space.element_dof_count(ho_element);
    let ndof_lor = lor_space.element_dof_count(lor_element);
    assert_eq!(output.nrows(), ndof_lor, "output matrix dimension mismatch");
    assert_eq!(output.ncols(), ndof_ho, "output matrix dimension mismatch");

    output.fill(T::zero());
    buffer.shape_a.resize(ndof_lor, T::zero());
    buffer.shape_b.resize(ndof_ho, T::zero());
    buffer.point.resize(embedding.dim(), T::zero());

    for (&w, xi_lor) in quadrature.iter() {
        lor_space.populate_element_basis(lor_element, &mut buffer.shape_a, xi_lor);
        embedding.map(xi_lor, &mut buffer.point);
        ho_space.populate_element_basis(ho_element, &mut buffer.shape_b, &buffer.point);

        let scale = w * lor_space.element_weight(lor_element, xi_lor);
        let shape_lor = DVectorView::from_slice(&buffer.shape_a, ndof_lor);
        let shape_ho = DVectorView::from_slice(&buffer.shape_b, ndof_ho);
        output.ger(scale, &shape_lor, &shape_ho, T::one());
    }

    Ok(())
}

/// Accumulates the row sums of an element's mass matrix into `output`, one
/// entry per local DOF. Used to build the lumped fine-space mass vector.
pub fn accumulate_element_lumped_mass<T: RealField + Copy>(
    output: &mut [T],
    space: &dyn TransferSpace<T>,
    element: usize,
    quadrature: &QuadratureRule<T>,
    buffer: &mut BasisBuffer<T>,
) -> eyre::Result<()> {
    let n = space.element_dof_count(element);
    assert_eq!(output.len(), n, "output length mismatch");

    let phi = resize_buffer(&mut buffer.shape_a, n);
    for (&w, xi) in quadrature.iter() {
        space.populate_element_basis(element, phi, xi);
        let scale = w * space.element_weight(element, xi);
        for (out, &phi_i) in izip!(output.iter_mut(), phi.iter()) {
            *out += scale * phi_i;
        }
    }

    Ok(())
}

// Mirrors the strictly upper triangle into the lower triangle.
fn clone_upper_to_lower<T: RealField + Copy>(matrix: &mut DMatrixViewMut<T>) {
    for i in 0..matrix.nrows() {
        for j in (i + 1)..matrix.ncols() {
            matrix[(j, i)] = matrix[(i, j)];
        }
    }
}
