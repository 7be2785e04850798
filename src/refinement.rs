//! Description of a mesh refinement hierarchy, as consumed by the transfer
//! operators.
//!
//! The mesh collaborator describes how a fine mesh refines a coarse mesh:
//! every fine element names its coarse parent and an affine map that embeds
//! the fine element's reference cell inside the parent's reference cell.
//! From this the transfer operators derive the [`ElementPatchMap`], the
//! grouping of fine elements under their parents.
use crate::space::ReferenceGeometry;
use nalgebra::{DMatrix, DVector, RealField, Scalar};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Identifies the parent of a fine element and the reference embedding map
/// that places it inside the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embedding {
    /// Index of the coarse parent element.
    pub parent: usize,
    /// Index into the per-geometry table of reference embedding maps.
    pub matrix: usize,
}

/// An affine map from one reference cell into another,
/// `xi_coarse = A xi_fine + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEmbedding<T: Scalar> {
    a: DMatrix<T>,
    b: DVector<T>,
}

impl<T: RealField + Copy> ReferenceEmbedding<T> {
    pub fn new(a: DMatrix<T>, b: DVector<T>) -> Self {
        assert_eq!(a.nrows(), a.ncols(), "embedding matrix must be square");
        assert_eq!(a.nrows(), b.len(), "embedding offset dimension mismatch");
        Self { a, b }
    }

    pub fn dim(&self) -> usize {
        self.b.len()
    }

    /// Maps the fine reference point `xi` into the parent's reference cell.
    pub fn map(&self, xi: &[T], out: &mut [T]) {
        let d = self.dim();
        assert_eq!(xi.len(), d);
        assert_eq!(out.len(), d);
        for i in 0..d {
            let mut value = self.b[i];
            for j in 0..d {
                value += self.a[(i, j)] * xi[j];
            }
            out[i] = value;
        }
    }
}

/// The refinement transform collaborator: one [`Embedding`] per fine element
/// and, per reference geometry, the table of embedding maps those entries
/// point into.
///
/// Invariant (guaranteed by the mesh collaborator): every fine element has
/// exactly one parent, and the fine elements sharing a parent tile the
/// parent's reference cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementTransforms<T: Scalar> {
    embeddings: Vec<Embedding>,
    maps: FxHashMap<ReferenceGeometry, Vec<ReferenceEmbedding<T>>>,
}

impl<T: RealField + Copy> RefinementTransforms<T> {
    pub fn new(
        embeddings: Vec<Embedding>,
        maps: impl IntoIterator<Item = (ReferenceGeometry, Vec<ReferenceEmbedding<T>>)>,
    ) -> Self {
        Self {
            embeddings,
            maps: maps.into_iter().collect(),
        }
    }

    pub fn num_fine_elements(&self) -> usize {
        self.embeddings.len()
    }

    pub fn embedding(&self, fine_element: usize) -> Embedding {
        self.embeddings[fine_element]
    }

    /// The reference embedding map with the given index for the given parent
    /// geometry.
    pub fn reference_map(&self, geometry: ReferenceGeometry, matrix: usize) -> &ReferenceEmbedding<T> {
        &self.maps[&geometry][matrix]
    }
}

/// The grouping of fine elements under their coarse parents.
///
/// `patch(iho)` lists the fine elements refining coarse element `iho`, in
/// the order in which they were discovered in the fine element numbering.
/// The map is built once per transfer and never mutated afterwards; a mesh
/// or space change requires a fresh transfer object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementPatchMap {
    // CSR-like storage: patch i occupies indices[offsets[i]..offsets[i + 1]]
    offsets: Vec<usize>,
    indices: Vec<usize>,
}

impl ElementPatchMap {
    /// Builds the patch map from the refinement transforms in
    /// `O(num_fine_elements)` time and memory.
    pub fn from_transforms<T: RealField + Copy>(
        num_coarse_elements: usize,
        transforms: &RefinementTransforms<T>,
    ) -> Self {
        let nel_fine = transforms.num_fine_elements();

        // Two passes: count the patch sizes, then fill in fine element order
        // so that each patch preserves the discovery order.
        let mut offsets = vec![0; num_coarse_elements + 1];
        for fine in 0..nel_fine {
            let parent = transforms.embedding(fine).parent;
            assert!(parent < num_coarse_elements, "parent index out of bounds");
            offsets[parent + 1] += 1;
        }
        for i in 0..num_coarse_elements {
            offsets[i + 1] += offsets[i];
        }

        let mut next = offsets.clone();
        let mut indices = vec![0; nel_fine];
        for fine in 0..nel_fine {
            let parent = transforms.embedding(fine).parent;
            indices[next[parent]] = fine;
            next[parent] += 1;
        }

        Self { offsets, indices }
    }

    pub fn num_coarse_elements(&self) -> usize {
        self.offsets.len() - 1
    }

    /// The fine elements refining the given coarse element.
    pub fn patch(&self, coarse_element: usize) -> &[usize] {
        &self.indices[self.offsets[coarse_element]..self.offsets[coarse_element + 1]]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[usize]> {
        (0..self.num_coarse_elements()).map(move |i| self.patch(i))
    }
}
