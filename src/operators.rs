//! The operator abstraction shared by all transfer operators.
//!
//! Every constructed transfer operator, whatever its internal
//! representation, is applied through [`Operator`]: a plain
//! apply/apply-transpose pair over dynamically sized vectors. The module
//! also provides the sparse matrix-backed operator used where an assembled
//! form is requested, applied per vector component on the component-major
//! layout.
use crate::error::TransferError;
use nalgebra::{DVectorView, DVectorViewMut, RealField};
use nalgebra_sparse::CsrMatrix;

/// A transfer operator mapping vectors of length [`ncols`](Operator::ncols)
/// to vectors of length [`nrows`](Operator::nrows).
pub trait Operator<T: RealField> {
    /// Length of the output (range side) of `apply`.
    fn nrows(&self) -> usize;

    /// Length of the input (domain side) of `apply`.
    fn ncols(&self) -> usize;

    /// `y = A x`.
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError>;

    /// `y = Aᵀ x`.
    fn apply_transpose(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError>;
}

impl<'a, T, A> Operator<T> for &'a A
where
    T: RealField,
    A: ?Sized + Operator<T>,
{
    fn nrows(&self) -> usize {
        <A as Operator<T>>::nrows(self)
    }

    fn ncols(&self) -> usize {
        <A as Operator<T>>::ncols(self)
    }

    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        <A as Operator<T>>::apply(self, y, x)
    }

    fn apply_transpose(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        <A as Operator<T>>::apply_transpose(self, y, x)
    }
}

/// `y = A x` for a CSR matrix, written through the raw pattern so that no
/// intermediate allocation is needed.
pub fn csr_apply<T: RealField + Copy>(mut y: DVectorViewMut<T>, a: &CsrMatrix<T>, x: DVectorView<T>) {
    assert_eq!(y.len(), a.nrows());
    assert_eq!(x.len(), a.ncols());
    let offsets = a.pattern().major_offsets();
    let indices = a.pattern().minor_indices();
    let values = a.values();
    for i in 0..a.nrows() {
        let mut sum = T::zero();
        for k in offsets[i]..offsets[i + 1] {
            sum += values[k] * x[indices[k]];
        }
        y[i] = sum;
    }
}

/// `y = Aᵀ x` for a CSR matrix.
pub fn csr_apply_transpose<T: RealField + Copy>(
    mut y: DVectorViewMut<T>,
    a: &CsrMatrix<T>,
    x: DVectorView<T>,
) {
    assert_eq!(y.len(), a.ncols());
    assert_eq!(x.len(), a.nrows());
    y.fill(T::zero());
    for (i, j, v) in a.triplet_iter() {
        y[j] += *v * x[i];
    }
}

/// Applies a scalar CSR matrix to every component block of a
/// component-major vector.
pub fn csr_apply_componentwise<T: RealField + Copy>(
    mut y: DVectorViewMut<T>,
    a: &CsrMatrix<T>,
    x: DVectorView<T>,
    vdim: usize,
) {
    assert_eq!(y.len(), vdim * a.nrows());
    assert_eq!(x.len(), vdim * a.ncols());
    for d in 0..vdim {
        csr_apply(
            y.rows_mut(d * a.nrows(), a.nrows()),
            a,
            x.rows(d * a.ncols(), a.ncols()),
        );
    }
}

/// Applies the transpose of a scalar CSR matrix to every component block of
/// a component-major vector.
pub fn csr_apply_transpose_componentwise<T: RealField + Copy>(
    mut y: DVectorViewMut<T>,
    a: &CsrMatrix<T>,
    x: DVectorView<T>,
    vdim: usize,
) {
    assert_eq!(y.len(), vdim * a.ncols());
    assert_eq!(x.len(), vdim * a.nrows());
    for d in 0..vdim {
        csr_apply_transpose(
            y.rows_mut(d * a.ncols(), a.ncols()),
            a,
            x.rows(d * a.nrows(), a.nrows()),
        );
    }
}

/// An assembled transfer operator: one scalar CSR matrix applied per vector
/// component.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseOperator<T> {
    matrix: CsrMatrix<T>,
    vdim: usize,
}

impl<T: RealField + Copy> SparseOperator<T> {
    pub fn new(matrix: CsrMatrix<T>, vdim: usize) -> Self {
        assert!(vdim >= 1, "vector dimension must be at least 1");
        Self { matrix, vdim }
    }

    pub fn matrix(&self) -> &CsrMatrix<T> {
        &self.matrix
    }

    pub fn vdim(&self) -> usize {
        self.vdim
    }
}

impl<T: RealField + Copy> Operator<T> for SparseOperator<T> {
    fn nrows(&self) -> usize {
        self.vdim * self.matrix.nrows()
    }

    fn ncols(&self) -> usize {
        self.vdim * self.matrix.ncols()
    }

    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        csr_apply_componentwise(y, &self.matrix, x, self.vdim);
        Ok(())
    }

    fn apply_transpose(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), TransferError> {
        csr_apply_transpose_componentwise(y, &self.matrix, x, self.vdim);
        Ok(())
    }
}
