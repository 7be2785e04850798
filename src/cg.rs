//! Preconditioned conjugate gradient solver for the auxiliary prolongation
//! system of the conforming projection engine.
//!
//! The solver works against the black-box [`LinearOperator`] abstraction so
//! that callers can supply their own preconditioner (e.g. an algebraic
//! multigrid operator from an external distributed linear algebra library).
//! A solver instance is safe to call repeatedly with different right-hand
//! sides; its internal buffers are reused across solves.
use core::fmt;
use log::warn;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut, RealField, Scalar};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::CsrMatrix;
use std::error::Error;

/// A linear operator `y = A x` over dynamically sized vectors.
pub trait LinearOperator<T: Scalar> {
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>>;
}

impl<'a, T, A> LinearOperator<T> for &'a A
where
    T: Scalar,
    A: ?Sized + LinearOperator<T>,
{
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        <A as LinearOperator<T>>::apply(self, y, x)
    }
}

impl<T: RealField> LinearOperator<T> for DMatrix<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        y.gemv(T::one(), self, &x, T::zero());
        Ok(())
    }
}

impl<T: RealField> LinearOperator<T> for CsrMatrix<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        spmm_csr_dense(T::zero(), &mut y, T::one(), Op::NoOp(self), Op::NoOp(&x));
        Ok(())
    }
}

/// Diagonal (Jacobi) preconditioner, the default smoother for the
/// prolongation solve in the single-process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobiPreconditioner<T: Scalar> {
    inverse_diagonal: DVector<T>,
}

impl<T: RealField + Copy> JacobiPreconditioner<T> {
    /// Extracts the inverse diagonal of the given matrix. Zero diagonal
    /// entries are replaced by one so that the preconditioner stays
    /// well-defined for empty rows.
    pub fn from_csr(matrix: &CsrMatrix<T>) -> Self {
        assert_eq!(matrix.nrows(), matrix.ncols());
        let mut inverse_diagonal = DVector::repeat(matrix.nrows(), T::one());
        for (i, j, v) in matrix.triplet_iter() {
            if i == j && *v != T::zero() {
                inverse_diagonal[i] = T::one() / *v;
            }
        }
        Self { inverse_diagonal }
    }
}

impl<T: RealField + Copy> LinearOperator<T> for JacobiPreconditioner<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        assert_eq!(x.len(), self.inverse_diagonal.len());
        y.copy_from(&x);
        y.component_mul_assign(&self.inverse_diagonal);
        Ok(())
    }
}

/// Reasons the conjugate gradient iteration can break down.
///
/// Reaching the iteration cap is not a breakdown; the solver then returns
/// its best iterate (see [`CgSummary::converged`]).
#[derive(Debug)]
#[non_exhaustive]
pub enum CgError {
    OperatorError(Box<dyn Error>),
    PreconditionerError(Box<dyn Error>),
    IndefiniteOperator,
    IndefinitePreconditioner,
}

impl fmt::Display for CgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorError(err) => {
                write!(f, "error applying operator: ")?;
                err.fmt(f)
            }
            Self::PreconditionerError(err) => {
                write!(f, "error applying preconditioner: ")?;
                err.fmt(f)
            }
            Self::IndefiniteOperator => write!(f, "operator appears to be indefinite"),
            Self::IndefinitePreconditioner => write!(f, "preconditioner appears to be indefinite"),
        }
    }
}

impl Error for CgError {}

/// Outcome of a conjugate gradient solve.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct CgSummary<T> {
    /// Number of updates made to the solution vector.
    pub iterations: usize,
    /// Whether the residual tolerance was met. When `false`, the solution
    /// vector holds the best available iterate.
    pub converged: bool,
    /// Norm of the approximate residual maintained by the iteration.
    pub residual_norm: T,
}

#[derive(Debug, Clone)]
struct CgWorkspace<T: Scalar> {
    r: DVector<T>,
    z: DVector<T>,
    p: DVector<T>,
    ap: DVector<T>,
}

impl<T: RealField + Copy> CgWorkspace<T> {
    fn resize(&mut self, dim: usize) {
        self.r.resize_vertically_mut(dim, T::zero());
        self.z.resize_vertically_mut(dim, T::zero());
        self.p.resize_vertically_mut(dim, T::zero());
        self.ap.resize_vertically_mut(dim, T::zero());
    }
}

/// Preconditioned conjugate gradients with the stopping rule
/// `||r|| <= max(rel_tol * ||b||, abs_tol)`.
#[derive(Debug, Clone)]
pub struct ConjugateGradient<T: Scalar> {
    rel_tol: T,
    abs_tol: T,
    max_iter: usize,
    workspace: CgWorkspace<T>,
}

impl<T: RealField + Copy> Default for ConjugateGradient<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RealField + Copy> ConjugateGradient<T> {
    pub fn new() -> Self {
        Self {
            rel_tol: nalgebra::convert(1e-13),
            abs_tol: nalgebra::convert(1e-13),
            max_iter: 1000,
            workspace: CgWorkspace {
                r: DVector::zeros(0),
                z: DVector::zeros(0),
                p: DVector::zeros(0),
                ap: DVector::zeros(0),
            },
        }
    }

    pub fn set_rel_tol(&mut self, rel_tol: T) {
        self.rel_tol = rel_tol;
    }

    pub fn set_abs_tol(&mut self, abs_tol: T) {
        self.abs_tol = abs_tol;
    }

    pub fn set_max_iter(&mut self, max_iter: usize) {
        self.max_iter = max_iter;
    }

    /// Solves `A x = b`, treating the current content of `x` as the initial
    /// guess.
    pub fn solve<A, P>(
        &mut self,
        operator: &A,
        preconditioner: &P,
        b: DVectorView<T>,
        mut x: DVectorViewMut<T>,
    ) -> Result<CgSummary<T>, CgError>
    where
        A: ?Sized + LinearOperator<T>,
        P: ?Sized + LinearOperator<T>,
    {
        use CgError::*;
        assert_eq!(b.len(), x.len());

        self.workspace.resize(x.len());
        let CgWorkspace { r, z, p, ap } = &mut self.workspace;

        let b_norm = b.norm();
        let tolerance = T::max(self.rel_tol * b_norm, self.abs_tol);

        if b_norm == T::zero() {
            x.fill(T::zero());
            return Ok(CgSummary {
                iterations: 0,
                converged: true,
                residual_norm: T::zero(),
            });
        }

        // r = b - A x
        operator
            .apply(DVectorViewMut::from(&mut *r), DVectorView::from(&x))
            .map_err(OperatorError)?;
        r.zip_apply(&b, |ax_i, b_i| *ax_i = b_i - *ax_i);

        // z = P r, p = z
        preconditioner
            .apply(DVectorViewMut::from(&mut *z), DVectorView::from(&*r))
            .map_err(PreconditionerError)?;
        p.copy_from(z);

        let mut ztr = z.dot(r);
        let mut iterations = 0;

        loop {
            let residual_norm = r.norm();
            if residual_norm <= tolerance {
                return Ok(CgSummary {
                    iterations,
                    converged: true,
                    residual_norm,
                });
            }
            if iterations >= self.max_iter {
                warn!(
                    "conjugate gradient reached the iteration limit ({}) with residual {:?}",
                    self.max_iter, residual_norm
                );
                return Ok(CgSummary {
                    iterations,
                    converged: false,
                    residual_norm,
                });
            }

            operator
                .apply(DVectorViewMut::from(&mut *ap), DVectorView::from(&*p))
                .map_err(OperatorError)?;
            let pap = p.dot(ap);
            if pap <= T::zero() {
                return Err(IndefiniteOperator);
            }
            if ztr <= T::zero() {
                return Err(IndefinitePreconditioner);
            }

            let alpha = ztr / pap;
            // x <- x + alpha p, r <- r - alpha A p
            x.zip_apply(&*p, |x_i, p_i| *x_i += alpha * p_i);
            r.zip_apply(&*ap, |r_i, ap_i| *r_i -= alpha * ap_i);
            iterations += 1;

            // z <- P r
            preconditioner
                .apply(DVectorViewMut::from(&mut *z), DVectorView::from(&*r))
                .map_err(PreconditionerError)?;
            let ztr_next = z.dot(r);
            let beta = ztr_next / ztr;

            // p <- z + beta p
            p.zip_apply(&*z, |p_i, z_i| *p_i = z_i + beta * *p_i);
            ztr = ztr_next;
        }
    }
}
