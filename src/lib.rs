//! Grid transfer operators between finite element spaces.
//!
//! `bifrost` moves discrete field data between two finite element spaces that
//! are related by mesh refinement (a coarse high-order space and its
//! low-order-refined counterpart) or by a change of polynomial order on the
//! same mesh. The spaces themselves are external collaborators, consumed
//! through the narrow traits in [`space`]; the refinement hierarchy is
//! described by the types in [`refinement`].
//!
//! The main entry point is [`transfer::Transfer`], which routes a transfer
//! request to one of the concrete operator families:
//!
//! - interpolation-based transfer for nested conforming spaces,
//! - patch-local L2 projection for discontinuous bases,
//! - global lumped-mass L2 projection for conforming bases,
//! - p-refinement transfer on a fixed mesh, with a sum-factorized fast path
//!   for tensor-product bases.
//!
//! All operators expose their action through the [`operators::Operator`]
//! trait; none of them require the assembled form of the spaces' global
//! matrices.

pub mod assembly;
pub mod cg;
pub mod error;
pub mod operators;
pub mod quadrature;
pub mod refinement;
pub mod space;
pub mod transfer;

pub use error::TransferError;
pub use transfer::{
    BackwardOperator, ForwardOperator, OperatorStorage, PRefinementPath, RefinementStrategy,
    SpaceRelation, Transfer, TransferOptions, TrueDofOperator,
};

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
