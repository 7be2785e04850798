//! Error types for transfer operator construction and application.
use crate::cg::CgError;
use std::fmt;
use std::fmt::{Display, Formatter};

/// Errors produced when constructing or applying a transfer operator.
///
/// Construction is all-or-nothing: a constructor that returns an error has
/// not allocated a partially built operator.
#[derive(Debug)]
#[non_exhaustive]
pub enum TransferError {
    /// The two spaces cannot participate in a transfer together, e.g. they
    /// disagree on vector dimension or partitioning.
    IncompatibleSpaces { reason: String },
    /// The requested combination of storage type and construction path is
    /// not available.
    UnsupportedConfiguration { reason: String },
    /// Prolongation was requested, but no prolongation blocks were built
    /// because the fine space does not determine the coarse space.
    ProlongationNotAvailable,
    /// The domain space has a conforming prolongation but the range space
    /// has no matching restriction.
    MissingRestriction,
    /// The auxiliary conjugate gradient solve broke down.
    SolveFailed(CgError),
}

impl Display for TransferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompatibleSpaces { reason } => {
                write!(f, "incompatible finite element spaces: {}", reason)
            }
            Self::UnsupportedConfiguration { reason } => {
                write!(f, "unsupported transfer configuration: {}", reason)
            }
            Self::ProlongationNotAvailable => {
                write!(f, "prolongation is not supported for these spaces")
            }
            Self::MissingRestriction => {
                write!(
                    f,
                    "the domain space has a prolongation, so the range space must have \
                     a restriction"
                )
            }
            Self::SolveFailed(err) => {
                write!(f, "auxiliary solve failed: {}", err)
            }
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SolveFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CgError> for TransferError {
    fn from(err: CgError) -> Self {
        Self::SolveFailed(err)
    }
}
