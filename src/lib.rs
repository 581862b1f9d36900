//! Matrix-free operator composition for high-order finite element discretizations.
//!
//! An [`Operator`](operator::Operator) composes element restrictions, bases and a pointwise
//! [`QFunction`](qfunction::QFunction) into a single action on global vectors. Operators can be
//! summed through a [`CompositeOperator`](operator::CompositeOperator), and the diagonal or
//! point block diagonal of linear operators can be assembled without forming the matrix.
use serde::{Deserialize, Serialize};

pub mod basis;
pub mod ceed;
pub mod context;
pub mod error;
pub mod operator;
pub mod qfunction;
pub mod request;
pub mod restriction;
pub mod vector;

#[cfg(feature = "proptest")]
pub mod proptest;

pub extern crate nalgebra;

pub use error::{ErrorKind, OperatorError, Result};

/// Direction of a restriction or basis action.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransposeMode {
    NoTranspose,
    Transpose,
}

/// Commonly used types, for glob imports.
pub mod prelude {
    pub use crate::basis::{Basis, BasisOpt, EvalMode};
    pub use crate::ceed::{Ceed, CopyMode, ExecutionStrategy, MemType, Resource};
    pub use crate::context::{Context, ContextSource};
    pub use crate::error::{ErrorKind, OperatorError};
    pub use crate::operator::{CompositeOperator, Operator, OperatorApply, SubOperator};
    pub use crate::qfunction::{QFunction, QFunctionOpt};
    pub use crate::request::Request;
    pub use crate::restriction::{ElemRestriction, ElemRestrictionOpt};
    pub use crate::vector::{NormType, Vector, VectorOpt};
    pub use crate::TransposeMode;
}
