//! Bases: maps between element node values and quadrature point values.
use crate::error::{OperatorError, Result};
use crate::vector::Vector;
use crate::TransposeMode;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What a pointwise function sees of a field at the quadrature points.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvalMode {
    /// Values passed through unchanged (collocated data).
    None,
    /// Interpolated values.
    Interp,
    /// Reference gradients.
    Grad,
    /// Quadrature weights.
    Weight,
}

impl fmt::Display for EvalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvalMode::None => "none",
            EvalMode::Interp => "interpolation",
            EvalMode::Grad => "gradient",
            EvalMode::Weight => "quadrature weights",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
struct BasisData {
    dim: usize,
    num_components: usize,
    /// `Q x P` interpolation matrix.
    interp: DMatrix<f64>,
    /// `(dim * Q) x P` reference gradient matrix, one `Q x P` block per direction.
    grad: DMatrix<f64>,
    q_weights: DVector<f64>,
}

/// A shared, immutable H1 basis given by tabulated interpolation and gradient matrices.
///
/// Quadrature values of a field with `ncomp` components are laid out `[component][q]` for
/// interpolation and `[d * ncomp + c][q]` for gradients.
#[derive(Debug, Clone)]
pub struct Basis {
    data: Arc<BasisData>,
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "H1 Basis in {} dimension(s) with {} component(s), {} nodes and {} quadrature points",
            self.dim(),
            self.num_components(),
            self.num_nodes(),
            self.num_quadrature_points()
        )
    }
}

impl Basis {
    /// Create a basis from an interpolation matrix (`Q x P`), a gradient matrix
    /// (`dim * Q x P`) and quadrature weights (`Q`).
    #[allow(non_snake_case)]
    pub fn create_H1(
        dim: usize,
        num_components: usize,
        interp: DMatrix<f64>,
        grad: DMatrix<f64>,
        q_weights: &[f64],
    ) -> Result<Self> {
        let entity = "H1 Basis";
        let (q, p) = interp.shape();
        if dim == 0 || num_components == 0 || p == 0 || q == 0 {
            return Err(OperatorError::incompatible_shape(
                entity,
                "dimension, components, nodes and quadrature points must all be positive",
            ));
        }
        if grad.shape() != (dim * q, p) {
            return Err(OperatorError::incompatible_shape(
                entity,
                format!(
                    "gradient matrix must be {} x {}, got {} x {}",
                    dim * q,
                    p,
                    grad.nrows(),
                    grad.ncols()
                ),
            ));
        }
        if q_weights.len() != q {
            return Err(OperatorError::incompatible_shape(
                entity,
                format!("expected {} quadrature weights, got {}", q, q_weights.len()),
            ));
        }
        Ok(Self {
            data: Arc::new(BasisData {
                dim,
                num_components,
                interp,
                grad,
                q_weights: DVector::from_column_slice(q_weights),
            }),
        })
    }

    pub fn dim(&self) -> usize {
        self.data.dim
    }

    pub fn num_components(&self) -> usize {
        self.data.num_components
    }

    pub fn num_nodes(&self) -> usize {
        self.data.interp.ncols()
    }

    pub fn num_quadrature_points(&self) -> usize {
        self.data.interp.nrows()
    }

    pub fn interp(&self) -> &DMatrix<f64> {
        &self.data.interp
    }

    pub fn grad(&self) -> &DMatrix<f64> {
        &self.data.grad
    }

    pub fn q_weights(&self) -> &[f64] {
        self.data.q_weights.as_slice()
    }

    pub fn same_basis(&self, other: &Basis) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Number of quadrature values per element produced by the given evaluation mode.
    pub fn qvalues_per_element(&self, eval_mode: EvalMode) -> usize {
        let q = self.num_quadrature_points();
        match eval_mode {
            EvalMode::Interp => self.num_components() * q,
            EvalMode::Grad => self.dim() * self.num_components() * q,
            EvalMode::Weight => q,
            EvalMode::None => self.num_components() * self.num_nodes(),
        }
    }

    /// Apply the basis to the values of a single element.
    ///
    /// Without transposition `u` holds node values (`[component][node]`) and `v` receives
    /// quadrature values. With transposition the roles are swapped. `v` is overwritten.
    pub fn apply_element(&self, transpose: TransposeMode, eval_mode: EvalMode, u: &[f64], v: &mut [f64]) -> Result<()> {
        let p = self.num_nodes();
        let q = self.num_quadrature_points();
        let ncomp = self.num_components();
        let entity = "H1 Basis";

        let (expected_u, expected_v) = match (eval_mode, transpose) {
            (EvalMode::Interp, TransposeMode::NoTranspose) => (ncomp * p, ncomp * q),
            (EvalMode::Interp, TransposeMode::Transpose) => (ncomp * q, ncomp * p),
            (EvalMode::Grad, TransposeMode::NoTranspose) => (ncomp * p, self.dim() * ncomp * q),
            (EvalMode::Grad, TransposeMode::Transpose) => (self.dim() * ncomp * q, ncomp * p),
            (EvalMode::Weight, TransposeMode::NoTranspose) => (0, q),
            (EvalMode::Weight, TransposeMode::Transpose) => {
                return Err(OperatorError::unsupported_shape(
                    entity,
                    "quadrature weights cannot be applied in transpose",
                ))
            }
            (EvalMode::None, _) => {
                return Err(OperatorError::unsupported_shape(
                    entity,
                    "evaluation mode none is handled without a basis",
                ))
            }
        };
        if u.len() != expected_u || v.len() != expected_v {
            return Err(OperatorError::incompatible_shape(
                entity,
                format!(
                    "expected element input/output lengths ({expected_u}, {expected_v}), got ({}, {})",
                    u.len(),
                    v.len()
                ),
            ));
        }

        let interp = &self.data.interp;
        let grad = &self.data.grad;
        match (eval_mode, transpose) {
            (EvalMode::Interp, TransposeMode::NoTranspose) => {
                for c in 0..ncomp {
                    let u_c = DVectorView::from_slice(&u[c * p..(c + 1) * p], p);
                    let mut v_c = DVectorViewMut::from_slice(&mut v[c * q..(c + 1) * q], q);
                    v_c.gemv(1.0, interp, &u_c, 0.0);
                }
            }
            (EvalMode::Interp, TransposeMode::Transpose) => {
                for c in 0..ncomp {
                    let u_c = DVectorView::from_slice(&u[c * q..(c + 1) * q], q);
                    let mut v_c = DVectorViewMut::from_slice(&mut v[c * p..(c + 1) * p], p);
                    v_c.gemv_tr(1.0, interp, &u_c, 0.0);
                }
            }
            (EvalMode::Grad, TransposeMode::NoTranspose) => {
                for d in 0..self.dim() {
                    let grad_d = grad.rows(d * q, q);
                    for c in 0..ncomp {
                        let u_c = DVectorView::from_slice(&u[c * p..(c + 1) * p], p);
                        let offset = (d * ncomp + c) * q;
                        let mut v_dc = DVectorViewMut::from_slice(&mut v[offset..offset + q], q);
                        v_dc.gemv(1.0, &grad_d, &u_c, 0.0);
                    }
                }
            }
            (EvalMode::Grad, TransposeMode::Transpose) => {
                v.fill(0.0);
                for d in 0..self.dim() {
                    let grad_d = grad.rows(d * q, q);
                    for c in 0..ncomp {
                        let offset = (d * ncomp + c) * q;
                        let u_dc = DVectorView::from_slice(&u[offset..offset + q], q);
                        let mut v_c = DVectorViewMut::from_slice(&mut v[c * p..(c + 1) * p], p);
                        v_c.gemv_tr(1.0, &grad_d, &u_dc, 1.0);
                    }
                }
            }
            (EvalMode::Weight, TransposeMode::NoTranspose) => {
                v.copy_from_slice(self.q_weights());
            }
            _ => unreachable!("rejected above"),
        }
        Ok(())
    }

    /// Apply the basis to `num_elements` consecutive elements stored in `u`, writing to `v`.
    pub fn apply(
        &self,
        num_elements: usize,
        transpose: TransposeMode,
        eval_mode: EvalMode,
        u: &Vector,
        v: &Vector,
    ) -> Result<()> {
        let node_block = self.num_components() * self.num_nodes();
        let q_block = self.qvalues_per_element(eval_mode);
        let (u_block, v_block) = match (eval_mode, transpose) {
            (EvalMode::Weight, _) => (0, q_block),
            (_, TransposeMode::NoTranspose) => (node_block, q_block),
            (_, TransposeMode::Transpose) => (q_block, node_block),
        };
        if u.len() != num_elements * u_block || v.len() != num_elements * v_block {
            return Err(OperatorError::incompatible_shape(
                "H1 Basis",
                format!(
                    "expected input/output lengths ({}, {}) for {} elements, got ({}, {})",
                    num_elements * u_block,
                    num_elements * v_block,
                    num_elements,
                    u.len(),
                    v.len()
                ),
            ));
        }
        if u.same_storage(v) {
            return Err(OperatorError::AliasingError {
                entity: "H1 Basis".to_string(),
            });
        }

        let u_values = u.read_values();
        let mut v_values = v.write_values();
        for e in 0..num_elements {
            self.apply_element(
                transpose,
                eval_mode,
                &u_values.as_slice()[e * u_block..(e + 1) * u_block],
                &mut v_values.as_mut_slice()[e * v_block..(e + 1) * v_block],
            )?;
        }
        Ok(())
    }
}

/// The basis used by an operator field.
#[derive(Debug, Clone, Copy)]
pub enum BasisOpt<'a> {
    Some(&'a Basis),
    /// Data already lives at the quadrature points; no basis evaluation is performed.
    Collocated,
}

impl<'a> From<&'a Basis> for BasisOpt<'a> {
    fn from(basis: &'a Basis) -> Self {
        Self::Some(basis)
    }
}

impl<'a> BasisOpt<'a> {
    pub fn is_some(&self) -> bool {
        matches!(self, Self::Some(_))
    }

    pub fn is_collocated(&self) -> bool {
        matches!(self, Self::Collocated)
    }
}
