//! Operators: a pointwise function composed with element restrictions and bases.
//!
//! Applying an operator performs, for every element,
//!
//! 1. a gather of the element values of every input field through its restriction,
//! 2. the evaluation of the field at the quadrature points through its basis
//!    (skipped for collocated fields),
//! 3. the pointwise function at all quadrature points of the element,
//! 4. the transpose basis action on every output field, and
//! 5. a scatter-add of the element values into the output vectors.
//!
//! Contributions of elements sharing a degree of freedom are summed.
use crate::basis::{Basis, BasisOpt, EvalMode};
use crate::ceed::{Ceed, ExecutionStrategy};
use crate::error::{OperatorError, Result};
use crate::qfunction::{plural, QFunction, QFunctionField, QFunctionOpt};
use crate::request::Request;
use crate::restriction::{ElemRestriction, ElemRestrictionOpt};
use crate::vector::{Vector, VectorOpt};
use crate::TransposeMode;
use log::{debug, trace};
use std::fmt;
use std::io;

mod backend;
mod composite;

pub use composite::*;

use backend::{ElementExecutor, ElementWorkspace, Executor};

/// Whether results replace or accumulate into the contents of the output vector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutputMode {
    Overwrite,
    Add,
}

/// The kind of linear assembly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssemblyKind {
    /// One scalar per degree of freedom.
    Diagonal,
    /// One dense, row-major `ncomp x ncomp` block per node.
    PointBlockDiagonal,
}

impl fmt::Display for AssemblyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyKind::Diagonal => write!(f, "diagonal"),
            AssemblyKind::PointBlockDiagonal => write!(f, "point block diagonal"),
        }
    }
}

#[derive(Debug, Clone)]
enum FieldVector {
    Active,
    None,
    Passive(Vector),
}

/// A field binding: restriction, basis and vector attached to one operand of the
/// pointwise function.
#[derive(Debug, Clone)]
pub struct OperatorField {
    name: String,
    eval_mode: EvalMode,
    size: usize,
    restriction: Option<ElemRestriction>,
    basis: Option<Basis>,
    vector: FieldVector,
}

impl OperatorField {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn eval_mode(&self) -> EvalMode {
        self.eval_mode
    }

    pub fn elem_restriction(&self) -> ElemRestrictionOpt<'_> {
        match &self.restriction {
            Some(restriction) => ElemRestrictionOpt::Some(restriction),
            None => ElemRestrictionOpt::None,
        }
    }

    pub fn basis(&self) -> BasisOpt<'_> {
        match &self.basis {
            Some(basis) => BasisOpt::Some(basis),
            None => BasisOpt::Collocated,
        }
    }

    pub fn vector(&self) -> VectorOpt<'_> {
        match &self.vector {
            FieldVector::Active => VectorOpt::Active,
            FieldVector::None => VectorOpt::None,
            FieldVector::Passive(vector) => VectorOpt::Some(vector),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.vector, FieldVector::Active)
    }

    fn element_block_size(&self) -> usize {
        self.restriction
            .as_ref()
            .map(ElemRestriction::element_block_size)
            .unwrap_or(0)
    }

    fn num_elements(&self) -> Option<usize> {
        self.restriction.as_ref().map(ElemRestriction::num_elements)
    }

    fn num_quadrature_points(&self) -> Option<usize> {
        match (&self.basis, &self.restriction) {
            (Some(basis), _) => Some(basis.num_quadrature_points()),
            (None, Some(restriction)) => Some(restriction.elem_size()),
            (None, None) => None,
        }
    }

    /// Gather the E-vector of this field, if it reads from a vector.
    fn gather(&self, input: Option<&Vector>) -> Option<Vec<f64>> {
        let restriction = self.restriction.as_ref()?;
        let source = match &self.vector {
            FieldVector::Active => input?,
            FieldVector::Passive(vector) => vector,
            FieldVector::None => return None,
        };
        let values = source.read_values();
        let block = restriction.element_block_size();
        let mut evector = vec![0.0; restriction.evector_size()];
        for (e, element_values) in evector.chunks_exact_mut(block).enumerate() {
            restriction.gather_element(e, values.as_slice(), element_values);
        }
        Some(evector)
    }
}

/// The apply/assembly contract shared by single and composite operators.
///
/// `apply` overwrites the output, `apply_add` sums into it; the same holds for the
/// assembly entry points. Every precondition is checked before any vector is modified.
pub trait OperatorApply {
    /// Whether every operand has a binding.
    fn is_ready(&self) -> bool;

    /// Check every precondition of an apply without touching any data.
    fn check_apply(&self, input: Option<&Vector>, output: Option<&Vector>) -> Result<()>;

    /// Zero every vector an overwriting apply writes to.
    fn zero_outputs(&self, output: Option<&Vector>);

    fn apply_with_mode(&self, input: Option<&Vector>, output: Option<&Vector>, mode: OutputMode) -> Result<()>;

    /// Check every precondition of a linear assembly without touching any data.
    fn check_assembly(&self, output: &Vector, kind: AssemblyKind) -> Result<()>;

    fn assemble_with_mode(&self, output: &Vector, kind: AssemblyKind, mode: OutputMode) -> Result<()>;

    /// Apply the operator, overwriting the output.
    fn apply<'a>(&self, input: impl Into<VectorOpt<'a>>, output: impl Into<VectorOpt<'a>>, request: Request) -> Result<()>
    where
        Self: Sized,
    {
        let input = vector_argument(input.into(), "input")?;
        let output = vector_argument(output.into(), "output")?;
        trace_request("apply", request);
        self.apply_with_mode(input, output, OutputMode::Overwrite)
    }

    /// Apply the operator, adding the result to the output.
    fn apply_add<'a>(
        &self,
        input: impl Into<VectorOpt<'a>>,
        output: impl Into<VectorOpt<'a>>,
        request: Request,
    ) -> Result<()>
    where
        Self: Sized,
    {
        let input = vector_argument(input.into(), "input")?;
        let output = vector_argument(output.into(), "output")?;
        trace_request("apply_add", request);
        self.apply_with_mode(input, output, OutputMode::Add)
    }

    /// Assemble the diagonal of a square linear operator.
    fn linear_assemble_diagonal(&self, output: &Vector, request: Request) -> Result<()>
    where
        Self: Sized,
    {
        trace_request("linear_assemble_diagonal", request);
        self.assemble_with_mode(output, AssemblyKind::Diagonal, OutputMode::Overwrite)
    }

    /// Sum the diagonal of a square linear operator into a vector.
    fn linear_assemble_add_diagonal(&self, output: &Vector, request: Request) -> Result<()>
    where
        Self: Sized,
    {
        trace_request("linear_assemble_add_diagonal", request);
        self.assemble_with_mode(output, AssemblyKind::Diagonal, OutputMode::Add)
    }

    /// Assemble the point block diagonal of a square linear operator, stored row-major with
    /// an `ncomp x ncomp` block per node.
    fn linear_assemble_point_block_diagonal(&self, output: &Vector, request: Request) -> Result<()>
    where
        Self: Sized,
    {
        trace_request("linear_assemble_point_block_diagonal", request);
        self.assemble_with_mode(output, AssemblyKind::PointBlockDiagonal, OutputMode::Overwrite)
    }

    /// Sum the point block diagonal of a square linear operator into a vector.
    fn linear_assemble_add_point_block_diagonal(&self, output: &Vector, request: Request) -> Result<()>
    where
        Self: Sized,
    {
        trace_request("linear_assemble_add_point_block_diagonal", request);
        self.assemble_with_mode(output, AssemblyKind::PointBlockDiagonal, OutputMode::Add)
    }
}

fn vector_argument<'a>(vector: VectorOpt<'a>, role: &str) -> Result<Option<&'a Vector>> {
    match vector {
        VectorOpt::Some(vector) => Ok(Some(vector)),
        VectorOpt::None => Ok(None),
        VectorOpt::Active => Err(OperatorError::invalid_state(
            "Operator",
            format!("the {role} of an apply must be a concrete vector or none, not the active marker"),
        )),
    }
}

fn trace_request(call: &str, request: Request) {
    trace!("{call} issued with {request:?} request");
}

/// A pointwise function together with the field bindings of all its operands.
pub struct Operator {
    qf: QFunction,
    dqf: Option<QFunction>,
    dqf_transpose: Option<QFunction>,
    inputs: Vec<Option<OperatorField>>,
    outputs: Vec<Option<OperatorField>>,
    executor: Executor,
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("qf", &self.qf)
            .field("has_jacobian", &self.has_jacobian())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("executor", &self.executor)
            .finish()
    }
}

impl Operator {
    /// Create an operator for the pointwise function `qf`.
    ///
    /// The Jacobian companions `dqf` and `dqf_transpose` must be given together or not at all.
    pub fn create<'a>(
        ceed: &Ceed,
        qf: &QFunction,
        dqf: impl Into<QFunctionOpt<'a>>,
        dqf_transpose: impl Into<QFunctionOpt<'a>>,
    ) -> Result<Self> {
        let (dqf, dqf_transpose) = match (dqf.into(), dqf_transpose.into()) {
            (QFunctionOpt::Some(dqf), QFunctionOpt::Some(dqf_transpose)) => {
                (Some(dqf.clone()), Some(dqf_transpose.clone()))
            }
            (QFunctionOpt::None, QFunctionOpt::None) => (None, None),
            _ => {
                return Err(OperatorError::invalid_state(
                    "Operator",
                    "Jacobian and transpose Jacobian functions must be supplied together",
                ))
            }
        };
        let strategy = ceed.resource().strategy();
        debug!(
            "creating operator with {} input(s), {} output(s), strategy {:?}",
            qf.inputs().len(),
            qf.outputs().len(),
            strategy
        );
        Ok(Self {
            qf: qf.clone(),
            dqf,
            dqf_transpose,
            inputs: vec![None; qf.inputs().len()],
            outputs: vec![None; qf.outputs().len()],
            executor: Executor::from_strategy(strategy),
        })
    }

    /// Bind `restriction`, `basis` and `vector` to the operand called `name`.
    ///
    /// On error the operator is left unchanged.
    pub fn set_field<'a>(
        &mut self,
        name: &str,
        restriction: impl Into<ElemRestrictionOpt<'a>>,
        basis: impl Into<BasisOpt<'a>>,
        vector: impl Into<VectorOpt<'a>>,
    ) -> Result<()> {
        let (is_input, index) = self.lookup_field(name)?;
        let qf_field = if is_input {
            &self.qf.inputs()[index]
        } else {
            &self.qf.outputs()[index]
        };
        let slot = if is_input {
            &self.inputs[index]
        } else {
            &self.outputs[index]
        };
        if slot.is_some() {
            return Err(OperatorError::NameConflict {
                entity: "Operator".to_string(),
                field: name.to_string(),
            });
        }

        let field = make_field(qf_field, is_input, restriction.into(), basis.into(), vector.into())?;
        self.check_consistency(&field)?;

        if is_input {
            self.inputs[index] = Some(field);
        } else {
            self.outputs[index] = Some(field);
        }
        Ok(())
    }

    /// Builder form of [`Operator::set_field`].
    pub fn field<'a>(
        mut self,
        name: &str,
        restriction: impl Into<ElemRestrictionOpt<'a>>,
        basis: impl Into<BasisOpt<'a>>,
        vector: impl Into<VectorOpt<'a>>,
    ) -> Result<Self> {
        self.set_field(name, restriction, basis, vector)?;
        Ok(self)
    }

    fn lookup_field(&self, name: &str) -> Result<(bool, usize)> {
        let find = |fields: &[QFunctionField]| fields.iter().position(|field| field.name() == name);
        if let Some(index) = find(self.qf.inputs()) {
            Ok((true, index))
        } else if let Some(index) = find(self.qf.outputs()) {
            Ok((false, index))
        } else {
            Err(OperatorError::UnknownField {
                entity: "the QFunction of Operator".to_string(),
                field: name.to_string(),
            })
        }
    }

    fn check_consistency(&self, field: &OperatorField) -> Result<()> {
        let entity = format!("field \"{}\" of Operator", field.name);
        if let (Some(existing), Some(new)) = (self.num_elements_opt(), field.num_elements()) {
            if existing != new {
                return Err(OperatorError::incompatible_shape(
                    entity,
                    format!("restriction has {new} elements, operator has {existing}"),
                ));
            }
        }
        if let (Some(existing), Some(new)) = (self.num_quadrature_points_opt(), field.num_quadrature_points()) {
            if existing != new {
                return Err(OperatorError::incompatible_shape(
                    entity,
                    format!("field has {new} quadrature points, operator has {existing}"),
                ));
            }
        }
        Ok(())
    }

    fn bound_fields(&self) -> impl Iterator<Item = &OperatorField> {
        self.inputs.iter().chain(&self.outputs).flatten()
    }

    fn input_fields(&self) -> impl Iterator<Item = &OperatorField> {
        self.inputs.iter().flatten()
    }

    fn output_fields(&self) -> impl Iterator<Item = &OperatorField> {
        self.outputs.iter().flatten()
    }

    fn num_elements_opt(&self) -> Option<usize> {
        self.bound_fields().find_map(OperatorField::num_elements)
    }

    fn num_quadrature_points_opt(&self) -> Option<usize> {
        self.bound_fields().find_map(OperatorField::num_quadrature_points)
    }

    /// Number of elements, or zero if no restriction has been bound yet.
    pub fn num_elements(&self) -> usize {
        self.num_elements_opt().unwrap_or(0)
    }

    /// Number of quadrature points per element, or zero if not yet known.
    pub fn num_quadrature_points(&self) -> usize {
        self.num_quadrature_points_opt().unwrap_or(0)
    }

    pub fn qfunction(&self) -> &QFunction {
        &self.qf
    }

    pub fn has_jacobian(&self) -> bool {
        self.dqf.is_some()
    }

    /// The Jacobian and transpose Jacobian companions, if given.
    pub fn jacobian(&self) -> Option<(&QFunction, &QFunction)> {
        self.dqf.as_ref().zip(self.dqf_transpose.as_ref())
    }

    pub fn execution_strategy(&self) -> ExecutionStrategy {
        self.executor.strategy()
    }

    /// The bound input fields, in declaration order.
    pub fn inputs(&self) -> Vec<&OperatorField> {
        self.input_fields().collect()
    }

    /// The bound output fields, in declaration order.
    pub fn outputs(&self) -> Vec<&OperatorField> {
        self.output_fields().collect()
    }

    fn check_ready(&self) -> Result<()> {
        use itertools::Itertools;
        let missing: Vec<&str> = self
            .qf
            .inputs()
            .iter()
            .zip(&self.inputs)
            .chain(self.qf.outputs().iter().zip(&self.outputs))
            .filter(|(_, slot)| slot.is_none())
            .map(|(field, _)| field.name())
            .collect();
        if !missing.is_empty() {
            return Err(OperatorError::not_ready(
                "Operator",
                format!("missing bindings for fields {}", missing.iter().format(", ")),
            ));
        }
        if self.inputs.is_empty() && self.outputs.is_empty() {
            return Err(OperatorError::not_ready("Operator", "the QFunction declares no fields"));
        }
        Ok(())
    }

    fn check_context(&self) -> Result<()> {
        match self.qf.get_context() {
            Some(context) if context.is_borrowed() => Err(OperatorError::invalid_state(
                "Operator",
                "the QFunction context is borrowed for writing",
            )),
            _ => Ok(()),
        }
    }

    fn check_active_vector(&self, fields: &[&OperatorField], vector: Option<&Vector>, role: &str) -> Result<()> {
        for field in fields {
            let restriction = match &field.restriction {
                Some(restriction) => restriction,
                None => continue,
            };
            match vector {
                None => {
                    return Err(OperatorError::incompatible_shape(
                        "Operator",
                        format!("active {role} field \"{}\" requires an {role} vector", field.name),
                    ))
                }
                Some(vector) if vector.len() != restriction.lvector_size() => {
                    return Err(OperatorError::incompatible_shape(
                        "Operator",
                        format!(
                            "active {role} field \"{}\" expects a vector of length {}, got {}",
                            field.name,
                            restriction.lvector_size(),
                            vector.len()
                        ),
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Output vector of every output field, with the active marker resolved to `output`.
    fn output_targets(&self, output: Option<&Vector>) -> Vec<Option<Vector>> {
        self.output_fields()
            .map(|field| match &field.vector {
                FieldVector::Active => output.cloned(),
                FieldVector::Passive(vector) => Some(vector.clone()),
                FieldVector::None => None,
            })
            .collect()
    }

    /// Run steps 2 to 4 of the pipeline on one element, returning the element values of every
    /// output field.
    ///
    /// If `active_values` is given, it replaces the gathered values of the active input fields.
    fn evaluate_element(
        &self,
        element: usize,
        evectors: &[Option<Vec<f64>>],
        active_values: Option<&[f64]>,
        context: Option<&[u8]>,
        ws: &mut ElementWorkspace,
    ) -> Result<Vec<Vec<f64>>> {
        let q = self.num_quadrature_points();
        ws.qin.resize_with(self.inputs.len(), Vec::new);
        ws.qout.resize_with(self.outputs.len(), Vec::new);

        for (i, field) in self.input_fields().enumerate() {
            let qvalues = &mut ws.qin[i];
            qvalues.clear();
            qvalues.resize(field.size * q, 0.0);

            if field.eval_mode == EvalMode::Weight {
                if let Some(basis) = &field.basis {
                    basis.apply_element(TransposeMode::NoTranspose, EvalMode::Weight, &[], qvalues)?;
                }
                continue;
            }

            let node_values = match (field.is_active(), active_values) {
                (true, Some(values)) => values,
                _ => {
                    let evector = evectors[i].as_ref().ok_or_else(|| {
                        OperatorError::invalid_state(
                            format!("field \"{}\" of Operator", field.name),
                            "no data available for input field",
                        )
                    })?;
                    let block = field.element_block_size();
                    &evector[element * block..(element + 1) * block]
                }
            };
            match &field.basis {
                Some(basis) => basis.apply_element(TransposeMode::NoTranspose, field.eval_mode, node_values, qvalues)?,
                None => qvalues.copy_from_slice(node_values),
            }
        }

        for (i, field) in self.output_fields().enumerate() {
            let qvalues = &mut ws.qout[i];
            qvalues.clear();
            qvalues.resize(field.size * q, 0.0);
        }

        {
            let inputs: Vec<&[f64]> = ws.qin.iter().map(Vec::as_slice).collect();
            let mut outputs: Vec<&mut [f64]> = ws.qout.iter_mut().map(Vec::as_mut_slice).collect();
            self.qf.invoke(context, q, &inputs, &mut outputs)?;
        }

        self.output_fields()
            .enumerate()
            .map(|(i, field)| {
                let mut node_values = vec![0.0; field.element_block_size()];
                match &field.basis {
                    Some(basis) => {
                        basis.apply_element(TransposeMode::Transpose, field.eval_mode, &ws.qout[i], &mut node_values)?
                    }
                    None => node_values.copy_from_slice(&ws.qout[i]),
                }
                Ok(node_values)
            })
            .collect()
    }

    fn gather_inputs(&self, input: Option<&Vector>) -> Vec<Option<Vec<f64>>> {
        self.input_fields().map(|field| field.gather(input)).collect()
    }

    fn single_active_pair(&self) -> Result<((usize, &OperatorField), (usize, &OperatorField))> {
        let active_inputs: Vec<_> = self.input_fields().enumerate().filter(|(_, f)| f.is_active()).collect();
        let active_outputs: Vec<_> = self.output_fields().enumerate().filter(|(_, f)| f.is_active()).collect();
        match (active_inputs.as_slice(), active_outputs.as_slice()) {
            ([input], [output]) => Ok((*input, *output)),
            _ => Err(OperatorError::unsupported_shape(
                "Operator",
                format!(
                    "linear assembly requires exactly one active input and one active output field, found {} and {}",
                    active_inputs.len(),
                    active_outputs.len()
                ),
            )),
        }
    }

    /// Write a textual description of the operator.
    pub fn view(&self, writer: &mut impl io::Write) -> io::Result<()> {
        write!(writer, "{}", self)
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: &str) -> fmt::Result {
        let num_fields = self.inputs.len() + self.outputs.len();
        writeln!(f, "{indent}Operator")?;
        writeln!(f, "{indent}  {} Field{}", num_fields, plural(num_fields))?;
        writeln!(f, "{indent}  {} Input Field{}:", self.inputs.len(), plural(self.inputs.len()))?;
        for (i, (qf_field, slot)) in self.qf.inputs().iter().zip(&self.inputs).enumerate() {
            fmt_field(f, indent, "Input", i, qf_field, slot.as_ref())?;
        }
        writeln!(f, "{indent}  {} Output Field{}:", self.outputs.len(), plural(self.outputs.len()))?;
        for (i, (qf_field, slot)) in self.qf.outputs().iter().zip(&self.outputs).enumerate() {
            fmt_field(f, indent, "Output", i, qf_field, slot.as_ref())?;
        }
        Ok(())
    }
}

fn fmt_field(
    f: &mut fmt::Formatter<'_>,
    indent: &str,
    kind: &str,
    index: usize,
    qf_field: &QFunctionField,
    field: Option<&OperatorField>,
) -> fmt::Result {
    writeln!(f, "{indent}    {kind} Field [{index}]:")?;
    writeln!(f, "{indent}      Name: \"{}\"", qf_field.name())?;
    match field {
        None => writeln!(f, "{indent}      Not bound"),
        Some(field) => {
            match &field.vector {
                FieldVector::Active => writeln!(f, "{indent}      Active vector")?,
                FieldVector::None => writeln!(f, "{indent}      No vector")?,
                FieldVector::Passive(vector) => writeln!(f, "{indent}      Passive vector of length {}", vector.len())?,
            }
            if field.basis.is_none() && field.eval_mode != EvalMode::Weight {
                writeln!(f, "{indent}      Collocated basis")?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, "")
    }
}

/// Validate a binding against the declaration of its operand.
fn make_field(
    qf_field: &QFunctionField,
    is_input: bool,
    restriction: ElemRestrictionOpt,
    basis: BasisOpt,
    vector: VectorOpt,
) -> Result<OperatorField> {
    let name = qf_field.name();
    let entity = format!("field \"{name}\" of Operator");
    let shape_error = |reason: String| OperatorError::incompatible_shape(entity.clone(), reason);
    let eval_mode = qf_field.eval_mode();
    let size = qf_field.size();

    let restriction = match restriction {
        ElemRestrictionOpt::Some(restriction) => Some(restriction.clone()),
        ElemRestrictionOpt::None => None,
    };
    let basis = match basis {
        BasisOpt::Some(basis) => Some(basis.clone()),
        BasisOpt::Collocated => None,
    };
    let vector = match vector {
        VectorOpt::Active => FieldVector::Active,
        VectorOpt::None => FieldVector::None,
        VectorOpt::Some(vector) => FieldVector::Passive(vector.clone()),
    };

    match eval_mode {
        EvalMode::Weight => {
            if basis.is_none() {
                return Err(shape_error("quadrature weights require a basis".to_string()));
            }
            if restriction.is_some() {
                return Err(shape_error("quadrature weights take no restriction".to_string()));
            }
            if !matches!(vector, FieldVector::None) {
                return Err(shape_error("quadrature weights take no vector".to_string()));
            }
        }
        EvalMode::None | EvalMode::Interp | EvalMode::Grad => {
            let r = restriction
                .as_ref()
                .ok_or_else(|| shape_error(format!("evaluation mode {eval_mode} requires a restriction")))?;
            match (&basis, eval_mode) {
                (None, EvalMode::None) => {
                    if r.num_components() != size {
                        return Err(shape_error(format!(
                            "collocated field has size {size}, restriction has {} components",
                            r.num_components()
                        )));
                    }
                }
                (Some(_), EvalMode::None) => {
                    return Err(shape_error(
                        "evaluation mode none requires a collocated basis".to_string(),
                    ))
                }
                (None, _) => return Err(shape_error(format!("evaluation mode {eval_mode} requires a basis"))),
                (Some(b), _) => {
                    if r.elem_size() != b.num_nodes() {
                        return Err(shape_error(format!(
                            "restriction element size {} does not match the {} basis nodes",
                            r.elem_size(),
                            b.num_nodes()
                        )));
                    }
                    if r.num_components() != b.num_components() {
                        return Err(shape_error(format!(
                            "restriction has {} components, basis has {}",
                            r.num_components(),
                            b.num_components()
                        )));
                    }
                    let expected_size = match eval_mode {
                        EvalMode::Grad => b.num_components() * b.dim(),
                        _ => b.num_components(),
                    };
                    if size != expected_size {
                        return Err(shape_error(format!(
                            "operand size {size} does not match {expected_size} values per point from the basis"
                        )));
                    }
                }
            }
            match &vector {
                FieldVector::Passive(v) if v.len() != r.lvector_size() => {
                    return Err(shape_error(format!(
                        "vector has length {}, restriction expects {}",
                        v.len(),
                        r.lvector_size()
                    )))
                }
                FieldVector::None => {
                    let role = if is_input { "input" } else { "output" };
                    return Err(shape_error(format!("{role} field with evaluation mode {eval_mode} needs a vector")));
                }
                _ => {}
            }
        }
    }

    Ok(OperatorField {
        name: name.to_string(),
        eval_mode,
        size,
        restriction,
        basis,
        vector,
    })
}

impl OperatorApply for Operator {
    fn is_ready(&self) -> bool {
        self.check_ready().is_ok()
    }

    fn check_apply(&self, input: Option<&Vector>, output: Option<&Vector>) -> Result<()> {
        self.check_ready()?;
        self.check_context()?;
        if let (Some(input), Some(output)) = (input, output) {
            if input.same_storage(output) {
                return Err(OperatorError::AliasingError {
                    entity: "Operator".to_string(),
                });
            }
        }
        let active_inputs: Vec<_> = self.input_fields().filter(|f| f.is_active()).collect();
        let active_outputs: Vec<_> = self.output_fields().filter(|f| f.is_active()).collect();
        self.check_active_vector(&active_inputs, input, "input")?;
        self.check_active_vector(&active_outputs, output, "output")?;
        Ok(())
    }

    fn zero_outputs(&self, output: Option<&Vector>) {
        for target in self.output_targets(output).into_iter().flatten() {
            target.set_value(0.0);
        }
    }

    fn apply_with_mode(&self, input: Option<&Vector>, output: Option<&Vector>, mode: OutputMode) -> Result<()> {
        self.check_apply(input, output)?;
        let element_outputs = self.evaluate_action(input)?;
        if mode == OutputMode::Overwrite {
            self.zero_outputs(output);
        }
        self.scatter_action(output, &element_outputs);
        Ok(())
    }

    fn check_assembly(&self, output: &Vector, kind: AssemblyKind) -> Result<()> {
        self.check_ready()?;
        self.check_context()?;
        if !self.qf.is_linear() {
            return Err(OperatorError::NotLinear {
                entity: "Operator".to_string(),
                reason: format!("{kind} assembly requires a linear QFunction"),
            });
        }
        let ((_, input_field), (_, output_field)) = self.single_active_pair()?;
        let (r_in, r_out) = match (&input_field.restriction, &output_field.restriction) {
            (Some(r_in), Some(r_out)) => (r_in, r_out),
            _ => {
                return Err(OperatorError::unsupported_shape(
                    "Operator",
                    "active fields of a linear operator need restrictions",
                ))
            }
        };
        if !r_in.equivalent(r_out) {
            return Err(OperatorError::unsupported_shape(
                "Operator",
                "the active input and output restrictions differ, so the operator is not square",
            ));
        }

        let ncomp = r_in.num_components();
        let expected = match kind {
            AssemblyKind::Diagonal => r_in.lvector_size(),
            AssemblyKind::PointBlockDiagonal => {
                if r_in.lvector_size() % ncomp != 0 {
                    return Err(OperatorError::unsupported_shape(
                        "Operator",
                        "the L-vector size is not a multiple of the number of components",
                    ));
                }
                let num_nodes = r_in.num_nodes();
                let out_of_range = (0..r_in.num_elements())
                    .flat_map(|e| (0..r_in.elem_size()).map(move |i| (e, i)))
                    .any(|(e, i)| r_in.node_index(e, i) >= num_nodes);
                if out_of_range {
                    return Err(OperatorError::unsupported_shape(
                        "Operator",
                        "point block assembly requires node offsets below the number of nodes",
                    ));
                }
                num_nodes * ncomp * ncomp
            }
        };
        if output.len() != expected {
            return Err(OperatorError::incompatible_shape(
                "Operator",
                format!(
                    "{kind} output must have length {expected}, got {}",
                    output.len()
                ),
            ));
        }
        Ok(())
    }

    fn assemble_with_mode(&self, output: &Vector, kind: AssemblyKind, mode: OutputMode) -> Result<()> {
        self.check_assembly(output, kind)?;
        let element_blocks = self.evaluate_assembly(kind)?;
        if mode == OutputMode::Overwrite {
            output.set_value(0.0);
        }
        self.scatter_assembly(output, kind, &element_blocks)
    }
}

/// Element values of every output field, per element.
pub(crate) type ElementOutputs = Vec<Vec<Vec<f64>>>;

/// Evaluation and scatter are separate phases so that nothing is written to an output vector
/// until every element of every operator involved in a call has been evaluated.
impl Operator {
    /// Evaluate every element for the given active input without touching any output.
    pub(crate) fn evaluate_action(&self, input: Option<&Vector>) -> Result<ElementOutputs> {
        let context = self.qf.context_bytes()?;
        let evectors = self.gather_inputs(input);
        trace!(
            "evaluating operator on {} elements with {} quadrature points",
            self.num_elements(),
            self.num_quadrature_points()
        );
        self.executor.run(self.num_elements(), |e, ws| {
            self.evaluate_element(e, &evectors, None, context.as_deref(), ws)
        })
    }

    /// Scatter-add evaluated element values into the output vectors, in element order.
    pub(crate) fn scatter_action(&self, output: Option<&Vector>, element_outputs: &ElementOutputs) {
        let targets = self.output_targets(output);
        for (i, (field, target)) in self.output_fields().zip(targets).enumerate() {
            let (restriction, target) = match (&field.restriction, target) {
                (Some(restriction), Some(target)) => (restriction, target),
                _ => continue,
            };
            let mut values = target.write_values();
            for (e, element_values) in element_outputs.iter().enumerate() {
                restriction.scatter_add_element(e, &element_values[i], values.as_mut_slice());
            }
        }
    }

    fn active_restriction(&self) -> Result<(usize, &ElemRestriction)> {
        let ((_, input_field), (active_output, _)) = self.single_active_pair()?;
        let restriction = input_field.restriction.as_ref().ok_or_else(|| {
            OperatorError::unsupported_shape("Operator", "active input field needs a restriction")
        })?;
        Ok((active_output, restriction))
    }

    /// Probe every element with unit vectors and collect the requested diagonal blocks.
    pub(crate) fn evaluate_assembly(&self, kind: AssemblyKind) -> Result<Vec<Vec<f64>>> {
        let (active_output, restriction) = self.active_restriction()?;
        let context = self.qf.context_bytes()?;
        let evectors = self.gather_inputs(None);
        let ncomp = restriction.num_components();
        let p = restriction.elem_size();
        trace!(
            "assembling {} of operator on {} elements",
            kind,
            restriction.num_elements()
        );

        self.executor.run(restriction.num_elements(), |e, ws| {
            let mut unit = std::mem::take(&mut ws.unit);
            unit.clear();
            unit.resize(ncomp * p, 0.0);
            let mut block = match kind {
                AssemblyKind::Diagonal => vec![0.0; ncomp * p],
                AssemblyKind::PointBlockDiagonal => vec![0.0; p * ncomp * ncomp],
            };

            let mut assemble = || -> Result<()> {
                for c_in in 0..ncomp {
                    for j in 0..p {
                        let col = c_in * p + j;
                        unit[col] = 1.0;
                        let result = self.evaluate_element(e, &evectors, Some(&unit), context.as_deref(), ws);
                        unit[col] = 0.0;
                        let outputs = result?;
                        let column = &outputs[active_output];
                        match kind {
                            AssemblyKind::Diagonal => block[col] = column[col],
                            AssemblyKind::PointBlockDiagonal => {
                                for c_out in 0..ncomp {
                                    block[(j * ncomp + c_out) * ncomp + c_in] = column[c_out * p + j];
                                }
                            }
                        }
                    }
                }
                Ok(())
            };
            let result = assemble();
            ws.unit = unit;
            result.map(|_| block)
        })
    }

    /// Scatter-add assembled element blocks into `output`, in element order.
    pub(crate) fn scatter_assembly(&self, output: &Vector, kind: AssemblyKind, element_blocks: &[Vec<f64>]) -> Result<()> {
        let (_, restriction) = self.active_restriction()?;
        let ncomp = restriction.num_components();
        let p = restriction.elem_size();
        let mut values = output.write_values();
        let values = values.as_mut_slice();
        for (e, block) in element_blocks.iter().enumerate() {
            match kind {
                AssemblyKind::Diagonal => restriction.scatter_add_element(e, block, values),
                AssemblyKind::PointBlockDiagonal => {
                    let block_len = ncomp * ncomp;
                    for j in 0..p {
                        let node = restriction.node_index(e, j);
                        let target = &mut values[node * block_len..(node + 1) * block_len];
                        for (t, b) in target.iter_mut().zip(&block[j * block_len..(j + 1) * block_len]) {
                            *t += *b;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
