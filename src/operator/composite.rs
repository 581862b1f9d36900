use crate::ceed::Ceed;
use crate::error::{OperatorError, Result};
use crate::operator::{AssemblyKind, Operator, OperatorApply, OutputMode};
use crate::qfunction::plural;
use crate::vector::Vector;
use log::debug;
use std::fmt;
use std::io;

/// A member of a composite operator.
#[derive(Debug)]
pub enum SubOperator {
    Single(Operator),
    Composite(CompositeOperator),
}

impl From<Operator> for SubOperator {
    fn from(op: Operator) -> Self {
        Self::Single(op)
    }
}

impl From<CompositeOperator> for SubOperator {
    fn from(op: CompositeOperator) -> Self {
        Self::Composite(op)
    }
}

impl SubOperator {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: &str) -> fmt::Result {
        match self {
            SubOperator::Single(op) => op.fmt_indented(f, indent),
            SubOperator::Composite(op) => op.fmt_indented(f, indent),
        }
    }
}

impl OperatorApply for SubOperator {
    fn is_ready(&self) -> bool {
        match self {
            SubOperator::Single(op) => op.is_ready(),
            SubOperator::Composite(op) => op.is_ready(),
        }
    }

    fn check_apply(&self, input: Option<&Vector>, output: Option<&Vector>) -> Result<()> {
        match self {
            SubOperator::Single(op) => op.check_apply(input, output),
            SubOperator::Composite(op) => op.check_apply(input, output),
        }
    }

    fn zero_outputs(&self, output: Option<&Vector>) {
        match self {
            SubOperator::Single(op) => op.zero_outputs(output),
            SubOperator::Composite(op) => op.zero_outputs(output),
        }
    }

    fn apply_with_mode(&self, input: Option<&Vector>, output: Option<&Vector>, mode: OutputMode) -> Result<()> {
        match self {
            SubOperator::Single(op) => op.apply_with_mode(input, output, mode),
            SubOperator::Composite(op) => op.apply_with_mode(input, output, mode),
        }
    }

    fn check_assembly(&self, output: &Vector, kind: AssemblyKind) -> Result<()> {
        match self {
            SubOperator::Single(op) => op.check_assembly(output, kind),
            SubOperator::Composite(op) => op.check_assembly(output, kind),
        }
    }

    fn assemble_with_mode(&self, output: &Vector, kind: AssemblyKind, mode: OutputMode) -> Result<()> {
        match self {
            SubOperator::Single(op) => op.assemble_with_mode(output, kind, mode),
            SubOperator::Composite(op) => op.assemble_with_mode(output, kind, mode),
        }
    }
}

/// The sum of the actions of an ordered list of sub-operators.
///
/// Sub-operators are moved into the composite, so an operator belongs to at most one
/// composite. Every sub-operator is evaluated before any output is written. The overwrite
/// of an [`OperatorApply::apply`] then happens once, and the sub-operators accumulate into
/// the output in insertion order.
#[derive(Debug, Default)]
pub struct CompositeOperator {
    sub_operators: Vec<SubOperator>,
}

impl CompositeOperator {
    pub fn create(ceed: &Ceed) -> Self {
        debug!("creating composite operator on {}", ceed.resource().name());
        Self::default()
    }

    /// Append a fully bound operator (or composite).
    ///
    /// Fails with `NotReady` if the operator has unbound fields, in which case it is dropped.
    pub fn add_sub(&mut self, op: impl Into<SubOperator>) -> Result<()> {
        let op = op.into();
        if !op.is_ready() {
            return Err(OperatorError::not_ready(
                "CompositeOperator",
                format!("sub-operator {} has unbound fields", self.sub_operators.len()),
            ));
        }
        self.sub_operators.push(op);
        Ok(())
    }

    /// Builder form of [`CompositeOperator::add_sub`].
    pub fn sub_operator(mut self, op: impl Into<SubOperator>) -> Result<Self> {
        self.add_sub(op)?;
        Ok(self)
    }

    pub fn sub_operators(&self) -> &[SubOperator] {
        &self.sub_operators
    }

    pub fn num_sub_operators(&self) -> usize {
        self.sub_operators.len()
    }

    /// All operators of the composite, nested composites flattened, in insertion order.
    fn operators(&self) -> Vec<&Operator> {
        let mut operators = Vec::new();
        self.collect_operators(&mut operators);
        operators
    }

    fn collect_operators<'a>(&'a self, operators: &mut Vec<&'a Operator>) {
        for op in &self.sub_operators {
            match op {
                SubOperator::Single(op) => operators.push(op),
                SubOperator::Composite(op) => op.collect_operators(operators),
            }
        }
    }

    /// Write a textual description of the composite and all its sub-operators.
    pub fn view(&self, writer: &mut impl io::Write) -> io::Result<()> {
        write!(writer, "{}", self)
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: &str) -> fmt::Result {
        let n = self.sub_operators.len();
        writeln!(f, "{indent}Composite Operator")?;
        writeln!(f, "{indent}  {} SubOperator{}", n, plural(n))?;
        let nested = format!("{indent}    ");
        for (i, op) in self.sub_operators.iter().enumerate() {
            writeln!(f, "{indent}  SubOperator [{i}]:")?;
            op.fmt_indented(f, &nested)?;
        }
        Ok(())
    }
}

impl fmt::Display for CompositeOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, "")
    }
}

impl OperatorApply for CompositeOperator {
    fn is_ready(&self) -> bool {
        self.sub_operators.iter().all(SubOperator::is_ready)
    }

    fn check_apply(&self, input: Option<&Vector>, output: Option<&Vector>) -> Result<()> {
        if let (Some(input), Some(output)) = (input, output) {
            if input.same_storage(output) {
                return Err(OperatorError::AliasingError {
                    entity: "CompositeOperator".to_string(),
                });
            }
        }
        self.sub_operators
            .iter()
            .try_for_each(|op| op.check_apply(input, output))
    }

    fn zero_outputs(&self, output: Option<&Vector>) {
        if let Some(output) = output {
            output.set_value(0.0);
        }
        for op in &self.sub_operators {
            op.zero_outputs(output);
        }
    }

    fn apply_with_mode(&self, input: Option<&Vector>, output: Option<&Vector>, mode: OutputMode) -> Result<()> {
        self.check_apply(input, output)?;
        let operators = self.operators();
        let evaluated = operators
            .iter()
            .map(|op| op.evaluate_action(input))
            .collect::<Result<Vec<_>>>()?;
        if mode == OutputMode::Overwrite {
            self.zero_outputs(output);
        }
        for (op, element_outputs) in operators.iter().zip(&evaluated) {
            op.scatter_action(output, element_outputs);
        }
        Ok(())
    }

    fn check_assembly(&self, output: &Vector, kind: AssemblyKind) -> Result<()> {
        self.sub_operators
            .iter()
            .try_for_each(|op| op.check_assembly(output, kind))
    }

    fn assemble_with_mode(&self, output: &Vector, kind: AssemblyKind, mode: OutputMode) -> Result<()> {
        self.check_assembly(output, kind)?;
        let operators = self.operators();
        let evaluated = operators
            .iter()
            .map(|op| op.evaluate_assembly(kind))
            .collect::<Result<Vec<_>>>()?;
        if mode == OutputMode::Overwrite {
            output.set_value(0.0);
        }
        for (op, element_blocks) in operators.iter().zip(&evaluated) {
            op.scatter_assembly(output, kind, element_blocks)?;
        }
        Ok(())
    }
}
