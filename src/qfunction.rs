//! Pointwise functions evaluated independently at every quadrature point.
use crate::basis::EvalMode;
use crate::context::Context;
use crate::error::{OperatorError, Result};
use std::fmt;
use std::io;
use std::sync::Arc;

/// Signature of user-supplied pointwise kernels.
///
/// Arguments are the context data (if a context is attached), the number of quadrature
/// points `q`, the input arrays and the output arrays. Every array holds `size * q` values,
/// laid out `[component][q]`.
pub type QFunctionUser = dyn Fn(Option<&[u8]>, usize, &[&[f64]], &mut [&mut [f64]]) -> eyre::Result<()> + Send + Sync;

/// A named operand of a pointwise function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QFunctionField {
    name: String,
    size: usize,
    eval_mode: EvalMode,
}

impl QFunctionField {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of values per quadrature point.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn eval_mode(&self) -> EvalMode {
        self.eval_mode
    }
}

/// A pointwise function with its declared operands.
///
/// Cloning shares the user kernel; operators keep such clones.
#[derive(Clone)]
pub struct QFunction {
    vector_length: usize,
    inputs: Vec<QFunctionField>,
    outputs: Vec<QFunctionField>,
    user: Arc<QFunctionUser>,
    context: Option<Context>,
    linear: bool,
}

impl fmt::Debug for QFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QFunction")
            .field("vector_length", &self.vector_length)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("context", &self.context)
            .field("linear", &self.linear)
            .finish()
    }
}

impl fmt::Display for QFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "QFunction")?;
        writeln!(f, "  {} Input Field{}:", self.inputs.len(), plural(self.inputs.len()))?;
        for (i, field) in self.inputs.iter().enumerate() {
            write_field(f, "Input", i, field)?;
        }
        writeln!(f, "  {} Output Field{}:", self.outputs.len(), plural(self.outputs.len()))?;
        for (i, field) in self.outputs.iter().enumerate() {
            write_field(f, "Output", i, field)?;
        }
        Ok(())
    }
}

pub(crate) fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn write_field(f: &mut fmt::Formatter<'_>, kind: &str, index: usize, field: &QFunctionField) -> fmt::Result {
    writeln!(f, "    {} Field [{}]:", kind, index)?;
    writeln!(f, "      Name: \"{}\"", field.name)?;
    writeln!(f, "      Size: {}", field.size)?;
    writeln!(f, "      EvalMode: {}", field.eval_mode)
}

impl QFunction {
    /// Create a pointwise function from a kernel. Operands are declared with
    /// [`QFunction::input`] and [`QFunction::output`].
    pub fn create<F>(vector_length: usize, f: F) -> Self
    where
        F: Fn(Option<&[u8]>, usize, &[&[f64]], &mut [&mut [f64]]) -> eyre::Result<()> + Send + Sync + 'static,
    {
        Self {
            vector_length: vector_length.max(1),
            inputs: Vec::new(),
            outputs: Vec::new(),
            user: Arc::new(f),
            context: None,
            linear: true,
        }
    }

    fn check_new_field(&self, name: &str, size: usize, eval_mode: EvalMode) -> Result<()> {
        let entity = "QFunction";
        if self.inputs.iter().chain(&self.outputs).any(|field| field.name == name) {
            return Err(OperatorError::NameConflict {
                entity: entity.to_string(),
                field: name.to_string(),
            });
        }
        if size == 0 {
            return Err(OperatorError::incompatible_shape(
                entity,
                format!("field \"{name}\" must have positive size"),
            ));
        }
        if eval_mode == EvalMode::Weight && size != 1 {
            return Err(OperatorError::incompatible_shape(
                entity,
                format!("weight field \"{name}\" must have size 1"),
            ));
        }
        Ok(())
    }

    /// Declare an input operand.
    pub fn input(mut self, name: &str, size: usize, eval_mode: EvalMode) -> Result<Self> {
        self.check_new_field(name, size, eval_mode)?;
        self.inputs.push(QFunctionField {
            name: name.to_string(),
            size,
            eval_mode,
        });
        Ok(self)
    }

    /// Declare an output operand.
    pub fn output(mut self, name: &str, size: usize, eval_mode: EvalMode) -> Result<Self> {
        self.check_new_field(name, size, eval_mode)?;
        if eval_mode == EvalMode::Weight {
            return Err(OperatorError::unsupported_shape(
                "QFunction",
                format!("output field \"{name}\" cannot use quadrature weights"),
            ));
        }
        self.outputs.push(QFunctionField {
            name: name.to_string(),
            size,
            eval_mode,
        });
        Ok(self)
    }

    /// Attach parameter data that is passed to every invocation of the kernel.
    pub fn context(mut self, context: &Context) -> Self {
        self.context = Some(context.clone());
        self
    }

    /// Mark the kernel as nonlinear in its active inputs, which rules out linear assembly.
    pub fn nonlinear(mut self) -> Self {
        self.linear = false;
        self
    }

    pub fn is_linear(&self) -> bool {
        self.linear
    }

    pub fn vector_length(&self) -> usize {
        self.vector_length
    }

    pub fn inputs(&self) -> &[QFunctionField] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[QFunctionField] {
        &self.outputs
    }

    pub fn get_context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// Number of holders of the kernel.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.user)
    }

    pub(crate) fn context_bytes(&self) -> Result<Option<Vec<u8>>> {
        match &self.context {
            Some(context) => context.bytes(),
            None => Ok(None),
        }
    }

    /// Invoke the kernel with pre-fetched context data.
    pub(crate) fn invoke(
        &self,
        context: Option<&[u8]>,
        q: usize,
        inputs: &[&[f64]],
        outputs: &mut [&mut [f64]],
    ) -> Result<()> {
        (self.user)(context, q, inputs, outputs).map_err(|err| OperatorError::backend("QFunction::apply", err))
    }

    /// Evaluate the kernel at `q` points.
    ///
    /// Each input and output array must hold `size * q` values.
    pub fn apply(&self, q: usize, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) -> Result<()> {
        let entity = "QFunction";
        if inputs.len() != self.inputs.len() || outputs.len() != self.outputs.len() {
            return Err(OperatorError::incompatible_shape(
                entity,
                format!(
                    "expected {} inputs and {} outputs, got {} and {}",
                    self.inputs.len(),
                    self.outputs.len(),
                    inputs.len(),
                    outputs.len()
                ),
            ));
        }
        let input_sizes = self.inputs.iter().zip(inputs.iter().map(|u| u.len()));
        let output_sizes = self.outputs.iter().zip(outputs.iter().map(|v| v.len()));
        for (field, len) in input_sizes.chain(output_sizes) {
            if len != field.size * q {
                return Err(OperatorError::incompatible_shape(
                    entity,
                    format!("field \"{}\" expects {} values, got {}", field.name, field.size * q, len),
                ));
            }
        }
        let context = self.context_bytes()?;
        self.invoke(context.as_deref(), q, inputs, outputs)
    }

    /// Write a textual description of the pointwise function.
    pub fn view(&self, writer: &mut impl io::Write) -> io::Result<()> {
        write!(writer, "{}", self)
    }
}

/// Optional pointwise function, used for the Jacobian companions of an operator.
#[derive(Debug, Clone, Copy)]
pub enum QFunctionOpt<'a> {
    Some(&'a QFunction),
    None,
}

impl<'a> From<&'a QFunction> for QFunctionOpt<'a> {
    fn from(qf: &'a QFunction) -> Self {
        Self::Some(qf)
    }
}

impl<'a> QFunctionOpt<'a> {
    pub fn is_some(&self) -> bool {
        matches!(self, Self::Some(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}
