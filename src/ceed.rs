//! The [`Ceed`] handle: backend selection and factory for all other objects.
use crate::basis::Basis;
use crate::context::Context;
use crate::error::{OperatorError, Result};
use crate::operator::{CompositeOperator, Operator};
use crate::qfunction::{QFunction, QFunctionOpt};
use crate::restriction::ElemRestriction;
use crate::vector::Vector;
use log::debug;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Environment variable consulted by [`Ceed::default_init`].
pub const RESOURCE_ENV_VAR: &str = "FEOP_RESOURCE";

const DEFAULT_RESOURCE: &str = "/cpu/self";
const DEFAULT_BLOCK_SIZE: usize = 64;

/// Memory space in which data lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemType {
    Host,
    Device,
}

/// Ownership semantics when handing a buffer to a [`Context`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyMode {
    /// The data is copied; the caller keeps its buffer.
    CopyValues,
    /// The buffer is shared with the caller, who keeps ownership.
    UsePointer,
    /// Ownership of the buffer is transferred.
    OwnPointer,
}

/// How the element loop of an operator is executed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    /// One element after the other on the calling thread.
    Serial,
    /// Elements are processed in blocks on the rayon thread pool.
    Batched { block_size: usize },
}

/// Parsed backend resource description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    name: String,
    mem_type: MemType,
    strategy: ExecutionStrategy,
}

impl Resource {
    /// Parse a resource string such as `/cpu/self/ref/serial` or `/gpu/cuda`.
    pub fn parse(resource: &str) -> Result<Self> {
        let trimmed = resource.trim_end_matches('/');
        let (mem_type, strategy) = match trimmed {
            "/cpu/self" | "/cpu/self/ref" | "/cpu/self/ref/serial" => (MemType::Host, ExecutionStrategy::Serial),
            "/cpu/self/ref/blocked" | "/cpu/self/par" => (
                MemType::Host,
                ExecutionStrategy::Batched {
                    block_size: DEFAULT_BLOCK_SIZE,
                },
            ),
            gpu if gpu == "/gpu" || gpu.starts_with("/gpu/") => (
                MemType::Device,
                ExecutionStrategy::Batched {
                    block_size: DEFAULT_BLOCK_SIZE,
                },
            ),
            _ => {
                return Err(OperatorError::invalid_state(
                    format!("resource \"{resource}\""),
                    "unknown backend resource",
                ))
            }
        };
        Ok(Self {
            name: resource.to_string(),
            mem_type,
            strategy,
        })
    }

    /// Change the number of elements per batch. Has no effect on serial resources.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        if let ExecutionStrategy::Batched { .. } = self.strategy {
            self.strategy = ExecutionStrategy::Batched {
                block_size: block_size.max(1),
            };
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }
}

/// Library handle bound to one backend resource.
///
/// All objects are created through a `Ceed`, which decides the preferred memory space
/// and the execution strategy of operators.
#[derive(Debug, Clone)]
pub struct Ceed {
    resource: Resource,
}

impl fmt::Display for Ceed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.resource.name)
    }
}

impl Ceed {
    /// Initialize with the given resource, e.g. `/cpu/self/ref/serial`.
    pub fn init(resource: &str) -> Result<Self> {
        Self::from_resource(Resource::parse(resource)?)
    }

    pub fn from_resource(resource: Resource) -> Result<Self> {
        debug!(
            "initialized backend {} (memory: {:?}, strategy: {:?})",
            resource.name, resource.mem_type, resource.strategy
        );
        Ok(Self { resource })
    }

    /// Initialize from the `FEOP_RESOURCE` environment variable, or `/cpu/self` if unset.
    pub fn default_init() -> Result<Self> {
        let resource = std::env::var(RESOURCE_ENV_VAR).unwrap_or_else(|_| DEFAULT_RESOURCE.to_string());
        Self::init(&resource)
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// The memory space preferred by this backend.
    pub fn preferred_mem_type(&self) -> MemType {
        self.resource.mem_type
    }

    pub(crate) fn supports(&self, mem_type: MemType) -> bool {
        match mem_type {
            MemType::Host => true,
            MemType::Device => self.resource.mem_type == MemType::Device,
        }
    }

    pub fn vector(&self, n: usize) -> Vector {
        Vector::zeros(n)
    }

    pub fn vector_from_slice(&self, values: &[f64]) -> Vector {
        Vector::from_slice(values)
    }

    pub fn context(&self) -> Context {
        Context::create(self)
    }

    /// Offset-based element restriction, see [`ElemRestriction::offsets`].
    pub fn elem_restriction(
        &self,
        num_elements: usize,
        elem_size: usize,
        num_components: usize,
        comp_stride: usize,
        lvector_size: usize,
        offsets: &[usize],
    ) -> Result<ElemRestriction> {
        ElemRestriction::offsets(num_elements, elem_size, num_components, comp_stride, lvector_size, offsets)
    }

    /// Strided element restriction, see [`ElemRestriction::strided`].
    pub fn strided_elem_restriction(
        &self,
        num_elements: usize,
        elem_size: usize,
        num_components: usize,
        lvector_size: usize,
        strides: [usize; 3],
    ) -> Result<ElemRestriction> {
        ElemRestriction::strided(num_elements, elem_size, num_components, lvector_size, strides)
    }

    /// Dense H1 basis from tabulated interpolation, gradient and weight data.
    #[allow(non_snake_case)]
    pub fn basis_H1(
        &self,
        dim: usize,
        num_components: usize,
        interp: DMatrix<f64>,
        grad: DMatrix<f64>,
        q_weights: &[f64],
    ) -> Result<Basis> {
        Basis::create_H1(dim, num_components, interp, grad, q_weights)
    }

    pub fn q_function_interior<F>(&self, vector_length: usize, f: F) -> QFunction
    where
        F: Fn(Option<&[u8]>, usize, &[&[f64]], &mut [&mut [f64]]) -> eyre::Result<()> + Send + Sync + 'static,
    {
        QFunction::create(vector_length, f)
    }

    pub fn operator<'a>(
        &self,
        qf: &QFunction,
        dqf: impl Into<QFunctionOpt<'a>>,
        dqf_transpose: impl Into<QFunctionOpt<'a>>,
    ) -> Result<Operator> {
        Operator::create(self, qf, dqf, dqf_transpose)
    }

    pub fn composite_operator(&self) -> CompositeOperator {
        CompositeOperator::create(self)
    }
}
