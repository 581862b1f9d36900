//! Execution strategies for the element loop of an operator.
//!
//! Both strategies return per-element results in element order, so that the subsequent
//! scatter-add into global vectors happens in the same order regardless of strategy.
//! Serial and batched execution therefore produce bitwise identical results.
use crate::ceed::ExecutionStrategy;
use crate::error::Result;
use parking_lot::Mutex;
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use std::cell::RefCell;
use std::fmt;
use thread_local::ThreadLocal;

/// Scratch buffers reused between elements.
#[derive(Debug, Default)]
pub(crate) struct ElementWorkspace {
    /// Quadrature values of every input field.
    pub qin: Vec<Vec<f64>>,
    /// Quadrature values of every output field.
    pub qout: Vec<Vec<f64>>,
    /// Node values of a unit vector, used for linear assembly.
    pub unit: Vec<f64>,
}

pub(crate) trait ElementExecutor {
    /// Evaluate `element_fn` for every element in `0 .. num_elements`, returning the results
    /// in element order. Stops at the first error.
    fn run<R, F>(&self, num_elements: usize, element_fn: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(usize, &mut ElementWorkspace) -> Result<R> + Sync;
}

/// Process elements one after another on the calling thread.
#[derive(Default)]
pub(crate) struct SerialExecutor {
    workspace: Mutex<ElementWorkspace>,
}

impl ElementExecutor for SerialExecutor {
    fn run<R, F>(&self, num_elements: usize, element_fn: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(usize, &mut ElementWorkspace) -> Result<R> + Sync,
    {
        let ws = &mut *self.workspace.lock();
        (0..num_elements).map(|e| element_fn(e, ws)).collect()
    }
}

/// Process blocks of elements in parallel on the rayon thread pool.
pub(crate) struct BatchedExecutor {
    block_size: usize,
    workspace: ThreadLocal<RefCell<ElementWorkspace>>,
}

impl BatchedExecutor {
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            workspace: ThreadLocal::new(),
        }
    }
}

impl ElementExecutor for BatchedExecutor {
    fn run<R, F>(&self, num_elements: usize, element_fn: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(usize, &mut ElementWorkspace) -> Result<R> + Sync,
    {
        (0..num_elements)
            .into_par_iter()
            .with_min_len(self.block_size)
            .map(|e| {
                let ws = &mut *self.workspace.get_or_default().borrow_mut();
                element_fn(e, ws)
            })
            .collect()
    }
}

/// The executor chosen for an operator when it is created.
pub(crate) enum Executor {
    Serial(SerialExecutor),
    Batched(BatchedExecutor),
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executor::Serial(_) => write!(f, "Serial"),
            Executor::Batched(batched) => write!(f, "Batched {{ block_size: {} }}", batched.block_size),
        }
    }
}

impl Executor {
    pub fn from_strategy(strategy: ExecutionStrategy) -> Self {
        match strategy {
            ExecutionStrategy::Serial => Executor::Serial(SerialExecutor::default()),
            ExecutionStrategy::Batched { block_size } => Executor::Batched(BatchedExecutor::with_block_size(block_size)),
        }
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        match self {
            Executor::Serial(_) => ExecutionStrategy::Serial,
            Executor::Batched(batched) => ExecutionStrategy::Batched {
                block_size: batched.block_size,
            },
        }
    }
}

impl ElementExecutor for Executor {
    fn run<R, F>(&self, num_elements: usize, element_fn: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(usize, &mut ElementWorkspace) -> Result<R> + Sync,
    {
        match self {
            Executor::Serial(serial) => serial.run(num_elements, element_fn),
            Executor::Batched(batched) => batched.run(num_elements, element_fn),
        }
    }
}
