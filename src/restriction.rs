//! Element restrictions: maps between global (L-)vectors and element-local (E-)vectors.
//!
//! An E-vector stores, for every element, the values of every component at every element
//! node. The layout is `[element][component][node]`, i.e. the entry for element `e`,
//! component `c` and local node `i` lives at `(e * num_components + c) * elem_size + i`.
use crate::error::{OperatorError, Result};
use crate::vector::Vector;
use crate::TransposeMode;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Layout {
    /// L-index of `(e, c, i)` is `offsets[e * elem_size + i] + c * comp_stride`.
    Offsets { offsets: Vec<usize>, comp_stride: usize },
    /// L-index of `(e, c, i)` is `i * strides[0] + c * strides[1] + e * strides[2]`.
    Strided { strides: [usize; 3] },
}

#[derive(Debug, PartialEq, Eq)]
struct RestrictionData {
    num_elements: usize,
    elem_size: usize,
    num_components: usize,
    lvector_size: usize,
    layout: Layout,
}

/// A shared, immutable element restriction.
///
/// Cloning yields another handle to the same restriction.
#[derive(Debug, Clone)]
pub struct ElemRestriction {
    data: Arc<RestrictionData>,
}

impl fmt::Display for ElemRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.data.layout {
            Layout::Offsets { .. } => "offset",
            Layout::Strided { .. } => "strided",
        };
        write!(
            f,
            "{} ElemRestriction from ({}, {}) to {} elements with {} nodes each",
            kind,
            self.lvector_size(),
            self.num_components(),
            self.num_elements(),
            self.elem_size()
        )
    }
}

impl ElemRestriction {
    /// Restriction defined by explicit node offsets.
    ///
    /// `offsets` holds `elem_size` entries per element. Component `c` of the node at offset
    /// `o` is found at L-index `o + c * comp_stride`.
    pub fn offsets(
        num_elements: usize,
        elem_size: usize,
        num_components: usize,
        comp_stride: usize,
        lvector_size: usize,
        offsets: &[usize],
    ) -> Result<Self> {
        let entity = "offset ElemRestriction";
        if num_components == 0 || elem_size == 0 {
            return Err(OperatorError::incompatible_shape(
                entity,
                "element size and number of components must be positive",
            ));
        }
        if offsets.len() != num_elements * elem_size {
            return Err(OperatorError::incompatible_shape(
                entity,
                format!(
                    "expected {} offsets for {} elements of size {}, got {}",
                    num_elements * elem_size,
                    num_elements,
                    elem_size,
                    offsets.len()
                ),
            ));
        }
        let max_component_offset = (num_components - 1) * comp_stride;
        if let Some(&max_offset) = offsets.iter().max() {
            if max_offset + max_component_offset >= lvector_size {
                return Err(OperatorError::incompatible_shape(
                    entity,
                    format!("offset {max_offset} exceeds L-vector size {lvector_size}"),
                ));
            }
        }
        Ok(Self::from_data(RestrictionData {
            num_elements,
            elem_size,
            num_components,
            lvector_size,
            layout: Layout::Offsets {
                offsets: offsets.to_vec(),
                comp_stride,
            },
        }))
    }

    /// Restriction defined by strides `[node, component, element]`.
    pub fn strided(
        num_elements: usize,
        elem_size: usize,
        num_components: usize,
        lvector_size: usize,
        strides: [usize; 3],
    ) -> Result<Self> {
        let entity = "strided ElemRestriction";
        if num_components == 0 || elem_size == 0 {
            return Err(OperatorError::incompatible_shape(
                entity,
                "element size and number of components must be positive",
            ));
        }
        if num_elements > 0 {
            let max_index =
                (elem_size - 1) * strides[0] + (num_components - 1) * strides[1] + (num_elements - 1) * strides[2];
            if max_index >= lvector_size {
                return Err(OperatorError::incompatible_shape(
                    entity,
                    format!("strided index {max_index} exceeds L-vector size {lvector_size}"),
                ));
            }
        }
        Ok(Self::from_data(RestrictionData {
            num_elements,
            elem_size,
            num_components,
            lvector_size,
            layout: Layout::Strided { strides },
        }))
    }

    fn from_data(data: RestrictionData) -> Self {
        Self { data: Arc::new(data) }
    }

    pub fn num_elements(&self) -> usize {
        self.data.num_elements
    }

    pub fn elem_size(&self) -> usize {
        self.data.elem_size
    }

    pub fn num_components(&self) -> usize {
        self.data.num_components
    }

    pub fn lvector_size(&self) -> usize {
        self.data.lvector_size
    }

    pub fn evector_size(&self) -> usize {
        self.data.num_elements * self.data.num_components * self.data.elem_size
    }

    /// Number of values one element occupies in the E-vector.
    pub fn element_block_size(&self) -> usize {
        self.data.num_components * self.data.elem_size
    }

    /// Number of distinct nodes addressed by the L-vector.
    pub fn num_nodes(&self) -> usize {
        self.data.lvector_size / self.data.num_components
    }

    /// Component stride in the L-vector, if it is uniform.
    pub fn comp_stride(&self) -> usize {
        match &self.data.layout {
            Layout::Offsets { comp_stride, .. } => *comp_stride,
            Layout::Strided { strides } => strides[1],
        }
    }

    pub fn create_lvector(&self) -> Vector {
        Vector::zeros(self.lvector_size())
    }

    pub fn create_evector(&self) -> Vector {
        Vector::zeros(self.evector_size())
    }

    /// Whether two handles refer to the same restriction.
    pub fn same_restriction(&self, other: &ElemRestriction) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Whether two restrictions describe the same mapping, possibly through distinct handles.
    pub fn equivalent(&self, other: &ElemRestriction) -> bool {
        self.same_restriction(other) || self.data == other.data
    }

    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// The L-index of component `comp` at local node `node` of `element`.
    pub fn lindex(&self, element: usize, comp: usize, node: usize) -> usize {
        let elem_size = self.data.elem_size;
        match &self.data.layout {
            Layout::Offsets { offsets, comp_stride } => offsets[element * elem_size + node] + comp * comp_stride,
            Layout::Strided { strides } => node * strides[0] + comp * strides[1] + element * strides[2],
        }
    }

    /// The global node index of local node `node` of `element`, i.e. the L-index of its
    /// first component.
    pub fn node_index(&self, element: usize, node: usize) -> usize {
        self.lindex(element, 0, node)
    }

    /// Gather the values of a single element from `u` (an L-vector slice) into `element_values`
    /// (laid out `[component][node]`).
    pub fn gather_element(&self, element: usize, u: &[f64], element_values: &mut [f64]) {
        let elem_size = self.data.elem_size;
        debug_assert_eq!(element_values.len(), self.element_block_size());
        for c in 0..self.data.num_components {
            for i in 0..elem_size {
                element_values[c * elem_size + i] = u[self.lindex(element, c, i)];
            }
        }
    }

    /// Add the values of a single element (laid out `[component][node]`) into `v`.
    ///
    /// Contributions to nodes shared between elements are summed.
    pub fn scatter_add_element(&self, element: usize, element_values: &[f64], v: &mut [f64]) {
        let elem_size = self.data.elem_size;
        debug_assert_eq!(element_values.len(), self.element_block_size());
        for c in 0..self.data.num_components {
            for i in 0..elem_size {
                v[self.lindex(element, c, i)] += element_values[c * elem_size + i];
            }
        }
    }

    /// Restrict `u` to `v`.
    ///
    /// With [`TransposeMode::NoTranspose`], `u` is an L-vector and `v` is overwritten with the
    /// E-vector. With [`TransposeMode::Transpose`], `u` is an E-vector whose element
    /// contributions are *added* into the L-vector `v`.
    pub fn apply(&self, transpose: TransposeMode, u: &Vector, v: &Vector) -> Result<()> {
        let (expected_u, expected_v) = match transpose {
            TransposeMode::NoTranspose => (self.lvector_size(), self.evector_size()),
            TransposeMode::Transpose => (self.evector_size(), self.lvector_size()),
        };
        if u.len() != expected_u || v.len() != expected_v {
            return Err(OperatorError::incompatible_shape(
                "ElemRestriction",
                format!(
                    "expected input/output lengths ({expected_u}, {expected_v}), got ({}, {})",
                    u.len(),
                    v.len()
                ),
            ));
        }
        if u.same_storage(v) {
            return Err(OperatorError::AliasingError {
                entity: "ElemRestriction".to_string(),
            });
        }

        let u_values = u.read_values();
        let mut v_values = v.write_values();
        let block = self.element_block_size();
        for e in 0..self.num_elements() {
            let range = e * block..(e + 1) * block;
            match transpose {
                TransposeMode::NoTranspose => {
                    self.gather_element(e, u_values.as_slice(), &mut v_values.as_mut_slice()[range])
                }
                TransposeMode::Transpose => {
                    self.scatter_add_element(e, &u_values.as_slice()[range], v_values.as_mut_slice())
                }
            }
        }
        Ok(())
    }
}

/// The restriction used by an operator field.
#[derive(Debug, Clone, Copy)]
pub enum ElemRestrictionOpt<'a> {
    Some(&'a ElemRestriction),
    /// No restriction; only valid for quadrature weight fields.
    None,
}

impl<'a> From<&'a ElemRestriction> for ElemRestrictionOpt<'a> {
    fn from(restriction: &'a ElemRestriction) -> Self {
        Self::Some(restriction)
    }
}

impl<'a> ElemRestrictionOpt<'a> {
    pub fn is_some(&self) -> bool {
        matches!(self, Self::Some(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}
