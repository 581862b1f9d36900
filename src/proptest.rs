//! Strategies for property-based testing with `proptest`.
use crate::restriction::ElemRestriction;
use crate::vector::Vector;
use ::proptest::collection::vec;
use ::proptest::prelude::*;

/// Upper bounds for randomly generated offset restrictions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RestrictionParams {
    pub max_elements: usize,
    pub max_elem_size: usize,
    pub max_components: usize,
}

impl Default for RestrictionParams {
    fn default() -> Self {
        Self {
            max_elements: 8,
            max_elem_size: 4,
            max_components: 3,
        }
    }
}

/// Offset restrictions with blocked components (`comp_stride` equal to the number of nodes)
/// and arbitrary, possibly shared, node offsets.
pub fn offset_restriction(params: RestrictionParams) -> impl Strategy<Value = ElemRestriction> {
    let elements = 1..=params.max_elements.max(1);
    let elem_size = 1..=params.max_elem_size.max(1);
    let components = 1..=params.max_components.max(1);
    (elements, elem_size, components)
        .prop_flat_map(|(num_elements, elem_size, num_components)| {
            let max_nodes = num_elements * elem_size;
            (1..=max_nodes).prop_flat_map(move |num_nodes| {
                let offsets = vec(0..num_nodes, num_elements * elem_size);
                (Just((num_elements, elem_size, num_components, num_nodes)), offsets)
            })
        })
        .prop_filter_map(
            "offsets must form a valid restriction",
            |((num_elements, elem_size, num_components, num_nodes), offsets)| {
                ElemRestriction::offsets(
                    num_elements,
                    elem_size,
                    num_components,
                    num_nodes,
                    num_nodes * num_components,
                    &offsets,
                )
                .ok()
            },
        )
}

impl Arbitrary for ElemRestriction {
    type Parameters = RestrictionParams;
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(params: Self::Parameters) -> Self::Strategy {
        offset_restriction(params).boxed()
    }
}

/// Vectors of length `n` with moderately sized entries.
pub fn vector(n: usize) -> impl Strategy<Value = Vector> {
    vec(-10.0..10.0, n).prop_map(|values| Vector::from_slice(&values))
}
