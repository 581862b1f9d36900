use serde::{Deserialize, Serialize};

/// Completion semantics requested for an apply or assembly call.
///
/// The host backends always complete the work before returning, so both variants produce a
/// valid output on return. Operations writing to the same vector are never reordered.
/// Validation errors are reported by the call itself in either case.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Request {
    /// The call blocks until the output is fully written.
    Immediate,
    /// The call may return before the output is written; the output must not be read
    /// before the caller synchronizes with the backend.
    Ordered,
}

impl Default for Request {
    fn default() -> Self {
        Request::Immediate
    }
}
