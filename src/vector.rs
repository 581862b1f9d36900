//! Reference-counted vectors and the field vector selector [`VectorOpt`].
use crate::ceed::MemType;
use nalgebra::DVector;
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Norm selector for [`Vector::norm`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormType {
    One,
    Two,
    Max,
}

#[derive(Debug)]
struct VectorStorage {
    values: DVector<f64>,
    mem_type: MemType,
}

/// A vector of scalars shared by reference.
///
/// Cloning a `Vector` produces another handle to the *same* storage. Operators hold such
/// handles for their passive fields, so the data stays alive as long as any holder does.
#[derive(Clone)]
pub struct Vector {
    storage: Arc<RwLock<VectorStorage>>,
}

impl fmt::Debug for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.storage.read().values.iter()).finish()
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = self.storage.read();
        writeln!(f, "Vector length {}", storage.values.len())?;
        for value in storage.values.iter() {
            writeln!(f, "    {:12.8}", value)?;
        }
        Ok(())
    }
}

impl Vector {
    pub fn zeros(n: usize) -> Self {
        Self::from(DVector::zeros(n))
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self::from(DVector::from_column_slice(values))
    }

    pub fn len(&self) -> usize {
        self.storage.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_value(&self, value: f64) {
        self.storage.write().values.fill(value);
    }

    /// Overwrite all entries.
    ///
    /// # Panics
    ///
    /// Panics if the slice length differs from the vector length.
    pub fn set_slice(&self, values: &[f64]) {
        let mut storage = self.storage.write();
        assert_eq!(storage.values.len(), values.len(), "slice length must match vector length");
        storage.values.copy_from_slice(values);
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.storage.read().values.as_slice().to_vec()
    }

    pub fn to_dvector(&self) -> DVector<f64> {
        self.storage.read().values.clone()
    }

    /// Read access to the entries.
    pub fn view(&self) -> VectorView<'_> {
        VectorView {
            guard: self.storage.read(),
        }
    }

    /// Write access to the entries.
    pub fn view_mut(&self) -> VectorViewMut<'_> {
        VectorViewMut {
            guard: self.storage.write(),
        }
    }

    pub fn norm(&self, norm_type: NormType) -> f64 {
        let storage = self.storage.read();
        let values = &storage.values;
        match norm_type {
            NormType::One => values.iter().map(|x| x.abs()).sum(),
            NormType::Two => values.norm(),
            NormType::Max => values.amax(),
        }
    }

    /// Compute `self = alpha * x + self`.
    ///
    /// # Panics
    ///
    /// Panics if the lengths differ.
    pub fn axpy(&self, alpha: f64, x: &Vector) {
        if self.same_storage(x) {
            self.scale(1.0 + alpha);
            return;
        }
        let x = x.storage.read();
        let mut storage = self.storage.write();
        assert_eq!(storage.values.len(), x.values.len(), "vector lengths must match");
        storage.values.axpy(alpha, &x.values, 1.0);
    }

    pub fn scale(&self, alpha: f64) {
        self.storage.write().values *= alpha;
    }

    /// Move the data to the given memory space.
    pub fn sync(&self, mem_type: MemType) {
        self.storage.write().mem_type = mem_type;
    }

    pub fn mem_type(&self) -> MemType {
        self.storage.read().mem_type
    }

    /// Whether two handles refer to the same storage.
    pub fn same_storage(&self, other: &Vector) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Number of live handles to this storage.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    pub(crate) fn read_values(&self) -> MappedRwLockReadGuard<'_, DVector<f64>> {
        RwLockReadGuard::map(self.storage.read(), |s| &s.values)
    }

    pub(crate) fn write_values(&self) -> MappedRwLockWriteGuard<'_, DVector<f64>> {
        RwLockWriteGuard::map(self.storage.write(), |s| &mut s.values)
    }
}

impl From<DVector<f64>> for Vector {
    fn from(values: DVector<f64>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(VectorStorage {
                values,
                mem_type: MemType::Host,
            })),
        }
    }
}

/// Read-only view of a [`Vector`].
pub struct VectorView<'a> {
    guard: RwLockReadGuard<'a, VectorStorage>,
}

impl<'a> std::ops::Deref for VectorView<'a> {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        self.guard.values.as_slice()
    }
}

/// Mutable view of a [`Vector`].
pub struct VectorViewMut<'a> {
    guard: RwLockWriteGuard<'a, VectorStorage>,
}

impl<'a> std::ops::Deref for VectorViewMut<'a> {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        self.guard.values.as_slice()
    }
}

impl<'a> std::ops::DerefMut for VectorViewMut<'a> {
    fn deref_mut(&mut self) -> &mut [f64] {
        self.guard.values.as_mut_slice()
    }
}

/// The vector used by an operator field.
#[derive(Debug, Clone, Copy)]
pub enum VectorOpt<'a> {
    /// A fixed vector bound when the field is set.
    Some(&'a Vector),
    /// The vector passed to `apply` (input or output, depending on the field).
    Active,
    /// No vector; used for fields such as quadrature weights.
    None,
}

impl<'a> From<&'a Vector> for VectorOpt<'a> {
    fn from(vec: &'a Vector) -> Self {
        Self::Some(vec)
    }
}

impl<'a> VectorOpt<'a> {
    pub fn is_some(&self) -> bool {
        matches!(self, Self::Some(_))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}
