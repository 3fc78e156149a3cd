use derive_more::{Deref, From};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Immutable, cheaply clonable buffer.
///
/// Sealed part payloads are held as `ArcVec<u8>` so an upload retry clones
/// the handle instead of the bytes.
#[derive(From, Clone, Ord, PartialOrd, Eq, PartialEq, Deref)]
pub struct ArcVec<T> {
    inner: Arc<Vec<T>>,
}

impl<T> ArcVec<T> {
    pub fn new<V: Into<Vec<T>>>(value: V) -> Self {
        Self {
            inner: Arc::new(value.into()),
        }
    }
}

impl<T> Default for ArcVec<T> {
    fn default() -> Self {
        Vec::default().into()
    }
}

impl<T> Debug for ArcVec<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArcVec(len={})", self.inner.len())
    }
}

impl<T> From<Vec<T>> for ArcVec<T> {
    fn from(value: Vec<T>) -> Self {
        Self::new(value)
    }
}

impl<T: Clone> From<&[T]> for ArcVec<T> {
    fn from(value: &[T]) -> Self {
        Self::new(value.to_vec())
    }
}

impl<T> AsRef<[T]> for ArcVec<T> {
    fn as_ref(&self) -> &[T] {
        self.inner.as_slice()
    }
}
