use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque, type-erased settlement value.
///
/// The core never introspects a payload's contents (only downcasts to
/// [`Promise`](crate) during thenable adoption, which lives in
/// `qpromise-core` since `qpromise-types` has no notion of a promise).
/// Cloning a `Payload` clones the handle, not the underlying value —
/// ownership of whatever it points to follows ordinary `Arc`/`Drop` rules.
#[derive(Clone)]
pub struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn unit() -> Self {
        Self::new(())
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Arc<T>, Self> {
        self.0.downcast::<T>().map_err(Self)
    }

    pub fn is<T: Any + Send + Sync>(&self) -> bool {
        self.0.is::<T>()
    }

    /// Pointer identity of the underlying value, used for cycle detection
    /// during thenable adoption (`Arc::ptr_eq`-style comparison without
    /// exposing the concrete type).
    pub fn ptr_eq(&self, other: &Payload) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Stable identifier for this payload's underlying allocation, suitable
    /// as the `payload_id` a [`DurableBacking`](crate::DurableBacking)
    /// flushes alongside a settlement state. Two clones of the same
    /// `Payload` share an identity; two payloads built from equal values
    /// do not.
    pub fn identity(&self) -> String {
        format!("{:p}", Arc::as_ptr(&self.0))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload(..)")
    }
}
