use thiserror::Error;

/// Opaque data moved between nodes.
///
/// The engine hands a node's output to every successor. With more than one
/// successor it needs one independent value per successor, so it asks the
/// payload for explicit copies. A copy must fully duplicate every resource a
/// consumer may mutate or release; it may fail (for example when a device
/// allocation cannot be made), in which case the run fails with
/// `PayloadCopyFailed` and no successor receives a partial copy.
pub trait Payload: Send + 'static {
    /// Produce an independent, value-equal copy of `self`.
    ///
    /// # Errors
    /// If a resource backing the payload cannot be duplicated.
    fn try_copy(&self) -> Result<Self, PayloadCopyError>
    where
        Self: Sized;
}

/// Reason a payload copy could not be made.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("payload copy failed: {reason}")]
pub struct PayloadCopyError {
    reason: String,
}

impl PayloadCopyError {
    /// Construct an error with a human readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason given at construction.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

macro_rules! impl_payload_by_clone {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Payload for $ty {
                #[inline]
                fn try_copy(&self) -> Result<Self, PayloadCopyError> {
                    Ok(self.clone())
                }
            }
        )*
    };
}

impl_payload_by_clone!(
    (), bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64,
    String,
);

impl<T: Clone + Send + 'static> Payload for Vec<T> {
    fn try_copy(&self) -> Result<Self, PayloadCopyError> {
        Ok(self.clone())
    }
}

impl<T: Clone + Send + 'static> Payload for Box<[T]> {
    fn try_copy(&self) -> Result<Self, PayloadCopyError> {
        Ok(self.clone())
    }
}

impl<T: Payload> Payload for Option<T> {
    fn try_copy(&self) -> Result<Self, PayloadCopyError> {
        self.as_ref().map(T::try_copy).transpose()
    }
}

impl<A: Payload, B: Payload> Payload for (A, B) {
    fn try_copy(&self) -> Result<Self, PayloadCopyError> {
        Ok((self.0.try_copy()?, self.1.try_copy()?))
    }
}
