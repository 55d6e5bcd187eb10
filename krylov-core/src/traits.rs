use bytemuck::{Pod, Zeroable};
use num_traits::{Float, NumCast};
use std::fmt::Debug;

/// Floating point element type usable by every backend.
///
/// The host backend is generic over this trait; the GPU backend stores `f32`.
pub trait Scalar: Float + Pod + Zeroable + Default + Debug + Send + Sync + 'static {
    /// Converts an `f64` constant into this scalar type.
    fn from_f64(value: f64) -> Self {
        <Self as NumCast>::from(value).unwrap_or_else(Self::nan)
    }

    /// Widens the value to `f64` (used for tolerances and reported errors).
    fn as_f64(self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }
}

impl Scalar for f32 {}
impl Scalar for f64 {}

/// Generic trait representing a matrix.
/// Implementations can be sparse or GPU-resident.
pub trait Matrix: Debug {
    /// The underlying numeric type of the matrix elements.
    type Value: Copy + Debug + Default + Pod + Zeroable;

    /// Returns the dimensions of the matrix as (rows, columns).
    fn dims(&self) -> (usize, usize);

    /// Number of stored entries.
    fn nnz(&self) -> usize;

    fn rows(&self) -> usize {
        self.dims().0
    }

    fn cols(&self) -> usize {
        self.dims().1
    }

    fn is_square(&self) -> bool {
        let (rows, cols) = self.dims();
        rows == cols
    }
}

/// Generic trait representing a vector.
/// Implementations can be CPU-based or GPU-based.
pub trait Vector: Debug {
    /// The underlying numeric type of the vector elements.
    type Value: Copy + Debug + Default + Pod + Zeroable;

    /// Returns the number of elements in the vector.
    fn len(&self) -> usize;

    /// Checks if the vector is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Scalar> Vector for Vec<T> {
    type Value = T;

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}
