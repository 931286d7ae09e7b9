//! Tensor Storage for Neural Networks
//!
//! This module provides the dense array type that flows between layers.
//! Tensors store multi-dimensional data with shape and stride information for
//! efficient indexing and memory layout. All numeric kernels (matrix multiply,
//! softmax, and friends) live behind the [`Ops`](crate::ops::Ops) capability
//! trait so they can be swapped without touching the storage type.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[positions, features]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! ## Example
//!
//! ```rust
//! use viola::Tensor;
//!
//! // Create a 2x3 matrix
//! let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
//! let tensor = Tensor::new(data, vec![2, 3]);
//! assert_eq!(tensor.rows(), 2);
//! assert_eq!(tensor.cols(), 3);
//! ```

/// A multi-dimensional array for neural network computations
///
/// Tensors store data in a contiguous `Vec<f32>` with shape and stride
/// information. All operations use row-major (C-style) memory layout.
///
/// # Memory Layout
///
/// For shape `[2, 3]`, data is stored as:
/// `[row0_col0, row0_col1, row0_col2, row1_col0, row1_col1, row1_col2]`
///
/// Strides would be `[3, 1]` meaning:
/// - Moving one step in dimension 0 (rows) advances 3 positions in data
/// - Moving one step in dimension 1 (cols) advances 1 position in data
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length.
    /// This is a programming error in the caller, not a data-dependent
    /// condition, so it is not reported through [`ModelError`](crate::ModelError).
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros
    ///
    /// # Example
    ///
    /// ```rust
    /// # use viola::Tensor;
    /// let tensor = Tensor::zeros(vec![3, 4]);
    /// assert_eq!(tensor.data.len(), 12);
    /// assert!(tensor.data.iter().all(|&x| x == 0.0));
    /// ```
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        let data = vec![0.0; size];
        Self::new(data, shape)
    }

    /// The zero-element tensor, used as the "no gradient" sentinel for layers
    /// whose input is discrete (embedding lookups have no input gradient).
    pub fn empty() -> Self {
        Self::zeros(vec![0])
    }

    /// True when the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Compute strides from shape (row-major layout)
    ///
    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of rows of a matrix (first dimension).
    ///
    /// # Panics
    ///
    /// Panics if the tensor is not 2-dimensional.
    pub fn rows(&self) -> usize {
        assert_eq!(self.shape.len(), 2, "rows() requires a 2-d tensor");
        self.shape[0]
    }

    /// Number of columns of a matrix (second dimension).
    ///
    /// # Panics
    ///
    /// Panics if the tensor is not 2-dimensional.
    pub fn cols(&self) -> usize {
        assert_eq!(self.shape.len(), 2, "cols() requires a 2-d tensor");
        self.shape[1]
    }

    /// Borrow one row of a matrix as a slice.
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Borrow one row of a matrix mutably.
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let cols = self.cols();
        &mut self.data[i * cols..(i + 1) * cols]
    }

    /// Reshape to a new shape with the same number of elements.
    ///
    /// # Panics
    ///
    /// Panics on element count mismatch.
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape: element count mismatch"
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Render the shape for error messages, e.g. `[128, 32]`.
    pub fn shape_str(&self) -> String {
        format!("{:?}", self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides_row_major() {
        let t = Tensor::zeros(vec![2, 3, 4]);
        assert_eq!(t.strides, vec![12, 4, 1]);
    }

    #[test]
    fn test_row_access() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        assert_eq!(t.row(0), &[1.0, 2.0, 3.0]);
        assert_eq!(t.row(1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_empty_sentinel() {
        let t = Tensor::empty();
        assert!(t.is_empty());
        assert_eq!(t.shape, vec![0]);
    }

    #[test]
    #[should_panic]
    fn test_new_rejects_bad_shape() {
        Tensor::new(vec![1.0, 2.0, 3.0], vec![2, 2]);
    }
}
