//! Tensor Operations Backend
//!
//! This module defines the numeric capability set the layers are written
//! against, plus the default CPU implementation. Keeping the kernels behind a
//! trait means an accelerator backend can be swapped in without changing a
//! single layer: a layer asks for "matrix multiply" or "dropout mask" and does
//! not care who computes it.
//!
//! ## The Capability Set
//!
//! - Allocation (zero-filled)
//! - Matrix multiply and transpose
//! - Element-wise add / multiply (with last-dimension broadcasting for biases)
//! - `clip_low` (the ReLU kernel), row softmax, row argmax
//! - `flatten` / `unflatten`: a lossless, order-preserving round trip between
//!   a list of variable-length sequences and one flat matrix
//! - `get_dropout_mask`: inverted-dropout mask sampling
//!
//! ## Performance
//!
//! The CPU backend parallelizes the hot paths with Rayon:
//!
//! - **Matrix multiplication**: cache-blocked algorithm with parallel row
//!   processing (2-4x speedup on typical multi-core CPUs)
//! - **Element-wise operations**: parallel iteration over data
//! - **Softmax**: parallel computation per row
//!
//! Small inputs fall back to sequential code to avoid parallel overhead.
//!
//! ## Shape Discipline
//!
//! Kernels assert on malformed shapes. Layers validate their inputs *before*
//! calling into the backend and report failures as
//! [`ModelError::ShapeMismatch`](crate::ModelError), so a kernel assertion
//! firing means a bug inside this crate, not bad user data.

use crate::tensor::Tensor;
use rayon::prelude::*;

/// The numeric capability set layers are written against.
///
/// Implementations must be deterministic given the same inputs, with the
/// single exception of [`Ops::get_dropout_mask`], which samples randomness.
pub trait Ops {
    /// Allocate a zero-filled tensor of the given shape.
    fn allocate(&self, shape: Vec<usize>) -> Tensor {
        Tensor::zeros(shape)
    }

    /// Matrix multiplication of two 2-d tensors: `[m, k] @ [k, n] -> [m, n]`.
    fn matmul(&self, a: &Tensor, b: &Tensor) -> Tensor;

    /// Transpose a 2-d tensor.
    fn transpose(&self, a: &Tensor) -> Tensor;

    /// Element-wise addition. Supports `[r, n] + [n]` broadcasting so biases
    /// can be added to every row.
    fn add(&self, a: &Tensor, b: &Tensor) -> Tensor;

    /// Element-wise multiplication. Supports `[r, n] * [n]` broadcasting so a
    /// per-feature scale can be applied to every row.
    fn mul(&self, a: &Tensor, b: &Tensor) -> Tensor;

    /// Clamp every element from below: `max(value, x)`. With `value = 0.0`
    /// this is the ReLU forward kernel.
    fn clip_low(&self, a: &Tensor, value: f32) -> Tensor;

    /// Row-wise softmax of a 2-d tensor.
    fn softmax(&self, a: &Tensor) -> Tensor {
        let mut out = a.clone();
        self.softmax_inplace(&mut out);
        out
    }

    /// In-place variant of [`Ops::softmax`].
    fn softmax_inplace(&self, a: &mut Tensor);

    /// Index of the largest value in each row of a 2-d tensor.
    fn argmax(&self, a: &Tensor) -> Vec<usize>;

    /// Concatenate a list of `[len_i, d]` sequences into one `[sum(len), d]`
    /// matrix, returning the matrix and the original lengths.
    ///
    /// Together with [`Ops::unflatten`] this forms a lossless,
    /// order-preserving round trip.
    fn flatten(&self, seqs: &[Tensor]) -> (Tensor, Vec<usize>);

    /// Partition a flat matrix back into per-sequence matrices of the given
    /// row counts. Inverse of [`Ops::flatten`].
    fn unflatten(&self, flat: &Tensor, lengths: &[usize]) -> Vec<Tensor>;

    /// Sample an inverted-dropout mask.
    ///
    /// Returns `None` when `rate <= 0`, meaning "no dropout, pass activations
    /// through unchanged". Otherwise every entry is independently `0.0` with
    /// probability `rate` and `1.0 / (1.0 - rate)` otherwise, so the expected
    /// value of a masked activation equals the unmasked activation.
    fn get_dropout_mask(&self, shape: Vec<usize>, rate: f32) -> Option<Tensor>;

    /// Per-feature mean over rows of a `[r, d]` tensor, yielding `[d]`.
    fn mean_axis0(&self, a: &Tensor) -> Tensor;

    /// Per-feature population variance over rows of a `[r, d]` tensor, given
    /// the per-feature mean, yielding `[d]`.
    fn var_axis0(&self, a: &Tensor, mean: &Tensor) -> Tensor;
}

/// The default backend: plain `Vec<f32>` kernels parallelized with Rayon.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuOps;

/// Work threshold below which matmul stays sequential (avoids parallel
/// overhead for tiny matrices).
const PARALLEL_MATMUL_THRESHOLD: usize = 1_000;

/// SIMD-friendly inner loop for matrix multiplication.
/// Computes: result[j] += a_val * b[j] for all j.
/// Structured so LLVM can auto-vectorize it.
#[inline(always)]
fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
    for (r, &b_val) in result.iter_mut().zip(b.iter()) {
        *r += a_val * b_val;
    }
}

impl CpuOps {
    /// Parallel cache-blocked matrix multiplication for larger matrices.
    ///
    /// Processes data in 8x8 blocks that fit in L1 cache and distributes row
    /// blocks across CPU cores via Rayon.
    fn matmul_parallel_blocked(a: &Tensor, b: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = a.data[i * k + k_idx];
                                matmul_inner_simd(
                                    a_val,
                                    &b.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }
}

impl Ops for CpuOps {
    fn matmul(&self, a: &Tensor, b: &Tensor) -> Tensor {
        assert_eq!(a.shape.len(), 2, "matmul requires 2-d tensors");
        assert_eq!(b.shape.len(), 2, "matmul requires 2-d tensors");
        assert_eq!(
            a.shape[1], b.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            a.shape[0], a.shape[1], b.shape[0], b.shape[1]
        );

        let m = a.shape[0];
        let n = b.shape[1];
        let k = a.shape[1];

        if m * n * k >= PARALLEL_MATMUL_THRESHOLD {
            return Self::matmul_parallel_blocked(a, b, m, n, k);
        }

        // Sequential version for small matrices
        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a_val = a.data[i * k + l];
                matmul_inner_simd(a_val, &b.data[l * n..(l + 1) * n], &mut result[i * n..(i + 1) * n]);
            }
        }

        Tensor::new(result, vec![m, n])
    }

    fn transpose(&self, a: &Tensor) -> Tensor {
        assert_eq!(a.shape.len(), 2, "transpose requires a 2-d tensor");
        let rows = a.shape[0];
        let cols = a.shape[1];
        let mut result = vec![0.0; rows * cols];

        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = a.data[i * cols + j];
            }
        }

        Tensor::new(result, vec![cols, rows])
    }

    fn add(&self, a: &Tensor, b: &Tensor) -> Tensor {
        if a.shape == b.shape {
            let result = a
                .data
                .par_iter()
                .zip(&b.data)
                .map(|(x, y)| x + y)
                .collect();
            return Tensor::new(result, a.shape.clone());
        }

        // Broadcast last dimension: [r, n] + [n] (e.g., bias addition)
        if a.shape.len() > b.shape.len() {
            let last_dim = *a.shape.last().unwrap();
            if b.data.len() == last_dim {
                let result: Vec<f32> = (0..a.data.len())
                    .into_par_iter()
                    .map(|i| a.data[i] + b.data[i % last_dim])
                    .collect();
                return Tensor::new(result, a.shape.clone());
            }
        }

        panic!("Unsupported broadcast for add: {:?} + {:?}", a.shape, b.shape);
    }

    fn mul(&self, a: &Tensor, b: &Tensor) -> Tensor {
        if a.shape == b.shape {
            let result = a
                .data
                .par_iter()
                .zip(&b.data)
                .map(|(x, y)| x * y)
                .collect();
            return Tensor::new(result, a.shape.clone());
        }

        // Broadcast last dimension: [r, n] * [n] (e.g., per-feature scale)
        if a.shape.len() > b.shape.len() {
            let last_dim = *a.shape.last().unwrap();
            if b.data.len() == last_dim {
                let result: Vec<f32> = (0..a.data.len())
                    .into_par_iter()
                    .map(|i| a.data[i] * b.data[i % last_dim])
                    .collect();
                return Tensor::new(result, a.shape.clone());
            }
        }

        panic!("Unsupported broadcast for mul: {:?} * {:?}", a.shape, b.shape);
    }

    fn clip_low(&self, a: &Tensor, value: f32) -> Tensor {
        let result = a.data.par_iter().map(|&x| x.max(value)).collect();
        Tensor::new(result, a.shape.clone())
    }

    fn softmax_inplace(&self, a: &mut Tensor) {
        assert_eq!(a.shape.len(), 2, "softmax requires a 2-d tensor");
        let cols = a.shape[1];

        a.data.par_chunks_mut(cols).for_each(|row| {
            // Subtract the row max for numerical stability; the max factors
            // cancel out in the normalization.
            let max = row.iter().fold(f32::NEG_INFINITY, |m, &x| m.max(x));
            let mut sum = 0.0;
            for x in row.iter_mut() {
                *x = (*x - max).exp();
                sum += *x;
            }
            for x in row.iter_mut() {
                *x /= sum;
            }
        });
    }

    fn argmax(&self, a: &Tensor) -> Vec<usize> {
        assert_eq!(a.shape.len(), 2, "argmax requires a 2-d tensor");
        let cols = a.shape[1];
        a.data
            .par_chunks(cols)
            .map(|row| {
                let mut best = 0;
                for (j, &x) in row.iter().enumerate() {
                    if x > row[best] {
                        best = j;
                    }
                }
                best
            })
            .collect()
    }

    fn flatten(&self, seqs: &[Tensor]) -> (Tensor, Vec<usize>) {
        if seqs.is_empty() {
            return (Tensor::zeros(vec![0, 0]), Vec::new());
        }
        let cols = seqs[0].cols();
        let mut lengths = Vec::with_capacity(seqs.len());
        let mut data = Vec::new();
        for seq in seqs {
            assert_eq!(seq.cols(), cols, "flatten requires a uniform feature width");
            lengths.push(seq.rows());
            data.extend_from_slice(&seq.data);
        }
        let total: usize = lengths.iter().sum();
        (Tensor::new(data, vec![total, cols]), lengths)
    }

    fn unflatten(&self, flat: &Tensor, lengths: &[usize]) -> Vec<Tensor> {
        let cols = flat.cols();
        let total: usize = lengths.iter().sum();
        assert_eq!(flat.rows(), total, "unflatten lengths don't cover the tensor");

        let mut out = Vec::with_capacity(lengths.len());
        let mut start = 0;
        for &len in lengths {
            let end = start + len;
            let data = flat.data[start * cols..end * cols].to_vec();
            out.push(Tensor::new(data, vec![len, cols]));
            start = end;
        }
        out
    }

    fn get_dropout_mask(&self, shape: Vec<usize>, rate: f32) -> Option<Tensor> {
        if rate <= 0.0 {
            return None;
        }
        let size: usize = shape.iter().product();
        let scale = 1.0 / (1.0 - rate);
        let data = (0..size)
            .map(|_| {
                if rand::random::<f32>() < rate {
                    0.0
                } else {
                    scale
                }
            })
            .collect();
        Some(Tensor::new(data, shape))
    }

    fn mean_axis0(&self, a: &Tensor) -> Tensor {
        let rows = a.rows();
        let cols = a.cols();
        assert!(rows > 0, "mean over zero rows");

        let mut sums = vec![0.0; cols];
        for i in 0..rows {
            for (s, &x) in sums.iter_mut().zip(a.row(i)) {
                *s += x;
            }
        }
        for s in sums.iter_mut() {
            *s /= rows as f32;
        }
        Tensor::new(sums, vec![cols])
    }

    fn var_axis0(&self, a: &Tensor, mean: &Tensor) -> Tensor {
        let rows = a.rows();
        let cols = a.cols();
        assert_eq!(mean.data.len(), cols, "mean width must match tensor width");

        let mut sums = vec![0.0; cols];
        for i in 0..rows {
            for (j, &x) in a.row(i).iter().enumerate() {
                let diff = x - mean.data[j];
                sums[j] += diff * diff;
            }
        }
        for s in sums.iter_mut() {
            *s /= rows as f32;
        }
        Tensor::new(sums, vec![cols])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_identity() {
        let ops = CpuOps;
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let eye = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
        assert_eq!(ops.matmul(&a, &eye).data, a.data);
    }

    #[test]
    fn test_matmul_rectangular() {
        let ops = CpuOps;
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
        let c = ops.matmul(&a, &b);
        assert_eq!(c.shape, vec![2, 2]);
        assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn test_matmul_parallel_agrees_with_sequential() {
        let ops = CpuOps;
        // Big enough to cross the parallel threshold.
        let m = 17;
        let k = 13;
        let n = 11;
        let a = Tensor::new((0..m * k).map(|i| (i % 7) as f32 - 3.0).collect(), vec![m, k]);
        let b = Tensor::new((0..k * n).map(|i| (i % 5) as f32 - 2.0).collect(), vec![k, n]);

        let fast = ops.matmul(&a, &b);
        let mut slow = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                for l in 0..k {
                    slow[i * n + j] += a.data[i * k + l] * b.data[l * n + j];
                }
            }
        }
        for (x, y) in fast.data.iter().zip(&slow) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_transpose_roundtrip() {
        let ops = CpuOps;
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let t = ops.transpose(&a);
        assert_eq!(t.shape, vec![3, 2]);
        assert_eq!(ops.transpose(&t), a);
    }

    #[test]
    fn test_add_broadcasts_bias() {
        let ops = CpuOps;
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::new(vec![10.0, 20.0], vec![2]);
        assert_eq!(ops.add(&a, &b).data, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_clip_low_zeroes_negatives() {
        let ops = CpuOps;
        let a = Tensor::new(vec![-1.0, 0.0, 2.0, -0.5], vec![2, 2]);
        assert_eq!(ops.clip_low(&a, 0.0).data, vec![0.0, 0.0, 2.0, 0.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let ops = CpuOps;
        let a = Tensor::new(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0], vec![2, 3]);
        let y = ops.softmax(&a);
        for i in 0..2 {
            let sum: f32 = y.row(i).iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_softmax_inplace_matches() {
        let ops = CpuOps;
        let a = Tensor::new(vec![0.5, 1.5, -2.0, 0.0], vec![2, 2]);
        let y = ops.softmax(&a);
        let mut b = a.clone();
        ops.softmax_inplace(&mut b);
        assert_eq!(y, b);
    }

    #[test]
    fn test_argmax_per_row() {
        let ops = CpuOps;
        let a = Tensor::new(vec![0.1, 0.9, 0.0, 0.7, 0.2, 0.1], vec![2, 3]);
        assert_eq!(ops.argmax(&a), vec![1, 0]);
    }

    #[test]
    fn test_flatten_unflatten_roundtrip() {
        let ops = CpuOps;
        let seqs = vec![
            Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]),
            Tensor::new(vec![5.0, 6.0], vec![1, 2]),
            Tensor::new(vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0], vec![3, 2]),
        ];
        let (flat, lengths) = ops.flatten(&seqs);
        assert_eq!(flat.shape, vec![6, 2]);
        assert_eq!(lengths, vec![2, 1, 3]);

        let back = ops.unflatten(&flat, &lengths);
        assert_eq!(back, seqs);
    }

    #[test]
    fn test_dropout_mask_absent_for_zero_rate() {
        let ops = CpuOps;
        assert!(ops.get_dropout_mask(vec![2, 2], 0.0).is_none());
        assert!(ops.get_dropout_mask(vec![2, 2], -1.0).is_none());
    }

    #[test]
    fn test_dropout_mask_entries_and_shape() {
        let ops = CpuOps;
        let rate = 0.25;
        let mask = ops.get_dropout_mask(vec![8, 16], rate).unwrap();
        assert_eq!(mask.shape, vec![8, 16]);
        let scale = 1.0 / (1.0 - rate);
        for &value in &mask.data {
            assert!(
                value == 0.0 || (value - scale).abs() < 1e-6,
                "mask entry {} is neither 0 nor {}",
                value,
                scale
            );
        }
    }

    #[test]
    fn test_column_statistics() {
        let ops = CpuOps;
        let a = Tensor::new(vec![1.0, 10.0, 3.0, 20.0], vec![2, 2]);
        let mean = ops.mean_axis0(&a);
        assert_eq!(mean.data, vec![2.0, 15.0]);
        let var = ops.var_axis0(&a, &mean);
        assert_eq!(var.data, vec![1.0, 25.0]);
    }
}
