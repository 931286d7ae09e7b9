//! Windowed Feature Extraction
//!
//! Concatenates each position's feature vector with the vectors of its `n`
//! neighbors on each side, turning a `[positions, d]` input into a
//! `[positions, (2n+1) * d]` output. This is how a tagger sees context: the
//! layer after the window receives "the word and its surroundings" as one
//! flat feature vector.
//!
//! ## Sequence Boundaries
//!
//! Windows are computed inside each sequence independently and never cross a
//! boundary. A neighbor slot that would fall before the start or past the end
//! of the sequence is zero-filled, so the first word of one sentence never
//! sees the last word of the previous one.
//!
//! ## Backward Pass
//!
//! Forward copies each position into up to `2n+1` windows, so the backward
//! pass scatters the concatenated gradient back and *sums* the contributions
//! where windows overlap. There are no parameters; the layer is a pure
//! (re)arrangement.

use crate::error::Result;
use crate::layers::{check_grad_shape, Batch, Context, Layer};
use crate::optimizer::Sgd;
use crate::tensor::Tensor;

/// Context-window concatenation with radius `n`.
pub struct ExtractWindow {
    name: String,
    window: usize,
}

struct WindowContext {
    lengths: Vec<usize>,
    width: usize,
    nr_position: usize,
}

impl ExtractWindow {
    /// Create a window layer taking `window` neighbors on each side.
    pub fn new(window: usize) -> Self {
        Self {
            name: "window".to_string(),
            window,
        }
    }

    /// Rename the layer.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Forward rearrangement shared by training and inference.
    fn expand(&self, data: &Tensor, lengths: &[usize]) -> Tensor {
        let n = self.window;
        let width = data.cols();
        let nr_position = data.rows();
        let out_width = (2 * n + 1) * width;
        let mut out = Tensor::zeros(vec![nr_position, out_width]);

        let mut start = 0;
        for &len in lengths {
            for i in 0..len {
                let target = out.row_mut(start + i);
                for slot in 0..(2 * n + 1) {
                    // Neighbor offset for this slot, from -n to +n.
                    let j = i as isize + slot as isize - n as isize;
                    if j < 0 || j >= len as isize {
                        continue;
                    }
                    let source = start + j as usize;
                    target[slot * width..(slot + 1) * width]
                        .copy_from_slice(&data.data[source * width..(source + 1) * width]);
                }
            }
            start += len;
        }
        out
    }

    /// Backward scatter: sum each window slot's gradient back into the
    /// position that supplied it.
    fn collapse(&self, grad: &Tensor, lengths: &[usize], width: usize) -> Tensor {
        let n = self.window;
        let nr_position: usize = lengths.iter().sum();
        let mut out = Tensor::zeros(vec![nr_position, width]);

        let mut start = 0;
        for &len in lengths {
            for i in 0..len {
                let source = grad.row(start + i);
                for slot in 0..(2 * n + 1) {
                    let j = i as isize + slot as isize - n as isize;
                    if j < 0 || j >= len as isize {
                        continue;
                    }
                    let target = start + j as usize;
                    for (k, &g) in source[slot * width..(slot + 1) * width].iter().enumerate() {
                        out.data[target * width + k] += g;
                    }
                }
            }
            start += len;
        }
        out
    }
}

impl Layer for ExtractWindow {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin_update(&mut self, x: &Batch, _dropout: f32) -> Result<(Batch, Context)> {
        let (data, lengths) = x.as_dense(&self.name)?;
        let lengths = lengths.to_vec();
        let out = self.expand(data, &lengths);
        let ctx = Context::new(
            "window",
            WindowContext {
                lengths: lengths.clone(),
                width: data.cols(),
                nr_position: data.rows(),
            },
        );
        Ok((Batch::dense_with_lengths(out, lengths), ctx))
    }

    fn backward(&mut self, ctx: Context, grad: &Tensor, _optimizer: &mut Sgd) -> Result<Tensor> {
        let cache: WindowContext = ctx.take("window", &self.name)?;
        let out_width = (2 * self.window + 1) * cache.width;
        check_grad_shape(&self.name, grad, cache.nr_position, out_width)?;
        Ok(self.collapse(grad, &cache.lengths, cache.width))
    }

    fn predict(&self, x: &Batch) -> Result<Batch> {
        let (data, lengths) = x.as_dense(&self.name)?;
        Ok(Batch::dense_with_lengths(
            self.expand(data, lengths),
            lengths.to_vec(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One sequence of three positions with 1-d features [1, 2, 3].
    fn simple_input() -> Batch {
        Batch::dense_with_lengths(Tensor::new(vec![1.0, 2.0, 3.0], vec![3, 1]), vec![3])
    }

    #[test]
    fn test_window_concatenates_neighbors() {
        let layer = ExtractWindow::new(1);
        let out = layer.predict(&simple_input()).unwrap();
        let (out, _) = out.as_dense("test").unwrap();
        assert_eq!(out.shape, vec![3, 3]);
        // Each row is [left, self, right], zero-padded at the edges.
        assert_eq!(out.row(0), &[0.0, 1.0, 2.0]);
        assert_eq!(out.row(1), &[1.0, 2.0, 3.0]);
        assert_eq!(out.row(2), &[2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_windows_never_cross_sequence_boundaries() {
        let layer = ExtractWindow::new(1);
        // Two sequences: [1, 2] and [3].
        let x = Batch::dense_with_lengths(Tensor::new(vec![1.0, 2.0, 3.0], vec![3, 1]), vec![2, 1]);
        let out = layer.predict(&x).unwrap();
        let (out, _) = out.as_dense("test").unwrap();
        // Position 1 is the end of its sequence: no right neighbor even
        // though position 2 exists in the flat layout.
        assert_eq!(out.row(1), &[1.0, 2.0, 0.0]);
        // Position 2 starts a fresh sequence: no left neighbor.
        assert_eq!(out.row(2), &[0.0, 3.0, 0.0]);
    }

    #[test]
    fn test_backward_sums_overlapping_windows() {
        let mut layer = ExtractWindow::new(1);
        let mut sgd = Sgd::new(1.0);
        let (_, ctx) = layer.begin_update(&simple_input(), 0.0).unwrap();

        // Uniform gradient of 1 over every slot.
        let grad = Tensor::new(vec![1.0; 9], vec![3, 3]);
        let d_x = layer.backward(ctx, &grad, &mut sgd).unwrap();

        // The middle position appears in all three windows; the edges in two.
        assert_eq!(d_x.data, vec![2.0, 3.0, 2.0]);
    }

    #[test]
    fn test_forward_backward_shapes_with_wider_features() {
        let mut layer = ExtractWindow::new(2);
        let mut sgd = Sgd::new(1.0);
        let x = Batch::dense_with_lengths(Tensor::zeros(vec![5, 4]), vec![3, 2]);
        let (out, ctx) = layer.begin_update(&x, 0.0).unwrap();
        let (out, _) = out.as_dense("test").unwrap();
        assert_eq!(out.shape, vec![5, 20]);

        let grad = Tensor::zeros(vec![5, 20]);
        let d_x = layer.backward(ctx, &grad, &mut sgd).unwrap();
        assert_eq!(d_x.shape, vec![5, 4]);
    }
}
