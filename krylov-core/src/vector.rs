use crate::context::GpuContext;
use crate::error::KrylovError;
use crate::traits::{Scalar, Vector};
use std::{mem, sync::Arc};

/// Non-owning strided view into a host buffer.
///
/// Element `i` of the view is `data[start + i * stride]`. Construction
/// enforces `size <= (data.len() - start) / stride` (rounded up so that the
/// last addressed element is inside the buffer).
#[derive(Debug, Clone, Copy)]
pub struct VectorView<'a, T> {
    data: &'a [T],
    start: usize,
    stride: usize,
    size: usize,
}

impl<'a, T: Scalar> VectorView<'a, T> {
    pub fn new(data: &'a [T], start: usize, stride: usize, size: usize) -> Result<Self, KrylovError> {
        if stride == 0 {
            return Err(KrylovError::InvalidDimensions(
                "Vector view stride must be at least 1".to_string(),
            ));
        }
        if size > 0 {
            let last = start + (size - 1) * stride;
            if last >= data.len() {
                return Err(KrylovError::InvalidDimensions(format!(
                    "Vector view (start {}, stride {}, size {}) exceeds buffer length {}",
                    start,
                    stride,
                    size,
                    data.len()
                )));
            }
        }
        Ok(Self {
            data,
            start,
            stride,
            size,
        })
    }

    /// View over the whole slice.
    pub fn contiguous(data: &'a [T]) -> Self {
        Self {
            data,
            start: 0,
            stride: 1,
            size: data.len(),
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, index: usize) -> Option<T> {
        (index < self.size).then(|| self.data[self.start + index * self.stride])
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.size).map(move |i| self.data[self.start + i * self.stride])
    }

    /// Gathers the viewed elements into a contiguous vector.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }
}

impl<T: Scalar> Vector for VectorView<'_, T> {
    type Value = T;

    fn len(&self) -> usize {
        self.size
    }
}

/// A wrapper around a `wgpu::Buffer` holding `f32` vector data on the GPU.
#[derive(Debug)]
pub struct GpuVector {
    buffer: wgpu::Buffer,
    size: usize,
    size_bytes: u64,
    label: String,
    pub(crate) context: Arc<GpuContext>,
}

impl GpuVector {
    /// Internal constructor used by GpuDevice.
    pub(crate) fn new_internal(
        buffer: wgpu::Buffer,
        size: usize,
        label: String,
        context: Arc<GpuContext>,
    ) -> Self {
        let size_bytes = (size * mem::size_of::<f32>()) as u64;
        Self {
            buffer,
            size,
            size_bytes,
            label,
            context,
        }
    }

    /// Returns the underlying `wgpu::Buffer`.
    pub(crate) fn inner(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Returns the number of elements the vector holds.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the size of the vector's buffer in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn label(&self) -> &str {
        self.label.as_str()
    }

    /// Returns a `BindingResource` for the entire buffer.
    pub fn as_entire_binding(&self) -> wgpu::BindingResource {
        self.buffer.as_entire_binding()
    }

    /// Reads the vector's contents back to the CPU.
    /// Note: This is an async operation and involves GPU-CPU synchronization.
    pub async fn read_contents(&self) -> Result<Vec<f32>, KrylovError> {
        self.context.read_buffer_range(self.inner(), 0, self.size).await
    }

    /// Writes data from a CPU slice into this GPU vector.
    pub async fn write_contents(&self, data: &[f32]) -> Result<(), KrylovError> {
        if data.len() != self.size {
            return Err(KrylovError::InvalidDimensions(format!(
                "Data length ({}) does not match GpuVector '{}' size ({})",
                data.len(),
                self.label,
                self.size
            )));
        }
        self.context.write_buffer(self.inner(), 0, data).await
    }

    /// Copies `len` elements from `source[source_start..]` into `self[start..]`.
    pub async fn copy_range_from(
        &mut self,
        start: usize,
        source: &GpuVector,
        source_start: usize,
        len: usize,
    ) -> Result<(), KrylovError> {
        if source_start + len > source.size || start + len > self.size {
            return Err(KrylovError::InvalidDimensions(format!(
                "Range copy of {} elements out of bounds ('{}'[{}..] -> '{}'[{}..])",
                len, source.label, source_start, self.label, start
            )));
        }
        if len == 0 {
            return Ok(());
        }
        let word = mem::size_of::<f32>() as u64;
        self.context
            .submit_scoped("copy_range", |encoder| {
                encoder.copy_buffer_to_buffer(
                    source.inner(),
                    source_start as u64 * word,
                    self.inner(),
                    start as u64 * word,
                    len as u64 * word,
                );
            })
            .await
    }

    /// Copies the full content of `source` into this vector.
    pub async fn clone_from(&mut self, source: &GpuVector) -> Result<(), KrylovError> {
        if self.size != source.size {
            return Err(KrylovError::InvalidDimensions(format!(
                "Vector sizes for clone_from mismatch: {} != {}",
                self.size, source.size
            )));
        }
        self.copy_range_from(0, source, 0, source.size).await
    }

    /// Sets every element to zero.
    pub async fn fill_zero(&mut self) -> Result<(), KrylovError> {
        self.context
            .submit_scoped("fill_zero", |encoder| {
                encoder.clear_buffer(self.inner(), 0, None);
            })
            .await
    }
}

impl Vector for GpuVector {
    type Value = f32;

    fn len(&self) -> usize {
        self.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_view_gathers_elements() {
        let data = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let view = VectorView::new(&data, 1, 2, 3).unwrap();
        assert_eq!(view.to_vec(), vec![1.0, 3.0, 5.0]);
        assert_eq!(view.get(2), Some(5.0));
        assert_eq!(view.get(3), None);
        assert_eq!(Vector::len(&view), 3);
    }

    #[test]
    fn strided_view_rejects_out_of_bounds() {
        let data = [0.0f32; 6];
        assert!(VectorView::new(&data, 1, 2, 3).is_ok());
        match VectorView::new(&data, 1, 2, 4) {
            Err(KrylovError::InvalidDimensions(_)) => {}
            other => panic!("expected InvalidDimensions, got {:?}", other.map(|v| v.size())),
        }
        assert!(VectorView::new(&data, 0, 0, 1).is_err());
    }

    #[test]
    fn empty_view_is_valid_at_buffer_end() {
        let data = [1.0f64, 2.0];
        let view = VectorView::new(&data, 2, 1, 0).unwrap();
        assert!(Vector::is_empty(&view));
    }
}
