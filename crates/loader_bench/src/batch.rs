//! Batch values handed from a pipeline back to the benchmark loop.

use crate::view::DeviceArrayView;
use tch::{Device, Kind, Tensor};

/// Element type of a raw buffer produced by a native loader.
///
/// The numeric codes are part of the native loader ABI and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl DType {
    pub fn from_code(code: u32) -> Option<Self> {
        let dtype = match code {
            0 => DType::U8,
            1 => DType::I8,
            2 => DType::I16,
            3 => DType::I32,
            4 => DType::I64,
            5 => DType::F16,
            6 => DType::F32,
            7 => DType::F64,
            _ => return None,
        };
        Some(dtype)
    }

    pub fn code(self) -> u32 {
        match self {
            DType::U8 => 0,
            DType::I8 => 1,
            DType::I16 => 2,
            DType::I32 => 3,
            DType::I64 => 4,
            DType::F16 => 5,
            DType::F32 => 6,
            DType::F64 => 7,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::I16 | DType::F16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// The matching `tch` element kind.
    pub fn kind(self) -> Kind {
        match self {
            DType::U8 => Kind::Uint8,
            DType::I8 => Kind::Int8,
            DType::I16 => Kind::Int16,
            DType::I32 => Kind::Int,
            DType::I64 => Kind::Int64,
            DType::F16 => Kind::Half,
            DType::F32 => Kind::Float,
            DType::F64 => Kind::Double,
        }
    }
}

/// One image buffer inside a [`Batch`].
///
/// Adapter-fed batches carry non-owning views into loader memory, direct-read
/// batches carry tensors they own.
#[derive(Debug)]
pub enum DeviceArray {
    View(DeviceArrayView),
    Owned(Tensor),
}

impl DeviceArray {
    pub fn shape(&self) -> Vec<i64> {
        match self {
            DeviceArray::View(view) => view.shape().to_vec(),
            DeviceArray::Owned(tensor) => tensor.size(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            DeviceArray::View(view) => view.size_bytes(),
            DeviceArray::Owned(tensor) => tensor.numel() * tensor.kind().elt_size_in_bytes(),
        }
    }

    pub fn device(&self) -> Device {
        match self {
            DeviceArray::View(view) => view.device(),
            DeviceArray::Owned(tensor) => tensor.device(),
        }
    }
}

/// A batch of images plus an Int32 label tensor of shape `[batch_size]`.
///
/// Backends that do not know labels fill the label tensor with zeros; the
/// benchmark never reads them.
#[derive(Debug)]
pub struct Batch {
    images: Vec<DeviceArray>,
    labels: Tensor,
}

impl Batch {
    pub fn new(images: Vec<DeviceArray>, labels: Tensor) -> Self {
        Self { images, labels }
    }

    /// Zero-valued placeholder labels.
    pub fn zero_labels(batch_size: usize, device: Device) -> Tensor {
        Tensor::zeros(&[batch_size as i64], (Kind::Int, device))
    }

    pub fn images(&self) -> &[DeviceArray] {
        &self.images
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    /// Number of image buffers. May be smaller than the label length for a
    /// short final batch.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Total payload of all image buffers.
    pub fn size_bytes(&self) -> usize {
        self.images.iter().map(DeviceArray::size_bytes).sum()
    }
}

/// Outcome of one `produce next batch` request.
///
/// Both exhaustion styles (a pre-computed epoch length and a raised end of
/// stream) collapse into `EndOfEpoch`, so callers never branch on backend.
#[derive(Debug)]
pub enum BatchResult {
    Batch(Batch),
    EndOfEpoch,
}

impl BatchResult {
    pub fn is_end_of_epoch(&self) -> bool {
        matches!(self, BatchResult::EndOfEpoch)
    }

    pub fn into_batch(self) -> Option<Batch> {
        match self {
            BatchResult::Batch(batch) => Some(batch),
            BatchResult::EndOfEpoch => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_codes_are_stable() {
        for code in 0..8 {
            let dtype = DType::from_code(code).unwrap();
            assert_eq!(dtype.code(), code);
            assert_eq!(dtype.size_in_bytes(), dtype.kind().elt_size_in_bytes());
        }
        assert_eq!(DType::from_code(8), None);
    }

    #[test]
    fn test_zero_labels() {
        let labels = Batch::zero_labels(4, Device::Cpu);
        assert_eq!(labels.size(), vec![4]);
        assert_eq!(labels.kind(), Kind::Int);
        for i in 0..4 {
            assert_eq!(labels.int64_value(&[i]), 0);
        }
    }

    #[test]
    fn test_owned_array_metadata() {
        let batch = Batch::new(
            vec![
                DeviceArray::Owned(Tensor::zeros(&[3, 2], (Kind::Float, Device::Cpu))),
                DeviceArray::Owned(Tensor::zeros(&[5], (Kind::Uint8, Device::Cpu))),
            ],
            Batch::zero_labels(2, Device::Cpu),
        );
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.images()[0].shape(), vec![3, 2]);
        assert_eq!(batch.size_bytes(), 3 * 2 * 4 + 5);

        let result = BatchResult::Batch(batch);
        assert!(!result.is_end_of_epoch());
        assert!(result.into_batch().is_some());
        assert!(BatchResult::EndOfEpoch.into_batch().is_none());
    }
}
