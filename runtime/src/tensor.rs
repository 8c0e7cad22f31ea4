//! Tensor descriptors
//!
//! A tensor is a named view over a contiguous byte region. It never owns the
//! bytes it points at unless it carries an explicit owned backing (used for
//! result copies handed back to the caller); ownership otherwise lives in a
//! buffer-pool slot or in a caller-provided buffer.

use std::fmt;
use std::sync::Arc;

/// Element types understood by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DataType {
    Float32,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Int32,
    Int64,
    Uint32,
    Uint64,
    /// Bounding-box record produced by the post-processing unit
    BBox,
    /// Face record produced by the post-processing unit
    Face,
    /// Pose record produced by the post-processing unit
    Pose,
}

impl DataType {
    /// Size of one element in bytes
    pub fn elem_size(self) -> usize {
        match self {
            DataType::Uint8 | DataType::Int8 => 1,
            DataType::Uint16 | DataType::Int16 => 2,
            DataType::Float32 | DataType::Int32 | DataType::Uint32 => 4,
            DataType::Int64 | DataType::Uint64 => 8,
            DataType::BBox => 32,
            DataType::Face => 64,
            DataType::Pose => 256,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Where a tensor's bytes live on the device side
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MemoryKind {
    /// Device DRAM, transferred over DMA
    Dram,
    /// Value is delivered inside the response record (argmax models)
    Register,
    /// Variable-length post-processing output region
    Ppu,
}

impl Default for MemoryKind {
    fn default() -> Self {
        MemoryKind::Dram
    }
}

/// Raw data pointer carried by a tensor view.
///
/// The pointee is a pool slot, a device-visible staging region, or a caller
/// buffer; its lifetime is managed by the request/job owning the view. The
/// runtime moves these across worker threads, hence the manual `Send`/`Sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPtr(pub *mut u8);

unsafe impl Send for DataPtr {}
unsafe impl Sync for DataPtr {}

impl Default for DataPtr {
    fn default() -> Self {
        DataPtr::null()
    }
}

impl DataPtr {
    pub fn null() -> Self {
        DataPtr(std::ptr::null_mut())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Pointer at `offset` bytes past this one
    pub fn add(&self, offset: usize) -> Self {
        debug_assert!(!self.0.is_null());
        DataPtr(unsafe { self.0.add(offset) })
    }
}

/// A named view over a contiguous byte region
#[derive(Debug, Clone)]
pub struct Tensor {
    name: String,
    shape: Vec<i64>,
    dtype: DataType,
    data: DataPtr,
    phys_addr: u64,
    memory_kind: MemoryKind,
    /// True when `data` lies inside a caller-provided output buffer with a
    /// model-global offset; such views are never released to a pool.
    user_buffer_mapped: bool,
    /// Keeps result copies alive for tensors returned to the caller
    backing: Option<Arc<Vec<u8>>>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<i64>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            data: DataPtr::null(),
            phys_addr: 0,
            memory_kind: MemoryKind::Dram,
            user_buffer_mapped: false,
            backing: None,
        }
    }

    /// Same descriptor bound to a different data pointer
    pub fn with_data(&self, data: DataPtr) -> Self {
        let mut t = self.clone();
        t.data = data;
        t.backing = None;
        t
    }

    /// Descriptor bound to an owned copy of `bytes`
    pub fn with_owned(&self, bytes: Vec<u8>) -> Self {
        let backing = Arc::new(bytes);
        let mut t = self.clone();
        t.data = DataPtr(backing.as_ptr() as *mut u8);
        t.backing = Some(backing);
        t.user_buffer_mapped = false;
        t
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn set_shape(&mut self, shape: Vec<i64>) {
        self.shape = shape;
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn data(&self) -> DataPtr {
        self.data
    }

    pub fn set_data(&mut self, data: DataPtr) {
        self.data = data;
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    pub fn set_phys_addr(&mut self, addr: u64) {
        self.phys_addr = addr;
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.memory_kind
    }

    pub fn set_memory_kind(&mut self, kind: MemoryKind) {
        self.memory_kind = kind;
    }

    pub fn is_user_buffer_mapped(&self) -> bool {
        self.user_buffer_mapped
    }

    pub fn set_user_buffer_mapped(&mut self, mapped: bool) {
        self.user_buffer_mapped = mapped;
    }

    /// Total size in bytes; dynamic (negative) dimensions are skipped, their
    /// actual extent is only known at runtime.
    pub fn size_in_bytes(&self) -> usize {
        let mut elems: u64 = 1;
        for &dim in &self.shape {
            if dim < 0 {
                continue;
            }
            elems = elems.saturating_mul(dim as u64);
        }
        elems as usize * self.dtype.elem_size()
    }

    /// View the tensor contents.
    ///
    /// # Safety
    /// The data pointer must be valid for `size_in_bytes()` bytes and no
    /// writer may alias it for the duration of the borrow.
    pub unsafe fn as_slice(&self) -> &[u8] {
        debug_assert!(!self.data.is_null());
        std::slice::from_raw_parts(self.data.0, self.size_in_bytes())
    }

    /// Mutably view the tensor contents.
    ///
    /// # Safety
    /// The data pointer must be valid for `size_in_bytes()` bytes and no
    /// other reader or writer may alias it for the duration of the borrow.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        debug_assert!(!self.data.is_null());
        std::slice::from_raw_parts_mut(self.data.0, self.size_in_bytes())
    }

    /// Copy the tensor contents out.
    ///
    /// # Safety
    /// Same contract as [`Tensor::as_slice`].
    pub unsafe fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?} {} ({} B)", self.name, self.shape, self.dtype, self.size_in_bytes())
    }
}

/// Ordered list of tensors, as returned to the caller
pub type TensorList = Vec<Tensor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elem_sizes() {
        assert_eq!(DataType::Uint8.elem_size(), 1);
        assert_eq!(DataType::Float32.elem_size(), 4);
        assert_eq!(DataType::BBox.elem_size(), 32);
        assert_eq!(DataType::Face.elem_size(), 64);
        assert_eq!(DataType::Pose.elem_size(), 256);
    }

    #[test]
    fn test_size_in_bytes() {
        let t = Tensor::new("in", vec![1, 3, 224, 224], DataType::Uint8);
        assert_eq!(t.size_in_bytes(), 150_528);
        let t = Tensor::new("out", vec![1, 1000], DataType::Float32);
        assert_eq!(t.size_in_bytes(), 4000);
    }

    #[test]
    fn test_dynamic_dims_skipped() {
        let t = Tensor::new("ppu", vec![1, -1], DataType::BBox);
        assert_eq!(t.size_in_bytes(), 32);
    }

    #[test]
    fn test_owned_backing() {
        let desc = Tensor::new("x", vec![4], DataType::Uint8);
        let t = desc.with_owned(vec![1, 2, 3, 4]);
        assert_eq!(unsafe { t.as_slice() }, &[1, 2, 3, 4]);
    }
}
