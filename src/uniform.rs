//! Persistently mapped uniform arrays.
//!
//! A [`UniformBuffer<D, T>`] is one device buffer holding `count` elements
//! of a plain uniform block `T`. The buffer stays mapped for its whole
//! lifetime; [`write`](UniformBuffer::write) stores straight into the
//! mapping and the next draw sees the new value without an upload call.
//!
//! Elements are spaced [`stride`](UniformBuffer::stride) bytes apart so each
//! one can be bound as its own sub-range:
//!
//! ```text
//! offset:  0          stride      2*stride
//!          [ T0 | pad ][ T1 | pad ][ T2 | pad ]
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;
use std::rc::Rc;

use glam::Mat4;
use tracing::{debug, error};

use crate::device::{BufferId, RenderDevice};
use crate::error::RenderError;

/// Binding slot of the per-frame block.
pub const PER_FRAME_SLOT: u32 = 0;
/// Binding slot of the per-object block.
pub const PER_OBJECT_SLOT: u32 = 1;

/// A plain, fixed-layout value that can live in a uniform buffer.
///
/// Implementors must be `#[repr(C)]` and a multiple of 16 bytes in size so
/// the host layout matches the std140 block the shader declares. The size
/// rule is enforced at compile time when a buffer is allocated.
pub trait UniformBlock: bytemuck::Pod {}

/// Camera state shared by every draw of a frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PerFrameData {
    pub view: Mat4,
    pub projection: Mat4,
    /// Effect-strength scalar, adjustable from the overlay.
    pub effect: f32,
    pub _padding: [f32; 3],
}

impl UniformBlock for PerFrameData {}

impl PerFrameData {
    pub fn new(view: Mat4, projection: Mat4, effect: f32) -> Self {
        Self {
            view,
            projection,
            effect,
            _padding: [0.0; 3],
        }
    }
}

impl Default for PerFrameData {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Mat4::IDENTITY, 0.0)
    }
}

/// Per-instance world transform.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PerObjectData {
    pub world: Mat4,
}

impl UniformBlock for PerObjectData {}

impl PerObjectData {
    pub fn new(world: Mat4) -> Self {
        Self { world }
    }
}

/// A persistently mapped array of `count` uniform blocks bound at `slot`.
pub struct UniformBuffer<D: RenderDevice, T: UniformBlock> {
    device: Rc<D>,
    buffer: BufferId,
    mapping: NonNull<u8>,
    slot: u32,
    count: usize,
    stride: u64,
    _marker: PhantomData<T>,
}

impl<D: RenderDevice, T: UniformBlock> UniformBuffer<D, T> {
    /// Allocates and maps a buffer for `count` elements at uniform `slot`.
    ///
    /// Element 0 is bound to the slot once the mapping is established.
    ///
    /// # Errors
    ///
    /// - [`RenderError::GpuAllocationError`] if `count` is zero or the device
    ///   cannot allocate the buffer.
    /// - [`RenderError::MappingFailure`] if the buffer cannot be mapped or the
    ///   mapping is shorter than the buffer; the buffer is released before
    ///   returning.
    pub fn allocate_persistent(
        device: &Rc<D>,
        slot: u32,
        count: usize,
    ) -> Result<Self, RenderError> {
        const {
            assert!(
                size_of::<T>() % 16 == 0,
                "uniform block size must be a multiple of 16 bytes"
            )
        };

        if count == 0 {
            return Err(RenderError::allocation(format!(
                "uniform buffer at slot {slot} needs at least one element"
            )));
        }

        let element = size_of::<T>() as u64;
        let stride = element.next_multiple_of(device.uniform_offset_alignment().max(1));
        let size = stride.checked_mul(count as u64).ok_or_else(|| {
            RenderError::allocation(format!("{count} uniform elements overflow a buffer"))
        })?;

        let buffer = device.create_persistent_buffer(slot, size, element)?;

        let mapping = match device.map_persistent(buffer) {
            Some(mapping) if mapping.len as u64 >= size => mapping.ptr,
            Some(mapping) => {
                error!(
                    "uniform buffer {:?} at slot {} mapped {} of {} bytes",
                    buffer, slot, mapping.len, size
                );
                device.delete_buffer(buffer);
                return Err(RenderError::MappingFailure { slot });
            }
            None => {
                error!("failed to map uniform buffer {:?} at slot {}", buffer, slot);
                device.delete_buffer(buffer);
                return Err(RenderError::MappingFailure { slot });
            }
        };

        debug!(
            "uniform buffer at slot {}: {} x {} bytes (stride {})",
            slot, count, element, stride
        );

        let uniform = Self {
            device: Rc::clone(device),
            buffer,
            mapping,
            slot,
            count,
            stride,
            _marker: PhantomData,
        };
        uniform.bind(0);
        Ok(uniform)
    }

    /// Stores `value` at element `index` through the mapping.
    ///
    /// # Panics
    ///
    /// Panics if `index >= count`.
    pub fn write(&self, index: usize, value: &T) {
        let offset = self.checked_offset(index);
        let bytes = bytemuck::bytes_of(value);
        // SAFETY: `allocate_persistent` checked that the mapping covers
        // `count * stride` bytes, the `RenderDevice` contract keeps it valid
        // until the buffer is deleted in `drop`, and
        // `offset + size_of::<T>() <= count * stride` for an in-range index.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.mapping.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    /// Reads element `index` back through the mapping.
    ///
    /// # Panics
    ///
    /// Panics if `index >= count`.
    pub fn read(&self, index: usize) -> T {
        let offset = self.checked_offset(index);
        // SAFETY: same bounds as `write`; the mapping may be unaligned for `T`.
        let bytes =
            unsafe { std::slice::from_raw_parts(self.mapping.as_ptr().add(offset), size_of::<T>()) };
        bytemuck::pod_read_unaligned(bytes)
    }

    /// Byte range `(offset, size)` of element `index`.
    pub fn range(&self, index: usize) -> (u64, u64) {
        (self.checked_offset(index) as u64, size_of::<T>() as u64)
    }

    /// Binds element `index` as the sub-range for this buffer's slot.
    pub fn bind(&self, index: usize) {
        let (offset, size) = self.range(index);
        self.device
            .bind_uniform_range(self.slot, self.buffer, offset, size);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    fn checked_offset(&self, index: usize) -> usize {
        assert!(
            index < self.count,
            "uniform index {index} out of range for {} elements",
            self.count
        );
        index * self.stride as usize
    }
}

impl<D: RenderDevice, T: UniformBlock> Drop for UniformBuffer<D, T> {
    fn drop(&mut self) {
        self.device.delete_buffer(self.buffer);
    }
}

impl<D: RenderDevice, T: UniformBlock> fmt::Debug for UniformBuffer<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniformBuffer")
            .field("buffer", &self.buffer)
            .field("slot", &self.slot)
            .field("count", &self.count)
            .field("stride", &self.stride)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{DeviceCall, Faults, HeadlessDevice};
    use glam::Vec3;

    #[test]
    fn block_sizes_follow_std140() {
        assert_eq!(size_of::<PerFrameData>(), 144);
        assert_eq!(size_of::<PerObjectData>(), 64);
    }

    #[test]
    fn write_is_visible_without_flush() {
        let device = Rc::new(HeadlessDevice::new());
        let frame: UniformBuffer<_, PerFrameData> =
            UniformBuffer::allocate_persistent(&device, PER_FRAME_SLOT, 1).unwrap();

        let value = PerFrameData::new(
            Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
            Mat4::perspective_rh(1.0, 1.5, 0.1, 100.0),
            0.25,
        );
        frame.write(0, &value);

        assert_eq!(frame.read(0), value);
        let raw = device.read_buffer(frame.buffer()).unwrap();
        assert_eq!(&raw[..144], bytemuck::bytes_of(&value));
    }

    #[test]
    fn stride_rounds_to_device_alignment() {
        let device = Rc::new(HeadlessDevice::new().with_alignment(64));
        let frame: UniformBuffer<_, PerFrameData> =
            UniformBuffer::allocate_persistent(&device, PER_FRAME_SLOT, 3).unwrap();
        assert_eq!(frame.stride(), 192);
        assert_eq!(frame.range(2), (384, 144));
        assert_eq!(device.read_buffer(frame.buffer()).unwrap().len(), 576);

        let device = Rc::new(HeadlessDevice::new());
        let objects: UniformBuffer<_, PerObjectData> =
            UniformBuffer::allocate_persistent(&device, PER_OBJECT_SLOT, 4).unwrap();
        assert_eq!(objects.stride(), 256);
        assert_eq!(objects.range(3), (768, 64));
    }

    #[test]
    fn zero_count_is_rejected() {
        let device = Rc::new(HeadlessDevice::new());
        let err = UniformBuffer::<_, PerObjectData>::allocate_persistent(&device, 1, 0).unwrap_err();
        assert!(matches!(err, RenderError::GpuAllocationError(_)));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn mapping_failure_releases_buffer() {
        let device = Rc::new(HeadlessDevice::with_faults(Faults {
            mapping_failure: true,
            ..Faults::default()
        }));

        let err =
            UniformBuffer::<_, PerObjectData>::allocate_persistent(&device, PER_OBJECT_SLOT, 2)
                .unwrap_err();

        assert!(matches!(err, RenderError::MappingFailure { slot: 1 }));
        assert_eq!(device.live_buffers(), 0);
        assert!(
            device
                .calls()
                .iter()
                .any(|c| matches!(c, DeviceCall::DeleteBuffer(_)))
        );
    }

    #[test]
    fn short_mapping_is_rejected() {
        let device = Rc::new(HeadlessDevice::with_faults(Faults {
            short_mapping: true,
            ..Faults::default()
        }));

        let err =
            UniformBuffer::<_, PerFrameData>::allocate_persistent(&device, PER_FRAME_SLOT, 1)
                .unwrap_err();

        assert!(matches!(err, RenderError::MappingFailure { slot: 0 }));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn sub_range_bind_draws_with_matching_transform() {
        let device = Rc::new(HeadlessDevice::new());
        let objects: UniformBuffer<_, PerObjectData> =
            UniformBuffer::allocate_persistent(&device, PER_OBJECT_SLOT, 4).unwrap();

        let transforms: Vec<PerObjectData> = (0..4)
            .map(|i| PerObjectData::new(Mat4::from_translation(Vec3::splat(i as f32))))
            .collect();
        for (i, t) in transforms.iter().enumerate() {
            objects.write(i, t);
        }

        for i in 0..4 {
            objects.bind(i);
            device.draw_indexed(3);
        }

        let draws = device.draws();
        for (i, draw) in draws.iter().enumerate() {
            assert_eq!(
                draw.uniforms[&PER_OBJECT_SLOT],
                bytemuck::bytes_of(&transforms[i])
            );
        }
    }

    #[test]
    fn allocation_binds_first_element() {
        let device = Rc::new(HeadlessDevice::new());
        let objects: UniformBuffer<_, PerObjectData> =
            UniformBuffer::allocate_persistent(&device, PER_OBJECT_SLOT, 2).unwrap();

        let last = device.calls().last().cloned().unwrap();
        assert_eq!(
            last,
            DeviceCall::BindUniformRange {
                slot: PER_OBJECT_SLOT,
                buffer: objects.buffer(),
                offset: 0,
                size: 64,
            }
        );
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn write_past_count_panics() {
        let device = Rc::new(HeadlessDevice::new());
        let objects: UniformBuffer<_, PerObjectData> =
            UniformBuffer::allocate_persistent(&device, PER_OBJECT_SLOT, 1).unwrap();
        objects.write(1, &PerObjectData::new(Mat4::IDENTITY));
    }

    #[test]
    fn drop_releases_buffer() {
        let device = Rc::new(HeadlessDevice::new());
        let frame: UniformBuffer<_, PerFrameData> =
            UniformBuffer::allocate_persistent(&device, PER_FRAME_SLOT, 1).unwrap();
        assert_eq!(device.live_buffers(), 1);
        drop(frame);
        assert_eq!(device.live_buffers(), 0);
    }
}
