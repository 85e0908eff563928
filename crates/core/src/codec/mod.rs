//! Fixed-layout encoding of replicated state.
//!
//! Every shared state type declares its exact encoded length up front. Fields are
//! written little-endian in declaration order with no framing or padding, so the
//! byte layout is identical on every participating machine regardless of the
//! in-memory layout the compiler picks.

use serde::{Deserialize, Serialize};

use crate::{Result, StateSyncError};

/// A value that can be replicated byte-for-byte between processes.
pub trait StatePayload: Sized {
    /// Exact number of bytes produced by [`StatePayload::encode_into`].
    const ENCODED_LEN: usize;

    fn encode_into(&self, out: &mut PayloadWriter);

    fn decode_from(reader: &mut PayloadReader<'_>) -> Result<Self>;

    /// Encodes the value into a freshly allocated buffer of `ENCODED_LEN` bytes.
    fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::with_capacity(Self::ENCODED_LEN);
        self.encode_into(&mut writer);
        debug_assert_eq!(writer.len(), Self::ENCODED_LEN);
        writer.into_inner()
    }

    /// Decodes a value from a buffer that must be exactly `ENCODED_LEN` bytes long.
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(StateSyncError::SizeMismatch {
                expected: Self::ENCODED_LEN,
                actual: bytes.len(),
            });
        }
        let mut reader = PayloadReader::new(bytes);
        Self::decode_from(&mut reader)
    }
}

#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn put_f32(&mut self, value: f32) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn put_f64(&mut self, value: f64) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded payload.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.offset + N;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(StateSyncError::Codec("payload ended before all fields were read"))?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.offset = end;
        Ok(out)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.take().map(u32::from_le_bytes)
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.take().map(i32::from_le_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.take().map(u64::from_le_bytes)
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        self.take().map(f32::from_le_bytes)
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        self.take().map(f64::from_le_bytes)
    }
}

macro_rules! scalar_payload {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl StatePayload for $ty {
                const ENCODED_LEN: usize = std::mem::size_of::<$ty>();

                fn encode_into(&self, out: &mut PayloadWriter) {
                    out.$put(*self);
                }

                fn decode_from(reader: &mut PayloadReader<'_>) -> Result<Self> {
                    reader.$get()
                }
            }
        )*
    };
}

scalar_payload! {
    u32 => put_u32, get_u32;
    i32 => put_i32, get_i32;
    u64 => put_u64, get_u64;
    f32 => put_f32, get_f32;
    f64 => put_f64, get_f64;
}

impl<T: StatePayload + Copy + Default, const N: usize> StatePayload for [T; N] {
    const ENCODED_LEN: usize = T::ENCODED_LEN * N;

    fn encode_into(&self, out: &mut PayloadWriter) {
        for value in self {
            value.encode_into(out);
        }
    }

    fn decode_from(reader: &mut PayloadReader<'_>) -> Result<Self> {
        let mut values = [T::default(); N];
        for value in values.iter_mut() {
            *value = T::decode_from(reader)?;
        }
        Ok(values)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl StatePayload for Vec3 {
    const ENCODED_LEN: usize = 3 * 8;

    fn encode_into(&self, out: &mut PayloadWriter) {
        out.put_f64(self.x);
        out.put_f64(self.y);
        out.put_f64(self.z);
    }

    fn decode_from(reader: &mut PayloadReader<'_>) -> Result<Self> {
        Ok(Self {
            x: reader.get_f64()?,
            y: reader.get_f64()?,
            z: reader.get_f64()?,
        })
    }
}

/// Unit quaternion, scalar component first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// Rotation of `angle` radians about the unit `axis`.
    pub fn from_axis_angle(axis: Vec3, angle: f64) -> Self {
        let (sin, cos) = (angle * 0.5).sin_cos();
        Self {
            w: cos,
            x: axis.x * sin,
            y: axis.y * sin,
            z: axis.z * sin,
        }
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl StatePayload for Quat {
    const ENCODED_LEN: usize = 4 * 8;

    fn encode_into(&self, out: &mut PayloadWriter) {
        out.put_f64(self.w);
        out.put_f64(self.x);
        out.put_f64(self.y);
        out.put_f64(self.z);
    }

    fn decode_from(reader: &mut PayloadReader<'_>) -> Result<Self> {
        Ok(Self {
            w: reader.get_f64()?,
            x: reader.get_f64()?,
            y: reader.get_f64()?,
            z: reader.get_f64()?,
        })
    }
}

/// Position and orientation of an object or viewpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl StatePayload for Pose {
    const ENCODED_LEN: usize = Vec3::ENCODED_LEN + Quat::ENCODED_LEN;

    fn encode_into(&self, out: &mut PayloadWriter) {
        self.position.encode_into(out);
        self.orientation.encode_into(out);
    }

    fn decode_from(reader: &mut PayloadReader<'_>) -> Result<Self> {
        Ok(Self {
            position: Vec3::decode_from(reader)?,
            orientation: Quat::decode_from(reader)?,
        })
    }
}

/// State replicated when an application does not define its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultState {
    pub pose: Pose,
}

impl StatePayload for DefaultState {
    const ENCODED_LEN: usize = Pose::ENCODED_LEN;

    fn encode_into(&self, out: &mut PayloadWriter) {
        self.pose.encode_into(out);
    }

    fn decode_from(reader: &mut PayloadReader<'_>) -> Result<Self> {
        Ok(Self {
            pose: Pose::decode_from(reader)?,
        })
    }
}
