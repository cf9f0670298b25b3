use bytemuck::AnyBitPattern;
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    Bool,
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
}

impl DataType {
    /// Returns the size in bytes of one element on the host.
    pub const fn size(self) -> usize {
        match self {
            DataType::Bool => 1,
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
            DataType::I8 => 1,
            DataType::I16 => 2,
            DataType::I32 => 4,
            DataType::I64 => 8,
            DataType::F16 => 2,
            DataType::F32 => 4,
        }
    }

    /// Returns `true` for signed and unsigned integer types.
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::U8
                | DataType::U16
                | DataType::U32
                | DataType::I8
                | DataType::I16
                | DataType::I32
                | DataType::I64
        )
    }

    /// Returns `true` for every type that holds a number, i.e., everything but [`DataType::Bool`].
    pub const fn is_number(self) -> bool {
        !matches!(self, DataType::Bool)
    }

    /// Decodes one integer element. Returns `None` for non-integer types or a wrongly sized slice.
    pub fn to_integer(self, bytes: &[u8]) -> Option<i64> {
        match self {
            DataType::U8 => decode::<u8>(bytes).map(i64::from),
            DataType::U16 => decode::<u16>(bytes).map(i64::from),
            DataType::U32 => decode::<u32>(bytes).map(i64::from),
            DataType::I8 => decode::<i8>(bytes).map(i64::from),
            DataType::I16 => decode::<i16>(bytes).map(i64::from),
            DataType::I32 => decode::<i32>(bytes).map(i64::from),
            DataType::I64 => decode::<i64>(bytes),
            DataType::Bool | DataType::F16 | DataType::F32 => None,
        }
    }

    /// Tests if one stored element is strictly positive. This is the truth rule of logical views.
    /// NaN and wrongly sized slices read as `false`.
    pub fn is_positive(self, bytes: &[u8]) -> bool {
        match self {
            DataType::Bool | DataType::U8 => decode::<u8>(bytes).is_some_and(|x| x > 0),
            DataType::U16 => decode::<u16>(bytes).is_some_and(|x| x > 0),
            DataType::U32 => decode::<u32>(bytes).is_some_and(|x| x > 0),
            DataType::I8 => decode::<i8>(bytes).is_some_and(|x| x > 0),
            DataType::I16 => decode::<i16>(bytes).is_some_and(|x| x > 0),
            DataType::I32 => decode::<i32>(bytes).is_some_and(|x| x > 0),
            DataType::I64 => decode::<i64>(bytes).is_some_and(|x| x > 0),
            DataType::F16 => decode::<f16>(bytes).is_some_and(|x| x > f16::ZERO),
            DataType::F32 => decode::<f32>(bytes).is_some_and(|x| x > 0.0),
        }
    }
}

#[inline]
fn decode<T: AnyBitPattern>(bytes: &[u8]) -> Option<T> {
    bytemuck::try_pod_read_unaligned(bytes).ok()
}

macro_rules! impl_bytemuck {
    ($ty:ty) => {
        unsafe impl ::bytemuck::Zeroable for $ty {}
        unsafe impl ::bytemuck::Pod for $ty {}
    };
}

/// A boolean stored as one byte holding `0` or `1`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Bool(pub u8);

impl_bytemuck!(Bool);

impl From<bool> for Bool {
    #[inline]
    fn from(value: bool) -> Self {
        Self(value as u8)
    }
}

impl From<Bool> for bool {
    #[inline]
    fn from(value: Bool) -> Self {
        value.0 != 0
    }
}

pub trait Scalar: Sized + bytemuck::Pod + Send + Sync + sealed::Sealed {
    const DATA_TYPE: DataType;
}

macro_rules! impl_scalar {
    ($ty:ty, $data_type:expr) => {
        impl Scalar for $ty {
            const DATA_TYPE: DataType = $data_type;
        }
    };
}

impl_scalar!(Bool, DataType::Bool);
impl_scalar!(u8, DataType::U8);
impl_scalar!(u16, DataType::U16);
impl_scalar!(u32, DataType::U32);
impl_scalar!(i8, DataType::I8);
impl_scalar!(i16, DataType::I16);
impl_scalar!(i32, DataType::I32);
impl_scalar!(i64, DataType::I64);
impl_scalar!(f16, DataType::F16);
impl_scalar!(f32, DataType::F32);

mod sealed {
    use half::f16;

    use super::Bool;

    pub trait Sealed {}

    impl Sealed for Bool {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for i8 {}
    impl Sealed for i16 {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for f16 {}
    impl Sealed for f32 {}
}
