//! Byte-level layouts for the WASI `snapshot_preview1` ABI.
//!
//! A [`Layout`] knows its size and alignment and how to decode or encode
//! itself at an offset within a raw byte buffer (a guest's linear memory).
//! All integers are little-endian. Aggregates follow C natural alignment:
//! each field is aligned to its own alignment, the struct is aligned to its
//! widest field, and the total size is rounded up to the struct alignment.
//! There is no other padding.
//!
//! Encoding is total and deterministic; the only failure modes are
//! out-of-bounds buffer access and out-of-range enum discriminants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("access of {len} bytes at offset {offset} is outside a buffer of {buf_len} bytes")]
    OutOfBounds { offset: u32, len: u32, buf_len: usize },
    #[error("value {value} is not a valid {ty}")]
    InvalidEnum { ty: &'static str, value: u64 },
}

/// A value with a fixed wire layout.
pub trait Layout: Sized {
    const SIZE: u32;
    const ALIGN: u32;

    fn get(buf: &[u8], offset: u32) -> Result<Self, LayoutError>;
    fn set(self, buf: &mut [u8], offset: u32) -> Result<(), LayoutError>;
}

/// Round `offset` up to a multiple of `align`. `align` must be a power of
/// two.
pub const fn align_to(offset: u32, align: u32) -> u32 {
    (offset + align - 1) & !(align - 1)
}

/// Borrow `len` bytes at `offset`, or report the overrun.
pub fn read_bytes(buf: &[u8], offset: u32, len: u32) -> Result<&[u8], LayoutError> {
    let start = offset as usize;
    start
        .checked_add(len as usize)
        .and_then(|end| buf.get(start..end))
        .ok_or(LayoutError::OutOfBounds {
            offset,
            len,
            buf_len: buf.len(),
        })
}

/// Copy `bytes` into the buffer at `offset`, or report the overrun.
pub fn write_bytes(buf: &mut [u8], offset: u32, bytes: &[u8]) -> Result<(), LayoutError> {
    let start = offset as usize;
    let buf_len = buf.len();
    let dest = start
        .checked_add(bytes.len())
        .and_then(|end| buf.get_mut(start..end))
        .ok_or(LayoutError::OutOfBounds {
            offset,
            len: bytes.len() as u32,
            buf_len,
        })?;
    dest.copy_from_slice(bytes);
    Ok(())
}

macro_rules! int_layout {
    ($($ty:ident)*) => {$(
        impl Layout for $ty {
            const SIZE: u32 = std::mem::size_of::<$ty>() as u32;
            const ALIGN: u32 = std::mem::size_of::<$ty>() as u32;

            fn get(buf: &[u8], offset: u32) -> Result<Self, LayoutError> {
                let raw = read_bytes(buf, offset, Self::SIZE)?;
                Ok(<$ty>::from_le_bytes(raw.try_into().unwrap()))
            }

            fn set(self, buf: &mut [u8], offset: u32) -> Result<(), LayoutError> {
                write_bytes(buf, offset, &self.to_le_bytes())
            }
        }
    )*};
}

int_layout!(u8 i8 u16 i16 u32 i32 u64 i64);

/// Fixed-length byte strings: size `N`, byte-aligned.
impl<const N: usize> Layout for [u8; N] {
    const SIZE: u32 = N as u32;
    const ALIGN: u32 = 1;

    fn get(buf: &[u8], offset: u32) -> Result<Self, LayoutError> {
        let raw = read_bytes(buf, offset, N as u32)?;
        Ok(raw.try_into().unwrap())
    }

    fn set(self, buf: &mut [u8], offset: u32) -> Result<(), LayoutError> {
        write_bytes(buf, offset, &self)
    }
}

/// Declare a struct with a C-natural-alignment wire layout.
///
/// Fields are laid out in declaration order, each aligned to its own
/// `ALIGN`; the struct's `SIZE` is rounded up to its widest field.
#[macro_export]
macro_rules! layout_struct {
    ($(#[$meta:meta])* $vis:vis struct $name:ident {
        $($(#[$fmeta:meta])* $fvis:vis $field:ident : $fty:ty,)*
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis struct $name {
            $($(#[$fmeta])* $fvis $field: $fty,)*
        }

        impl $crate::Layout for $name {
            const ALIGN: u32 = {
                let mut align = 1u32;
                $(if <$fty as $crate::Layout>::ALIGN > align {
                    align = <$fty as $crate::Layout>::ALIGN;
                })*
                align
            };
            const SIZE: u32 = {
                let mut off = 0u32;
                $(
                    off = $crate::align_to(off, <$fty as $crate::Layout>::ALIGN);
                    off += <$fty as $crate::Layout>::SIZE;
                )*
                $crate::align_to(off, Self::ALIGN)
            };

            fn get(buf: &[u8], offset: u32) -> Result<Self, $crate::LayoutError> {
                // field offsets are relative to the struct start, whatever
                // the base pointer's alignment
                let mut rel = 0u32;
                $(
                    rel = $crate::align_to(rel, <$fty as $crate::Layout>::ALIGN);
                    let $field = <$fty as $crate::Layout>::get(buf, offset + rel)?;
                    rel += <$fty as $crate::Layout>::SIZE;
                )*
                let _ = rel;
                Ok(Self { $($field,)* })
            }

            fn set(self, buf: &mut [u8], offset: u32) -> Result<(), $crate::LayoutError> {
                let mut rel = 0u32;
                $(
                    rel = $crate::align_to(rel, <$fty as $crate::Layout>::ALIGN);
                    <$fty as $crate::Layout>::set(self.$field, buf, offset + rel)?;
                    rel += <$fty as $crate::Layout>::SIZE;
                )*
                let _ = rel;
                Ok(())
            }
        }
    };
}

/// Declare an enumeration over an integer representation.
///
/// Decoding an unlisted discriminant fails with
/// [`LayoutError::InvalidEnum`]; encoding is the underlying integer.
#[macro_export]
macro_rules! layout_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident : $repr:ty {
        $($(#[$vmeta:meta])* $variant:ident = $value:expr,)*
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr($repr)]
        $vis enum $name {
            $($(#[$vmeta])* $variant = $value,)*
        }

        impl $crate::Layout for $name {
            const SIZE: u32 = <$repr as $crate::Layout>::SIZE;
            const ALIGN: u32 = <$repr as $crate::Layout>::ALIGN;

            fn get(buf: &[u8], offset: u32) -> Result<Self, $crate::LayoutError> {
                match <$repr as $crate::Layout>::get(buf, offset)? {
                    $(v if v == $value => Ok(Self::$variant),)*
                    other => Err($crate::LayoutError::InvalidEnum {
                        ty: stringify!($name),
                        value: other as u64,
                    }),
                }
            }

            fn set(self, buf: &mut [u8], offset: u32) -> Result<(), $crate::LayoutError> {
                <$repr as $crate::Layout>::set(self as $repr, buf, offset)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    layout_struct! {
        struct Mixed {
            a: u8,
            b: u32,
            c: u64,
            d: u16,
        }
    }

    layout_enum! {
        enum Kind: u8 {
            Zero = 0,
            Two = 2,
        }
    }

    layout_struct! {
        struct Nested {
            tag: Kind,
            inner: Mixed,
        }
    }

    #[test]
    fn natural_alignment() {
        // a@0, b@4, c@8, d@16, size rounded to align 8
        assert_eq!(Mixed::ALIGN, 8);
        assert_eq!(Mixed::SIZE, 24);
        assert_eq!(Nested::ALIGN, 8);
        // tag@0, inner@8
        assert_eq!(Nested::SIZE, 32);
    }

    #[test]
    fn int_round_trip() {
        let mut buf = [0u8; 16];
        0xdead_beef_u32.set(&mut buf, 4).unwrap();
        assert_eq!(u32::get(&buf, 4).unwrap(), 0xdead_beef);
        assert_eq!(buf[4..8], [0xef, 0xbe, 0xad, 0xde]);

        (-2i64).set(&mut buf, 8).unwrap();
        assert_eq!(i64::get(&buf, 8).unwrap(), -2);
    }

    #[test]
    fn struct_round_trip() {
        let v = Mixed {
            a: 7,
            b: 0x0102_0304,
            c: u64::MAX - 1,
            d: 0xeeff,
        };
        let mut buf = vec![0u8; Mixed::SIZE as usize];
        v.set(&mut buf, 0).unwrap();
        assert_eq!(Mixed::get(&buf, 0).unwrap(), v);
        // field placement
        assert_eq!(buf[0], 7);
        assert_eq!(u32::get(&buf, 4).unwrap(), 0x0102_0304);
        assert_eq!(u64::get(&buf, 8).unwrap(), u64::MAX - 1);
        assert_eq!(u16::get(&buf, 16).unwrap(), 0xeeff);
    }

    #[test]
    fn base_alignment_does_not_shift_fields() {
        let v = Mixed {
            a: 1,
            b: 2,
            c: 3,
            d: 4,
        };
        let mut buf = vec![0u8; 64];
        v.set(&mut buf, 5).unwrap();
        assert_eq!(Mixed::get(&buf, 5).unwrap(), v);
        // relative placement is fixed: b at +4, c at +8
        assert_eq!(u32::get(&buf, 5 + 4).unwrap(), 2);
        assert_eq!(u64::get(&buf, 5 + 8).unwrap(), 3);
    }

    #[test]
    fn enum_rejects_unknown_discriminant() {
        let buf = [1u8];
        match Kind::get(&buf, 0) {
            Err(LayoutError::InvalidEnum { ty, value }) => {
                assert_eq!(ty, "Kind");
                assert_eq!(value, 1);
            }
            other => panic!("expected InvalidEnum, got {other:?}"),
        }
        assert!(matches!(Kind::get(&[2u8], 0), Ok(Kind::Two)));
    }

    #[test]
    fn out_of_bounds() {
        let mut buf = [0u8; 4];
        assert!(matches!(
            u64::get(&buf, 0),
            Err(LayoutError::OutOfBounds { .. })
        ));
        assert!(matches!(
            3u32.set(&mut buf, 2),
            Err(LayoutError::OutOfBounds { .. })
        ));
        // offsets near u32::MAX must not overflow
        assert!(matches!(
            u32::get(&buf, u32::MAX - 1),
            Err(LayoutError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn byte_string_round_trip() {
        let mut buf = [0u8; 8];
        [1u8, 2, 3].set(&mut buf, 5).unwrap();
        assert_eq!(<[u8; 3]>::get(&buf, 5).unwrap(), [1, 2, 3]);
    }
}
