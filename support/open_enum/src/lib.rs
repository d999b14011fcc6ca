// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![no_std]

//! Provides the [`open_enum`] macro, for wire-level discriminants that may
//! carry values outside the known set.

/// Declares a `#[repr(transparent)]` newtype over an integer with one
/// associated constant per listed variant.
///
/// Unlike a Rust `enum`, any value of the storage type is valid, so the type
/// can sit directly in a wire structure and be matched against the known
/// constants with a catch-all arm. Attributes before `enum` apply to the
/// struct (for example zerocopy derives), and inner attributes apply to the
/// constants' `impl` block.
///
/// The generated type derives `Copy`, `Clone`, `Eq`, `PartialEq`, `Hash`,
/// `Ord` and `PartialOrd`. Its `Debug` prints the constant's name, or the raw
/// value for an unknown one.
///
/// ```
/// use open_enum::open_enum;
///
/// open_enum! {
///     pub enum Opcode: u8 {
///         READ = 0x28,
///         WRITE = 0x2a,
///     }
/// }
///
/// assert_eq!(Opcode::READ.0, 0x28);
/// assert_eq!(format!("{:?}", Opcode::WRITE), "WRITE");
/// assert_eq!(format!("{:?}", Opcode(7)), "7");
/// ```
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $v:vis enum $name:ident : $storage:ty {
            $(#![$implattr:meta])*
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        #[repr(transparent)]
        $(#[$a])*
        $v struct $name(pub $storage);

        $(#[$implattr])*
        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, fmt: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                #![allow(unreachable_patterns)]
                let s = match *self {
                    $( Self::$variant => stringify!($variant), )*
                    _ => return ::core::fmt::Debug::fmt(&self.0, fmt),
                };
                fmt.pad(s)
            }
        }
    };
}
