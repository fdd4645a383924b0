//! # Natives
//!
//! The statically known enumeration of native entry points. The natives
//! declarator emits one external declaration per kind, named
//! `Native_<Name>`, all sharing the signature
//! `(process, pointer-to-last-argument) -> tagged object`.
//!
//! The enumeration is dense from zero; the declarator indexes a vector by
//! the enum value and asserts sequential insertion, so the order here is
//! part of the runtime ABI.

macro_rules! natives {
    ($( $name:ident = $value:literal, )*) => {
        /// A native entry point kind.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Native {
            $( $name = $value, )*
        }

        /// Number of native kinds.
        pub const NATIVE_COUNT: usize = [$( Native::$name, )*].len();

        /// All native kinds, in enumeration order.
        pub const ALL_NATIVES: [Native; NATIVE_COUNT] = [$( Native::$name, )*];

        impl Native {
            /// Decode a native from its byte value.
            pub fn from_byte(byte: u8) -> Option<Native> {
                match byte {
                    $( $value => Some(Native::$name), )*
                    _ => None,
                }
            }

            /// The enumeration name, used to form the `Native_<Name>`
            /// external symbol.
            pub fn name(self) -> &'static str {
                match self {
                    $( Native::$name => stringify!($name), )*
                }
            }
        }
    };
}

natives! {
    PrintToConsole = 0,
    ExposeGC = 1,
    GetField = 2,
    SetField = 3,
    IdentityHashCode = 4,
    SmiToDouble = 5,
    SmiToString = 6,
    DoubleAdd = 7,
    DoubleSub = 8,
    DoubleMul = 9,
    DoubleDiv = 10,
    DoubleToString = 11,
    ListNew = 12,
    ListLength = 13,
    ListIndexGet = 14,
    ListIndexSet = 15,
    StringLength = 16,
    StringAdd = 17,
    StringCompare = 18,
    ProcessSpawn = 19,
    ProcessCurrent = 20,
    SystemExit = 21,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_is_dense() {
        for (index, native) in ALL_NATIVES.iter().enumerate() {
            assert_eq!(*native as usize, index);
            assert_eq!(Native::from_byte(index as u8), Some(*native));
        }
        assert_eq!(Native::from_byte(NATIVE_COUNT as u8), None);
    }

    #[test]
    fn names_match_symbols() {
        assert_eq!(Native::PrintToConsole.name(), "PrintToConsole");
        assert_eq!(Native::ListIndexGet.name(), "ListIndexGet");
    }
}
