//! # Selectors
//!
//! A selector names a method call site: it packs the argument count, the
//! access kind and a program-wide selector id into one 32-bit word.
//!
//! ```text
//! bit 31                 10  9   8  7        0
//!     +--------------------+------+----------+
//!     |         id         | kind |  arity   |
//!     +--------------------+------+----------+
//! ```
//!
//! The dispatch table is indexed by `selector id + class id`; the entry's
//! offset field is compared against the smi-tagged selector id for
//! inline-cache-style validation.

use super::object::smi;

/// The access kind encoded in a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SelectorKind {
    Method = 0,
    Getter = 1,
    Setter = 2,
}

/// Bitfield accessors for encoded selectors.
#[derive(Debug, Clone, Copy)]
pub struct Selector;

impl Selector {
    /// Width of the arity field.
    pub const ARITY_BITS: u32 = 8;
    /// Width of the kind field.
    pub const KIND_BITS: u32 = 2;
    /// Bit position of the kind field.
    pub const KIND_SHIFT: u32 = Self::ARITY_BITS;
    /// Bit position of the id field.
    pub const ID_SHIFT: u32 = Self::ARITY_BITS + Self::KIND_BITS;

    /// Encode a selector word.
    pub fn encode(id: u32, kind: SelectorKind, arity: u8) -> i32 {
        ((id << Self::ID_SHIFT) | ((kind as u32) << Self::KIND_SHIFT) | arity as u32) as i32
    }

    /// The argument count (excluding the receiver).
    pub fn arity(selector: i32) -> usize {
        (selector as u32 & ((1 << Self::ARITY_BITS) - 1)) as usize
    }

    /// The access kind.
    pub fn kind(selector: i32) -> SelectorKind {
        match (selector as u32 >> Self::KIND_SHIFT) & ((1 << Self::KIND_BITS) - 1) {
            0 => SelectorKind::Method,
            1 => SelectorKind::Getter,
            _ => SelectorKind::Setter,
        }
    }

    /// The program-wide selector id.
    pub fn id(selector: i32) -> i64 {
        (selector as u32 >> Self::ID_SHIFT) as i64
    }

    /// The smi-tagged selector id, as stored in dispatch table entry
    /// offset fields.
    pub fn smi_selector_offset(selector: i32) -> i64 {
        Self::id(selector) << smi::TAG_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let selector = Selector::encode(17, SelectorKind::Method, 2);
        assert_eq!(Selector::arity(selector), 2);
        assert_eq!(Selector::kind(selector), SelectorKind::Method);
        assert_eq!(Selector::id(selector), 17);
        assert_eq!(Selector::smi_selector_offset(selector), 34);
    }

    #[test]
    fn fields_do_not_bleed() {
        let selector = Selector::encode(0x1fffff, SelectorKind::Setter, 255);
        assert_eq!(Selector::arity(selector), 255);
        assert_eq!(Selector::kind(selector), SelectorKind::Setter);
        assert_eq!(Selector::id(selector), 0x1fffff);
    }

    #[test]
    fn getter_selectors_have_zero_arity() {
        let selector = Selector::encode(3, SelectorKind::Getter, 0);
        assert_eq!(Selector::arity(selector), 0);
        assert_eq!(Selector::kind(selector), SelectorKind::Getter);
    }
}
