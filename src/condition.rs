use num_enum::TryFromPrimitive;
use std::fmt::{self, Display};

/// Possible conditions for conditional execution.
///
/// Discriminants match the A32 condition field (instruction bits 31..28). The value 15 selects
/// the unconditional instruction space, which holds no VFP data-processing encodings, so the
/// conversion from a raw field rejects it.
#[derive(Debug, Copy, Clone, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum Condition {
    Equal = 0,
    NotEqual = 1,
    CarrySet = 2,
    CarryClear = 3,
    Minus = 4,
    Plus = 5,
    Overflow = 6,
    NoOverflow = 7,
    Higher = 8,
    LowerOrSame = 9,
    GreaterThanOrEqual = 10,
    LessThan = 11,
    GreaterThan = 12,
    LessThanOrEqual = 13,
    Always = 14,
}

impl Display for Condition {
    /// Writes the mnemonic suffix of the condition. [Condition::Always] writes nothing, as
    /// assembly leaves it implicit.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Condition::Equal => "eq",
            Condition::NotEqual => "ne",
            Condition::CarrySet => "cs",
            Condition::CarryClear => "cc",
            Condition::Minus => "mi",
            Condition::Plus => "pl",
            Condition::Overflow => "vs",
            Condition::NoOverflow => "vc",
            Condition::Higher => "hi",
            Condition::LowerOrSame => "ls",
            Condition::GreaterThanOrEqual => "ge",
            Condition::LessThan => "lt",
            Condition::GreaterThan => "gt",
            Condition::LessThanOrEqual => "le",
            Condition::Always => "",
        })
    }
}
