// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use crate::ProtocolError;

/// Maximum length (bytes, including the terminating NUL) of a DBR_STRING
/// element.
pub const MAX_STRING_SIZE: usize = 40;

/// The DBR-type family: a base type crossed with a qualifier that adds
/// status, time, graphic, or control metadata ahead of the value array. The
/// core only needs to know the element size of the base type to size value
/// buffers; composing the qualifier's extra metadata bytes is the adapter's
/// job (out of scope here, §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbrType {
    String,
    Int,
    Float,
    Enum,
    Char,
    Long,
    Double,
    StsString,
    StsInt,
    StsFloat,
    StsEnum,
    StsChar,
    StsLong,
    StsDouble,
    TimeString,
    TimeInt,
    TimeFloat,
    TimeEnum,
    TimeChar,
    TimeLong,
    TimeDouble,
    GrString,
    GrInt,
    GrFloat,
    GrEnum,
    GrChar,
    GrLong,
    GrDouble,
    CtrlString,
    CtrlInt,
    CtrlFloat,
    CtrlEnum,
    CtrlChar,
    CtrlLong,
    CtrlDouble,
}

impl DbrType {
    /// Decode a DBR type from its wire code (the `data_type` header field).
    pub fn from_wire(code: u16) -> Result<Self, ProtocolError> {
        use DbrType::*;
        Ok(match code {
            0 => String,
            1 => Int,
            2 => Float,
            3 => Enum,
            4 => Char,
            5 => Long,
            6 => Double,
            7 => StsString,
            8 => StsInt,
            9 => StsFloat,
            10 => StsEnum,
            11 => StsChar,
            12 => StsLong,
            13 => StsDouble,
            14 => TimeString,
            15 => TimeInt,
            16 => TimeFloat,
            17 => TimeEnum,
            18 => TimeChar,
            19 => TimeLong,
            20 => TimeDouble,
            21 => GrString,
            22 => GrInt,
            23 => GrFloat,
            24 => GrEnum,
            25 => GrChar,
            26 => GrLong,
            27 => GrDouble,
            28 => CtrlString,
            29 => CtrlInt,
            30 => CtrlFloat,
            31 => CtrlEnum,
            32 => CtrlChar,
            33 => CtrlLong,
            34 => CtrlDouble,
            other => return Err(ProtocolError::UnknownCode(other)),
        })
    }

    pub fn to_wire(self) -> u16 {
        use DbrType::*;
        match self {
            String => 0,
            Int => 1,
            Float => 2,
            Enum => 3,
            Char => 4,
            Long => 5,
            Double => 6,
            StsString => 7,
            StsInt => 8,
            StsFloat => 9,
            StsEnum => 10,
            StsChar => 11,
            StsLong => 12,
            StsDouble => 13,
            TimeString => 14,
            TimeInt => 15,
            TimeFloat => 16,
            TimeEnum => 17,
            TimeChar => 18,
            TimeLong => 19,
            TimeDouble => 20,
            GrString => 21,
            GrInt => 22,
            GrFloat => 23,
            GrEnum => 24,
            GrChar => 25,
            GrLong => 26,
            GrDouble => 27,
            CtrlString => 28,
            CtrlInt => 29,
            CtrlFloat => 30,
            CtrlEnum => 31,
            CtrlChar => 32,
            CtrlLong => 33,
            CtrlDouble => 34,
        }
    }

    /// Wire size in bytes of a single element of the base type (the value
    /// array element; qualifier metadata is not included).
    pub fn element_size(self) -> usize {
        use DbrType::*;
        match self {
            String | StsString | TimeString | GrString | CtrlString => MAX_STRING_SIZE,
            Int | StsInt | TimeInt | GrInt | CtrlInt => 2,
            Float | StsFloat | TimeFloat | GrFloat | CtrlFloat => 4,
            Enum | StsEnum | TimeEnum | GrEnum | CtrlEnum => 2,
            Char | StsChar | TimeChar | GrChar | CtrlChar => 1,
            Long | StsLong | TimeLong | GrLong | CtrlLong => 4,
            Double | StsDouble | TimeDouble | GrDouble | CtrlDouble => 8,
        }
    }

    /// Size in bytes of `count` elements of this type, not including any
    /// qualifier metadata or payload padding.
    pub fn value_size(self, count: u32) -> usize {
        self.element_size() * count as usize
    }

    /// Whether this type's base element is a DBR_STRING (§4.F payload
    /// handling: scalar string writes are NUL-terminated and bounded by
    /// `MAX_STRING_SIZE` rather than taken verbatim).
    pub fn is_string(self) -> bool {
        use DbrType::*;
        matches!(self, String | StsString | TimeString | GrString | CtrlString)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_every_variant() {
        for code in 0..=34u16 {
            let ty = DbrType::from_wire(code).unwrap();
            assert_eq!(ty.to_wire(), code);
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(matches!(
            DbrType::from_wire(35),
            Err(ProtocolError::UnknownCode(35))
        ));
    }

    #[test]
    fn element_sizes_match_dbr_family() {
        assert_eq!(DbrType::Char.element_size(), 1);
        assert_eq!(DbrType::Int.element_size(), 2);
        assert_eq!(DbrType::Enum.element_size(), 2);
        assert_eq!(DbrType::Long.element_size(), 4);
        assert_eq!(DbrType::Float.element_size(), 4);
        assert_eq!(DbrType::Double.element_size(), 8);
        assert_eq!(DbrType::String.element_size(), MAX_STRING_SIZE);
        assert_eq!(DbrType::CtrlDouble.element_size(), 8);
    }

    #[test]
    fn value_size_scales_with_count() {
        assert_eq!(DbrType::Double.value_size(10), 80);
        assert_eq!(DbrType::Char.value_size(0), 0);
    }

    #[test]
    fn is_string_covers_every_string_qualifier() {
        assert!(DbrType::String.is_string());
        assert!(DbrType::StsString.is_string());
        assert!(DbrType::TimeString.is_string());
        assert!(DbrType::GrString.is_string());
        assert!(DbrType::CtrlString.is_string());
        assert!(!DbrType::Char.is_string());
        assert!(!DbrType::Double.is_string());
    }
}
