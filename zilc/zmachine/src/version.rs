//! Story-file versions and their layout parameters.
//!
//! Every version-dependent constant in the compiler funnels through
//! [`ZVersion`] so the rest of the code never tests raw version numbers.

use core::fmt;
use core::str::FromStr;

/// A Z-machine story-file version. Versions 1 and 2 are museum pieces and
/// are not supported as targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ZVersion {
    /// "ZIP": the classic 128K format used by most Infocom releases.
    V3,
    /// "EZIP": 256K, 48 attributes, longer properties.
    V4,
    /// "XZIP": extended opcodes, colour, aread.
    V5,
    /// "YZIP": graphics-capable; packed addresses use header offsets.
    V6,
    /// V5 semantics with V6-style packed-address offsets.
    V7,
    /// V5 semantics with 8-byte routine alignment, up to 512K.
    V8,
}

impl ZVersion {
    /// Build from the header byte value.
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            5 => Some(Self::V5),
            6 => Some(Self::V6),
            7 => Some(Self::V7),
            8 => Some(Self::V8),
            _ => None,
        }
    }

    /// The value stored in header byte 0.
    pub fn number(self) -> u8 {
        match self {
            Self::V3 => 3,
            Self::V4 => 4,
            Self::V5 => 5,
            Self::V6 => 6,
            Self::V7 => 7,
            Self::V8 => 8,
        }
    }

    /// Packed-address divisor for routines and strings.
    pub fn packed_divisor(self) -> u32 {
        match self {
            Self::V3 => 2,
            Self::V4 | Self::V5 | Self::V6 | Self::V7 => 4,
            Self::V8 => 8,
        }
    }

    /// Whether packed addresses are biased by the routine/string offset
    /// words at header 0x28/0x2A.
    pub fn uses_packed_offsets(self) -> bool {
        matches!(self, Self::V6 | Self::V7)
    }

    /// Alignment required for the start of every routine.
    pub fn routine_align(self) -> u32 {
        self.packed_divisor()
    }

    /// Divisor for the file-length word at header 0x1A.
    pub fn length_divisor(self) -> u32 {
        match self {
            Self::V3 => 2,
            Self::V4 | Self::V5 => 4,
            Self::V6 | Self::V7 | Self::V8 => 8,
        }
    }

    /// Maximum size of the story file in bytes.
    pub fn max_file_size(self) -> u32 {
        match self {
            Self::V3 => 128 * 1024,
            Self::V4 | Self::V5 => 256 * 1024,
            Self::V6 | Self::V7 | Self::V8 => 512 * 1024,
        }
    }

    /// Highest legal object number.
    pub fn max_objects(self) -> u32 {
        match self {
            Self::V3 => 255,
            _ => 65535,
        }
    }

    /// Number of attribute (flag) bits per object.
    pub fn attr_count(self) -> u16 {
        match self {
            Self::V3 => 32,
            _ => 48,
        }
    }

    /// Attribute bytes in an object-table entry.
    pub fn attr_bytes(self) -> usize {
        self.attr_count() as usize / 8
    }

    /// Highest legal property number. Property 0 terminates a table.
    pub fn max_property(self) -> u8 {
        match self {
            Self::V3 => 31,
            _ => 63,
        }
    }

    /// Longest legal property value in bytes.
    pub fn max_prop_len(self) -> usize {
        match self {
            Self::V3 => 8,
            _ => 64,
        }
    }

    /// Size of one object-table entry in bytes.
    pub fn obj_entry_size(self) -> usize {
        match self {
            Self::V3 => 9,
            _ => 14,
        }
    }

    /// Whether parent/sibling/child links are single bytes.
    pub fn obj_link_is_byte(self) -> bool {
        self == Self::V3
    }

    /// Maximum required+optional parameters a routine may declare.
    pub fn max_call_args(self) -> usize {
        match self {
            Self::V3 => 3,
            _ => 7,
        }
    }

    /// Number of Z-characters in an encoded dictionary word.
    pub fn dict_word_zchars(self) -> usize {
        match self {
            Self::V3 => 6,
            _ => 9,
        }
    }

    /// Encoded-text bytes per dictionary entry.
    pub fn dict_text_bytes(self) -> usize {
        self.dict_word_zchars() / 3 * 2
    }

    /// Whether the EXT opcode page (0xBE prefix) exists.
    pub fn has_extended_opcodes(self) -> bool {
        self >= Self::V5
    }
}

impl fmt::Display for ZVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "V{}", self.number())
    }
}

impl FromStr for ZVersion {
    type Err = String;

    /// Accepts a bare number or the historical ZIP-family names.
    fn from_str(s: &str) -> Result<Self, String> {
        let v = match s.to_ascii_uppercase().as_str() {
            "3" | "ZIP" => Self::V3,
            "4" | "EZIP" => Self::V4,
            "5" | "XZIP" => Self::V5,
            "6" | "YZIP" => Self::V6,
            "7" => Self::V7,
            "8" => Self::V8,
            _ => return Err(format!("unknown Z-machine version `{s}`")),
        };
        Ok(v)
    }
}

/// The maximum number of locals any routine may use, in every version.
pub const MAX_LOCALS: usize = 15;

/// Number of global-variable slots, starting at variable number 16.
pub const GLOBAL_SLOTS: usize = 240;

/// Variable number of the first global.
pub const FIRST_GLOBAL_VAR: u8 = 16;

/// Capacity of the abbreviations table.
pub const MAX_ABBREVS: usize = 96;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing_parameters() {
        assert_eq!(ZVersion::V3.packed_divisor(), 2);
        assert_eq!(ZVersion::V5.packed_divisor(), 4);
        assert_eq!(ZVersion::V8.packed_divisor(), 8);
        assert!(ZVersion::V7.uses_packed_offsets());
        assert!(!ZVersion::V8.uses_packed_offsets());
    }

    #[test]
    fn version_names() {
        assert_eq!("zip".parse::<ZVersion>().unwrap(), ZVersion::V3);
        assert_eq!("EZIP".parse::<ZVersion>().unwrap(), ZVersion::V4);
        assert_eq!("5".parse::<ZVersion>().unwrap(), ZVersion::V5);
        assert!("9".parse::<ZVersion>().is_err());
    }

    #[test]
    fn object_model_limits() {
        assert_eq!(ZVersion::V3.obj_entry_size(), 9);
        assert_eq!(ZVersion::V4.obj_entry_size(), 14);
        assert_eq!(ZVersion::V3.dict_text_bytes(), 4);
        assert_eq!(ZVersion::V5.dict_text_bytes(), 6);
    }
}
