// src/dependencies/classes.rs

//! Dependency class definitions
//!
//! Each class has a stable numeric tag used in frozen dependency sets and in
//! the store's `Dependencies.class` column, and a name used in text form.

use std::fmt;

/// Whether atoms of a class carry flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagPolicy {
    NoFlags,
    HasFlags,
    OptionalFlags,
}

/// Dependency classes
///
/// Unknown numeric tags coming from newer peers are kept as `Other` so
/// frozen sets round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepClass {
    /// ABI tags, e.g. `abi: ELF32(SysV x86)`
    Abi,
    /// Instruction set, e.g. `is: x86_64(sse2 cmov)`
    InstructionSet,
    /// Legacy soname class kept for old troves
    OldSoname,
    /// A file that must exist, e.g. `file: /usr/bin/python`
    File,
    /// Another trove, e.g. `trove: glibc:runtime`
    Trove,
    /// Build-time use flags, a single atom holding only flags
    Use,
    /// Shared library, e.g. `soname: ELF64/libc.so.6(GLIBC_2.4 x86_64)`
    Soname,
    UserInfo,
    GroupInfo,
    Cil,
    Java,
    Python,
    Perl,
    Ruby,
    Php,
    Other(u8),
}

impl DepClass {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Abi => 0,
            Self::InstructionSet => 1,
            Self::OldSoname => 2,
            Self::File => 3,
            Self::Trove => 4,
            Self::Use => 5,
            Self::Soname => 6,
            Self::UserInfo => 7,
            Self::GroupInfo => 8,
            Self::Cil => 9,
            Self::Java => 10,
            Self::Python => 11,
            Self::Perl => 12,
            Self::Ruby => 13,
            Self::Php => 14,
            Self::Other(tag) => *tag,
        }
    }

    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Self::Abi,
            1 => Self::InstructionSet,
            2 => Self::OldSoname,
            3 => Self::File,
            4 => Self::Trove,
            5 => Self::Use,
            6 => Self::Soname,
            7 => Self::UserInfo,
            8 => Self::GroupInfo,
            9 => Self::Cil,
            10 => Self::Java,
            11 => Self::Python,
            12 => Self::Perl,
            13 => Self::Ruby,
            14 => Self::Php,
            other => Self::Other(other),
        }
    }

    /// Name used in the text form (`trove: foo`)
    pub fn name(&self) -> String {
        let name = match self {
            Self::Abi => "abi",
            Self::InstructionSet => "is",
            Self::OldSoname => "oldsoname",
            Self::File => "file",
            Self::Trove => "trove",
            Self::Use => "use",
            Self::Soname => "soname",
            Self::UserInfo => "userinfo",
            Self::GroupInfo => "groupinfo",
            Self::Cil => "CIL",
            Self::Java => "java",
            Self::Python => "python",
            Self::Perl => "perl",
            Self::Ruby => "ruby",
            Self::Php => "php",
            Self::Other(tag) => return format!("class{}", tag),
        };
        name.to_string()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let class = match name {
            "abi" => Self::Abi,
            "is" => Self::InstructionSet,
            "oldsoname" => Self::OldSoname,
            "file" => Self::File,
            "trove" => Self::Trove,
            "use" => Self::Use,
            "soname" => Self::Soname,
            "userinfo" => Self::UserInfo,
            "groupinfo" => Self::GroupInfo,
            "CIL" | "cil" => Self::Cil,
            "java" => Self::Java,
            "python" => Self::Python,
            "perl" => Self::Perl,
            "ruby" => Self::Ruby,
            "php" => Self::Php,
            other => {
                let tag = other.strip_prefix("class")?.parse::<u8>().ok()?;
                Self::from_tag(tag)
            }
        };
        Some(class)
    }

    pub fn flag_policy(&self) -> FlagPolicy {
        match self {
            Self::File | Self::UserInfo | Self::GroupInfo => FlagPolicy::NoFlags,
            Self::Abi | Self::Soname | Self::OldSoname => FlagPolicy::HasFlags,
            _ => FlagPolicy::OptionalFlags,
        }
    }

    /// Classes holding exactly one atom, whose name carries no meaning
    pub fn just_one(&self) -> bool {
        matches!(self, Self::Use)
    }

    /// Whether a missing atom name on the providing side disqualifies a match
    pub fn name_significant(&self) -> bool {
        !self.just_one()
    }

    /// Every known class, in tag order
    pub fn all() -> &'static [DepClass] {
        &[
            Self::Abi,
            Self::InstructionSet,
            Self::OldSoname,
            Self::File,
            Self::Trove,
            Self::Use,
            Self::Soname,
            Self::UserInfo,
            Self::GroupInfo,
            Self::Cil,
            Self::Java,
            Self::Python,
            Self::Perl,
            Self::Ruby,
            Self::Php,
        ]
    }
}

impl fmt::Display for DepClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_roundtrip() {
        for class in DepClass::all() {
            assert_eq!(DepClass::from_tag(class.tag()), *class);
            assert_eq!(DepClass::from_name(&class.name()), Some(*class));
        }
        assert_eq!(DepClass::from_tag(99), DepClass::Other(99));
        assert_eq!(DepClass::from_name("class99"), Some(DepClass::Other(99)));
        assert_eq!(DepClass::from_name("bogus"), None);
    }

    #[test]
    fn test_class_properties() {
        assert!(DepClass::Use.just_one());
        assert!(!DepClass::Use.name_significant());
        assert!(DepClass::InstructionSet.name_significant());
        assert_eq!(DepClass::File.flag_policy(), FlagPolicy::NoFlags);
        assert_eq!(DepClass::Soname.flag_policy(), FlagPolicy::HasFlags);
    }
}
