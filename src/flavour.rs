use object::{BinaryFormat, ObjectKind};

/// The object-file family of an image.
///
/// The set of flavours is closed: it mirrors the formats the object model
/// provider can open. Format-specific conventions live here so that the
/// pipeline stages only branch through this interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flavour {
    Elf,
    Coff,
    MachO,
    Other,
}

impl Flavour {
    pub(crate) fn from_format(format: BinaryFormat) -> Self {
        match format {
            BinaryFormat::Elf => Flavour::Elf,
            BinaryFormat::Coff | BinaryFormat::Pe => Flavour::Coff,
            BinaryFormat::MachO => Flavour::MachO,
            _ => Flavour::Other,
        }
    }

    /// The character prepended to symbol names by the format's compiler
    /// convention, if any.
    pub(crate) fn leading_char(self) -> Option<u8> {
        match self {
            Flavour::MachO | Flavour::Coff => Some(b'_'),
            Flavour::Elf | Flavour::Other => None,
        }
    }

    /// The prefix of compiler-generated local labels.
    pub(crate) fn local_label_prefix(self) -> &'static [u8] {
        match self {
            Flavour::Elf | Flavour::Other => b".L",
            Flavour::MachO | Flavour::Coff => b"L",
        }
    }

    /// Whether symbol table indices start with a reserved null entry.
    pub(crate) fn has_null_symbol(self) -> bool {
        self == Flavour::Elf
    }
}

/// Whether this kind of object carries meaningful relocations.
///
/// Core dumps have relocation tables in some formats, but they are not
/// meaningful and are never copied.
pub(crate) fn kind_has_relocations(kind: ObjectKind) -> bool {
    kind != ObjectKind::Core
}
