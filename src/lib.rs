//! A library for copying object files with selective modifications.
//!
//! Use the [`Copier`] struct to read a file, or the top-level [`copy`]
//! function to handle archives as well. The transformations are
//! described by an [`Options`] struct: stripping or renaming sections,
//! filtering, renaming and re-scoping symbols, dropping relocations,
//! adjusting addresses, filling gaps between sections, and merging GNU
//! build attribute notes.
//!
//! The output is produced through the `object` crate's writer, which
//! emits relocatable objects; planned section addresses are used for
//! layout decisions such as gap filling and are applied only where the
//! output format records them.
//!
//! # Example
//! ```no_run
//! use object_copy::{Options, StripKind};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let mut options = Options::default();
//!   options.strip = StripKind::Debug;
//!   options.strip_symbols.insert(b"internal_helper".to_vec());
//!
//!   let input = std::fs::read("path/to/input")?;
//!   let output = object_copy::copy(&input, &options)?;
//!   std::fs::write("path/to/output", output.data)?;
//!   Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod error;
pub use error::{Error, ErrorKind, Result};

mod config;
pub use config::{
    AddedSymbol, AddressChange, DiscardKind, Interleave, NameSet, Options, RenameMap,
    SectionFlagSet, SectionRules, StripKind, SymbolAttrs,
};

mod archive;
mod contents;
mod copier;
mod fill;
mod flavour;
mod notes;
mod relocs;
mod sections;
mod symbols;

pub use copier::{copy, Copier, CopyOutput};
