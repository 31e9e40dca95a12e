use std::collections::{HashMap, HashSet};

use object::BinaryFormat;

use super::{Error, Result};

/// Which classes of symbols and sections are stripped from the output.
///
/// The variants are mutually exclusive; combining strip policies is the
/// job of the pattern sets in [`Options`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StripKind {
    /// Keep everything.
    #[default]
    None,
    /// Strip debugging sections and debugging symbols.
    Debug,
    /// Strip everything not needed by relocation processing.
    Unneeded,
    /// Strip all symbols.
    All,
    /// Keep only debugging sections; demote the rest to content-free
    /// placeholders.
    NonDebug,
    /// Strip split-DWARF (`.dwo`) sections.
    Dwo,
    /// Keep only split-DWARF (`.dwo`) sections.
    NonDwo,
}

/// Which local symbols are discarded from the output.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DiscardKind {
    /// Keep all locals.
    #[default]
    None,
    /// Discard local symbols that match the format's local label
    /// convention (e.g. `.L` on ELF).
    Locals,
    /// Discard all local symbols.
    All,
}

/// True if `name` contains glob metacharacters.
fn has_wildcards(name: &[u8]) -> bool {
    name.iter().any(|&b| matches!(b, b'*' | b'?' | b'[' | b'\\'))
}

/// Match `name` against a glob pattern supporting `*`, `?`, `[...]`
/// (with `!` or `^` negation) and `\` escapes.
fn wild_match(pattern: &[u8], name: &[u8]) -> bool {
    let mut p = 0;
    let mut n = 0;
    let mut star_p = usize::MAX;
    let mut star_n = 0;
    while n < name.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star_p = p;
                    star_n = n;
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    n += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = match_class(pattern, p, name[n]) {
                        if matched {
                            p = next;
                            n += 1;
                            continue;
                        }
                    } else if pattern[p] == name[n] {
                        // Unterminated class matches a literal '['.
                        p += 1;
                        n += 1;
                        continue;
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == name[n] {
                        p += 2;
                        n += 1;
                        continue;
                    }
                }
                c => {
                    if c == name[n] {
                        p += 1;
                        n += 1;
                        continue;
                    }
                }
            }
        }
        if star_p != usize::MAX {
            star_n += 1;
            n = star_n;
            p = star_p + 1;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

/// Match one byte against the character class starting at `pattern[start]`.
///
/// Returns the match result and the index just past the closing `]`, or
/// `None` if the class is unterminated.
fn match_class(pattern: &[u8], start: usize, byte: u8) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = matches!(pattern.get(i), Some(b'!') | Some(b'^'));
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        let c = pattern[i];
        if c == b']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;
        if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
            if c <= byte && byte <= pattern[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if c == byte {
                matched = true;
            }
            i += 1;
        }
    }
    None
}

#[derive(Debug, Clone)]
struct Pattern {
    bytes: Vec<u8>,
    negated: bool,
}

/// A set of symbol names, with optional glob patterns.
///
/// Exact names are stored in a hash set; when wildcards are enabled,
/// names containing metacharacters become ordered patterns. A pattern
/// starting with `!` vetoes an otherwise-matching name.
#[derive(Debug, Default, Clone)]
pub struct NameSet {
    exact: HashSet<Vec<u8>>,
    patterns: Vec<Pattern>,
    wildcard: bool,
}

impl NameSet {
    /// Enable glob patterns for names inserted after this call.
    pub fn enable_wildcards(&mut self) {
        self.wildcard = true;
    }

    /// Add a name (or, with wildcards enabled, a pattern) to the set.
    pub fn insert(&mut self, name: impl Into<Vec<u8>>) {
        let name = name.into();
        if self.wildcard {
            let (negated, bytes) = match name.split_first() {
                Some((b'!', rest)) => (true, rest.to_vec()),
                _ => (false, name),
            };
            if negated || has_wildcards(&bytes) {
                self.patterns.push(Pattern { bytes, negated });
                return;
            }
            self.exact.insert(bytes);
        } else {
            self.exact.insert(name);
        }
    }

    /// Returns true if the set has no entries.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }

    /// Returns true if `name` is in the set and not vetoed.
    pub fn matches(&self, name: &[u8]) -> bool {
        let mut found = self.exact.contains(name);
        for pattern in &self.patterns {
            if wild_match(&pattern.bytes, name) {
                if pattern.negated {
                    return false;
                }
                found = true;
            }
        }
        found
    }
}

/// A bijective old-name to new-name table.
///
/// No two sources may map to the same target; conflicts are rejected when
/// the rule is added, before any symbol or section is processed. Exact
/// entries win over pattern entries.
#[derive(Debug, Default, Clone)]
pub struct RenameMap {
    exact: HashMap<Vec<u8>, Vec<u8>>,
    patterns: Vec<(Vec<u8>, Vec<u8>)>,
    targets: HashSet<Vec<u8>>,
    wildcard: bool,
}

impl RenameMap {
    /// Enable glob patterns for sources inserted after this call.
    pub fn enable_wildcards(&mut self) {
        self.wildcard = true;
    }

    /// Add a rename rule from `old` to `new`.
    pub fn insert(&mut self, old: impl Into<Vec<u8>>, new: impl Into<Vec<u8>>) -> Result<()> {
        let old = old.into();
        let new = new.into();
        if !self.targets.insert(new.clone()) {
            return Err(Error::config(format!(
                "multiple renames to '{}'",
                String::from_utf8_lossy(&new)
            )));
        }
        if self.wildcard && has_wildcards(&old) {
            self.patterns.push((old, new));
            return Ok(());
        }
        if self.exact.insert(old.clone(), new).is_some() {
            return Err(Error::config(format!(
                "multiple renames of '{}'",
                String::from_utf8_lossy(&old)
            )));
        }
        Ok(())
    }

    /// Returns true if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }

    /// Look up the new name for `name`, if any.
    pub fn get(&self, name: &[u8]) -> Option<&[u8]> {
        if let Some(new) = self.exact.get(name) {
            return Some(new.as_slice());
        }
        self.patterns
            .iter()
            .find(|(pattern, _)| wild_match(pattern, name))
            .map(|(_, new)| new.as_slice())
    }
}

/// How a section address is changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressChange {
    /// Replace the address.
    Set(u64),
    /// Add a signed delta to the address.
    Adjust(i64),
}

impl AddressChange {
    pub(crate) fn apply(self, address: u64) -> u64 {
        match self {
            AddressChange::Set(value) => value,
            AddressChange::Adjust(delta) => address.wrapping_add(delta as u64),
        }
    }
}

bitflags::bitflags! {
    /// Section flags used by flag-override rules and added symbols.
    ///
    /// These are format-independent; the planner translates them to the
    /// output format's representation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SectionFlagSet: u32 {
        /// The section is allocated in memory.
        const ALLOC = 1 << 0;
        /// The section is loaded from the file.
        const LOAD = 1 << 1;
        /// The section is read-only.
        const READONLY = 1 << 2;
        /// The section contains executable code.
        const CODE = 1 << 3;
        /// The section contains data.
        const DATA = 1 << 4;
        /// The section resides in read-only memory.
        const ROM = 1 << 5;
        /// The section is excluded from linked output.
        const EXCLUDE = 1 << 6;
        /// The section is shared between processes.
        const SHARE = 1 << 7;
        /// The section has contents in the file.
        const CONTENTS = 1 << 8;
        /// The section contents can be merged.
        const MERGE = 1 << 9;
        /// The section contains NUL-terminated strings.
        const STRINGS = 1 << 10;
        /// The section holds debugging information.
        const DEBUG = 1 << 11;
        /// The section occupies no file space when loaded.
        const NOLOAD = 1 << 12;
    }
}

impl SectionFlagSet {
    /// Parse a comma-separated flag list such as `alloc,load,readonly`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut flags = SectionFlagSet::empty();
        for word in text.split(',') {
            let word = word.trim();
            if word.is_empty() {
                continue;
            }
            flags |= match word {
                "alloc" => SectionFlagSet::ALLOC,
                "load" => SectionFlagSet::LOAD,
                "readonly" => SectionFlagSet::READONLY,
                "code" => SectionFlagSet::CODE,
                "data" => SectionFlagSet::DATA,
                "rom" => SectionFlagSet::ROM,
                "exclude" => SectionFlagSet::EXCLUDE,
                "share" => SectionFlagSet::SHARE,
                "contents" => SectionFlagSet::CONTENTS,
                "merge" => SectionFlagSet::MERGE,
                "strings" => SectionFlagSet::STRINGS,
                "debug" => SectionFlagSet::DEBUG,
                "noload" => SectionFlagSet::NOLOAD,
                _ => {
                    return Err(Error::config(format!("unrecognized section flag '{}'", word)));
                }
            };
        }
        Ok(flags)
    }
}

#[derive(Debug, Default, Clone)]
struct SectionRule {
    name: Vec<u8>,
    remove: bool,
    copy: bool,
    flags: Option<SectionFlagSet>,
    vma: Option<AddressChange>,
    lma: Option<AddressChange>,
    remove_relocations: bool,
}

/// Per-section rules: removal, copying, flag overrides, address changes
/// and relocation removal.
///
/// Rules are keyed by section name (or pattern, with wildcards enabled).
/// Conflicting rules for one name are rejected when they are added.
#[derive(Debug, Default, Clone)]
pub struct SectionRules {
    rules: Vec<SectionRule>,
    wildcard: bool,
}

impl SectionRules {
    /// Enable glob patterns for rule names.
    pub fn enable_wildcards(&mut self) {
        self.wildcard = true;
    }

    fn rule_mut(&mut self, name: &[u8]) -> &mut SectionRule {
        if let Some(index) = self.rules.iter().position(|rule| rule.name == name) {
            return &mut self.rules[index];
        }
        self.rules.push(SectionRule {
            name: name.to_vec(),
            ..SectionRule::default()
        });
        self.rules.last_mut().unwrap()
    }

    /// Mark sections matching `name` for removal.
    pub fn remove(&mut self, name: &[u8]) -> Result<()> {
        let rule = self.rule_mut(name);
        if rule.copy {
            return Err(Error::config(format!(
                "both copy and remove for section '{}'",
                String::from_utf8_lossy(name)
            )));
        }
        rule.remove = true;
        Ok(())
    }

    /// Restrict the output to sections matching copy rules.
    pub fn copy(&mut self, name: &[u8]) -> Result<()> {
        let rule = self.rule_mut(name);
        if rule.remove {
            return Err(Error::config(format!(
                "both copy and remove for section '{}'",
                String::from_utf8_lossy(name)
            )));
        }
        rule.copy = true;
        Ok(())
    }

    /// Replace the flags of sections matching `name`.
    pub fn set_flags(&mut self, name: &[u8], flags: SectionFlagSet) -> Result<()> {
        let rule = self.rule_mut(name);
        if rule.flags.is_some() {
            return Err(Error::config(format!(
                "multiple flag overrides for section '{}'",
                String::from_utf8_lossy(name)
            )));
        }
        rule.flags = Some(flags);
        Ok(())
    }

    /// Change the VMA of sections matching `name`.
    ///
    /// Setting and adjusting the same name's VMA is a configuration error.
    pub fn change_vma(&mut self, name: &[u8], change: AddressChange) -> Result<()> {
        let rule = self.rule_mut(name);
        if let Some(existing) = rule.vma {
            if std::mem::discriminant(&existing) != std::mem::discriminant(&change) {
                return Err(Error::config(format!(
                    "cannot both set and adjust the VMA of section '{}'",
                    String::from_utf8_lossy(name)
                )));
            }
        }
        rule.vma = Some(change);
        Ok(())
    }

    /// Change the LMA of sections matching `name`.
    ///
    /// Setting and adjusting the same name's LMA is a configuration error.
    pub fn change_lma(&mut self, name: &[u8], change: AddressChange) -> Result<()> {
        let rule = self.rule_mut(name);
        if let Some(existing) = rule.lma {
            if std::mem::discriminant(&existing) != std::mem::discriminant(&change) {
                return Err(Error::config(format!(
                    "cannot both set and adjust the LMA of section '{}'",
                    String::from_utf8_lossy(name)
                )));
            }
        }
        rule.lma = Some(change);
        Ok(())
    }

    /// Drop the relocations of sections matching `name`.
    pub fn remove_relocations(&mut self, name: &[u8]) {
        self.rule_mut(name).remove_relocations = true;
    }

    fn matches(&self, rule: &SectionRule, name: &[u8]) -> bool {
        rule.name == name || (self.wildcard && wild_match(&rule.name, name))
    }

    /// Returns true if the section is excluded from the output.
    ///
    /// A section is excluded if a remove rule matches and no copy rule
    /// does, or if copy rules exist and none of them matches.
    pub fn is_removed(&self, name: &[u8]) -> bool {
        let mut removed = false;
        let mut copied = false;
        let mut any_copy = false;
        for rule in &self.rules {
            any_copy |= rule.copy;
            if self.matches(rule, name) {
                removed |= rule.remove;
                copied |= rule.copy;
            }
        }
        (removed || any_copy) && !copied
    }

    /// Look up the first matching rule value, preferring exact names.
    fn find<T>(&self, name: &[u8], get: impl Fn(&SectionRule) -> Option<T>) -> Option<T> {
        for rule in &self.rules {
            if rule.name == name {
                if let Some(value) = get(rule) {
                    return Some(value);
                }
            }
        }
        for rule in &self.rules {
            if rule.name != name && self.matches(rule, name) {
                if let Some(value) = get(rule) {
                    return Some(value);
                }
            }
        }
        None
    }

    /// The flag override for `name`, if any.
    pub fn flags(&self, name: &[u8]) -> Option<SectionFlagSet> {
        self.find(name, |rule| rule.flags)
    }

    /// The VMA change for `name`, if any.
    pub fn vma(&self, name: &[u8]) -> Option<AddressChange> {
        self.find(name, |rule| rule.vma)
    }

    /// The LMA change for `name`, if any.
    pub fn lma(&self, name: &[u8]) -> Option<AddressChange> {
        self.find(name, |rule| rule.lma)
    }

    /// Returns true if relocations are removed for `name`.
    pub fn relocations_removed(&self, name: &[u8]) -> bool {
        self.find(name, |rule| rule.remove_relocations.then_some(()))
            .is_some()
    }
}

bitflags::bitflags! {
    /// Attributes for synthetic symbols.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SymbolAttrs: u32 {
        /// Global binding.
        const GLOBAL = 1 << 0;
        /// Local binding.
        const LOCAL = 1 << 1;
        /// Weak binding.
        const WEAK = 1 << 2;
        /// Function symbol.
        const FUNCTION = 1 << 3;
        /// Data object symbol.
        const OBJECT = 1 << 4;
        /// File symbol.
        const FILE = 1 << 5;
        /// Section symbol.
        const SECTION = 1 << 6;
        /// Debugging symbol.
        const DEBUG = 1 << 7;
        /// Hidden visibility.
        const HIDDEN = 1 << 8;
    }
}

impl SymbolAttrs {
    /// Parse a comma-separated attribute list such as `global,function`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut attrs = SymbolAttrs::empty();
        for word in text.split(',') {
            let word = word.trim();
            if word.is_empty() {
                continue;
            }
            attrs |= match word {
                "global" => SymbolAttrs::GLOBAL,
                "local" => SymbolAttrs::LOCAL,
                "weak" => SymbolAttrs::WEAK,
                "function" => SymbolAttrs::FUNCTION,
                "object" => SymbolAttrs::OBJECT,
                "file" => SymbolAttrs::FILE,
                "section" => SymbolAttrs::SECTION,
                "debug" => SymbolAttrs::DEBUG,
                "hidden" => SymbolAttrs::HIDDEN,
                _ => {
                    return Err(Error::config(format!(
                        "unrecognized symbol flag '{}'",
                        word
                    )));
                }
            };
        }
        Ok(attrs)
    }
}

/// A synthetic symbol to add to the output.
#[derive(Debug, Clone)]
pub struct AddedSymbol {
    /// Symbol name.
    pub name: Vec<u8>,
    /// Name of the output section the symbol is defined in, or `None`
    /// for an absolute symbol.
    pub section: Option<Vec<u8>>,
    /// Symbol value.
    pub value: u64,
    /// Symbol attributes.
    pub attrs: SymbolAttrs,
    /// Insert the symbol immediately before the named symbol instead of
    /// appending it. An anchor that never matches is a fatal error.
    pub before: Option<Vec<u8>>,
}

/// Byte-interleave extraction parameters.
#[derive(Debug, Clone, Copy)]
pub struct Interleave {
    /// Keep `width` bytes out of every `stride`.
    pub stride: u64,
    /// Number of consecutive bytes to keep.
    pub width: u64,
    /// Offset of the first kept byte within the stride.
    pub offset: u64,
}

impl Interleave {
    /// Create interleave parameters, validating them.
    pub fn new(stride: u64, width: u64, offset: u64) -> Result<Self> {
        if stride == 0 || width == 0 {
            return Err(Error::config("interleave stride and width must be non-zero"));
        }
        if width > stride {
            return Err(Error::config(
                "interleave width must not exceed the stride",
            ));
        }
        if offset >= stride {
            return Err(Error::config(
                "interleave start byte must be within the stride",
            ));
        }
        Ok(Interleave {
            stride,
            width,
            offset,
        })
    }
}

/// Options for copying a file.
///
/// This is used as an argument to the [`Copier::copy`](crate::Copier::copy)
/// method. The options are listed in the order they are processed.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct Options {
    /// The strip policy.
    pub strip: StripKind,
    /// The local symbol discard policy.
    pub discard: DiscardKind,
    /// Debugging information is being converted elsewhere; debug symbols
    /// are not copied.
    pub convert_debugging: bool,
    /// Keep only the symbol table entry points; section contents are
    /// emptied.
    pub extract_symbol: bool,
    /// Merge GNU build attribute notes.
    pub merge_notes: bool,
    /// Keep file symbols even when stripping.
    pub keep_file_symbols: bool,

    /// Per-section rules.
    pub sections: SectionRules,
    /// Section rename table.
    pub rename_sections: RenameMap,
    /// Prefix prepended to every output section name.
    pub prefix_sections: Vec<u8>,
    /// Default delta added to every section address not covered by a
    /// per-section rule.
    pub change_addresses: i64,

    /// Symbols to strip.
    pub strip_symbols: NameSet,
    /// Symbols to strip when not needed by relocations.
    pub strip_unneeded_symbols: NameSet,
    /// Symbols to keep regardless of strip policies.
    pub keep_symbols: NameSet,
    /// Symbols to make local.
    pub localize_symbols: NameSet,
    /// Symbols to make global.
    pub globalize_symbols: NameSet,
    /// If non-empty, only these symbols stay global.
    pub keep_global_symbols: NameSet,
    /// Symbols to weaken.
    pub weaken_symbols: NameSet,
    /// Weaken all global symbols.
    pub weaken: bool,
    /// Make hidden and internal symbols local.
    pub localize_hidden: bool,
    /// Symbol rename table.
    pub rename_symbols: RenameMap,
    /// Prefix prepended to every output symbol name.
    pub prefix_symbols: Vec<u8>,
    /// Remove the format's leading character from symbol names.
    pub remove_leading_char: bool,
    /// Insert the output format's leading character convention.
    pub change_leading_char: bool,
    /// Synthetic symbols to add.
    pub add_symbols: Vec<AddedSymbol>,

    /// Byte-interleave extraction.
    pub interleave: Option<Interleave>,
    /// Reverse bytes within groups of this size.
    pub reverse_bytes: Option<u64>,
    /// Fill gaps between loadable sections with this byte.
    pub gap_fill: Option<u8>,
    /// Pad the last loadable section up to this address.
    pub pad_to: Option<u64>,

    /// Force the output format instead of matching the input.
    pub output_format: Option<BinaryFormat>,
}

impl Options {
    /// Enable glob patterns in all pattern sets and rule tables.
    pub fn enable_wildcards(&mut self) {
        self.sections.enable_wildcards();
        self.rename_sections.enable_wildcards();
        self.strip_symbols.enable_wildcards();
        self.strip_unneeded_symbols.enable_wildcards();
        self.keep_symbols.enable_wildcards();
        self.localize_symbols.enable_wildcards();
        self.globalize_symbols.enable_wildcards();
        self.keep_global_symbols.enable_wildcards();
        self.weaken_symbols.enable_wildcards();
        self.rename_symbols.enable_wildcards();
    }
}
