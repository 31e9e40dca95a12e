use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{command, Arg, ArgAction};
use object_copy as copy;

fn main() -> Result<ExitCode> {
    let matches = command!()
        .max_term_width(100)
        .args(&[
            Arg::new("input")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("The input file"),
            Arg::new("output")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("The output file"),
            Arg::new("wildcard")
                .short('w')
                .long("wildcard")
                .action(ArgAction::SetTrue)
                .help("Allow wildcards in symbol and section names"),
            Arg::new("strip-all")
                .short('S')
                .long("strip-all")
                .action(ArgAction::SetTrue)
                .help("Remove all symbols and relocations"),
            Arg::new("strip-debug")
                .short('g')
                .long("strip-debug")
                .action(ArgAction::SetTrue)
                .help("Remove debugging sections and symbols"),
            Arg::new("strip-unneeded")
                .long("strip-unneeded")
                .action(ArgAction::SetTrue)
                .help("Remove all symbols not needed by relocations"),
            Arg::new("only-keep-debug")
                .long("only-keep-debug")
                .action(ArgAction::SetTrue)
                .help("Keep only debugging sections; demote the rest to empty placeholders"),
            Arg::new("strip-dwo")
                .long("strip-dwo")
                .action(ArgAction::SetTrue)
                .help("Remove all .dwo sections"),
            Arg::new("extract-dwo")
                .long("extract-dwo")
                .action(ArgAction::SetTrue)
                .help("Keep only .dwo sections"),
            Arg::new("discard-all")
                .short('x')
                .long("discard-all")
                .action(ArgAction::SetTrue)
                .help("Remove all local symbols"),
            Arg::new("discard-locals")
                .short('X')
                .long("discard-locals")
                .action(ArgAction::SetTrue)
                .help("Remove compiler-generated local symbols"),
            Arg::new("extract-symbol")
                .long("extract-symbol")
                .action(ArgAction::SetTrue)
                .help("Keep only the symbol table; empty every section"),
            Arg::new("merge-notes")
                .long("merge-notes")
                .action(ArgAction::SetTrue)
                .help("Merge GNU build attribute notes"),
            Arg::new("keep-file-symbols")
                .long("keep-file-symbols")
                .action(ArgAction::SetTrue)
                .help("Keep file symbols when stripping"),
            Arg::new("remove-section")
                .short('R')
                .long("remove-section")
                .value_name("name")
                .action(ArgAction::Append)
                .help("Remove the named section"),
            Arg::new("only-section")
                .short('j')
                .long("only-section")
                .value_name("name")
                .action(ArgAction::Append)
                .help("Copy only the named section"),
            Arg::new("remove-relocations")
                .long("remove-relocations")
                .value_name("name")
                .action(ArgAction::Append)
                .help("Remove the relocations of the named section"),
            Arg::new("rename-section")
                .long("rename-section")
                .value_name("old=new")
                .action(ArgAction::Append)
                .help("Change the name of a section from <old> to <new>"),
            Arg::new("set-section-flags")
                .long("set-section-flags")
                .value_name("name=flags")
                .action(ArgAction::Append)
                .help("Replace the flags of the named section"),
            Arg::new("change-section-vma")
                .long("change-section-vma")
                .value_name("name{=|+|-}val")
                .action(ArgAction::Append)
                .help("Set or adjust the VMA of the named section"),
            Arg::new("change-section-lma")
                .long("change-section-lma")
                .value_name("name{=|+|-}val")
                .action(ArgAction::Append)
                .help("Set or adjust the LMA of the named section"),
            Arg::new("change-addresses")
                .long("change-addresses")
                .value_name("incr")
                .allow_hyphen_values(true)
                .help("Add <incr> to every section address"),
            Arg::new("prefix-sections")
                .long("prefix-sections")
                .value_name("prefix")
                .help("Prepend <prefix> to every section name"),
            Arg::new("strip-symbol")
                .short('N')
                .long("strip-symbol")
                .value_name("symbol")
                .action(ArgAction::Append)
                .help("Remove the named symbol"),
            Arg::new("strip-unneeded-symbol")
                .long("strip-unneeded-symbol")
                .value_name("symbol")
                .action(ArgAction::Append)
                .help("Remove the named symbol unless needed by relocations"),
            Arg::new("keep-symbol")
                .short('K')
                .long("keep-symbol")
                .value_name("symbol")
                .action(ArgAction::Append)
                .help("Keep the named symbol regardless of strip options"),
            Arg::new("localize-symbol")
                .short('L')
                .long("localize-symbol")
                .value_name("symbol")
                .action(ArgAction::Append)
                .help("Make the named symbol local"),
            Arg::new("globalize-symbol")
                .long("globalize-symbol")
                .value_name("symbol")
                .action(ArgAction::Append)
                .help("Make the named symbol global"),
            Arg::new("keep-global-symbol")
                .short('G')
                .long("keep-global-symbol")
                .value_name("symbol")
                .action(ArgAction::Append)
                .help("Keep only the named symbol global; localize the rest"),
            Arg::new("weaken-symbol")
                .short('W')
                .long("weaken-symbol")
                .value_name("symbol")
                .action(ArgAction::Append)
                .help("Weaken the named global symbol"),
            Arg::new("weaken")
                .long("weaken")
                .action(ArgAction::SetTrue)
                .help("Weaken all global symbols"),
            Arg::new("localize-hidden")
                .long("localize-hidden")
                .action(ArgAction::SetTrue)
                .help("Make all hidden and internal symbols local"),
            Arg::new("redefine-sym")
                .long("redefine-sym")
                .value_name("old=new")
                .action(ArgAction::Append)
                .help("Change the name of a symbol from <old> to <new>"),
            Arg::new("prefix-symbols")
                .long("prefix-symbols")
                .value_name("prefix")
                .help("Prepend <prefix> to every symbol name"),
            Arg::new("remove-leading-char")
                .long("remove-leading-char")
                .action(ArgAction::SetTrue)
                .help("Remove the leading character from symbol names"),
            Arg::new("change-leading-char")
                .long("change-leading-char")
                .action(ArgAction::SetTrue)
                .help("Convert symbol names to the output format's leading-char convention"),
            Arg::new("add-symbol")
                .long("add-symbol")
                .value_name("name=[section:]value[,flags]")
                .action(ArgAction::Append)
                .help("Add a symbol; flags may include before=<symbol>"),
            Arg::new("gap-fill")
                .long("gap-fill")
                .value_name("val")
                .help("Fill gaps between loadable sections with <val>"),
            Arg::new("pad-to")
                .long("pad-to")
                .value_name("addr")
                .help("Pad the last loadable section up to <addr>"),
            Arg::new("interleave")
                .short('i')
                .long("interleave")
                .value_name("n")
                .help("Copy only one byte of every <n>"),
            Arg::new("interleave-width")
                .long("interleave-width")
                .value_name("n")
                .help("Copy <n> bytes at a time when interleaving"),
            Arg::new("byte")
                .short('b')
                .long("byte")
                .value_name("n")
                .help("Start interleaved copying at byte <n>"),
            Arg::new("reverse-bytes")
                .long("reverse-bytes")
                .value_name("n")
                .help("Reverse the bytes of every <n>-byte group"),
            Arg::new("output-target")
                .short('O')
                .long("output-target")
                .value_name("format")
                .help("Write the output in <format> (elf, coff, macho)"),
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        ])
        .get_matches();

    if matches.get_flag("verbose") {
        env_logger::builder()
            .format_level(false)
            .format_target(false)
            .filter_module("object_copy", log::LevelFilter::Debug)
            .init();
    }

    let mut options = copy::Options::default();
    if matches.get_flag("wildcard") {
        options.enable_wildcards();
    }

    options.strip = if matches.get_flag("strip-all") {
        copy::StripKind::All
    } else if matches.get_flag("strip-unneeded") {
        copy::StripKind::Unneeded
    } else if matches.get_flag("only-keep-debug") {
        copy::StripKind::NonDebug
    } else if matches.get_flag("strip-debug") {
        copy::StripKind::Debug
    } else if matches.get_flag("strip-dwo") {
        copy::StripKind::Dwo
    } else if matches.get_flag("extract-dwo") {
        copy::StripKind::NonDwo
    } else {
        copy::StripKind::None
    };
    options.discard = if matches.get_flag("discard-all") {
        copy::DiscardKind::All
    } else if matches.get_flag("discard-locals") {
        copy::DiscardKind::Locals
    } else {
        copy::DiscardKind::None
    };
    options.extract_symbol = matches.get_flag("extract-symbol");
    options.merge_notes = matches.get_flag("merge-notes");
    options.keep_file_symbols = matches.get_flag("keep-file-symbols");
    options.weaken = matches.get_flag("weaken");
    options.localize_hidden = matches.get_flag("localize-hidden");
    options.remove_leading_char = matches.get_flag("remove-leading-char");
    options.change_leading_char = matches.get_flag("change-leading-char");

    for name in matches.get_many::<String>("remove-section").unwrap_or_default() {
        options.sections.remove(name.as_bytes())?;
    }
    for name in matches.get_many::<String>("only-section").unwrap_or_default() {
        options.sections.copy(name.as_bytes())?;
    }
    for name in matches
        .get_many::<String>("remove-relocations")
        .unwrap_or_default()
    {
        options.sections.remove_relocations(name.as_bytes());
    }
    for arg in matches.get_many::<String>("rename-section").unwrap_or_default() {
        let (old, new) = split_pair(arg, "--rename-section")?;
        options.rename_sections.insert(old, new)?;
    }
    for arg in matches
        .get_many::<String>("set-section-flags")
        .unwrap_or_default()
    {
        let (name, flags) = split_pair(arg, "--set-section-flags")?;
        let flags = copy::SectionFlagSet::parse(std::str::from_utf8(&flags)?)?;
        options.sections.set_flags(&name, flags)?;
    }
    for arg in matches
        .get_many::<String>("change-section-vma")
        .unwrap_or_default()
    {
        let (name, change) = parse_address_change(arg)?;
        options.sections.change_vma(&name, change)?;
    }
    for arg in matches
        .get_many::<String>("change-section-lma")
        .unwrap_or_default()
    {
        let (name, change) = parse_address_change(arg)?;
        options.sections.change_lma(&name, change)?;
    }
    if let Some(incr) = matches.get_one::<String>("change-addresses") {
        options.change_addresses = parse_i64(incr)?;
    }
    if let Some(prefix) = matches.get_one::<String>("prefix-sections") {
        options.prefix_sections = prefix.clone().into_bytes();
    }

    for name in matches.get_many::<String>("strip-symbol").unwrap_or_default() {
        options.strip_symbols.insert(name.clone().into_bytes());
    }
    for name in matches
        .get_many::<String>("strip-unneeded-symbol")
        .unwrap_or_default()
    {
        options
            .strip_unneeded_symbols
            .insert(name.clone().into_bytes());
    }
    for name in matches.get_many::<String>("keep-symbol").unwrap_or_default() {
        options.keep_symbols.insert(name.clone().into_bytes());
    }
    for name in matches
        .get_many::<String>("localize-symbol")
        .unwrap_or_default()
    {
        options.localize_symbols.insert(name.clone().into_bytes());
    }
    for name in matches
        .get_many::<String>("globalize-symbol")
        .unwrap_or_default()
    {
        options.globalize_symbols.insert(name.clone().into_bytes());
    }
    for name in matches
        .get_many::<String>("keep-global-symbol")
        .unwrap_or_default()
    {
        options.keep_global_symbols.insert(name.clone().into_bytes());
    }
    for name in matches
        .get_many::<String>("weaken-symbol")
        .unwrap_or_default()
    {
        options.weaken_symbols.insert(name.clone().into_bytes());
    }
    for arg in matches.get_many::<String>("redefine-sym").unwrap_or_default() {
        let (old, new) = split_pair(arg, "--redefine-sym")?;
        options.rename_symbols.insert(old, new)?;
    }
    if let Some(prefix) = matches.get_one::<String>("prefix-symbols") {
        options.prefix_symbols = prefix.clone().into_bytes();
    }
    for arg in matches.get_many::<String>("add-symbol").unwrap_or_default() {
        options.add_symbols.push(parse_add_symbol(arg)?);
    }

    if let Some(val) = matches.get_one::<String>("gap-fill") {
        let val = parse_u64(val)?;
        options.gap_fill = Some(u8::try_from(val).context("--gap-fill value must fit in a byte")?);
    }
    if let Some(addr) = matches.get_one::<String>("pad-to") {
        options.pad_to = Some(parse_u64(addr)?);
    }
    if let Some(stride) = matches.get_one::<String>("interleave") {
        let stride = parse_u64(stride)?;
        let width = match matches.get_one::<String>("interleave-width") {
            Some(width) => parse_u64(width)?,
            None => 1,
        };
        let offset = match matches.get_one::<String>("byte") {
            Some(byte) => parse_u64(byte)?,
            None => 0,
        };
        options.interleave = Some(copy::Interleave::new(stride, width, offset)?);
    }
    if let Some(unit) = matches.get_one::<String>("reverse-bytes") {
        options.reverse_bytes = Some(parse_u64(unit)?);
    }
    if let Some(format) = matches.get_one::<String>("output-target") {
        options.output_format = Some(match format.as_str() {
            "elf" => object::BinaryFormat::Elf,
            "coff" => object::BinaryFormat::Coff,
            "macho" => object::BinaryFormat::MachO,
            _ => return Err(anyhow!("unsupported output format '{}'", format)),
        });
    }

    let in_path = matches.get_one::<PathBuf>("input").unwrap();
    let out_path = matches.get_one::<PathBuf>("output").unwrap();

    let in_file = fs::File::open(in_path)
        .with_context(|| format!("Failed to open input file '{}'", in_path.display()))?;
    let in_data = unsafe { memmap2::Mmap::map(&in_file) }
        .with_context(|| format!("Failed to map input file '{}'", in_path.display()))?;

    let output = copy::copy(&in_data, &options)
        .with_context(|| format!("Failed to copy '{}'", in_path.display()))?;

    if let Err(error) = fs::write(out_path, &output.data) {
        // Don't leave a truncated output file behind.
        fs::remove_file(out_path).ok();
        return Err(error)
            .with_context(|| format!("Failed to write output file '{}'", out_path.display()));
    }

    Ok(if output.failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Split an `old=new` style argument.
fn split_pair(arg: &str, option: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let parts: Vec<&[u8]> = arg.as_bytes().splitn(2, |byte| *byte == b'=').collect();
    if parts.len() != 2 {
        return Err(anyhow!(
            "Invalid argument: `{}`. {} expects an argument of the form: <old>=<new>",
            arg,
            option
        ));
    }
    Ok((parts[0].to_vec(), parts[1].to_vec()))
}

/// Parse `name=val`, `name+val` or `name-val`.
fn parse_address_change(arg: &str) -> Result<(Vec<u8>, copy::AddressChange)> {
    let bytes = arg.as_bytes();
    let position = bytes
        .iter()
        .position(|byte| matches!(byte, b'=' | b'+' | b'-'))
        .ok_or_else(|| {
            anyhow!(
                "Invalid address change: `{}`. Expected <name>=<val>, <name>+<val> or <name>-<val>",
                arg
            )
        })?;
    let name = bytes[..position].to_vec();
    let value = parse_u64(&arg[position + 1..])?;
    let change = match bytes[position] {
        b'=' => copy::AddressChange::Set(value),
        b'+' => copy::AddressChange::Adjust(value as i64),
        _ => copy::AddressChange::Adjust(-(value as i64)),
    };
    Ok((name, change))
}

/// Parse `name=[section:]value[,flags]`, where flags may include
/// `before=<symbol>`.
fn parse_add_symbol(arg: &str) -> Result<copy::AddedSymbol> {
    let (name, rest) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid --add-symbol argument: `{}`", arg))?;
    let mut parts = rest.split(',');
    let value_part = parts.next().unwrap_or_default();
    let (section, value) = match value_part.split_once(':') {
        Some((section, value)) => (Some(section.as_bytes().to_vec()), parse_u64(value)?),
        None => (None, parse_u64(value_part)?),
    };
    let mut attrs = copy::SymbolAttrs::empty();
    let mut before = None;
    for flag in parts {
        if let Some(anchor) = flag.strip_prefix("before=") {
            before = Some(anchor.as_bytes().to_vec());
        } else {
            attrs |= copy::SymbolAttrs::parse(flag)?;
        }
    }
    if !attrs.intersects(copy::SymbolAttrs::GLOBAL | copy::SymbolAttrs::LOCAL) {
        attrs |= copy::SymbolAttrs::GLOBAL;
    }
    Ok(copy::AddedSymbol {
        name: name.as_bytes().to_vec(),
        section,
        value,
        attrs,
        before,
    })
}

fn parse_u64(text: &str) -> Result<u64> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.with_context(|| format!("Invalid number: `{}`", text))
}

fn parse_i64(text: &str) -> Result<i64> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix('-') {
        Ok(-(parse_u64(rest)? as i64))
    } else {
        Ok(parse_u64(text)? as i64)
    }
}
