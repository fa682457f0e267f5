//! Two-phase story-file layout and fixup.
//!
//! Phase 1 fixes every data-region base before any code is generated:
//! all sizes are computable without addresses, so tables, dictionary
//! words and parser tables are ordinary constants during code
//! generation, and only routines and strings need placeholders.
//!
//! Phase 2 concatenates the regions, appends routines (aligned per
//! version) and the deduplicated string table, rewrites every recorded
//! fixup, and finishes the header with length and checksum. The
//! static-memory base is captured where dynamic memory ends, before any
//! read-only table is appended.

use cranelift_entity::EntityRef;
use log::debug;

use zilc_zmachine::header::{checksum, Header, HEADER_SIZE};
use zilc_zmachine::text::{encode, AbbrevTable, EncodeOpts};
use zilc_zmachine::version::{ZVersion, GLOBAL_SLOTS, MAX_ABBREVS};

use crate::dictionary::Dictionary;
use crate::fixup::{Fixup, Imm, ImmResolver, RefKind, Region};
use crate::gen::GennedRoutine;
use crate::objects::ObjectRegion;
use crate::resolve::Resolver;
use crate::result::{CompileError, CompileResult, Diagnostics};
use crate::syntax::ParserTables;
use crate::tables::{TableId, TableSet};

/// Everything phase 1 decides.
pub struct Phase1 {
    pub global_base: u16,
    pub abbrev_base: u16,
    pub object_base: u16,
    pub dyn_tables_base: u16,
    pub static_base: u16,
    pub parser_base: u16,
    pub pure_tables_base: u16,
    pub dict_base: u16,
    /// First byte of the routine region (already aligned).
    pub code_base: u32,
    /// Absolute address per table id.
    pub table_addrs: Vec<u16>,
}

fn align_to(value: u32, align: u32) -> u32 {
    value.next_multiple_of(align)
}

fn overflow(what: &str, at: u32) -> CompileError {
    CompileError::Layout {
        message: format!("{what} at {at:#x} does not fit below the 64K address limit"),
    }
}

/// Compute every region base. Sizes only; no contents.
pub fn plan(
    version: ZVersion,
    objects: &ObjectRegion,
    tables: &TableSet,
    dict: &Dictionary,
    parser: &ParserTables,
    abbrevs: &AbbrevTable,
) -> CompileResult<Phase1> {
    let global_base = HEADER_SIZE as u32;
    let abbrev_base = global_base + (GLOBAL_SLOTS * 2) as u32;
    let mut abbrev_strings = 0u32;
    for text in abbrevs.iter() {
        let opts = EncodeOpts { literal: true, ..EncodeOpts::default() };
        let encoded = encode(text, version, None, &opts)
            .map_err(|source| CompileError::Encoding { loc: Default::default(), source })?;
        abbrev_strings += encoded.len() as u32;
    }
    let object_base = abbrev_base + (MAX_ABBREVS * 2) as u32 + abbrev_strings;
    let dyn_tables_base = object_base + objects.byte_size();

    // Impure tables in id order, then the static boundary.
    let mut table_addrs = vec![0u16; tables.len()];
    let mut cursor = dyn_tables_base;
    for (id, table) in tables.iter() {
        if !table.pure {
            table_addrs[id.index()] = cursor.try_into().map_err(|_| overflow("table", cursor))?;
            cursor += tables.size_of(id);
        }
    }
    let static_base = cursor;

    let parser_base = static_base;
    cursor += parser.byte_size();
    let pure_tables_base = cursor;
    for (id, table) in tables.iter() {
        if table.pure {
            table_addrs[id.index()] = cursor.try_into().map_err(|_| overflow("table", cursor))?;
            cursor += tables.size_of(id);
        }
    }
    let dict_base = cursor;
    cursor += dict.byte_size();
    let code_base = align_to(cursor, version.routine_align());

    let as_u16 = |v: u32, what: &str| -> CompileResult<u16> {
        v.try_into().map_err(|_| overflow(what, v))
    };
    let plan = Phase1 {
        global_base: as_u16(global_base, "globals")?,
        abbrev_base: as_u16(abbrev_base, "abbreviations")?,
        object_base: as_u16(object_base, "object table")?,
        dyn_tables_base: as_u16(dyn_tables_base, "tables")?,
        static_base: as_u16(static_base, "static memory")?,
        parser_base: as_u16(parser_base, "parser tables")?,
        pure_tables_base: as_u16(pure_tables_base, "pure tables")?,
        dict_base: as_u16(dict_base, "dictionary")?,
        code_base,
        table_addrs,
    };
    if plan.code_base > u32::from(u16::MAX) + 1 {
        return Err(overflow("high memory", plan.code_base));
    }
    debug!(
        "layout: objects {:#x}, static {:#x}, dictionary {:#x}, code {:#x}",
        plan.object_base, plan.static_base, plan.dict_base, plan.code_base
    );
    Ok(plan)
}

/// Assembler configuration beyond the version.
pub struct AsmOptions {
    pub release: u16,
    pub serial: [u8; 6],
    /// V3 status line shows hours:minutes.
    pub time_status: bool,
    /// Encoding behavior: `PRESERVE-SPACES?` and `CRLF-CHARACTER`.
    pub text_opts: EncodeOpts,
}

/// Phase 2: produce the finished story file.
#[allow(clippy::too_many_arguments)]
pub fn assemble(
    plan: &Phase1,
    opts: &AsmOptions,
    objects: &ObjectRegion,
    tables: &TableSet,
    dict: &Dictionary,
    parser: &ParserTables,
    abbrevs: &AbbrevTable,
    routines: &[GennedRoutine],
    resolver: &mut Resolver,
    diag: &mut Diagnostics,
) -> CompileResult<Vec<u8>> {
    let version = resolver.world.version;
    let mut image = vec![0u8; HEADER_SIZE];
    // Absolute fixups, rebased as each region lands.
    let mut fixups: Vec<Fixup> = Vec::new();
    let mut rebase = |fixups: &mut Vec<Fixup>, list: Vec<Fixup>, base: u16| {
        for mut f in list {
            f.offset += u32::from(base);
            fixups.push(f);
        }
    };

    // Globals.
    debug_assert_eq!(image.len(), usize::from(plan.global_base));
    {
        let mut region = Vec::with_capacity(GLOBAL_SLOTS * 2);
        let mut local_fixups = Vec::new();
        for def in resolver.world.globals.clone() {
            match resolver.resolve(&def.value, &def.loc)? {
                Imm::Const(c) => region.extend_from_slice(&(c as u16).to_be_bytes()),
                Imm::Ref(kind, index) => {
                    local_fixups.push(Fixup {
                        region: Region::Globals,
                        offset: region.len() as u32,
                        kind,
                        index,
                    });
                    region.extend_from_slice(&kind.placeholder(index).to_be_bytes());
                }
            }
        }
        region.resize(GLOBAL_SLOTS * 2, 0);
        rebase(&mut fixups, local_fixups, plan.global_base);
        image.extend_from_slice(&region);
    }

    // Abbreviation pointer table and strings.
    debug_assert_eq!(image.len(), usize::from(plan.abbrev_base));
    {
        let strings_start = usize::from(plan.abbrev_base) + MAX_ABBREVS * 2;
        let mut pointers = Vec::with_capacity(MAX_ABBREVS * 2);
        let mut strings = Vec::new();
        for text in abbrevs.iter() {
            let at = (strings_start + strings.len()) as u32;
            // Abbreviation addresses are word addresses.
            pointers.extend_from_slice(&((at / 2) as u16).to_be_bytes());
            let opts = EncodeOpts { literal: true, ..EncodeOpts::default() };
            let encoded = encode(text, version, None, &opts)
                .map_err(|source| CompileError::Encoding { loc: Default::default(), source })?;
            strings.extend_from_slice(&encoded);
        }
        pointers.resize(MAX_ABBREVS * 2, 0);
        image.extend_from_slice(&pointers);
        image.extend_from_slice(&strings);
    }

    // Object table and property tables.
    debug_assert_eq!(image.len(), usize::from(plan.object_base));
    {
        let mut local_fixups = Vec::new();
        let bytes = objects.emit(plan.object_base, resolver.world, resolver, &mut local_fixups)?;
        rebase(&mut fixups, local_fixups, plan.object_base);
        image.extend_from_slice(&bytes);
    }

    // Writable tables, then the static boundary.
    debug_assert_eq!(image.len(), usize::from(plan.dyn_tables_base));
    emit_tables(&mut image, &mut fixups, tables, plan, false, resolver)?;
    debug_assert_eq!(image.len(), usize::from(plan.static_base));

    // Parser tables.
    {
        let mut local_fixups = Vec::new();
        let region = parser.emit(plan.parser_base, resolver.world, diag, &mut local_fixups)?;
        rebase(&mut fixups, local_fixups, plan.parser_base);
        image.extend_from_slice(&region.bytes);
    }

    // Read-only tables and the dictionary.
    debug_assert_eq!(image.len(), usize::from(plan.pure_tables_base));
    emit_tables(&mut image, &mut fixups, tables, plan, true, resolver)?;
    debug_assert_eq!(image.len(), usize::from(plan.dict_base));
    image.extend_from_slice(&dict.emit());

    // Routine region.
    image.resize(plan.code_base as usize, 0);
    let mut routine_addrs = Vec::with_capacity(routines.len());
    let mut first_instrs = Vec::with_capacity(routines.len());
    for routine in routines {
        let at = align_to(image.len() as u32, version.routine_align());
        image.resize(at as usize, 0);
        routine_addrs.push(at);

        image.push(routine.locals.len() as u8);
        if version <= ZVersion::V4 {
            for init in &routine.locals {
                image.extend_from_slice(&init.to_be_bytes());
            }
        }
        let code_start = image.len() as u32;
        first_instrs.push(code_start);
        for f in &routine.code.fixups {
            fixups.push(Fixup {
                region: Region::Code,
                offset: code_start + f.offset,
                kind: f.kind,
                index: f.index,
            });
        }
        image.extend_from_slice(&routine.code.bytes);
    }

    // String region.
    let mut string_addrs = vec![0u32; resolver.strings.len()];
    let string_base = align_to(image.len() as u32, version.packed_divisor());
    image.resize(string_base as usize, 0);
    for (id, text) in resolver.strings.iter() {
        let at = align_to(image.len() as u32, version.packed_divisor());
        image.resize(at as usize, 0);
        string_addrs[id.index()] = at;
        let encoded = encode(text, version, Some(abbrevs), &opts.text_opts)
            .map_err(|source| CompileError::Encoding { loc: Default::default(), source })?;
        image.extend_from_slice(&encoded);
    }

    // Final padding.
    let final_len = align_to(image.len() as u32, version.length_divisor());
    image.resize(final_len as usize, 0);
    if final_len > version.max_file_size() {
        return Err(CompileError::Layout {
            message: format!(
                "story file is {final_len} bytes; {version} allows {}",
                version.max_file_size()
            ),
        });
    }

    // Fixup pass: every placeholder is rewritten exactly once.
    let divisor = version.packed_divisor();
    let pack = |addr: u32, what: &str| -> CompileResult<u16> {
        if addr % divisor != 0 {
            return Err(CompileError::Layout {
                message: format!("{what} at {addr:#x} is not aligned"),
            });
        }
        (addr / divisor)
            .try_into()
            .map_err(|_| CompileError::Layout { message: format!("{what} beyond packed range") })
    };
    for f in &fixups {
        let at = f.offset as usize;
        let expect = f.kind.placeholder(f.index).to_be_bytes();
        if image[at..at + 2] != expect {
            return Err(CompileError::Layout {
                message: format!("fixup at {at:#x} does not cover its placeholder"),
            });
        }
        let value: u16 = match f.kind {
            RefKind::Routine | RefKind::PropRoutine => {
                let addr = *routine_addrs.get(f.index as usize).ok_or_else(|| {
                    CompileError::Layout { message: "fixup references a missing routine".into() }
                })?;
                pack(addr, "routine")?
            }
            RefKind::StringOperand | RefKind::TellString => {
                let addr = string_addrs[f.index as usize];
                pack(addr, "string")?
            }
            RefKind::Vocab => {
                // Byte address of the nth dictionary entry.
                let entry = dict.entries.get(f.index as usize).ok_or_else(|| {
                    CompileError::Layout {
                        message: "fixup references a missing vocabulary word".into(),
                    }
                })?;
                dict.address_of(entry.atom, plan.dict_base).expect("entry present")
            }
        };
        image[at] = (value >> 8) as u8;
        image[at + 1] = value as u8;
    }

    // Header. V6 starts at a packed main routine; every other version
    // starts executing at the first instruction's byte address.
    let go = resolver.world.go.ok_or_else(|| CompileError::Layout {
        message: "no GO routine to start at".into(),
    })?;
    let initial_pc = if version == ZVersion::V6 {
        pack(routine_addrs[go.index()], "main routine")?
    } else {
        let pc = first_instrs[go.index()];
        pc.try_into().map_err(|_| overflow("initial program counter", pc))?
    };

    let mut header = Header::new(version);
    header.release = opts.release;
    header.serial = opts.serial;
    header.high_mem_base = plan
        .code_base
        .try_into()
        .map_err(|_| overflow("high memory", plan.code_base))?;
    header.initial_pc = initial_pc;
    header.dictionary_base = plan.dict_base;
    header.object_table_base = plan.object_base;
    header.global_base = plan.global_base;
    header.static_mem_base = plan.static_base;
    header.abbrev_base = plan.abbrev_base;
    header.file_length = final_len;
    if version == ZVersion::V3 && opts.time_status {
        header.flags1 |= 0x02;
    }
    // V6/V7 pack relative to the offsets; zero keeps plain division
    // correct.
    header.routines_offset = 0;
    header.strings_offset = 0;
    header.write(&mut image);
    let sum = checksum(&image);
    image[0x1C] = (sum >> 8) as u8;
    image[0x1D] = sum as u8;

    if plan.static_base as u32 >= plan.code_base {
        return Err(CompileError::Layout {
            message: "static memory does not end below high memory".into(),
        });
    }
    debug!(
        "assembled {} bytes, checksum {sum:#06x}, {} fixup(s)",
        image.len(),
        fixups.len()
    );
    Ok(image)
}

fn emit_tables(
    image: &mut Vec<u8>,
    fixups: &mut Vec<Fixup>,
    tables: &TableSet,
    plan: &Phase1,
    pure: bool,
    resolver: &mut Resolver,
) -> CompileResult<()> {
    let ids: Vec<TableId> = tables
        .iter()
        .filter(|(_, t)| t.pure == pure)
        .map(|(id, _)| id)
        .collect();
    for id in ids {
        debug_assert_eq!(image.len(), usize::from(plan.table_addrs[id.index()]));
        let region = if pure { Region::PureTables } else { Region::DynTables };
        let mut local = Vec::new();
        let bytes = tables.emit(id, region, 0, resolver, &mut local)?;
        for mut f in local {
            f.offset += image.len() as u32;
            fixups.push(f);
        }
        image.extend_from_slice(&bytes);
    }
    Ok(())
}
