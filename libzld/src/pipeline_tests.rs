//! Cross-stage tests: resolver → atoms → synthetics → layout, driven by
//! in-memory objects rather than files, so the interesting machinery runs
//! without a toolchain in the loop.

use crate::alignment::Alignment;
use crate::args;
use crate::args::Backend;
use crate::args::CpuArch;
use crate::args::Options;
use crate::atom_builder;
use crate::atom_builder::AtomGraph;
use crate::dylib::Dylib;
use crate::dylib::ExportInfo;
use crate::hash::PassThroughHashMap;
use crate::layout;
use crate::layout::Layout;
use crate::object_file::Binding;
use crate::object_file::InputReloc;
use crate::object_file::InputSection;
use crate::object_file::InputSymbol;
use crate::object_file::ObjectFile;
use crate::object_file::RelocKind;
use crate::object_file::RelocTarget;
use crate::object_file::SectionData;
use crate::object_file::SectionKind;
use crate::object_file::SectionName;
use crate::object_file::SymFlags;
use crate::output_section_id;
use crate::output_section_id::OutputSections;
use crate::parsing::LinkInputs;
use crate::resolution;
use crate::symbol::FileId;
use crate::symbol::SymbolName;
use crate::symbol::SymbolRef;
use crate::symbol_db::Definition;
use crate::symbol_db::SymbolDb;
use crate::synthetic;
use crate::synthetic::Synthetics;

fn macho_opts() -> Options {
    let mut opts = Options::new(Backend::MachO, args::default_target(Backend::MachO));
    opts.target.cpu_arch = CpuArch::X86_64;
    opts
}

fn text_section(bytes: &[u8], relocs: Vec<InputReloc>) -> InputSection<'_> {
    InputSection {
        name: SectionName::macho(b"__TEXT", b"__text"),
        kind: SectionKind::Code,
        alignment: Alignment::new(16).unwrap(),
        data: SectionData::Bytes(bytes),
        relocs,
        comdat_signature: None,
    }
}

fn object<'d>(
    name: &str,
    sections: Vec<InputSection<'d>>,
    symbols: Vec<InputSymbol<'d>>,
) -> ObjectFile<'d> {
    ObjectFile {
        name: name.to_owned(),
        cpu_arch: CpuArch::X86_64,
        sections,
        symbols,
        subsections_via_symbols: true,
        wasm: None,
        data_in_code: Vec::new(),
    }
}

fn defined<'d>(name: &'d [u8], section: usize, value: u64) -> InputSymbol<'d> {
    InputSymbol {
        name,
        value,
        size: 0,
        section: Some(section),
        binding: Binding::Global,
        flags: SymFlags::empty(),
        common_alignment: None,
    }
}

fn undefined(name: &[u8]) -> InputSymbol<'_> {
    InputSymbol {
        name,
        value: 0,
        size: 0,
        section: None,
        binding: Binding::Global,
        flags: SymFlags::UNDEFINED,
        common_alignment: None,
    }
}

fn tentative(name: &[u8], size: u64, align: u64) -> InputSymbol<'_> {
    InputSymbol {
        name,
        value: size,
        size,
        section: None,
        binding: Binding::Global,
        flags: SymFlags::TENTATIVE,
        common_alignment: Some(Alignment::new(align).unwrap()),
    }
}

fn system_dylib(exports: &[&[u8]]) -> Dylib {
    let mut map = PassThroughHashMap::default();
    for name in exports {
        map.insert(
            crate::hash::PreHashed::new(name.to_vec(), crate::hash::hash_bytes(name)),
            ExportInfo { weak: false },
        );
    }
    Dylib {
        install_name: "/usr/lib/libSystem.B.dylib".to_owned(),
        current_version: 0,
        compatibility_version: 0,
        exports: map,
        dependents: Vec::new(),
        weak: false,
        referenced: false,
        needed: false,
    }
}

struct Linked<'d> {
    inputs: LinkInputs<'d>,
    symbol_db: SymbolDb<'d>,
    graph: AtomGraph<'d>,
    synthetics: Synthetics,
    layout: Layout,
    output_sections: OutputSections,
}

fn run_pipeline<'d>(
    opts: &'d Options,
    objects: Vec<ObjectFile<'d>>,
    dylibs: Vec<Dylib>,
) -> Linked<'d> {
    let mut inputs = LinkInputs {
        objects,
        archives: Vec::new(),
        dylibs,
    };
    let mut symbol_db = SymbolDb::new();
    resolution::resolve_symbols(opts, &mut inputs, &mut symbol_db).unwrap();

    let mut output_sections = OutputSections::new(opts.backend);
    let mut graph = atom_builder::build_atoms(&inputs.objects, &mut output_sections).unwrap();
    let mut synthetics = synthetic::create_synthetics(opts, &symbol_db, &mut graph).unwrap();
    let layout = layout::compute_layout(
        opts,
        &inputs.objects,
        &symbol_db,
        &mut graph,
        &mut synthetics,
        &output_sections,
    )
    .unwrap();

    Linked {
        inputs,
        symbol_db,
        graph,
        synthetics,
        layout,
        output_sections,
    }
}

/// An executable referencing `_printf` from a dylib gets the full lazy
/// binding chain: one 6-byte stub, one lazy pointer initialized toward the
/// stub helper, one helper entry, the shared preamble, and a GOT slot for
/// the stub binder.
#[test]
fn test_lazy_binding_chain() {
    let opts = macho_opts();
    let code = [0u8; 16];
    let call = InputReloc {
        offset: 5,
        target: RelocTarget::Symbol(1),
        kind: RelocKind::Branch,
        addend: 0,
        length: 4,
        pcrel: true,
        subtrahend: None,
    };
    let objects = vec![object(
        "main.o",
        vec![text_section(&code, vec![call])],
        vec![defined(b"_main", 0, 0), undefined(b"_printf")],
    )];
    let linked = run_pipeline(&opts, objects, vec![system_dylib(&[b"_printf"])]);

    let printf = linked
        .symbol_db
        .lookup(&SymbolName::prehashed(b"_printf"))
        .unwrap();
    assert_eq!(
        linked.symbol_db.global(printf).definition,
        Definition::Dylib {
            ordinal: 1,
            weak: false
        }
    );
    assert!(linked.inputs.dylibs[0].referenced);

    assert_eq!(linked.synthetics.stubs.len(), 1);
    assert_eq!(linked.synthetics.lazy_ptrs.len(), 1);
    assert_eq!(linked.synthetics.stub_helpers.len(), 1);
    assert!(linked.synthetics.stub_helper_preamble.is_some());

    let (_, stub) = linked.synthetics.stubs.order[0];
    assert_eq!(linked.graph.pool.get(stub).size, 6);

    // The lazy pointer's initial value targets the helper entry.
    let (_, lazy) = linked.synthetics.lazy_ptrs.order[0];
    let lazy_atom = linked.graph.pool.get(lazy);
    assert_eq!(lazy_atom.relocs.len(), 1);
    let (target_atom, _) = layout::atom_for_symbol(
        &linked.symbol_db,
        &linked.graph,
        &linked.synthetics,
        lazy_atom.relocs[0].target,
    )
    .unwrap();
    assert_eq!(target_atom, linked.synthetics.stub_helpers.order[0].1);

    // The binder is reached through a GOT slot.
    let binder = linked
        .symbol_db
        .lookup(&SymbolName::prehashed(b"dyld_stub_binder"))
        .unwrap();
    assert!(linked
        .synthetics
        .got
        .get(crate::synthetic::TargetKey::Global(binder))
        .is_some());
}

/// Two COMMON definitions of different sizes merge into one zerofill atom of
/// the larger size, and both objects' references land on it.
#[test]
fn test_tentative_merge() {
    let opts = macho_opts();
    let code_a = [0u8; 8];
    let code_b = [0u8; 8];
    let objects = vec![
        object(
            "a.o",
            vec![text_section(&code_a, Vec::new())],
            vec![defined(b"_main", 0, 0), tentative(b"_buf", 8, 8)],
        ),
        object(
            "b.o",
            vec![text_section(&code_b, Vec::new())],
            vec![defined(b"_helper", 0, 0), tentative(b"_buf", 64, 16)],
        ),
    ];
    let linked = run_pipeline(&opts, objects, Vec::new());

    let buf = linked
        .symbol_db
        .lookup(&SymbolName::prehashed(b"_buf"))
        .unwrap();
    assert_eq!(
        linked.symbol_db.global(buf).definition,
        Definition::Tentative {
            size: 64,
            alignment: Alignment::new(16).unwrap()
        }
    );

    let atom = *linked.synthetics.tentative.get(&buf).unwrap();
    let tentative_atom = linked.graph.pool.get(atom);
    assert_eq!(tentative_atom.size, 64);
    assert!(tentative_atom.data.is_zerofill());
    assert_eq!(tentative_atom.output_section, output_section_id::COMMON);

    // References from either object resolve to the same storage.
    for file in [FileId(0), FileId(1)] {
        let resolved = layout::atom_for_symbol(
            &linked.symbol_db,
            &linked.graph,
            &linked.synthetics,
            SymbolRef::object(file, 1),
        )
        .unwrap();
        assert_eq!(resolved, (atom, 0));
    }
}

/// A strong definition wins over a weak one regardless of load order, and
/// references through the global reach the strong atom.
#[test]
fn test_weak_strong_override() {
    let opts = macho_opts();
    let code_a = [0u8; 8];
    let code_b = [0u8; 8];
    let weak_foo = InputSymbol {
        binding: Binding::Weak,
        ..defined(b"_foo", 0, 0)
    };
    let objects = vec![
        object(
            "weak.o",
            vec![text_section(&code_a, Vec::new())],
            vec![weak_foo, defined(b"_main", 0, 4)],
        ),
        object(
            "strong.o",
            vec![text_section(&code_b, Vec::new())],
            vec![defined(b"_foo", 0, 0)],
        ),
    ];
    let linked = run_pipeline(&opts, objects, Vec::new());

    let foo = linked
        .symbol_db
        .lookup(&SymbolName::prehashed(b"_foo"))
        .unwrap();
    assert_eq!(
        linked.symbol_db.global(foo).definition,
        Definition::Object {
            file: FileId(1),
            sym_index: 0
        }
    );

    // A reference from the weak object's file resolves to the strong atom.
    let (strong_atom, _) = layout::atom_for_symbol(
        &linked.symbol_db,
        &linked.graph,
        &linked.synthetics,
        SymbolRef::object(FileId(0), 0),
    )
    .unwrap();
    assert_eq!(linked.graph.pool.get(strong_atom).file, Some(FileId(1)));
}

/// Layout places __TEXT below __DATA_CONST below __DATA, and the chain walk
/// over every section accounts for every live atom (the §8 chain-integrity
/// property, checked by the validation sweep).
#[test]
fn test_layout_invariants_hold() {
    let opts = macho_opts();
    let code = [0u8; 32];
    let objects = vec![object(
        "main.o",
        vec![text_section(&code, Vec::new())],
        vec![defined(b"_main", 0, 0), defined(b"_aux", 0, 16)],
    )];
    let linked = run_pipeline(&opts, objects, Vec::new());

    let ctx = crate::reloc_writer::LinkContext {
        opts: &opts,
        objects: &linked.inputs.objects,
        dylibs: &linked.inputs.dylibs,
        symbol_db: &linked.symbol_db,
        graph: &linked.graph,
        synthetics: &linked.synthetics,
        layout: &linked.layout,
    };
    crate::validation::validate(&ctx, &linked.output_sections).unwrap();

    assert_eq!(
        ctx.symbol_address(SymbolRef::object(FileId(0), 1)).unwrap(),
        ctx.symbol_address(SymbolRef::object(FileId(0), 0)).unwrap() + 16,
    );
}

/// A member is pulled in only when it defines a name that is undefined at
/// inspection time: an archive whose TOC has no match is never opened, and
/// one whose TOC matches is (here the member bytes are garbage, so the pull
/// itself fails — proof it was attempted).
#[test]
fn test_archive_pull_in_minimality() {
    fn archive_entry(ident: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("{ident:<16}").as_bytes());
        out.extend_from_slice(b"0           ");
        out.extend_from_slice(b"0     0     ");
        out.extend_from_slice(b"644     ");
        out.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
        out
    }

    // GNU archive: symtab maps `_bar` to a member that is not an object.
    let mut symtab = Vec::new();
    symtab.extend_from_slice(&1u32.to_be_bytes());
    symtab.extend_from_slice(&0u32.to_be_bytes());
    symtab.extend_from_slice(b"_bar\0");
    let mut archive_bytes = Vec::new();
    archive_bytes.extend_from_slice(&object::archive::MAGIC);
    archive_bytes.extend_from_slice(&archive_entry("/", &symtab));
    let member_offset = archive_bytes.len() as u32;
    archive_bytes.extend_from_slice(&archive_entry("junk.o/", b"\x01\x02 not an object"));
    let patch_at = object::archive::MAGIC.len() + 60 + 4;
    archive_bytes[patch_at..patch_at + 4].copy_from_slice(&member_offset.to_be_bytes());

    let make_inputs = |objects| {
        let archive = crate::archive::Archive::parse(&archive_bytes).unwrap();
        let mut toc_map = hashbrown::HashMap::new();
        for &(name, offset) in archive.toc() {
            toc_map.entry(name).or_insert(offset);
        }
        LinkInputs {
            objects,
            archives: vec![crate::parsing::LinkArchive {
                archive,
                name: "libjunk.a".to_owned(),
                toc_map,
                loaded_members: hashbrown::HashSet::new(),
            }],
            dylibs: Vec::new(),
        }
    };

    let opts = macho_opts();
    let code = [0u8; 8];
    let code2 = [0u8; 8];

    // Nothing references `_bar`: the member must never be inspected.
    let mut inputs = make_inputs(vec![object(
        "main.o",
        vec![text_section(&code, Vec::new())],
        vec![defined(b"_main", 0, 0)],
    )]);
    let mut symbol_db = SymbolDb::new();
    resolution::resolve_symbols(&opts, &mut inputs, &mut symbol_db).unwrap();
    assert!(inputs.archives[0].loaded_members.is_empty());

    // An undefined `_bar` forces the pull, which trips over the garbage
    // member bytes.
    let mut inputs = make_inputs(vec![object(
        "main.o",
        vec![text_section(&code2, Vec::new())],
        vec![defined(b"_main", 0, 0), undefined(b"_bar")],
    )]);
    let mut symbol_db = SymbolDb::new();
    let err = resolution::resolve_symbols(&opts, &mut inputs, &mut symbol_db).unwrap_err();
    assert!(err.to_string().contains("junk.o"));
}
