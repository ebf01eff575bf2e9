use crate::error::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub(crate) mod aarch64;
pub(crate) mod alignment;
pub(crate) mod archive;
pub mod args;
pub(crate) mod atom;
pub(crate) mod atom_builder;
pub(crate) mod bits;
pub(crate) mod code_signature;
pub(crate) mod dyld_info;
pub(crate) mod dylib;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod file_writer;
pub(crate) mod hash;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod leb128;
pub(crate) mod macho;
pub(crate) mod macho_writer;
pub(crate) mod object_file;
pub(crate) mod output_section_id;
pub(crate) mod parsing;
#[cfg(test)]
mod pipeline_tests;
pub(crate) mod reloc_writer;
pub(crate) mod resolution;
pub(crate) mod string_table;
pub(crate) mod symbol;
pub(crate) mod symbol_db;
pub(crate) mod synthetic;
pub(crate) mod validation;
pub(crate) mod wasm;
pub(crate) mod wasm_writer;
pub(crate) mod x86_64;

pub use args::Backend;
pub use args::Options;

/// Maps the driver's invocation name to a backend. Unknown names get usage
/// output from the driver instead.
pub fn backend_for_invocation(name: &str) -> Option<Backend> {
    match name {
        "ld.zld" | "ld" => Some(Backend::Elf),
        "ld64.zld" | "ld64" => Some(Backend::MachO),
        "link-zld" => Some(Backend::Coff),
        "wasm-zld" => Some(Backend::Wasm),
        _ => None,
    }
}

pub struct Linker {
    opts: Options,
    thread_pool: rayon::ThreadPool,
}

impl Linker {
    pub fn from_args<S: AsRef<str>, I: Iterator<Item = S>>(
        backend: Backend,
        args: I,
    ) -> Result<Linker> {
        let opts = args::parse(backend, args)?;
        Linker::new(opts)
    }

    pub fn new(opts: Options) -> Result<Linker> {
        // The pool only parses objects; everything after S1 runs on the
        // calling thread.
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.num_threads.get())
            .build()?;
        Ok(Linker { opts, thread_pool })
    }

    pub fn run(&self) -> Result {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env())
            .try_init();

        match self.opts.backend {
            Backend::Coff => anyhow::bail!("COFF linking is not implemented"),
            Backend::Elf | Backend::MachO | Backend::Wasm => link(&self.opts, &self.thread_pool),
        }
    }
}

#[tracing::instrument(skip_all, name = "Link")]
fn link(opts: &Options, pool: &rayon::ThreadPool) -> Result {
    let input_data = input_data::InputData::load(opts)?;
    let mut inputs = parsing::parse_input_files(&input_data, opts, pool)?;

    let mut symbol_db = symbol_db::SymbolDb::new();
    resolution::resolve_symbols(opts, &mut inputs, &mut symbol_db)?;

    let mut output_sections = output_section_id::OutputSections::new(opts.backend);
    let mut graph = atom_builder::build_atoms(&inputs.objects, &mut output_sections)?;
    let mut synthetics = synthetic::create_synthetics(opts, &symbol_db, &mut graph)?;
    let layout = layout::compute_layout(
        opts,
        &inputs.objects,
        &symbol_db,
        &mut graph,
        &mut synthetics,
        &output_sections,
    )?;

    let ctx = reloc_writer::LinkContext {
        opts,
        objects: &inputs.objects,
        dylibs: &inputs.dylibs,
        symbol_db: &symbol_db,
        graph: &graph,
        synthetics: &synthetics,
        layout: &layout,
    };

    if cfg!(debug_assertions) {
        validation::validate(&ctx, &output_sections)?;
    }

    match opts.backend {
        Backend::Elf => elf_writer::write(&ctx, &output_sections),
        Backend::MachO => macho_writer::write(&ctx, &output_sections),
        Backend::Wasm => wasm_writer::write(&ctx, &output_sections),
        Backend::Coff => unreachable!("rejected before linking"),
    }
}
