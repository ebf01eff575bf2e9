//! The driver multiplexer: one binary, hard-linked or symlinked under the
//! per-format names; the invocation name picks the backend.

use std::path::Path;
use std::process::ExitCode;

const USAGE: &str = "\
zld: a multi-format native linker.

Invoke through one of its format-specific names:
  ld.zld, ld      ELF
  ld64.zld, ld64  Mach-O
  link-zld        COFF
  wasm-zld        WebAssembly
";

fn main() -> ExitCode {
    let mut args = std::env::args();
    let argv0 = args.next().unwrap_or_default();
    let invocation = Path::new(&argv0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Some(backend) = libzld::backend_for_invocation(&invocation) else {
        print!("{USAGE}");
        return ExitCode::SUCCESS;
    };

    let result = libzld::Linker::from_args(backend, args).and_then(|linker| linker.run());
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: zld: {error:#}");
            ExitCode::FAILURE
        }
    }
}
