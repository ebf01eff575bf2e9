//! The `Options` record consumed by the backends, plus a command-line parser
//! covering the flag subset each backend recognizes. The driver decides which
//! backend is running before any argument is looked at, so flag spellings
//! follow the conventions of the linker being imitated (GNU ld for ELF,
//! ld64 for Mach-O, wasm-ld for Wasm).

use crate::error::Result;
use anyhow::bail;
use std::fmt::Display;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;

/// Which output format this invocation produces. Selected by the driver from
/// the invocation name before argument parsing starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Elf,
    MachO,
    Coff,
    Wasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuArch {
    X86_64,
    Aarch64,
    Wasm32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsTag {
    Linux,
    Macos,
    Ios,
    Freestanding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    None,
    Gnu,
    Simulator,
    Musl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub cpu_arch: CpuArch,
    pub os_tag: OsTag,
    pub abi: Abi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Exe,
    Lib,
}

/// Controls whether libraries resolve to dylibs or archives first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchStrategy {
    /// For each search dir, prefer the dylib, then the archive (ld64 default).
    #[default]
    PathsFirst,
    /// Check every search dir for a dylib before falling back to archives.
    DylibsFirst,
}

#[derive(Debug, Clone)]
pub struct PositionalInput {
    pub path: PathBuf,
    /// Force-load every member if this turns out to be an archive.
    pub must_link: bool,
}

/// `-lfoo` / `-framework Foo` attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkAttrs {
    pub needed: bool,
    pub weak: bool,
}

#[derive(Debug, Clone)]
pub struct Emit {
    pub directory: PathBuf,
    pub sub_path: PathBuf,
}

impl Emit {
    pub fn full_path(&self) -> PathBuf {
        self.directory.join(&self.sub_path)
    }
}

/// Everything a backend needs to run one link. Field set per the recognized
/// option surface; anything unset gets the backend's default.
#[derive(Debug, Clone)]
pub struct Options {
    pub backend: Backend,
    pub positionals: Vec<PositionalInput>,
    pub lib_dirs: Vec<PathBuf>,
    pub framework_dirs: Vec<PathBuf>,
    pub libs: Vec<(String, LinkAttrs)>,
    pub frameworks: Vec<(String, LinkAttrs)>,
    pub search_strategy: SearchStrategy,
    pub output_mode: OutputMode,
    pub emit: Emit,
    pub target: Target,
    pub syslibroot: Option<PathBuf>,
    pub entry: Option<String>,
    pub stack_size: Option<u64>,
    pub pagezero_size: Option<u64>,
    pub headerpad_size: Option<u64>,
    pub entitlements: Option<PathBuf>,
    pub install_name: Option<String>,
    pub rpaths: Vec<String>,
    pub dead_strip: bool,
    pub dead_strip_dylibs: bool,
    pub strip: bool,
    pub import_memory: bool,
    pub shared_memory: bool,
    pub allow_undef: bool,
    pub num_threads: NonZeroUsize,
}

impl Options {
    pub fn new(backend: Backend, target: Target) -> Options {
        Options {
            backend,
            positionals: Vec::new(),
            lib_dirs: Vec::new(),
            framework_dirs: Vec::new(),
            libs: Vec::new(),
            frameworks: Vec::new(),
            search_strategy: SearchStrategy::default(),
            output_mode: OutputMode::Exe,
            emit: Emit {
                directory: PathBuf::from("."),
                sub_path: PathBuf::from("a.out"),
            },
            target,
            syslibroot: None,
            entry: None,
            stack_size: None,
            pagezero_size: None,
            headerpad_size: None,
            entitlements: None,
            install_name: None,
            rpaths: Vec::new(),
            dead_strip: false,
            dead_strip_dylibs: false,
            strip: false,
            import_memory: false,
            shared_memory: false,
            allow_undef: false,
            num_threads: default_thread_count(),
        }
    }

    /// The symbol that execution starts at, with per-backend defaults.
    pub(crate) fn entry_symbol_name(&self) -> &str {
        if let Some(entry) = &self.entry {
            return entry;
        }
        match self.backend {
            Backend::MachO => "_main",
            _ => "_start",
        }
    }

    pub(crate) fn is_exe(&self) -> bool {
        self.output_mode == OutputMode::Exe
    }

    /// Size of the `__PAGEZERO` / ELF null page reservation at the bottom of
    /// the address space. Zero for shared libraries.
    pub(crate) fn pagezero_size(&self) -> u64 {
        if !self.is_exe() {
            return 0;
        }
        self.pagezero_size.unwrap_or(match self.backend {
            Backend::MachO => 0x1_0000_0000,
            _ => 0,
        })
    }

    pub(crate) fn base_address(&self) -> u64 {
        match self.backend {
            Backend::Elf => {
                if self.is_exe() {
                    0x40_0000
                } else {
                    0
                }
            }
            Backend::MachO => self.pagezero_size(),
            Backend::Coff | Backend::Wasm => 0,
        }
    }
}

fn default_thread_count() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::new(1).unwrap())
}

pub(crate) fn default_target(backend: Backend) -> Target {
    match backend {
        Backend::Elf => Target {
            cpu_arch: CpuArch::X86_64,
            os_tag: OsTag::Linux,
            abi: Abi::Gnu,
        },
        Backend::MachO => Target {
            cpu_arch: CpuArch::Aarch64,
            os_tag: OsTag::Macos,
            abi: Abi::None,
        },
        Backend::Coff | Backend::Wasm => Target {
            cpu_arch: match backend {
                Backend::Wasm => CpuArch::Wasm32,
                _ => CpuArch::X86_64,
            },
            os_tag: OsTag::Freestanding,
            abi: Abi::None,
        },
    }
}

/// Parses the recognized flag subset into a fully-populated `Options`.
pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(backend: Backend, args: I) -> Result<Options> {
    let mut opts = Options::new(backend, default_target(backend));
    let args: Vec<String> = args.map(|s| s.as_ref().to_owned()).collect();
    let mut cursor = 0;
    let mut whole_archive = false;

    let take_value = |cursor: &mut usize, flag: &str| -> Result<String> {
        *cursor += 1;
        match args.get(*cursor - 1) {
            Some(v) => Ok(v.clone()),
            None => bail!("Missing argument to {flag}"),
        }
    };

    while cursor < args.len() {
        let arg = args[cursor].clone();
        cursor += 1;
        match arg.as_str() {
            "-o" => {
                let path = PathBuf::from(take_value(&mut cursor, "-o")?);
                opts.emit = Emit {
                    directory: path.parent().unwrap_or(Path::new(".")).to_owned(),
                    sub_path: PathBuf::from(path.file_name().unwrap_or_default()),
                };
            }
            "-L" => opts
                .lib_dirs
                .push(PathBuf::from(take_value(&mut cursor, "-L")?)),
            "-F" => opts
                .framework_dirs
                .push(PathBuf::from(take_value(&mut cursor, "-F")?)),
            "-l" => opts
                .libs
                .push((take_value(&mut cursor, "-l")?, LinkAttrs::default())),
            "-framework" => opts
                .frameworks
                .push((take_value(&mut cursor, "-framework")?, LinkAttrs::default())),
            "-weak_framework" => opts.frameworks.push((
                take_value(&mut cursor, "-weak_framework")?,
                LinkAttrs {
                    weak: true,
                    ..LinkAttrs::default()
                },
            )),
            "-needed_framework" => opts.frameworks.push((
                take_value(&mut cursor, "-needed_framework")?,
                LinkAttrs {
                    needed: true,
                    ..LinkAttrs::default()
                },
            )),
            "--must-link" | "-force_load" => {
                opts.positionals.push(PositionalInput {
                    path: PathBuf::from(take_value(&mut cursor, "-force_load")?),
                    must_link: true,
                });
            }
            "--whole-archive" => whole_archive = true,
            "--no-whole-archive" => whole_archive = false,
            "-dylib" | "--shared" | "-shared" => opts.output_mode = OutputMode::Lib,
            "-e" | "-entry" | "--entry" => opts.entry = Some(take_value(&mut cursor, "-e")?),
            "-arch" => {
                opts.target.cpu_arch = match take_value(&mut cursor, "-arch")?.as_str() {
                    "x86_64" => CpuArch::X86_64,
                    "arm64" | "aarch64" => CpuArch::Aarch64,
                    "wasm32" => CpuArch::Wasm32,
                    other => bail!("Unknown -arch {other}"),
                };
            }
            "-syslibroot" | "--sysroot" => {
                opts.syslibroot = Some(PathBuf::from(take_value(&mut cursor, "-syslibroot")?));
            }
            "-stack_size" => {
                opts.stack_size = Some(parse_number(&take_value(&mut cursor, "-stack_size")?)?);
            }
            "-pagezero_size" => {
                opts.pagezero_size =
                    Some(parse_number(&take_value(&mut cursor, "-pagezero_size")?)?);
            }
            "-headerpad" => {
                opts.headerpad_size = Some(parse_number(&take_value(&mut cursor, "-headerpad")?)?);
            }
            "-platform_version" => {
                // platform, min-version, sdk-version. Accepted for
                // compatibility; the build version load command uses defaults.
                cursor += 3;
            }
            "-entitlements" => {
                opts.entitlements = Some(PathBuf::from(take_value(&mut cursor, "-entitlements")?));
            }
            "-install_name" | "-soname" | "--soname" => {
                opts.install_name = Some(take_value(&mut cursor, "-install_name")?);
            }
            "-rpath" | "--rpath" => opts.rpaths.push(take_value(&mut cursor, "-rpath")?),
            "-dead_strip" | "--gc-sections" => opts.dead_strip = true,
            "-dead_strip_dylibs" | "--as-needed" => opts.dead_strip_dylibs = true,
            "-S" | "-s" | "-strip" | "--strip-all" | "--strip-debug" => opts.strip = true,
            "--import-memory" => opts.import_memory = true,
            "--shared-memory" => opts.shared_memory = true,
            "-search_paths_first" => opts.search_strategy = SearchStrategy::PathsFirst,
            "-search_dylibs_first" => opts.search_strategy = SearchStrategy::DylibsFirst,
            "--allow-undefined" => opts.allow_undef = true,
            "-undefined" => {
                let mode = take_value(&mut cursor, "-undefined")?;
                if mode != "dynamic_lookup" {
                    bail!("Unsupported -undefined mode `{mode}`");
                }
                opts.allow_undef = true;
            }
            "--threads" => {
                let n: usize = take_value(&mut cursor, "--threads")?.parse()?;
                opts.num_threads =
                    NonZeroUsize::new(n).unwrap_or_else(|| NonZeroUsize::new(1).unwrap());
            }
            other => {
                if let Some(rest) = other.strip_prefix("-L") {
                    opts.lib_dirs.push(PathBuf::from(rest));
                } else if let Some(rest) = other.strip_prefix("-F") {
                    opts.framework_dirs.push(PathBuf::from(rest));
                } else if let Some(rest) = other.strip_prefix("-l") {
                    opts.libs.push((rest.to_owned(), LinkAttrs::default()));
                } else if other.starts_with('-') {
                    bail!("Unsupported flag `{other}`");
                } else {
                    opts.positionals.push(PositionalInput {
                        path: PathBuf::from(other),
                        must_link: whole_archive,
                    });
                }
            }
        }
    }

    Ok(opts)
}

/// Parse a number with an optional 0x prefix.
pub(crate) fn parse_number(s: &str) -> Result<u64> {
    let value = if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)?
    } else {
        s.parse::<u64>()?
    };
    Ok(value)
}

impl Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Backend::Elf => "ELF",
            Backend::MachO => "Mach-O",
            Backend::Coff => "COFF",
            Backend::Wasm => "WebAssembly",
        };
        Display::fmt(s, f)
    }
}

impl Display for CpuArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CpuArch::X86_64 => "x86_64",
            CpuArch::Aarch64 => "aarch64",
            CpuArch::Wasm32 => "wasm32",
        };
        Display::fmt(s, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_elf() {
        let opts = parse(
            Backend::Elf,
            ["a.o", "b.o", "-o", "out/prog", "-L/usr/lib", "-lc"].iter(),
        )
        .unwrap();
        assert_eq!(opts.positionals.len(), 2);
        assert_eq!(opts.emit.full_path(), PathBuf::from("out/prog"));
        assert_eq!(opts.lib_dirs, vec![PathBuf::from("/usr/lib")]);
        assert_eq!(opts.libs.len(), 1);
        assert_eq!(opts.libs[0].0, "c");
    }

    #[test]
    fn test_parse_macho_dylib() {
        let opts = parse(
            Backend::MachO,
            [
                "-dylib",
                "foo.o",
                "-arch",
                "arm64",
                "-install_name",
                "@rpath/libfoo.dylib",
            ]
            .iter(),
        )
        .unwrap();
        assert_eq!(opts.output_mode, OutputMode::Lib);
        assert_eq!(opts.target.cpu_arch, CpuArch::Aarch64);
        assert_eq!(opts.base_address(), 0);
    }

    #[test]
    fn test_force_load_takes_its_own_file() {
        let opts = parse(Backend::MachO, ["-force_load", "lib.a", "main.o"].iter()).unwrap();
        assert!(opts.positionals[0].must_link);
        assert!(!opts.positionals[1].must_link);
    }

    #[test]
    fn test_whole_archive_is_sticky() {
        let opts = parse(
            Backend::Elf,
            ["--whole-archive", "a.a", "b.a", "--no-whole-archive", "c.a"].iter(),
        )
        .unwrap();
        assert!(opts.positionals[0].must_link);
        assert!(opts.positionals[1].must_link);
        assert!(!opts.positionals[2].must_link);
    }

    #[test]
    fn test_entry_defaults() {
        let elf = Options::new(Backend::Elf, default_target(Backend::Elf));
        assert_eq!(elf.entry_symbol_name(), "_start");
        let macho = Options::new(Backend::MachO, default_target(Backend::MachO));
        assert_eq!(macho.entry_symbol_name(), "_main");
    }
}
