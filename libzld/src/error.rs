pub(crate) use anyhow::Context;
pub(crate) use anyhow::Error;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Errors with a fixed identity. `NotObject` / `NotArchive` / `NotDylib` are
/// recoverable during format identification (try the next candidate);
/// everything else is fatal for the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The file is well-formed enough to identify, but isn't a relocatable
    /// object for the selected backend.
    NotObject,
    NotArchive,
    NotDylib,
    MalformedArchive,
    EmptyStubFile,
    MismatchedCpuArchitecture,
    UnsupportedCpuArchitecture,
    UndefinedSymbolReference(String),
    MultipleSymbolDefinitions(String),
    MissingMainEntrypoint(String),
    LibraryNotFound(String),
    FrameworkNotFound(String),
}

impl Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::NotObject => write!(f, "not a relocatable object file"),
            LinkError::NotArchive => write!(f, "not an archive"),
            LinkError::NotDylib => write!(f, "not a dylib or text stub"),
            LinkError::MalformedArchive => write!(f, "malformed archive"),
            LinkError::EmptyStubFile => write!(f, "text stub contains no exported symbols"),
            LinkError::MismatchedCpuArchitecture => {
                write!(f, "file was built for a different CPU architecture")
            }
            LinkError::UnsupportedCpuArchitecture => {
                write!(f, "unsupported CPU architecture")
            }
            LinkError::UndefinedSymbolReference(name) => {
                write!(f, "undefined symbol: {name}")
            }
            LinkError::MultipleSymbolDefinitions(name) => {
                write!(f, "duplicate symbol: {name}")
            }
            LinkError::MissingMainEntrypoint(name) => {
                write!(f, "undefined entry point: {name}")
            }
            LinkError::LibraryNotFound(name) => write!(f, "library not found: -l{name}"),
            LinkError::FrameworkNotFound(name) => {
                write!(f, "framework not found: -framework {name}")
            }
        }
    }
}

impl core::error::Error for LinkError {}

/// Like debug_assert, but bails instead of panicking. An error lets us attach
/// which file / symbol we were processing, whereas a panic only gives a
/// backtrace.
#[macro_export]
macro_rules! debug_assert_bail {
    ($e:expr, $($rest:tt)*) => {
        if cfg!(debug_assertions) && !$e {
            anyhow::bail!($($rest)*);
        }
    };
}

/// Prints a warning. Warnings never stop the link unless the resource they
/// describe turns out to be required during resolution.
pub(crate) fn warning(message: &str) {
    eprintln!("warning: zld: {message}");
}
