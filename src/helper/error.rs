use std::panic::Location;

/// Marker used to attach the call-site of a failed read/write to an error
/// variant, the same way [`std::panic::Location`] is attached to a panic.
pub type ProblemLocation = &'static Location<'static>;

/// Problems raised while reading an ELF input object or a bundle (§4.1-4.2).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ParseProblem {
    #[error("{0} is not a valid object: {1}")]
    NotAnObject(String, &'static str),

    #[error("{0}: wrong relocation kind (expected {1})")]
    WrongKind(String, &'static str),

    #[error("invalid header: {0}")]
    InvalidHeader(&'static str, ProblemLocation),

    #[error("invalid data: {0}")]
    InvalidData(&'static str, ProblemLocation),

    #[error("invalid range: {0}")]
    InvalidRange(&'static str, ProblemLocation),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(usize, ProblemLocation),

    #[error("unknown relocation type: {0}")]
    UnknownRelocationType(u8, ProblemLocation),
}

/// Problems raised by the symbol resolver (§4.3).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ResolveProblem {
    #[error("{path}:({section}+{offset:#06x}): undefined reference to '{symbol}'")]
    UndefinedReference {
        path:    String,
        section: String,
        offset:  u32,
        symbol:  String,
    },
}

/// Problems raised while assembling a bundle (§4.4-4.6, §4.11).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum BuildProblem {
    #[error("no host object given")]
    MissingHost,

    #[error("module name is not valid UTF-8: {0}")]
    InvalidModuleName(String),

    #[error("module too large to encode ({0} bytes)")]
    ModuleTooLarge(usize),
}

/// Problems raised by the runtime loader (§4.7-§4.9).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum LoadProblem {
    #[error("module '{0}' not found")]
    NotFound(String),

    #[error("allocation failed for {0} bytes (align {1})")]
    AllocationFailed(usize, u32),

    #[error("rom read failed at offset {0} for {1} bytes")]
    RomReadFailed(u32, usize),

    #[error("loader has not been initialised")]
    NotInitialised,
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("parse: {0}")]
    Parse(#[from] ParseProblem),

    #[error("resolve: {0}")]
    Resolve(#[from] ResolveProblem),

    #[error("build: {0}")]
    Build(#[from] BuildProblem),

    #[error("load: {0}")]
    Load(#[from] LoadProblem),

    #[error("io error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err.into());
        }
    };
}

pub(crate) use ensure;
