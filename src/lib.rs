//! ultramod is a miniature dynamic module loader and linker for embedded
//! MIPS targets: an offline packager turns a host ELF plus a set of
//! relocatable module ELFs into one bundle, and a runtime loader maps,
//! links, and unlinks modules from that bundle against a host image
//! already running in RAM (§1-§2 of the design this crate follows).
//!
//! The crate is split so a target build can link only the runtime half:
//! [`bundle`], [`platform`], and [`loader`] depend on nothing beyond
//! `thiserror`/`log`/`num_enum`. The packager half — [`elf`], [`resolver`],
//! [`encoder`], [`packager`] — pulls in the `object` crate to read ELF
//! input and lives behind the `packager` feature (on by default, since
//! most development and CI work wants both halves available).
//!
//! ```no_run
//! use ultramod::{LoaderContext, platform::HostPlatform};
//!
//! # fn main() -> ultramod::Result<()> {
//! let rom = std::fs::read("game.bundle")?;
//! let platform = HostPlatform::new(rom);
//! let mut ctx = LoaderContext::init(platform)?;
//! let handle = ctx.find("boss_ai").expect("module present in bundle");
//! ctx.load(handle)?;
//! ctx.unload(handle);
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod loader;
pub mod platform;

mod helper;

#[cfg(feature = "packager")]
pub mod elf;
#[cfg(feature = "packager")]
pub mod encoder;
#[cfg(feature = "packager")]
pub mod packager;
#[cfg(feature = "packager")]
pub mod resolver;

pub use helper::{BuildProblem, Error, LoadProblem, ParseProblem, ResolveProblem, Result};
pub use loader::{Handle, LoaderContext};
pub use platform::{Address, Platform};
