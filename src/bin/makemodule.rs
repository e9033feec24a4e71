//! Command-line front end for the packager (C10, §4.11, §6): reads a host
//! ELF and zero or more relocatable module ELFs from disk and writes one
//! bundle file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ultramod::packager::{build_bundle, ModuleInput};

#[derive(Parser, Debug)]
#[command(
    name = "makemodule",
    bin_name = "makemodule",
    version = env!("CARGO_PKG_VERSION"),
    about = "Package a host ELF and relocatable module ELFs into an ultramod bundle",
    long_about = None
)]
struct Args {
    /// Path to write the bundle to
    out: PathBuf,
    /// Path to the host's non-relocatable ELF
    host: PathBuf,
    /// Paths to each relocatable module's ELF, in bundle order
    modules: Vec<PathBuf>,
    /// Enable debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

fn module_name(path: &std::path::Path) -> String {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("module").to_string()
}

fn run(args: &Args) -> ultramod::Result<()> {
    let host_data = std::fs::read(&args.host).map_err(ultramod::Error::Io)?;
    let host_path = args.host.display().to_string();

    let module_data: Vec<Vec<u8>> =
        args.modules.iter().map(std::fs::read).collect::<std::io::Result<_>>().map_err(ultramod::Error::Io)?;
    let inputs: Vec<ModuleInput> = args
        .modules
        .iter()
        .zip(module_data.iter())
        .map(|(path, data)| ModuleInput {
            path: path.display().to_string(),
            name: module_name(path),
            data,
        })
        .collect();

    let bundle = build_bundle(&host_path, &host_data, &inputs)?;
    std::fs::write(&args.out, &bundle).map_err(ultramod::Error::Io)?;
    log::info!(target: "ultramod::packager", "wrote {} ({} byte(s))", args.out.display(), bundle.len());
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("makemodule: {err}");
            ExitCode::FAILURE
        },
    }
}
