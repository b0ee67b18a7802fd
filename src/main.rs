//! unlzexe decompresses DOS executables packed with LZEXE 0.90 or 0.91.
//!
//! ```sh
//! unlzexe packed.exe unpacked.exe
//! ```
//!
//! # Logging
//!
//! Warnings are printed to stderr. `--debug` also prints what the
//! decompressor finds along the way. The `RUST_LOG` environment variable
//! overrides both.
//!
//! # Exit status
//!
//! Exit status is 0 if there was no error, or 1 if there was any kind of error
//! (usage error, I/O error, EXE file format error, or LZEXE format error).
//!
//! # References
//!
//! * <https://bellard.org/lzexe.html>

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use log::info;
use thiserror::Error;

use unlzexe::{exe, lzexe};

/// An error that may occur while unpacking an EXE file.
#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Exe(#[from] exe::FormatError),
    #[error(transparent)]
    Lzexe(#[from] lzexe::Error),
}

impl From<exe::Error> for Error {
    fn from(err: exe::Error) -> Self {
        match err {
            exe::Error::Io(err) => Error::Io(err),
            exe::Error::Format(err) => Error::Exe(err),
        }
    }
}

/// An `Error` annotated with a `Path`.
#[derive(Debug, Error)]
#[error("{}: {}", .path.display(), .err)]
struct PathError {
    path: PathBuf,
    err: Error,
}

impl PathError {
    fn new<P: AsRef<Path>>(path: P, err: Error) -> Self {
        Self { path: path.as_ref().to_owned(), err }
    }
}

/// Reads a packed EXE from `input_path`, unpacks it, and writes the unpacked
/// EXE to `output_path`.
fn process<P, Q>(input_path: P, output_path: Q) -> Result<(), PathError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    // Read and unpack the input. Any error here gets annotated with
    // input_path.
    let output_exe = (|| -> Result<_, Error> {
        let input = File::open(&input_path)?;
        let len = input.metadata()?.len();
        let mut input = io::BufReader::new(input);
        let input_exe = exe::Exe::read(&mut input, Some(len))?;
        let output_exe = lzexe::unpack(&input_exe)?;
        Ok(output_exe)
    })()
        .map_err(|err| PathError::new(&input_path, err))?;

    // Save output_exe to a file. Any error here gets annotated with
    // output_path.
    let n = (|| -> Result<_, Error> {
        let output = File::create(&output_path)?;
        let mut output = io::BufWriter::new(output);
        let n = output_exe.write(&mut output)?;
        output.flush()?;
        Ok(n)
    })()
        .map_err(|err| PathError::new(&output_path, err))?;

    info!("wrote {} bytes with {} relocations to {}",
        n, output_exe.relocs.len(), output_path.as_ref().display());
    Ok(())
}

const USAGE: &str = "\
Usage: unlzexe [OPTION]... INPUT.EXE OUTPUT.EXE
Decompress a DOS EXE executable packed with LZEXE 0.90 or 0.91.

Options:
        --debug     show what the decompressor finds
    -h, --help      show this help
";

struct Args {
    debug: bool,
    input_path: PathBuf,
    output_path: PathBuf,
}

/// Parses the command line. Returns `None` if help was requested.
fn parse_args() -> Result<Option<Args>, lexopt::Error> {
    use lexopt::prelude::*;

    let mut debug = false;
    let mut free: Vec<OsString> = Vec::new();
    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Long("debug") => debug = true,
            Short('h') | Long("help") => return Ok(None),
            Value(value) => free.push(value),
            _ => return Err(arg.unexpected()),
        }
    }

    let [input_path, output_path]: [OsString; 2] = free.try_into()
        .map_err(|free: Vec<OsString>| format!("need INPUT.EXE and OUTPUT.EXE arguments, got {}", free.len()))?;
    Ok(Some(Args {
        debug,
        input_path: input_path.into(),
        output_path: output_path.into(),
    }))
}

fn main() {
    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => {
            print!("{}", USAGE);
            return;
        }
        Err(err) => {
            eprint!("{}", USAGE);
            eprintln!("\n{}", err);
            process::exit(1);
        }
    };

    let default_filter = if args.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();

    if let Err(err) = process(&args.input_path, &args.output_path) {
        eprintln!("{}", err);
        process::exit(1);
    }
}
