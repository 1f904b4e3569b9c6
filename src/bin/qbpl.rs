//! Match a binary file against a BPL protocol and print the resulting DOM.
//!
//! Usage:
//!   qbpl [-p PROTO.bpl] [OPTIONS] FILE
//!   qbpl -p PROTO.bpl < file.bin
//!
//! Options:
//!   -p, --proto FILE   Protocol description; defaults to
//!                      `$HOME/.qbpl/formats/<ext>.bpl` for the input's extension
//!   -o, --out FILE     Write output (including `dump` rules) to FILE instead of stdout
//!   --json             Print the DOM as JSON instead of the indented dump
//!   --case-type        Record matched case labels as `_type`
//!   --disasm           Print the compiled bytecode and exit
//!
//! If no input file is given, reads from stdin. Exits non-zero on any failure.

use anyhow::{bail, Context as _};
use bpl::{dump_dom, Context, Input, Options, Protocol};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

struct Args {
    proto: PathBuf,
    out: Option<String>,
    input: Option<String>,
    json: bool,
    case_type: bool,
    disasm: bool,
}

fn take_value(args: &mut Vec<String>, names: &[&str]) -> anyhow::Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| names.contains(&a.as_str())) else {
        return Ok(None);
    };
    args.remove(pos);
    if pos >= args.len() {
        bail!("{} requires a value", names[0]);
    }
    Ok(Some(args.remove(pos)))
}

fn take_flag(args: &mut Vec<String>, name: &str) -> bool {
    match args.iter().position(|a| a == name) {
        Some(pos) => {
            args.remove(pos);
            true
        }
        None => false,
    }
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let proto = take_value(&mut args, &["-p", "--proto"])?;
    let out = take_value(&mut args, &["-o", "--out"])?;
    let json = take_flag(&mut args, "--json");
    let case_type = take_flag(&mut args, "--case-type");
    let disasm = take_flag(&mut args, "--disasm");
    if let Some(unknown) = args.iter().find(|a| a.starts_with('-') && a.len() > 1) {
        bail!("unknown option: {}", unknown);
    }
    if args.len() > 1 {
        bail!("at most one input file expected, got {}", args.len());
    }
    let input = args.pop();
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let proto = match (proto, &input, &home) {
        (Some(p), _, _) => PathBuf::from(p),
        (None, Some(file), Some(home)) => match default_proto_path(file, home) {
            Some(p) => p,
            None => bail!("cannot guess a protocol for {}; pass -p", file),
        },
        _ => bail!("usage: qbpl -p PROTO.bpl [-o OUT] [--json] [--case-type] [--disasm] [FILE]"),
    };
    Ok(Args { proto, out, input, json, case_type, disasm })
}

/// Per-extension protocol under the user's format directory.
fn default_proto_path(input: &str, home: &Path) -> Option<PathBuf> {
    let ext = Path::new(input).extension()?.to_str()?.to_ascii_lowercase();
    Some(home.join(".qbpl").join("formats").join(format!("{}.bpl", ext)))
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let proto_name = args.proto.display().to_string();
    let src = std::fs::read(&args.proto).with_context(|| format!("reading {}", proto_name))?;
    let proto = Protocol::with_options(&src, &proto_name, Options { case_type: args.case_type })?;

    // `dump` rules and the final DOM share one destination.
    let (mut out, dumper): (Box<dyn Write>, Box<dyn Write>) = match &args.out {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path))?;
            let dumper = file.try_clone().with_context(|| format!("cloning handle for {}", path))?;
            (Box::new(file), Box::new(dumper))
        }
        None => (Box::new(io::stdout()), Box::new(io::stdout())),
    };

    if args.disasm {
        out.write_all(proto.disassemble().as_bytes())?;
        return Ok(());
    }

    let reader: Box<dyn Read> = match &args.input {
        Some(path) => Box::new(BufReader::new(File::open(path).with_context(|| format!("opening {}", path))?)),
        None => Box::new(io::stdin().lock()),
    };

    let mut ctx = Context::new();
    ctx.set_dumper(dumper);
    let dom = match proto.safe_match(&mut Input::new(reader), &mut ctx) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    if args.json {
        writeln!(out, "{}", dom.to_json())?;
    } else {
        out.write_all(dump_dom(&dom).as_bytes())?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_guessed_from_extension() {
        let home = Path::new("/home/ana");
        assert_eq!(
            default_proto_path("captures/screen.GIF", home),
            Some(PathBuf::from("/home/ana/.qbpl/formats/gif.bpl"))
        );
        assert_eq!(default_proto_path("no_extension", home), None);
    }
}
