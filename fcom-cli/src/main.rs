//! The `fcom` command line: verbs forwarding to the toolchain crates.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use fcom_link::{LinkInput, LinkOptions, RelinkCommands};
use fcom_obj::{Library, Member, ObjectFile};
use fcom_vm::{Config, Emulator, ExitStatus};

#[derive(Parser)]
#[command(name = "fcom", version, about = "ForwardCom binary tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble a source file into an object module.
    #[command(name = "ass", long_flag = "ass")]
    Assemble {
        /// Source file.
        input: PathBuf,
        /// Output object file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Disassemble an object or executable.
    #[command(name = "dis", long_flag = "dis")]
    Disassemble {
        /// Object or executable file.
        input: PathBuf,
        /// Output listing; stdout when absent.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Link object modules and libraries into an executable.
    #[command(name = "link", long_flag = "link")]
    Link {
        /// Object modules and `.li` libraries, in search order.
        inputs: Vec<PathBuf>,
        /// Output executable.
        #[arg(short, long)]
        output: PathBuf,
        /// Entry symbol.
        #[arg(long, default_value = "main")]
        entry: String,
        /// Keep per-module metadata for later relinking.
        #[arg(long)]
        relink: bool,
        /// Permit unresolved symbols.
        #[arg(long)]
        incomplete: bool,
    },
    /// Split a relinkable executable, replace modules, and relink.
    #[command(name = "relink", long_flag = "relink")]
    Relink {
        /// The relinkable executable.
        input: PathBuf,
        /// Output executable.
        #[arg(short, long)]
        output: PathBuf,
        /// Replace a module: the file name must match a module name.
        #[arg(long)]
        replace: Vec<PathBuf>,
        /// Remove a module by name.
        #[arg(long)]
        remove: Vec<String>,
        /// Add a module.
        #[arg(long)]
        add: Vec<PathBuf>,
    },
    /// Manage a static library.
    #[command(name = "lib", long_flag = "lib")]
    Lib {
        /// The library file; created when absent.
        library: PathBuf,
        /// Add or replace members (`a`).
        #[arg(short, long)]
        add: Vec<PathBuf>,
        /// Delete members by name (`d`).
        #[arg(short, long)]
        delete: Vec<String>,
        /// Extract a member to a file (`x`).
        #[arg(short = 'x', long)]
        extract: Vec<String>,
        /// List members and their exports (`t`).
        #[arg(short, long)]
        list: bool,
    },
    /// Run an executable in the emulator.
    #[command(name = "emu", long_flag = "emu")]
    Emulate {
        /// The executable.
        input: PathBuf,
        /// Stop after this many instructions.
        #[arg(long)]
        step_limit: Option<u64>,
    },
    /// Dump the structure of an object or executable.
    #[command(name = "dump", long_flag = "dump")]
    Dump {
        /// Object or executable file.
        input: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("fcom: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Assemble { input, output } => {
            let source = fs::read_to_string(&input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            match fcom_as::assemble(&source) {
                Ok(out) => {
                    for d in &out.diagnostics {
                        eprintln!("{}: {d}", input.display());
                    }
                    let path = output.unwrap_or_else(|| input.with_extension("ob"));
                    fs::write(&path, out.object.write()?)
                        .with_context(|| format!("cannot write {}", path.display()))?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(failure) => {
                    for d in &failure.diagnostics {
                        eprintln!("{}: {d}", input.display());
                    }
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Disassemble { input, output } => {
            let obj = read_object(&input)?;
            let text = fcom_as::disassemble(&obj)?;
            match output {
                Some(path) => fs::write(&path, text)
                    .with_context(|| format!("cannot write {}", path.display()))?,
                None => print!("{text}"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Link {
            inputs,
            output,
            entry,
            relink,
            incomplete,
        } => {
            let mut link_input = LinkInput::default();
            for path in &inputs {
                if path.extension().is_some_and(|e| e == "li") {
                    let data = fs::read(path)
                        .with_context(|| format!("cannot read {}", path.display()))?;
                    link_input
                        .libraries
                        .push((file_name(path), Library::read(&data)?));
                } else {
                    link_input.modules.push((file_name(path), read_object(path)?));
                }
            }
            let options = LinkOptions {
                entry,
                relinkable: relink,
                allow_unresolved: incomplete,
                ..LinkOptions::default()
            };
            let linked = fcom_link::link(link_input, &options)?;
            for w in &linked.warnings {
                eprintln!("warning: {w}");
            }
            fs::write(&output, linked.executable.write()?)
                .with_context(|| format!("cannot write {}", output.display()))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Relink {
            input,
            output,
            replace,
            remove,
            add,
        } => {
            let exe = read_object(&input)?;
            let commands = RelinkCommands {
                replace: replace
                    .iter()
                    .map(|p| Ok((file_name(p), read_object(p)?)))
                    .collect::<Result<_>>()?,
                remove,
                add: add
                    .iter()
                    .map(|p| Ok((file_name(p), read_object(p)?)))
                    .collect::<Result<_>>()?,
            };
            let options = LinkOptions {
                relinkable: true,
                ..LinkOptions::default()
            };
            let linked = fcom_link::relink(&exe, commands, &options)?;
            for w in &linked.warnings {
                eprintln!("warning: {w}");
            }
            fs::write(&output, linked.executable.write()?)
                .with_context(|| format!("cannot write {}", output.display()))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Lib {
            library,
            add,
            delete,
            extract,
            list,
        } => run_lib(&library, &add, &delete, &extract, list),
        Command::Emulate { input, step_limit } => {
            let exe = read_object(&input)?;
            let config = Config {
                step_limit,
                ..Config::default()
            };
            let mut emu = Emulator::new(&exe, &config)?;
            let status = emu.run(&config)?;
            let counters = emu.counters();
            eprintln!(
                "executed {} instructions ({} jumps, {} vector)",
                counters.instructions, counters.jumps, counters.vector_instructions
            );
            match status {
                ExitStatus::Returned(v) | ExitStatus::SysExit(v) => {
                    Ok(ExitCode::from((v & 0xff) as u8))
                }
            }
        }
        Command::Dump { input } => {
            let obj = read_object(&input)?;
            dump(&obj);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_lib(
    library: &Path,
    add: &[PathBuf],
    delete: &[String],
    extract: &[String],
    list: bool,
) -> Result<ExitCode> {
    let mut lib = if library.exists() {
        let data =
            fs::read(library).with_context(|| format!("cannot read {}", library.display()))?;
        Library::read(&data)?
    } else {
        Library::new()
    };

    // duplicate names on one command line are a usage error
    for (i, a) in add.iter().enumerate() {
        if add[..i].iter().any(|b| file_name(a) == file_name(b)) {
            bail!("duplicate member name {} on command line", file_name(a));
        }
    }

    for name in delete {
        lib.delete_member(name)?;
    }
    for path in add {
        let data = fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
        lib.add_member(Member {
            name: file_name(path),
            data,
        });
    }
    for name in extract {
        let member = lib
            .member(name)
            .ok_or_else(|| anyhow::anyhow!("member {name} not found"))?;
        fs::write(name, &member.data)?;
    }
    if list {
        for member in lib.members() {
            println!("{}", member.name);
            for (sym, _) in member.exports()? {
                println!("    {sym}");
            }
        }
    }
    if !add.is_empty() || !delete.is_empty() {
        fs::write(library, lib.write()?)
            .with_context(|| format!("cannot write {}", library.display()))?;
    }
    Ok(ExitCode::SUCCESS)
}

fn read_object(path: &Path) -> Result<ObjectFile> {
    let data = fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    Ok(ObjectFile::read(&data)?)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn dump(obj: &ObjectFile) {
    println!(
        "{} entry={:#x} ip_base={:#x} datap_base={:#x} relinkable={}",
        if obj.is_executable {
            "executable"
        } else {
            "object"
        },
        obj.entry,
        obj.ip_base,
        obj.datap_base,
        obj.relinkable,
    );
    println!("sections:");
    for (i, s) in obj.sections.iter().enumerate() {
        println!(
            "  [{i}] {:<16} addr={:#010x} size={:#8x} align=2^{} flags={:?} module={}",
            s.name,
            s.addr,
            s.size(),
            s.align,
            s.flags,
            s.module
        );
    }
    println!("symbols:");
    for s in obj.symbols.iter() {
        println!(
            "  {:<24} value={:#010x} {} {} section={:?}",
            s.name, s.value, s.binding, s.sym_type, s.section
        );
    }
    if !obj.relocations.is_empty() {
        println!("relocations:");
        for r in &obj.relocations {
            println!(
                "  section {} offset {:#x}: {} {} -> {}",
                r.section, r.offset, r.kind, r.size, r.sym
            );
        }
    }
}
