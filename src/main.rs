use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use doof::compiler;
use doof::config::BuildOptions;

#[derive(Parser)]
#[command(name = "doofc")]
#[command(about = "Bytecode compiler backend for the doof language", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a validated-AST file to a bytecode document
    Compile {
        /// The validated-AST JSON file produced by the validator
        file: PathBuf,

        /// Output path (defaults to the input with a .bc.json extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Skip the debug section
        #[arg(long)]
        no_debug: bool,

        /// Fixed generatedAt value (for reproducible artifacts)
        #[arg(long)]
        generated_at: Option<String>,

        /// Print a disassembly listing to stderr
        #[arg(long)]
        dump_bytecode: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            file,
            output,
            no_debug,
            generated_at,
            dump_bytecode,
        } => {
            let project_dir = file.parent().unwrap_or_else(|| Path::new("."));
            let mut options = BuildOptions::load_or_default(project_dir);
            if no_debug {
                options.emit_debug = false;
            }
            if generated_at.is_some() {
                options.generated_at = generated_at;
            }

            let document = match compiler::compile_file(&file, &options) {
                Ok(document) => document,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };

            if dump_bytecode {
                eprint!("{}", document.disassemble());
            }

            let out_path = output
                .or(options.output)
                .unwrap_or_else(|| file.with_extension("bc.json"));
            if let Err(e) = std::fs::write(&out_path, document.to_json()) {
                eprintln!("error: failed to write {}: {}", out_path.display(), e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
