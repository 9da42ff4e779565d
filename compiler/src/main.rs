use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use soulc::diag::SourceChunk;
use soulc::{Compiler, LinkOptions};

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// The textual HEART dump (default)
    Heart,
    /// A stable hash of the compiled program
    Hash,
}

#[derive(Parser, Debug)]
#[command(
    name = "soulc",
    version,
    about = "SOUL compiler front-end — compiles .soul processors and graphs to HEART"
)]
struct Cli {
    /// Input .soul source files (linked together)
    sources: Vec<PathBuf>,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Name of the main processor
    #[arg(long)]
    main_processor: Option<String>,

    /// Maximum per-processor state size in bytes
    #[arg(long, default_value_t = 20 * 1024 * 1024)]
    max_state_size: u64,

    /// Maximum expression nesting depth during lowering
    #[arg(long, default_value_t = 255)]
    max_expression_depth: u32,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Heart)]
    emit: EmitStage,

    /// Print compiler phases
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.sources.is_empty() {
        eprintln!("soulc: error: no input files");
        return ExitCode::from(2);
    }

    let mut compiler = Compiler::new();

    for path in &cli.sources {
        if cli.verbose {
            eprintln!("soulc: adding {}", path.display());
        }
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("soulc: error: cannot read {}: {e}", path.display());
                return ExitCode::from(2);
            }
        };
        let chunk = SourceChunk::new(path.display().to_string(), text);
        if let Err(e) = compiler.add_code(chunk) {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }

    let options = LinkOptions {
        main_processor: cli.main_processor.clone(),
        max_state_size: cli.max_state_size,
        max_expression_depth: cli.max_expression_depth,
    };

    if cli.verbose {
        eprintln!("soulc: linking");
    }

    let program = match compiler.link(&options) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let output = match cli.emit {
        EmitStage::Heart => program.to_heart(),
        EmitStage::Hash => format!("{}\n", program.hash()),
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, output) {
                eprintln!("soulc: error: cannot write {}: {e}", path.display());
                return ExitCode::from(2);
            }
        }
        None => print!("{output}"),
    }

    ExitCode::SUCCESS
}
