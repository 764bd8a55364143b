//! Pascal compiler CLI
//!
//! The `pasc` command drives the front-end: tokenize, parse, check, or
//! lower a source file to IR. Exit codes: 0 on success, 1 for source
//! errors, 2 for internal errors.

use clap::{Parser, Subcommand};
use miette::{LabeledSpan, NamedSource};
use pasc::ir::{print_module, Lowerer};
use pasc::{lexer, parser};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "pasc")]
#[command(version = pasc::VERSION)]
#[command(about = "Pascal compiler front-end", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a Pascal source file to IR
    Build {
        /// Input file to compile
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Emit tokens (for debugging)
        #[arg(long)]
        emit_tokens: bool,

        /// Emit AST (for debugging)
        #[arg(long)]
        emit_ast: bool,

        /// Emit IR
        #[arg(long)]
        emit_ir: bool,
    },

    /// Check a file for errors without emitting anything
    Check {
        /// Input file to check
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Tokenize a file and print the tokens
    Tokenize {
        /// Input file to tokenize
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Parse a file and print the AST
    Parse {
        /// Input file to parse
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },
}

const EXIT_SOURCE_ERRORS: u8 = 1;
const EXIT_INTERNAL_ERROR: u8 = 2;

fn read_source(input: &PathBuf) -> Result<String, ExitCode> {
    fs::read_to_string(input).map_err(|e| {
        eprintln!("error: failed to read {}: {}", input.display(), e);
        ExitCode::from(EXIT_SOURCE_ERRORS)
    })
}

fn report_parse_errors(
    input: &PathBuf,
    source: &str,
    errors: &[parser::ParseError],
) -> ExitCode {
    for err in errors {
        let span = err.span();
        let report = miette::miette!(
            labels = vec![LabeledSpan::at(span.start..span.end, err.to_string())],
            "syntax error"
        )
        .with_source_code(NamedSource::new(
            input.display().to_string(),
            source.to_string(),
        ));
        eprintln!("{:?}", report);
    }
    eprintln!("found {} error(s)", errors.len());
    ExitCode::from(EXIT_SOURCE_ERRORS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { input, emit_tokens, emit_ast, emit_ir } => {
            let source = match read_source(&input) {
                Ok(s) => s,
                Err(code) => return code,
            };

            if emit_tokens {
                let (tokens, _) = lexer::lex(&source);
                for token in &tokens {
                    println!("{:?} @ {} = {:?}", token.kind, token.span, token.text(&source));
                }
            }

            let (program, mut types, errors) = parser::parse(&source);
            if emit_ast {
                println!("{:#?}", program);
            }
            // A nonzero error count suppresses code emission.
            if !errors.is_empty() {
                return report_parse_errors(&input, &source, &errors);
            }

            let module_name = if program.name.is_empty() {
                input
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "main".to_string())
            } else {
                program.name.clone()
            };

            let lowerer = Lowerer::new(module_name, &mut types);
            match lowerer.lower_program(&program) {
                Ok(module) => {
                    if emit_ir {
                        println!("{}", print_module(&module));
                    }
                    ExitCode::SUCCESS
                }
                Err(errors) => {
                    for err in &errors {
                        let pos = err.span().position(&source);
                        eprintln!("{}:{}: {}", input.display(), pos, err);
                    }
                    ExitCode::from(EXIT_INTERNAL_ERROR)
                }
            }
        }

        Commands::Check { input } => {
            let source = match read_source(&input) {
                Ok(s) => s,
                Err(code) => return code,
            };
            let (_, _, errors) = parser::parse(&source);
            if !errors.is_empty() {
                return report_parse_errors(&input, &source, &errors);
            }
            println!("no errors found");
            ExitCode::SUCCESS
        }

        Commands::Tokenize { input } => {
            let source = match read_source(&input) {
                Ok(s) => s,
                Err(code) => return code,
            };
            let (tokens, errors) = lexer::lex(&source);
            for token in &tokens {
                println!(
                    "{:>4}..{:<4} {:20} {:?}",
                    token.span.start,
                    token.span.end,
                    format!("{:?}", token.kind),
                    token.text(&source)
                );
            }
            if !errors.is_empty() {
                for err in &errors {
                    eprintln!("lexer error: {}", err);
                }
                return ExitCode::from(EXIT_SOURCE_ERRORS);
            }
            ExitCode::SUCCESS
        }

        Commands::Parse { input } => {
            let source = match read_source(&input) {
                Ok(s) => s,
                Err(code) => return code,
            };
            let (program, _, errors) = parser::parse(&source);
            println!("{:#?}", program);
            if !errors.is_empty() {
                return report_parse_errors(&input, &source, &errors);
            }
            ExitCode::SUCCESS
        }
    }
}
