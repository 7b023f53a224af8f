/// Xplice CLI - ahead-of-time compiler and runner for the Xplice language.
use clap::Parser as ClapParser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(name = "xplice")]
#[command(about = "Xplice — ahead-of-time compiler and stack VM")]
struct Cli {
    /// Path to an Xplice source file
    path: Option<PathBuf>,

    /// Show version information
    #[arg(long)]
    version: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.version {
        println!("{}", xplice_cli::VERSION_BANNER);
        return ExitCode::SUCCESS;
    }

    let Some(path) = cli.path else {
        eprintln!("Compile Error:\nno input file given (see --help)");
        return ExitCode::FAILURE;
    };

    let source = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Compile Error:\ncould not read {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let (code, diagnostic) = xplice_cli::compile_and_run(&source, Box::new(std::io::stdout()));
    if let Some(msg) = diagnostic {
        eprintln!("{}", msg);
    }
    ExitCode::from(code as u8)
}
