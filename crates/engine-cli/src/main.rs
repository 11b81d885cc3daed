//! UCI front end for the rxiangqi engine

mod engine;
mod stdin_reader;

use anyhow::Result;
use clap::Parser;

use engine::Engine;
use stdin_reader::spawn_stdin_reader;

#[derive(Parser, Debug)]
#[command(author, version, about = "rxiangqi UCI engine", long_about = None)]
struct Args {
    /// Enable debug logging to stderr
    #[arg(short, long)]
    debug: bool,

    /// Run the built-in benchmark and exit
    #[arg(long)]
    bench: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .target(env_logger::Target::Stderr)
        .init();

    log::info!("rxiangqi starting");
    engine_core::init();

    let mut engine = Engine::new()?;

    if args.bench {
        engine.bench();
        return Ok(());
    }

    let rx = spawn_stdin_reader();
    for line in rx {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if !engine.handle_command(&line)? {
            break;
        }
    }

    engine.quit();
    Ok(())
}
