use std::process::ExitCode;

use ctop_core::{load_query_config, system_query_with, QueryConfig};
use log::{debug, LevelFilter};

struct Args {
    json: bool,
    verbose: bool,
    config: Option<String>,
}

fn usage() -> ExitCode {
    eprintln!("usage: ctop [--json] [-v] [--config <path>]");
    eprintln!("  --json           print the topology as JSON");
    eprintln!("  -v, --verbose    log each decoding step to stderr");
    eprintln!("  --config <path>  read sysfs/proc roots and affinity policy from a file");
    ExitCode::from(2)
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Option<Args> {
    let mut parsed = Args {
        json: false,
        verbose: false,
        config: None,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => parsed.json = true,
            "-v" | "--verbose" => parsed.verbose = true,
            "--config" => parsed.config = Some(args.next()?),
            _ => return None,
        }
    }
    Some(parsed)
}

fn main() -> ExitCode {
    let Some(args) = parse_args(std::env::args().skip(1)) else {
        return usage();
    };

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Warn };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let config = match &args.config {
        Some(path) => match load_query_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("ctop: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => QueryConfig::default(),
    };
    debug!("query config: {:?}", config);

    let info = match system_query_with(&config) {
        Ok(info) => info,
        Err(e) => {
            eprintln!("ctop: {e}");
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&info) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("ctop: failed to serialize topology: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print!("{info}");
    }
    ExitCode::SUCCESS
}
