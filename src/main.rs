use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use log::{debug, info, LevelFilter};
use std::path::PathBuf;

use ocidiff::{DiffOptions, DiffRunner, DockerCli, FilterSource};

const DEFAULT_HOST: &str = "unix:///var/run/docker.sock";
const DEFAULT_PRESERVE_DIR: &str = "/tmp";

#[derive(Parser)]
#[command(author, version, about = "Show changes between two container images", long_about = None)]
struct Cli {
    #[arg(value_name = "IMAGE1", help = "First image reference or ID")]
    image1: String,

    #[arg(value_name = "IMAGE2", help = "Second image reference or ID")]
    image2: String,

    #[arg(
        short,
        long,
        help = "Lower verbosity of the diff output; modules emit abbreviated 'modified' entries"
    )]
    silent: bool,

    #[arg(
        short,
        long,
        value_name = "FILE",
        num_args = 0..=1,
        help = "Enable output filtering; optionally specify a JSON rules file (built-in rules by default)"
    )]
    filter: Option<Option<PathBuf>>,

    #[arg(short, long, value_name = "FILE", help = "Output file (stdout by default)")]
    output: Option<PathBuf>,

    #[arg(
        short,
        long,
        value_name = "DIR",
        num_args = 0..=1,
        help = "Do not remove the directories with extracted images; optionally specify where to extract ('/tmp' by default)"
    )]
    preserve: Option<Option<PathBuf>>,

    #[arg(
        long,
        value_name = "SOCKET",
        default_value = DEFAULT_HOST,
        help = "Engine daemon socket to connect to"
    )]
    host: String,

    #[arg(
        short = 'l',
        long = "logging",
        value_name = "LEVEL",
        default_value_t = 30,
        value_parser = parse_log_level,
        help = "Logging level: 10 (debug), 20 (info), 30 (warn), 40 (error), 50 (critical)"
    )]
    logging: u8,

    #[arg(short, long, help = "Print additional debug information (same as -l 10)")]
    debug: bool,
}

fn parse_log_level(value: &str) -> Result<u8, String> {
    match value {
        "10" | "20" | "30" | "40" | "50" => Ok(value.parse().unwrap()),
        _ => Err(String::from("must be one of 10, 20, 30, 40, 50")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { 10 } else { cli.logging };
    let log_level = match level {
        10 => LevelFilter::Debug,
        20 => LevelFilter::Info,
        30 => LevelFilter::Warn,
        _ => LevelFilter::Error,
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(log_level)
        .init();

    info!("Comparing images {} and {}", cli.image1, cli.image2);
    debug!("Engine host: {}", cli.host);

    let options = DiffOptions {
        silent: cli.silent,
        filter: cli.filter.map(|path| match path {
            Some(path) => FilterSource::File(path),
            None => FilterSource::Builtin,
        }),
        preserve: cli.preserve.is_some(),
        extract_root: match &cli.preserve {
            Some(Some(dir)) => Some(dir.clone()),
            Some(None) => Some(PathBuf::from(DEFAULT_PRESERVE_DIR)),
            None => None,
        },
    };

    let engine = DockerCli::new(cli.host.as_str());
    let runner = DiffRunner::new(engine);
    let result = runner.diff(&cli.image1, &cli.image2, &options)?;

    ocidiff::processor::write_result(&result, cli.output.as_deref())?;
    Ok(())
}
