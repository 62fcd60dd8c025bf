use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use points_core::cfg::{self, AppId};
use points_core::{logx, store, Record, RecordId, Records};
use serde::Serialize;
use tracing::debug;

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    // Shares config and data with the daemon.
    application: "pointsd",
};

#[derive(Parser)]
#[command(name=env!("CARGO_PKG_NAME"), version, about="Inspect the points record store")]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Config file (defaults to the daemon's config)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all records
    List,
    /// Show one record
    Get { id: RecordId },
    /// Show where config and records live
    Paths,
}

#[derive(Serialize)]
struct Paths {
    config: Option<PathBuf>,
    data_dir: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose { 0 => "warn", 1 => "debug", _ => "trace" };
    logx::init(level);

    let cfg = match &cli.config {
        Some(path) => cfg::load_or_init_at(path)?,
        None => cfg::load_or_init(&APP)?,
    };
    let data_dir = cfg.data_dir(&APP)?;
    debug!("data_dir={}", data_dir.display());

    match cli.cmd {
        Command::Paths => {
            let paths = Paths { config: cli.config.clone(), data_dir };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&paths)?);
            } else {
                match &paths.config {
                    Some(p) => println!("config   {}", p.display()),
                    None => println!("config   {}", cfg::config_dir(&APP)?.join("config.toml").display()),
                }
                println!("records  {}", paths.data_dir.display());
            }
        }
        Command::List => {
            let records = Records::new(store::open_default(&data_dir)?).list()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("no records");
            } else {
                for r in &records {
                    print_line(r);
                }
            }
        }
        Command::Get { id } => {
            let record = Records::new(store::open_default(&data_dir)?).get(id)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_line(&record);
            }
        }
    }
    Ok(())
}

fn print_line(r: &Record) {
    println!("{:>6}  {} {}  {}  points={}", r.id, r.name, r.surname, r.birthday, r.points);
}
