use std::path::PathBuf;

use anyhow::{bail, Result};

use social_tui::app::RunOptions;

const HELP: &str = "social-tui: read your social feed, comment threads and friends from the terminal.

  --version, -V        Show version and exit
  --help,    -h        Show this help message
  --demo               Browse built-in sample data instead of the server
  --config <PATH>      Read settings from PATH instead of the default location
  --token <TOKEN>      Save an access token to the config file and exit";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match handle_cli_flags(&args) {
        Ok(Some(opts)) => opts,
        Ok(None) => return,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };

    if let Err(err) = social_tui::run(opts) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// `Ok(None)` when a flag was handled and the program should exit.
fn handle_cli_flags(args: &[String]) -> Result<Option<RunOptions>> {
    let mut opts = RunOptions::default();
    let mut token: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("social-tui {}", social_tui::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{HELP}");
                return Ok(None);
            }
            "--demo" => opts.demo = true,
            "--config" => match iter.next() {
                Some(path) => opts.config_file = Some(PathBuf::from(path)),
                None => bail!("--config needs a path"),
            },
            "--token" => match iter.next() {
                Some(value) => token = Some(value.clone()),
                None => bail!("--token needs a value"),
            },
            other => bail!("unknown argument: {other} (see --help)"),
        }
    }

    if let Some(token) = token {
        let path = social_tui::config::save_token(opts.config_file.clone(), &token)?;
        println!("Saved access token to {}", path.display());
        return Ok(None);
    }
    Ok(Some(opts))
}
