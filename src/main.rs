pub mod args;

use std::{path::Path, process::ExitCode, time::Instant};

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use mtkhax::{ProgressEvent, UnlockPayloads};

fn read_payload(what: &str, path: &Path) -> anyhow::Result<Vec<u8>> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read {what} from '{}'", path.display()))?;

    if data.is_empty() {
        anyhow::bail!("{what} '{}' is empty", path.display());
    }

    Ok(data)
}

fn main() -> ExitCode {
    let args = args::CliArgs::parse();

    match EnvFilter::builder()
        .with_env_var("MTKHAX_TRACE")
        .try_from_env()
    {
        Ok(filter) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_max_level(
                    args.log_level
                        .map(tracing::Level::from)
                        .unwrap_or(tracing::Level::WARN),
                )
                .init();
        }
    };

    let payloads = match load_payloads(&args) {
        Ok(payloads) => payloads,
        Err(why) => {
            eprintln!("{why:#}");
            return ExitCode::FAILURE;
        }
    };

    println!("Power off the device, then connect it over USB while holding volume down.");
    println!("Waiting for a MediaTek BROM device...");

    let start = Instant::now();

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] [{wide_bar}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );

    let mut on_progress = |event: ProgressEvent| {
        pb.println(format!("[{}] {}", event.phase, event.step));
        pb.set_position((event.progress * 100.0) as u64);
        pb.set_message(event.phase);
    };

    let outcome = match mtkhax::unlock(&payloads, Some(&mut on_progress)) {
        Ok(outcome) => {
            pb.finish();
            outcome
        }
        Err(why) => {
            pb.abandon();
            eprintln!("{why}");
            return ExitCode::FAILURE;
        }
    };

    if outcome.frp_modified {
        println!("FRP unlock flag set.");
    } else {
        println!("FRP unlock flag was already set.");
    }
    if outcome.rebooted_to_fastboot {
        println!("Device is rebooting to fastboot. Run 'fastboot flashing unlock' to finish.");
    } else {
        println!("Shutdown command was not acknowledged; reboot the device manually.");
    }

    println!("Finished in {:.02}s!", start.elapsed().as_secs_f64());
    ExitCode::SUCCESS
}

fn load_payloads(args: &args::CliArgs) -> anyhow::Result<UnlockPayloads> {
    Ok(UnlockPayloads {
        exploit: read_payload("exploit payload", &args.payload)?,
        da1: read_payload("stage-1 DA", &args.da1)?,
        da2: read_payload("stage-2 DA", &args.da2)?,
    })
}
