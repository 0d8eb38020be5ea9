//! Bridge daemon CLI: periodically consults chronyd's tracking state and,
//! once it clears the trust thresholds, writes the system clock into the
//! DS3231 via `rtctool -s`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ds3231pps::bridge::{Bridge, BridgeConfig};

/// Gate the system time into the RTC once chrony's tracking stats clear
/// the given thresholds.
#[derive(Parser, Debug)]
#[command(name = "chrony2rtc")]
struct Cli {
    /// chrony stratum must be smaller than this value (1..=15)
    #[arg(short = 's')]
    max_stratum: u16,

    /// chrony correction (seconds) must be smaller than this value, (0,1)
    #[arg(short = 'c')]
    max_correction: f64,

    /// chrony clock skew (ppm) must be smaller than this value, (0,1)
    #[arg(short = 'S')]
    max_skew: f64,

    /// chronyd control socket
    #[arg(short = 'C', default_value = "/run/chrony/chronyd.sock")]
    chronyd_socket: PathBuf,

    /// rtctool pathname
    #[arg(short = 'T', default_value = "/sbin/rtctool")]
    rtctool_path: PathBuf,

    /// daemonize
    #[arg(short = 'd')]
    daemonize: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if !(1..16).contains(&cli.max_stratum) {
        eprintln!("stratum threshold must be in 1..=15");
        return ExitCode::FAILURE;
    }
    if !(cli.max_correction > 0.0 && cli.max_correction < 1.0) {
        eprintln!("correction threshold must be in (0, 1)");
        return ExitCode::FAILURE;
    }
    if !(cli.max_skew > 0.0 && cli.max_skew < 1.0) {
        eprintln!("skew threshold must be in (0, 1)");
        return ExitCode::FAILURE;
    }

    let config = BridgeConfig {
        max_stratum: cli.max_stratum,
        max_correction: cli.max_correction,
        max_skew: cli.max_skew,
        chronyd_socket: cli.chronyd_socket,
        rtctool_path: cli.rtctool_path,
    };

    let mut bridge = match Bridge::new(config) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.daemonize {
        if let Err(e) = daemonize() {
            eprintln!("daemon: {e}");
            return ExitCode::FAILURE;
        }
    }

    match bridge.run() {
        Ok(()) | Err(ds3231pps::Error::Signal) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn daemonize() -> std::io::Result<()> {
    let rc = unsafe { libc::daemon(0, 0) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
