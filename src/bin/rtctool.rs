//! One-shot RTC control tool: read/write the DS3231's time, aging register
//! and PPS-on-SQW status, estimate aging, print temperature, or run as the
//! long-lived NTP SHM publisher daemon.

use std::process::ExitCode;

use chrono::{TimeZone, Utc};
use clap::Parser;

use ds3231pps::devio::PpsDevice;
use ds3231pps::error::{Error, Result};
use ds3231pps::{calib, rtc, shm, systime, timexfer};

/// A helper tool for the DS3231 RTC chip with SQW connected for PPS.
#[derive(Parser, Debug)]
#[command(name = "rtctool")]
struct Cli {
    /// print rtc time
    #[arg(short = 't')]
    print_time: bool,

    /// system time to rtc time
    #[arg(short = 's')]
    systohc: bool,

    /// rtc time to system time
    #[arg(short = 'r')]
    hctosys: bool,

    /// print ageing value
    #[arg(short = 'a')]
    print_aging: bool,

    /// set ageing value (-127 <= value <= 127)
    #[arg(short = 'A')]
    set_aging: Option<i32>,

    /// print PPS output status
    #[arg(short = 'p')]
    print_pps: bool,

    /// enable/disable PPS output (1=enable, 0=disable)
    #[arg(short = 'P')]
    set_pps: Option<u32>,

    /// estimate ageing value (requires good NTP sync and takes ~30 minutes)
    #[arg(short = 'e')]
    estimate: bool,

    /// run as SHM master clock daemon
    #[arg(short = 'd')]
    shm_daemon: bool,

    /// print chip temperature
    #[arg(short = 'T')]
    temperature: bool,

    /// i2c bus number, range 0-1
    #[arg(short = 'i', default_value_t = 1)]
    i2c_bus: i32,

    /// pps device number, range 0-3
    #[arg(short = 'c', default_value_t = 0)]
    pps_id: i32,

    /// ntp shared memory id, range 0-9
    #[arg(short = 'n', default_value_t = 2)]
    shm_id: i32,

    /// daemonize and run in background
    #[arg(short = 'b')]
    background: bool,
}

enum Op {
    PrintTime,
    SysToHc,
    HcToSys,
    PrintAging,
    SetAging(i8),
    PrintPps,
    SetPps(bool),
    Estimate,
    ShmDaemon,
    Temperature,
}

fn resolve_operation(cli: &Cli) -> Option<Op> {
    let mut chosen = Vec::new();
    if cli.print_time {
        chosen.push(Op::PrintTime);
    }
    if cli.systohc {
        chosen.push(Op::SysToHc);
    }
    if cli.hctosys {
        chosen.push(Op::HcToSys);
    }
    if cli.print_aging {
        chosen.push(Op::PrintAging);
    }
    if let Some(v) = cli.set_aging {
        if !(-127..=127).contains(&v) {
            return None;
        }
        chosen.push(Op::SetAging(v as i8));
    }
    if cli.print_pps {
        chosen.push(Op::PrintPps);
    }
    if let Some(v) = cli.set_pps {
        if v > 1 {
            return None;
        }
        chosen.push(Op::SetPps(v == 1));
    }
    if cli.estimate {
        chosen.push(Op::Estimate);
    }
    if cli.shm_daemon {
        chosen.push(Op::ShmDaemon);
    }
    if cli.temperature {
        chosen.push(Op::Temperature);
    }

    if chosen.len() != 1 {
        return None;
    }
    chosen.pop()
}

/// Whether `op` needs real-time scheduling elevation: the two PPS-aligned
/// transfers, calibration, and the SHM daemon all sit on the critical path.
fn needs_realtime(op: &Op) -> bool {
    matches!(op, Op::SysToHc | Op::HcToSys | Op::Estimate | Op::ShmDaemon)
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if !(0..=1).contains(&cli.i2c_bus) || !(0..=3).contains(&cli.pps_id) || !(0..=9).contains(&cli.shm_id) {
        eprintln!("bus/pps/shm id out of range");
        return ExitCode::FAILURE;
    }

    let Some(op) = resolve_operation(&cli) else {
        eprintln!("exactly one operation flag must be given, with values in range");
        return ExitCode::FAILURE;
    };

    if cli.background && !matches!(op, Op::ShmDaemon) {
        eprintln!("-b is only valid with -d");
        return ExitCode::FAILURE;
    }

    if needs_realtime(&op) {
        if let Err(e) = systime::raise_realtime_priority() {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }

    match run(&cli, op) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, op: Op) -> Result<()> {
    match op {
        Op::PrintTime => {
            let i2c = rtc::open(cli.i2c_bus)?;
            let t = rtc::read_time(&i2c)?;
            let epoch = timexfer::to_epoch(&t);
            let dt = Utc.timestamp_opt(epoch, 0).single().ok_or_else(|| {
                Error::Validation("rtc time out of representable range".into())
            })?;
            println!("{}", dt.format("%a %F %T"));
            Ok(())
        }

        Op::SysToHc => {
            let i2c = rtc::open(cli.i2c_bus)?;
            timexfer::systohc(&i2c)
        }

        Op::HcToSys => {
            let i2c = rtc::open(cli.i2c_bus)?;
            match PpsDevice::open(cli.pps_id) {
                Ok(pps) => timexfer::hctosys_pps(&i2c, &pps).or_else(|_| {
                    eprintln!("Warning: Using PPS for precise transfer failed, guessing now...");
                    timexfer::hctosys_guessed(&i2c)
                }),
                Err(_) => {
                    eprintln!("Warning: Using PPS for precise transfer failed, guessing now...");
                    timexfer::hctosys_guessed(&i2c)
                }
            }
        }

        Op::PrintAging => {
            let i2c = rtc::open(cli.i2c_bus)?;
            let v = rtc::get_aging(&i2c)?;
            println!("Ageing value: {v}");
            Ok(())
        }

        Op::SetAging(v) => {
            let i2c = rtc::open(cli.i2c_bus)?;
            rtc::set_aging(&i2c, v)
        }

        Op::PrintPps => {
            let i2c = rtc::open(cli.i2c_bus)?;
            match rtc::pps_query(&i2c)? {
                rtc::PpsStatus::Disabled => println!("PPS output on SQW pin disabled."),
                rtc::PpsStatus::Enabled => println!("PPS output on SQW pin enabled."),
            }
            Ok(())
        }

        Op::SetPps(enable) => {
            let i2c = rtc::open(cli.i2c_bus)?;
            if enable {
                rtc::pps_enable(&i2c)
            } else {
                rtc::pps_disable(&i2c)
            }
        }

        Op::Estimate => {
            let i2c = rtc::open(cli.i2c_bus)?;
            let pps = PpsDevice::open(cli.pps_id)?;
            let value = calib::estimate_aging(&i2c, &pps, calib::DEFAULT_ITERATIONS, |current, total| {
                eprint!("\rPlease wait, {current}/{total} ticks elapsed...        ");
                true
            })?;
            eprintln!();
            println!("Estimated ageing value: {value}");
            Ok(())
        }

        Op::ShmDaemon => {
            let mut publisher = shm::ShmPublisher::start(cli.i2c_bus, cli.pps_id, cli.shm_id)?;
            if cli.background {
                let rc = unsafe { libc::daemon(0, 0) };
                if rc != 0 {
                    return Err(Error::Device("daemon() failed".into()));
                }
            }
            publisher.run()
        }

        Op::Temperature => {
            let i2c = rtc::open(cli.i2c_bus)?;
            let centi = rtc::get_temperature(&i2c)?;
            if centi < 0 {
                let abs = -centi;
                println!("Temperature: -{}.{:02}\u{b0}C", abs / 100, abs % 100);
            } else {
                println!("Temperature: {}.{:02}\u{b0}C", centi / 100, centi % 100);
            }
            Ok(())
        }
    }
}
