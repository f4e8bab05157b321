//! Memory-bandwidth regulation daemon.
//!
//! Brings up the regulator over the perf_event backend and serves the
//! configuration surface on stdin, one command per line:
//!
//! ```text
//! enable_regulation=1
//! regulation_interval_ms=2
//! show
//! quit
//! ```
//!
//! Run as root (or with CAP_PERFMON and CAP_SYS_NICE) so the raw counters
//! can be opened and the throttlers get FIFO priority.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use log::error;

use bwguard::{Controller, Plan, Regulator};

#[cfg(target_os = "linux")]
use bwguard::linux::PerfCounterProvider;

const PARAMS: &[&str] = &[
    "enable_regulation",
    "regulation_interval_ms",
    "observation_interval_ms",
    "sliding_window_size",
    "llc_miss_event_id",
];

fn usage() -> ! {
    eprintln!("Usage: bwguardd [--cores LIST] [--coordinator N] [--pool MB] [--controller lms|pid]");
    eprintln!();
    eprintln!("  --cores LIST      comma-separated worker cores (default 1,2,3,4)");
    eprintln!("  --coordinator N   core for the coordinator loop (default 0)");
    eprintln!("  --pool MB         machine-wide bandwidth pool in MB/s (default 25600)");
    eprintln!("  --controller C    budget controller, lms (default) or pid");
    std::process::exit(2);
}

fn parse_args() -> Plan {
    let mut plan = Plan::default();
    let mut controller = Controller::Lms;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--cores" => {
                let list = args.next().unwrap_or_else(|| usage());
                let cores: Result<Vec<usize>, _> =
                    list.split(',').map(|c| c.trim().parse()).collect();
                match cores {
                    Ok(cores) if !cores.is_empty() => plan = Plan::new(cores),
                    _ => usage(),
                }
            }
            "--controller" => {
                controller = match args.next().as_deref() {
                    Some("lms") => Controller::Lms,
                    Some("pid") => Controller::Pid,
                    _ => usage(),
                }
            }
            "--coordinator" => {
                plan.coordinator_core = args.next().and_then(|v| v.parse().ok()).unwrap_or_else(|| usage())
            }
            "--pool" => {
                plan.bw_total_available_mb =
                    args.next().and_then(|v| v.parse().ok()).unwrap_or_else(|| usage())
            }
            _ => usage(),
        }
    }
    plan.controller = controller;
    plan
}

fn show(regulator: &Regulator) {
    for name in PARAMS {
        if let Some(value) = regulator.render(name) {
            println!("{}={}", name, value);
        }
    }
    for st in regulator.status() {
        println!(
            "worker {} (core {}): used={} MB/s avg={} MB/s est={} MB/s budget={} events throttled={} episodes={}",
            st.id,
            st.core,
            st.last_delta_mb,
            regulator.average_mb(st.id).unwrap_or(0),
            st.next_estimate,
            st.budget_events,
            st.throttled,
            st.throttle_episodes,
        );
    }
}

#[cfg(target_os = "linux")]
fn main() {
    env_logger::init();
    let plan = parse_args();

    let regulator = match Regulator::new(plan, Arc::new(PerfCounterProvider)) {
        Ok(r) => r,
        Err(e) => {
            error!("could not create regulator: {}", e);
            std::process::exit(1);
        }
    };
    println!("bwguard ready; regulation disabled. Commands: name=value | show | quit");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let line = line.trim();
        match line {
            "" => continue,
            "quit" | "exit" => break,
            "show" => show(&regulator),
            _ => {
                let mut parts = line.splitn(2, '=');
                let name = parts.next().unwrap_or("").trim();
                match parts.next() {
                    Some(value) => match regulator.apply(name, value) {
                        Ok(()) => println!("ok"),
                        Err(e) => println!("error: {}", e),
                    },
                    None => match regulator.render(name) {
                        Some(value) => println!("{}={}", name, value),
                        None => println!("error: unknown parameter {:?}", name),
                    },
                }
            }
        }
        io::stdout().flush().ok();
    }

    regulator.shutdown();
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("bwguardd requires Linux perf_event support");
    std::process::exit(1);
}
