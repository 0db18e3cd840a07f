use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

mod process;
mod report;
mod tracker;

use process::ProcessConnector;
use report::{Node, Report};
use tracker::{ConnectionTracker, TrackerConfig};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn main() -> Result<()> {
    let matches = Command::new("netprobe")
        .version("0.1.0")
        .about("Host probe observing TCP connections and processes, one report per tick")
        .arg(
            Arg::new("host-id")
                .long("host-id")
                .value_name("ID")
                .help("Identifier stamped into every node id (default: hostname)"),
        )
        .arg(
            Arg::new("hostname")
                .long("hostname")
                .value_name("NAME")
                .help("Host name reported on the host node (default: kernel hostname)"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .value_name("SECONDS")
                .help("Reporting interval")
                .value_parser(clap::value_parser!(u64))
                .default_value("3"),
        )
        .arg(
            Arg::new("proc-root")
                .long("proc-root")
                .value_name("PATH")
                .help("Root of the proc filesystem")
                .default_value("/proc"),
        )
        .arg(
            Arg::new("conntrack-buffer-size")
                .long("conntrack-buffer-size")
                .value_name("BYTES")
                .help("conntrack subprocess pipe buffer")
                .value_parser(clap::value_parser!(usize))
                .default_value("1048576"),
        )
        .arg(
            Arg::new("no-spy-procs")
                .long("no-spy-procs")
                .help("Do not attribute scanned sockets to PIDs")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-conntrack")
                .long("no-conntrack")
                .help("Disable the conntrack flow walker")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-walk-proc")
                .long("no-walk-proc")
                .help("Disable periodic /proc scanning")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("ebpf")
                .long("ebpf")
                .help("Prefer the eBPF connection source")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("off, error, warn, info, debug or trace")
                .default_value("info"),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Emit a single report and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let level = matches
        .get_one::<String>("log-level")
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    TermLogger::init(
        level,
        LogConfig::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    let kernel_hostname = read_kernel_hostname();
    let host_id = matches
        .get_one::<String>("host-id")
        .cloned()
        .unwrap_or_else(|| kernel_hostname.clone());
    let host_name = matches
        .get_one::<String>("hostname")
        .cloned()
        .unwrap_or(kernel_hostname);
    let proc_root = PathBuf::from(matches.get_one::<String>("proc-root").expect("has default"));
    let interval = Duration::from_secs(*matches.get_one::<u64>("interval").expect("has default"));
    let once = matches.get_flag("once");

    info!("starting netprobe on {} ({})", host_name, host_id);

    let conf = TrackerConfig {
        host_id: host_id.clone(),
        host_name: host_name.clone(),
        spy_procs: !matches.get_flag("no-spy-procs"),
        use_conntrack: !matches.get_flag("no-conntrack"),
        walk_proc: !matches.get_flag("no-walk-proc"),
        use_ebpf_conn: matches.get_flag("ebpf"),
        proc_root: proc_root.clone(),
        buffer_size: *matches
            .get_one::<usize>("conntrack-buffer-size")
            .expect("has default"),
        scanner: None,
        dns_snooper: None,
    };

    let mut connector = ProcessConnector::new(&proc_root);
    if !connector.running() {
        warn!("process reporting degraded: proc connector is not running");
    }
    let mut conn_tracker = ConnectionTracker::new(conf);

    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    while RUNNING.load(Ordering::SeqCst) {
        let tick_start = Instant::now();
        let report = make_report(&host_id, &host_name, &conn_tracker, &connector);

        match serde_json::to_string(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("failed to serialize report: {}", e),
        }

        if once {
            break;
        }
        while RUNNING.load(Ordering::SeqCst) && tick_start.elapsed() < interval {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    conn_tracker.stop();
    connector.stop();
    info!("netprobe shutting down");
    Ok(())
}

fn make_report(
    host_id: &str,
    host_name: &str,
    conn_tracker: &ConnectionTracker,
    connector: &ProcessConnector,
) -> Report {
    let mut rpt = Report::new();
    let host_node_id = report::make_host_node_id(host_id);

    rpt.host
        .add_node(Node::new(host_node_id.clone()).with_latest(report::NAME, host_name));

    // A tick error yields the report so far; the next tick tries again.
    if let Err(e) = conn_tracker.report_connections(&mut rpt) {
        error!("connection report failed: {}", e);
    }

    connector.walk(|p| {
        rpt.process.add_node(
            Node::new(report::make_process_node_id(host_id, p.pid))
                .with_latest(report::PID, p.pid.to_string())
                .with_latest(report::NAME, p.name.clone())
                .with_latest(report::CMDLINE, p.cmdline.clone())
                .with_latest(report::HOST_NODE_ID, host_node_id.clone()),
        );
    });

    rpt
}

fn read_kernel_hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
