//! BBB HVAC logic core daemon.
//!
//! Startup order: logging, optional daemonization, signal handlers,
//! privilege drop, configuration load, watchdog, listener, one serial
//! worker per configured board, then the logic loop. After that the main
//! thread reaps dead workers once a second (restarting serial workers
//! through the registry's death listener) until shutdown is requested.

use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use tracing::{error, info, warn};

use hvaclib::config::BoardDef;
use hvaclib::listener::{DEFAULT_SOCKET_PATH, DEFAULT_TCP_INTERFACE, DEFAULT_TCP_PORT, ListenAddr};
use hvaclib::registry::ThreadRegistry;
use hvaclib::{ConfigStore, LogicLoop, Runtime, SerialWorker, runtime};

/// Default PID file written when daemonized.
const PID_FILE: &str = "/tmp/bbb_hvac.pid";

/// Configuration file read from the working directory.
const CONFIG_FILE: &str = "configuration.cfg";

/// User assumed after startup when launched as root.
const PROC_USER: &str = "nobody";

/// Group assumed after startup when launched as root.
const PROC_GROUP: &str = "nogroup";

/// logic-core — BBB HVAC control daemon.
#[derive(Parser)]
#[command(name = "logic-core", version, about)]
#[command(group(ArgGroup::new("transport").required(true).args(["domain", "inet"])))]
struct Cli {
    /// Listen on the local Unix-domain command socket.
    #[arg(short = 'd')]
    domain: bool,

    /// Listen on a TCP socket.
    #[arg(short = 'i')]
    inet: bool,

    /// Address to listen on: socket path with -d, interface with -i.
    #[arg(short = 'a')]
    address: Option<String>,

    /// Port to listen on; relevant only with -i.
    #[arg(short = 'p', default_value_t = DEFAULT_TCP_PORT)]
    port: u16,

    /// Log file; stderr when absent.
    #[arg(short = 'l')]
    logfile: Option<PathBuf>,

    /// Run as a daemon (server mode).
    #[arg(short = 's')]
    server: bool,

    /// Verbose logging.
    #[arg(short = 'v')]
    verbose: bool,
}

impl Cli {
    fn listen_addr(&self) -> ListenAddr {
        if self.inet {
            ListenAddr::Tcp(
                self.address
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TCP_INTERFACE.to_string()),
                self.port,
            )
        } else {
            ListenAddr::Unix(PathBuf::from(
                self.address
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string()),
            ))
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if cli.server {
        if let Err(e) = daemonize() {
            eprintln!("failed to daemonize: {e}");
            std::process::exit(-1);
        }
    }

    init_logging(&cli);

    info!("starting up BBB HVAC logic core");

    if let Err(e) = run(&cli) {
        error!("startup failed: {e}");
        std::process::exit(-1);
    }

    info!("orderly shutdown complete");
}

fn run(cli: &Cli) -> hvaclib::Result<()> {
    runtime::install_signal_handlers()?;
    drop_privileges();

    let config = ConfigStore::load(CONFIG_FILE)?;
    let boards: Vec<BoardDef> = config.boards().to_vec();

    let rt = Runtime::start()?;

    let logic = LogicLoop::new(config, Arc::clone(&rt.registry));
    hvaclib::listener::start(Arc::clone(&rt.registry), Arc::clone(&logic), cli.listen_addr())?;

    for board in &boards {
        start_board_worker(&rt.registry, board)?;
    }

    install_io_death_listener(&rt, boards);

    // Give the boards a moment to reset and announce before the logic
    // loop starts consuming their caches.
    std::thread::sleep(Duration::from_secs(2));
    logic.spawn(&rt.registry, rt.watchdog.clone())?;

    // Main reap loop.
    let never = AtomicBool::new(false);
    while !runtime::shutdown_requested() {
        hvaclib::sync::interruptible_sleep(Duration::from_secs(1), &never);
        if let Err(e) = rt.registry.cleanup() {
            error!("registry cleanup failed: {e}");
        }
    }

    rt.teardown();
    Ok(())
}

fn start_board_worker(
    registry: &Arc<ThreadRegistry>,
    board: &BoardDef,
) -> hvaclib::Result<()> {
    info!(board = %board.tag, device = %board.device, "starting board worker");
    SerialWorker::new(board).spawn(registry)
}

/// Restarts a serial worker whose thread died, by board tag.
fn install_io_death_listener(rt: &Runtime, boards: Vec<BoardDef>) {
    let registry = Arc::clone(&rt.registry);

    rt.registry.set_io_death_listener(Box::new(move |tag| {
        warn!(board = %tag, "serial worker death sensed");

        let Some(board) = boards.iter().find(|b| b.tag == tag) else {
            error!(board = %tag, "no BOARD record for dead worker");
            return;
        };

        if let Err(e) = start_board_worker(&registry, board) {
            error!(board = %tag, "failed to restart serial worker; aborting: {e}");
            runtime::request_shutdown();
        }
    }));
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::EnvFilter;

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &cli.logfile {
        Some(path) => {
            let file = match std::fs::File::options().create(true).append(true).open(path) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("failed to open log file {}: {e}", path.display());
                    std::process::exit(-1);
                }
            };
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Classic daemonization: fork, new session, standard streams on
/// /dev/null, PID file with owner-only permissions.
fn daemonize() -> std::io::Result<()> {
    use std::io::Write;
    use std::os::fd::AsRawFd;

    // SAFETY: single-threaded at this point; nothing has spawned yet.
    match unsafe { nix::unistd::fork() }.map_err(std::io::Error::from)? {
        nix::unistd::ForkResult::Parent { .. } => std::process::exit(0),
        nix::unistd::ForkResult::Child => {}
    }

    nix::unistd::setsid().map_err(std::io::Error::from)?;

    let null = std::fs::File::options()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in 0..=2 {
        nix::unistd::dup2(null.as_raw_fd(), fd).map_err(std::io::Error::from)?;
    }

    let mut pid_file = std::fs::File::options()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(PID_FILE)?;
    writeln!(pid_file, "{}", std::process::id())?;

    Ok(())
}

/// Drops to the unprivileged service user when running as root.
fn drop_privileges() {
    if !nix::unistd::Uid::effective().is_root() {
        return;
    }

    let group = match nix::unistd::Group::from_name(PROC_GROUP) {
        Ok(Some(group)) => group,
        _ => {
            warn!(group = PROC_GROUP, "service group not found; keeping privileges");
            return;
        }
    };
    let user = match nix::unistd::User::from_name(PROC_USER) {
        Ok(Some(user)) => user,
        _ => {
            warn!(user = PROC_USER, "service user not found; keeping privileges");
            return;
        }
    };

    if let Err(e) = nix::unistd::setgid(group.gid) {
        error!("failed to drop group privileges: {e}");
        std::process::exit(-1);
    }
    if let Err(e) = nix::unistd::setuid(user.uid) {
        error!("failed to drop user privileges: {e}");
        std::process::exit(-1);
    }

    info!(user = PROC_USER, group = PROC_GROUP, "dropped privileges");
}
