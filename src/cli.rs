use crate::config::loader::DaemonConfig;
use crate::config::paths::{DaemonPaths, PathResolver};
use crate::config::types::{ControlRequest, DaemonError, RuntimeOptions, ServiceAccount};
use crate::core::auth::{CredentialValidator, PermissionCheck};
use crate::core::control_loop::{
    DaemonControlLoop, EngineConfig, RoleConfig, SupervisorConfig, DEFAULT_BOOTSTRAP_TIMEOUT,
};
use crate::core::host::LoggingHost;
use crate::core::lifecycle::dispatch_control_request;
use crate::exec::handoff::{ChannelHandoff, SOCKETPAIR_FLAG};
use crate::exec::permissions::GrantPlan;
use crate::kernel::credentials::is_root;
use crate::kernel::signal::SignalController;
use crate::observability::audit;
use crate::safety::pid_file::PidFile;
use crate::transport::socket_dir::create_socket_file_path;
use crate::utils::env_hygiene::take_ntlm_user_file;
use anyhow::{anyhow, bail, Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use log::{info, warn, LevelFilter};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Config file read when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "/etc/opt/cimd/conf/cimd.json";
/// Service account used by `--nonroot` when none is configured
pub const DEFAULT_SERVICE_ACCOUNT: &str = "cimd";

/// Options shared by `cimserver` and `cimengine`; the engine receives the
/// server's arguments verbatim apart from server-only flags.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, disable_version_flag = true)]
pub struct Cli {
    /// Run as a background daemon
    #[arg(short = 'd', long)]
    daemonize: bool,
    /// Stop the running server
    #[arg(short = 's', long)]
    stop: bool,
    /// Re-read configuration in the running server
    #[arg(short = 'r', long = "reload")]
    reload_config: bool,
    /// Reload protocol dispatch in the running server, keeping providers loaded
    #[arg(long)]
    reload_dispatcher: bool,
    /// Serve through an unprivileged engine process
    #[arg(long = "nonroot")]
    non_root: bool,
    /// Account the engine runs as
    #[arg(long = "service", value_name = "ACCT")]
    service: Option<String>,
    /// Inherited channel descriptor (internal)
    #[arg(long, hide = true, value_name = "FD")]
    socketpair: Option<i32>,
    /// JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Re-root every default path under DIR
    #[arg(long, value_name = "DIR")]
    destdir: Option<PathBuf>,
    /// Print the resolved file locations and exit
    #[arg(long)]
    locations: bool,
    /// Log to standard error
    #[arg(short = 'l', long)]
    logstderr: bool,
    /// fatal|error|warning|info|debug|verbose, or 0-5
    #[arg(long, value_name = "LEVEL")]
    loglevel: Option<String>,
    /// Skip authentication checks (testing only)
    #[arg(long, hide = true)]
    ignore_authentication: bool,
    /// Print version
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,
}

impl Cli {
    /// Merge CLI flags over the config file; CLI wins.
    pub fn runtime_options(&self, config: &DaemonConfig) -> RuntimeOptions {
        RuntimeOptions {
            daemonize: self.daemonize,
            non_root: self.non_root,
            stop: self.stop,
            reload_config: self.reload_config,
            reload_dispatcher: self.reload_dispatcher,
            service_account_name: self
                .service
                .clone()
                .or_else(|| config.service_account.clone()),
            ntlm_cred_file: config.ntlm_cred_file.clone(),
            ignore_authentication: self.ignore_authentication,
            restart: config.restart.clone(),
        }
    }

    pub fn paths(&self, config: &DaemonConfig) -> DaemonPaths {
        match &self.destdir {
            Some(destdir) => config.paths.with_destdir(destdir),
            None => config.paths.clone(),
        }
    }

    fn config_file(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    fn load_config(&self) -> Result<DaemonConfig> {
        let path = self.config_file();
        DaemonConfig::load(&path).with_context(|| format!("loading {}", path.display()))
    }

    /// Log file for `program`, or None when logging goes to stderr.
    fn log_target(&self, paths: &DaemonPaths, program: &str) -> Option<PathBuf> {
        (!self.logstderr).then(|| paths.log_file(program))
    }
}

/// Parse `args`; on help, version or a usage error the exit code to use.
pub fn parse_args<I, T>(args: I) -> std::result::Result<Cli, i32>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => Ok(cli),
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            Err(code)
        }
    }
}

/// Map `--loglevel` onto a log filter.
pub fn parse_log_level(level: &str) -> std::result::Result<LevelFilter, DaemonError> {
    match level.to_ascii_lowercase().as_str() {
        "fatal" | "0" | "error" | "1" => Ok(LevelFilter::Error),
        "warning" | "warn" | "2" => Ok(LevelFilter::Warn),
        "info" | "3" => Ok(LevelFilter::Info),
        "debug" | "4" => Ok(LevelFilter::Debug),
        "verbose" | "5" => Ok(LevelFilter::Trace),
        other => Err(DaemonError::Config(format!("invalid log level: {}", other))),
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Initialise env_logger once. `RUST_LOG` overrides `--loglevel`.
///
/// Records go to `log_file` when given; stderr is used when it is None or the
/// file cannot be opened.
fn init_logging(cli: &Cli, log_file: Option<&Path>) -> Result<()> {
    let level = match cli.loglevel.as_deref() {
        Some(level) => parse_log_level(level)?,
        None => LevelFilter::Warn,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    let mut unopened = None;
    match log_file.map(|path| (path, open_log_file(path))) {
        Some((_, Ok(file))) => {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        Some((path, Err(e))) => {
            builder.target(env_logger::Target::Stderr);
            unopened = Some((path, e));
        }
        None => {
            builder.target(env_logger::Target::Stderr);
        }
    }
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    let _ = builder.try_init();

    if let Some((path, e)) = unopened {
        warn!("Cannot open log file {}: {}; logging to stderr", path.display(), e);
    }
    Ok(())
}

/// Create the run directory if needed and make it the working directory.
fn enter_run_dir(paths: &DaemonPaths) -> Result<()> {
    let run_dir = paths.run_dir();
    std::fs::create_dir_all(run_dir).with_context(|| format!("creating {}", run_dir.display()))?;
    std::env::set_current_dir(run_dir)
        .with_context(|| format!("failed to change directory to {}", run_dir.display()))?;
    Ok(())
}

/// `cimserver` entry point. Returns the process exit code.
pub fn run_server() -> Result<i32> {
    let args: Vec<String> = std::env::args().collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(code) => return Ok(code),
    };

    let config = cli.load_config()?;
    let paths = cli.paths(&config);
    if cli.locations {
        for (name, path) in paths.describe() {
            println!("{}: {}", name, path.display());
        }
        return Ok(0);
    }

    let options = cli.runtime_options(&config);
    let pid_file = PidFile::new(paths.pid_file());

    let request = options.control_request();
    // One-shot requests report on the terminal.
    let log_file = match request {
        ControlRequest::Start => cli.log_target(&paths, "cimserver"),
        _ => None,
    };
    init_logging(&cli, log_file.as_deref())?;

    if request != ControlRequest::Start {
        let outcome = dispatch_control_request(request, &pid_file)?;
        // Not running is informational, never a failure.
        println!("{}", outcome.message());
        return Ok(0);
    }
    dispatch_control_request(ControlRequest::Start, &pid_file)?;

    if !options.ignore_authentication && !is_root() {
        bail!("You must be root to run the server");
    }

    let signals = SignalController::install()?;

    enter_run_dir(&paths)?;

    if options.daemonize {
        nix::unistd::daemon(true, false).context("failed to daemonize")?;
    }

    let _pid_guard = pid_file.acquire()?;
    info!("Server started (pid {})", std::process::id());

    if is_root() {
        let audit_log = paths.log_dir().join("cimserver-audit.log");
        if let Err(e) = audit::init_audit_file(&audit_log) {
            warn!("Audit log disabled: {}", e);
        }
    }

    let ntlm_user_file = take_ntlm_user_file();

    if let Some(cred) = options.ntlm_cred_file.as_deref() {
        if !options.ignore_authentication {
            if let Err(reason) = PermissionCheck.validate(cred) {
                warn!("NTLM credential file rejected: {}", reason);
            }
        }
    }

    let role = if options.non_root {
        let name = options
            .service_account_name
            .as_deref()
            .unwrap_or(DEFAULT_SERVICE_ACCOUNT);
        let account = ServiceAccount::resolve(name)?;
        let engine_socket_path =
            create_socket_file_path(&paths.sockets_dir(), Some(&account), is_root())?;
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let grants = GrantPlan::for_engine(
            &paths,
            options.ntlm_cred_file.as_deref(),
            ntlm_user_file.as_deref(),
            home.as_deref(),
        );
        RoleConfig::Supervisor(SupervisorConfig {
            engine_binary: paths.engine_binary(),
            server_args: args.iter().skip(1).cloned().collect(),
            engine_socket_path,
            client_socket_file: paths.socket_file().to_path_buf(),
            account,
            grants,
        })
    } else {
        RoleConfig::Standalone {
            socket_file: paths.socket_file().to_path_buf(),
        }
    };

    let host = LoggingHost::with_config_file(cli.config_file());
    let report = DaemonControlLoop::new(role, host, signals)
        .with_restart_policy(options.restart.clone())
        .run()?;

    if let Some(revert) = &report.revert {
        for (path, reason) in &revert.failed {
            eprintln!("Unable to change ownership back: {}: {}", path.display(), reason);
        }
    }
    info!("Server exiting (stop signal {})", report.stop_signal);
    Ok(0)
}

/// `cimengine` entry point. Only meaningful when exec'd by the server.
pub fn run_engine() -> Result<i32> {
    let cli = match parse_args(std::env::args()) {
        Ok(cli) => cli,
        Err(code) => return Ok(code),
    };
    let config = cli.load_config()?;
    let paths = cli.paths(&config);
    init_logging(&cli, cli.log_target(&paths, "cimengine").as_deref())?;
    enter_run_dir(&paths)?;

    let fd = cli
        .socketpair
        .ok_or_else(|| anyhow!("cimengine must be started by cimserver ({} missing)", SOCKETPAIR_FLAG))?;
    let (channel, secret) = ChannelHandoff::from_inherited(fd).into_stream()?;
    if is_root() && !cli.ignore_authentication {
        warn!("Engine is running as root");
    }

    let signals = SignalController::install()?;

    let report = DaemonControlLoop::new(
        RoleConfig::Engine(EngineConfig {
            channel,
            secret,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
        }),
        LoggingHost::with_config_file(cli.config_file()),
        signals,
    )
    .with_restart_policy(config.restart)
    .run()?;

    info!("Engine exiting after {} cycle(s)", report.cycles);
    Ok(0)
}
