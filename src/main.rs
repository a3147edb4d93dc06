use std::{
    error::Error,
    io,
    net::SocketAddr,
    path::PathBuf,
    process,
    sync::Arc,
    time::{Duration, SystemTime},
};

use clap::{command, Parser, Subcommand, ValueHint};
use log::{debug, error, info, trace, warn, LevelFilter};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use url::Url;
use uuid::Uuid;

use booster::{
    callback::Callback,
    config::Config,
    credential::Credential,
    hub::NotificationHub,
    issuer::{Accounts, CredentialIssuer},
    lifecycle::{self, KeepAlive},
    player::{PlaybackBackend, WebApi},
    push::{self, Notice},
    refresh::RefreshCoordinator,
    scheduler::{Scheduler, Tick},
    secrets::ClientCredentials,
    session::SessionFile,
    signal,
    store::CredentialStore,
    util::{format_time, parse_time},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Window length when only `--start` is given.
const DEFAULT_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// Holds the client id, client secret and redirect URI of the registered
    /// application. Keep it secure: the client secret lets anyone act as this
    /// application.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Session file
    ///
    /// Where the access and refresh tokens are kept between runs.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value = "session.toml")]
    session_file: PathBuf,

    /// Address to serve renewal notifications on
    #[arg(short, long, value_name = "ADDR", default_value_t = Config::DEFAULT_PUSH_ADDR)]
    bind: SocketAddr,

    /// Device to start playback on
    ///
    /// [default: the active device]
    #[arg(short, long)]
    device: Option<String>,

    /// Track to start, e.g. `spotify:track:4uLU6hMCjMI75M1A2tKUQC`
    ///
    /// [default: resume the current context]
    #[arg(short, long)]
    track: Option<String>,

    /// Start of the playback window (RFC 3339)
    #[arg(long, value_name = "TIME")]
    start: Option<String>,

    /// End of the playback window (RFC 3339)
    ///
    /// [default: one hour after start]
    #[arg(long, value_name = "TIME", requires = "start")]
    end: Option<String>,

    /// Seconds between reconciliation ticks
    #[arg(long, value_name = "SECONDS", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    tick: u64,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Log in to the account
    ///
    /// Without a code, prints the URL to grant access at and waits for the
    /// redirect when the redirect URI points at this host. Otherwise, pass
    /// the `code` parameter of the redirect to store the session.
    Login {
        #[arg(long)]
        code: Option<String>,
    },

    /// Forget the stored session
    Logout,

    /// List the playback devices of the account
    Devices,

    /// Follow renewal notifications of a running daemon
    Watch {
        /// Push server to connect to
        ///
        /// [default: the bind address]
        #[arg(long, value_name = "URL")]
        url: Option<Url>,
    },
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
        logger.filter_module("booster", level);
    }

    logger.init();
}

/// Loads the client credentials, with a hint when they are missing.
fn load_credentials(secrets_file: &str) -> io::Result<ClientCredentials> {
    let credentials = ClientCredentials::from_file(secrets_file);

    if let Err(ref e) = credentials {
        if e.kind() == io::ErrorKind::NotFound {
            info!("copy secrets.toml.example to {secrets_file} and fill in your client registration");
        }
    }

    credentials
}

/// Parses the playback window from the command line.
///
/// An unparsable window is logged and ignored, so that the daemon keeps the
/// session alive regardless.
fn window(args: &Args) -> Option<(SystemTime, SystemTime)> {
    let start = match parse_time(args.start.as_deref()?) {
        Ok(start) => start,
        Err(e) => {
            error!("ignoring window start: {e}");
            return None;
        }
    };

    let end = match args.end.as_deref().map(parse_time) {
        Some(Ok(end)) => end,
        Some(Err(e)) => {
            error!("ignoring window end: {e}");
            return None;
        }
        None => start + DEFAULT_WINDOW,
    };

    Some((start, end))
}

/// Sets up the credential lifecycle from the session file.
fn coordinator(
    config: &Config,
    session: &SessionFile,
    issuer: Arc<dyn CredentialIssuer>,
) -> RefreshCoordinator {
    let store = Arc::new(CredentialStore::new());
    match session.load() {
        Ok(Some(credential)) => {
            info!(
                "session loaded; valid until {}",
                format_time(credential.expires_at())
            );
            store.set(credential);
        }
        Ok(None) => warn!("no session yet; run `{} login` first", config.app_name),
        Err(e) => error!("cannot read {}: {e}", session.path().display()),
    }

    RefreshCoordinator::new(
        store,
        issuer,
        Arc::new(NotificationHub::new()),
        config.request_timeout,
    )
}

/// Serves the redirect URI, if it points at this host.
///
/// Credentials obtained there arrive on the returned channel.
async fn serve_callback(
    config: &Config,
    state: &str,
    issuer: Arc<dyn CredentialIssuer>,
) -> Option<mpsc::Receiver<Credential>> {
    let redirect_uri = &config.credentials.redirect_uri;
    let callback = match Callback::bind(redirect_uri, state, issuer).await {
        Ok(callback) => callback,
        Err(e) => {
            debug!("not serving {redirect_uri}: {e}");
            return None;
        }
    };

    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if let Err(e) = callback.run(tx).await {
            error!("redirect URI server failed: {e}");
        }
    });
    Some(rx)
}

async fn login(
    config: &Config,
    session: &SessionFile,
    code: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let accounts = Arc::new(Accounts::new(config)?);

    let credential = if let Some(code) = code {
        accounts.exchange_code(&code).await?
    } else {
        let state = Uuid::new_v4().simple().to_string();
        let callback = serve_callback(config, &state, Arc::clone(&accounts) as Arc<dyn CredentialIssuer>).await;
        info!("grant access at: {}", accounts.authorize_url(&state));

        let Some(mut callback) = callback else {
            info!(
                "then run `{} login --code <CODE>` with the code from the redirect",
                config.app_name
            );
            return Ok(());
        };

        let mut signals = signal::Handler::new()?;
        loop {
            tokio::select! {
                signal = signals.recv() => {
                    if signal.is_shutdown() {
                        info!("{signal} received; not logged in");
                        return Ok(());
                    }
                }
                credential = callback.recv() => match credential {
                    Some(credential) => break credential,
                    None => return Err("redirect URI server stopped".into()),
                },
            }
        }
    };

    session.save(&credential, SystemTime::now())?;
    info!(
        "logged in; session saved to {}, valid until {}",
        session.path().display(),
        format_time(credential.expires_at())
    );
    info!("send SIGHUP to a running daemon to pick it up");

    Ok(())
}

fn logout(session: &SessionFile) -> Result<(), Box<dyn Error>> {
    if session.remove()? {
        info!("logged out; removed {}", session.path().display());
        info!("send SIGHUP to a running daemon to forget the session");
    } else {
        info!("not logged in");
    }

    Ok(())
}

async fn devices(config: &Config, session: &SessionFile) -> Result<(), Box<dyn Error>> {
    let coordinator = coordinator(config, session, Arc::new(Accounts::new(config)?));
    let before = coordinator.store().get();

    let credential = coordinator
        .ensure_valid(SystemTime::now(), config.refresh_threshold)
        .await?;
    if before.as_ref() != Some(&credential) {
        session.save(&credential, SystemTime::now())?;
    }

    let devices = WebApi::new(config)?.devices(&credential).await?;
    if devices.is_empty() {
        warn!("no devices available; open the app on a device first");
    }
    for device in devices {
        info!("{device}");
    }

    Ok(())
}

async fn watch(
    config: &Config,
    session: &SessionFile,
    url: Option<Url>,
) -> Result<(), Box<dyn Error>> {
    let url = match url {
        Some(url) => url,
        None => Url::parse(&format!("ws://{}", config.push_addr))?,
    };

    let listener = push::Listener::new(url);
    let on_notice = |notice: Notice| {
        // Renewals may have been missed while disconnected: read back either way.
        let cause = match notice {
            Notice::Connected => "connected".to_owned(),
            Notice::Received(event) => event.to_string(),
        };
        match session.load() {
            Ok(Some(credential)) => info!(
                "{cause}: session valid until {}",
                format_time(credential.expires_at())
            ),
            Ok(None) => warn!("{cause}, but {} is missing", session.path().display()),
            Err(e) => error!("{cause}, but cannot read {}: {e}", session.path().display()),
        }
    };

    let mut signals = signal::Handler::new()?;
    loop {
        tokio::select! {
            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("{signal} received; stopping");
                    break Ok(());
                }
            }
            () = listener.run(on_notice) => break Ok(()),
        }
    }
}

/// Keeps the session alive and runs the playback schedule until shut down.
async fn daemon(
    config: &Config,
    session: &SessionFile,
    window: Option<(SystemTime, SystemTime)>,
) -> Result<(), Box<dyn Error>> {
    let accounts = Arc::new(Accounts::new(config)?);
    let coordinator = coordinator(config, session, Arc::clone(&accounts) as Arc<dyn CredentialIssuer>);
    let hub = Arc::clone(coordinator.hub());

    match push::Server::bind(config.push_addr, Arc::clone(&hub)).await {
        Ok(server) => {
            tokio::spawn(server.run());
        }
        Err(e) => error!("push server unavailable on {}: {e}", config.push_addr),
    }

    // Persist every renewal, whoever triggered it.
    let persistence = tokio::spawn(lifecycle::persist(
        hub.subscribe(),
        Arc::clone(coordinator.store()),
        session.clone(),
    ));

    // Logins completed at the redirect URI while running.
    let login_state = Uuid::new_v4().simple().to_string();
    let mut logins = serve_callback(config, &login_state, Arc::clone(&accounts) as Arc<dyn CredentialIssuer>).await;

    let player: Arc<dyn PlaybackBackend> = Arc::new(WebApi::new(config)?);
    let mut scheduler = Scheduler::new(coordinator.clone(), player, config);
    if let Some((start, end)) = window {
        if let Err(e) = scheduler.configure(start, end) {
            error!("ignoring window: {e}");
        }
    }

    let mut ticker = tokio::time::interval(config.tick_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Renew ahead of expiry even while no window is open. Starts right away
    // so that a stale session is refreshed at startup.
    let keep_alive = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(keep_alive);
    let mut parked = false;

    let mut signals = signal::Handler::new()?;
    let result = loop {
        tokio::select! {
            // Prioritize signals.
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("{signal} received; shutting down gracefully");
                    break Ok(());
                }

                info!("{signal} received; reloading {}", session.path().display());
                match lifecycle::reload(&coordinator, session) {
                    Ok(Some(_)) => {
                        parked = false;
                        keep_alive.as_mut().reset(Instant::now());
                    }
                    Ok(None) => parked = true,
                    Err(e) => error!("cannot read {}: {e}", session.path().display()),
                }
            }

            Some(credential) = async { logins.as_mut()?.recv().await } => {
                coordinator.install(credential);
                parked = false;
                keep_alive.as_mut().reset(Instant::now());
            }

            _ = ticker.tick() => {
                match scheduler.tick(SystemTime::now()).await {
                    tick @ (Tick::Idle | Tick::Pending | Tick::AlreadyRunning | Tick::Blocked) => {
                        trace!("tick: {tick}");
                    }
                    tick => debug!("tick: {tick}"),
                }
            }

            () = &mut keep_alive, if !parked => {
                let delay = match lifecycle::keep_alive(&coordinator, SystemTime::now(), config.refresh_threshold).await {
                    KeepAlive::RenewIn(delay) | KeepAlive::RetryIn(delay) => delay,
                    KeepAlive::Parked => {
                        if logins.is_some() {
                            info!("to log in, grant access at: {}", accounts.authorize_url(&login_state));
                        } else {
                            info!("run `{} login` and send SIGHUP to continue", config.app_name);
                        }
                        parked = true;
                        Duration::ZERO
                    }
                };
                keep_alive.as_mut().reset(Instant::now() + delay);
            }
        }
    };

    persistence.abort();
    result
}

/// Main application entry.
///
/// Reads the configuration and dispatches to the requested command.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let credentials = load_credentials(&args.secrets_file)?;

    let mut config = Config::with_credentials(credentials);
    config.session_file.clone_from(&args.session_file);
    config.push_addr = args.bind;
    config.device_id.clone_from(&args.device);
    config.track_uri.clone_from(&args.track);
    config.tick_period = Duration::from_secs(args.tick);

    let session = SessionFile::new(&config.session_file);
    match args.command.clone() {
        Some(Command::Login { code }) => login(&config, &session, code).await,
        Some(Command::Logout) => logout(&session),
        Some(Command::Devices) => devices(&config, &session).await,
        Some(Command::Watch { url }) => watch(&config, &session, url).await,
        None => daemon(&config, &session, window(&args)).await,
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the requested command.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
