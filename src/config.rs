use std::{net::SocketAddr, path::PathBuf, time::Duration};

use url::Url;

use crate::secrets::ClientCredentials;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub user_agent: String,

    pub credentials: ClientCredentials,
    pub scopes: Vec<String>,

    /// Base of the accounts service, serving `/authorize` and `/api/token`.
    pub accounts_url: Url,
    /// Base of the Web API, e.g. `https://api.spotify.com/v1/`.
    pub api_url: Url,

    /// Upper bound on any single outbound HTTP request.
    pub request_timeout: Duration,

    /// Renew the credential when it has less than this left to live.
    pub refresh_threshold: Duration,
    pub tick_period: Duration,
    /// Delay after a start before the credential is checked again.
    pub recheck_delay: Duration,

    pub push_addr: SocketAddr,
    pub session_file: PathBuf,

    pub device_id: Option<String>,
    pub track_uri: Option<String>,
}

impl Config {
    const ACCOUNTS_URL: &'static str = "https://accounts.spotify.com/";
    const API_URL: &'static str = "https://api.spotify.com/v1/";

    const SCOPES: [&'static str; 5] = [
        "user-read-playback-state",
        "user-modify-playback-state",
        "user-read-currently-playing",
        "user-read-private",
        "streaming",
    ];

    pub const DEFAULT_PUSH_ADDR: SocketAddr =
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 8000);

    /// Creates the configuration for the given client registration.
    ///
    /// # Panics
    ///
    /// Panics if the package name or version contain characters that are not
    /// allowed in a `User-Agent`, or if the built-in URLs are invalid. Both are
    /// fixed at compile time.
    #[must_use]
    pub fn with_credentials(credentials: ClientCredentials) -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        assert!(
            !(app_name.is_empty()
                || app_name.contains(illegal_chars)
                || app_version.is_empty()
                || app_version.contains(illegal_chars)),
            "application name and/or version invalid (\"{app_name}\"; \"{app_version}\")"
        );

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version()
            .filter(|version| !version.is_empty() && !version.contains(illegal_chars))
            .unwrap_or_else(|| String::from("0"));

        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");

        Self {
            app_name,
            app_version,
            user_agent,

            credentials,
            scopes: Self::SCOPES.iter().map(ToString::to_string).collect(),

            accounts_url: Url::parse(Self::ACCOUNTS_URL).expect("invalid accounts url"),
            api_url: Url::parse(Self::API_URL).expect("invalid api url"),

            request_timeout: Duration::from_secs(10),

            refresh_threshold: Duration::from_secs(300),
            tick_period: Duration::from_secs(10),
            recheck_delay: Duration::from_secs(30 * 60),

            push_addr: Self::DEFAULT_PUSH_ADDR,
            session_file: PathBuf::from("session.toml"),

            device_id: None,
            track_uri: None,
        }
    }
}
