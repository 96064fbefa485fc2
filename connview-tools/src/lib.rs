use clap::Parser;
use connview::settings::{SettingsError, SettingsSync, YamlStore};
use connview::wire::{util, Session, SessionOptions};
use connview::RemoteProxy;

use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
pub struct ConnOpts {
    /// Backend address (e.g., tcp://localhost:1337), or a page URL carrying
    /// it in its socketURL parameter
    #[arg(
        short = 'S',
        long = "socket",
        default_value_t = util::default_socket_url(),
        help = "Backend address"
    )]
    pub socket: String,

    /// Settings file (default: the user's config directory)
    #[arg(long = "settings", help = "Settings file")]
    pub settings: Option<PathBuf>,

    /// How long to wait for the backend when starting
    #[arg(long = "wait", default_value_t = 3.0, help = "Seconds to wait for the backend")]
    pub wait: f64,

    /// Increase log verbosity (repeat for more)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl ConnOpts {
    /// Opens a session and waits for the backend to answer.
    pub fn connect(&self) -> Result<RemoteProxy, String> {
        let session = Session::open_with(&self.socket, SessionOptions::default())
            .map_err(|e| e.to_string())?;
        if !session.wait_open(Duration::from_secs_f64(self.wait.max(0.0))) {
            return Err(format!("backend at {} is not reachable", self.socket));
        }
        Ok(RemoteProxy::new(session))
    }

    pub fn settings_store(&self) -> Result<YamlStore, SettingsError> {
        match &self.settings {
            Some(path) => Ok(YamlStore::new(path)),
            None => YamlStore::open_default(),
        }
    }

    pub fn load_settings(&self) -> Result<SettingsSync<YamlStore>, SettingsError> {
        SettingsSync::load(self.settings_store()?)
    }
}

/// Installs the log subscriber. `RUST_LOG` wins over the verbosity flag.
pub fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "connview=info",
        1 => "connview=debug",
        _ => "connview=trace,connview_tools=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
