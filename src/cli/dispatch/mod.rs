use crate::cli::actions::{server::Args, Action};
use anyhow::{Context, Result};
use std::path::PathBuf;
use url::Url;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);

    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let auth_upstream = matches
        .get_one::<String>("auth-upstream")
        .cloned()
        .context("missing required argument: --auth-upstream")?;
    let auth_upstream = Url::parse(&auth_upstream).context("invalid PORDEGO_AUTH_UPSTREAM")?;

    let oidc_enabled = matches.get_flag("oidc-enabled");
    let oidc_clients = matches.get_one::<String>("oidc-clients").map(PathBuf::from);

    Ok(Action::Server(Args {
        port,
        dsn,
        auth_upstream,
        oidc_enabled,
        oidc_clients,
    }))
}
