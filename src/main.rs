use anyhow::{Context, Result};
use std::sync::Arc;

use memoria_session::bridge::BridgeOutcome;
use memoria_session::config::{Command, Config, LogFormat};
use memoria_session::events::next_event;
use memoria_session::location::{Location, PageLocation};
use memoria_session::logout::DomainCookieJar;
use memoria_session::session::{SessionContext, SessionOptions};
use memoria_session::storage::SqliteStorage;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    init_logging(&config);

    tracing::debug!(
        surface = %config.surface,
        db = %config.session_db_file.display(),
        "Memoria session client starting"
    );

    let page = match &command {
        Command::Bridge { url } => url.clone(),
        _ => config
            .surfaces
            .base(config.surface)
            .map(|base| base.to_string())
            .context("surface has no base URL")?,
    };
    let location = Arc::new(PageLocation::parse(&page).context("Invalid page URL")?);
    let ctx = build_context(&config, location.clone())?;

    match command {
        Command::Login {
            email,
            password,
            query,
        } => {
            let outcome = ctx.login(&email, &password, &query).await?;
            println!("{}", outcome.redirect_url);
        }
        Command::Signup {
            email,
            password,
            display_name,
            query,
        } => {
            let outcome = ctx.signup(&email, &password, &display_name, &query).await?;
            println!("{}", outcome.redirect_url);
        }
        Command::Me => match ctx.me().await {
            Ok(me) => println!("{}", serde_json::to_string_pretty(&me)?),
            Err(e) => {
                if let Some(login_url) = ctx.redirect_on_unauthorized(&e) {
                    eprintln!("Not signed in, log in at {}", login_url);
                }
                return Err(e.into());
            }
        },
        Command::Logout => {
            let login_url = ctx.logout().await;
            println!("{}", login_url);
        }
        Command::Watch => {
            ctx.start();
            let handle = ctx.watch();
            tracing::info!(
                surface = %config.surface,
                interval_ms = config.logout_poll_interval.as_millis() as u64,
                "Watching for sign-outs"
            );

            let mut events = ctx.events().subscribe();
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = async {
                    while let Some(event) = next_event(&mut events).await {
                        tracing::info!(?event, "Session event");
                    }
                } => {}
            }

            handle.stop().await;
        }
        Command::Bridge { .. } => {
            match ctx.start() {
                BridgeOutcome::NoHandoff => tracing::info!("No handoff parameters"),
                outcome => tracing::info!(?outcome, "Handoff processed"),
            }
            println!("{}", location.href());
        }
        Command::Resolve { candidate } => {
            println!("{}", ctx.resolver().build_redirect_url(&candidate));
        }
        Command::LoginUrl { path } => {
            println!(
                "{}",
                ctx.resolver().build_login_url_for(config.surface, &path)
            );
        }
    }

    for target in location.navigations() {
        tracing::info!(target = %target, "Navigated");
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.with_file(true).with_line_number(true).init(),
    }
}

/// Wire the session context onto the shared SQLite file
fn build_context(config: &Config, location: Arc<PageLocation>) -> Result<SessionContext> {
    let local = SqliteStorage::open(&config.session_db_file, config.origin_scope())
        .context("Failed to open session storage")?;
    let shared = SqliteStorage::open(&config.session_db_file, config.cookie_scope())
        .context("Failed to open cookie storage")?;
    let cookies = Arc::new(DomainCookieJar::new(
        Arc::new(shared),
        config.cookie_domain.clone(),
    ));

    let options = SessionOptions {
        connect_timeout_secs: config.http_connect_timeout,
        request_timeout_secs: config.http_request_timeout,
        poll_interval: config.logout_poll_interval,
        logout_cookie_max_age_secs: config.logout_cookie_max_age,
    };

    SessionContext::new(
        config.surface,
        config.surfaces.clone(),
        &config.api_base_url,
        Arc::new(local),
        cookies,
        location,
        options,
    )
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}
