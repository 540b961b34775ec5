// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of shortstash.
//
// shortstash is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// shortstash is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with shortstash.  If not,
// see <http://www.gnu.org/licenses/>.

//! # shortstashd
//!
//! Catalog web links under short, human-transcribable codes.
//!
//! Submissions are persisted & answered immediately; Open Graph metadata is resolved by a
//! background worker that callers observe by polling. This binary wires the pieces together:
//! storage, the task processor, the metadata resolver & the HTTP surface.

use std::{
    env,
    future::IntoFuture,
    io,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use serde::Deserialize;
use snafu::prelude::*;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};

use shortstash::{
    background,
    enrichment::Context,
    http::make_router,
    memory::MemoryBackend,
    metadata::{self, Resolver},
    shortstash::Shortstash,
};

/// The shortstashd application error type
///
/// At the application level I'm going to provide a fairly rich set of errors in the hopes of
/// helping operators; [Snafu] keeps the boilerplate down.
///
/// [Snafu]: https://docs.rs/snafu/latest/snafu/index.html
///
/// Note that I do not derive the [Debug] trait for this error. `main()` returns `Result<(),
/// Error>`, and should the `Err` variant be returned, the Rust runtime uses the `Debug`
/// implementation to produce an error message on stderr. The derived implementation is not very
/// readable, so I implement it "by hand" in terms of [Display](std::fmt::Display).
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to setup background task processing: {source}"))]
    BackgroundTasks { source: background::Error },
    #[snafu(display("Failed to bind to {address}: {source}"))]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to build the metadata resolver: {source}"))]
    Resolver { source: metadata::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches.get_one::<PathBuf>("config").cloned(),
        }
    }
}

/// shortstash configuration, version one
#[derive(Clone, Debug, Deserialize)]
struct ConfigV1 {
    /// Local address at which to listen; specify as "address:port"
    address: SocketAddr,
    /// Endpoint prefix for an operator-run metadata resolution service, tried ahead of the
    /// built-in providers; the link target will be appended percent-encoded. May be overridden
    /// via the SHORTSTASH_RESOLVER environment variable.
    #[serde(rename = "resolver-endpoint")]
    resolver_endpoint: Option<String>,
    #[serde(rename = "background-tasks")]
    background_tasks: background::Config,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            address: "0.0.0.0:20787".parse::<SocketAddr>().unwrap(/* known good */),
            resolver_endpoint: None,
            background_tasks: background::Config::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the shortstash configuration file
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    use snafu::IntoError;
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/shortstash.toml").unwrap(), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(cfg) => match cfg {
                Configuration::V1(cfg) => Ok(cfg),
            },
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

/// Configure shortstashd logging
///
/// shortstashd runs in the foreground (the usual case being inside a container), so logs go to
/// stdout: JSON by default, human-readable with `--plain`. Note that `json()` & `compact()`
/// produce `Layer` instances *of different types*, hence the boxing.
fn configure_logging(
    logopts: &LogOpts,
) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter))
}

/// Serve shortstash API requests
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    let mut sighup = signal(SignalKind::hangup()).unwrap();
    let mut sigint = signal(SignalKind::interrupt()).unwrap();
    let mut sigterm = signal(SignalKind::terminate()).unwrap();

    // The store is built once & survives configuration reloads; rebuilding it per pass would
    // throw away the catalog.
    let storage = Arc::new(MemoryBackend::new());

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build the resolver & task processor each pass, in case configuration values have
        // changed:
        let resolver_endpoint = env::var("SHORTSTASH_RESOLVER")
            .ok()
            .or_else(|| cfg.resolver_endpoint.clone());
        let resolver = Arc::new(Resolver::new(resolver_endpoint).context(ResolverSnafu)?);

        let queue = Arc::new(background::TaskQueue::new());
        let context = Context {
            storage: storage.clone() as Arc<dyn shortstash::storage::Backend + Send + Sync>,
            resolver,
        };
        // Move the queue's receiving end into a new `Processor`, which lets us shut down
        // background task processing in an orderly manner:
        let task_processor =
            background::new(queue.clone(), context, Some(cfg.background_tasks.clone()))
                .context(BackgroundTasksSnafu)?;

        let state = Arc::new(Shortstash::new(
            storage.clone() as Arc<dyn shortstash::storage::Backend + Send + Sync>,
            queue,
        ));

        let server_nfy = Arc::new(Notify::new());
        let server = axum::serve(
            TcpListener::bind(cfg.address)
                .await
                .context(BindSnafu {
                    address: cfg.address,
                })?,
            make_router(state)
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new())
                        .on_response(DefaultOnResponse::new()),
                )
                // Handlers record the uploader's address, so the listener must propagate it
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(server_nfy.clone()));

        let (mut processor_join_handle, processor_shutdown) = task_processor.into_parts();

        let mut server = server.into_future();

        fn log_on_err<T, E>(x: StdResult<T, E>)
        where
            E: std::error::Error + std::fmt::Debug,
        {
            if let Err(err) = x {
                error!("{:?}", err);
            }
        }

        async fn drain_processor(
            shutdown: Arc<Notify>,
            handle: tokio::task::JoinHandle<background::Result<()>>,
        ) {
            shutdown.notify_one();
            match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                Ok(Err(err)) => error!("Failed to shut-down the task processor: {:?}", err),
                Err(err) => error!("Failed waiting to shut-down the task processor: {:?}", err),
                _ => (),
            }
        }

        tokio::select! {
            // Intentionally not handled-- the server *should* never shutdown on its own. That
            // said, if I don't move `server` into a Future, it never gets polled.
            _ = &mut server => unimplemented!(),
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                server_nfy.notify_one();
                log_on_err(server.await);
                drain_processor(processor_shutdown, processor_join_handle).await;
                // Failure to parse at this point isn't fatal; fall back to the last known-good
                // configuration & keep going.
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(_) => cfg
                };
            }
            _ = sigint.recv() => {
                info!("Received SIGINT; terminating.");
                server_nfy.notify_one();
                log_on_err(server.await);
                drain_processor(processor_shutdown, processor_join_handle).await;
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                server_nfy.notify_one();
                log_on_err(server.await);
                drain_processor(processor_shutdown, processor_join_handle).await;
                break;
            }
            res = &mut processor_join_handle => {
                // This shouldn't happen!
                error!("The background task processor exited early with {:?}; shutting-down.", res);
                server_nfy.notify_one();
                log_on_err(server.await);
                break;
            },
        }; // End tokio::select!.
    } // End loop.

    Ok(())
}

/// Transition to async
///
/// Logging is configured only once we're inside the runtime, and `serve()` is entered only after
/// logging is live, so that its startup messages land somewhere.
async fn go_async(opts: CliOpts) -> Result<()> {
    let cfg = parse_config(&opts.cfg)?;
    let (formatter, filter) = configure_logging(&opts.log_opts)?;
    // Setup the global logger. Nb. this can only be invoked once (will panic on a second
    // invocation)!
    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)?;

    info!("shortstash version {} starting.", crate_version!());

    serve(opts, cfg).await
}

fn main() -> Result<()> {
    // Most of shortstashd's configuration is read from file; the few command-line options that it
    // accepts govern where to find the configuration file & how to log. They all have
    // corresponding environment variables for the sake of convenience when running shortstash in
    // a container.
    let opts = CliOpts::new(
        Command::new("shortstashd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("Catalog web links under short codes")
            .long_about(
                "`shortstash` catalogs web links under six-character codes, resolving each \
                 page's Open Graph metadata in the background.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("SHORTSTASH_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("SHORTSTASH_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("SHORTSTASH_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("SHORTSTASH_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("SHORTSTASH_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    );

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts)) // and start our server!
}
