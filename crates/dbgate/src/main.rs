use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use clap::Parser;
use dbgate::{
    access::{AccessGuard, AccessToken},
    server::Listener,
    tls, AuthorizedPaths, Dispatcher, Gateway, Session, Supervisor,
};
use dbgate_config::{GatewayConfig, CONFIG_ENV_VAR};
use dbgate_mi::{GdbLaunch, MiClient, MiClientConfig};
use tokio_util::sync::CancellationToken;

const TARGET: &str = "dbgate";

/// Debug a program under gdb from a browser.
///
/// Prints the URL to open once the server is listening. The process exits when
/// the debugger does: after the program finishes and a viewer leaves, or when
/// a viewer asks gdb to exit.
#[derive(Debug, Parser)]
#[command(name = "dbgate", version, about)]
struct Cli {
    /// Address to listen on. Anything other than localhost or a loopback IP
    /// requires `--tls-cert` and `--tls-key` and enables token access control.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on; 0 picks a free one.
    #[arg(long)]
    port: Option<u16>,

    /// PEM certificate chain for HTTPS.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// PEM private key for HTTPS.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Source directory handed to gdb; files under it may be viewed.
    #[arg(long)]
    src_dir: Option<PathBuf>,

    /// Additional directory whose files may be viewed. Repeatable.
    #[arg(long = "source-root")]
    source_roots: Vec<PathBuf>,

    /// Toolchain installation whose sources may be viewed.
    #[arg(long)]
    toolchain_root: Option<PathBuf>,

    /// gdb executable.
    #[arg(long)]
    gdb: Option<PathBuf>,

    /// Path to a TOML config file.
    ///
    /// If unset, `DBGATE_CONFIG` is used as a fallback. When neither are
    /// provided the defaults apply.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Program to debug.
    program: PathBuf,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut GatewayConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(cert) = &self.tls_cert {
            config.server.tls_cert = Some(cert.clone());
        }
        if let Some(key) = &self.tls_key {
            config.server.tls_key = Some(key.clone());
        }
        if let Some(gdb) = &self.gdb {
            config.debugger.gdb = gdb.clone();
        }
        config
            .sandbox
            .source_roots
            .extend(self.source_roots.iter().cloned());
        if let Some(root) = &self.toolchain_root {
            config.sandbox.toolchain_root = Some(root.clone());
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut config, unknown_keys) = load_config(cli.config.clone());
    cli.apply_overrides(&mut config);
    dbgate_config::init_tracing(&config.logging);
    for key in &unknown_keys {
        tracing::warn!(target: TARGET, key = %key, "unknown config key");
    }

    let cwd = std::env::current_dir().context("read working directory")?;
    let program = cwd.join(&cli.program);
    if !program.exists() {
        bail!("program {} does not exist", program.display());
    }

    let remote = !config.server.is_loopback();
    let tls_config = match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert), Some(key)) if remote => Some(
            tls::load_server_config(cert, key).context("load TLS certificate and key")?,
        ),
        _ if remote => bail!(
            "listening on {} requires --tls-cert and --tls-key",
            config.server.host
        ),
        (Some(_), _) | (_, Some(_)) => {
            tracing::info!(target: TARGET, "loopback listener serves plain HTTP; ignoring TLS files");
            None
        }
        _ => None,
    };

    let listener = Listener::bind(&config.server.host, config.server.port, tls_config)
        .await
        .with_context(|| format!("bind {}:{}", config.server.host, config.server.port))?;
    let port = listener.local_addr()?.port();

    let (guard, url) = if remote {
        let token = AccessToken::generate().context("generate access token")?;
        let url = format!(
            "https://{}:{port}/?MAGIC={}",
            url_host(&config.server.host),
            token.expose()
        );
        (AccessGuard::remote(token, port), url)
    } else {
        let url = format!("http://{}:{port}/", url_host(&config.server.host));
        (AccessGuard::local(), url)
    };

    let launch = GdbLaunch {
        gdb: config.debugger.gdb.clone(),
        program,
        source_dir: cli.src_dir.clone(),
    };
    let client_config = MiClientConfig {
        reply_timeout: config.debugger.reply_timeout(),
        exit_grace: config.debugger.exit_grace(),
        event_channel_size: config.debugger.event_buffer,
    };
    let (client, events) = MiClient::spawn(&launch, client_config).context("start gdb")?;

    let roots = std::iter::once(cwd.clone())
        .chain(cli.src_dir.clone())
        .chain(config.sandbox.source_roots.iter().cloned())
        .chain(config.sandbox.toolchain_root.clone());
    let sandbox = AuthorizedPaths::new(&cwd, roots);

    let session = Arc::new(Session::new(client));
    let dispatcher = Arc::new(Dispatcher::new(session.clone()));
    let gateway = Arc::new(
        Gateway::new(dispatcher.clone(), events.into(), sandbox)
            .with_heartbeat(config.server.heartbeat_interval()),
    );
    let app = gateway.router(guard);

    let stop_serving = CancellationToken::new();
    let server = tokio::spawn(listener.serve(app, stop_serving.clone()));

    // The token is only ever shown here, never logged.
    println!("{url}");

    let interrupted = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: TARGET, "interrupted");
            interrupted.teardown().await;
        }
    });

    let outcome = Supervisor::new(dispatcher)
        .run(cli.args.join(" "))
        .await
        .context("debug session failed");

    stop_serving.cancel();
    match server.await {
        Ok(Err(err)) => tracing::warn!(target: TARGET, error = %err, "server stopped with error"),
        Err(err) => tracing::warn!(target: TARGET, error = %err, "server task failed"),
        Ok(Ok(())) => {}
    }
    outcome
}

fn load_config(cli_path: Option<PathBuf>) -> (GatewayConfig, Vec<String>) {
    let path = cli_path.or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));
    let Some(path) = path else {
        return (GatewayConfig::default(), Vec::new());
    };

    match GatewayConfig::load_from_path(&path) {
        Ok(loaded) => (loaded.config, loaded.unknown_keys),
        Err(err) => {
            eprintln!(
                "dbgate: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            (GatewayConfig::default(), Vec::new())
        }
    }
}

/// Brackets bare IPv6 literals for use in a URL.
fn url_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_owned()
    }
}
