use clap::Parser;
use std::path::PathBuf;
use stream_proxy::{ProxyConfig, ProxyServer, UpstreamProxy};
use tokio::io::AsyncWriteExt;

/// Intercepting HTTPS proxy that republishes a streaming RPC on stdout.
///
/// Settings not given on the command line come from the environment
/// (`STREAM_PORT`, `STREAM_INTERCEPT_DOMAINS`, `HTTPS_PROXY`, ...).
#[derive(Parser, Debug)]
#[command(name = "stream-proxy", version, about)]
struct Args {
  /// Address to listen on
  #[arg(long)]
  host: Option<String>,
  /// Port to listen on
  #[arg(short, long)]
  port: Option<u16>,
  /// Upstream proxy URL (http://, socks5:// or socks5h://)
  #[arg(long)]
  proxy: Option<String>,
  /// Host or *.suffix pattern to intercept; repeat or separate with commas
  #[arg(short, long, value_delimiter = ',')]
  intercept: Vec<String>,
  /// Directory holding the root CA and issued certificates
  #[arg(long)]
  cert_dir: Option<PathBuf>,
  /// Print the root CA certificate (PEM) and exit
  #[arg(long)]
  print_ca: bool,
  /// Log filter used when RUST_LOG is not set
  #[arg(long, default_value = "info")]
  log_level: String,
}

impl Args {
  fn apply(self, config: &mut ProxyConfig) -> stream_proxy::Result<()> {
    if let Some(host) = self.host {
      config.host = host;
    }
    if let Some(port) = self.port {
      config.port = port;
    }
    if let Some(proxy) = self.proxy {
      config.upstream_proxy = Some(UpstreamProxy::parse(&proxy)?);
    }
    if !self.intercept.is_empty() {
      config.intercept_domains = self.intercept;
    }
    if let Some(dir) = self.cert_dir {
      config.cert_dir = dir;
    }
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let args = Args::parse();

  // stdout carries the message stream, logs go to stderr
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
    )
    .with_writer(std::io::stderr)
    .with_target(false)
    .init();

  let print_ca = args.print_ca;
  let mut config = ProxyConfig::from_env()?;
  args.apply(&mut config)?;

  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
  let server = ProxyServer::new(config).await?.with_queue(tx);
  if print_ca {
    print!("{}", server.certificates().ca_cert_pem()?);
    return Ok(());
  }
  tracing::info!(
    "[Proxy] Root CA at {}",
    server.certificates().ca_cert_path().display()
  );

  let printer = tokio::spawn(async move {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = rx.recv().await {
      let line = format!("{}\n", message);
      if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
        break;
      }
    }
  });

  let listener = server.bind().await?;
  let shutdown = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!("[Proxy] Failed to listen for ctrl-c: {}", e);
      std::future::pending::<()>().await;
    }
  };
  server.serve(listener, shutdown).await?;
  drop(server);
  printer.await.ok();
  Ok(())
}
