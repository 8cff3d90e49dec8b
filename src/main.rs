use catalog_proxy::client::{AddOutcome, CatalogClient, CatalogItem};
use catalog_proxy::config::Config;
use catalog_proxy::event::{EventHandler, EventOutcome, ProxyEvent};
use catalog_proxy::monitor::ConnectivityMonitor;
use catalog_proxy::proxy::Proxy;
use catalog_proxy::{logging, server};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "catalog-proxy")]
#[command(about = "Offline-first caching proxy for the catalog API")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./catalog-proxy.yaml or $XDG_CONFIG_HOME/catalog-proxy/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin API base URL
  #[arg(short, long)]
  origin: Option<Url>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the proxy daemon
  Serve,
  /// Populate the static and immutable cache tiers
  Install,
  /// Purge cache generations left by older versions
  Activate,
  /// Ask a running proxy to replay its queue now
  Sync {
    #[arg(long)]
    proxy: Option<Url>,
  },
  /// Show writes waiting for replay
  Pending {
    #[arg(long)]
    proxy: Option<Url>,
  },
  /// List catalog items through a running proxy
  List {
    #[arg(long)]
    proxy: Option<Url>,
  },
  /// Add a catalog item through a running proxy
  Add {
    name: String,
    director: String,
    rating: String,
    #[arg(long)]
    proxy: Option<Url>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    Config { origin, ..config }
  } else {
    config
  };

  let data_dir = config.data_dir()?;
  std::fs::create_dir_all(&data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;
  let _guard = logging::init(&data_dir.join("logs"))?;

  match args.command {
    Command::Serve => serve(config, data_dir).await,
    Command::Install => {
      let proxy = Proxy::open(&config, &data_dir)?;
      proxy.dispatch(ProxyEvent::Install).await?;
      println!("Installed {}", config.cache.current_generations().join(", "));
      Ok(())
    }
    Command::Activate => {
      let proxy = Proxy::open(&config, &data_dir)?;
      if let EventOutcome::Activated { purged } = proxy.dispatch(ProxyEvent::Activate).await? {
        for name in purged {
          println!("Purged {}", name);
        }
      }
      Ok(())
    }
    Command::Sync { proxy } => {
      let report = client(&config, proxy)?.sync().await?;
      println!(
        "replayed: {:?}, failed: {:?}, deferred: {:?}",
        report.replayed, report.failed, report.deferred
      );
      Ok(())
    }
    Command::Pending { proxy } => {
      for record in client(&config, proxy)?.pending().await? {
        println!("#{} {} {} {}", record.id, record.queued_at, record.url, record.body);
      }
      Ok(())
    }
    Command::List { proxy } => {
      for item in client(&config, proxy)?.list().await? {
        println!("{}\t{}\t{}", item.name, item.director, item.rating);
      }
      Ok(())
    }
    Command::Add {
      name,
      director,
      rating,
      proxy,
    } => {
      let item = CatalogItem {
        name,
        director,
        rating,
      };
      match client(&config, proxy)?.add(&item).await? {
        AddOutcome::Delivered => println!("Added {}", item.name),
        AddOutcome::QueuedLocally { id } => {
          println!("Saved locally as #{}. Synchronization pending.", id)
        }
      }
      Ok(())
    }
  }
}

fn client(config: &Config, proxy: Option<Url>) -> Result<CatalogClient> {
  let base = match proxy {
    Some(url) => url,
    None => Url::parse(&format!("http://{}", config.listen))
      .map_err(|e| eyre!("Invalid listen address {}: {}", config.listen, e))?,
  };
  Ok(CatalogClient::new(base, &config.collection_path))
}

async fn serve(config: Config, data_dir: PathBuf) -> Result<()> {
  let mut events = EventHandler::new();
  let tx = events.sender();
  let proxy = Arc::new(Proxy::open(&config, &data_dir)?.with_retries(tx.clone()));

  // Lifecycle first; an offline install is retried on the next reconnect.
  tx.send(ProxyEvent::Install)
    .map_err(|e| eyre!("Failed to queue install: {}", e))?;

  if config.monitor.enabled {
    let monitor = ConnectivityMonitor::new(
      proxy.transport(),
      config.collection_url()?,
      config.monitor.interval(),
      proxy.sync_tag().to_string(),
    );
    monitor.spawn(tx.clone());
  }

  let lifecycle = Arc::clone(&proxy);
  tokio::spawn(async move {
    let mut installed = false;
    while let Some(event) = events.next().await {
      match event {
        ProxyEvent::Install => installed = install(&lifecycle).await,
        ProxyEvent::SyncTrigger { tag } => {
          if !installed {
            installed = install(&lifecycle).await;
          }
          let proxy = Arc::clone(&lifecycle);
          tokio::spawn(async move {
            if let Err(e) = proxy.dispatch(ProxyEvent::SyncTrigger { tag }).await {
              error!(error = %e, "sync failed");
            }
          });
        }
        event => {
          if let Err(e) = lifecycle.dispatch(event).await {
            error!(error = %e, "event failed");
          }
        }
      }
    }
  });

  server::serve(proxy, config.listen)
    .await
    .map_err(|e| eyre!("Proxy server failed: {}", e))
}

/// Install then activate. Returns whether the install succeeded.
async fn install(proxy: &Proxy) -> bool {
  if let Err(e) = proxy.dispatch(ProxyEvent::Install).await {
    warn!(error = %e, "install failed, will retry on reconnect");
    return false;
  }
  match proxy.dispatch(ProxyEvent::Activate).await {
    Ok(EventOutcome::Activated { purged }) => info!(?purged, "activated"),
    Ok(_) => {}
    Err(e) => warn!(error = %e, "activate failed"),
  }
  true
}
