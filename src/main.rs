use anyhow::{bail, Context, Result};
use b2cs_storage::b2cs;
use b2cs_storage::config::{Config, StoreConfig, SERVER_CONFIG_FILE};
use b2cs_storage::remote::s3::S3Connector;
use b2cs_storage::{ErrorKind, Storage, StorageOptions};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "b2cs")]
#[command(about = "Backblaze B2 storage backend: setup and object tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the B2 bucket and write the server configuration
    Setup {
        /// Directory to store private configuration files
        #[arg(long = "where", default_value_os_t = default_where())]
        where_: PathBuf,
        /// Domain name for this installation
        #[arg(long)]
        domain: String,
        /// B2 account ID (application key ID)
        #[arg(long)]
        account: String,
        /// B2 application key
        #[arg(long)]
        appkey: String,
        /// B2 region
        #[arg(long)]
        region: Option<String>,
        /// S3-compatible endpoint, derived from the region when omitted
        #[arg(long)]
        endpoint: Option<String>,
        /// Delete the bucket and its contents instead of creating it
        #[arg(long)]
        clean: bool,
        /// Bucket name
        bucket: String,
    },
    /// Upload a file under a reference
    Put {
        #[arg(short, long, default_value = SERVER_CONFIG_FILE)]
        config: PathBuf,
        reference: String,
        file: PathBuf,
    },
    /// Download a reference
    Get {
        #[arg(short, long, default_value = SERVER_CONFIG_FILE)]
        config: PathBuf,
        reference: String,
        /// Output file, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a reference
    Rm {
        #[arg(short, long, default_value = SERVER_CONFIG_FILE)]
        config: PathBuf,
        reference: String,
    },
    /// List references, one JSON object per line
    Ls {
        #[arg(short, long, default_value = SERVER_CONFIG_FILE)]
        config: PathBuf,
        /// Keep following tokens until the listing is complete
        #[arg(long)]
        all: bool,
    },
    /// Print the public base URL of the bucket
    LinkBase {
        #[arg(short, long, default_value = SERVER_CONFIG_FILE)]
        config: PathBuf,
    },
}

fn default_where() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join("b2cs")
        .join("deploy")
}

async fn open_store(config: &Path) -> Result<Arc<dyn Storage>> {
    info!("Loading configuration from {:?}", config);
    let cfg = Config::load(config)?;
    let store = cfg.store()?;
    let registry = b2cs_storage::default_registry()?;
    let storage = registry
        .dial(&store.backend, &store.options)
        .await
        .with_context(|| format!("unable to open {} backend", store.backend))?;
    Ok(storage)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Setup {
            where_,
            domain,
            account,
            appkey,
            region,
            endpoint,
            clean,
            bucket,
        } => {
            if domain.is_empty() {
                bail!("the --domain flag must be provided");
            }
            let mut opts = StorageOptions::new()
                .with(b2cs::ACCOUNT_ID, account)
                .with(b2cs::APPLICATION_KEY, appkey)
                .with(b2cs::BUCKET_NAME, bucket.as_str());
            if let Some(region) = region {
                opts.insert(b2cs::REGION, region);
            }
            if let Some(endpoint) = endpoint {
                opts.insert(b2cs::ENDPOINT, endpoint);
            }

            if clean {
                info!("Cleaning up...");
                match b2cs::remove_bucket(&opts, &S3Connector).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotExist => {
                        warn!("unable to obtain B2 bucket reference: {}", e)
                    }
                    Err(e) => warn!("unable to delete bucket from b2: {}", e),
                }
                return Ok(());
            }

            // Dialing the backend creates the bucket when it is missing.
            let storage = b2cs_storage::default_registry()?
                .dial(b2cs::BACKEND_NAME, &opts)
                .await
                .context("unable to create b2cs bucket")?;
            storage.close();

            let cfg_path = where_.join(&domain).join(SERVER_CONFIG_FILE);
            let mut cfg = Config::load_or_default(&cfg_path)?;
            cfg.store = Some(StoreConfig {
                backend: b2cs::BACKEND_NAME.to_string(),
                options: opts,
            });
            cfg.save(&cfg_path)?;
            info!("Configuration written to {:?}", cfg_path);
            eprintln!("You should now deploy the server binary with this configuration.");
        }
        Commands::Put {
            config,
            reference,
            file,
        } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("Failed to read {:?}", file))?;
            let storage = open_store(&config).await?;
            storage.put(&reference, Bytes::from(data)).await?;
            info!("Stored {}", reference);
            storage.close();
        }
        Commands::Get {
            config,
            reference,
            output,
        } => {
            let storage = open_store(&config).await?;
            let data = storage.download(&reference).await?;
            storage.close();
            match output {
                Some(path) => std::fs::write(&path, &data)
                    .with_context(|| format!("Failed to write {:?}", path))?,
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&data)?;
                }
            }
        }
        Commands::Rm { config, reference } => {
            let storage = open_store(&config).await?;
            storage.delete(&reference).await?;
            info!("Deleted {}", reference);
            storage.close();
        }
        Commands::Ls { config, all } => {
            let storage = open_store(&config).await?;
            let mut token = String::new();
            loop {
                let page = storage.list(&token).await?;
                for item in &page.refs {
                    println!("{}", serde_json::to_string(item)?);
                }
                if page.is_complete() {
                    break;
                }
                if !all {
                    // Tokens only live as long as this process.
                    eprintln!("more results available; rerun with --all");
                    break;
                }
                token = page.next_token;
            }
            storage.close();
        }
        Commands::LinkBase { config } => {
            let storage = open_store(&config).await?;
            match storage.link_base().await {
                Ok(base) => println!("{base}"),
                Err(e) if e.kind() == ErrorKind::Unsupported => {
                    storage.close();
                    bail!("bucket is not public; no base URL available");
                }
                Err(e) => {
                    storage.close();
                    return Err(e.into());
                }
            }
            storage.close();
        }
    }

    Ok(())
}
