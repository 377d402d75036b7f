use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drivelite::cli::{Cli, Commands, Credentials};
use drivelite::client::Client;
use drivelite::config::Config;
use drivelite::network::tls;
use drivelite::notify::LogNotifier;
use drivelite::protocol::PermissionLevel;
use drivelite::server::{Server, ServerOptions};
use drivelite::service::Services;
use drivelite::storage::ContentStore;

const DEFAULT_CLIENT_HOST: &str = "127.0.0.1";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();

    let default_filter = if cli.verbose { "drivelite=debug" } else { "drivelite=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env().context("loading configuration")?;

    match cli.command {
        Commands::Serve {
            ref storage,
            max_clients,
        } => serve(&cli, config.clone(), storage.clone(), max_clients).await,
        ref command => run_client(&cli, &config, command).await,
    }
}

async fn serve(
    cli: &Cli,
    mut config: Config,
    storage: Option<PathBuf>,
    max_clients: Option<usize>,
) -> Result<()> {
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(storage) = storage {
        config.storage_path = storage;
    }
    if let Some(max) = max_clients {
        anyhow::ensure!(max > 0, "--max-clients must be at least 1");
        config.max_clients = max;
    }

    tracing::info!("Starting drivelite v{}", env!("CARGO_PKG_VERSION"));
    let store = ContentStore::open_root(&config.storage_path)
        .await
        .with_context(|| format!("opening storage at {}", config.storage_path.display()))?;
    let services = Services::in_memory(store, Arc::new(LogNotifier), config.limits())
        .await
        .context("scanning storage")?;

    let mut server = Server::new(services, ServerOptions::from(&config));
    if let Some(identity) = &config.tls_pkcs12 {
        let acceptor = tls::acceptor_from_pkcs12(identity, &config.tls_password)
            .context("loading TLS identity")?;
        server = server.with_tls(acceptor);
        tracing::info!(identity = %identity.display(), "TLS enabled");
    }

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    server.serve(listener, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C, starting graceful shutdown");
}

async fn connect(cli: &Cli, config: &Config) -> Result<Client> {
    let host = cli.host.as_deref().unwrap_or(DEFAULT_CLIENT_HOST);
    let port = cli.port.unwrap_or(config.port);
    let client = Client::connect(host, port, &config.client_tls(cli.tls))
        .await
        .with_context(|| format!("connecting to {}:{}", host, port))?;
    Ok(client.with_progress(!cli.no_progress))
}

async fn login(client: &mut Client, credentials: &Credentials) -> Result<()> {
    let password = match &credentials.password {
        Some(password) => password.clone(),
        None => std::env::var("DRIVELITE_PASSWORD")
            .context("--password not given and DRIVELITE_PASSWORD is not set")?,
    };
    let info = client.login(&credentials.email, &password).await?;
    tracing::debug!(user_id = info.user_id, "logged in");
    Ok(())
}

async fn run_client(cli: &Cli, config: &Config, command: &Commands) -> Result<()> {
    let mut client = connect(cli, config).await?;

    match command {
        Commands::Serve { .. } => anyhow::bail!("serve runs a server, it does not connect to one"),
        Commands::Ping => {
            let reply = client.ping().await?;
            println!("{}", reply);
        }
        Commands::Register { credentials, name } => {
            let password = credentials
                .password
                .clone()
                .or_else(|| std::env::var("DRIVELITE_PASSWORD").ok())
                .context("--password not given and DRIVELITE_PASSWORD is not set")?;
            let user = client.register(&credentials.email, &password, name).await?;
            println!("✓ Registered {} (user {})", user.email, user.user_id);
        }
        Commands::Upload { path, credentials } => {
            login(&mut client, credentials).await?;
            let done = client.upload(path).await?;
            println!(
                "✓ Uploaded {} as file {} v{} ({} bytes, sha256 {})",
                done.file_name, done.file_id, done.version_number, done.size_bytes, done.sha256
            );
        }
        Commands::NewVersion {
            file_id,
            path,
            note,
            credentials,
        } => {
            login(&mut client, credentials).await?;
            let done = client
                .upload_new_version(*file_id, path, note.as_deref())
                .await?;
            println!(
                "✓ {} is now at v{} ({} bytes)",
                done.file_name, done.version_number, done.size_bytes
            );
        }
        Commands::Download {
            file_id,
            version,
            output,
            credentials,
        } => {
            login(&mut client, credentials).await?;
            let dest = match output {
                Some(path) => path.clone(),
                None => PathBuf::from(format!("download-{}", file_id)),
            };
            let meta = client.download(*file_id, *version, &dest).await?;
            let final_path = if output.is_none() {
                let named = PathBuf::from(&meta.file_name);
                tokio::fs::rename(&dest, &named).await?;
                named
            } else {
                dest
            };
            println!(
                "✓ Saved {} v{} to {}",
                meta.file_name,
                meta.version_number,
                final_path.display()
            );
        }
        Commands::List { credentials } => {
            login(&mut client, credentials).await?;
            let mine = client.list_my_files().await?;
            let shared = client.list_shared_with_me().await?;
            println!("Your files ({}):", mine.count);
            for f in &mine.files {
                println!("  {:>6}  v{:<3}  {}", f.file_id, f.current_version, f.file_name);
            }
            println!("Shared with you ({}):", shared.count);
            for f in &shared.files {
                println!(
                    "  {:>6}  v{:<3}  {}  [{} from {}]",
                    f.file_id,
                    f.current_version,
                    f.file_name,
                    f.permission,
                    f.owner_email.as_deref().unwrap_or("?")
                );
            }
        }
        Commands::Share {
            file_id,
            target,
            level,
            credentials,
        } => {
            anyhow::ensure!(
                *level != PermissionLevel::Owner,
                "only VIEW or EDIT can be granted"
            );
            login(&mut client, credentials).await?;
            let granted = client.share_add(*file_id, target, *level).await?;
            println!("✓ {} can now {} file {}", granted.email, granted.permission, file_id);
        }
    }

    Ok(())
}
