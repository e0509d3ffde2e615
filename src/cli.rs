use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::interface::{SecretClient, SecretSet, SecretStoreClient};
use crate::vault::secret_client::VaultSecretClient;
use crate::vault::status::{self, BackendState};
use crate::vault::store_client::VaultSecretStoreClient;
use crate::vault::{HttpTransport, KvVersion, SecretConfig};

#[derive(Parser)]
#[command(
    name = "merka-secrets",
    about = "Secret store bootstrap and access CLI",
    version = "0.1.0"
)]
pub struct Cli {
    /// Secret store address.
    #[arg(
        long,
        default_value = "http://127.0.0.1:8200",
        global = true,
        env = "VAULT_ADDR"
    )]
    pub vault_addr: String,

    /// Mount point of the key/value engine.
    #[arg(long, default_value = "secret", global = true, env = "SECRETSTORE_MOUNT")]
    pub mount: String,

    /// Version of the key/value engine (1 or 2).
    #[arg(long, default_value = "1", global = true, env = "SECRETSTORE_KV_VERSION")]
    pub kv_version: KvVersion,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check secret store status.
    Status,
    /// Initialize the secret store and print the key shares.
    Init {
        /// Number of key shares to split the master key into.
        #[arg(long, default_value_t = 1)]
        secret_shares: u8,
        /// Number of key shares required to unseal.
        #[arg(long, default_value_t = 1)]
        secret_threshold: u8,
    },
    /// Unseal the secret store.
    Unseal {
        /// Provide one or more unseal keys.
        #[arg(long = "key", value_name = "UNSEAL_KEY")]
        keys: Vec<String>,
        /// Optionally read keys from a file, one per line.
        #[arg(long)]
        keys_file: Option<String>,
    },
    /// Read secrets at a path.
    Get {
        #[arg(long)]
        path: String,
        /// Keys to return; all keys when omitted.
        #[arg(long = "key")]
        keys: Vec<String>,
        #[arg(long, env = "VAULT_TOKEN")]
        token: String,
    },
    /// Store (upsert) secrets at a path.
    Put {
        #[arg(long)]
        path: String,
        /// Secrets as key=value pairs.
        #[arg(long = "secret", value_name = "KEY=VALUE", required = true)]
        secrets: Vec<String>,
        #[arg(long, env = "VAULT_TOKEN")]
        token: String,
    },
    /// List the secret names below a path.
    Keys {
        #[arg(long, default_value = "")]
        path: String,
        #[arg(long, env = "VAULT_TOKEN")]
        token: String,
    },
    /// Issue a fresh Consul ACL token for a service.
    ConsulToken {
        #[arg(long)]
        service: String,
        #[arg(long, env = "VAULT_TOKEN")]
        token: String,
    },
}

fn parse_secret_pairs(pairs: &[String]) -> Result<SecretSet> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("secret '{}' is not in KEY=VALUE form", pair))
        })
        .collect()
}

fn read_keys(keys: Vec<String>, keys_file: Option<String>) -> Result<Vec<String>> {
    let mut unseal_keys = Vec::new();
    if let Some(file) = keys_file {
        let contents =
            fs::read_to_string(&file).with_context(|| format!("reading keys file {}", file))?;
        unseal_keys.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }
    unseal_keys.extend(keys);
    if unseal_keys.is_empty() {
        return Err(anyhow!("No unseal keys provided"));
    }
    Ok(unseal_keys)
}

struct Clients {
    config: SecretConfig,
    transport: Arc<HttpTransport>,
}

impl Clients {
    fn new(cli: &Cli) -> Result<Self> {
        let config = SecretConfig::from_env()?
            .with_base_path(&cli.mount, "")
            .with_kv_version(cli.kv_version);
        let transport = Arc::new(HttpTransport::with_base_url(&cli.vault_addr, &config)?);
        Ok(Self { config, transport })
    }

    fn store(&self) -> VaultSecretStoreClient {
        VaultSecretStoreClient::new(self.config.clone(), self.transport.clone())
    }

    async fn secrets(&self, token: &str) -> Result<VaultSecretClient> {
        let client = VaultSecretClient::new(self.config.clone(), self.transport.clone());
        client
            .set_auth_token(&CancellationToken::new(), token)
            .await
            .context("secret store rejected the token")?;
        Ok(client)
    }
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    let clients = Clients::new(&cli)?;

    match cli.command {
        Commands::Status => {
            info!("Checking status of secret store at {}", cli.vault_addr);
            let store = clients.store();
            let code = store.health_check().await.map_err(|e| {
                error!("Connection error: ensure the secret store is running at {}", cli.vault_addr);
                anyhow!("Failed to check secret store status: {}", e)
            })?;
            match BackendState::from_health_code(code) {
                Some(BackendState::Uninitialized) => {
                    info!("Secret store is not initialized. Run the init command.")
                }
                Some(BackendState::Sealed) => {
                    let seal = status::seal_status(clients.transport.as_ref()).await?;
                    info!(
                        "Secret store is sealed (progress {}/{}). Run the unseal command.",
                        seal.progress, seal.t
                    );
                }
                Some(BackendState::Unsealed) => info!("Secret store is unsealed, not yet active"),
                Some(BackendState::Ready) => info!("Secret store is ready"),
                None => warn!("Unexpected health status {}", code),
            }
        }

        Commands::Init {
            secret_shares,
            secret_threshold,
        } => {
            let response = clients
                .store()
                .init(secret_threshold, secret_shares)
                .await
                .map_err(|e| anyhow!("Failed to initialize secret store: {}", e))?;
            println!("Root Token: {}", response.root_token);
            println!(
                "Unseal Keys ({}/{} needed):",
                secret_threshold,
                response.keys_base64.len()
            );
            for key in &response.keys_base64 {
                println!(" - {}", key);
            }
        }

        Commands::Unseal { keys, keys_file } => {
            let keys = read_keys(keys, keys_file)?;
            info!("Unsealing secret store at {}", cli.vault_addr);
            let progress = clients
                .store()
                .unseal(&keys)
                .await
                .map_err(|e| anyhow!("Failed to unseal secret store: {}", e))?;
            info!("Unseal result: sealed = {}", progress.sealed);
            if progress.sealed {
                info!("Progress: {}/{}", progress.progress, progress.threshold);
            }
        }

        Commands::Get { path, keys, token } => {
            let client = clients.secrets(&token).await?;
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            let secrets = client.get_secrets(&path, &keys).await?;
            let mut names: Vec<_> = secrets.keys().collect();
            names.sort();
            for name in names {
                println!("{}={}", name, secrets[name]);
            }
        }

        Commands::Put {
            path,
            secrets,
            token,
        } => {
            let secrets = parse_secret_pairs(&secrets)?;
            let client = clients.secrets(&token).await?;
            client.store_secrets(&path, &secrets).await?;
            info!("Stored {} secret(s) at '{}'", secrets.len(), path);
        }

        Commands::Keys { path, token } => {
            let client = clients.secrets(&token).await?;
            for key in client.get_keys(&path).await? {
                println!("{}", key);
            }
        }

        Commands::ConsulToken { service, token } => {
            let client = clients.secrets(&token).await?;
            println!("{}", client.generate_consul_token(&service).await?);
        }
    }
    Ok(())
}
