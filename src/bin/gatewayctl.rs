//! Administrative CLI for a Syndicate User Gateway process.
//!
//! This binary is the gateway bootstrap/config-reload loop the library
//! itself stays out of: it loads a TOML config, mints or inspects a
//! gateway's signing material, and offers a couple of standalone utilities
//! (`block-url`) useful when debugging a deployment without a live MS.
//! Wiring a real [`syndicate_ug::transport::MsClient`] is left to whatever
//! deploys this gateway; the MS itself is out of scope.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::Deserialize;
use syndicate_ug::config::Config;
use syndicate_ug::ids::{BlockId, BlockVersion, FileId, FileVersion, VolumeId};
use syndicate_ug::transport::block_url;

#[derive(Parser)]
#[command(name = "gatewayctl", about = "Administer a Syndicate User Gateway", version)]
struct Cli {
    /// Path to a TOML config file; defaults to the platform config dir.
    #[arg(long, global = true, env = "SYNDICATE_UG_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration (defaults merged with the config file).
    ShowConfig,
    /// Generate a fresh ed25519 signing key and write it to a file.
    Keygen {
        /// Destination path for the raw 32-byte secret key.
        out: PathBuf,
    },
    /// Print the URL a block would be fetched/pushed at.
    BlockUrl {
        #[arg(long)]
        base: url::Url,
        #[arg(long)]
        volume_id: u64,
        #[arg(long)]
        fs_path: String,
        #[arg(long, value_parser = parse_hex_u64)]
        file_id: u64,
        #[arg(long)]
        file_version: u64,
        #[arg(long)]
        block_id: u64,
        #[arg(long)]
        block_version: u64,
    },
}

fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x").trim_start_matches("0X"), 16)
}

/// The on-disk shape of a gatewayctl config file; every field optional so a
/// partial file only overrides the defaults it names.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    block_size: Option<u64>,
    max_read_freshness_ms: Option<u64>,
    max_write_freshness_ms: Option<u64>,
    transfer_timeout_ms: Option<u64>,
    retry_cap: Option<u32>,
    connection_budget: Option<usize>,
    fanout_concurrency_per_rg: Option<usize>,
    read_download_concurrency: Option<usize>,
}

impl FileConfig {
    fn apply(self, mut base: Config) -> Config {
        if let Some(v) = self.block_size {
            base.block_size = v;
        }
        if let Some(v) = self.max_read_freshness_ms {
            base.max_read_freshness_ms = v;
        }
        if let Some(v) = self.max_write_freshness_ms {
            base.max_write_freshness_ms = v;
        }
        if let Some(v) = self.transfer_timeout_ms {
            base.transfer_timeout_ms = v;
        }
        if let Some(v) = self.retry_cap {
            base.retry_cap = v;
        }
        if let Some(v) = self.connection_budget {
            base.connection_budget = v;
        }
        if let Some(v) = self.fanout_concurrency_per_rg {
            base.fanout_concurrency_per_rg = v;
        }
        if let Some(v) = self.read_download_concurrency {
            base.read_download_concurrency = v;
        }
        base
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("syndicate-ug").join("gatewayctl.toml"))
}

type BoxError = Box<dyn std::error::Error>;

fn load_config(path: Option<&Path>) -> Result<Config, BoxError> {
    let resolved = path.map(PathBuf::from).or_else(default_config_path);
    let base = Config::default();
    match resolved {
        Some(p) if p.exists() => {
            let text = fs::read_to_string(&p)?;
            let file_config: FileConfig = toml::from_str(&text)?;
            Ok(file_config.apply(base))
        }
        _ => Ok(base),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), BoxError> {
    syndicate_ug::logging::init();
    let cli = Cli::parse();

    match cli.command {
        Command::ShowConfig => {
            let config = load_config(cli.config.as_deref())?;
            println!("{config:#?}");
        }
        Command::Keygen { out } => {
            let key = SigningKey::generate(&mut OsRng);
            fs::write(&out, key.to_bytes())?;
            tracing::info!(path = %out.display(), public_key = %hex::encode(key.verifying_key().to_bytes()), "generated signing key");
        }
        Command::BlockUrl { base, volume_id, fs_path, file_id, file_version, block_id, block_version } => {
            let url = block_url(
                &base,
                VolumeId(volume_id),
                &fs_path,
                FileId(file_id),
                FileVersion(file_version),
                BlockId(block_id),
                BlockVersion(block_version),
            )?;
            println!("{url}");
        }
    }

    Ok(())
}
