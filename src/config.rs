//! Runtime configuration: flags, with environment fallbacks loaded from `.env`.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::fund::service::FundDefaults;
use crate::markets::client::AdapterSettings;

const MIN_ADAPTER_TIMEOUT_SECS: u64 = 10;
const MAX_ADAPTER_TIMEOUT_SECS: u64 = 30;

#[derive(Parser, Debug, Clone)]
#[command(name = "predfund")]
#[command(about = "Prediction-market fund backend")]
pub struct AppConfig {
    /// Address the HTTP server binds to
    #[arg(long, env = "PREDFUND_BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_addr: String,

    /// SQLite database path; relative paths resolve against the crate directory
    #[arg(long, env = "FUND_DB_PATH", default_value = "predfund.db")]
    pub db_path: String,

    /// Base URL of the Polygon venue API
    #[arg(long, env = "POLYMARKET_API_BASE", default_value = "https://gamma-api.polymarket.com")]
    pub polygon_api_base: String,

    /// Base URL of the Solana venue API
    #[arg(
        long,
        env = "DFLOW_API_BASE",
        default_value = "https://prediction-markets-api.dflow.net"
    )]
    pub solana_api_base: String,

    /// Per-request adapter timeout in seconds (10-30)
    #[arg(long, env = "ADAPTER_TIMEOUT_SECS", default_value = "15")]
    pub adapter_timeout_secs: u64,

    /// Attempts per adapter call, including the first
    #[arg(long, env = "ADAPTER_MAX_ATTEMPTS", default_value = "3")]
    pub adapter_max_attempts: u32,

    /// Early exit fee applied when a fund is created without one
    #[arg(long, env = "DEFAULT_EARLY_EXIT_FEE_BPS", default_value = "500")]
    pub default_early_exit_fee_bps: u16,

    /// Liquidity buffer applied when a fund is created without one
    #[arg(long, env = "DEFAULT_LIQUIDITY_BUFFER_BPS", default_value = "1000")]
    pub default_liquidity_buffer_bps: u16,
}

impl AppConfig {
    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            timeout: Duration::from_secs(
                self.adapter_timeout_secs
                    .clamp(MIN_ADAPTER_TIMEOUT_SECS, MAX_ADAPTER_TIMEOUT_SECS),
            ),
            max_attempts: self.adapter_max_attempts.max(1),
        }
    }

    pub fn fund_defaults(&self) -> FundDefaults {
        FundDefaults {
            early_exit_fee_bps: self.default_early_exit_fee_bps,
            liquidity_buffer_bps: self.default_liquidity_buffer_bps,
        }
    }

    /// Absolute paths are used as given; relative ones are anchored at the
    /// crate directory so the database does not follow the caller's cwd.
    pub fn resolved_db_path(&self) -> String {
        let raw = self.db_path.trim();
        let raw = if raw.is_empty() { "predfund.db" } else { raw };
        let p = PathBuf::from(raw);
        if p.is_absolute() {
            return p.to_string_lossy().to_string();
        }
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join(p)
            .to_string_lossy()
            .to_string()
    }
}
