use clap::Parser;
use fleet_core::event::DEFAULT_EVENT_CAPACITY;
use fleet_core::protocol::DEFAULT_MAX_FRAME_BYTES;
use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::saga::Confirmation;

const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DB_PATH: &str = ".fleet/fleet.db";
const DEFAULT_LOG_DIR: &str = ".fleet/logs";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub db_path: PathBuf,
    pub log_dir: String,
    pub debug: bool,
    pub queue_capacity: usize,
    pub event_capacity: usize,
    pub max_frame_bytes: usize,
    pub scheduler_interval: Duration,
    pub stats_timeout: Duration,
    pub confirmation: Confirmation,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            debug: false,
            queue_capacity: 256,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            scheduler_interval: Duration::from_secs(60),
            stats_timeout: Duration::from_secs(5),
            confirmation: Confirmation::Acknowledged {
                timeout: Duration::from_secs(10),
            },
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "fleet-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db_path: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long)]
    queue_capacity: Option<usize>,
    #[arg(long)]
    event_capacity: Option<usize>,
    #[arg(long)]
    max_frame_bytes: Option<usize>,
    /// Seconds between scheduler ticks.
    #[arg(long)]
    scheduler_interval: Option<u64>,
    /// Seconds to wait for an agent to acknowledge a saga step.
    #[arg(long)]
    ack_timeout: Option<u64>,
    /// Seconds to wait for live folder statistics.
    #[arg(long)]
    stats_timeout: Option<u64>,
    /// Treat a successful enqueue as step confirmation.
    #[arg(long, default_value_t = false)]
    fire_and_forget: bool,
    #[arg(long)]
    ping_interval: Option<u64>,
    #[arg(long)]
    write_timeout: Option<u64>,
}

pub fn load_config() -> Config {
    let args = Args::parse();
    let defaults = Config::default();
    let ack_timeout = Duration::from_secs(resolve_number(
        args.ack_timeout,
        "FLEET_ACK_TIMEOUT",
        10,
    ));
    let confirmation = if args.fire_and_forget || env_true("FLEET_FIRE_AND_FORGET") {
        Confirmation::FireAndForget
    } else {
        Confirmation::Acknowledged {
            timeout: ack_timeout,
        }
    };
    Config {
        addr: resolve_string(&args.addr, "FLEET_ADDR", DEFAULT_ADDR),
        db_path: PathBuf::from(resolve_string(&args.db_path, "FLEET_DB_PATH", DEFAULT_DB_PATH)),
        log_dir: resolve_string(&args.log_dir, "FLEET_LOG_DIR", DEFAULT_LOG_DIR),
        debug: args.debug || env_true("FLEET_DEBUG"),
        queue_capacity: resolve_number(
            args.queue_capacity,
            "FLEET_QUEUE_CAPACITY",
            defaults.queue_capacity,
        )
        .max(1),
        event_capacity: resolve_number(
            args.event_capacity,
            "FLEET_EVENT_CAPACITY",
            defaults.event_capacity,
        )
        .max(1),
        max_frame_bytes: resolve_number(
            args.max_frame_bytes,
            "FLEET_MAX_FRAME_BYTES",
            defaults.max_frame_bytes,
        ),
        scheduler_interval: Duration::from_secs(
            resolve_number(args.scheduler_interval, "FLEET_SCHEDULER_INTERVAL", 60).max(1),
        ),
        stats_timeout: Duration::from_secs(resolve_number(
            args.stats_timeout,
            "FLEET_STATS_TIMEOUT",
            5,
        )),
        confirmation,
        ping_interval: Duration::from_secs(resolve_number(
            args.ping_interval,
            "FLEET_PING_INTERVAL",
            10,
        )),
        write_timeout: Duration::from_secs(resolve_number(
            args.write_timeout,
            "FLEET_WRITE_TIMEOUT",
            2,
        )),
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_true(key: &str) -> bool {
    env_value(key).is_some_and(|value| is_truthy(&value))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn resolve_string(flag: &str, key: &str, default: &str) -> String {
    pick_string(flag, env_value(key), default)
}

fn resolve_number<T: FromStr>(flag: Option<T>, key: &str, default: T) -> T {
    pick_number(flag, env_value(key), default)
}

/// Flag first, then environment, then default.
fn pick_string(flag: &str, env: Option<String>, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env.unwrap_or_else(|| default.to_string())
}

fn pick_number<T: FromStr>(flag: Option<T>, env: Option<String>, default: T) -> T {
    if let Some(value) = flag {
        return value;
    }
    env.and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_win_over_environment_then_defaults() {
        assert_eq!(
            pick_string("127.0.0.1:9000", Some("0.0.0.0:1".to_string()), DEFAULT_ADDR),
            "127.0.0.1:9000"
        );
        assert_eq!(
            pick_string("  ", Some("0.0.0.0:1".to_string()), DEFAULT_ADDR),
            "0.0.0.0:1"
        );
        assert_eq!(pick_string("", None, DEFAULT_ADDR), DEFAULT_ADDR);

        assert_eq!(pick_number(Some(5u64), Some("9".to_string()), 60), 5);
        assert_eq!(pick_number(None, Some(" 9 ".to_string()), 60u64), 9);
        assert_eq!(pick_number(None, Some("soon".to_string()), 60u64), 60);
    }

    #[test]
    fn truthy_values_match_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "off", "no", ""] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn defaults_use_acknowledged_steps() {
        let config = Config::default();
        assert!(matches!(
            config.confirmation,
            Confirmation::Acknowledged { .. }
        ));
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.scheduler_interval, Duration::from_secs(60));
    }
}
