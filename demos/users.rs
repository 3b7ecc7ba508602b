//! Resolves a small social graph through a loader in front of a simulated user service.
//!
//! ```text
//! cargo run --example users --features demo -- --depth 3 --max-batch-size 4 --delay-ms 2
//! RUST_LOG=kb_loader=trace cargo run --example users --features demo
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use kb_loader::prelude::*;
use thiserror::Error;
use tracing::info;
use tracing::instrument;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, clap::Parser)]
#[clap(about, version, name = "users")]
struct Cli {
    /// Total number of users known to the service.
    #[clap(long, env = "KB_USERS", default_value_t = 50)]
    users: u64,

    /// How many friendship hops to follow from the first user.
    #[clap(long, env = "KB_DEPTH", default_value_t = 3)]
    depth: u32,

    /// Keys per call of the service.
    #[clap(long, env = "KB_MAX_BATCH_SIZE", default_value_t = 10)]
    max_batch_size: usize,

    /// Collection window. 0 dispatches right after the current task yields.
    #[clap(long, env = "KB_DELAY_MS", default_value_t = 0)]
    delay_ms: u64,

    /// Simulated round trip of the service.
    #[clap(long, env = "KB_LATENCY_MS", default_value_t = 20)]
    latency_ms: u64,
}

#[derive(Debug, Clone)]
struct User {
    id:      u64,
    name:    String,
    friends: Vec<u64>,
}

#[derive(Debug, Error)]
enum ServiceError {
    #[error("user {0} not found")]
    NotFound(u64),
}

struct UserService {
    users:   u64,
    latency: Duration,
}

impl UserService {
    fn user(&self, id: u64) -> Result<User, ServiceError> {
        if id >= self.users {
            return Err(ServiceError::NotFound(id));
        }
        // Every user befriends a couple of neighbours and one user the service doesn't have.
        let friends = vec![(id * 3 + 1) % self.users, (id * 7 + 2) % self.users, self.users + id];
        Ok(User {
            id,
            name: format!("user #{id}"),
            friends,
        })
    }
}

#[async_trait]
impl BatchFn for UserService {
    type Error = ServiceError;
    type Key = u64;
    type Value = User;

    #[instrument(level = "debug", skip(self))]
    async fn load(&self, keys: &[u64]) -> Result<Vec<Result<User, ServiceError>>, ServiceError> {
        tokio::time::sleep(self.latency).await;
        Ok(keys.iter().map(|&id| self.user(id)).collect())
    }
}

struct BatchPrinter;

#[async_trait]
impl Observer<UserService> for BatchPrinter {
    async fn on_dispatch(&self, batch_id: u64, keys: &[u64]) {
        println!("batch #{batch_id:<3} {keys:?}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = LoaderConfig::builder()
        .name("users")
        .max_batch_size(cli.max_batch_size)
        .build()?;

    let service = UserService {
        users:   cli.users,
        latency: Duration::from_millis(cli.latency_ms),
    };

    let builder = Loader::builder(service).config(config).observer(BatchPrinter);
    let loader = if cli.delay_ms > 0 {
        builder.scheduler(Delay::new(Duration::from_millis(cli.delay_ms))).build()
    }
    else {
        builder.build()
    };

    let mut seen = BTreeSet::from([0]);
    let mut level = vec![0];
    let mut missing = 0;

    for depth in 0..=cli.depth {
        if level.is_empty() {
            break;
        }

        // Each user is resolved by its own task, they know nothing about each other.
        let tasks = level
            .iter()
            .map(|&id| {
                let loader = loader.clone();
                tokio::spawn(async move { loader.load(id).await })
            })
            .collect::<Vec<_>>();

        let mut next = Vec::new();
        for task in tasks {
            match task.await? {
                Ok(user) => {
                    info!(depth, id = user.id, name = %user.name, friends = ?user.friends, "resolved");
                    next.extend(user.friends.into_iter().filter(|id| seen.insert(*id)));
                }
                Err(error) if error.is_key_error() => {
                    missing += 1;
                    info!(depth, %error, "skipped");
                }
                Err(error) => return Err(error.into()),
            }
        }
        level = next;
    }

    let stats = loader.stats();
    println!(
        "{} users requested, {} missing, {} batches, {} cache hits",
        stats.keys_requested, missing, stats.batches, stats.cache_hits
    );

    Ok(())
}
