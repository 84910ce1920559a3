use std::env;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use transactional_outbox::SqlxOutboxStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage:");
        eprintln!("  outbox-cli replay-since <rfc3339_ts> <DATABASE_URL>");
        eprintln!("  outbox-cli replay-range <from_id> <to_id> <DATABASE_URL>");
        std::process::exit(1);
    }

    let cmd = args[1].as_str();

    match cmd {
        "replay-since" if args.len() == 4 => {
            let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(&args[2])?.with_timezone(&Utc);
            let db_url = &args[3];
            let pool = PgPool::connect(db_url).await?;
            let store = SqlxOutboxStore::new(pool, Duration::from_secs(10));
            let count = store.replay_since(ts).await?;
            println!("Replayed {} rows since {}", count, ts);
        }
        "replay-range" if args.len() == 5 => {
            let from: i64 = args[2].parse()?;
            let to: i64 = args[3].parse()?;
            let db_url = &args[4];
            let pool = PgPool::connect(db_url).await?;
            let store = SqlxOutboxStore::new(pool, Duration::from_secs(10));
            let count = store.replay_range(from, to).await?;
            println!("Replayed {} rows between {} and {}", count, from, to);
        }
        _ => {
            eprintln!("Invalid arguments");
            std::process::exit(1);
        }
    }

    Ok(())
}
