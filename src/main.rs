use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Parser, ValueEnum};
use std::time::Duration;
use tokio::sync::mpsc;

use duoquest_sync::sync::domain::identity::{ledger_prefix, quest_path};
use duoquest_sync::{
    ContentSetKey, CoupleKey, EngineConfig, ItemId, MemoryStore, ParticipantId, RemoteStore,
    RetryPolicy, StaticCatalog, SyncDriver, SyncNotification,
};

#[derive(ValueEnum, Clone, Debug)]
enum Scenario {
    /// Simultaneous start: priority publishes, the peer adopts.
    Race,
    /// Both complete the same quest at once: one ledger entry, one credit.
    Reward,
    /// A wiped device recovers the exact remote balance.
    Recovery,
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "alice")]
    participant_a: String,

    #[arg(long, default_value = "bob")]
    participant_b: String,

    /// Calendar date of the shared set (defaults to today, UTC).
    #[arg(long)]
    date: Option<NaiveDate>,

    #[arg(long, value_enum, default_value_t = Scenario::Race)]
    scenario: Scenario,
}

struct DeviceSummary {
    name: String,
    item_ids: Vec<String>,
    balance: Option<i64>,
}

type Device = (
    SyncDriver<MemoryStore, StaticCatalog>,
    mpsc::UnboundedReceiver<SyncNotification>,
);

fn device(me: &ParticipantId, peer: &ParticipantId, store: &MemoryStore) -> Result<Device> {
    // Demo-friendly backoff so the adopt path is visible but quick.
    let config = EngineConfig {
        retry: RetryPolicy {
            base_delay: Duration::from_millis(300),
            factor: 2,
            max_delay: Duration::from_secs(1),
            max_attempts: 3,
        },
        reward_amount: 10,
    };
    let (driver, notices) = SyncDriver::new(
        me.clone(),
        peer.clone(),
        store.clone(),
        StaticCatalog,
        config,
        None,
    )?;
    Ok((driver, notices))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let a = ParticipantId::new(args.participant_a.clone())?;
    let b = ParticipantId::new(args.participant_b.clone())?;
    let date = args.date.unwrap_or_else(|| Utc::now().date_naive());

    println!("[MAIN] scenario: {:?}", args.scenario);
    println!("[MAIN] couple: {}", CoupleKey::derive(&a, &b)?);

    let store = MemoryStore::new();
    match args.scenario {
        Scenario::Race => run_race(&a, &b, &store, date).await?,
        Scenario::Reward => run_reward(&a, &b, &store, date).await?,
        Scenario::Recovery => run_recovery(&a, &b, &store, date).await?,
    }

    Ok(())
}

async fn run_race(
    a: &ParticipantId,
    b: &ParticipantId,
    store: &MemoryStore,
    date: NaiveDate,
) -> Result<()> {
    let (mut dev_a, _na) = device(a, b, store)?;
    let (mut dev_b, _nb) = device(b, a, store)?;

    println!("[RACE] both devices start day {date} with an empty store...");
    dev_b.start_day(date).await;
    dev_a.start_day(date).await;
    tokio::join!(
        dev_a.pump_until_idle(Duration::from_millis(400)),
        dev_b.pump_until_idle(Duration::from_millis(400))
    );

    let key = ContentSetKey::new(dev_a.engine().couple_key().clone(), date);
    let doc = store.get(&quest_path(&key)).await?;
    println!(
        "[RACE] canonical set generated by: {}",
        doc.as_ref()
            .and_then(|d| d["generated_by"].as_str().map(String::from))
            .unwrap_or_else(|| "<none>".into())
    );

    print_comparison(&[summarize(a, &dev_a, &key), summarize(b, &dev_b, &key)]);
    Ok(())
}

async fn run_reward(
    a: &ParticipantId,
    b: &ParticipantId,
    store: &MemoryStore,
    date: NaiveDate,
) -> Result<()> {
    let (mut dev_a, _na) = device(a, b, store)?;
    let (mut dev_b, _nb) = device(b, a, store)?;

    dev_a.on_foreground().await?;
    dev_b.on_foreground().await?;
    dev_b.start_day(date).await;
    dev_a.start_day(date).await;
    tokio::join!(
        dev_a.pump_until_idle(Duration::from_millis(400)),
        dev_b.pump_until_idle(Duration::from_millis(400))
    );

    let key = ContentSetKey::new(dev_a.engine().couple_key().clone(), date);
    let item: ItemId = dev_a
        .engine()
        .adopted_set(&key)
        .expect("set adopted")
        .items[0]
        .id
        .clone();

    println!("[REWARD] both participants complete {item} within the same instant...");
    dev_a.complete_item(&item).await?;
    dev_b.complete_item(&item).await?;
    tokio::join!(
        dev_a.pump_until_idle(Duration::from_millis(400)),
        dev_b.pump_until_idle(Duration::from_millis(400))
    );

    let couple = dev_a.engine().couple_key().clone();
    let entries = store.list(&ledger_prefix(&couple)).await?;
    println!("[REWARD] ledger entries for the item: {}", entries.len());
    println!("[REWARD] balance: {}", dev_a.balance().resync().await?);

    print_comparison(&[summarize(a, &dev_a, &key), summarize(b, &dev_b, &key)]);
    Ok(())
}

async fn run_recovery(
    a: &ParticipantId,
    b: &ParticipantId,
    store: &MemoryStore,
    date: NaiveDate,
) -> Result<()> {
    {
        let (dev_a, _na) = device(a, b, store)?;
        dev_a.balance().credit(500).await?;
        println!("[RECOVERY] seeded remote balance to 500, wiping device B...");
    }

    let (mut dev_b, _nb) = device(b, a, store)?;
    println!(
        "[RECOVERY] fresh device B, local cache before first read: {:?}",
        dev_b.balance().cached()
    );
    dev_b.on_foreground().await?;
    dev_b.start_day(date).await;
    dev_b.pump_until_idle(Duration::from_millis(400)).await;

    println!(
        "[RECOVERY] resynchronized balance: {:?}",
        dev_b.balance().cached()
    );
    let key = ContentSetKey::new(dev_b.engine().couple_key().clone(), date);
    print_comparison(&[summarize(b, &dev_b, &key)]);
    Ok(())
}

fn summarize(
    name: &ParticipantId,
    driver: &SyncDriver<MemoryStore, StaticCatalog>,
    key: &ContentSetKey,
) -> DeviceSummary {
    DeviceSummary {
        name: name.to_string(),
        item_ids: driver
            .engine()
            .adopted_set(key)
            .map(|s| s.item_ids().iter().map(|i| i.to_string()).collect())
            .unwrap_or_default(),
        balance: driver.balance().cached(),
    }
}

fn print_comparison(devices: &[DeviceSummary]) {
    println!();
    println!("==================================================");
    println!("                 DEVICE COMPARISON                ");
    println!("==================================================");
    for d in devices {
        println!(
            "{:<10} | balance {:<8} | items {}",
            d.name,
            d.balance.map(|b| b.to_string()).unwrap_or_else(|| "-".into()),
            if d.item_ids.is_empty() {
                "<none>".into()
            } else {
                d.item_ids.join(", ")
            }
        );
    }
    if let [x, y] = devices {
        println!("--------------------------------------------------");
        println!(
            "Converged: {}",
            if x.item_ids == y.item_ids { "YES" } else { "NO" }
        );
    }
    println!("==================================================");
}
