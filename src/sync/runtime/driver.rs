//! **SyncDriver**
//!
//! The imperative shell around the pure engine. It has three jobs:
//! 1. **Feed the logic core** ([`SyncEngine`]) with events from the caller,
//!    the store subscriptions, and its own timers.
//! 2. **Execute side effects** ([`EngineCommand`]) against the remote store.
//! 3. **Own every timer and subscription**, so that backgrounding the app
//!    cancels in-flight retries and tears down listeners without leaving
//!    orphans.
//!
//! Nothing here blocks the event loop: retries are scheduled tasks raced
//! against a generation counter, and store calls are awaited inline in the
//! single logical actor that owns the engine.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::sync::balance::BalanceSynchronizer;
use crate::sync::domain::generate::ContentCatalog;
use crate::sync::domain::identity::{
    completion_prefix, completion_slot_path, quest_path, ContentSetKey, ParticipantId,
};
use crate::sync::domain::model::ItemId;
use crate::sync::domain::schema::SchemaGate;
use crate::sync::engine::{EngineCommand, EngineConfig, EngineEvent, SyncEngine, SyncNotification};
use crate::sync::error::SyncError;
use crate::sync::remote::api::{Predicate, RemoteStore, WriteOutcome};
use crate::sync::replica::Replica;

/// One device's sync driver.
pub struct SyncDriver<S, C> {
    engine: SyncEngine<C>,
    store: S,
    balance: Arc<BalanceSynchronizer<S>>,
    config: EngineConfig,

    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    /// Deferred command replays (retried claims/credits).
    cmds_tx: mpsc::UnboundedSender<(EngineCommand, u32)>,
    cmds_rx: mpsc::UnboundedReceiver<(EngineCommand, u32)>,
    notices_tx: mpsc::UnboundedSender<SyncNotification>,

    /// Bumped on background/teardown; tasks spawned under an older
    /// generation silently stop delivering.
    timer_gen: Arc<AtomicU64>,
    /// Live subscription pump tasks, aborted on background.
    sub_tasks: Vec<JoinHandle<()>>,
    /// Days with a completion watch, so foregrounding can re-subscribe.
    watched: HashSet<ContentSetKey>,
    balance_forward: Option<JoinHandle<()>>,

    replica: Option<Replica>,
}

impl<S, C> SyncDriver<S, C>
where
    S: RemoteStore + Clone + Send + Sync + 'static,
    C: ContentCatalog,
{
    /// Builds the driver and returns the caller's notification stream.
    pub fn new(
        me: ParticipantId,
        peer: ParticipantId,
        store: S,
        catalog: C,
        config: EngineConfig,
        replica: Option<Replica>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyncNotification>), SyncError> {
        let engine = SyncEngine::new(me, peer, catalog, config.clone())?;
        let balance = Arc::new(BalanceSynchronizer::new(
            store.clone(),
            engine.couple_key().clone(),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmds_tx, cmds_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                engine,
                store,
                balance,
                config,
                events_tx,
                events_rx,
                cmds_tx,
                cmds_rx,
                notices_tx,
                timer_gen: Arc::new(AtomicU64::new(0)),
                sub_tasks: Vec::new(),
                watched: HashSet::new(),
                balance_forward: None,
                replica,
            },
            notices_rx,
        ))
    }

    pub fn engine(&self) -> &SyncEngine<C> {
        &self.engine
    }

    /// Shared handle to the balance synchronizer (for `observe`/`resync`).
    pub fn balance(&self) -> Arc<BalanceSynchronizer<S>> {
        self.balance.clone()
    }

    // ================================
    // Caller API
    // ================================

    /// Kicks off generate-or-adopt for the given calendar date.
    pub async fn start_day(&mut self, date: NaiveDate) {
        let key = ContentSetKey::new(self.engine.couple_key().clone(), date);
        self.process_engine(EngineEvent::DayStarted { key }).await;
    }

    /// Marks the local participant's slot on an item complete.
    ///
    /// Idempotent: a second call (or a replayed tap) is a no-op. The
    /// resulting state transition flows back through the completion
    /// subscription on both devices.
    pub async fn complete_item(&mut self, item_id: &ItemId) -> Result<(), SyncError> {
        let now = Utc::now();
        let me = self.engine.me().clone();
        let (key, item) = self
            .engine
            .item(item_id)
            .ok_or_else(|| SyncError::NotFound(item_id.to_string()))?;
        if item.is_expired(now) {
            return Err(SyncError::Expired);
        }
        let key = key.clone();
        if self.engine.own_slot(item_id).is_some() {
            return Ok(());
        }

        let path = completion_slot_path(&key, item_id.as_str(), &me);
        self.store.set(&path, Value::String(now.to_rfc3339())).await?;

        // Evaluate locally right away; the subscription echo is a harmless
        // duplicate.
        self.process_engine(EngineEvent::CompletionSlotSeen {
            key,
            item_id: item_id.clone(),
            participant: me,
            at: now,
        })
        .await;
        Ok(())
    }

    /// Lifecycle: app became visible. Starts the balance subscription and
    /// re-attaches completion watches.
    pub async fn on_foreground(&mut self) -> Result<(), SyncError> {
        self.balance.start().await?;
        if self.balance_forward.is_none() {
            let mut rx = self.balance.observe();
            let notices = self.notices_tx.clone();
            self.balance_forward = Some(tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    if let Some(balance) = *rx.borrow() {
                        let _ = notices.send(SyncNotification::BalanceChanged(balance));
                    }
                }
            }));
        }
        // Re-attach watches only when backgrounding tore them down; a second
        // foreground signal must not stack a second listener per day.
        if self.sub_tasks.is_empty() {
            for key in self.watched.clone() {
                self.spawn_completion_watch(key);
            }
        }
        Ok(())
    }

    /// Lifecycle: app left the screen. Cancels pending retry timers, tears
    /// down subscriptions, stops the balance listener. No orphaned timers
    /// survive this.
    pub fn on_background(&mut self) {
        self.timer_gen.fetch_add(1, Ordering::SeqCst);
        for task in self.sub_tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.balance_forward.take() {
            task.abort();
        }
        self.balance.stop();
        log::info!("[DRIVER] backgrounded: timers cancelled, listeners stopped");
    }

    /// Runs until both channels close or `shutdown` flips true.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        log::info!("[DRIVER] starting");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.on_background();
                        return;
                    }
                }
                Some(ev) = self.events_rx.recv() => self.process_engine(ev).await,
                Some((cmd, attempt)) = self.cmds_rx.recv() => {
                    let mut queue = Vec::new();
                    self.execute_command(cmd, attempt, &mut queue).await;
                    for ev in queue {
                        self.process_engine(ev).await;
                    }
                }
            }
        }
    }

    /// Drains pending events until the driver has been idle for `idle`.
    /// Used by tests and the demo to step the world deterministically.
    pub async fn pump_until_idle(&mut self, idle: Duration) {
        loop {
            tokio::select! {
                Some(ev) = self.events_rx.recv() => self.process_engine(ev).await,
                Some((cmd, attempt)) = self.cmds_rx.recv() => {
                    let mut queue = Vec::new();
                    self.execute_command(cmd, attempt, &mut queue).await;
                    for ev in queue {
                        self.process_engine(ev).await;
                    }
                }
                _ = tokio::time::sleep(idle) => return,
            }
        }
    }

    // ================================
    // Engine plumbing
    // ================================

    /// Feeds an event into the engine and executes all resulting commands,
    /// queueing any follow-up events until quiescent.
    pub async fn process_engine(&mut self, event: EngineEvent) {
        let mut queue = vec![event];
        while let Some(ev) = queue.pop() {
            log::trace!("[DRIVER] engine.handle_event({ev:?})");
            let cmds = self.engine.handle_event(ev);
            for cmd in cmds {
                self.execute_command(cmd, 0, &mut queue).await;
            }
        }
    }

    async fn execute_command(
        &mut self,
        cmd: EngineCommand,
        attempt: u32,
        queue: &mut Vec<EngineEvent>,
    ) {
        log::trace!("[DRIVER] cmd: {cmd:?}");
        match cmd {
            EngineCommand::FetchSet { key } => {
                let path = quest_path(&key);
                match self.store.get(&path).await {
                    Ok(payload) => queue.push(EngineEvent::RemoteSetFetched { key, payload }),
                    Err(e) => queue.push(EngineEvent::FetchFailed { key, error: e.into() }),
                }
            }

            EngineCommand::PublishSet { key, set, replacing } => {
                let path = quest_path(&key);
                let mut value = match serde_json::to_value(&set) {
                    Ok(v) => v,
                    Err(e) => {
                        self.notify(SyncNotification::Fault {
                            error: SyncError::ValidationFailed(e.to_string()),
                            context: format!("encoding daily set {key}"),
                        });
                        return;
                    }
                };
                SchemaGate::stamp(&mut value);
                let predicate = match replacing {
                    Some(prev) => Predicate::Equals(prev),
                    None => Predicate::Absent,
                };
                match self.store.conditional_set(&path, value, predicate).await {
                    Ok(outcome) => queue.push(EngineEvent::PublishOutcome {
                        key,
                        committed: outcome == WriteOutcome::Committed,
                    }),
                    // The engine owns the backoff for this path.
                    Err(e) => queue.push(EngineEvent::FetchFailed { key, error: e.into() }),
                }
            }

            EngineCommand::ScheduleRetry { key, delay } => {
                self.spawn_retry_timer(key, delay);
            }

            EngineCommand::WatchCompletion { key } => {
                self.watched.insert(key.clone());
                self.spawn_completion_watch(key);
            }

            EngineCommand::ClaimReward { item_id, entry } => {
                match self.balance.claim(&entry).await {
                    Ok(won) => queue.push(EngineEvent::LedgerClaimOutcome { item_id, won }),
                    Err(e) => self.retry_or_fault(
                        EngineCommand::ClaimReward { item_id, entry },
                        attempt,
                        e,
                        "claiming reward",
                    ),
                }
            }

            EngineCommand::CreditBalance { item_id, amount } => {
                match self.balance.credit(amount).await {
                    Ok(new_balance) => {
                        queue.push(EngineEvent::RewardCredited { item_id, new_balance })
                    }
                    Err(e) => self.retry_or_fault(
                        EngineCommand::CreditBalance { item_id, amount },
                        attempt,
                        e,
                        "crediting balance",
                    ),
                }
            }

            EngineCommand::Notify(n) => self.notify(n),
        }
    }

    fn notify(&mut self, notification: SyncNotification) {
        if let Some(replica) = &mut self.replica {
            let result = match &notification {
                SyncNotification::ContentSetReady { set, .. } => replica.record_set(set),
                SyncNotification::BalanceChanged(balance) => replica.record_balance(*balance),
                _ => Ok(()),
            };
            if let Err(e) = result {
                log::warn!("[DRIVER] replica write failed: {e:#}");
            }
        }
        let _ = self.notices_tx.send(notification);
    }

    /// Transient failures of ledger/balance writes are replayed on a timer;
    /// anything else surfaces as a fault.
    fn retry_or_fault(&mut self, cmd: EngineCommand, attempt: u32, error: SyncError, context: &str) {
        if error.is_retryable() && !self.config.retry.exhausted(attempt + 1) {
            let delay = self.config.retry.delay(attempt + 1);
            log::debug!("[DRIVER] {context} failed ({error}), replay in {delay:?}");
            let cmds_tx = self.cmds_tx.clone();
            let gen = self.timer_gen.clone();
            let expected = gen.load(Ordering::SeqCst);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if gen.load(Ordering::SeqCst) == expected {
                    let _ = cmds_tx.send((cmd, attempt + 1));
                }
            });
        } else {
            self.notify(SyncNotification::Fault {
                error,
                context: context.to_string(),
            });
        }
    }

    fn spawn_retry_timer(&mut self, key: ContentSetKey, delay: Duration) {
        let events_tx = self.events_tx.clone();
        let gen = self.timer_gen.clone();
        let expected = gen.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A background/teardown in the meantime invalidates the timer.
            if gen.load(Ordering::SeqCst) == expected {
                let _ = events_tx.send(EngineEvent::RetryElapsed { key });
            }
        });
    }

    /// Subscribes to the day's completion subtree and replays slots already
    /// present remotely (resync after relaunch or foreground).
    fn spawn_completion_watch(&mut self, key: ContentSetKey) {
        let prefix = completion_prefix(&key);
        let mut sub = match self.store.subscribe(&prefix) {
            Ok(sub) => sub,
            Err(e) => {
                self.notify(SyncNotification::Fault {
                    error: e.into(),
                    context: format!("watching completion for {key}"),
                });
                return;
            }
        };

        let store = self.store.clone();
        let events_tx = self.events_tx.clone();
        let gen = self.timer_gen.clone();
        let expected = gen.load(Ordering::SeqCst);

        self.sub_tasks.push(tokio::spawn(async move {
            // Subscribe-then-replay: a write landing during the replay is
            // delivered twice, which the engine absorbs.
            match store.list(&prefix).await {
                Ok(paths) => {
                    for path in paths {
                        if let Ok(Some(value)) = store.get(&path).await {
                            if let Some(ev) = parse_slot(&prefix, &path, &value, &key) {
                                let _ = events_tx.send(ev);
                            }
                        }
                    }
                }
                Err(e) => log::warn!("[DRIVER] completion replay for {key} failed: {e}"),
            }

            while let Some(notice) = sub.recv().await {
                if gen.load(Ordering::SeqCst) != expected {
                    return;
                }
                let Some(value) = notice.value else { continue };
                if let Some(ev) = parse_slot(&prefix, &notice.path, &value, &key) {
                    let _ = events_tx.send(ev);
                }
            }
        }));
    }
}

impl<S, C> Drop for SyncDriver<S, C> {
    fn drop(&mut self) {
        for task in self.sub_tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.balance_forward.take() {
            task.abort();
        }
    }
}

/// Parses `completion/{couple}/{date}/{item}/{participant}` plus the stored
/// timestamp into a slot event. Foreign shapes are dropped with a log line
/// rather than trusted.
fn parse_slot(prefix: &str, path: &str, value: &Value, key: &ContentSetKey) -> Option<EngineEvent> {
    let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;
    let (item, participant) = rest.split_once('/')?;
    let participant = match ParticipantId::new(participant) {
        Ok(p) => p,
        Err(e) => {
            log::warn!("[DRIVER] dropping completion slot {path}: {e}");
            return None;
        }
    };
    let at = value.as_str()?.parse::<DateTime<Utc>>().ok().or_else(|| {
        log::warn!("[DRIVER] dropping completion slot {path}: bad timestamp");
        None
    })?;
    Some(EngineEvent::CompletionSlotSeen {
        key: key.clone(),
        item_id: ItemId::new(item),
        participant,
        at,
    })
}
