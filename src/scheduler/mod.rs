//! Scheduler: the handful of named background jobs that run independent of
//! any inbound packet (spec.md §4.6). Each job is cancellable on its own
//! tick and a no-op whenever the radio link isn't connected; last-run times
//! persist in the Store's settings table so a restart doesn't immediately
//! re-fire everything.

use crate::automation::{self};
use crate::config::{AutomationConfig, SchedulerConfig, StoreConfig};
use crate::session::{OutboundCommand, SessionHandle};
use crate::store::{retention, Store};
use std::collections::HashMap;
use tokio::time::{interval, Duration};

const TRACEROUTE_SETTING: &str = "scheduler.last_traceroute";
const NODE_REFRESH_SETTING: &str = "scheduler.last_node_refresh";
const RETENTION_SETTING: &str = "scheduler.last_retention_sweep";
const VERSION_CHECK_SETTING: &str = "scheduler.last_version_check";

/// Runs forever, driving the traceroute rotation, auto-announce, node
/// database refresh, retention sweep and version-check jobs on their
/// configured cadences. Exits only when the process does; callers spawn
/// this as its own task.
pub async fn run(store: Store, session: SessionHandle, scheduler: SchedulerConfig, automation: AutomationConfig, store_cfg: StoreConfig) {
    let mut traceroute_tick = interval(Duration::from_secs(scheduler.traceroute_interval_secs.max(1)));
    let mut announce_tick = interval(Duration::from_secs(scheduler.announce_interval_secs.max(1)));
    let mut node_refresh_tick = interval(Duration::from_secs(scheduler.node_refresh_interval_secs.max(1)));
    let mut retention_tick = interval(Duration::from_secs(scheduler.retention_sweep_interval_secs.max(1)));
    let mut version_check_tick = interval(Duration::from_secs(scheduler.version_check_interval_secs.max(1)));
    let mut traceroute_cooldowns: HashMap<u32, i64> = HashMap::new();

    // The node refresh job waits for a short warmup so a freshly-connected
    // session has had time to receive its initial node db replay before we
    // ask it to request one again.
    tokio::time::sleep(Duration::from_secs(300.min(scheduler.node_refresh_interval_secs))).await;

    if scheduler.announce_on_start && session.is_connected() {
        if let Err(e) = automation::send_announce(&automation, &session).await {
            log::warn!("scheduler: announce_on_start failed: {e}");
        }
    }

    loop {
        tokio::select! {
            _ = traceroute_tick.tick() => {
                run_traceroute_rotation(&store, &session, &mut traceroute_cooldowns, &scheduler).await;
            }
            _ = announce_tick.tick() => {
                if session.is_connected() {
                    if let Err(e) = automation::send_announce(&automation, &session).await {
                        log::warn!("scheduler: auto-announce failed: {e}");
                    }
                }
            }
            _ = node_refresh_tick.tick() => {
                run_node_refresh(&store, &session).await;
            }
            _ = retention_tick.tick() => {
                run_retention_sweep(&store, &store_cfg).await;
            }
            _ = version_check_tick.tick() => {
                run_version_check(&store).await;
            }
        }
    }
}

/// Picks the active node (spec.md §4.6: `lastHeard` within
/// `traceroute_active_window_secs`) with the oldest traceroute — or one
/// that's never been traced at all — and skips any destination still
/// inside its own per-destination cooldown of one `traceroute_interval_secs`
/// from the last request sent to it, so a slow reply can't trigger a second
/// request to the same node before the first has had a chance to land.
async fn run_traceroute_rotation(store: &Store, session: &SessionHandle, cooldowns: &mut HashMap<u32, i64>, scheduler: &SchedulerConfig) {
    if !session.is_connected() {
        return;
    }
    let nodes = match store.list_nodes().await {
        Ok(n) => n,
        Err(e) => {
            log::warn!("scheduler: traceroute rotation couldn't list nodes: {e}");
            return;
        }
    };
    if nodes.is_empty() {
        return;
    }
    let last_traced = match store.last_traceroute_at().await {
        Ok(m) => m,
        Err(e) => {
            log::warn!("scheduler: traceroute rotation couldn't read last-traced times: {e}");
            return;
        }
    };

    let now = now_unix();
    let cooldown_secs = scheduler.traceroute_interval_secs as i64;

    let target = nodes
        .iter()
        .filter(|n| n.last_heard.map(|lh| now - lh <= scheduler.traceroute_active_window_secs).unwrap_or(false))
        .filter(|n| cooldowns.get(&n.node_num).map(|last| now - last >= cooldown_secs).unwrap_or(true))
        .min_by_key(|n| last_traced.get(&n.node_num).copied().unwrap_or(i64::MIN))
        .map(|n| n.node_num);

    let Some(target) = target else {
        return;
    };

    let packet_id = session.allocate_packet_id();
    if let Err(e) = session.send(OutboundCommand::SendTracerouteRequest { destination: target, packet_id }) {
        log::warn!("scheduler: traceroute request to {target:08x} failed: {e}");
        return;
    }
    cooldowns.insert(target, now);
    let _ = store.set_setting(TRACEROUTE_SETTING.to_string(), now.to_string()).await;
}

async fn run_node_refresh(store: &Store, session: &SessionHandle) {
    if !session.is_connected() {
        return;
    }
    if let Err(e) = session.send(OutboundCommand::RequestNodeDb) {
        log::warn!("scheduler: node db refresh failed: {e}");
        return;
    }
    let now = now_unix();
    let _ = store.set_setting(NODE_REFRESH_SETTING.to_string(), now.to_string()).await;
}

async fn run_retention_sweep(store: &Store, store_cfg: &StoreConfig) {
    let now = now_unix();
    match retention::sweep(store, store_cfg, now).await {
        Ok(removed) => {
            let total: usize = removed.iter().map(|(_, n)| n).sum();
            if total > 0 {
                log::info!("scheduler: retention sweep removed {total} rows");
            }
            let _ = store.set_setting(RETENTION_SETTING.to_string(), now.to_string()).await;
        }
        Err(e) => log::warn!("scheduler: retention sweep failed: {e}"),
    }
}

/// Version check is informational only: MeshMonitor doesn't reach out to
/// any external service for this, it just timestamps that the job ran so
/// the API's `/api/connection` payload can report when it last looked.
async fn run_version_check(store: &Store) {
    let now = now_unix();
    let _ = store.set_setting(VERSION_CHECK_SETTING.to_string(), now.to_string()).await;
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
