use crate::client::ClientShared;
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{ChangeDelta, PollResult};
use crate::types::{ClientOptions, GroupUpdate};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// Well-known change group the client keeps every cached control in
///
/// The group is created server-side on first use and recreated after every
/// reconnect or design change; auto-poll on it is what turns server-side
/// value changes into push deltas.
pub const AUTO_POLL_GROUP_ID: &str = "qsys-qrc-auto";

/// Client-side record of the server-side change groups
///
/// Groups only exist on the core while a socket lives, so the record is what
/// lets the engine recreate them after a reconnect. Re-adding a member that
/// is already in a group is idempotent on the core, and treated that way
/// here.
#[derive(Default)]
pub(crate) struct ChangeGroups {
    groups: Mutex<BTreeMap<String, GroupState>>,
}

#[derive(Default, Clone)]
pub(crate) struct GroupState {
    /// Component name -> subscribed control names
    pub(crate) members: BTreeMap<String, BTreeSet<String>>,
    /// Auto-poll rate in seconds, if enabled on this group
    pub(crate) auto_poll: Option<f64>,
}

impl ChangeGroups {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_members(&self, group_id: &str, component: &str, controls: &[String]) {
        let mut groups = self.groups.lock().unwrap();
        let entry = groups.entry(group_id.to_string()).or_default();
        entry
            .members
            .entry(component.to_string())
            .or_default()
            .extend(controls.iter().cloned());
    }

    pub(crate) fn record_auto_poll(&self, group_id: &str, rate: f64) {
        let mut groups = self.groups.lock().unwrap();
        groups.entry(group_id.to_string()).or_default().auto_poll = Some(rate);
    }

    /// Forget one group's membership (it is about to be rebuilt)
    pub(crate) fn reset_group(&self, group_id: &str) {
        self.groups.lock().unwrap().remove(group_id);
    }

    /// Forget everything; used when the design changes
    pub(crate) fn clear(&self) {
        self.groups.lock().unwrap().clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<(String, GroupState)> {
        self.groups
            .lock()
            .unwrap()
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect()
    }
}

/// Subscribe a set of controls into a change group, recording the membership
/// for recreation after a reconnect
pub(crate) async fn add_component_controls(
    groups: &ChangeGroups,
    conn: &Connection,
    options: &ClientOptions,
    group_id: &str,
    component: &str,
    controls: &[String],
) -> Result<()> {
    if controls.is_empty() {
        return Ok(());
    }
    groups.record_members(group_id, component, controls);
    send_add(conn, options, group_id, component, controls).await
}

async fn send_add(
    conn: &Connection,
    options: &ClientOptions,
    group_id: &str,
    component: &str,
    controls: &[String],
) -> Result<()> {
    let params = json!({
        "Id": group_id,
        "Component": {
            "Name": component,
            "Controls": controls.iter().map(|name| json!({ "Name": name })).collect::<Vec<_>>(),
        },
    });
    conn.request("ChangeGroup.AddComponentControl", params, options.request_timeout)
        .await?;
    Ok(())
}

/// Poll a change group once
pub(crate) async fn poll(
    conn: &Connection,
    options: &ClientOptions,
    group_id: &str,
) -> Result<PollResult> {
    let result = conn
        .request("ChangeGroup.Poll", json!({ "Id": group_id }), options.request_timeout)
        .await?;
    Ok(serde_json::from_value(result)?)
}

/// Ask the core to push poll deltas for a group on its own
pub(crate) async fn auto_poll(
    groups: &ChangeGroups,
    conn: &Connection,
    options: &ClientOptions,
    group_id: &str,
    rate: f64,
) -> Result<()> {
    conn.request(
        "ChangeGroup.AutoPoll",
        json!({ "Id": group_id, "Rate": rate }),
        options.request_timeout,
    )
    .await?;
    groups.record_auto_poll(group_id, rate);
    Ok(())
}

/// Recreate every recorded group except the well-known one on a fresh socket
///
/// The default group is rebuilt from the cache by the design sync instead,
/// since its membership is exactly "every cached control".
pub(crate) async fn resubscribe_custom(
    groups: &ChangeGroups,
    conn: &Connection,
    options: &ClientOptions,
) -> Result<()> {
    for (group_id, state) in groups.snapshot() {
        if group_id == AUTO_POLL_GROUP_ID {
            continue;
        }
        for (component, controls) in &state.members {
            let controls: Vec<String> = controls.iter().cloned().collect();
            send_add(conn, options, &group_id, component, &controls).await?;
        }
        if let Some(rate) = state.auto_poll {
            conn.request(
                "ChangeGroup.AutoPoll",
                json!({ "Id": group_id, "Rate": rate }),
                options.request_timeout,
            )
            .await?;
        }
    }
    Ok(())
}

/// Route one poll result into the cache and fan out the change events
///
/// Each changed control emits its own event, each touched component emits
/// one batch event, and the whole poll emits one group update.
pub(crate) fn apply_poll(shared: &ClientShared, poll: PollResult) -> GroupUpdate {
    let mut by_component: BTreeMap<String, Vec<&ChangeDelta>> = BTreeMap::new();
    for change in &poll.changes {
        let Some(component) = change.component.as_deref() else {
            tracing::debug!("Change without component name for control {}", change.name);
            continue;
        };
        by_component
            .entry(component.to_string())
            .or_default()
            .push(change);
    }

    let mut snapshots = Vec::new();
    for (name, deltas) in by_component {
        let component = shared.cache.lock().unwrap().get(&name).cloned();
        match component {
            Some(component) => {
                for control in component.apply_changes(&deltas) {
                    snapshots.push(control.snapshot());
                }
            }
            None => tracing::debug!("Change for uncached component {}", name),
        }
    }

    let update = GroupUpdate {
        group: poll.id,
        changes: snapshots,
    };
    if !update.changes.is_empty() {
        let _ = shared.update_tx.send(update.clone());
    }
    update
}
