use super::model::{backfill, ConnectionRecord, Flow, FlowIdentity, Location, PacketObservation};
use crate::settings::Settings;

use indexmap::IndexMap;
use std::collections::{HashSet, VecDeque};

/// What a connections tick changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionsDelta {
    pub added: Vec<FlowIdentity>,
    pub removed: Vec<FlowIdentity>,
    /// Flows dropped to honor the connections bound.
    pub evicted: Vec<FlowIdentity>,
}

impl ConnectionsDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.evicted.is_empty()
    }
}

fn bound(limit: i64) -> Option<usize> {
    if limit > 0 {
        Some(limit as usize)
    } else {
        None
    }
}

/// Number of leading entries of `snapshot` (newest first) that were not
/// part of `previous`. The backend only ever prepends to its cache and drops
/// from the tail, so whatever is new sits in front of the previous snapshot.
/// When the previous snapshot is no longer recognizable all of `snapshot`
/// counts as new.
fn fresh_prefix(previous: &[PacketObservation], snapshot: &[PacketObservation]) -> usize {
    if previous.is_empty() {
        return snapshot.len();
    }
    // An untrimmed cache is exactly the fresh packets followed by `previous`.
    let grown = snapshot.len().saturating_sub(previous.len());
    if snapshot[grown..] == *previous {
        return grown;
    }
    (0..snapshot.len())
        .find(|&start| {
            let tail = &snapshot[start..];
            let n = tail.len().min(previous.len());
            tail[..n] == previous[..n]
        })
        .unwrap_or(snapshot.len())
}

/// Live state of the dashboard: one `Flow` per identity currently reported
/// by the backend, and a bounded window of packet observations in arrival
/// order.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: IndexMap<FlowIdentity, Flow>,
    /// Identities evicted by the bound that the backend still reports.
    overflow: HashSet<FlowIdentity>,
    packets: VecDeque<PacketObservation>,
    /// Last packets snapshot, as the backend sent it.
    last_snapshot: Vec<PacketObservation>,
    local_location: Option<Location>,
    summarized: bool,
}

impl FlowRegistry {
    pub fn new() -> FlowRegistry {
        Self::default()
    }

    /// Reconciles a connections snapshot. Known flows are kept as first
    /// seen, new ones are backfilled and appended, and flows missing from
    /// the snapshot are dropped. The table is then trimmed oldest first.
    pub fn apply_connections(
        &mut self,
        snapshot: Vec<ConnectionRecord>,
        settings: &Settings,
    ) -> ConnectionsDelta {
        let mut delta = ConnectionsDelta::default();
        let present: HashSet<FlowIdentity> = snapshot.iter().map(|r| r.identity()).collect();

        self.flows.retain(|id, _| {
            let keep = present.contains(id);
            if !keep {
                delta.removed.push(id.clone());
            }
            keep
        });

        self.overflow.retain(|id| present.contains(id));

        for mut record in snapshot {
            let id = record.identity();
            if self.flows.contains_key(&id) || self.overflow.contains(&id) {
                continue;
            }
            backfill(&mut record, self.local_location);
            delta.added.push(id.clone());
            self.flows.insert(id, Flow::from_record(record));
        }

        if let Some(max) = bound(settings.max_connections_cache) {
            let excess = self.flows.len().saturating_sub(max);
            for (id, _) in self.flows.drain(..excess) {
                self.overflow.insert(id.clone());
                delta.evicted.push(id);
            }
        }

        if !delta.is_empty() {
            tracing::debug!(
                added = delta.added.len(),
                removed = delta.removed.len(),
                evicted = delta.evicted.len(),
                flows = self.flows.len(),
                "connections reconciled"
            );
        }
        delta
    }

    /// Brings the packet window up to date with a packets snapshot (newest
    /// first) and returns how many observations were added to it.
    ///
    /// Plain snapshots append their new head, oldest first. Summarized
    /// snapshots hold one entry per flow whose length keeps growing, so they
    /// replace the window and only flows not seen before are counted.
    pub fn apply_packets(&mut self, snapshot: Vec<PacketObservation>, settings: &Settings) -> usize {
        let appended = if self.summarized {
            let known: HashSet<FlowIdentity> = self.packets.iter().map(|p| p.identity()).collect();
            self.packets.clear();
            let mut added = 0;
            for obs in snapshot.iter().rev() {
                if !known.contains(&obs.identity()) {
                    added += 1;
                }
                self.push_packet(obs.clone());
            }
            added
        } else {
            let fresh = fresh_prefix(&self.last_snapshot, &snapshot);
            for obs in snapshot[..fresh].iter().rev() {
                self.push_packet(obs.clone());
            }
            fresh
        };
        self.last_snapshot = snapshot;

        if let Some(max) = bound(settings.max_packet_cache) {
            while self.packets.len() > max {
                self.packets.pop_front();
            }
        }
        appended
    }

    fn push_packet(&mut self, mut obs: PacketObservation) {
        backfill(&mut obs, self.local_location);
        self.packets.push_back(obs);
    }

    /// Switching the summarization mode starts a new packet window, as the
    /// backend restarts its own cache.
    pub fn set_summarized(&mut self, summarized: bool) {
        if self.summarized != summarized {
            self.summarized = summarized;
            self.clear_packets();
        }
    }

    pub fn is_summarized(&self) -> bool {
        self.summarized
    }

    pub fn set_local_location(&mut self, location: Option<Location>) {
        self.local_location = location;
    }

    pub fn local_location(&self) -> Option<Location> {
        self.local_location
    }

    /// Flows in arrival order.
    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    pub fn flow(&self, id: &FlowIdentity) -> Option<&Flow> {
        self.flows.get(id)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn packets(&self) -> &VecDeque<PacketObservation> {
        &self.packets
    }

    pub fn clear_packets(&mut self) {
        self.packets.clear();
        self.last_snapshot.clear();
    }

    pub fn clear(&mut self) {
        self.flows.clear();
        self.overflow.clear();
        self.clear_packets();
    }
}
