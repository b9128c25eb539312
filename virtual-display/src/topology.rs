//! Display topology snapshots and the health evaluation run after enabling.
//!
//! Everything here is a pure function of a [`TopologySnapshot`] so it can be
//! tested without any platform.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub id: u32,
    pub serial_number: u32,
    pub is_managed_virtual_device: bool,
    pub is_in_mirror_set: bool,
    pub mirror_master_id: Option<u32>,
    pub bounds: Rect,
}

impl DisplayInfo {
    /// Whether the display can take over as main.
    pub fn is_viable(&self) -> bool {
        !self.bounds.is_empty()
    }
}

/// Immutable point-in-time view of the display topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub main_display_id: u32,
    pub displays: Vec<DisplayInfo>,
}

impl TopologySnapshot {
    pub fn display(&self, id: u32) -> Option<&DisplayInfo> {
        self.displays.iter().find(|d| d.id == id)
    }

    pub fn managed_display_for_serial(&self, serial: u32) -> Option<&DisplayInfo> {
        self.displays
            .iter()
            .find(|d| d.is_managed_virtual_device && d.serial_number == serial)
    }

    pub fn has_physical_fallback(&self) -> bool {
        self.displays
            .iter()
            .any(|d| !d.is_managed_virtual_device && d.is_viable())
    }

    /// Comparison key used to decide whether two samples show the same topology.
    pub fn signature(&self) -> TopologySignature {
        let mut displays: Vec<_> = self
            .displays
            .iter()
            .map(|d| (d.id, d.is_in_mirror_set, d.mirror_master_id, d.bounds))
            .collect();
        displays.sort_by_key(|entry| entry.0);
        let mut managed: Vec<u32> = self
            .displays
            .iter()
            .filter(|d| d.is_managed_virtual_device)
            .map(|d| d.id)
            .collect();
        managed.sort_unstable();
        TopologySignature {
            main_display_id: self.main_display_id,
            managed,
            displays,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySignature {
    main_display_id: u32,
    managed: Vec<u32>,
    displays: Vec<(u32, bool, Option<u32>, Rect)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyIssue {
    ManagedDisplaysCollapsedIntoSingleMirrorSet,
    ManagedDisplaysOverlappingInExtendedSpace,
    MainDisplayOutsideManagedSetWithoutPhysicalFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyEvaluation {
    pub issue: Option<TopologyIssue>,
    /// Ids of the desired managed displays present in the snapshot, ascending.
    pub managed_display_ids: Vec<u32>,
    /// No physical fallback exists while two or more managed displays are
    /// desired. Acting on this is left to the caller.
    pub force_normalization: bool,
}

impl TopologyEvaluation {
    pub fn is_healthy(&self) -> bool {
        self.issue.is_none()
    }
}

/// Classifies a snapshot against the set of serials that should be showing.
pub fn evaluate(snapshot: &TopologySnapshot, desired_serials: &BTreeSet<u32>) -> TopologyEvaluation {
    let managed: Vec<&DisplayInfo> = snapshot
        .displays
        .iter()
        .filter(|d| d.is_managed_virtual_device && desired_serials.contains(&d.serial_number))
        .collect();
    let mut managed_display_ids: Vec<u32> = managed.iter().map(|d| d.id).collect();
    managed_display_ids.sort_unstable();

    let has_physical = snapshot.has_physical_fallback();
    let force_normalization = !has_physical && desired_serials.len() >= 2;

    let issue = if managed.len() >= 2 && shares_mirror_root(snapshot, &managed) {
        Some(TopologyIssue::ManagedDisplaysCollapsedIntoSingleMirrorSet)
    } else if managed.len() >= 2 && has_identical_bounds(&managed) {
        Some(TopologyIssue::ManagedDisplaysOverlappingInExtendedSpace)
    } else if !managed.is_empty()
        && !has_physical
        && !managed_display_ids.contains(&snapshot.main_display_id)
    {
        Some(TopologyIssue::MainDisplayOutsideManagedSetWithoutPhysicalFallback)
    } else {
        None
    };

    TopologyEvaluation {
        issue,
        managed_display_ids,
        force_normalization,
    }
}

/// Follows `mirror_master_id` links to the root of the mirror set.
fn mirror_root(snapshot: &TopologySnapshot, id: u32) -> u32 {
    let masters: HashMap<u32, Option<u32>> = snapshot
        .displays
        .iter()
        .map(|d| (d.id, d.mirror_master_id))
        .collect();
    let mut path = vec![id];
    let mut current = id;
    while let Some(master) = masters.get(&current).copied().flatten() {
        if master == current {
            break;
        }
        // A cycle is one mirror set; every member reports its lowest id.
        if let Some(start) = path.iter().position(|&seen| seen == master) {
            return path[start..].iter().copied().min().unwrap_or(master);
        }
        path.push(master);
        current = master;
    }
    current
}

fn shares_mirror_root(snapshot: &TopologySnapshot, managed: &[&DisplayInfo]) -> bool {
    let mut roots = BTreeSet::new();
    managed
        .iter()
        .any(|d| !roots.insert(mirror_root(snapshot, d.id)))
}

fn has_identical_bounds(managed: &[&DisplayInfo]) -> bool {
    let mut seen = BTreeSet::new();
    managed
        .iter()
        .any(|d| !seen.insert((d.bounds.x, d.bounds.y, d.bounds.width, d.bounds.height)))
}

/// Picks the display to keep as main while repairing.
///
/// Preference order: the caller's preferred display, then the current main
/// display, then the top-left-most managed display (by x, then y, then id).
/// The first two only qualify when managed and viable.
pub fn select_anchor(
    snapshot: &TopologySnapshot,
    managed_ids: &[u32],
    preferred_main_id: Option<u32>,
) -> Option<u32> {
    let qualifies = |id: u32| {
        managed_ids.contains(&id) && snapshot.display(id).is_some_and(DisplayInfo::is_viable)
    };

    if let Some(preferred) = preferred_main_id.filter(|id| qualifies(*id)) {
        return Some(preferred);
    }
    if qualifies(snapshot.main_display_id) {
        return Some(snapshot.main_display_id);
    }

    let candidates = snapshot
        .displays
        .iter()
        .filter(|d| managed_ids.contains(&d.id));
    let top_left = |d: &&DisplayInfo| (d.bounds.x, d.bounds.y, d.id);
    candidates
        .clone()
        .filter(|d| d.is_viable())
        .min_by_key(top_left)
        .or_else(|| candidates.min_by_key(top_left))
        .map(|d| d.id)
}
