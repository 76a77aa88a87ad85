//! Group topology and pipeline chain resolution.
//!
//! Each instance binds logical groups to hardware slots and links them
//! parent → child. An OTF link streams pixels directly, so the child is part
//! of the parent's chain; a DMA link goes through memory and starts a new
//! chain. Resolving any group yields its chain: the head slot (the leader)
//! followed by its OTF descendants, root to leaf.

use crate::bitset::IdSet;
use crate::error::ScheduleError;
use crate::hw::{HwIpId, HwIpSet, MAX_INSTANCES};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Logical pipeline groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum GroupId {
    Paf0,
    Paf1,
    Taa0,
    Taa1,
    Isp0,
    Isp1,
    Mcs0,
    Mcs1,
    Vra,
}

impl GroupId {
    /// Slot a group runs on.
    #[must_use]
    pub fn hw_ip(self) -> HwIpId {
        match self {
            GroupId::Paf0 => HwIpId::Paf0,
            GroupId::Paf1 => HwIpId::Paf1,
            GroupId::Taa0 => HwIpId::Taa0,
            GroupId::Taa1 => HwIpId::Taa1,
            GroupId::Isp0 => HwIpId::Isp0,
            GroupId::Isp1 => HwIpId::Isp1,
            GroupId::Mcs0 => HwIpId::Mcsc0,
            GroupId::Mcs1 => HwIpId::Mcsc1,
            GroupId::Vra => HwIpId::Vra,
        }
    }
}

/// How a child group receives its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Link {
    /// Direct block-to-block streaming
    Otf,
    /// Through memory
    Dma,
}

/// Streaming state shared by every resolution of one chain.
#[derive(Debug, Default)]
pub struct ChainRuntime {
    otf_started: AtomicBool,
}

#[derive(Debug)]
struct GroupNode {
    otf_input: bool,
    parent: Option<(GroupId, Link)>,
    runtime: Arc<ChainRuntime>,
}

/// A resolved chain.
#[derive(Debug, Clone)]
pub struct Chain {
    /// Stream instance
    pub instance: u32,
    /// Head group
    pub head: GroupId,
    /// Slot driving shot/done bookkeeping
    pub leader: HwIpId,
    /// Slots root to leaf
    pub slots: Vec<HwIpId>,
    /// Head takes OTF input (sensor or parent block)
    pub otf_input: bool,
    runtime: Arc<ChainRuntime>,
}

impl Chain {
    /// Submission order: deepest child first.
    pub fn submit_order(&self) -> impl Iterator<Item = HwIpId> + '_ {
        self.slots.iter().rev().copied()
    }

    /// Teardown order: root first.
    pub fn teardown_order(&self) -> impl Iterator<Item = HwIpId> + '_ {
        self.slots.iter().copied()
    }

    /// Slots as a set.
    #[must_use]
    pub fn hw_set(&self) -> HwIpSet {
        self.slots.iter().copied().collect()
    }

    /// Whether `slot` leads this chain.
    #[must_use]
    pub fn is_leader(&self, slot: HwIpId) -> bool {
        self.leader == slot
    }

    /// First OTF start already happened.
    #[must_use]
    pub fn otf_started(&self) -> bool {
        self.runtime.otf_started.load(Ordering::Acquire)
    }

    /// Mark streaming started; returns `true` for the first caller only.
    pub(crate) fn mark_otf_started(&self) -> bool {
        !self.runtime.otf_started.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn reset_otf(&self) {
        self.runtime.otf_started.store(false, Ordering::Release);
    }
}

/// Maps groups to chains per instance.
#[derive(Debug, Default)]
pub struct ChainResolver {
    topology: RwLock<HashMap<u32, HashMap<GroupId, GroupNode>>>,
}

impl ChainResolver {
    /// Empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check_instance(instance: u32) -> Result<(), ScheduleError> {
        if instance as usize >= MAX_INSTANCES {
            return Err(ScheduleError::InvalidInstance {
                instance,
                max: MAX_INSTANCES as u32,
            });
        }
        Ok(())
    }

    /// Bind `group` for `instance`. `otf_input` marks a head fed directly
    /// by the sensor. Rebinding keeps existing links.
    pub fn bind(&self, instance: u32, group: GroupId, otf_input: bool) -> Result<(), ScheduleError> {
        Self::check_instance(instance)?;
        let mut topo = self.topology.write();
        let groups = topo.entry(instance).or_default();
        groups
            .entry(group)
            .and_modify(|n| n.otf_input = otf_input)
            .or_insert_with(|| GroupNode {
                otf_input,
                parent: None,
                runtime: Arc::default(),
            });
        Ok(())
    }

    /// Link `child` under `parent`.
    pub fn link(
        &self,
        instance: u32,
        parent: GroupId,
        child: GroupId,
        link: Link,
    ) -> Result<(), ScheduleError> {
        Self::check_instance(instance)?;
        let mut topo = self.topology.write();
        let groups = topo
            .get_mut(&instance)
            .ok_or(ScheduleError::InvalidGroup { instance, group: parent })?;
        if !groups.contains_key(&parent) {
            return Err(ScheduleError::InvalidGroup { instance, group: parent });
        }
        let node = groups
            .get_mut(&child)
            .ok_or(ScheduleError::InvalidGroup { instance, group: child })?;
        node.parent = Some((parent, link));
        if link == Link::Otf {
            node.otf_input = true;
        }
        Ok(())
    }

    /// Remove `group`; its children become heads.
    pub fn unbind(&self, instance: u32, group: GroupId) {
        let mut topo = self.topology.write();
        if let Some(groups) = topo.get_mut(&instance) {
            groups.remove(&group);
            for node in groups.values_mut() {
                if matches!(node.parent, Some((p, _)) if p == group) {
                    node.parent = None;
                }
            }
        }
    }

    /// Whether `group` is bound for `instance`.
    #[must_use]
    pub fn is_bound(&self, instance: u32, group: GroupId) -> bool {
        self.topology
            .read()
            .get(&instance)
            .is_some_and(|g| g.contains_key(&group))
    }

    /// Chain containing `group`.
    pub fn resolve(&self, instance: u32, group: GroupId) -> Result<Chain, ScheduleError> {
        Self::check_instance(instance)?;
        let topo = self.topology.read();
        let groups = topo
            .get(&instance)
            .ok_or(ScheduleError::InvalidGroup { instance, group })?;
        if !groups.contains_key(&group) {
            return Err(ScheduleError::InvalidGroup { instance, group });
        }

        let mut head = group;
        let mut hops = 0;
        while let Some((parent, Link::Otf)) = groups.get(&head).and_then(|n| n.parent) {
            head = parent;
            hops += 1;
            if hops > groups.len() {
                return Err(ScheduleError::InvalidGroup { instance, group });
            }
        }

        let mut order = vec![head];
        let mut seen: IdSet<HwIpId> = IdSet::new();
        seen.insert(head.hw_ip());
        let mut cursor = 0;
        while cursor < order.len() {
            let parent = order[cursor];
            let mut children: Vec<GroupId> = groups
                .iter()
                .filter(|(_, n)| matches!(n.parent, Some((p, Link::Otf)) if p == parent))
                .map(|(g, _)| *g)
                .collect();
            children.sort_by_key(|g| g.hw_ip());
            for child in children {
                if seen.insert(child.hw_ip()) {
                    order.push(child);
                }
            }
            cursor += 1;
        }

        let node = &groups[&head];
        Ok(Chain {
            instance,
            head,
            leader: head.hw_ip(),
            slots: order.iter().map(|g| g.hw_ip()).collect(),
            otf_input: node.otf_input,
            runtime: Arc::clone(&node.runtime),
        })
    }

    /// Chain that `slot` belongs to on `instance`.
    pub fn chain_of_slot(&self, instance: u32, slot: HwIpId) -> Option<Chain> {
        let group = {
            let topo = self.topology.read();
            topo.get(&instance)?
                .keys()
                .copied()
                .find(|g| g.hw_ip() == slot)?
        };
        self.resolve(instance, group).ok()
    }

    /// Heads of every chain bound for `instance`.
    #[must_use]
    pub fn heads(&self, instance: u32) -> Vec<GroupId> {
        let topo = self.topology.read();
        let mut heads: Vec<GroupId> = topo
            .get(&instance)
            .map(|groups| {
                groups
                    .iter()
                    .filter(|(_, n)| !matches!(n.parent, Some((_, Link::Otf))))
                    .map(|(g, _)| *g)
                    .collect()
            })
            .unwrap_or_default();
        heads.sort_by_key(|g| g.hw_ip());
        heads
    }
}
