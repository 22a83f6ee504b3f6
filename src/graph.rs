//! The referral graph seen from one referrer.
//!
//! Profiles point at their referrer through `referred_by`, which makes the
//! graph a forest. [`ReferralForest`] keeps the subtree rooted at one user in
//! an arena indexed by profile id, so levels can be walked breadth-first
//! without chasing references.

use std::collections::{HashMap, VecDeque};

use crate::error::AggregationError;
use crate::types::{ReferredProfile, UserId};

#[derive(Debug)]
struct Node {
    /// `None` for the root, which has no profile row of its own here.
    referred: Option<ReferredProfile>,
    children: Vec<usize>,
    depth: u8,
}

/// Arena of referred profiles below a root user.
#[derive(Debug)]
pub struct ReferralForest {
    nodes: Vec<Node>,
    index: HashMap<UserId, usize>,
}

impl ReferralForest {
    pub fn new(root: UserId) -> Self {
        let mut index = HashMap::new();
        index.insert(root, 0);
        Self {
            nodes: vec![Node {
                referred: None,
                children: Vec::new(),
                depth: 0,
            }],
            index,
        }
    }

    /// Number of referred profiles, excluding the root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.index.contains_key(&id)
    }

    /// Depth of `id` below the root, if it is in the forest.
    pub fn depth_of(&self, id: UserId) -> Option<u8> {
        self.index.get(&id).map(|&i| self.nodes[i].depth)
    }

    /// Adds `referred` under its referrer.
    ///
    /// Returns `Ok(false)` when the profile is already present, which is how
    /// a cycle in `referred_by` shows up. A row whose referrer is not in the
    /// forest is malformed.
    pub fn attach(&mut self, referred: ReferredProfile) -> Result<bool, AggregationError> {
        let id = referred.profile.id;
        if self.index.contains_key(&id) {
            return Ok(false);
        }
        let parent_id = referred.profile.referred_by.ok_or_else(|| {
            AggregationError::Malformed(format!("profile {id} has no referrer"))
        })?;
        let parent = *self.index.get(&parent_id).ok_or_else(|| {
            AggregationError::Malformed(format!(
                "profile {id} is referred by {parent_id}, which was not requested"
            ))
        })?;

        let depth = self.nodes[parent].depth.saturating_add(1);
        let slot = self.nodes.len();
        self.nodes.push(Node {
            referred: Some(referred),
            children: Vec::new(),
            depth,
        });
        self.nodes[parent].children.push(slot);
        self.index.insert(id, slot);
        Ok(true)
    }

    /// Profiles exactly `level` hops below the root, in breadth-first order.
    pub fn referrals_at_level(&self, level: u8) -> Vec<&ReferredProfile> {
        if level == 0 {
            return Vec::new();
        }
        let mut found = Vec::new();
        let mut queue = VecDeque::from([0usize]);
        while let Some(i) = queue.pop_front() {
            let node = &self.nodes[i];
            if node.depth == level {
                if let Some(referred) = &node.referred {
                    found.push(referred);
                }
                continue;
            }
            queue.extend(node.children.iter().copied());
        }
        found
    }

    /// Every referred profile with its level, level by level.
    pub fn levels(&self) -> impl Iterator<Item = (u8, &ReferredProfile)> {
        let mut queue = VecDeque::from([0usize]);
        std::iter::from_fn(move || {
            while let Some(i) = queue.pop_front() {
                let node = &self.nodes[i];
                queue.extend(node.children.iter().copied());
                if let Some(referred) = &node.referred {
                    return Some((node.depth, referred));
                }
            }
            None
        })
    }
}
