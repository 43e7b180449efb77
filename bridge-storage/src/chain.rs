//! Tier chain policy.
//!
//! The ordered list of tiers with their descriptors. Built and validated
//! once at startup and shared read-only afterwards.

use std::sync::Arc;

use bridge_core::{
    validate_descriptors, ConfigError, TierDescriptor, TierKind, WriteMode,
};

use crate::tier::TierAdapter;

/// One configured tier: its policy plus the adapter that serves it.
#[derive(Clone)]
pub struct Tier {
    descriptor: TierDescriptor,
    adapter: Arc<dyn TierAdapter>,
}

impl Tier {
    pub fn new(descriptor: TierDescriptor, adapter: Arc<dyn TierAdapter>) -> Self {
        Self {
            descriptor,
            adapter,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &TierDescriptor {
        &self.descriptor
    }

    pub fn adapter(&self) -> &Arc<dyn TierAdapter> {
        &self.adapter
    }
}

impl std::fmt::Debug for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tier")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Immutable, validated tier chain.
#[derive(Debug, Clone)]
pub struct TierChain {
    tiers: Vec<Tier>,
    store_index: usize,
}

impl TierChain {
    pub fn builder() -> TierChainBuilder {
        TierChainBuilder::default()
    }

    /// Tiers in consultation order.
    pub fn ordered_tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// The system of record.
    pub fn store_tier(&self) -> &Tier {
        &self.tiers[self.store_index]
    }

    pub fn store_index(&self) -> usize {
        self.store_index
    }

    pub fn tier(&self, index: usize) -> Option<&Tier> {
        self.tiers.get(index)
    }

    pub fn find(&self, name: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.name() == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.tiers.iter().position(|t| t.name() == name)
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Tiers up to and including the store that serve reads.
    pub fn read_path(&self) -> impl Iterator<Item = (usize, &Tier)> {
        self.tiers[..=self.store_index]
            .iter()
            .enumerate()
            .filter(|(_, t)| t.descriptor.reads_through())
    }

    /// Read-only tiers after the store, consulted only when the store fails.
    pub fn fallbacks(&self) -> impl Iterator<Item = (usize, &Tier)> {
        self.tiers
            .iter()
            .enumerate()
            .skip(self.store_index + 1)
            .filter(|(_, t)| t.descriptor.reads_through())
    }

    /// Cache tiers ahead of the store that accept writes, fastest first.
    pub fn writable_caches(&self) -> impl Iterator<Item = (usize, &Tier)> {
        self.tiers[..self.store_index]
            .iter()
            .enumerate()
            .filter(|(_, t)| t.descriptor.accepts_writes())
    }

    /// In-process tiers, evicted when a peer invalidates a key.
    pub fn local_tiers(&self) -> impl Iterator<Item = (usize, &Tier)> {
        self.tiers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.descriptor.kind == TierKind::LocalCache)
    }

    pub fn has_write_back(&self) -> bool {
        self.tiers
            .iter()
            .any(|t| t.descriptor.write_mode == WriteMode::Back)
    }

    pub fn has_kind(&self, kind: TierKind) -> bool {
        self.tiers.iter().any(|t| t.descriptor.kind == kind)
    }
}

#[derive(Default)]
pub struct TierChainBuilder {
    tiers: Vec<Tier>,
    write_back_enabled: bool,
}

impl TierChainBuilder {
    pub fn tier(mut self, descriptor: TierDescriptor, adapter: Arc<dyn TierAdapter>) -> Self {
        self.tiers.push(Tier::new(descriptor, adapter));
        self
    }

    /// Opt in to tiers configured with [`WriteMode::Back`].
    pub fn write_back_enabled(mut self, enabled: bool) -> Self {
        self.write_back_enabled = enabled;
        self
    }

    pub fn build(mut self) -> Result<TierChain, ConfigError> {
        let descriptors: Vec<TierDescriptor> =
            self.tiers.iter().map(|t| t.descriptor.clone()).collect();
        validate_descriptors(&descriptors, self.write_back_enabled)?;

        for tier in &self.tiers {
            let actual = tier.adapter.kind();
            if actual != tier.descriptor.kind {
                return Err(ConfigError::IncompatibleOptions {
                    option_a: format!("tiers.{}.kind={}", tier.name(), tier.descriptor.kind),
                    option_b: format!("adapter kind {}", actual),
                });
            }
        }

        self.tiers.sort_by_key(|t| t.descriptor.order);
        let store_index = self
            .tiers
            .iter()
            .position(|t| t.descriptor.is_store())
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "tiers[role=store]".to_string(),
            })?;

        tracing::debug!(
            tiers = ?self.tiers.iter().map(|t| t.name().to_string()).collect::<Vec<_>>(),
            store = self.tiers[store_index].name(),
            "Built tier chain"
        );

        Ok(TierChain {
            tiers: self.tiers,
            store_index,
        })
    }
}
