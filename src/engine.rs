//! Filter/query surface consumed by the render layer.
//!
//! The engine owns the deal set, the active filter and the current cluster
//! index. The index is rebuilt lazily, only when the filtered point set may
//! have changed, and swapped in whole. Viewport results are memoized on the
//! viewport and the index version.

use std::sync::Arc;

use crate::cluster::{ClusterId, ClusterIndex, ClusterOptions};
use crate::deal::Deal;
use crate::error::{FilterError, IndexError};
use crate::filter::{FilterFacets, FilterState};
use crate::view_state::ViewState;
use crate::viewport::{self, Viewport, VisibleSet};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Deals in the feed.
    pub total: usize,
    /// Deals passing the filter.
    pub passing: usize,
    /// Passing deals with missing or out-of-range coordinates.
    pub unlocated: usize,
    /// Passing deals left off the map for a non-finite price or score.
    pub invalid: usize,
    /// Bumped on every index rebuild.
    pub index_version: u64,
}

pub struct MapEngine {
    options: ClusterOptions,
    deals: Vec<Arc<Deal>>,
    filter: FilterState,
    index: Arc<ClusterIndex>,
    index_version: u64,
    dirty: bool,
    passing: usize,
    memo: Option<(Viewport, u64, VisibleSet)>,
}

impl MapEngine {
    pub fn new(options: ClusterOptions) -> Result<Self, IndexError> {
        let index = ClusterIndex::build(Vec::new(), options)?;
        Ok(Self {
            options,
            deals: Vec::new(),
            filter: FilterState::default(),
            index: Arc::new(index),
            index_version: 0,
            dirty: false,
            passing: 0,
            memo: None,
        })
    }

    /// Replaces the deal feed. The index is rebuilt on the next query.
    pub fn set_deals(&mut self, deals: Vec<Arc<Deal>>) {
        self.deals = deals;
        self.dirty = true;
    }

    /// Replaces the filter. Several calls between two queries cost a single
    /// rebuild, with the last state winning; an unchanged state costs none.
    /// Returns the inconsistencies that make some dimension match nothing.
    pub fn set_filter_state(&mut self, state: FilterState) -> Vec<FilterError> {
        let problems = state.validate();
        for problem in &problems {
            tracing::warn!(%problem, "filter dimension matches nothing");
        }
        if state != self.filter {
            self.filter = state;
            self.dirty = true;
        }
        problems
    }

    pub fn filter_state(&self) -> &FilterState {
        &self.filter
    }

    pub fn facets(&self) -> FilterFacets {
        FilterFacets::from_deals(self.deals.iter().map(|d| &**d))
    }

    /// Rebuilds the index if the filter or the feed changed since the last
    /// build. The new index replaces the old one only once complete.
    pub fn refresh(&mut self) -> Result<(), IndexError> {
        if !self.dirty {
            return Ok(());
        }
        let predicate = self.filter.compose();
        let passing: Vec<Arc<Deal>> = self.deals.iter().filter(|d| predicate(d)).cloned().collect();
        let index = ClusterIndex::build(passing.iter().cloned(), self.options)?;
        self.passing = passing.len();
        self.index = Arc::new(index);
        self.index_version += 1;
        self.dirty = false;
        self.memo = None;
        tracing::debug!(version = self.index_version, passing = self.passing, "index swapped");
        Ok(())
    }

    /// Current index, rebuilt first if needed.
    pub fn index(&mut self) -> Result<Arc<ClusterIndex>, IndexError> {
        self.refresh()?;
        Ok(Arc::clone(&self.index))
    }

    pub fn on_viewport_change(&mut self, viewport: Viewport) -> Result<VisibleSet, IndexError> {
        self.refresh()?;
        if let Some((memo_view, version, visible)) = &self.memo {
            if *memo_view == viewport && *version == self.index_version {
                tracing::trace!("viewport memo hit");
                return Ok(visible.clone());
            }
        }
        let visible = viewport::evaluate(&viewport, &self.index);
        self.memo = Some((viewport, self.index_version, visible.clone()));
        Ok(visible)
    }

    /// Target view for a cluster click.
    pub fn on_cluster_click(&mut self, id: ClusterId) -> Result<ViewState, IndexError> {
        self.refresh()?;
        viewport::expansion_target(&self.index, id)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            total: self.deals.len(),
            passing: self.passing,
            unlocated: self.index.unlocated(),
            invalid: self.index.invalid(),
            index_version: self.index_version,
        }
    }
}
