// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Archetype repository
//!
//! Every distinct component set maps to one [`Node`], keyed by a canonical
//! hash, and each node lazily owns one [`DataComposition`]. Single-type nodes
//! link to every multi-type node containing their type, which turns a
//! multi-type lookup into an intersection of link maps.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

#[cfg(feature = "profiling")]
use tracing::debug;

use crate::class_index::ClassIndex;
use crate::component::{Bundle, ComponentInfo, MAX_BUNDLE_COMPONENTS};
use crate::composition::DataComposition;
use crate::config::EngineConfig;
use crate::entity::EntityRecord;
use crate::error::{EcsError, Result};
use crate::pool::ChunkedPool;
use crate::sparse::SparseIntMap;

/// Key of the empty component set
pub const ROOT_KEY: u64 = 0;

/// Tags keys of sets with two or more types so they never alias a class index
pub const MULTI_TYPE_FLAG: u64 = 1 << 63;

/// Graph node of one component set
pub struct Node {
    key: u64,
    types: SparseIntMap<ComponentInfo>,
    links: RwLock<FxHashMap<u64, Arc<Node>>>,
    composition: RwLock<Option<Arc<DataComposition>>>,
}

impl Node {
    fn new(key: u64, types: SparseIntMap<ComponentInfo>) -> Self {
        Self {
            key,
            types,
            links: RwLock::new(FxHashMap::default()),
            composition: RwLock::new(None),
        }
    }

    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Component types keyed by class index
    pub fn types(&self) -> &SparseIntMap<ComponentInfo> {
        &self.types
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    fn has_types(&self, types: &SparseIntMap<ComponentInfo>) -> bool {
        self.types.len() == types.len()
            && types.keys().iter().all(|&index| self.types.contains_key(index))
    }

    /// Record a multi-type node containing this node's type
    pub fn link_node(&self, node: Arc<Node>) {
        self.links.write().insert(node.key, node);
    }

    pub fn is_linked(&self, key: u64) -> bool {
        self.links.read().contains_key(&key)
    }

    pub fn linked_nodes(&self) -> Vec<Arc<Node>> {
        self.links.read().values().cloned().collect()
    }

    pub fn linked_count(&self) -> usize {
        self.links.read().len()
    }

    /// Composition if already materialized
    pub fn composition(&self) -> Option<Arc<DataComposition>> {
        self.composition.read().clone()
    }

    /// Materialize the node's composition at most once
    pub fn get_or_create_composition(
        &self,
        class_index: &Arc<ClassIndex>,
        pool: &Arc<ChunkedPool<EntityRecord>>,
    ) -> Result<Arc<DataComposition>> {
        if let Some(composition) = self.composition.read().as_ref() {
            return Ok(Arc::clone(composition));
        }
        let mut slot = self.composition.write();
        if let Some(composition) = slot.as_ref() {
            return Ok(Arc::clone(composition));
        }
        let composition = Arc::new(DataComposition::new(
            self.key,
            Arc::clone(class_index),
            pool,
            &self.types,
        )?);

        #[cfg(feature = "profiling")]
        debug!(
            key = self.key,
            types = self.types.len(),
            "composition created"
        );

        *slot = Some(Arc::clone(&composition));
        Ok(composition)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("types", &self.types.values())
            .field("links", &self.linked_count())
            .finish()
    }
}

/// Key -> node map with double-checked insertion
#[derive(Default)]
pub struct NodeCache {
    nodes: RwLock<FxHashMap<u64, Arc<Node>>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: u64) -> Option<Arc<Node>> {
        self.nodes.read().get(&key).cloned()
    }

    /// Node under `key` if it exists; a node with other types is a collision
    fn get_checked(
        &self,
        key: u64,
        types: &SparseIntMap<ComponentInfo>,
    ) -> Result<Option<Arc<Node>>> {
        match self.nodes.read().get(&key) {
            Some(node) => check(node, key, types).map(Some),
            None => Ok(None),
        }
    }

    /// Fetch or insert the node for `key`.
    ///
    /// `on_insert` runs under the exclusive lock, before any other thread
    /// can see the new node.
    fn get_or_insert_with(
        &self,
        key: u64,
        types: &SparseIntMap<ComponentInfo>,
        on_insert: impl FnOnce(&Arc<Node>),
    ) -> Result<Arc<Node>> {
        if let Some(node) = self.get_checked(key, types)? {
            return Ok(node);
        }
        let nodes = self.nodes.upgradable_read();
        if let Some(node) = nodes.get(&key) {
            return check(node, key, types);
        }
        let mut nodes = RwLockUpgradableReadGuard::upgrade(nodes);
        let node = Arc::new(Node::new(key, types.clone()));
        on_insert(&node);
        nodes.insert(key, Arc::clone(&node));
        Ok(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().values().cloned().collect()
    }
}

fn check(node: &Arc<Node>, key: u64, types: &SparseIntMap<ComponentInfo>) -> Result<Arc<Node>> {
    if node.has_types(types) {
        Ok(Arc::clone(node))
    } else {
        Err(EcsError::ArchetypeHashCollision { key })
    }
}

/// Canonical component-set -> composition resolver
pub struct CompositionRepository {
    class_index: Arc<ClassIndex>,
    pool: Arc<ChunkedPool<EntityRecord>>,
    root: Arc<Node>,
    nodes: NodeCache,
}

impl CompositionRepository {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            class_index: Arc::new(config.class_index()?),
            pool: Arc::new(ChunkedPool::new(config.id_schema()?)),
            root: Arc::new(Node::new(ROOT_KEY, SparseIntMap::new())),
            nodes: NodeCache::new(),
        })
    }

    pub fn class_index(&self) -> &Arc<ClassIndex> {
        &self.class_index
    }

    pub fn pool(&self) -> &Arc<ChunkedPool<EntityRecord>> {
        &self.pool
    }

    /// Node of the empty component set
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Number of non-root nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Canonical key and type map of a component set
    fn key_of(&self, infos: &[ComponentInfo]) -> Result<(u64, SparseIntMap<ComponentInfo>)> {
        let mut types = SparseIntMap::with_capacity(self.class_index.size() as usize + 1);
        if let [info] = infos {
            let index = self.class_index.get_index_or_add_class(info)?;
            types.put(index, *info);
            return Ok((index as u64, types));
        }

        let key = self.class_index.long_hash_code(infos)? | MULTI_TYPE_FLAG;
        for info in infos {
            let index = self.class_index.get_index_or_add_class(info)?;
            if types.put(index, *info).is_some() {
                return Err(EcsError::DuplicateComponentType(info.name()));
            }
        }
        Ok((key, types))
    }

    /// Node for a component set in any order, created on first use
    pub fn get_or_create_node(&self, infos: &[ComponentInfo]) -> Result<Arc<Node>> {
        if infos.is_empty() {
            return Ok(Arc::clone(&self.root));
        }
        let (key, types) = self.key_of(infos)?;
        if types.len() == 1 {
            return self.nodes.get_or_insert_with(key, &types, |_| {});
        }
        if let Some(node) = self.nodes.get_checked(key, &types)? {
            return Ok(node);
        }

        let singles = types
            .iter()
            .map(|(index, info)| self.single_node(index, *info))
            .collect::<Result<SmallVec<[Arc<Node>; MAX_BUNDLE_COMPONENTS]>>>()?;
        self.nodes.get_or_insert_with(key, &types, |node| {
            for single in &singles {
                single.link_node(Arc::clone(node));
            }
        })
    }

    fn single_node(&self, index: u32, info: ComponentInfo) -> Result<Arc<Node>> {
        let mut types = SparseIntMap::with_capacity(index as usize + 1);
        types.put(index, info);
        self.nodes.get_or_insert_with(index as u64, &types, |_| {})
    }

    /// Composition for a component set in any order
    pub fn get_or_create(&self, infos: &[ComponentInfo]) -> Result<Arc<DataComposition>> {
        self.get_or_create_node(infos)?
            .get_or_create_composition(&self.class_index, &self.pool)
    }

    pub fn get_or_create_bundle<B: Bundle>(&self) -> Result<Arc<DataComposition>> {
        self.get_or_create(&B::component_infos())
    }

    /// Nodes whose component set contains every type in `type_ids`
    pub fn find(&self, type_ids: &[TypeId]) -> Vec<Arc<Node>> {
        let mut ids: SmallVec<[TypeId; MAX_BUNDLE_COMPONENTS]> = type_ids.into();
        ids.sort_unstable();
        ids.dedup();

        let mut singles: SmallVec<[Arc<Node>; MAX_BUNDLE_COMPONENTS]> = SmallVec::new();
        for type_id in &ids {
            let Some(node) = self
                .class_index
                .get_index(*type_id)
                .and_then(|index| self.nodes.get(index as u64))
            else {
                return Vec::new();
            };
            singles.push(node);
        }

        match singles.len() {
            0 => Vec::new(),
            1 => {
                let single = &singles[0];
                let mut found = vec![Arc::clone(single)];
                found.extend(single.linked_nodes());
                found
            }
            _ => {
                singles.sort_by_key(|node| node.linked_count());
                let (seed, rest) = singles.split_at(1);
                seed[0]
                    .linked_nodes()
                    .into_iter()
                    .filter(|candidate| rest.iter().all(|node| node.is_linked(candidate.key)))
                    .collect()
            }
        }
    }

    /// Materialized compositions containing every type in `type_ids`
    pub fn find_compositions(&self, type_ids: &[TypeId]) -> Vec<Arc<DataComposition>> {
        self.find(type_ids)
            .iter()
            .filter_map(|node| node.composition())
            .collect()
    }

    /// Every materialized composition, root included
    pub fn compositions(&self) -> Vec<Arc<DataComposition>> {
        self.root
            .composition()
            .into_iter()
            .chain(self.nodes.nodes().iter().filter_map(|node| node.composition()))
            .collect()
    }
}
