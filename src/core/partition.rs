//! Element arena.
//!
//! A partition owns a contiguous element space shared by all of its nodes:
//! every live node occupies a block of `max(#gates, #slots)` consecutive
//! elements, and the link matrix is square over this space. All per-node
//! and per-element state lives in flat parallel arrays so the step
//! operators can run over them without chasing pointers.
//!
//! Indices are never handed out twice while alive: node index 0 and
//! nodespace index 0 are reserved as "free" markers, the root nodespace is
//! index 1 and exists from construction.

use std::collections::BTreeSet;
use std::io::{self, Read, Write};

use hashbrown::HashMap;

use crate::error::{NetError, NetResult};
use crate::ids;
use crate::matrix::{try_grow, WeightMatrix};
use crate::nodetype::{GateFunction, GateOverride, GateSpec, TypeCatalog, ACTIVATOR, GEN};
use crate::storage;

/// Index of the root nodespace in every partition.
pub const ROOT_NODESPACE: usize = 1;

/// Number of activator-controllable gate positions (por..exp).
const ACTIVATOR_POSITIONS: usize = 6;

/// A fully resolved link, as returned by the enumeration queries.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRecord {
    pub source_node: usize,
    pub source_gate: String,
    pub target_node: usize,
    pub target_slot: String,
    pub weight: f32,
}

/// Optional knobs for node creation.
#[derive(Debug, Default)]
pub struct NodeInit<'a> {
    /// Claim this exact index instead of the allocator's choice.
    pub requested_index: Option<usize>,
    /// Per-gate spec overrides, keyed by gate name.
    pub gate_overrides: Option<&'a HashMap<String, GateOverride>>,
    /// Per-gate transfer functions, keyed by gate name.
    pub gate_functions: Option<&'a HashMap<String, GateFunction>>,
    /// Wait countdown; defaults to the type's `wait` parameter default.
    pub wait: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Partition {
    pid: u16,
    sparse: bool,

    // Node bookkeeping; index 0 is reserved, type tag 0 marks a free index.
    pub(crate) node_types: Vec<u16>,
    pub(crate) node_parents: Vec<usize>,
    pub(crate) node_offsets: Vec<usize>,
    pub(crate) node_element_counts: Vec<u16>,
    pub(crate) n_wait: Vec<u16>,
    pub(crate) n_countdown: Vec<u16>,

    // Element space. `a` is the activation vector, `a_in` the propagation
    // scratch (ephemeral; not persisted).
    pub(crate) elements_to_nodes: Vec<usize>,
    pub(crate) a: Vec<f32>,
    pub(crate) a_in: Vec<f32>,
    pub(crate) g_function: Vec<GateFunction>,
    pub(crate) g_threshold: Vec<f32>,
    pub(crate) g_min: Vec<f32>,
    pub(crate) g_max: Vec<f32>,
    pub(crate) g_amplification: Vec<f32>,
    pub(crate) g_spread: Vec<bool>,

    // Nodespaces; parent 0 marks a free index, the root is always alive.
    pub(crate) nodespace_parents: Vec<usize>,
    /// `activators[p][ns]` = activator node for gate position `p + 1`.
    pub(crate) activators: [Vec<usize>; ACTIVATOR_POSITIONS],

    pub(crate) w: WeightMatrix,

    /// Staged world input per sensor node, re-asserted every calculate pass.
    pub(crate) sensor_values: HashMap<usize, f32>,
    /// nodespace -> group name -> ordered element list.
    pub(crate) groups: HashMap<usize, HashMap<String, Vec<usize>>>,

    free_node_ids: BTreeSet<usize>,
    free_nodespace_ids: BTreeSet<usize>,
    /// Reusable element holes as `(offset, len)`, sorted by offset.
    free_blocks: Vec<(usize, usize)>,
    next_node_id: usize,
    next_nodespace_id: usize,
    next_element: usize,
    live_nodes: usize,
}

impl Partition {
    pub fn new(
        pid: u16,
        sparse: bool,
        initial_nodes: usize,
        average_elements_per_node: usize,
        initial_nodespaces: usize,
    ) -> NetResult<Self> {
        let node_capacity = initial_nodes.max(1) + 1;
        let element_capacity = (initial_nodes.max(1) * average_elements_per_node.max(1)).max(1);
        let nodespace_capacity = initial_nodespaces.max(1) + 1;

        let mut partition = Self {
            pid,
            sparse,
            node_types: Vec::new(),
            node_parents: Vec::new(),
            node_offsets: Vec::new(),
            node_element_counts: Vec::new(),
            n_wait: Vec::new(),
            n_countdown: Vec::new(),
            elements_to_nodes: Vec::new(),
            a: Vec::new(),
            a_in: Vec::new(),
            g_function: Vec::new(),
            g_threshold: Vec::new(),
            g_min: Vec::new(),
            g_max: Vec::new(),
            g_amplification: Vec::new(),
            g_spread: Vec::new(),
            nodespace_parents: Vec::new(),
            activators: Default::default(),
            w: WeightMatrix::new(0, sparse)?,
            sensor_values: HashMap::new(),
            groups: HashMap::new(),
            free_node_ids: BTreeSet::new(),
            free_nodespace_ids: BTreeSet::new(),
            free_blocks: Vec::new(),
            next_node_id: 1,
            next_nodespace_id: ROOT_NODESPACE + 1,
            next_element: 0,
            live_nodes: 0,
        };
        partition.ensure_node_capacity(node_capacity)?;
        partition.ensure_element_capacity(element_capacity)?;
        partition.ensure_nodespace_capacity(nodespace_capacity)?;
        Ok(partition)
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn node_capacity(&self) -> usize {
        self.node_types.len()
    }

    pub fn element_capacity(&self) -> usize {
        self.elements_to_nodes.len()
    }

    pub fn nodespace_capacity(&self) -> usize {
        self.nodespace_parents.len()
    }

    pub fn live_node_count(&self) -> usize {
        self.live_nodes
    }

    pub fn link_count(&self) -> usize {
        self.w.nonzero_count()
    }

    /// High-water mark of the element space.
    pub fn elements_in_use(&self) -> usize {
        self.next_element
    }

    // ---------------------------------------------------------------------
    // Capacity management
    // ---------------------------------------------------------------------

    fn ensure_node_capacity(&mut self, needed: usize) -> NetResult<()> {
        if needed <= self.node_types.len() {
            return Ok(());
        }
        let target = needed.max(self.node_types.len() + self.node_types.len() / 2);
        try_grow(&mut self.node_types, target, 0)?;
        try_grow(&mut self.node_parents, target, 0)?;
        try_grow(&mut self.node_offsets, target, 0)?;
        try_grow(&mut self.node_element_counts, target, 0)?;
        try_grow(&mut self.n_wait, target, 0)?;
        try_grow(&mut self.n_countdown, target, 0)?;
        Ok(())
    }

    fn ensure_element_capacity(&mut self, needed: usize) -> NetResult<()> {
        if needed <= self.elements_to_nodes.len() {
            return Ok(());
        }
        let target = needed.max(self.elements_to_nodes.len() + self.elements_to_nodes.len() / 2);
        try_grow(&mut self.elements_to_nodes, target, 0)?;
        try_grow(&mut self.a, target, 0.0)?;
        try_grow(&mut self.a_in, target, 0.0)?;
        try_grow(&mut self.g_function, target, GateFunction::Identity)?;
        let defaults = GateSpec::default();
        try_grow(&mut self.g_threshold, target, defaults.threshold)?;
        try_grow(&mut self.g_min, target, defaults.minimum)?;
        try_grow(&mut self.g_max, target, defaults.maximum)?;
        try_grow(&mut self.g_amplification, target, defaults.amplification)?;
        try_grow(&mut self.g_spread, target, false)?;
        self.w.grow(target)?;
        Ok(())
    }

    fn ensure_nodespace_capacity(&mut self, needed: usize) -> NetResult<()> {
        if needed <= self.nodespace_parents.len() {
            return Ok(());
        }
        let target = needed.max(self.nodespace_parents.len() + self.nodespace_parents.len() / 2);
        try_grow(&mut self.nodespace_parents, target, 0)?;
        for table in &mut self.activators {
            try_grow(table, target, 0)?;
        }
        Ok(())
    }

    /// Pre-grows backing arrays for an expected batch of creations.
    pub fn announce_nodes(
        &mut self,
        node_count: usize,
        average_elements_per_node: usize,
    ) -> NetResult<()> {
        self.ensure_node_capacity(self.next_node_id + node_count)?;
        self.ensure_element_capacity(
            self.next_element + node_count * average_elements_per_node.max(1),
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    fn allocate_node_id(&mut self, requested: Option<usize>) -> NetResult<usize> {
        match requested {
            Some(id) => {
                if id == 0 {
                    return Err(NetError::Identifier("node index 0 is reserved".into()));
                }
                self.ensure_node_capacity(id + 1)?;
                if self.node_types[id] != 0 {
                    return Err(NetError::Identifier(format!(
                        "node {} is already allocated",
                        ids::node_uid(self.pid, id)
                    )));
                }
                if id >= self.next_node_id {
                    for free in self.next_node_id..id {
                        self.free_node_ids.insert(free);
                    }
                    self.next_node_id = id + 1;
                } else {
                    self.free_node_ids.remove(&id);
                }
                Ok(id)
            }
            None => {
                if let Some(id) = self.free_node_ids.pop_first() {
                    return Ok(id);
                }
                let id = self.next_node_id;
                self.ensure_node_capacity(id + 1)?;
                self.next_node_id += 1;
                Ok(id)
            }
        }
    }

    /// First-fit allocation over freed holes, appending at the high-water
    /// mark when nothing fits.
    fn allocate_elements(&mut self, count: usize) -> NetResult<usize> {
        if count == 0 {
            return Ok(0);
        }
        for i in 0..self.free_blocks.len() {
            let (offset, len) = self.free_blocks[i];
            if len >= count {
                if len == count {
                    self.free_blocks.remove(i);
                } else {
                    self.free_blocks[i] = (offset + count, len - count);
                }
                return Ok(offset);
            }
        }
        let offset = self.next_element;
        self.ensure_element_capacity(offset + count)?;
        self.next_element += count;
        Ok(offset)
    }

    fn free_elements(&mut self, offset: usize, count: usize) {
        if count == 0 {
            return;
        }
        let idx = self.free_blocks.partition_point(|&(o, _)| o < offset);
        self.free_blocks.insert(idx, (offset, count));
        if idx + 1 < self.free_blocks.len() {
            let (o1, l1) = self.free_blocks[idx];
            let (o2, l2) = self.free_blocks[idx + 1];
            if o1 + l1 == o2 {
                self.free_blocks[idx] = (o1, l1 + l2);
                self.free_blocks.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (o0, l0) = self.free_blocks[idx - 1];
            let (o1, l1) = self.free_blocks[idx];
            if o0 + l0 == o1 {
                self.free_blocks[idx - 1] = (o0, l0 + l1);
                self.free_blocks.remove(idx);
            }
        }
        if let Some(&(o, l)) = self.free_blocks.last() {
            if o + l == self.next_element {
                self.next_element = o;
                self.free_blocks.pop();
            }
        }
    }

    // ---------------------------------------------------------------------
    // Nodes
    // ---------------------------------------------------------------------

    pub fn is_node(&self, id: usize) -> bool {
        id < self.node_types.len() && self.node_types[id] != 0
    }

    pub fn is_nodespace(&self, id: usize) -> bool {
        id == ROOT_NODESPACE
            || (id < self.nodespace_parents.len() && self.nodespace_parents[id] != 0)
    }

    /// Live node indices, ascending.
    pub fn node_ids(&self) -> Vec<usize> {
        (1..self.next_node_id)
            .filter(|&id| self.node_types[id] != 0)
            .collect()
    }

    /// Live node indices directly inside `nodespace`, ascending.
    pub fn node_ids_in(&self, nodespace: usize) -> Vec<usize> {
        (1..self.next_node_id)
            .filter(|&id| self.node_types[id] != 0 && self.node_parents[id] == nodespace)
            .collect()
    }

    /// Live nodespace indices, ascending, root first.
    pub fn nodespace_ids(&self) -> Vec<usize> {
        (1..self.next_nodespace_id)
            .filter(|&id| self.is_nodespace(id))
            .collect()
    }

    pub fn nodespace_ids_in(&self, parent: usize) -> Vec<usize> {
        (1..self.next_nodespace_id)
            .filter(|&id| id != ROOT_NODESPACE && self.nodespace_parents[id] == parent)
            .collect()
    }

    /// Element index of gate/slot position `pos` of node `id`.
    pub fn element(&self, id: usize, pos: usize) -> usize {
        self.node_offsets[id] + pos
    }

    pub fn create_node(
        &mut self,
        catalog: &TypeCatalog,
        type_tag: u16,
        parent_nodespace: usize,
        init: NodeInit<'_>,
    ) -> NetResult<usize> {
        let nodetype = catalog.get(type_tag).ok_or_else(|| {
            NetError::Configuration(format!("unknown node type tag {type_tag}"))
        })?;
        if !self.is_nodespace(parent_nodespace) {
            return Err(NetError::Identifier(format!(
                "unknown nodespace {}",
                ids::nodespace_uid(self.pid, parent_nodespace)
            )));
        }
        if let Some(overrides) = init.gate_overrides {
            for gate in overrides.keys() {
                if nodetype.gate_index(gate).is_none() {
                    return Err(NetError::Configuration(format!(
                        "type {:?} has no gate {gate:?}",
                        nodetype.name
                    )));
                }
            }
        }
        if let Some(functions) = init.gate_functions {
            for gate in functions.keys() {
                if nodetype.gate_index(gate).is_none() {
                    return Err(NetError::Configuration(format!(
                        "type {:?} has no gate {gate:?}",
                        nodetype.name
                    )));
                }
            }
        }

        let count = nodetype.elements();
        // Reserve element room up front so the id allocation below is the
        // last fallible step.
        self.ensure_element_capacity(self.next_element + count)?;
        let id = self.allocate_node_id(init.requested_index)?;
        let offset = match self.allocate_elements(count) {
            Ok(offset) => offset,
            Err(e) => {
                self.free_node_ids.insert(id);
                return Err(e);
            }
        };

        let wait = init.wait.unwrap_or_else(|| nodetype.default_wait());
        self.node_types[id] = type_tag;
        self.node_parents[id] = parent_nodespace;
        self.node_offsets[id] = offset;
        self.node_element_counts[id] = count as u16;
        self.n_wait[id] = wait;
        self.n_countdown[id] = wait;

        for pos in 0..count {
            let e = offset + pos;
            self.elements_to_nodes[e] = id;
            self.a[e] = 0.0;
            self.a_in[e] = 0.0;
            let mut spec = nodetype
                .gate_defaults
                .get(pos)
                .copied()
                .unwrap_or_default();
            let mut function = GateFunction::Identity;
            if pos < nodetype.gates.len() {
                let gate = &nodetype.gates[pos];
                if let Some(o) = init.gate_overrides.and_then(|m| m.get(gate)) {
                    spec.apply_override(o);
                }
                if let Some(&f) = init.gate_functions.and_then(|m| m.get(gate)) {
                    function = f;
                }
            }
            self.g_function[e] = function;
            self.g_threshold[e] = spec.threshold;
            self.g_min[e] = spec.minimum;
            self.g_max[e] = spec.maximum;
            self.g_amplification[e] = spec.amplification;
            self.g_spread[e] = spec.spreadsheaves;
        }

        self.live_nodes += 1;
        Ok(id)
    }

    pub fn delete_node(&mut self, id: usize) -> NetResult<()> {
        if !self.is_node(id) {
            return Err(NetError::Identifier(format!(
                "unknown node {}",
                ids::node_uid(self.pid, id)
            )));
        }
        let offset = self.node_offsets[id];
        let count = self.node_element_counts[id] as usize;

        let defaults = GateSpec::default();
        for e in offset..offset + count {
            self.w.clear_row(e);
            self.w.clear_col(e);
            self.elements_to_nodes[e] = 0;
            self.a[e] = 0.0;
            self.a_in[e] = 0.0;
            self.g_function[e] = GateFunction::Identity;
            self.g_threshold[e] = defaults.threshold;
            self.g_min[e] = defaults.minimum;
            self.g_max[e] = defaults.maximum;
            self.g_amplification[e] = defaults.amplification;
            self.g_spread[e] = false;
        }

        // Grouped elements of the node disappear; the surviving order of
        // every group is preserved.
        for spaces in self.groups.values_mut() {
            for elements in spaces.values_mut() {
                elements.retain(|&e| e < offset || e >= offset + count);
            }
        }
        for table in &mut self.activators {
            for slot in table.iter_mut() {
                if *slot == id {
                    *slot = 0;
                }
            }
        }
        self.sensor_values.remove(&id);

        self.node_types[id] = 0;
        self.node_parents[id] = 0;
        self.node_offsets[id] = 0;
        self.node_element_counts[id] = 0;
        self.n_wait[id] = 0;
        self.n_countdown[id] = 0;

        self.free_elements(offset, count);
        self.free_node_ids.insert(id);
        self.live_nodes -= 1;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Nodespaces
    // ---------------------------------------------------------------------

    pub fn create_nodespace(
        &mut self,
        parent: usize,
        requested: Option<usize>,
    ) -> NetResult<usize> {
        if !self.is_nodespace(parent) {
            return Err(NetError::Identifier(format!(
                "unknown nodespace {}",
                ids::nodespace_uid(self.pid, parent)
            )));
        }
        let id = match requested {
            Some(id) => {
                if id == 0 {
                    return Err(NetError::Identifier("nodespace index 0 is reserved".into()));
                }
                self.ensure_nodespace_capacity(id + 1)?;
                if self.is_nodespace(id) {
                    return Err(NetError::Identifier(format!(
                        "nodespace {} is already allocated",
                        ids::nodespace_uid(self.pid, id)
                    )));
                }
                if id >= self.next_nodespace_id {
                    for free in self.next_nodespace_id..id {
                        self.free_nodespace_ids.insert(free);
                    }
                    self.next_nodespace_id = id + 1;
                } else {
                    self.free_nodespace_ids.remove(&id);
                }
                id
            }
            None => {
                if let Some(id) = self.free_nodespace_ids.pop_first() {
                    id
                } else {
                    let id = self.next_nodespace_id;
                    self.ensure_nodespace_capacity(id + 1)?;
                    self.next_nodespace_id += 1;
                    id
                }
            }
        };
        self.nodespace_parents[id] = parent;
        Ok(id)
    }

    /// Deletes a nodespace and everything below it.
    ///
    /// Returns the deleted node indices and nodespace indices (the space
    /// itself included) so callers can drop their own associated records.
    pub fn delete_nodespace(&mut self, id: usize) -> NetResult<(Vec<usize>, Vec<usize>)> {
        if id == ROOT_NODESPACE {
            return Err(NetError::Illegal(
                "the root nodespace cannot be deleted".into(),
            ));
        }
        if !self.is_nodespace(id) {
            return Err(NetError::Identifier(format!(
                "unknown nodespace {}",
                ids::nodespace_uid(self.pid, id)
            )));
        }

        let mut spaces = vec![id];
        let mut cursor = 0;
        while cursor < spaces.len() {
            let current = spaces[cursor];
            cursor += 1;
            for child in 1..self.nodespace_parents.len() {
                if child != ROOT_NODESPACE && self.nodespace_parents[child] == current {
                    spaces.push(child);
                }
            }
        }

        let mut deleted_nodes = Vec::new();
        for &space in &spaces {
            for node in self.node_ids_in(space) {
                self.delete_node(node)?;
                deleted_nodes.push(node);
            }
            self.groups.remove(&space);
            for table in &mut self.activators {
                table[space] = 0;
            }
            self.nodespace_parents[space] = 0;
            self.free_nodespace_ids.insert(space);
        }
        Ok((deleted_nodes, spaces))
    }

    // ---------------------------------------------------------------------
    // Links
    // ---------------------------------------------------------------------

    fn resolve_gate(
        &self,
        catalog: &TypeCatalog,
        id: usize,
        gate: &str,
    ) -> NetResult<(usize, usize)> {
        if !self.is_node(id) {
            return Err(NetError::Identifier(format!(
                "unknown node {}",
                ids::node_uid(self.pid, id)
            )));
        }
        let nodetype = catalog.get(self.node_types[id]).ok_or_else(|| {
            NetError::Configuration(format!("unknown node type tag {}", self.node_types[id]))
        })?;
        let pos = nodetype.gate_index(gate).ok_or_else(|| {
            NetError::Configuration(format!(
                "type {:?} has no gate {gate:?}",
                nodetype.name
            ))
        })?;
        Ok((self.node_offsets[id], pos))
    }

    fn resolve_slot(
        &self,
        catalog: &TypeCatalog,
        id: usize,
        slot: &str,
    ) -> NetResult<(usize, usize)> {
        if !self.is_node(id) {
            return Err(NetError::Identifier(format!(
                "unknown node {}",
                ids::node_uid(self.pid, id)
            )));
        }
        let nodetype = catalog.get(self.node_types[id]).ok_or_else(|| {
            NetError::Configuration(format!("unknown node type tag {}", self.node_types[id]))
        })?;
        let pos = nodetype.slot_index(slot).ok_or_else(|| {
            NetError::Configuration(format!(
                "type {:?} has no slot {slot:?}",
                nodetype.name
            ))
        })?;
        Ok((self.node_offsets[id], pos))
    }

    /// Writes one link; weight 0 removes it.
    pub fn set_link_weight(
        &mut self,
        catalog: &TypeCatalog,
        source: usize,
        gate: &str,
        target: usize,
        slot: &str,
        weight: f32,
    ) -> NetResult<()> {
        let (source_offset, gate_pos) = self.resolve_gate(catalog, source, gate)?;
        let (target_offset, slot_pos) = self.resolve_slot(catalog, target, slot)?;
        self.w
            .set(target_offset + slot_pos, source_offset + gate_pos, weight);
        Ok(())
    }

    pub fn link_weight(
        &self,
        catalog: &TypeCatalog,
        source: usize,
        gate: &str,
        target: usize,
        slot: &str,
    ) -> NetResult<f32> {
        let (source_offset, gate_pos) = self.resolve_gate(catalog, source, gate)?;
        let (target_offset, slot_pos) = self.resolve_slot(catalog, target, slot)?;
        Ok(self
            .w
            .get(target_offset + slot_pos, source_offset + gate_pos))
    }

    /// All links leaving the gates of `id`.
    pub fn links_out(&self, catalog: &TypeCatalog, id: usize) -> NetResult<Vec<LinkRecord>> {
        if !self.is_node(id) {
            return Err(NetError::Identifier(format!(
                "unknown node {}",
                ids::node_uid(self.pid, id)
            )));
        }
        let mut records = Vec::new();
        let nodetype = match catalog.get(self.node_types[id]) {
            Some(t) => t,
            None => return Ok(records),
        };
        let offset = self.node_offsets[id];
        for (gate_pos, gate) in nodetype.gates.iter().enumerate() {
            for (row, weight) in self.w.col_nonzero(offset + gate_pos) {
                let target = self.elements_to_nodes[row];
                if let Some(slot) = self.slot_name_of_element(catalog, target, row) {
                    records.push(LinkRecord {
                        source_node: id,
                        source_gate: gate.clone(),
                        target_node: target,
                        target_slot: slot,
                        weight,
                    });
                }
            }
        }
        Ok(records)
    }

    /// All links arriving at the slots of `id`.
    pub fn links_in(&self, catalog: &TypeCatalog, id: usize) -> NetResult<Vec<LinkRecord>> {
        if !self.is_node(id) {
            return Err(NetError::Identifier(format!(
                "unknown node {}",
                ids::node_uid(self.pid, id)
            )));
        }
        let mut records = Vec::new();
        let nodetype = match catalog.get(self.node_types[id]) {
            Some(t) => t,
            None => return Ok(records),
        };
        let offset = self.node_offsets[id];
        for (slot_pos, slot) in nodetype.slots.iter().enumerate() {
            for (col, weight) in self.w.row_nonzero(offset + slot_pos) {
                let source = self.elements_to_nodes[col];
                if let Some(gate) = self.gate_name_of_element(catalog, source, col) {
                    records.push(LinkRecord {
                        source_node: source,
                        source_gate: gate,
                        target_node: id,
                        target_slot: slot.clone(),
                        weight,
                    });
                }
            }
        }
        Ok(records)
    }

    fn gate_name_of_element(
        &self,
        catalog: &TypeCatalog,
        id: usize,
        element: usize,
    ) -> Option<String> {
        if !self.is_node(id) {
            return None;
        }
        let nodetype = catalog.get(self.node_types[id])?;
        let pos = element.checked_sub(self.node_offsets[id])?;
        nodetype.gates.get(pos).cloned()
    }

    fn slot_name_of_element(
        &self,
        catalog: &TypeCatalog,
        id: usize,
        element: usize,
    ) -> Option<String> {
        if !self.is_node(id) {
            return None;
        }
        let nodetype = catalog.get(self.node_types[id])?;
        let pos = element.checked_sub(self.node_offsets[id])?;
        nodetype.slots.get(pos).cloned()
    }

    // ---------------------------------------------------------------------
    // Gate configuration
    // ---------------------------------------------------------------------

    pub fn set_gate_function(
        &mut self,
        catalog: &TypeCatalog,
        id: usize,
        gate: &str,
        function: GateFunction,
    ) -> NetResult<()> {
        let (offset, pos) = self.resolve_gate(catalog, id, gate)?;
        self.g_function[offset + pos] = function;
        Ok(())
    }

    pub fn gate_function(
        &self,
        catalog: &TypeCatalog,
        id: usize,
        gate: &str,
    ) -> NetResult<GateFunction> {
        let (offset, pos) = self.resolve_gate(catalog, id, gate)?;
        Ok(self.g_function[offset + pos])
    }

    /// Sets a single gate parameter by name, mirroring the [`GateSpec`] fields.
    pub fn set_gate_parameter(
        &mut self,
        catalog: &TypeCatalog,
        id: usize,
        gate: &str,
        parameter: &str,
        value: f32,
    ) -> NetResult<()> {
        let (offset, pos) = self.resolve_gate(catalog, id, gate)?;
        let e = offset + pos;
        match parameter {
            "minimum" => self.g_min[e] = value,
            "maximum" => self.g_max[e] = value,
            "threshold" => self.g_threshold[e] = value,
            "amplification" => self.g_amplification[e] = value,
            "spreadsheaves" => self.g_spread[e] = value != 0.0,
            other => {
                return Err(NetError::Configuration(format!(
                    "unknown gate parameter {other:?}"
                )))
            }
        }
        Ok(())
    }

    pub fn gate_spec(&self, catalog: &TypeCatalog, id: usize, gate: &str) -> NetResult<GateSpec> {
        let (offset, pos) = self.resolve_gate(catalog, id, gate)?;
        let e = offset + pos;
        Ok(GateSpec {
            minimum: self.g_min[e],
            maximum: self.g_max[e],
            threshold: self.g_threshold[e],
            amplification: self.g_amplification[e],
            spreadsheaves: self.g_spread[e],
        })
    }

    /// Re-arms the wait countdown from a new `wait` parameter value.
    pub fn set_wait(&mut self, id: usize, wait: u16) -> NetResult<()> {
        if !self.is_node(id) {
            return Err(NetError::Identifier(format!(
                "unknown node {}",
                ids::node_uid(self.pid, id)
            )));
        }
        self.n_wait[id] = wait;
        self.n_countdown[id] = wait;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Activators and world input
    // ---------------------------------------------------------------------

    /// Registers `node` as the activator for gate position `gate_pos`
    /// (1..=6, por..exp) in `nodespace`; node 0 clears the entry.
    pub fn set_activator(
        &mut self,
        nodespace: usize,
        gate_pos: usize,
        node: usize,
    ) -> NetResult<()> {
        if !(1..=ACTIVATOR_POSITIONS).contains(&gate_pos) {
            return Err(NetError::Configuration(format!(
                "gate position {gate_pos} cannot be activator-controlled"
            )));
        }
        if !self.is_nodespace(nodespace) {
            return Err(NetError::Identifier(format!(
                "unknown nodespace {}",
                ids::nodespace_uid(self.pid, nodespace)
            )));
        }
        if node != 0 {
            if !self.is_node(node) {
                return Err(NetError::Identifier(format!(
                    "unknown node {}",
                    ids::node_uid(self.pid, node)
                )));
            }
            if self.node_types[node] != ACTIVATOR {
                return Err(NetError::Configuration(format!(
                    "node {} is not an Activator",
                    ids::node_uid(self.pid, node)
                )));
            }
        }
        self.activators[gate_pos - 1][nodespace] = node;
        Ok(())
    }

    pub fn activator(&self, nodespace: usize, gate_pos: usize) -> usize {
        if !(1..=ACTIVATOR_POSITIONS).contains(&gate_pos)
            || nodespace >= self.nodespace_parents.len()
        {
            return 0;
        }
        self.activators[gate_pos - 1][nodespace]
    }

    /// Stages a world value for a sensor node and makes it visible
    /// immediately.
    pub fn stage_sensor(&mut self, id: usize, value: f32) {
        self.sensor_values.insert(id, value);
        let e = self.element(id, GEN);
        self.a[e] = value;
    }

    /// Drops the staged world value for a sensor node, if any.
    pub fn unstage_sensor(&mut self, id: usize) {
        self.sensor_values.remove(&id);
    }

    /// Immediate element write, used for actuator feedback and direct
    /// activation injection. Element-less nodes swallow the write.
    pub fn write_gen_element(&mut self, id: usize, value: f32) {
        if self.node_element_counts[id] == 0 {
            return;
        }
        let e = self.element(id, GEN);
        self.a[e] = value;
    }

    pub fn read_gen_element(&self, id: usize) -> f32 {
        if self.node_element_counts[id] == 0 {
            return 0.0;
        }
        self.a[self.element(id, GEN)]
    }

    // ---------------------------------------------------------------------
    // Groups
    // ---------------------------------------------------------------------

    pub fn group(&mut self, nodespace: usize, name: &str, elements: Vec<usize>) -> NetResult<()> {
        if !self.is_nodespace(nodespace) {
            return Err(NetError::Identifier(format!(
                "unknown nodespace {}",
                ids::nodespace_uid(self.pid, nodespace)
            )));
        }
        for &e in &elements {
            if e >= self.elements_to_nodes.len() || self.elements_to_nodes[e] == 0 {
                return Err(NetError::Identifier(format!(
                    "element {e} is not allocated"
                )));
            }
        }
        self.groups
            .entry(nodespace)
            .or_default()
            .insert(name.to_string(), elements);
        Ok(())
    }

    pub fn ungroup(&mut self, nodespace: usize, name: &str) -> NetResult<()> {
        let removed = self
            .groups
            .get_mut(&nodespace)
            .and_then(|spaces| spaces.remove(name));
        if removed.is_none() {
            return Err(unknown_group(self.pid, nodespace, name));
        }
        Ok(())
    }

    fn group_ref(&self, nodespace: usize, name: &str) -> NetResult<&Vec<usize>> {
        self.groups
            .get(&nodespace)
            .and_then(|spaces| spaces.get(name))
            .ok_or_else(|| unknown_group(self.pid, nodespace, name))
    }

    pub fn group_elements(&self, nodespace: usize, name: &str) -> NetResult<Vec<usize>> {
        Ok(self.group_ref(nodespace, name)?.clone())
    }

    pub fn get_activations(&self, nodespace: usize, name: &str) -> NetResult<Vec<f32>> {
        Ok(self
            .group_ref(nodespace, name)?
            .iter()
            .map(|&e| self.a[e])
            .collect())
    }

    pub fn set_activations(
        &mut self,
        nodespace: usize,
        name: &str,
        values: &[f32],
    ) -> NetResult<()> {
        let elements = self.group_ref(nodespace, name)?.clone();
        if elements.len() != values.len() {
            return Err(NetError::Configuration(format!(
                "group {name:?} holds {} elements, got {} values",
                elements.len(),
                values.len()
            )));
        }
        for (&e, &v) in elements.iter().zip(values) {
            self.a[e] = v;
        }
        Ok(())
    }

    pub fn get_thresholds(&self, nodespace: usize, name: &str) -> NetResult<Vec<f32>> {
        Ok(self
            .group_ref(nodespace, name)?
            .iter()
            .map(|&e| self.g_threshold[e])
            .collect())
    }

    pub fn set_thresholds(&mut self, nodespace: usize, name: &str, values: &[f32]) -> NetResult<()> {
        let elements = self.group_ref(nodespace, name)?.clone();
        if elements.len() != values.len() {
            return Err(NetError::Configuration(format!(
                "group {name:?} holds {} elements, got {} values",
                elements.len(),
                values.len()
            )));
        }
        for (&e, &v) in elements.iter().zip(values) {
            self.g_threshold[e] = v;
        }
        Ok(())
    }

    /// Weight block from every element of `from` to every element of `to`,
    /// row-major with one row per target element.
    pub fn get_link_weights(
        &self,
        nodespace_from: usize,
        from: &str,
        nodespace_to: usize,
        to: &str,
    ) -> NetResult<Vec<f32>> {
        let cols = self.group_ref(nodespace_from, from)?;
        let rows = self.group_ref(nodespace_to, to)?;
        Ok(self.w.get_block(rows, cols))
    }

    pub fn set_link_weights(
        &mut self,
        nodespace_from: usize,
        from: &str,
        nodespace_to: usize,
        to: &str,
        weights: &[f32],
    ) -> NetResult<()> {
        let cols = self.group_ref(nodespace_from, from)?.clone();
        let rows = self.group_ref(nodespace_to, to)?.clone();
        if weights.len() != rows.len() * cols.len() {
            return Err(NetError::Configuration(format!(
                "weight block needs {} values, got {}",
                rows.len() * cols.len(),
                weights.len()
            )));
        }
        self.w.set_block(&rows, &cols, weights);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    pub fn write_blob_to<W: Write>(&self, w: &mut W, catalog: &TypeCatalog) -> io::Result<()> {
        storage::write_header(w)?;

        let mut payload = Vec::new();
        storage::write_u32_le(&mut payload, self.pid as u32)?;
        payload.push(self.sparse as u8);
        storage::write_u64_le(&mut payload, self.node_types.len() as u64)?;
        storage::write_u64_le(&mut payload, self.elements_to_nodes.len() as u64)?;
        storage::write_u64_le(&mut payload, self.nodespace_parents.len() as u64)?;
        storage::write_u64_le(&mut payload, self.next_node_id as u64)?;
        storage::write_u64_le(&mut payload, self.next_nodespace_id as u64)?;
        storage::write_u64_le(&mut payload, self.next_element as u64)?;
        storage::write_chunk_lz4(w, *b"CFG0", &payload)?;

        let mut payload = Vec::new();
        let table = catalog.tag_table();
        storage::write_u32_le(&mut payload, table.len() as u32)?;
        for (tag, name) in &table {
            storage::write_u16_le(&mut payload, *tag)?;
            storage::write_string(&mut payload, name)?;
        }
        storage::write_chunk_lz4(w, *b"TYPE", &payload)?;

        let mut payload = Vec::new();
        write_u16s(&mut payload, &self.node_types)?;
        write_u64s(&mut payload, &self.node_parents)?;
        write_u64s(&mut payload, &self.node_offsets)?;
        write_u16s(&mut payload, &self.node_element_counts)?;
        storage::write_chunk_lz4(w, *b"NODE", &payload)?;

        let mut payload = Vec::new();
        write_u64s(&mut payload, &self.elements_to_nodes)?;
        storage::write_chunk_lz4(w, *b"ELEM", &payload)?;

        let mut payload = Vec::new();
        write_u64s(&mut payload, &self.nodespace_parents)?;
        for table in &self.activators {
            write_u64s(&mut payload, table)?;
        }
        storage::write_chunk_lz4(w, *b"NSPC", &payload)?;

        let mut payload = Vec::new();
        write_f32s(&mut payload, &self.a)?;
        storage::write_chunk_lz4(w, *b"ACTV", &payload)?;

        let mut payload = Vec::new();
        let function_tags: Vec<u8> = self.g_function.iter().map(|f| f.tag()).collect();
        write_u8s(&mut payload, &function_tags)?;
        write_f32s(&mut payload, &self.g_threshold)?;
        write_f32s(&mut payload, &self.g_min)?;
        write_f32s(&mut payload, &self.g_max)?;
        write_f32s(&mut payload, &self.g_amplification)?;
        let spread: Vec<u8> = self.g_spread.iter().map(|&s| s as u8).collect();
        write_u8s(&mut payload, &spread)?;
        storage::write_chunk_lz4(w, *b"GATE", &payload)?;

        let mut payload = Vec::new();
        write_u16s(&mut payload, &self.n_wait)?;
        write_u16s(&mut payload, &self.n_countdown)?;
        storage::write_chunk_lz4(w, *b"WAIT", &payload)?;

        let mut payload = Vec::new();
        let triplets = self.w.nonzero_triplets();
        storage::write_u64_le(&mut payload, triplets.len() as u64)?;
        for (row, col, weight) in triplets {
            storage::write_u32_le(&mut payload, row)?;
            storage::write_u32_le(&mut payload, col)?;
            storage::write_f32_le(&mut payload, weight)?;
        }
        storage::write_chunk_lz4(w, *b"LINK", &payload)?;

        let mut payload = Vec::new();
        let mut flat: Vec<(usize, &String, &Vec<usize>)> = self
            .groups
            .iter()
            .flat_map(|(&ns, spaces)| spaces.iter().map(move |(name, e)| (ns, name, e)))
            .collect();
        flat.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        storage::write_u32_le(&mut payload, flat.len() as u32)?;
        for (ns, name, elements) in flat {
            storage::write_u64_le(&mut payload, ns as u64)?;
            storage::write_string(&mut payload, name)?;
            write_u64s(&mut payload, elements)?;
        }
        storage::write_chunk_lz4(w, *b"GRPS", &payload)?;

        let mut payload = Vec::new();
        let mut staged: Vec<(usize, f32)> =
            self.sensor_values.iter().map(|(&id, &v)| (id, v)).collect();
        staged.sort_by_key(|&(id, _)| id);
        storage::write_u32_le(&mut payload, staged.len() as u32)?;
        for (id, value) in staged {
            storage::write_u64_le(&mut payload, id as u64)?;
            storage::write_f32_le(&mut payload, value)?;
        }
        storage::write_chunk_lz4(w, *b"SENS", &payload)?;

        Ok(())
    }

    pub fn blob_bytes(&self, catalog: &TypeCatalog) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_blob_to(&mut buf, catalog)?;
        Ok(buf)
    }

    /// Exact serialized size of the blob in bytes.
    pub fn blob_size_bytes(&self, catalog: &TypeCatalog) -> io::Result<usize> {
        let mut cw = storage::CountingWriter::new();
        self.write_blob_to(&mut cw, catalog)?;
        Ok(cw.written())
    }

    /// Reads a blob back, returning the partition together with the type
    /// tag table it was saved under. Unknown chunks are skipped.
    pub fn read_blob_from<R: Read>(r: &mut R) -> io::Result<(Self, Vec<(u16, String)>)> {
        storage::read_header(r)?;

        struct Cfg {
            pid: u16,
            sparse: bool,
            node_capacity: usize,
            element_capacity: usize,
            nodespace_capacity: usize,
            next_node_id: usize,
            next_nodespace_id: usize,
            next_element: usize,
        }

        let mut cfg: Option<Cfg> = None;
        let mut type_table: Option<Vec<(u16, String)>> = None;
        let mut node_arrays: Option<(Vec<u16>, Vec<usize>, Vec<usize>, Vec<u16>)> = None;
        let mut elements_to_nodes: Option<Vec<usize>> = None;
        let mut nodespaces: Option<(Vec<usize>, Vec<Vec<usize>>)> = None;
        let mut a: Option<Vec<f32>> = None;
        let mut gates: Option<(Vec<u8>, Vec<f32>, Vec<f32>, Vec<f32>, Vec<f32>, Vec<u8>)> = None;
        let mut waits: Option<(Vec<u16>, Vec<u16>)> = None;
        let mut links: Option<Vec<(u32, u32, f32)>> = None;
        let mut groups: Option<Vec<(usize, String, Vec<usize>)>> = None;
        let mut staged: Option<Vec<(usize, f32)>> = None;

        while let Some((tag, len)) = storage::read_chunk_header(r)? {
            match &tag {
                b"CFG0" => {
                    let payload = storage::read_chunk_lz4(r, len)?;
                    let mut c = io::Cursor::new(payload);
                    let pid = storage::read_u32_le(&mut c)?;
                    let sparse = storage::read_exact::<1, _>(&mut c)?[0] != 0;
                    cfg = Some(Cfg {
                        pid: pid as u16,
                        sparse,
                        node_capacity: storage::read_u64_le(&mut c)? as usize,
                        element_capacity: storage::read_u64_le(&mut c)? as usize,
                        nodespace_capacity: storage::read_u64_le(&mut c)? as usize,
                        next_node_id: storage::read_u64_le(&mut c)? as usize,
                        next_nodespace_id: storage::read_u64_le(&mut c)? as usize,
                        next_element: storage::read_u64_le(&mut c)? as usize,
                    });
                }
                b"TYPE" => {
                    let payload = storage::read_chunk_lz4(r, len)?;
                    let mut c = io::Cursor::new(payload);
                    let count = storage::read_u32_le(&mut c)? as usize;
                    let mut table = Vec::with_capacity(count);
                    for _ in 0..count {
                        let tag = storage::read_u16_le(&mut c)?;
                        let name = storage::read_string(&mut c)?;
                        table.push((tag, name));
                    }
                    type_table = Some(table);
                }
                b"NODE" => {
                    let payload = storage::read_chunk_lz4(r, len)?;
                    let mut c = io::Cursor::new(payload);
                    let types = read_u16s(&mut c)?;
                    let parents = read_u64s(&mut c)?;
                    let offsets = read_u64s(&mut c)?;
                    let counts = read_u16s(&mut c)?;
                    node_arrays = Some((types, parents, offsets, counts));
                }
                b"ELEM" => {
                    let payload = storage::read_chunk_lz4(r, len)?;
                    elements_to_nodes = Some(read_u64s(&mut io::Cursor::new(payload))?);
                }
                b"NSPC" => {
                    let payload = storage::read_chunk_lz4(r, len)?;
                    let mut c = io::Cursor::new(payload);
                    let parents = read_u64s(&mut c)?;
                    let mut tables = Vec::with_capacity(ACTIVATOR_POSITIONS);
                    for _ in 0..ACTIVATOR_POSITIONS {
                        tables.push(read_u64s(&mut c)?);
                    }
                    nodespaces = Some((parents, tables));
                }
                b"ACTV" => {
                    let payload = storage::read_chunk_lz4(r, len)?;
                    a = Some(read_f32s(&mut io::Cursor::new(payload))?);
                }
                b"GATE" => {
                    let payload = storage::read_chunk_lz4(r, len)?;
                    let mut c = io::Cursor::new(payload);
                    let functions = read_u8s(&mut c)?;
                    let thresholds = read_f32s(&mut c)?;
                    let minimums = read_f32s(&mut c)?;
                    let maximums = read_f32s(&mut c)?;
                    let amplifications = read_f32s(&mut c)?;
                    let spread = read_u8s(&mut c)?;
                    gates = Some((
                        functions,
                        thresholds,
                        minimums,
                        maximums,
                        amplifications,
                        spread,
                    ));
                }
                b"WAIT" => {
                    let payload = storage::read_chunk_lz4(r, len)?;
                    let mut c = io::Cursor::new(payload);
                    let wait = read_u16s(&mut c)?;
                    let countdown = read_u16s(&mut c)?;
                    waits = Some((wait, countdown));
                }
                b"LINK" => {
                    let payload = storage::read_chunk_lz4(r, len)?;
                    let mut c = io::Cursor::new(payload);
                    let count = storage::read_u64_le(&mut c)? as usize;
                    let mut triplets = Vec::with_capacity(count.min(1 << 20));
                    for _ in 0..count {
                        let row = storage::read_u32_le(&mut c)?;
                        let col = storage::read_u32_le(&mut c)?;
                        let weight = storage::read_f32_le(&mut c)?;
                        triplets.push((row, col, weight));
                    }
                    links = Some(triplets);
                }
                b"GRPS" => {
                    let payload = storage::read_chunk_lz4(r, len)?;
                    let mut c = io::Cursor::new(payload);
                    let count = storage::read_u32_le(&mut c)? as usize;
                    let mut flat = Vec::with_capacity(count.min(1 << 16));
                    for _ in 0..count {
                        let ns = storage::read_u64_le(&mut c)? as usize;
                        let name = storage::read_string(&mut c)?;
                        let elements = read_u64s(&mut c)?;
                        flat.push((ns, name, elements));
                    }
                    groups = Some(flat);
                }
                b"SENS" => {
                    let payload = storage::read_chunk_lz4(r, len)?;
                    let mut c = io::Cursor::new(payload);
                    let count = storage::read_u32_le(&mut c)? as usize;
                    let mut values = Vec::with_capacity(count.min(1 << 16));
                    for _ in 0..count {
                        let id = storage::read_u64_le(&mut c)? as usize;
                        let value = storage::read_f32_le(&mut c)?;
                        values.push((id, value));
                    }
                    staged = Some(values);
                }
                _ => {
                    // Unknown chunk: skipped.
                    storage::skip_chunk(r, len)?;
                }
            }
        }

        let cfg = cfg.ok_or_else(|| invalid("missing CFG0"))?;
        let type_table = type_table.ok_or_else(|| invalid("missing TYPE"))?;
        let (node_types, node_parents, node_offsets, node_element_counts) =
            node_arrays.ok_or_else(|| invalid("missing NODE"))?;
        let elements_to_nodes = elements_to_nodes.ok_or_else(|| invalid("missing ELEM"))?;
        let (nodespace_parents, activator_tables) =
            nodespaces.ok_or_else(|| invalid("missing NSPC"))?;
        let a = a.ok_or_else(|| invalid("missing ACTV"))?;
        let (function_tags, g_threshold, g_min, g_max, g_amplification, spread_tags) =
            gates.ok_or_else(|| invalid("missing GATE"))?;
        let (n_wait, n_countdown) = waits.ok_or_else(|| invalid("missing WAIT"))?;
        let links = links.ok_or_else(|| invalid("missing LINK"))?;
        let groups_flat = groups.unwrap_or_default();
        let staged = staged.unwrap_or_default();

        if cfg.nodespace_capacity <= ROOT_NODESPACE {
            return Err(invalid("CFG0 nodespace capacity cannot hold the root"));
        }
        if node_types.len() != cfg.node_capacity
            || node_parents.len() != cfg.node_capacity
            || node_offsets.len() != cfg.node_capacity
            || node_element_counts.len() != cfg.node_capacity
            || n_wait.len() != cfg.node_capacity
            || n_countdown.len() != cfg.node_capacity
        {
            return Err(invalid("NODE/WAIT length mismatch"));
        }
        if elements_to_nodes.len() != cfg.element_capacity
            || a.len() != cfg.element_capacity
            || function_tags.len() != cfg.element_capacity
            || g_threshold.len() != cfg.element_capacity
            || g_min.len() != cfg.element_capacity
            || g_max.len() != cfg.element_capacity
            || g_amplification.len() != cfg.element_capacity
            || spread_tags.len() != cfg.element_capacity
        {
            return Err(invalid("ELEM/ACTV/GATE length mismatch"));
        }
        if nodespace_parents.len() != cfg.nodespace_capacity
            || activator_tables
                .iter()
                .any(|t| t.len() != cfg.nodespace_capacity)
        {
            return Err(invalid("NSPC length mismatch"));
        }
        if cfg.next_node_id > cfg.node_capacity.max(1)
            || cfg.next_nodespace_id <= ROOT_NODESPACE
            || cfg.next_nodespace_id > cfg.nodespace_capacity
            || cfg.next_element > cfg.element_capacity
        {
            return Err(invalid("CFG0 allocation cursors out of range"));
        }

        let mut g_function = Vec::with_capacity(function_tags.len());
        for tag in function_tags {
            g_function
                .push(GateFunction::from_tag(tag).ok_or_else(|| invalid("bad gate function tag"))?);
        }

        let mut w = WeightMatrix::new(cfg.element_capacity, cfg.sparse)
            .map_err(|e| invalid(&e.to_string()))?;
        for (row, col, weight) in links {
            if row as usize >= cfg.element_capacity || col as usize >= cfg.element_capacity {
                return Err(invalid("LINK cell out of range"));
            }
            w.set(row as usize, col as usize, weight);
        }

        let mut live_nodes = 0;
        for id in 1..cfg.next_node_id {
            if node_types[id] == 0 {
                continue;
            }
            live_nodes += 1;
            let parent = node_parents[id];
            if parent == 0 || parent >= cfg.nodespace_capacity {
                return Err(invalid("node parent nodespace out of range"));
            }
            let offset = node_offsets[id];
            let count = node_element_counts[id] as usize;
            if offset + count > cfg.element_capacity {
                return Err(invalid("node element block out of range"));
            }
            for e in offset..offset + count {
                if elements_to_nodes[e] != id {
                    return Err(invalid("ELEM reverse index inconsistent"));
                }
            }
        }

        let mut groups_map: HashMap<usize, HashMap<String, Vec<usize>>> = HashMap::new();
        for (ns, name, elements) in groups_flat {
            if elements
                .iter()
                .any(|&e| e >= cfg.element_capacity)
            {
                return Err(invalid("GRPS element out of range"));
            }
            groups_map.entry(ns).or_default().insert(name, elements);
        }

        let mut sensor_values = HashMap::new();
        for (id, value) in staged {
            if id >= cfg.node_capacity {
                return Err(invalid("SENS node out of range"));
            }
            sensor_values.insert(id, value);
        }

        let mut free_node_ids = BTreeSet::new();
        for id in 1..cfg.next_node_id {
            if node_types[id] == 0 {
                free_node_ids.insert(id);
            }
        }
        let mut free_nodespace_ids = BTreeSet::new();
        for id in 2..cfg.next_nodespace_id {
            if nodespace_parents[id] == 0 {
                free_nodespace_ids.insert(id);
            }
        }
        let mut free_blocks = Vec::new();
        let mut run_start = None;
        for e in 0..cfg.next_element {
            if elements_to_nodes[e] == 0 {
                run_start.get_or_insert(e);
            } else if let Some(start) = run_start.take() {
                free_blocks.push((start, e - start));
            }
        }
        if let Some(start) = run_start {
            free_blocks.push((start, cfg.next_element - start));
        }

        let activators: [Vec<usize>; ACTIVATOR_POSITIONS] = activator_tables
            .try_into()
            .map_err(|_| invalid("NSPC activator table count"))?;

        let a_in = vec![0.0; cfg.element_capacity];
        let partition = Self {
            pid: cfg.pid,
            sparse: cfg.sparse,
            node_types,
            node_parents,
            node_offsets,
            node_element_counts,
            n_wait,
            n_countdown,
            elements_to_nodes,
            a,
            a_in,
            g_function,
            g_threshold,
            g_min,
            g_max,
            g_amplification,
            g_spread: spread_tags.iter().map(|&s| s != 0).collect(),
            nodespace_parents,
            activators,
            w,
            sensor_values,
            groups: groups_map,
            free_node_ids,
            free_nodespace_ids,
            free_blocks,
            next_node_id: cfg.next_node_id,
            next_nodespace_id: cfg.next_nodespace_id,
            next_element: cfg.next_element,
            live_nodes,
        };
        Ok((partition, type_table))
    }
}

fn unknown_group(pid: u16, nodespace: usize, name: &str) -> NetError {
    NetError::Identifier(format!(
        "unknown group {name:?} in nodespace {}",
        ids::nodespace_uid(pid, nodespace)
    ))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn write_u64s<W: Write>(w: &mut W, values: &[usize]) -> io::Result<()> {
    storage::write_u64_le(w, values.len() as u64)?;
    for &v in values {
        storage::write_u64_le(w, v as u64)?;
    }
    Ok(())
}

fn read_u64s<R: Read>(r: &mut R) -> io::Result<Vec<usize>> {
    let n = storage::read_u64_le(r)? as usize;
    let mut out = Vec::with_capacity(n.min(1 << 24));
    for _ in 0..n {
        out.push(storage::read_u64_le(r)? as usize);
    }
    Ok(out)
}

fn write_u16s<W: Write>(w: &mut W, values: &[u16]) -> io::Result<()> {
    storage::write_u64_le(w, values.len() as u64)?;
    for &v in values {
        storage::write_u16_le(w, v)?;
    }
    Ok(())
}

fn read_u16s<R: Read>(r: &mut R) -> io::Result<Vec<u16>> {
    let n = storage::read_u64_le(r)? as usize;
    let mut out = Vec::with_capacity(n.min(1 << 24));
    for _ in 0..n {
        out.push(storage::read_u16_le(r)?);
    }
    Ok(out)
}

fn write_f32s<W: Write>(w: &mut W, values: &[f32]) -> io::Result<()> {
    storage::write_u64_le(w, values.len() as u64)?;
    for &v in values {
        storage::write_f32_le(w, v)?;
    }
    Ok(())
}

fn read_f32s<R: Read>(r: &mut R) -> io::Result<Vec<f32>> {
    let n = storage::read_u64_le(r)? as usize;
    let mut out = Vec::with_capacity(n.min(1 << 24));
    for _ in 0..n {
        out.push(storage::read_f32_le(r)?);
    }
    Ok(out)
}

fn write_u8s<W: Write>(w: &mut W, values: &[u8]) -> io::Result<()> {
    storage::write_u64_le(w, values.len() as u64)?;
    w.write_all(values)
}

fn read_u8s<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let n = storage::read_u64_le(r)? as usize;
    let mut out = vec![0u8; n];
    r.read_exact(&mut out)?;
    Ok(out)
}
