//! Nodenet facade.
//!
//! Composes the element arenas, the type catalog, the step pipeline and the
//! persistence codec behind the uid-based API external callers see. The
//! facade owns everything a partition does not: display names, positions,
//! sensor/actuator wiring, per-node parameter and state extras, modulators
//! and the operator list.
//!
//! All mutation goes through `&mut self`. Embedders sharing a net across
//! threads wrap it in a `Mutex`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NetError, NetResult};
use crate::ids;
use crate::nodetype::{
    GateFunction, GateOverride, GateSpec, NodetypeDef, TypeCatalog, ACTIVATOR_GATE_TYPES,
    ACTUATOR, GEN, SENSOR,
};
use crate::partition::{LinkRecord, NodeInit, Partition, ROOT_NODESPACE};
use crate::stepoperators::{standard_operators, Modulators, StepOperator};

const METADATA_VERSION: u32 = 1;

/// Construction parameters for a nodenet.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Stable external identifier; generated from the clock when absent.
    pub uid: Option<String>,
    pub name: String,
    pub initial_nodes: usize,
    pub average_elements_per_node: usize,
    pub initial_nodespaces: usize,
    pub sparse_links: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            uid: None,
            name: String::new(),
            initial_nodes: 2000,
            average_elements_per_node: 4,
            initial_nodespaces: 10,
            sparse_links: true,
        }
    }
}

/// Optional knobs for facade node creation.
#[derive(Debug, Default)]
pub struct NodeOptions<'a> {
    pub name: Option<&'a str>,
    pub position: Option<(f32, f32)>,
    /// Claim this exact uid; its partition digits must match the target
    /// nodespace.
    pub uid: Option<&'a str>,
    pub parameters: Option<&'a HashMap<String, Value>>,
    pub gate_overrides: Option<&'a HashMap<String, GateOverride>>,
    pub gate_functions: Option<&'a HashMap<String, GateFunction>>,
}

/// Optional knobs for facade nodespace creation.
#[derive(Debug, Default)]
pub struct NodespaceOptions<'a> {
    pub name: Option<&'a str>,
    pub position: Option<(f32, f32)>,
    pub uid: Option<&'a str>,
}

/// Group member ordering for [`Nodenet::group_nodes_by_ids`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupSort {
    #[default]
    Id,
    Name,
}

/// A link with endpoints resolved to external uids.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkView {
    pub source_uid: String,
    pub source_gate: String,
    pub target_uid: String,
    pub target_slot: String,
    pub weight: f32,
}

/// On-demand value view of one node. Never cached by the engine; stale the
/// moment the net is mutated.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub uid: String,
    pub index: usize,
    pub partition: u16,
    pub nodetype: String,
    pub parent_nodespace: String,
    pub name: Option<String>,
    pub position: Option<(f32, f32)>,
    /// Activation of the gen element; 0 for element-less types.
    pub activation: f32,
    pub gate_activations: Vec<(String, f32)>,
    /// Declared defaults, overlaid with everything set on this node.
    pub parameters: BTreeMap<String, Value>,
    pub state: BTreeMap<String, Value>,
}

/// On-demand value view of one nodespace.
#[derive(Debug, Clone)]
pub struct NodespaceView {
    pub uid: String,
    pub index: usize,
    pub partition: u16,
    pub parent_nodespace: Option<String>,
    pub name: Option<String>,
    pub position: Option<(f32, f32)>,
}

/// Free-form per-node data kept outside the numeric arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeExtras {
    pub parameters: BTreeMap<String, Value>,
    pub state: BTreeMap<String, Value>,
}

impl NodeExtras {
    fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.state.is_empty()
    }
}

/// What a load or catalog reload had to do to reconcile existing nodes
/// with the effective type catalog.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Nodes dropped because their type name no longer exists, with the
    /// former type name.
    pub dropped: Vec<(String, String)>,
    /// Nodes recreated because their type's element count changed;
    /// parameters survive, links do not.
    pub recreated: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty() && self.recreated.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct Metadata {
    version: u32,
    uid: String,
    name: String,
    current_step: u64,
    partitions: Vec<u16>,
    names: BTreeMap<String, String>,
    positions: BTreeMap<String, (f32, f32)>,
    sensormap: BTreeMap<String, Vec<(u16, usize)>>,
    actuatormap: BTreeMap<String, Vec<(u16, usize)>>,
    modulators: BTreeMap<String, f32>,
    nodes: BTreeMap<String, NodeExtras>,
}

struct OperatorEntry {
    op: Box<dyn StepOperator>,
    enabled: bool,
}

pub struct Nodenet {
    uid: String,
    name: String,
    step: u64,
    config: NetConfig,
    catalog: TypeCatalog,
    registered_defs: Vec<NodetypeDef>,
    partitions: BTreeMap<u16, Partition>,
    next_partition: u16,
    modulators: Modulators,
    operators: Vec<OperatorEntry>,
    names: HashMap<String, String>,
    positions: HashMap<String, (f32, f32)>,
    sensormap: HashMap<String, Vec<(u16, usize)>>,
    actuatormap: HashMap<String, Vec<(u16, usize)>>,
    inverted_sensor_map: HashMap<String, String>,
    inverted_actuator_map: HashMap<String, String>,
    node_extras: HashMap<String, NodeExtras>,
}

impl Nodenet {
    pub fn new(config: NetConfig, registered: &[NodetypeDef]) -> NetResult<Self> {
        let catalog = TypeCatalog::with_registered(registered)?;
        let mut partitions = BTreeMap::new();
        partitions.insert(
            0,
            Partition::new(
                0,
                config.sparse_links,
                config.initial_nodes,
                config.average_elements_per_node,
                config.initial_nodespaces,
            )?,
        );
        let uid = config.uid.clone().unwrap_or_else(generate_uid);
        let name = config.name.clone();
        Ok(Self {
            uid,
            name,
            step: 0,
            config,
            catalog,
            registered_defs: registered.to_vec(),
            partitions,
            next_partition: 1,
            modulators: Modulators::new(),
            operators: standard_operators()
                .into_iter()
                .map(|op| OperatorEntry { op, enabled: true })
                .collect(),
            names: HashMap::new(),
            positions: HashMap::new(),
            sensormap: HashMap::new(),
            actuatormap: HashMap::new(),
            inverted_sensor_map: HashMap::new(),
            inverted_actuator_map: HashMap::new(),
            node_extras: HashMap::new(),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn current_step(&self) -> u64 {
        self.step
    }

    /// Uid of the root nodespace of the root partition.
    pub fn root_nodespace_uid(&self) -> String {
        ids::nodespace_uid(0, ROOT_NODESPACE)
    }

    pub fn nodetype_names(&self) -> Vec<String> {
        self.catalog.names()
    }

    pub fn gatefunction_names(&self) -> [&'static str; 6] {
        GateFunction::names()
    }

    // -----------------------------------------------------------------
    // Partitions
    // -----------------------------------------------------------------

    /// Adds an empty partition sized like the root one and returns its tag.
    ///
    /// Tags above [`ids::MAX_PARTITION`] have no unambiguous uid rendering,
    /// so creation stops there.
    pub fn create_partition(&mut self) -> NetResult<u16> {
        if self.next_partition > ids::MAX_PARTITION {
            return Err(NetError::Capacity(format!(
                "partition tags are exhausted at {}",
                ids::MAX_PARTITION
            )));
        }
        let pid = self.next_partition;
        let partition = Partition::new(
            pid,
            self.config.sparse_links,
            self.config.initial_nodes,
            self.config.average_elements_per_node,
            self.config.initial_nodespaces,
        )?;
        self.partitions.insert(pid, partition);
        self.next_partition += 1;
        Ok(pid)
    }

    pub fn partition_ids(&self) -> Vec<u16> {
        self.partitions.keys().copied().collect()
    }

    /// Pre-grows a partition's backing arrays for a batch of creations.
    pub fn announce_nodes(
        &mut self,
        pid: u16,
        node_count: usize,
        average_elements_per_node: usize,
    ) -> NetResult<()> {
        partition_entry(&mut self.partitions, pid)?
            .announce_nodes(node_count, average_elements_per_node)
    }

    fn partition(&self, pid: u16) -> NetResult<&Partition> {
        self.partitions
            .get(&pid)
            .ok_or_else(|| NetError::Identifier(format!("unknown partition {pid}")))
    }

    // -----------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------

    pub fn create_node(
        &mut self,
        type_name: &str,
        nodespace_uid: &str,
        options: NodeOptions<'_>,
    ) -> NetResult<String> {
        let tag = self
            .catalog
            .tag_of(type_name)
            .ok_or_else(|| NetError::Configuration(format!("unknown node type {type_name:?}")))?;
        let (pid, nodespace) = ids::parse_nodespace_uid(nodespace_uid)?;
        let requested_index = match options.uid {
            Some(uid) => {
                let (uid_pid, index) = ids::parse_node_uid(uid)?;
                if uid_pid != pid {
                    return Err(NetError::Identifier(format!(
                        "uid {uid:?} does not belong to partition {pid}"
                    )));
                }
                Some(index)
            }
            None => None,
        };

        let id = partition_entry(&mut self.partitions, pid)?.create_node(
            &self.catalog,
            tag,
            nodespace,
            NodeInit {
                requested_index,
                gate_overrides: options.gate_overrides,
                gate_functions: options.gate_functions,
                wait: None,
            },
        )?;
        let uid = ids::node_uid(pid, id);

        if let Some(name) = options.name {
            self.names.insert(uid.clone(), name.to_string());
        }
        if let Some(position) = options.position {
            self.positions.insert(uid.clone(), position);
        }
        if let Some(parameters) = options.parameters {
            let mut sorted: Vec<(&String, &Value)> = parameters.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            for (key, value) in sorted {
                self.set_node_parameter(&uid, key, value.clone())?;
            }
        }
        Ok(uid)
    }

    pub fn delete_node(&mut self, uid: &str) -> NetResult<()> {
        let (pid, id) = ids::parse_node_uid(uid)?;
        partition_entry(&mut self.partitions, pid)?.delete_node(id)?;
        self.forget_node_records(uid, pid, id);
        Ok(())
    }

    fn forget_node_records(&mut self, uid: &str, pid: u16, id: usize) {
        self.names.remove(uid);
        self.positions.remove(uid);
        self.node_extras.remove(uid);
        self.unbind_sensor(uid, pid, id);
        self.unbind_actuator(uid, pid, id);
    }

    pub fn is_node(&self, uid: &str) -> bool {
        match ids::parse_node_uid(uid) {
            Ok((pid, id)) => self.partitions.get(&pid).is_some_and(|p| p.is_node(id)),
            Err(_) => false,
        }
    }

    pub fn is_nodespace(&self, uid: &str) -> bool {
        match ids::parse_nodespace_uid(uid) {
            Ok((pid, id)) => self.partitions.get(&pid).is_some_and(|p| p.is_nodespace(id)),
            Err(_) => false,
        }
    }

    /// All live node uids, ordered by partition then index.
    pub fn node_uids(&self) -> Vec<String> {
        self.partitions
            .iter()
            .flat_map(|(&pid, p)| p.node_ids().into_iter().map(move |id| ids::node_uid(pid, id)))
            .collect()
    }

    pub fn nodespace_uids(&self) -> Vec<String> {
        self.partitions
            .iter()
            .flat_map(|(&pid, p)| {
                p.nodespace_ids()
                    .into_iter()
                    .map(move |id| ids::nodespace_uid(pid, id))
            })
            .collect()
    }

    pub fn get_node(&self, uid: &str) -> NetResult<NodeView> {
        let (pid, id) = ids::parse_node_uid(uid)?;
        let partition = self.partition(pid)?;
        if !partition.is_node(id) {
            return Err(NetError::Identifier(format!("unknown node {uid:?}")));
        }
        let tag = partition.node_types[id];
        let nodetype = self
            .catalog
            .get(tag)
            .ok_or_else(|| NetError::Configuration(format!("unknown node type tag {tag}")))?;
        let offset = partition.node_offsets[id];
        let has_elements = partition.node_element_counts[id] > 0;

        let extras = self.node_extras.get(uid).cloned().unwrap_or_default();
        let mut parameters: BTreeMap<String, Value> = nodetype
            .parameter_defaults
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        parameters.extend(extras.parameters);
        if let Some(datasource) = self.inverted_sensor_map.get(uid) {
            parameters.insert("datasource".into(), Value::from(datasource.clone()));
        }
        if let Some(datatarget) = self.inverted_actuator_map.get(uid) {
            parameters.insert("datatarget".into(), Value::from(datatarget.clone()));
        }
        if nodetype.parameters.iter().any(|p| p == "wait") {
            parameters.insert("wait".into(), Value::from(partition.n_wait[id]));
        }

        Ok(NodeView {
            uid: uid.to_string(),
            index: id,
            partition: pid,
            nodetype: nodetype.name.clone(),
            parent_nodespace: ids::nodespace_uid(pid, partition.node_parents[id]),
            name: self.names.get(uid).cloned(),
            position: self.positions.get(uid).copied(),
            activation: if has_elements {
                partition.a[offset + GEN]
            } else {
                0.0
            },
            gate_activations: nodetype
                .gates
                .iter()
                .enumerate()
                .map(|(pos, gate)| (gate.clone(), partition.a[offset + pos]))
                .collect(),
            parameters,
            state: extras.state,
        })
    }

    /// Writes the gen element directly, as external activation injection.
    pub fn set_node_activation(&mut self, uid: &str, value: f32) -> NetResult<()> {
        let (pid, id) = ids::parse_node_uid(uid)?;
        let partition = partition_entry(&mut self.partitions, pid)?;
        if !partition.is_node(id) {
            return Err(NetError::Identifier(format!("unknown node {uid:?}")));
        }
        partition.write_gen_element(id, value);
        Ok(())
    }

    pub fn get_node_activation(&self, uid: &str) -> NetResult<f32> {
        let (pid, id) = ids::parse_node_uid(uid)?;
        let partition = self.partition(pid)?;
        if !partition.is_node(id) {
            return Err(NetError::Identifier(format!("unknown node {uid:?}")));
        }
        Ok(partition.read_gen_element(id))
    }

    /// Renames a node or nodespace; an empty name clears the entry.
    pub fn set_entity_name(&mut self, uid: &str, name: &str) -> NetResult<()> {
        if !self.is_node(uid) && !self.is_nodespace(uid) {
            return Err(NetError::Identifier(format!("unknown entity {uid:?}")));
        }
        if name.is_empty() {
            self.names.remove(uid);
        } else {
            self.names.insert(uid.to_string(), name.to_string());
        }
        Ok(())
    }

    pub fn set_entity_position(&mut self, uid: &str, position: (f32, f32)) -> NetResult<()> {
        if !self.is_node(uid) && !self.is_nodespace(uid) {
            return Err(NetError::Identifier(format!("unknown entity {uid:?}")));
        }
        self.positions.insert(uid.to_string(), position);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Node parameters
    // -----------------------------------------------------------------

    /// Sets one named parameter. `datasource`/`datatarget` rewire the world
    /// maps, `type` registers the node as a nodespace activator, `wait`
    /// re-arms the countdown; everything else is kept as free-form extras.
    pub fn set_node_parameter(&mut self, uid: &str, key: &str, value: Value) -> NetResult<()> {
        let (pid, id) = ids::parse_node_uid(uid)?;
        let type_tag = {
            let partition = self.partition(pid)?;
            if !partition.is_node(id) {
                return Err(NetError::Identifier(format!("unknown node {uid:?}")));
            }
            partition.node_types[id]
        };
        match key {
            "datasource" => {
                if type_tag != SENSOR {
                    return Err(NetError::Configuration(format!(
                        "node {uid:?} is not a Sensor"
                    )));
                }
                self.unbind_sensor(uid, pid, id);
                if let Some(datasource) = value.as_str().filter(|s| !s.is_empty()) {
                    self.sensormap
                        .entry(datasource.to_string())
                        .or_default()
                        .push((pid, id));
                    self.inverted_sensor_map
                        .insert(uid.to_string(), datasource.to_string());
                }
            }
            "datatarget" => {
                if type_tag != ACTUATOR {
                    return Err(NetError::Configuration(format!(
                        "node {uid:?} is not an Actuator"
                    )));
                }
                self.unbind_actuator(uid, pid, id);
                if let Some(datatarget) = value.as_str().filter(|s| !s.is_empty()) {
                    self.actuatormap
                        .entry(datatarget.to_string())
                        .or_default()
                        .push((pid, id));
                    self.inverted_actuator_map
                        .insert(uid.to_string(), datatarget.to_string());
                }
            }
            "type" => {
                let gate_type = value.as_str().ok_or_else(|| {
                    NetError::Configuration("activator type must be a string".into())
                })?;
                let nodespace = self.partition(pid)?.node_parents[id];
                self.set_activator_by_name(pid, nodespace, gate_type, id)?;
                self.node_extras
                    .entry(uid.to_string())
                    .or_default()
                    .parameters
                    .insert("type".into(), value);
            }
            "wait" => {
                let wait = value.as_u64().ok_or_else(|| {
                    NetError::Configuration("wait must be a non-negative number".into())
                })?;
                partition_entry(&mut self.partitions, pid)?
                    .set_wait(id, wait.min(u16::MAX as u64) as u16)?;
            }
            _ => {
                self.node_extras
                    .entry(uid.to_string())
                    .or_default()
                    .parameters
                    .insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    /// Free-form state entry, untouched by the engine.
    pub fn set_node_state(&mut self, uid: &str, key: &str, value: Value) -> NetResult<()> {
        if !self.is_node(uid) {
            return Err(NetError::Identifier(format!("unknown node {uid:?}")));
        }
        self.node_extras
            .entry(uid.to_string())
            .or_default()
            .state
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn set_gate_parameter(
        &mut self,
        uid: &str,
        gate: &str,
        parameter: &str,
        value: f32,
    ) -> NetResult<()> {
        let (pid, id) = ids::parse_node_uid(uid)?;
        partition_entry(&mut self.partitions, pid)?.set_gate_parameter(
            &self.catalog,
            id,
            gate,
            parameter,
            value,
        )
    }

    pub fn get_gate_spec(&self, uid: &str, gate: &str) -> NetResult<GateSpec> {
        let (pid, id) = ids::parse_node_uid(uid)?;
        self.partition(pid)?.gate_spec(&self.catalog, id, gate)
    }

    pub fn set_gatefunction(&mut self, uid: &str, gate: &str, function: &str) -> NetResult<()> {
        let function = GateFunction::from_name(function)?;
        let (pid, id) = ids::parse_node_uid(uid)?;
        partition_entry(&mut self.partitions, pid)?.set_gate_function(
            &self.catalog,
            id,
            gate,
            function,
        )
    }

    fn unbind_sensor(&mut self, uid: &str, pid: u16, id: usize) {
        if let Some(datasource) = self.inverted_sensor_map.remove(uid) {
            if let Some(list) = self.sensormap.get_mut(&datasource) {
                list.retain(|&entry| entry != (pid, id));
                if list.is_empty() {
                    self.sensormap.remove(&datasource);
                }
            }
            if let Some(partition) = self.partitions.get_mut(&pid) {
                partition.unstage_sensor(id);
            }
        }
    }

    fn unbind_actuator(&mut self, uid: &str, pid: u16, id: usize) {
        if let Some(datatarget) = self.inverted_actuator_map.remove(uid) {
            if let Some(list) = self.actuatormap.get_mut(&datatarget) {
                list.retain(|&entry| entry != (pid, id));
                if list.is_empty() {
                    self.actuatormap.remove(&datatarget);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Nodespaces
    // -----------------------------------------------------------------

    pub fn create_nodespace(
        &mut self,
        parent_uid: &str,
        options: NodespaceOptions<'_>,
    ) -> NetResult<String> {
        let (pid, parent) = ids::parse_nodespace_uid(parent_uid)?;
        let requested = match options.uid {
            Some(uid) => {
                let (uid_pid, index) = ids::parse_nodespace_uid(uid)?;
                if uid_pid != pid {
                    return Err(NetError::Identifier(format!(
                        "uid {uid:?} does not belong to partition {pid}"
                    )));
                }
                Some(index)
            }
            None => None,
        };
        let id = partition_entry(&mut self.partitions, pid)?.create_nodespace(parent, requested)?;
        let uid = ids::nodespace_uid(pid, id);
        if let Some(name) = options.name {
            self.names.insert(uid.clone(), name.to_string());
        }
        if let Some(position) = options.position {
            self.positions.insert(uid.clone(), position);
        }
        Ok(uid)
    }

    /// Deletes a nodespace and, recursively, everything inside it.
    pub fn delete_nodespace(&mut self, uid: &str) -> NetResult<()> {
        let (pid, id) = ids::parse_nodespace_uid(uid)?;
        let (nodes, spaces) = partition_entry(&mut self.partitions, pid)?.delete_nodespace(id)?;
        for node in nodes {
            let node_uid = ids::node_uid(pid, node);
            self.forget_node_records(&node_uid, pid, node);
        }
        for space in spaces {
            let space_uid = ids::nodespace_uid(pid, space);
            self.names.remove(&space_uid);
            self.positions.remove(&space_uid);
        }
        Ok(())
    }

    pub fn get_nodespace(&self, uid: &str) -> NetResult<NodespaceView> {
        let (pid, id) = ids::parse_nodespace_uid(uid)?;
        let partition = self.partition(pid)?;
        if !partition.is_nodespace(id) {
            return Err(NetError::Identifier(format!("unknown nodespace {uid:?}")));
        }
        let parent = partition.nodespace_parents[id];
        Ok(NodespaceView {
            uid: uid.to_string(),
            index: id,
            partition: pid,
            parent_nodespace: (parent != 0).then(|| ids::nodespace_uid(pid, parent)),
            name: self.names.get(uid).cloned(),
            position: self.positions.get(uid).copied(),
        })
    }

    pub fn set_nodespace_gatetype_activator(
        &mut self,
        nodespace_uid: &str,
        gate_type: &str,
        activator_uid: Option<&str>,
    ) -> NetResult<()> {
        let (pid, nodespace) = ids::parse_nodespace_uid(nodespace_uid)?;
        let node = match activator_uid {
            Some(uid) => {
                let (node_pid, id) = ids::parse_node_uid(uid)?;
                if node_pid != pid {
                    return Err(NetError::Identifier(
                        "activator and nodespace live in different partitions".into(),
                    ));
                }
                id
            }
            None => 0,
        };
        self.set_activator_by_name(pid, nodespace, gate_type, node)
    }

    fn set_activator_by_name(
        &mut self,
        pid: u16,
        nodespace: usize,
        gate_type: &str,
        node: usize,
    ) -> NetResult<()> {
        let pos = ACTIVATOR_GATE_TYPES
            .iter()
            .position(|&t| t == gate_type)
            .ok_or_else(|| {
                NetError::Configuration(format!(
                    "gate type {gate_type:?} cannot be activator-controlled"
                ))
            })?;
        partition_entry(&mut self.partitions, pid)?.set_activator(nodespace, pos + 1, node)
    }

    // -----------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------

    /// Creates or updates a link; weight 0 removes it. Both endpoints must
    /// live in the same partition.
    pub fn set_link_weight(
        &mut self,
        source_uid: &str,
        gate: &str,
        target_uid: &str,
        slot: &str,
        weight: f32,
    ) -> NetResult<()> {
        let (source_pid, source) = ids::parse_node_uid(source_uid)?;
        let (target_pid, target) = ids::parse_node_uid(target_uid)?;
        if source_pid != target_pid {
            return Err(NetError::Identifier(
                "links between partitions are not supported".into(),
            ));
        }
        partition_entry(&mut self.partitions, source_pid)?.set_link_weight(
            &self.catalog,
            source,
            gate,
            target,
            slot,
            weight,
        )
    }

    pub fn create_link(
        &mut self,
        source_uid: &str,
        gate: &str,
        target_uid: &str,
        slot: &str,
        weight: f32,
    ) -> NetResult<()> {
        self.set_link_weight(source_uid, gate, target_uid, slot, weight)
    }

    pub fn delete_link(
        &mut self,
        source_uid: &str,
        gate: &str,
        target_uid: &str,
        slot: &str,
    ) -> NetResult<()> {
        self.set_link_weight(source_uid, gate, target_uid, slot, 0.0)
    }

    pub fn get_link_weight(
        &self,
        source_uid: &str,
        gate: &str,
        target_uid: &str,
        slot: &str,
    ) -> NetResult<f32> {
        let (source_pid, source) = ids::parse_node_uid(source_uid)?;
        let (target_pid, target) = ids::parse_node_uid(target_uid)?;
        if source_pid != target_pid {
            return Err(NetError::Identifier(
                "links between partitions are not supported".into(),
            ));
        }
        self.partition(source_pid)?
            .link_weight(&self.catalog, source, gate, target, slot)
    }

    /// Every link the node participates in, outgoing first; self-loops are
    /// reported once.
    pub fn links_for_node(&self, uid: &str) -> NetResult<Vec<LinkView>> {
        let (pid, id) = ids::parse_node_uid(uid)?;
        let partition = self.partition(pid)?;
        let mut views = Vec::new();
        for record in partition.links_out(&self.catalog, id)? {
            views.push(link_view(pid, &record));
        }
        for record in partition.links_in(&self.catalog, id)? {
            if record.source_node != id {
                views.push(link_view(pid, &record));
            }
        }
        Ok(views)
    }

    // -----------------------------------------------------------------
    // Stepping, operators, modulators
    // -----------------------------------------------------------------

    /// Runs every enabled operator once, in priority order, then advances
    /// the step counter.
    pub fn step(&mut self) -> NetResult<()> {
        let mut operators = std::mem::take(&mut self.operators);
        let mut result = Ok(());
        for entry in operators.iter_mut() {
            if !entry.enabled {
                continue;
            }
            result = entry
                .op
                .execute(&mut self.partitions, &self.catalog, &mut self.modulators);
            if result.is_err() {
                break;
            }
        }
        self.operators = operators;
        result?;
        self.step += 1;
        tracing::debug!(step = self.step, "step complete");
        Ok(())
    }

    pub fn set_operator_enabled(&mut self, name: &str, enabled: bool) -> NetResult<()> {
        let entry = self
            .operators
            .iter_mut()
            .find(|entry| entry.op.name() == name)
            .ok_or_else(|| NetError::Configuration(format!("unknown operator {name:?}")))?;
        entry.enabled = enabled;
        Ok(())
    }

    /// Appends a custom operator, keeping the list sorted by priority.
    pub fn add_operator(&mut self, op: Box<dyn StepOperator>) {
        self.operators.push(OperatorEntry { op, enabled: true });
        self.operators.sort_by_key(|entry| entry.op.priority());
    }

    pub fn operator_names(&self) -> Vec<&'static str> {
        self.operators.iter().map(|entry| entry.op.name()).collect()
    }

    pub fn get_modulator(&self, name: &str) -> f32 {
        self.modulators.get(name)
    }

    pub fn set_modulator(&mut self, name: &str, value: f32) {
        self.modulators.set(name, value);
    }

    pub fn change_modulator(&mut self, name: &str, diff: f32) {
        self.modulators.change(name, diff);
    }

    pub fn modulators(&self) -> BTreeMap<String, f32> {
        self.modulators.snapshot()
    }

    // -----------------------------------------------------------------
    // World channel
    // -----------------------------------------------------------------

    /// Injects world readings into sensors and actuator feedback into
    /// actuator elements. Datasources without bound sensors are ignored.
    pub fn set_sensor_and_actuator_values(
        &mut self,
        datasources: &HashMap<String, f32>,
        datatarget_feedback: &HashMap<String, f32>,
    ) {
        for (datasource, &value) in datasources {
            if let Some(entries) = self.sensormap.get(datasource) {
                for &(pid, id) in entries {
                    if let Some(partition) = self.partitions.get_mut(&pid) {
                        partition.stage_sensor(id, value);
                    }
                }
            }
        }
        for (datatarget, &value) in datatarget_feedback {
            if let Some(entries) = self.actuatormap.get(datatarget) {
                for &(pid, id) in entries {
                    if let Some(partition) = self.partitions.get_mut(&pid) {
                        partition.write_gen_element(id, value);
                    }
                }
            }
        }
    }

    /// Sums actuator gen activations per datatarget.
    pub fn read_actuators(&self) -> BTreeMap<String, f32> {
        let mut readings = BTreeMap::new();
        for (datatarget, entries) in &self.actuatormap {
            let mut sum = 0.0;
            for &(pid, id) in entries {
                if let Some(partition) = self.partitions.get(&pid) {
                    sum += partition.read_gen_element(id);
                }
            }
            readings.insert(datatarget.clone(), sum);
        }
        readings
    }

    /// Uids of sensors bound to `datasource`, or all bound sensors, sorted.
    pub fn get_sensor_uids(&self, datasource: Option<&str>) -> Vec<String> {
        collect_bound_uids(&self.sensormap, datasource)
    }

    pub fn get_actuator_uids(&self, datatarget: Option<&str>) -> Vec<String> {
        collect_bound_uids(&self.actuatormap, datatarget)
    }

    // -----------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------

    /// Binds a named group to the `gate_type` elements of the given nodes,
    /// ordered by numeric index or display name.
    pub fn group_nodes_by_ids(
        &mut self,
        nodespace_uid: &str,
        node_uids: &[String],
        group_name: &str,
        gate_type: &str,
        sortby: GroupSort,
    ) -> NetResult<()> {
        let (pid, nodespace) = ids::parse_nodespace_uid(nodespace_uid)?;
        let mut members = Vec::with_capacity(node_uids.len());
        for uid in node_uids {
            let (node_pid, id) = ids::parse_node_uid(uid)?;
            if node_pid != pid {
                return Err(NetError::Identifier(format!(
                    "node {uid:?} is outside partition {pid}"
                )));
            }
            members.push((id, uid.as_str()));
        }
        match sortby {
            GroupSort::Id => members.sort_by_key(|&(id, _)| id),
            GroupSort::Name => members.sort_by(|a, b| {
                let name_a = self.names.get(a.1).map(String::as_str).unwrap_or_default();
                let name_b = self.names.get(b.1).map(String::as_str).unwrap_or_default();
                name_a.cmp(name_b).then(a.0.cmp(&b.0))
            }),
        }
        let elements = self.resolve_group_elements(pid, &members, gate_type)?;
        partition_entry(&mut self.partitions, pid)?.group(nodespace, group_name, elements)
    }

    /// Groups all nodes of a nodespace whose display name starts with
    /// `prefix`; the prefix becomes the group name and the members are
    /// ordered by name.
    pub fn group_nodes_by_prefix(
        &mut self,
        nodespace_uid: &str,
        prefix: &str,
        gate_type: &str,
    ) -> NetResult<()> {
        let (pid, nodespace) = ids::parse_nodespace_uid(nodespace_uid)?;
        let mut members: Vec<(usize, &str)> = Vec::new();
        {
            let partition = self.partition(pid)?;
            for (uid, name) in &self.names {
                if !name.starts_with(prefix) {
                    continue;
                }
                if let Ok((node_pid, id)) = ids::parse_node_uid(uid) {
                    if node_pid == pid
                        && partition.is_node(id)
                        && partition.node_parents[id] == nodespace
                    {
                        members.push((id, uid.as_str()));
                    }
                }
            }
        }
        members.sort_by(|a, b| {
            let name_a = self.names.get(a.1).map(String::as_str).unwrap_or_default();
            let name_b = self.names.get(b.1).map(String::as_str).unwrap_or_default();
            name_a.cmp(name_b).then(a.0.cmp(&b.0))
        });
        let elements = self.resolve_group_elements(pid, &members, gate_type)?;
        partition_entry(&mut self.partitions, pid)?.group(nodespace, prefix, elements)
    }

    fn resolve_group_elements(
        &self,
        pid: u16,
        members: &[(usize, &str)],
        gate_type: &str,
    ) -> NetResult<Vec<usize>> {
        let partition = self.partition(pid)?;
        let mut elements = Vec::with_capacity(members.len());
        for &(id, uid) in members {
            if !partition.is_node(id) {
                return Err(NetError::Identifier(format!("unknown node {uid:?}")));
            }
            let tag = partition.node_types[id];
            let nodetype = self
                .catalog
                .get(tag)
                .ok_or_else(|| NetError::Configuration(format!("unknown node type tag {tag}")))?;
            let pos = nodetype.gate_index(gate_type).ok_or_else(|| {
                NetError::Configuration(format!(
                    "type {:?} has no gate {gate_type:?}",
                    nodetype.name
                ))
            })?;
            elements.push(partition.element(id, pos));
        }
        Ok(elements)
    }

    pub fn ungroup(&mut self, nodespace_uid: &str, group_name: &str) -> NetResult<()> {
        let (pid, nodespace) = ids::parse_nodespace_uid(nodespace_uid)?;
        partition_entry(&mut self.partitions, pid)?.ungroup(nodespace, group_name)
    }

    pub fn get_activations(&self, nodespace_uid: &str, group_name: &str) -> NetResult<Vec<f32>> {
        let (pid, nodespace) = ids::parse_nodespace_uid(nodespace_uid)?;
        self.partition(pid)?.get_activations(nodespace, group_name)
    }

    pub fn set_activations(
        &mut self,
        nodespace_uid: &str,
        group_name: &str,
        values: &[f32],
    ) -> NetResult<()> {
        let (pid, nodespace) = ids::parse_nodespace_uid(nodespace_uid)?;
        partition_entry(&mut self.partitions, pid)?.set_activations(nodespace, group_name, values)
    }

    pub fn get_thresholds(&self, nodespace_uid: &str, group_name: &str) -> NetResult<Vec<f32>> {
        let (pid, nodespace) = ids::parse_nodespace_uid(nodespace_uid)?;
        self.partition(pid)?.get_thresholds(nodespace, group_name)
    }

    pub fn set_thresholds(
        &mut self,
        nodespace_uid: &str,
        group_name: &str,
        values: &[f32],
    ) -> NetResult<()> {
        let (pid, nodespace) = ids::parse_nodespace_uid(nodespace_uid)?;
        partition_entry(&mut self.partitions, pid)?.set_thresholds(nodespace, group_name, values)
    }

    /// Weight block from group `from` to group `to`, row-major, one row per
    /// target element.
    pub fn get_link_weights(
        &self,
        nodespace_from_uid: &str,
        from: &str,
        nodespace_to_uid: &str,
        to: &str,
    ) -> NetResult<Vec<f32>> {
        let (pid_from, ns_from) = ids::parse_nodespace_uid(nodespace_from_uid)?;
        let (pid_to, ns_to) = ids::parse_nodespace_uid(nodespace_to_uid)?;
        if pid_from != pid_to {
            return Err(NetError::Identifier(
                "links between partitions are not supported".into(),
            ));
        }
        self.partition(pid_from)?
            .get_link_weights(ns_from, from, ns_to, to)
    }

    pub fn set_link_weights(
        &mut self,
        nodespace_from_uid: &str,
        from: &str,
        nodespace_to_uid: &str,
        to: &str,
        weights: &[f32],
    ) -> NetResult<()> {
        let (pid_from, ns_from) = ids::parse_nodespace_uid(nodespace_from_uid)?;
        let (pid_to, ns_to) = ids::parse_nodespace_uid(nodespace_to_uid)?;
        if pid_from != pid_to {
            return Err(NetError::Identifier(
                "links between partitions are not supported".into(),
            ));
        }
        partition_entry(&mut self.partitions, pid_from)?
            .set_link_weights(ns_from, from, ns_to, to, weights)
    }

    // -----------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------

    pub fn register_nodetype(&mut self, def: &NodetypeDef) -> NetResult<()> {
        self.catalog.register(def)?;
        self.registered_defs.push(def.clone());
        Ok(())
    }

    /// Swaps in a new set of registered type definitions and reconciles all
    /// live nodes the way a load does: nodes whose type name disappeared
    /// are dropped, nodes whose element count changed are recreated in
    /// place with links lost.
    pub fn reload_nodetypes(&mut self, defs: &[NodetypeDef]) -> NetResult<LoadReport> {
        let new_catalog = TypeCatalog::with_registered(defs)?;
        let old_types: HashMap<u16, String> = self.catalog.tag_table().into_iter().collect();
        let mut staged = self.partitions.clone();
        let mut report = LoadReport::default();
        let pids: Vec<u16> = staged.keys().copied().collect();
        for pid in pids {
            remap_partition_types(&mut staged, pid, &old_types, &new_catalog, &mut report)?;
        }
        self.partitions = staged;
        self.catalog = new_catalog;
        self.registered_defs = defs.to_vec();
        self.prune_world_maps();
        self.prune_records();
        Ok(report)
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    fn blob_path(metadata_path: &Path, uid: &str, pid: u16) -> PathBuf {
        let dir = metadata_path.parent().unwrap_or_else(|| Path::new(""));
        dir.join(format!("{uid}-data-{pid:03}.nnb"))
    }

    /// Writes the metadata JSON to `path` and one binary blob per partition
    /// beside it.
    pub fn save(&self, path: &Path) -> NetResult<()> {
        let metadata = Metadata {
            version: METADATA_VERSION,
            uid: self.uid.clone(),
            name: self.name.clone(),
            current_step: self.step,
            partitions: self.partitions.keys().copied().collect(),
            names: to_sorted(&self.names),
            positions: to_sorted(&self.positions),
            sensormap: to_sorted(&self.sensormap),
            actuatormap: to_sorted(&self.actuatormap),
            modulators: self.modulators.snapshot(),
            nodes: self
                .node_extras
                .iter()
                .filter(|(_, extras)| !extras.is_empty())
                .map(|(uid, extras)| (uid.clone(), extras.clone()))
                .collect(),
        };
        fs::write(path, serde_json::to_string_pretty(&metadata)?)?;

        for (&pid, partition) in &self.partitions {
            let blob_path = Self::blob_path(path, &self.uid, pid);
            let file = fs::File::create(&blob_path)?;
            let mut writer = BufWriter::new(file);
            partition.write_blob_to(&mut writer, &self.catalog)?;
            writer.flush()?;
        }
        tracing::info!(uid = %self.uid, path = %path.display(), "nodenet saved");
        Ok(())
    }

    /// Restores a previously saved net. Everything is staged and reconciled
    /// against the current type catalog before any of it is committed, so a
    /// failed load leaves the current state intact.
    pub fn load(&mut self, path: &Path) -> NetResult<LoadReport> {
        let metadata: Metadata = serde_json::from_str(&fs::read_to_string(path)?)?;
        if metadata.version != METADATA_VERSION {
            return Err(NetError::Persistence(format!(
                "unsupported metadata version {}",
                metadata.version
            )));
        }

        let mut loaded: BTreeMap<u16, Partition> = BTreeMap::new();
        let mut report = LoadReport::default();
        for &pid in &metadata.partitions {
            let blob_path = Self::blob_path(path, &metadata.uid, pid);
            let file = fs::File::open(&blob_path)?;
            let (partition, table) = Partition::read_blob_from(&mut BufReader::new(file))?;
            if partition.pid() != pid {
                return Err(NetError::Persistence(format!(
                    "blob {} carries partition {} instead of {pid}",
                    blob_path.display(),
                    partition.pid()
                )));
            }
            // Saved tags are remapped by type name; numeric tags are not
            // stable across registrations.
            let old_types: HashMap<u16, String> = table.into_iter().collect();
            loaded.insert(pid, partition);
            remap_partition_types(&mut loaded, pid, &old_types, &self.catalog, &mut report)?;
        }

        self.partitions = loaded;
        self.uid = metadata.uid;
        self.name = metadata.name;
        self.step = metadata.current_step;
        self.next_partition = self
            .partitions
            .keys()
            .copied()
            .max()
            .map(|pid| pid + 1)
            .unwrap_or(1);
        self.modulators.restore(metadata.modulators);
        self.node_extras = metadata.nodes.into_iter().collect();
        self.names = metadata.names.into_iter().collect();
        self.positions = metadata.positions.into_iter().collect();
        self.sensormap = metadata.sensormap.into_iter().collect();
        self.actuatormap = metadata.actuatormap.into_iter().collect();
        self.prune_world_maps();
        self.prune_records();

        tracing::info!(
            uid = %self.uid,
            step = self.step,
            dropped = report.dropped.len(),
            recreated = report.recreated.len(),
            "nodenet loaded"
        );
        Ok(report)
    }

    /// Drops sensor/actuator entries whose nodes no longer exist and
    /// rebuilds the inverted maps.
    fn prune_world_maps(&mut self) {
        let partitions = &self.partitions;
        for map in [&mut self.sensormap, &mut self.actuatormap] {
            for entries in map.values_mut() {
                entries.retain(|&(pid, id)| partitions.get(&pid).is_some_and(|p| p.is_node(id)));
            }
            map.retain(|_, entries| !entries.is_empty());
        }
        self.inverted_sensor_map = invert_world_map(&self.sensormap);
        self.inverted_actuator_map = invert_world_map(&self.actuatormap);
    }

    /// Drops names, positions and extras whose entity no longer exists.
    fn prune_records(&mut self) {
        let partitions = &self.partitions;
        let alive = |uid: &str| -> bool {
            if let Ok((pid, id)) = ids::parse_node_uid(uid) {
                return partitions.get(&pid).is_some_and(|p| p.is_node(id));
            }
            if let Ok((pid, id)) = ids::parse_nodespace_uid(uid) {
                return partitions.get(&pid).is_some_and(|p| p.is_nodespace(id));
            }
            false
        };
        self.names.retain(|uid, _| alive(uid));
        self.positions.retain(|uid, _| alive(uid));
        self.node_extras.retain(|uid, _| alive(uid));
    }
}

fn partition_entry(
    partitions: &mut BTreeMap<u16, Partition>,
    pid: u16,
) -> NetResult<&mut Partition> {
    partitions
        .get_mut(&pid)
        .ok_or_else(|| NetError::Identifier(format!("unknown partition {pid}")))
}

/// Reconciles one partition's numeric type tags against `new_catalog`,
/// resolving saved tags through `old_types` by name.
fn remap_partition_types(
    partitions: &mut BTreeMap<u16, Partition>,
    pid: u16,
    old_types: &HashMap<u16, String>,
    new_catalog: &TypeCatalog,
    report: &mut LoadReport,
) -> NetResult<()> {
    enum Action {
        Retag(u16),
        Recreate { tag: u16, nodespace: usize },
        Drop { former_type: String },
    }

    let mut pending: Vec<(usize, String, Action)> = Vec::new();
    {
        let partition = partitions
            .get(&pid)
            .ok_or_else(|| NetError::Identifier(format!("unknown partition {pid}")))?;
        for id in partition.node_ids() {
            let old_tag = partition.node_types[id];
            let uid = ids::node_uid(pid, id);
            let Some(type_name) = old_types.get(&old_tag) else {
                pending.push((
                    id,
                    uid,
                    Action::Drop {
                        former_type: format!("tag {old_tag}"),
                    },
                ));
                continue;
            };
            match new_catalog.tag_of(type_name) {
                None => pending.push((
                    id,
                    uid,
                    Action::Drop {
                        former_type: type_name.clone(),
                    },
                )),
                Some(new_tag) => {
                    let old_elements = partition.node_element_counts[id] as usize;
                    if new_catalog.elements(new_tag) != old_elements {
                        pending.push((
                            id,
                            uid,
                            Action::Recreate {
                                tag: new_tag,
                                nodespace: partition.node_parents[id],
                            },
                        ));
                    } else if new_tag != old_tag {
                        pending.push((id, uid, Action::Retag(new_tag)));
                    }
                }
            }
        }
    }

    let partition = partition_entry(partitions, pid)?;
    for (id, uid, action) in pending {
        match action {
            Action::Retag(tag) => {
                partition.node_types[id] = tag;
            }
            Action::Recreate { tag, nodespace } => {
                tracing::warn!(
                    uid = %uid,
                    "node type changed its element count, recreating; links are lost"
                );
                partition.delete_node(id)?;
                partition.create_node(
                    new_catalog,
                    tag,
                    nodespace,
                    NodeInit {
                        requested_index: Some(id),
                        ..Default::default()
                    },
                )?;
                report.recreated.push(uid);
            }
            Action::Drop { former_type } => {
                tracing::warn!(
                    uid = %uid,
                    former_type = %former_type,
                    "node type no longer exists, dropping node"
                );
                partition.delete_node(id)?;
                report.dropped.push((uid, former_type));
            }
        }
    }
    Ok(())
}

fn generate_uid() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("nodenet{nanos:x}")
}

fn link_view(pid: u16, record: &LinkRecord) -> LinkView {
    LinkView {
        source_uid: ids::node_uid(pid, record.source_node),
        source_gate: record.source_gate.clone(),
        target_uid: ids::node_uid(pid, record.target_node),
        target_slot: record.target_slot.clone(),
        weight: record.weight,
    }
}

fn to_sorted<V: Clone>(map: &HashMap<String, V>) -> BTreeMap<String, V> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn collect_bound_uids(
    map: &HashMap<String, Vec<(u16, usize)>>,
    filter: Option<&str>,
) -> Vec<String> {
    let mut uids: Vec<String> = match filter {
        Some(name) => map
            .get(name)
            .into_iter()
            .flatten()
            .map(|&(pid, id)| ids::node_uid(pid, id))
            .collect(),
        None => map
            .values()
            .flatten()
            .map(|&(pid, id)| ids::node_uid(pid, id))
            .collect(),
    };
    uids.sort();
    uids.dedup();
    uids
}

fn invert_world_map(map: &HashMap<String, Vec<(u16, usize)>>) -> HashMap<String, String> {
    let mut inverted = HashMap::new();
    for (name, entries) in map {
        for &(pid, id) in entries {
            inverted.insert(ids::node_uid(pid, id), name.clone());
        }
    }
    inverted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> NetConfig {
        NetConfig {
            uid: Some("testnet".into()),
            name: "test".into(),
            initial_nodes: 32,
            average_elements_per_node: 4,
            initial_nodespaces: 4,
            sparse_links: true,
        }
    }

    fn net() -> Nodenet {
        Nodenet::new(small_config(), &[]).unwrap()
    }

    fn widget_def(gates: &[&str]) -> NodetypeDef {
        NodetypeDef {
            name: "Widget".into(),
            slots: vec!["gen".into()],
            gates: gates.iter().map(|g| g.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn single_link_step_scenario() {
        let mut net = net();
        let root = net.root_nodespace_uid();
        let a = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();
        let b = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();
        net.create_link(&a, "gen", &b, "gen", 0.5).unwrap();
        net.set_node_activation(&a, 1.0).unwrap();

        net.step().unwrap();

        assert_eq!(net.current_step(), 1);
        assert!((net.get_node_activation(&b).unwrap() - 0.5).abs() < 1e-6);
        assert_eq!(net.get_node_activation(&a).unwrap(), 0.0);
    }

    #[test]
    fn uids_follow_the_codec() {
        let mut net = net();
        let root = net.root_nodespace_uid();
        assert_eq!(root, "s0001");
        let first = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();
        assert_eq!(first, "n0001");

        let chosen = net
            .create_node(
                "Register",
                &root,
                NodeOptions {
                    uid: Some("n0007"),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(chosen, "n0007");

        let err = net
            .create_node(
                "Register",
                &root,
                NodeOptions {
                    uid: Some("n0007"),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, NetError::Identifier(_)));

        // The partition digits of a requested uid must match the nodespace.
        let err = net
            .create_node(
                "Register",
                &root,
                NodeOptions {
                    uid: Some("n0038"),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, NetError::Identifier(_)));
    }

    #[test]
    fn node_view_reflects_arena_state() {
        let mut net = net();
        let root = net.root_nodespace_uid();
        let mut parameters = HashMap::new();
        parameters.insert("expectation".to_string(), Value::from(2));
        let uid = net
            .create_node(
                "Pipe",
                &root,
                NodeOptions {
                    name: Some("driver"),
                    position: Some((10.0, 4.5)),
                    parameters: Some(&parameters),
                    ..Default::default()
                },
            )
            .unwrap();

        let view = net.get_node(&uid).unwrap();
        assert_eq!(view.nodetype, "Pipe");
        assert_eq!(view.parent_nodespace, root);
        assert_eq!(view.name.as_deref(), Some("driver"));
        assert_eq!(view.position, Some((10.0, 4.5)));
        assert_eq!(view.gate_activations.len(), 7);
        assert_eq!(view.parameters.get("expectation"), Some(&Value::from(2)));
        assert_eq!(view.parameters.get("wait"), Some(&Value::from(10u16)));

        net.set_node_parameter(&uid, "wait", Value::from(3)).unwrap();
        let view = net.get_node(&uid).unwrap();
        assert_eq!(view.parameters.get("wait"), Some(&Value::from(3u16)));

        assert!(net.get_node("n00099").is_err());
    }

    #[test]
    fn nodespace_hierarchy_and_views() {
        let mut net = net();
        let root = net.root_nodespace_uid();
        let child = net
            .create_nodespace(
                &root,
                NodespaceOptions {
                    name: Some("workspace"),
                    ..Default::default()
                },
            )
            .unwrap();
        let view = net.get_nodespace(&child).unwrap();
        assert_eq!(view.parent_nodespace.as_deref(), Some(root.as_str()));
        assert_eq!(view.name.as_deref(), Some("workspace"));

        let root_view = net.get_nodespace(&root).unwrap();
        assert_eq!(root_view.parent_nodespace, None);

        let err = net.delete_nodespace(&root).unwrap_err();
        assert!(matches!(err, NetError::Illegal(_)));

        let inner = net
            .create_node("Register", &child, NodeOptions::default())
            .unwrap();
        net.delete_nodespace(&child).unwrap();
        assert!(!net.is_node(&inner));
        assert!(!net.is_nodespace(&child));
    }

    #[test]
    fn cross_partition_links_fail_without_mutation() {
        let mut net = net();
        let root = net.root_nodespace_uid();
        let pid = net.create_partition().unwrap();
        assert_eq!(pid, 1);
        let other_root = ids::nodespace_uid(pid, ROOT_NODESPACE);

        let a = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();
        let b = net
            .create_node("Register", &other_root, NodeOptions::default())
            .unwrap();
        assert_eq!(b, "n0011");

        let err = net.set_link_weight(&a, "gen", &b, "gen", 1.0).unwrap_err();
        assert!(matches!(err, NetError::Identifier(_)));
        assert!(net.links_for_node(&a).unwrap().is_empty());
        assert!(net.links_for_node(&b).unwrap().is_empty());
    }

    #[test]
    fn partition_tags_stop_where_uids_stay_unambiguous() {
        let mut net = net();
        for expected in 1..=ids::MAX_PARTITION {
            assert_eq!(net.create_partition().unwrap(), expected);
        }
        let err = net.create_partition().unwrap_err();
        assert!(matches!(err, NetError::Capacity(_)));
        assert_eq!(net.partition_ids().len(), ids::MAX_PARTITION as usize + 1);

        // The last admissible partition is reachable through its own handles.
        assert!(net.is_nodespace("s9991"));
        let node = net
            .create_node("Register", "s9991", NodeOptions::default())
            .unwrap();
        assert_eq!(node, "n9991");
        assert!(net.is_node(&node));
        assert_eq!(net.get_node(&node).unwrap().parent_nodespace, "s9991");
    }

    #[test]
    fn links_enumerate_and_disappear_with_nodes() {
        let mut net = net();
        let root = net.root_nodespace_uid();
        let a = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();
        let b = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();
        net.create_link(&a, "gen", &b, "gen", 0.4).unwrap();
        net.create_link(&b, "gen", &a, "gen", -0.4).unwrap();

        let links = net.links_for_node(&a).unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.iter().any(|l| l.source_uid == a && l.weight == 0.4));
        assert!(links.iter().any(|l| l.source_uid == b && l.weight == -0.4));

        net.delete_link(&a, "gen", &b, "gen").unwrap();
        assert_eq!(net.links_for_node(&a).unwrap().len(), 1);

        net.delete_node(&b).unwrap();
        assert!(net.links_for_node(&a).unwrap().is_empty());

        // Index reuse must not resurrect old links.
        let reborn = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();
        assert_eq!(reborn, b);
        assert!(net.links_for_node(&reborn).unwrap().is_empty());
    }

    #[test]
    fn sensors_and_actuators_round_trip_world_values() {
        let mut net = net();
        let root = net.root_nodespace_uid();
        let mut sensor_params = HashMap::new();
        sensor_params.insert("datasource".to_string(), Value::from("light"));
        let sensor = net
            .create_node(
                "Sensor",
                &root,
                NodeOptions {
                    parameters: Some(&sensor_params),
                    ..Default::default()
                },
            )
            .unwrap();
        let mut actuator_params = HashMap::new();
        actuator_params.insert("datatarget".to_string(), Value::from("motor"));
        let actuator = net
            .create_node(
                "Actuator",
                &root,
                NodeOptions {
                    parameters: Some(&actuator_params),
                    ..Default::default()
                },
            )
            .unwrap();
        net.create_link(&sensor, "gen", &actuator, "gen", 1.0)
            .unwrap();

        assert_eq!(net.get_sensor_uids(Some("light")), vec![sensor.clone()]);
        assert_eq!(net.get_actuator_uids(None), vec![actuator.clone()]);

        let mut readings = HashMap::new();
        readings.insert("light".to_string(), 0.9);
        net.set_sensor_and_actuator_values(&readings, &HashMap::new());
        net.step().unwrap();
        net.step().unwrap();

        let actuators = net.read_actuators();
        assert!((actuators["motor"] - 0.9).abs() < 1e-6);

        // Feedback writes land on the actuator element immediately.
        let mut feedback = HashMap::new();
        feedback.insert("motor".to_string(), 0.25);
        net.set_sensor_and_actuator_values(&HashMap::new(), &feedback);
        assert!((net.get_node_activation(&actuator).unwrap() - 0.25).abs() < 1e-6);

        // Binding a non-sensor is rejected.
        let register = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();
        assert!(matches!(
            net.set_node_parameter(&register, "datasource", Value::from("light")),
            Err(NetError::Configuration(_))
        ));

        net.delete_node(&sensor).unwrap();
        assert!(net.get_sensor_uids(None).is_empty());
    }

    #[test]
    fn activator_parameter_registers_nodespace_factor() {
        let mut net = net();
        let root = net.root_nodespace_uid();
        let activator = net
            .create_node("Activator", &root, NodeOptions::default())
            .unwrap();
        net.set_node_parameter(&activator, "type", Value::from("sub"))
            .unwrap();
        let view = net.get_node(&activator).unwrap();
        assert_eq!(view.parameters.get("type"), Some(&Value::from("sub")));

        let err = net
            .set_node_parameter(&activator, "type", Value::from("gen"))
            .unwrap_err();
        assert!(matches!(err, NetError::Configuration(_)));

        net.set_nodespace_gatetype_activator(&root, "sub", None)
            .unwrap();
        net.set_nodespace_gatetype_activator(&root, "sub", Some(activator.as_str()))
            .unwrap();
    }

    #[test]
    fn groups_align_with_sort_order() {
        let mut net = net();
        let root = net.root_nodespace_uid();
        let mut uids = Vec::new();
        for name in ["gamma", "alpha", "beta"] {
            uids.push(
                net.create_node(
                    "Register",
                    &root,
                    NodeOptions {
                        name: Some(name),
                        ..Default::default()
                    },
                )
                .unwrap(),
            );
        }

        net.group_nodes_by_ids(&root, &uids, "by_id", "gen", GroupSort::Id)
            .unwrap();
        net.group_nodes_by_ids(&root, &uids, "by_name", "gen", GroupSort::Name)
            .unwrap();

        for (uid, value) in uids.iter().zip([0.3, 0.1, 0.2]) {
            net.set_node_activation(uid, value).unwrap();
        }
        // By id: creation order gamma, alpha, beta.
        assert_eq!(
            net.get_activations(&root, "by_id").unwrap(),
            vec![0.3, 0.1, 0.2]
        );
        // By name: alpha, beta, gamma.
        assert_eq!(
            net.get_activations(&root, "by_name").unwrap(),
            vec![0.1, 0.2, 0.3]
        );

        net.set_thresholds(&root, "by_name", &[0.5, 0.6, 0.7])
            .unwrap();
        assert_eq!(
            net.get_thresholds(&root, "by_name").unwrap(),
            vec![0.5, 0.6, 0.7]
        );

        net.ungroup(&root, "by_id").unwrap();
        assert!(matches!(
            net.get_activations(&root, "by_id"),
            Err(NetError::Identifier(_))
        ));
    }

    #[test]
    fn prefix_groups_collect_matching_names() {
        let mut net = net();
        let root = net.root_nodespace_uid();
        for name in ["in_2", "in_1", "out_1"] {
            net.create_node(
                "Register",
                &root,
                NodeOptions {
                    name: Some(name),
                    ..Default::default()
                },
            )
            .unwrap();
        }
        net.group_nodes_by_prefix(&root, "in_", "gen").unwrap();
        assert_eq!(net.get_activations(&root, "in_").unwrap().len(), 2);

        net.set_activations(&root, "in_", &[0.4, 0.8]).unwrap();
        // Members are ordered by name: in_1 before in_2.
        let in_1 = net
            .node_uids()
            .into_iter()
            .find(|uid| net.get_node(uid).unwrap().name.as_deref() == Some("in_1"))
            .unwrap();
        assert!((net.get_node_activation(&in_1).unwrap() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn group_weight_blocks_read_and_write() {
        let mut net = net();
        let root = net.root_nodespace_uid();
        let sources: Vec<String> = (0..2)
            .map(|_| {
                net.create_node("Register", &root, NodeOptions::default())
                    .unwrap()
            })
            .collect();
        let targets: Vec<String> = (0..2)
            .map(|_| {
                net.create_node("Register", &root, NodeOptions::default())
                    .unwrap()
            })
            .collect();
        net.group_nodes_by_ids(&root, &sources, "from", "gen", GroupSort::Id)
            .unwrap();
        net.group_nodes_by_ids(&root, &targets, "to", "gen", GroupSort::Id)
            .unwrap();

        net.set_link_weights(&root, "from", &root, "to", &[0.1, 0.2, 0.3, 0.4])
            .unwrap();
        assert_eq!(
            net.get_link_weights(&root, "from", &root, "to").unwrap(),
            vec![0.1, 0.2, 0.3, 0.4]
        );
        assert_eq!(
            net.get_link_weight(&sources[1], "gen", &targets[0], "gen")
                .unwrap(),
            0.2
        );
    }

    #[test]
    fn operator_toggle_and_custom_operator() {
        struct Stamp;
        impl StepOperator for Stamp {
            fn priority(&self) -> u32 {
                50
            }
            fn name(&self) -> &'static str {
                "stamp"
            }
            fn execute(
                &mut self,
                _partitions: &mut BTreeMap<u16, Partition>,
                _catalog: &TypeCatalog,
                modulators: &mut Modulators,
            ) -> NetResult<()> {
                modulators.change("stamp_count", 1.0);
                Ok(())
            }
        }

        let mut net = net();
        let root = net.root_nodespace_uid();
        let a = net.create_node("Pipe", &root, NodeOptions::default()).unwrap();
        let b = net.create_node("Pipe", &root, NodeOptions::default()).unwrap();
        net.create_link(&a, "por", &b, "por", 0.8).unwrap();
        net.set_modulator("por_ret_decay", 0.5);

        net.set_operator_enabled("por_ret_decay", false).unwrap();
        net.step().unwrap();
        assert_eq!(net.get_link_weight(&a, "por", &b, "por").unwrap(), 0.8);

        net.set_operator_enabled("por_ret_decay", true).unwrap();
        net.step().unwrap();
        assert!((net.get_link_weight(&a, "por", &b, "por").unwrap() - 0.4).abs() < 1e-6);

        assert!(matches!(
            net.set_operator_enabled("nonexistent", true),
            Err(NetError::Configuration(_))
        ));

        net.add_operator(Box::new(Stamp));
        assert_eq!(net.operator_names()[0], "stamp");
        net.step().unwrap();
        assert_eq!(net.get_modulator("stamp_count"), 1.0);
    }

    #[test]
    fn modulator_facade_roundtrip() {
        let mut net = net();
        assert_eq!(net.get_modulator("por_ret_decay"), 0.0);
        assert_eq!(net.get_modulator("unknown"), 1.0);
        net.change_modulator("base_urge_change", 0.5);
        assert_eq!(net.get_modulator("base_urge_change"), 0.5);
        net.set_modulator("base_urge_change", -0.25);
        assert_eq!(net.get_modulator("base_urge_change"), -0.25);
        assert!(net.modulators().contains_key("por_ret_decay"));
    }

    #[test]
    fn save_load_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");

        let mut net = net();
        let root = net.root_nodespace_uid();
        let register = net
            .create_node(
                "Register",
                &root,
                NodeOptions {
                    name: Some("reg"),
                    position: Some((1.0, 2.0)),
                    ..Default::default()
                },
            )
            .unwrap();
        let mut sensor_params = HashMap::new();
        sensor_params.insert("datasource".to_string(), Value::from("light"));
        let sensor = net
            .create_node(
                "Sensor",
                &root,
                NodeOptions {
                    parameters: Some(&sensor_params),
                    ..Default::default()
                },
            )
            .unwrap();
        let mut actuator_params = HashMap::new();
        actuator_params.insert("datatarget".to_string(), Value::from("motor"));
        let actuator = net
            .create_node(
                "Actuator",
                &root,
                NodeOptions {
                    parameters: Some(&actuator_params),
                    ..Default::default()
                },
            )
            .unwrap();
        let pipe = net.create_node("Pipe", &root, NodeOptions::default()).unwrap();
        let activator = net
            .create_node("Activator", &root, NodeOptions::default())
            .unwrap();
        net.set_node_parameter(&activator, "type", Value::from("por"))
            .unwrap();
        let mut comment_params = HashMap::new();
        comment_params.insert("comment".to_string(), Value::from("calibration rig"));
        let comment = net
            .create_node(
                "Comment",
                &root,
                NodeOptions {
                    parameters: Some(&comment_params),
                    ..Default::default()
                },
            )
            .unwrap();

        net.create_link(&register, "gen", &pipe, "gen", 0.6).unwrap();
        net.create_link(&sensor, "gen", &actuator, "gen", 1.0).unwrap();
        net.group_nodes_by_ids(
            &root,
            &[register.clone(), pipe.clone()],
            "pair",
            "gen",
            GroupSort::Id,
        )
        .unwrap();
        net.set_modulator("por_ret_decay", 0.05);
        let mut readings = HashMap::new();
        readings.insert("light".to_string(), 0.7);
        net.set_sensor_and_actuator_values(&readings, &HashMap::new());
        net.step().unwrap();
        net.save(&path).unwrap();

        let mut restored = Nodenet::new(small_config(), &[]).unwrap();
        let report = restored.load(&path).unwrap();
        assert!(report.is_clean());

        assert_eq!(restored.uid(), net.uid());
        assert_eq!(restored.current_step(), 1);
        assert_eq!(restored.node_uids(), net.node_uids());
        assert_eq!(
            restored
                .get_link_weight(&register, "gen", &pipe, "gen")
                .unwrap(),
            0.6
        );
        assert_eq!(
            restored.get_node(&register).unwrap().position,
            Some((1.0, 2.0))
        );
        assert_eq!(
            restored.get_node(&register).unwrap().name.as_deref(),
            Some("reg")
        );
        assert_eq!(restored.get_modulator("por_ret_decay"), 0.05);
        assert_eq!(
            restored.get_node(&comment).unwrap().parameters.get("comment"),
            Some(&Value::from("calibration rig"))
        );
        assert_eq!(restored.get_sensor_uids(Some("light")), vec![sensor.clone()]);
        assert_eq!(
            restored.get_activations(&root, "pair").unwrap(),
            net.get_activations(&root, "pair").unwrap()
        );
        // Staged sensor values survive, so stepping keeps flowing.
        restored.step().unwrap();
        assert!((restored.get_node_activation(&actuator).unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn load_drops_nodes_of_vanished_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");

        let defs = vec![widget_def(&["gen"])];
        let mut net = Nodenet::new(small_config(), &defs).unwrap();
        let root = net.root_nodespace_uid();
        let keeper = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();
        let widget = net
            .create_node("Widget", &root, NodeOptions::default())
            .unwrap();
        net.save(&path).unwrap();

        let mut restored = Nodenet::new(small_config(), &[]).unwrap();
        let report = restored.load(&path).unwrap();
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].0, widget);
        assert_eq!(report.dropped[0].1, "Widget");
        assert!(!restored.is_node(&widget));
        assert!(restored.is_node(&keeper));
    }

    #[test]
    fn load_recreates_nodes_when_element_count_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");

        let mut net = Nodenet::new(small_config(), &[widget_def(&["gen"])]).unwrap();
        let root = net.root_nodespace_uid();
        let widget = net
            .create_node("Widget", &root, NodeOptions::default())
            .unwrap();
        net.set_node_parameter(&widget, "mode", Value::from("fast"))
            .unwrap();
        let feeder = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();
        net.create_link(&feeder, "gen", &widget, "gen", 0.9).unwrap();
        net.save(&path).unwrap();

        // Same type name, one more gate: the element block no longer fits.
        let mut restored = Nodenet::new(small_config(), &[widget_def(&["gen", "aux"])]).unwrap();
        let report = restored.load(&path).unwrap();
        assert_eq!(report.recreated, vec![widget.clone()]);
        assert!(restored.is_node(&widget));
        let view = restored.get_node(&widget).unwrap();
        assert_eq!(view.gate_activations.len(), 2);
        assert_eq!(view.parameters.get("mode"), Some(&Value::from("fast")));
        assert!(restored.links_for_node(&widget).unwrap().is_empty());
    }

    #[test]
    fn reload_nodetypes_applies_remap_rules_live() {
        let mut net = Nodenet::new(small_config(), &[widget_def(&["gen"])]).unwrap();
        let root = net.root_nodespace_uid();
        let widget = net
            .create_node("Widget", &root, NodeOptions::default())
            .unwrap();
        let keeper = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();

        let report = net.reload_nodetypes(&[widget_def(&["gen", "aux"])]).unwrap();
        assert_eq!(report.recreated, vec![widget.clone()]);
        assert_eq!(net.get_node(&widget).unwrap().gate_activations.len(), 2);

        let report = net.reload_nodetypes(&[]).unwrap();
        assert_eq!(report.dropped.len(), 1);
        assert!(!net.is_node(&widget));
        assert!(net.is_node(&keeper));
    }

    #[test]
    fn failed_load_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");
        std::fs::write(&path, "not json at all").unwrap();

        let mut net = net();
        let root = net.root_nodespace_uid();
        let survivor = net
            .create_node("Register", &root, NodeOptions::default())
            .unwrap();
        assert!(matches!(net.load(&path), Err(NetError::Persistence(_))));
        assert!(net.is_node(&survivor));

        // Valid metadata whose blob is missing must also fail cleanly.
        let mut other = Nodenet::new(small_config(), &[]).unwrap();
        other.save(&path).unwrap();
        std::fs::remove_file(dir.path().join(format!("{}-data-000.nnb", other.uid()))).unwrap();
        assert!(matches!(net.load(&path), Err(NetError::Persistence(_))));
        assert!(net.is_node(&survivor));
    }

    #[test]
    fn announce_and_growth_yield_identical_nets() {
        let build = |announced: bool| {
            let mut net = Nodenet::new(
                NetConfig {
                    uid: Some("grow".into()),
                    initial_nodes: 2,
                    average_elements_per_node: 1,
                    initial_nodespaces: 2,
                    ..NetConfig::default()
                },
                &[],
            )
            .unwrap();
            let root = net.root_nodespace_uid();
            if announced {
                net.announce_nodes(0, 30, 7).unwrap();
            }
            let uids: Vec<String> = (0..30)
                .map(|_| {
                    net.create_node("Pipe", &root, NodeOptions::default())
                        .unwrap()
                })
                .collect();
            for pair in uids.windows(2) {
                net.create_link(&pair[0], "por", &pair[1], "por", 0.5)
                    .unwrap();
            }
            net
        };
        let grown = build(false);
        let announced = build(true);
        assert_eq!(grown.node_uids(), announced.node_uids());
        for (a, b) in grown
            .node_uids()
            .windows(2)
            .zip(announced.node_uids().windows(2))
        {
            assert_eq!(
                grown.get_link_weight(&a[0], "por", &a[1], "por").unwrap(),
                announced
                    .get_link_weight(&b[0], "por", &b[1], "por")
                    .unwrap()
            );
        }
    }
}
