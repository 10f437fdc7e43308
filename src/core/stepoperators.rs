//! Step pipeline.
//!
//! A step runs every operator once, in ascending priority order, against
//! all partitions and the shared modulator table. Each operator leaves the
//! activation vectors and the link matrices fully consistent before the
//! next one runs.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::error::{NetError, NetResult};
use crate::matrix::DECAY_EPSILON;
use crate::nodetype::{TypeCatalog, ACTIVATOR_GATE_TYPES, COMMENT, GEN};
use crate::partition::Partition;

pub const PRIORITY_PROPAGATE: u32 = 100;
pub const PRIORITY_CALCULATE: u32 = 200;
pub const PRIORITY_POR_RET_DECAY: u32 = 300;
pub const PRIORITY_EMOTIONAL_MODULATORS: u32 = 1000;

const COMPETENCE_ADAPTATION: f32 = 0.1;
const JOY_DECAY: f32 = 0.01;

/// Modulators the emotional update seeds before its first computation.
const MODULATOR_SEEDS: [(&str, f32); 14] = [
    ("emo_pleasure", 0.0),
    ("emo_activation", 0.0),
    ("emo_securing_rate", 0.0),
    ("emo_resolution", 1.0),
    ("emo_selection_threshold", 0.0),
    ("emo_competence", 0.5),
    ("emo_sustaining_joy", 0.0),
    ("base_sum_importance_of_intentions", 0.0),
    ("base_sum_urgency_of_intentions", 0.0),
    ("base_number_of_active_motives", 1.0),
    ("base_number_of_expected_events", 0.0),
    ("base_number_of_unexpected_events", 0.0),
    ("base_urge_change", 0.0),
    ("base_age_influence_on_competence", 0.0),
];

/// Named global scalars shared by all operators of one nodenet.
#[derive(Debug, Clone)]
pub struct Modulators {
    values: HashMap<String, f32>,
}

impl Default for Modulators {
    fn default() -> Self {
        Self::new()
    }
}

impl Modulators {
    pub fn new() -> Self {
        let mut values = HashMap::new();
        values.insert("por_ret_decay".to_string(), 0.0);
        Self { values }
    }

    /// Unknown modulators read as 1 so multiplicative uses stay neutral.
    pub fn get(&self, name: &str) -> f32 {
        self.values.get(name).copied().unwrap_or(1.0)
    }

    pub fn set(&mut self, name: &str, value: f32) {
        self.values.insert(name.to_string(), value);
    }

    /// Additive update; absent modulators start from 0.
    pub fn change(&mut self, name: &str, diff: f32) {
        *self.values.entry(name.to_string()).or_insert(0.0) += diff;
    }

    /// Seeds a modulator without overwriting an existing value.
    pub fn ensure(&mut self, name: &str, default: f32) {
        self.values.entry(name.to_string()).or_insert(default);
    }

    /// Sorted copy of the full table.
    pub fn snapshot(&self) -> BTreeMap<String, f32> {
        self.values
            .iter()
            .map(|(name, &value)| (name.clone(), value))
            .collect()
    }

    /// Replaces the whole table, as done when loading persisted state.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = (String, f32)>) {
        self.values = entries.into_iter().collect();
    }
}

/// One stage of the step pipeline.
pub trait StepOperator {
    fn priority(&self) -> u32;
    fn name(&self) -> &'static str;
    fn execute(
        &mut self,
        partitions: &mut BTreeMap<u16, Partition>,
        catalog: &TypeCatalog,
        modulators: &mut Modulators,
    ) -> NetResult<()>;
}

/// The default pipeline, in priority order.
pub fn standard_operators() -> Vec<Box<dyn StepOperator>> {
    vec![
        Box::new(Propagate),
        Box::new(Calculate),
        Box::new(PorRetDecay::default()),
        Box::new(EmotionalModulators),
    ]
}

// -------------------------------------------------------------------------
// Propagate
// -------------------------------------------------------------------------

/// Replaces every element's activation by the weighted sum of its incoming
/// links. Gate values are consumed; elements without incoming links end up
/// at 0.
pub struct Propagate;

impl StepOperator for Propagate {
    fn priority(&self) -> u32 {
        PRIORITY_PROPAGATE
    }

    fn name(&self) -> &'static str {
        "propagate"
    }

    fn execute(
        &mut self,
        partitions: &mut BTreeMap<u16, Partition>,
        _catalog: &TypeCatalog,
        _modulators: &mut Modulators,
    ) -> NetResult<()> {
        for partition in partitions.values_mut() {
            propagate_partition(partition);
        }
        Ok(())
    }
}

fn propagate_partition(p: &mut Partition) {
    let dim = p.w.dim();
    // The scratch vector doubles as the effective-output buffer: gate
    // values, scaled down for sheaf-spreading gates by their out-degree.
    let mut a_eff = std::mem::take(&mut p.a_in);
    a_eff.clear();
    a_eff.extend_from_slice(&p.a);
    for e in 0..dim {
        if p.g_spread[e] && a_eff[e] != 0.0 {
            let fanout = p.w.out_degree(e);
            if fanout > 1 {
                a_eff[e] /= fanout as f32;
            }
        }
    }
    p.w.propagate(&a_eff, &mut p.a);
    p.a_in = a_eff;
}

// -------------------------------------------------------------------------
// Calculate
// -------------------------------------------------------------------------

/// Applies each live node's gate transfer to the propagated input:
/// function, amplification, activator factor, clamping, thresholding.
/// Staged sensor values are re-asserted first, and nodes with a running
/// wait countdown keep their gates silent.
pub struct Calculate;

impl StepOperator for Calculate {
    fn priority(&self) -> u32 {
        PRIORITY_CALCULATE
    }

    fn name(&self) -> &'static str {
        "calculate"
    }

    fn execute(
        &mut self,
        partitions: &mut BTreeMap<u16, Partition>,
        catalog: &TypeCatalog,
        _modulators: &mut Modulators,
    ) -> NetResult<()> {
        for partition in partitions.values_mut() {
            calculate_partition(partition, catalog)?;
        }
        Ok(())
    }
}

fn calculate_partition(p: &mut Partition, catalog: &TypeCatalog) -> NetResult<()> {
    // Activator readings are taken before any gate is rewritten.
    let mut factors: HashMap<(usize, usize), f32> = HashMap::new();
    for pos in 1..=ACTIVATOR_GATE_TYPES.len() {
        for ns in 1..p.nodespace_capacity() {
            let node = p.activators[pos - 1][ns];
            if node != 0 && p.is_node(node) {
                factors.insert((ns, pos), p.read_gen_element(node));
            }
        }
    }

    for id in p.node_ids() {
        let tag = p.node_types[id];
        if tag == COMMENT {
            continue;
        }
        let nodetype = catalog.get(tag).ok_or_else(|| {
            NetError::Configuration(format!("unknown node type tag {tag}"))
        })?;
        let offset = p.node_offsets[id];

        if let Some(&value) = p.sensor_values.get(&id) {
            p.a[offset + GEN] = value;
        }
        if nodetype.gates.is_empty() {
            continue;
        }

        if p.n_countdown[id] > 0 {
            p.n_countdown[id] -= 1;
            for pos in 0..nodetype.gates.len() {
                p.a[offset + pos] = 0.0;
            }
            continue;
        }

        let nodespace = p.node_parents[id];
        for (pos, gate) in nodetype.gates.iter().enumerate() {
            let e = offset + pos;
            let factor = ACTIVATOR_GATE_TYPES
                .iter()
                .position(|t| t == gate)
                .and_then(|apos| factors.get(&(nodespace, apos + 1)))
                .copied()
                .unwrap_or(1.0);
            let raw = p.g_function[e].apply(p.a[e]) * p.g_amplification[e] * factor;
            let clamped = raw.clamp(p.g_min[e], p.g_max[e]);
            p.a[e] = if clamped <= p.g_threshold[e] {
                0.0
            } else {
                clamped
            };
        }
    }
    Ok(())
}

// -------------------------------------------------------------------------
// Por/ret decay
// -------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecayMode {
    #[default]
    Exponential,
    Linear,
}

/// Weakens positive por/ret links by the `por_ret_decay` modulator each
/// step, so sequence links cannot persist without reinforcement. Weights
/// dropping below [`DECAY_EPSILON`] are removed entirely.
#[derive(Debug, Default)]
pub struct PorRetDecay {
    pub mode: DecayMode,
}

impl StepOperator for PorRetDecay {
    fn priority(&self) -> u32 {
        PRIORITY_POR_RET_DECAY
    }

    fn name(&self) -> &'static str {
        "por_ret_decay"
    }

    fn execute(
        &mut self,
        partitions: &mut BTreeMap<u16, Partition>,
        catalog: &TypeCatalog,
        modulators: &mut Modulators,
    ) -> NetResult<()> {
        let decay = modulators.get("por_ret_decay");
        if decay <= 0.0 {
            return Ok(());
        }
        let mode = self.mode;
        for partition in partitions.values_mut() {
            for id in partition.node_ids() {
                let nodetype = match catalog.get(partition.node_types[id]) {
                    Some(t) => t,
                    None => continue,
                };
                let offset = partition.node_offsets[id];
                for gate in ["por", "ret"] {
                    if let Some(pos) = nodetype.gate_index(gate) {
                        partition.w.update_col(offset + pos, |weight| {
                            if weight <= 0.0 {
                                return weight;
                            }
                            let decayed = match mode {
                                DecayMode::Exponential => weight * (1.0 - decay),
                                DecayMode::Linear => (weight - decay).max(0.0),
                            };
                            if decayed < DECAY_EPSILON {
                                0.0
                            } else {
                                decayed
                            }
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------
// Emotional modulators
// -------------------------------------------------------------------------

/// Recomputes the `emo_*` modulators from the `base_*` signals written by
/// external policy code and the global mean activation. Reads base values,
/// writes emo values, never the other way around.
pub struct EmotionalModulators;

impl StepOperator for EmotionalModulators {
    fn priority(&self) -> u32 {
        PRIORITY_EMOTIONAL_MODULATORS
    }

    fn name(&self) -> &'static str {
        "emotional_modulators"
    }

    fn execute(
        &mut self,
        partitions: &mut BTreeMap<u16, Partition>,
        _catalog: &TypeCatalog,
        modulators: &mut Modulators,
    ) -> NetResult<()> {
        for (name, value) in MODULATOR_SEEDS {
            modulators.ensure(name, value);
        }

        let mut sum = 0.0f32;
        let mut count = 0usize;
        for partition in partitions.values() {
            for e in 0..partition.elements_to_nodes.len() {
                if partition.elements_to_nodes[e] != 0 {
                    sum += partition.a[e].abs();
                    count += 1;
                }
            }
        }
        let mean_activation = if count > 0 { sum / count as f32 } else { 0.0 };

        let importance = modulators.get("base_sum_importance_of_intentions");
        let urgency = modulators.get("base_sum_urgency_of_intentions");
        let motives = modulators.get("base_number_of_active_motives").max(1.0);
        let expected = modulators.get("base_number_of_expected_events").max(0.0);
        let unexpected = modulators
            .get("base_number_of_unexpected_events")
            .max(0.0);
        let urge_change = modulators.get("base_urge_change");
        let aging = modulators.get("base_age_influence_on_competence");

        let activation =
            ((mean_activation + (importance + urgency) / motives) / 2.0).clamp(0.0, 1.0);

        let total_events = expected + unexpected;
        let surprise = if total_events > 0.0 {
            unexpected / total_events
        } else {
            0.0
        };
        let mut competence = modulators.get("emo_competence");
        if total_events > 0.0 {
            competence += COMPETENCE_ADAPTATION * (1.0 - surprise - competence);
        }
        competence = (competence - aging).clamp(0.0, 1.0);
        let securing_rate = (surprise * (1.0 - 0.5 * competence)).clamp(0.0, 1.0);

        let joy = modulators.get("emo_sustaining_joy");
        let pleasure = (urge_change + joy).clamp(-1.0, 1.0);
        let sustaining_joy = if urge_change != 0.0 {
            pleasure
        } else {
            joy * (1.0 - JOY_DECAY)
        };

        modulators.set("emo_activation", activation);
        modulators.set("emo_resolution", (1.0 - 0.5 * activation).clamp(0.0, 1.0));
        modulators.set("emo_selection_threshold", activation);
        modulators.set("emo_competence", competence);
        modulators.set("emo_securing_rate", securing_rate);
        modulators.set("emo_pleasure", pleasure);
        modulators.set("emo_sustaining_joy", sustaining_joy);
        Ok(())
    }
}
