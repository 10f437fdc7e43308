//! Node type catalog.
//!
//! Types are consulted through numeric tags so the hot arrays can store a
//! `u16` per node. Tags of the builtin types are fixed; registered types are
//! numbered from [`MAX_BUILTIN`] upwards in registration order, which makes
//! them unstable across restarts. Persistence therefore records type *names*
//! and re-resolves tags on load.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NetError, NetResult};

/// Numeric gate/slot positions shared by the builtin types.
pub const GEN: usize = 0;
pub const POR: usize = 1;
pub const RET: usize = 2;
pub const SUB: usize = 3;
pub const SUR: usize = 4;
pub const CAT: usize = 5;
pub const EXP: usize = 6;

/// Numeric tags of the builtin node types. Tag 0 marks a free node index.
pub const REGISTER: u16 = 1;
pub const SENSOR: u16 = 2;
pub const ACTUATOR: u16 = 3;
pub const ACTIVATOR: u16 = 4;
pub const PIPE: u16 = 5;
pub const COMMENT: u16 = 6;

/// Largest builtin tag; registered types are numbered from here on up.
pub const MAX_BUILTIN: u16 = COMMENT;

/// Gate types an activator node can be registered for.
pub const ACTIVATOR_GATE_TYPES: [&str; 6] = ["por", "ret", "sub", "sur", "cat", "exp"];

const PIPE_GATE_NAMES: [&str; 7] = ["gen", "por", "ret", "sub", "sur", "cat", "exp"];

/// Transfer function applied to a gate's propagated input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum GateFunction {
    #[default]
    Identity = 0,
    Absolute = 1,
    Sigmoid = 2,
    Tanh = 3,
    Rect = 4,
    OneOverX = 5,
}

impl GateFunction {
    /// All selectable gate functions, by name.
    pub fn names() -> [&'static str; 6] {
        ["identity", "absolute", "sigmoid", "tanh", "rect", "one_over_x"]
    }

    pub fn from_name(name: &str) -> NetResult<Self> {
        match name {
            "identity" => Ok(GateFunction::Identity),
            "absolute" => Ok(GateFunction::Absolute),
            "sigmoid" => Ok(GateFunction::Sigmoid),
            "tanh" => Ok(GateFunction::Tanh),
            "rect" => Ok(GateFunction::Rect),
            "one_over_x" => Ok(GateFunction::OneOverX),
            other => Err(NetError::Configuration(format!(
                "unknown gate function {other:?}"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GateFunction::Identity => "identity",
            GateFunction::Absolute => "absolute",
            GateFunction::Sigmoid => "sigmoid",
            GateFunction::Tanh => "tanh",
            GateFunction::Rect => "rect",
            GateFunction::OneOverX => "one_over_x",
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(GateFunction::Identity),
            1 => Some(GateFunction::Absolute),
            2 => Some(GateFunction::Sigmoid),
            3 => Some(GateFunction::Tanh),
            4 => Some(GateFunction::Rect),
            5 => Some(GateFunction::OneOverX),
            _ => None,
        }
    }

    /// Evaluates the function at `x`.
    ///
    /// The reciprocal maps 0 to 0 so a silent input stays silent instead of
    /// producing an infinity.
    pub fn apply(self, x: f32) -> f32 {
        match self {
            GateFunction::Identity => x,
            GateFunction::Absolute => x.abs(),
            GateFunction::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            GateFunction::Tanh => x.tanh(),
            GateFunction::Rect => x.max(0.0),
            GateFunction::OneOverX => {
                if x == 0.0 {
                    0.0
                } else {
                    1.0 / x
                }
            }
        }
    }
}

/// Per-gate transfer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    pub minimum: f32,
    pub maximum: f32,
    /// Outputs at or below this value collapse to 0.
    pub threshold: f32,
    pub amplification: f32,
    /// Divide the gate's activation among its outgoing links instead of
    /// broadcasting it unchanged.
    pub spreadsheaves: bool,
}

impl Default for GateSpec {
    fn default() -> Self {
        Self {
            minimum: -1.0,
            maximum: 1.0,
            threshold: 0.0,
            amplification: 1.0,
            spreadsheaves: false,
        }
    }
}

impl GateSpec {
    pub fn apply_override(&mut self, o: &GateOverride) {
        if let Some(v) = o.minimum {
            self.minimum = v;
        }
        if let Some(v) = o.maximum {
            self.maximum = v;
        }
        if let Some(v) = o.threshold {
            self.threshold = v;
        }
        if let Some(v) = o.amplification {
            self.amplification = v;
        }
        if let Some(v) = o.spreadsheaves {
            self.spreadsheaves = v;
        }
    }
}

/// Partial [`GateSpec`], used for per-type gate defaults and per-node
/// overrides at creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateOverride {
    pub minimum: Option<f32>,
    pub maximum: Option<f32>,
    pub threshold: Option<f32>,
    pub amplification: Option<f32>,
    pub spreadsheaves: Option<bool>,
}

/// Declarative node type descriptor, as consumed from registration input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodetypeDef {
    pub name: String,
    pub slots: Vec<String>,
    pub gates: Vec<String>,
    /// Partial gate specs keyed by gate name; unnamed fields keep the
    /// engine-wide defaults.
    pub gate_defaults: HashMap<String, GateOverride>,
    pub parameters: Vec<String>,
    pub parameter_defaults: HashMap<String, Value>,
    /// Admissible values for enumerated parameters.
    pub parameter_values: HashMap<String, Vec<String>>,
}

/// A resolved node type.
#[derive(Debug, Clone)]
pub struct Nodetype {
    pub name: String,
    pub slots: Vec<String>,
    pub gates: Vec<String>,
    /// One spec per gate, aligned with `gates`.
    pub gate_defaults: Vec<GateSpec>,
    pub parameters: Vec<String>,
    pub parameter_defaults: HashMap<String, Value>,
    pub parameter_values: HashMap<String, Vec<String>>,
}

impl Nodetype {
    fn from_def(def: &NodetypeDef) -> NetResult<Self> {
        if def.name.is_empty() {
            return Err(NetError::Configuration("node type without a name".into()));
        }
        for names in [&def.gates, &def.slots] {
            for (i, name) in names.iter().enumerate() {
                if name.is_empty() || names[..i].contains(name) {
                    return Err(NetError::Configuration(format!(
                        "type {:?} has an empty or duplicate gate/slot name {name:?}",
                        def.name
                    )));
                }
            }
        }
        let mut gate_defaults = vec![GateSpec::default(); def.gates.len()];
        for (gate, o) in &def.gate_defaults {
            let idx = def
                .gates
                .iter()
                .position(|g| g == gate)
                .ok_or_else(|| {
                    NetError::Configuration(format!(
                        "gate defaults for unknown gate {gate:?} of type {:?}",
                        def.name
                    ))
                })?;
            gate_defaults[idx].apply_override(o);
        }
        Ok(Self {
            name: def.name.clone(),
            slots: def.slots.clone(),
            gates: def.gates.clone(),
            gate_defaults,
            parameters: def.parameters.clone(),
            parameter_defaults: def.parameter_defaults.clone(),
            parameter_values: def.parameter_values.clone(),
        })
    }

    /// Size of the element block a node of this type occupies.
    pub fn elements(&self) -> usize {
        self.gates.len().max(self.slots.len())
    }

    pub fn gate_index(&self, name: &str) -> Option<usize> {
        self.gates.iter().position(|g| g == name)
    }

    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s == name)
    }

    /// Default wait countdown for fresh nodes of this type.
    pub fn default_wait(&self) -> u16 {
        self.parameter_defaults
            .get("wait")
            .and_then(Value::as_u64)
            .map(|w| w.min(u16::MAX as u64) as u16)
            .unwrap_or(0)
    }
}

/// Registry mapping numeric type tags to resolved node types.
///
/// Index 0 is reserved (0 marks a free node index in the arena arrays).
#[derive(Debug, Clone)]
pub struct TypeCatalog {
    types: Vec<Option<Nodetype>>,
    by_name: HashMap<String, u16>,
}

impl TypeCatalog {
    /// Catalog holding only the builtin types.
    pub fn standard() -> Self {
        let mut catalog = Self {
            types: vec![None; (MAX_BUILTIN + 1) as usize],
            by_name: HashMap::new(),
        };
        for (tag, nodetype) in [
            (REGISTER, register_type()),
            (SENSOR, sensor_type()),
            (ACTUATOR, actuator_type()),
            (ACTIVATOR, activator_type()),
            (PIPE, pipe_type()),
            (COMMENT, comment_type()),
        ] {
            catalog.by_name.insert(nodetype.name.clone(), tag);
            catalog.types[tag as usize] = Some(nodetype);
        }
        catalog
    }

    /// Catalog holding the builtins plus `defs`, tagged in slice order.
    pub fn with_registered(defs: &[NodetypeDef]) -> NetResult<Self> {
        let mut catalog = Self::standard();
        for def in defs {
            catalog.register(def)?;
        }
        Ok(catalog)
    }

    /// Registers a new type and returns its tag.
    pub fn register(&mut self, def: &NodetypeDef) -> NetResult<u16> {
        if self.by_name.contains_key(&def.name) {
            return Err(NetError::Configuration(format!(
                "node type {:?} is already registered",
                def.name
            )));
        }
        let nodetype = Nodetype::from_def(def)?;
        let tag = self.types.len() as u16;
        self.by_name.insert(nodetype.name.clone(), tag);
        self.types.push(Some(nodetype));
        Ok(tag)
    }

    pub fn get(&self, tag: u16) -> Option<&Nodetype> {
        self.types.get(tag as usize).and_then(Option::as_ref)
    }

    pub fn tag_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    /// Element block size for `tag`; 0 for unknown tags.
    pub fn elements(&self, tag: u16) -> usize {
        self.get(tag).map(Nodetype::elements).unwrap_or(0)
    }

    /// All known type names, builtins first, then registration order.
    pub fn names(&self) -> Vec<String> {
        self.types
            .iter()
            .flatten()
            .map(|t| t.name.clone())
            .collect()
    }

    /// Pairs of (tag, name) for every known type.
    pub fn tag_table(&self) -> Vec<(u16, String)> {
        self.types
            .iter()
            .enumerate()
            .filter_map(|(tag, t)| t.as_ref().map(|t| (tag as u16, t.name.clone())))
            .collect()
    }
}

fn register_type() -> Nodetype {
    Nodetype {
        name: "Register".into(),
        slots: vec!["gen".into()],
        gates: vec!["gen".into()],
        gate_defaults: vec![GateSpec::default()],
        parameters: Vec::new(),
        parameter_defaults: HashMap::new(),
        parameter_values: HashMap::new(),
    }
}

fn sensor_type() -> Nodetype {
    Nodetype {
        name: "Sensor".into(),
        slots: Vec::new(),
        gates: vec!["gen".into()],
        gate_defaults: vec![GateSpec::default()],
        parameters: vec!["datasource".into()],
        parameter_defaults: HashMap::new(),
        parameter_values: HashMap::new(),
    }
}

fn actuator_type() -> Nodetype {
    Nodetype {
        name: "Actuator".into(),
        slots: vec!["gen".into()],
        gates: vec!["gen".into()],
        gate_defaults: vec![GateSpec::default()],
        parameters: vec!["datatarget".into()],
        parameter_defaults: HashMap::new(),
        parameter_values: HashMap::new(),
    }
}

fn activator_type() -> Nodetype {
    let mut parameter_values = HashMap::new();
    parameter_values.insert(
        "type".to_string(),
        ACTIVATOR_GATE_TYPES.iter().map(|s| s.to_string()).collect(),
    );
    Nodetype {
        name: "Activator".into(),
        slots: vec!["gen".into()],
        gates: Vec::new(),
        gate_defaults: Vec::new(),
        parameters: vec!["type".into()],
        parameter_defaults: HashMap::new(),
        parameter_values,
    }
}

fn pipe_type() -> Nodetype {
    let names: Vec<String> = PIPE_GATE_NAMES.iter().map(|s| s.to_string()).collect();
    let gate_defaults = PIPE_GATE_NAMES
        .iter()
        .map(|&name| GateSpec {
            minimum: -1.0,
            maximum: 1.0,
            threshold: -1.0,
            amplification: 1.0,
            spreadsheaves: matches!(name, "sub" | "cat"),
        })
        .collect();
    let mut parameter_defaults = HashMap::new();
    parameter_defaults.insert("expectation".to_string(), Value::from(1));
    parameter_defaults.insert("wait".to_string(), Value::from(10));
    Nodetype {
        name: "Pipe".into(),
        slots: names.clone(),
        gates: names,
        gate_defaults,
        parameters: vec!["expectation".into(), "wait".into()],
        parameter_defaults,
        parameter_values: HashMap::new(),
    }
}

fn comment_type() -> Nodetype {
    Nodetype {
        name: "Comment".into(),
        slots: Vec::new(),
        gates: Vec::new(),
        gate_defaults: Vec::new(),
        parameters: vec!["comment".into()],
        parameter_defaults: HashMap::new(),
        parameter_values: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tags_resolve_by_name() {
        let catalog = TypeCatalog::standard();
        assert_eq!(catalog.tag_of("Register"), Some(REGISTER));
        assert_eq!(catalog.tag_of("Sensor"), Some(SENSOR));
        assert_eq!(catalog.tag_of("Actuator"), Some(ACTUATOR));
        assert_eq!(catalog.tag_of("Activator"), Some(ACTIVATOR));
        assert_eq!(catalog.tag_of("Pipe"), Some(PIPE));
        assert_eq!(catalog.tag_of("Comment"), Some(COMMENT));
        assert_eq!(catalog.tag_of("Missing"), None);
    }

    #[test]
    fn element_block_is_max_of_gates_and_slots() {
        let catalog = TypeCatalog::standard();
        assert_eq!(catalog.elements(REGISTER), 1);
        assert_eq!(catalog.elements(SENSOR), 1);
        assert_eq!(catalog.elements(ACTIVATOR), 1);
        assert_eq!(catalog.elements(PIPE), 7);
        assert_eq!(catalog.elements(COMMENT), 0);
        assert_eq!(catalog.elements(0), 0);
    }

    #[test]
    fn pipe_gate_defaults_match_builtin_shape() {
        let catalog = TypeCatalog::standard();
        let pipe = catalog.get(PIPE).unwrap();
        assert_eq!(pipe.gate_index("sub"), Some(SUB));
        assert_eq!(pipe.slot_index("exp"), Some(EXP));
        for (i, spec) in pipe.gate_defaults.iter().enumerate() {
            assert_eq!(spec.minimum, -1.0);
            assert_eq!(spec.maximum, 1.0);
            assert_eq!(spec.threshold, -1.0);
            assert_eq!(spec.spreadsheaves, i == SUB || i == CAT);
        }
        assert_eq!(pipe.default_wait(), 10);
        assert_eq!(catalog.get(REGISTER).unwrap().default_wait(), 0);
    }

    #[test]
    fn registered_types_get_tags_above_builtins() {
        let mut catalog = TypeCatalog::standard();
        let def = NodetypeDef {
            name: "Concept".into(),
            slots: vec!["gen".into()],
            gates: vec!["gen".into(), "sym".into()],
            ..Default::default()
        };
        let tag = catalog.register(&def).unwrap();
        assert!(tag > MAX_BUILTIN);
        assert_eq!(catalog.tag_of("Concept"), Some(tag));
        assert_eq!(catalog.elements(tag), 2);
        assert!(catalog.register(&def).is_err());
    }

    #[test]
    fn gate_defaults_for_unknown_gate_are_rejected() {
        let mut defaults = HashMap::new();
        defaults.insert(
            "missing".to_string(),
            GateOverride {
                threshold: Some(-1.0),
                ..Default::default()
            },
        );
        let def = NodetypeDef {
            name: "Odd".into(),
            gates: vec!["gen".into()],
            gate_defaults: defaults,
            ..Default::default()
        };
        assert!(TypeCatalog::standard().register(&def).is_err());
    }

    #[test]
    fn gate_functions_evaluate() {
        assert_eq!(GateFunction::Identity.apply(-0.25), -0.25);
        assert_eq!(GateFunction::Absolute.apply(-0.25), 0.25);
        assert!((GateFunction::Sigmoid.apply(0.0) - 0.5).abs() < 1e-6);
        assert!((GateFunction::Tanh.apply(0.0)).abs() < 1e-6);
        assert_eq!(GateFunction::Rect.apply(-2.0), 0.0);
        assert_eq!(GateFunction::Rect.apply(2.0), 2.0);
        assert_eq!(GateFunction::OneOverX.apply(0.0), 0.0);
        assert_eq!(GateFunction::OneOverX.apply(4.0), 0.25);
    }

    #[test]
    fn gate_function_names_roundtrip() {
        for name in GateFunction::names() {
            let f = GateFunction::from_name(name).unwrap();
            assert_eq!(f.name(), name);
            assert_eq!(GateFunction::from_tag(f.tag()), Some(f));
        }
        assert!(GateFunction::from_name("cosine").is_err());
        assert_eq!(GateFunction::from_tag(17), None);
    }
}
