//! # nodenet
//!
//! A spreading-activation graph engine.
//!
//! Populations of typed nodes live in array-backed partitions and are wired
//! by a weight matrix per partition. A fixed pipeline of step operators
//! propagates activation through the links each discrete step, applies the
//! per-gate transfer functions and decays transient weights. Nets persist as
//! a JSON metadata file plus one compressed binary blob per partition.
//!
//! ## Quick Start
//!
//! ```
//! use nodenet::{NetConfig, NodeOptions, Nodenet};
//!
//! # fn main() -> nodenet::NetResult<()> {
//! let mut net = Nodenet::new(NetConfig::default(), &[])?;
//! let root = net.root_nodespace_uid();
//!
//! // Two registers joined gen -> gen.
//! let a = net.create_node("Register", &root, NodeOptions::default())?;
//! let b = net.create_node("Register", &root, NodeOptions::default())?;
//! net.create_link(&a, "gen", &b, "gen", 0.5)?;
//!
//! // Drive the source and advance one step.
//! net.set_node_activation(&a, 1.0)?;
//! net.step()?;
//! assert_eq!(net.get_node_activation(&b)?, 0.5);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `parallel`: Enable multi-threaded propagation via rayon
//! - `simd`: Enable SIMD vectorization via the `wide` crate
//!
//! ## Modules
//!
//! - [`nodenet`]: Facade, uid-based API and persistence
//! - [`partition`]: Element arena and link storage
//! - [`stepoperators`]: Step pipeline and modulator table
//! - [`nodetype`]: Type catalog and gate functions

#[path = "core/error.rs"]
pub mod error;

#[path = "core/ids.rs"]
pub mod ids;

#[path = "core/nodetype.rs"]
pub mod nodetype;

#[path = "core/matrix.rs"]
pub mod matrix;

#[path = "core/partition.rs"]
pub mod partition;

#[path = "core/stepoperators.rs"]
pub mod stepoperators;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/nodenet.rs"]
pub mod nodenet;

pub use error::{NetError, NetResult};
pub use nodenet::{
    GroupSort, LinkView, LoadReport, NetConfig, NodeOptions, NodeView, Nodenet, NodespaceOptions,
    NodespaceView,
};
pub use nodetype::{GateFunction, GateOverride, GateSpec, NodetypeDef};
pub use stepoperators::{Modulators, StepOperator};
