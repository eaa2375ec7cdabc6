// SPDX-License-Identifier: Apache-2.0

//! `muxdb` maintains an on-disk knowledge base of small multiplexer-tree
//! Boolean functions over nine input variables.
//!
//! Trees are built from a single unified `Q ? T : F` operator (`T` possibly
//! inverted). Trees are grouped into *signatures* — equivalence classes
//! modulo input-variable permutation and level-1 normalisation — and each
//! signature records *members*: concrete trees that can be assembled from
//! already-known members without triggering further rewrites. Arbitrary
//! trees are matched against the knowledge base through *imprints*: 512-bit
//! truth-table fingerprints taken under a configurable subset of the 9!
//! variable permutations, organised so a single associative probe yields
//! both the signature and the permutation mapping the query onto the
//! canonical member.
//!
//! Module map:
//! - [`tree`]: the tiny expression tree — normalisation, text codec,
//!   bit-parallel evaluation.
//! - [`transform`]: the 9! variable permutations and their algebra.
//! - [`footprint`]: the 512-bit truth-table vector.
//! - [`store`]: the packed database (sections, hash indices, file format,
//!   sizing/inherit/copy/rebuild policy).
//! - [`imprint`]: the associative interleave index.
//! - [`collector`]: signature-group member collection and finalisation.
//! - [`generator`]: bounded candidate enumeration and file loading.
//! - [`hints`]: per-signature imprint tallies across interleave presets.

pub mod collector;
pub mod config;
pub mod error;
pub mod footprint;
pub mod generator;
pub mod hints;
pub mod imprint;
pub mod metrics;
pub mod prime;
pub mod store;
pub mod transform;
pub mod tree;

/// Number of input variables. The whole engine is tuned for exactly nine.
pub const SLOT_COUNT: usize = 9;

/// Inversion marker on node references. Never appears in table indices.
pub const IBIT: u32 = 1 << 31;

/// Tree index of the first variable endpoint (`a`).
pub const KSTART: u32 = 1;

/// Tree index of the first internal operator node.
pub const NSTART: u32 = KSTART + SLOT_COUNT as u32;

/// Maximum number of internal nodes. Twice the slot count so pure-mode
/// QnTF expansion has headroom.
pub const MAX_NODES: u32 = (SLOT_COUNT * 2) as u32;

/// Total number of tree entries (zero slot + endpoints + internal nodes).
pub const NEND: u32 = NSTART + MAX_NODES;

/// Number of variable permutations, `SLOT_COUNT!`.
pub const MAX_TRANSFORM: u32 = 362_880;

/// Worst-case encoded name length: leaf, then per node up to three operand
/// characters plus an opcode, a root invert, and slack.
pub const TREE_NAME_LEN: usize = 1 + 4 * MAX_NODES as usize + 2;

pub use config::{Config, ScoreMode};
pub use error::{Error, NotationError, Section};
