// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy surfaced by the core.

use thiserror::Error;

/// Sub-kinds of a notation parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotationError {
    /// Unknown character in the name.
    Syntax,
    /// Placeholder letter outside the active skin.
    Placeholder,
    /// Operand stack overflow; the notation is likely too big.
    Overflow,
    /// Operand stack underflow; the notation is not balanced.
    Underflow,
    /// Items left on the stack; missing opcodes.
    Incomplete,
    /// Notation needs more nodes than a tree can hold.
    Size,
}

/// A sizeable database section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Signature,
    Hint,
    Imprint,
    Member,
    Pair,
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Section::Signature => "signature",
            Section::Hint => "hint",
            Section::Imprint => "imprint",
            Section::Member => "member",
            Section::Pair => "pair",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// A tree notation failed to parse.
    #[error("bad notation ({kind:?}) at byte {pos} of {name:?}")]
    BadNotation {
        kind: NotationError,
        pos: usize,
        name: String,
    },

    /// A data section ran out of room. Recoverable when truncation is
    /// enabled: the caller finishes the current step and writes a partial
    /// output, reporting the cursor.
    #[error("{section} storage full at progress {progress}")]
    CapacityExceeded { section: Section, progress: u64 },

    /// No metrics row for the requested shape.
    #[error("no preset for slots={slots} pure={pure} nodes={nodes}")]
    MissingPreset { slots: u32, pure: bool, nodes: u32 },

    /// The store reached a state the policy forbids.
    #[error("inconsistent store: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Single-line JSON diagnostic, mirroring the run summaries.
    pub fn to_json(&self) -> String {
        format!("{{\"error\":{:?}}}", self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
