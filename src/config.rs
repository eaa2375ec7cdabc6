// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration shared by the engine components.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// How signature-group members are ranked against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreMode {
    /// Raw internal node count.
    #[default]
    Nodes,
    /// Lexicographic score: node count, then endpoint count, then
    /// back-reference count.
    Lexicographic,
}

/// Flags that change engine behaviour. Owned by the caller; components take
/// it by reference. Binaries populate it from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// Restrict the operator set to `QnTF` (`T` always inverted): the
    /// normaliser expands `Q?T:F` with plain `T` into `Q?~(Q?~T:F):F`.
    pub pure: bool,

    /// Enable the expensive structural assertions in hot loops.
    pub paranoid: bool,

    /// When probing the imprint index for a candidate, create the
    /// signature on a miss instead of skipping the candidate.
    pub add_if_not_found: bool,

    /// Member ranking mode.
    pub score_mode: ScoreMode,

    /// Cooperative cancellation. Signal handlers in the binaries only ever
    /// touch this flag; the engine checks it at candidate boundaries.
    pub cancel: Arc<AtomicBool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pure: false,
            paranoid: false,
            add_if_not_found: false,
            score_mode: ScoreMode::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Config {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(std::sync::atomic::Ordering::Relaxed)
    }
}
