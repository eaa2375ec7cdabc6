// SPDX-License-Identifier: Apache-2.0

//! Candidate generation: bounded enumeration of trees in canonical postfix
//! form, window/task slicing, and the text-file candidate source used to
//! merge worker outputs.
//!
//! Candidates flow into a polymorphic sink; the member collector provides
//! one implementation, tallying passes provide others.

use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::tree::{name_counts, TinyTree};
use crate::{IBIT, KSTART, NSTART, SLOT_COUNT};

/// Receiver of generated or loaded candidates.
///
/// Returns `Ok(false)` to stop the whole run cleanly (duplicates and
/// rejections still return `Ok(true)`).
pub trait CandidateSink {
    fn on_candidate(
        &mut self,
        tree: &TinyTree,
        name: &str,
        num_placeholder: u32,
        num_endpoint: u32,
        num_back_ref: u32,
    ) -> Result<bool>;
}

/// Enumerates all candidate trees of a given node count.
///
/// Candidates are numbered by a monotonic progress counter; a window
/// restricts which candidates reach the sink, which is how task slicing
/// and restarts reproduce an exact sub-range of a full run.
pub struct Generator {
    pub window_lo: u64,
    /// 0 = open ended.
    pub window_hi: u64,
    pub progress: u64,
}

impl Default for Generator {
    fn default() -> Self {
        Self::new()
    }
}

impl Generator {
    pub fn new() -> Self {
        Generator {
            window_lo: 0,
            window_hi: 0,
            progress: 0,
        }
    }

    /// Slice the projected progress range of `(pure, num_nodes)` into
    /// `task_last` equal windows and select window `task_id` (1-based).
    /// The last task is left open ended in case the projection is off.
    pub fn apply_task(
        &mut self,
        task_id: u32,
        task_last: u32,
        pure: bool,
        num_nodes: u32,
    ) -> Result<()> {
        let m = metrics::generator_metrics(SLOT_COUNT as u32, pure, num_nodes)?;
        let mut task_size = m.num_progress / task_last as u64;
        if task_size == 0 {
            task_size = 1;
        }
        self.window_lo = task_size * (task_id as u64 - 1);
        self.window_hi = task_size * task_id as u64;
        if task_id == task_last {
            self.window_hi = 0;
        }
        Ok(())
    }

    /// Generate all candidates with exactly `num_nodes` internal nodes.
    ///
    /// `num_nodes == 0` emits the reserved candidates `"0"` and `"a"`.
    pub fn generate(
        &mut self,
        cfg: &Config,
        num_nodes: u32,
        sink: &mut dyn CandidateSink,
    ) -> Result<()> {
        if num_nodes == 0 {
            let mut tree = TinyTree::new(cfg);
            tree.root = 0;
            if !self.emit(cfg, &tree, sink)? {
                return Ok(());
            }
            tree.root = KSTART;
            self.emit(cfg, &tree, sink)?;
            return Ok(());
        }

        let mut tree = TinyTree::new(cfg);
        self.recurse(cfg, &mut tree, num_nodes, 0, sink)?;
        Ok(())
    }

    /// Grow the tree one node at a time. Each proposed `(Q, T, F)` must
    /// survive normalisation untouched — whatever the normaliser would
    /// collapse or reorder is generated in its canonical shape elsewhere.
    fn recurse(
        &mut self,
        cfg: &Config,
        tree: &mut TinyTree,
        nodes_left: u32,
        next_fresh: u32,
        sink: &mut dyn CandidateSink,
    ) -> Result<bool> {
        if cfg.cancelled() {
            return Ok(false);
        }

        if nodes_left == 0 {
            if !self.all_nodes_connected(tree) {
                return Ok(true);
            }
            tree.root = tree.count - 1;
            return self.emit(cfg, tree, sink);
        }

        // Operand choices: zero, endpoints already in use plus up to three
        // fresh ones (one per operand slot), existing nodes.
        let mut operands: Vec<u32> = vec![0];
        let ep_limit = (next_fresh + 3).min(SLOT_COUNT as u32);
        for e in 0..ep_limit {
            operands.push(KSTART + e);
        }
        for n in NSTART..tree.count {
            operands.push(n);
        }

        for &q in &operands {
            for &to in &operands {
                for ti in [IBIT, 0] {
                    if ti == 0 && cfg.pure {
                        continue;
                    }
                    for &f in &operands {
                        // Endpoints must appear in first-use order.
                        let mut seen = next_fresh;
                        let mut order_ok = true;
                        for op in [q, to, f] {
                            if (KSTART..NSTART).contains(&op) {
                                let e = op - KSTART;
                                match e.cmp(&seen) {
                                    std::cmp::Ordering::Greater => {
                                        order_ok = false;
                                        break;
                                    }
                                    std::cmp::Ordering::Equal => seen += 1,
                                    std::cmp::Ordering::Less => {}
                                }
                            }
                        }
                        if !order_ok {
                            continue;
                        }

                        let saved_count = tree.count;
                        let r = tree.normalise(q, to ^ ti, f);

                        // Canonical means: exactly one new node, not
                        // inverted, holding the operands as proposed.
                        let node = *tree.node(saved_count);
                        if r != saved_count
                            || tree.count != saved_count + 1
                            || node.q != q
                            || node.t != to ^ ti
                            || node.f != f
                        {
                            tree.count = saved_count;
                            continue;
                        }

                        let cont = self.recurse(cfg, tree, nodes_left - 1, seen, sink)?;
                        tree.count = saved_count;
                        if !cont {
                            return Ok(false);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    /// Every node except the last must feed a later node.
    fn all_nodes_connected(&self, tree: &TinyTree) -> bool {
        for i in NSTART..tree.count - 1 {
            let mut referenced = false;
            for j in i + 1..tree.count {
                let n = tree.node(j);
                if n.q == i || n.t & !IBIT == i || n.f == i {
                    referenced = true;
                    break;
                }
            }
            if !referenced {
                return false;
            }
        }
        true
    }

    fn emit(&mut self, _cfg: &Config, tree: &TinyTree, sink: &mut dyn CandidateSink) -> Result<bool> {
        let progress = self.progress;
        self.progress += 1;

        if self.window_lo != 0 && progress < self.window_lo {
            return Ok(true);
        }
        if self.window_hi != 0 && progress >= self.window_hi {
            return Ok(false);
        }

        // Emit in placeholder-canonical form: endpoints named in order of
        // first encounter on the natural path. Construction order can
        // differ from emission order, and everything downstream — member
        // names, component lookups — keys on the emitted form.
        let (name, _skin) = tree.encode_with_skin(tree.root);
        let mut canonical = tree.clone();
        canonical.decode_fast(&name);
        let (nph, nep, nbr) = name_counts(&name);
        sink.on_candidate(&canonical, &name, nph, nep, nbr)
    }
}

/// Feed candidates from a text file, one tree per line: `<name>` or
/// `<name> <numPlaceholder> <numEndpoint> <numBackRef>`. With all four
/// fields present the tail values are verified against the name. Lines are
/// validated through the safe decoder and re-encoded to canonical form
/// before they reach the sink.
pub fn read_candidate_file(
    cfg: &Config,
    path: &Path,
    window_lo: u64,
    window_hi: u64,
    sink: &mut dyn CandidateSink,
) -> Result<u64> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut tree = TinyTree::new(cfg);
    let mut progress = 0u64;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            return Err(Error::Inconsistent(format!(
                "bad/empty line at {progress} in {}",
                path.display()
            )));
        }

        let mut fields = line.split_whitespace();
        let name = fields.next().unwrap();
        let tail: Vec<u64> = fields.map(|f| f.parse().unwrap_or(u64::MAX)).collect();

        let (nph, nep, nbr) = name_counts(name);
        match tail.len() {
            0 => {}
            3 => {
                if tail != [nph as u64, nep as u64, nbr as u64] {
                    return Err(Error::Inconsistent(format!(
                        "line {progress} has incorrect values in {}",
                        path.display()
                    )));
                }
            }
            _ => {
                return Err(Error::Inconsistent(format!(
                    "bad/empty line at {progress} in {}",
                    path.display()
                )));
            }
        }

        if (window_lo != 0 && progress < window_lo) || (window_hi != 0 && progress >= window_hi) {
            progress += 1;
            continue;
        }

        // Normalise, then re-label endpoints into placeholder-canonical
        // form; the skin the relabelling sheds is irrelevant modulo
        // permutation.
        tree.decode_safe(name)?;
        let (canonical, _skin) = tree.encode_with_skin(tree.root);
        tree.decode_fast(&canonical);
        let (nph, nep, nbr) = name_counts(&canonical);
        if !sink.on_candidate(&tree, &canonical, nph, nep, nbr)? {
            break;
        }
        progress += 1;
    }

    Ok(progress)
}
