// SPDX-License-Identifier: Apache-2.0

//! Signature-group member collection.
//!
//! Members share the node size of their group, which is the smallest the
//! group can have. A member is *safe* when its three components and all of
//! its heads reference safe members; safety is the fixed point of that
//! condition. Unsafe groups collect everything that matches as raw
//! material; the first safe arrival flushes them and locks the group.
//!
//! Intake decisions, per candidate:
//!
//! | group  | candidate | action                                        |
//! |--------|-----------|-----------------------------------------------|
//! | safe   | safe      | accept `+`; better score flushes first (`!`)  |
//! | safe   | unsafe    | reject `<`                                    |
//! | unsafe | safe      | flush, promote group to safe, accept `>`      |
//! | unsafe | unsafe    | accept `=`                                    |

use std::cmp::Ordering;
use std::io::Write;

use serde::Serialize;

use crate::config::{Config, ScoreMode};
use crate::error::{Error, Result, Section};
use crate::generator::CandidateSink;
use crate::store::{pack_name, Member, Signature, Store, MAX_HEAD};
use crate::transform;
use crate::tree::{calc_score_name, TinyTree};
use crate::{IBIT, KSTART, NEND, NSTART, SLOT_COUNT};

/// Textual output modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextMode {
    #[default]
    None,
    /// Winning candidates as they are accepted, one name per line.
    Won,
    /// Every decided candidate with its compare verdict.
    Compare,
    /// All members after finalisation, one name per line.
    Brief,
    /// Full member rows after finalisation, grouped by signature.
    Verbose,
    /// `insert ignore into member …` rows after finalisation.
    Sql,
}

#[derive(Debug, Clone, Default)]
pub struct CollectorOptions {
    /// No changes may be made to the member/pair sections; accepted
    /// candidates only mark their group non-empty.
    pub read_only: bool,
    /// Stop cleanly on a storage ceiling instead of failing.
    pub truncate: bool,
    pub text: TextMode,
}

/// Where a truncated run stopped.
#[derive(Debug, Clone, Serialize)]
pub struct Truncation {
    pub progress: u64,
    pub name: String,
}

/// Final single-line JSON run summary.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub num_slot: u32,
    pub pure: bool,
    pub interleave: u32,
    pub num_node: u32,
    pub num_signature: u32,
    pub num_imprint: u32,
    pub num_member: u32,
    pub num_pair: u32,
    pub num_empty: u32,
    pub num_unsafe: u32,
    pub skip_duplicate: u64,
    pub skip_size: u64,
    pub skip_unsafe: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<Truncation>,
}

pub struct MemberCollector<'a> {
    cfg: &'a Config,
    pub store: &'a mut Store,
    opts: CollectorOptions,
    out: Option<&'a mut dyn Write>,

    /// Group score per signature; may differ from the signature's size.
    safe_scores: Vec<u32>,
    /// Head of the list of freed member slots (`sid == 0` marks a member
    /// as being on this list).
    free_member_root: u32,

    pub num_empty: u32,
    pub num_unsafe: u32,
    pub skip_duplicate: u64,
    pub skip_size: u64,
    pub skip_unsafe: u64,
    pub truncated: Option<Truncation>,
    progress: u64,
}

impl<'a> MemberCollector<'a> {
    pub fn new(
        cfg: &'a Config,
        store: &'a mut Store,
        opts: CollectorOptions,
        out: Option<&'a mut dyn Write>,
    ) -> Self {
        let mut safe_scores = vec![0u32; store.max_signature as usize];
        for sid in 1..store.num_signature() {
            let sig = store.signature(sid);
            if sig.is_safe() && sig.first_member != 0 {
                let name = store.member(sig.first_member).name_str();
                safe_scores[sid as usize] = score_name(cfg.score_mode, name);
            }
        }

        let mut c = MemberCollector {
            cfg,
            store,
            opts,
            out,
            safe_scores,
            free_member_root: 0,
            num_empty: 0,
            num_unsafe: 0,
            skip_duplicate: 0,
            skip_size: 0,
            skip_unsafe: 0,
            truncated: None,
            progress: 0,
        };
        c.recount();
        c
    }

    /// Recount empty/unsafe groups from the signature table.
    pub fn recount(&mut self) {
        self.num_empty = 0;
        self.num_unsafe = 0;
        for sid in 1..self.store.num_signature() {
            let sig = self.store.signature(sid);
            if sig.first_member == 0 {
                self.num_empty += 1;
            }
            if !sig.is_safe() {
                self.num_unsafe += 1;
            }
        }
    }

    fn emit(&mut self, line: &str) -> Result<()> {
        if let Some(out) = self.out.as_deref_mut() {
            writeln!(out, "{line}")?;
        }
        Ok(())
    }

    fn score(&self, name: &str) -> u32 {
        score_name(self.cfg.score_mode, name)
    }

    /// Allocate a member slot, preferring the free list.
    fn member_alloc(&mut self, member: Member) -> Result<u32> {
        if self.free_member_root != 0 {
            let mid = self.free_member_root;
            self.free_member_root = self.store.member(mid).next_member;
            *self.store.member_mut(mid) = member;
            Ok(mid)
        } else {
            self.store.add_member(member)
        }
    }

    /// Orphan a member: zero it so name lookups skip it, then push the
    /// slot onto the free list.
    fn member_free(&mut self, mid: u32) {
        let mut dead = Member::default();
        dead.next_member = self.free_member_root;
        *self.store.member_mut(mid) = dead;
        self.free_member_root = mid;
    }

    /// Remove all members of a group, nulling any pair references other
    /// members hold on them. Only unsafe members can hold such references.
    fn flush_group(&mut self, sid: u32) {
        if self.store.signature(sid).first_member == 0 {
            return;
        }

        if self.opts.read_only {
            // The member chain cannot be modified; pretend the group was
            // emptied.
            self.store.signature_mut(sid).first_member = 0;
        } else {
            while self.store.signature(sid).first_member != 0 {
                let dead = self.store.signature(sid).first_member;

                for mid in 1..self.store.num_member() {
                    let m = *self.store.member(mid);
                    let q_hit = m.q_pair != 0 && self.store.pair(m.q_pair).member_id == dead;
                    let t_hit = m.t_pair != 0 && self.store.pair(m.t_pair).member_id == dead;
                    let f_hit = m.f_pair != 0 && self.store.pair(m.f_pair).member_id == dead;
                    if (q_hit || t_hit || f_hit) && self.cfg.paranoid {
                        assert!(!m.is_safe(), "safe member lost a component");
                    }
                    if q_hit {
                        self.store.member_mut(mid).q_pair = 0;
                    }
                    if t_hit {
                        self.store.member_mut(mid).t_pair = 0;
                    }
                    if f_hit {
                        self.store.member_mut(mid).f_pair = 0;
                    }
                }

                let next = self.store.member(dead).next_member;
                self.member_free(dead);
                self.store.signature_mut(sid).first_member = next;
            }
        }

        self.num_empty += 1;
    }

    /// Extend a partial skin to a full transform id: unused slots take the
    /// remaining letters in ascending order.
    fn skin_tid(skin: &str) -> u32 {
        let mut perm = [0u8; SLOT_COUNT];
        let mut used = 0u16;
        for (k, ch) in skin.bytes().enumerate() {
            perm[k] = ch - b'a';
            used |= 1 << (ch - b'a');
        }
        let mut next = 0u8;
        for slot in perm.iter_mut().skip(skin.len()) {
            while used & (1 << next) != 0 {
                next += 1;
            }
            *slot = next;
            used |= 1 << next;
        }
        transform::rank(&perm)
    }

    /// Look up a component sub-tree as a member: fast path by emitted
    /// skin-free name, slow path through the safe decoder (the parent may
    /// have locked a dyadic ordering the component itself would not use).
    /// Returns `(member_id, transform_id)`.
    fn lookup_component(&mut self, tree: &TinyTree, reference: u32) -> Result<Option<(u32, u32)>> {
        let (name, skin) = tree.encode_with_skin(reference);
        let mut mid = self.store.find_member(&name);
        let mut skin = skin;

        if mid.is_none() {
            let plain = tree.encode(reference);
            let mut reparsed = TinyTree::new(self.cfg);
            reparsed.decode_safe(&plain)?;
            let (name2, skin2) = reparsed.encode_with_skin(reparsed.root);
            mid = self.store.find_member(&name2);
            skin = skin2;
        }

        let Some(mid) = mid else {
            return Ok(None);
        };
        if !self.store.member(mid).is_safe() {
            return Ok(None);
        }

        Ok(Some((mid, Self::skin_tid(&skin))))
    }

    /// Resolve tails (the Q/T/F components) and heads (the tree with one
    /// non-root node replaced by a placeholder) of `member`. A missing or
    /// unsafe reference demotes the member to unsafe.
    fn find_head_tail(&mut self, member: &mut Member, tree: &TinyTree) -> Result<bool> {
        debug_assert_eq!(tree.root & IBIT, 0);

        // Safe until proven otherwise.
        member.flags |= Member::SAFE;

        // Reserved entries "0" and "a" have no components.
        if tree.root < NSTART {
            member.tid = 0;
            member.q_pair = 0;
            member.t_pair = 0;
            member.f_pair = 0;
            member.heads = [0; MAX_HEAD];
            return Ok(true);
        }

        let node = *tree.node(tree.root);
        let tu = node.t & !IBIT;

        // Tails.
        match self.lookup_component(tree, node.q)? {
            Some((mid, tid)) => member.q_pair = self.store.intern_pair(mid, tid)?,
            None => {
                member.flags &= !Member::SAFE;
                return Ok(false);
            }
        }
        match self.lookup_component(tree, tu)? {
            Some((mid, tid)) => member.t_pair = self.store.intern_pair(mid, tid)?,
            None => {
                member.flags &= !Member::SAFE;
                return Ok(false);
            }
        }
        if node.f == tu {
            member.f_pair = 0;
        } else {
            match self.lookup_component(tree, node.f)? {
                Some((mid, tid)) => member.f_pair = self.store.intern_pair(mid, tid)?,
                None => {
                    member.flags &= !Member::SAFE;
                    return Ok(false);
                }
            }
        }

        // Heads may contain stale values.
        member.heads = [0; MAX_HEAD];
        let mut num_head = 0usize;

        // In turn, replace each non-root node ("hot") with a placeholder
        // endpoint, cutting that part off the tree.
        for hot in NSTART..tree.root {
            let mut select: u32 = (1 << tree.root) | 1;

            // Mark nodes needed when the hot node is cut out.
            for k in (NSTART..=tree.root).rev() {
                if k != hot && select & (1 << k) != 0 {
                    let n = tree.node(k);
                    for op in [n.q, n.t & !IBIT, n.f] {
                        if op >= NSTART {
                            select |= 1 << op;
                        }
                    }
                }
            }

            let mut head = TinyTree::new(self.cfg);
            select &= !(1 << hot);

            let mut what = [0u32; NEND as usize];
            let mut next_placeholder = KSTART;

            // Extract, preserving dyadic ordering: replacing references
            // with placeholders changes the ordering the parent enforced.
            for k in NSTART..=tree.root {
                if k == hot || select & (1 << k) == 0 {
                    continue;
                }
                let n = *tree.node(k);
                let (q, tu, ti, f) = (n.q, n.t & !IBIT, n.t & IBIT, n.f);

                for op in [q, tu, f] {
                    if select & (1 << op) == 0 {
                        what[op as usize] = next_placeholder;
                        next_placeholder += 1;
                        select |= 1 << op;
                    }
                }

                what[k as usize] = head.count;
                select |= 1 << k;

                let (wq, wtu, wf) = (what[q as usize], what[tu as usize], what[f as usize]);
                if tu == 0 && ti != 0 && head.compare_refs(wq, &head, wf) == Ordering::Greater {
                    // reorder OR
                    head.push_raw(wf, IBIT, wq);
                } else if tu == f && head.compare_refs(wq, &head, wf) == Ordering::Greater {
                    // reorder XOR
                    head.push_raw(wf, wq ^ IBIT, wq);
                } else if f == 0 && ti == 0 && head.compare_refs(wq, &head, wtu) == Ordering::Greater
                {
                    // reorder AND
                    head.push_raw(wtu, wq, 0);
                } else {
                    head.push_raw(wq, wtu ^ ti, wf);
                }
            }

            head.root = head.count - 1;

            let Some((mid_head, _tid)) = self.lookup_component(&head, head.root)? else {
                member.flags &= !Member::SAFE;
                return Ok(false);
            };

            // Record distinct heads only.
            if !member.heads[..num_head].contains(&mid_head) {
                assert!(num_head < MAX_HEAD, "too many distinct heads");
                member.heads[num_head] = mid_head;
                num_head += 1;
            }
        }

        Ok(true)
    }

    /// Capacity watch for `--truncate`: stop the whole run while there is
    /// still room to finish the current step.
    fn storage_low(&self) -> bool {
        let s = &self.store;
        s.max_imprint - s.num_imprint() <= s.interleave
            || s.max_signature - s.num_signature() <= 1
            || s.max_member - s.num_member() <= 1
    }

    fn capacity_error(&self, section: Section) -> Error {
        Error::CapacityExceeded {
            section,
            progress: self.progress,
        }
    }

    /// Intake decision for one candidate. See the module table.
    fn intake(
        &mut self,
        tree: &TinyTree,
        name: &str,
        num_placeholder: u32,
        num_endpoint: u32,
        num_back_ref: u32,
    ) -> Result<bool> {
        self.progress += 1;

        if tree.root & IBIT != 0 {
            // Classes are represented non-inverted; the complement arrives
            // separately.
            return Ok(true);
        }

        // Duplicate name.
        if self.store.find_member(name).is_some() {
            self.skip_duplicate += 1;
            return Ok(true);
        }

        // Storage ceiling: record the cursor and wind down cleanly.
        if self.opts.truncate && self.storage_low() {
            self.truncated = Some(Truncation {
                progress: self.progress,
                name: name.to_string(),
            });
            return Ok(false);
        }

        // Find the matching signature group. Layout only, so the transform
        // is reported but the imprint is keyed on footprints.
        let (sid, tid) = match self.store.lookup_imprint_associative(tree) {
            Some(hit) => hit,
            None => {
                if !self.cfg.add_if_not_found || self.opts.read_only {
                    return Ok(true); // no matching signature
                }
                let sid = self.create_signature(tree, name, num_placeholder, num_endpoint,
                    num_back_ref)?;
                match sid {
                    Some(sid) => (sid, 0),
                    None => return Ok(false), // truncated
                }
            }
        };

        let sig = *self.store.signature(sid);
        let cand_nodes = tree.num_nodes();
        let cand_score = self.score(name);

        // Early reject by size: larger candidates always lose, so skip the
        // expensive head/tail analysis.
        let early = if sig.is_safe() {
            cand_score > self.safe_scores[sid as usize]
        } else {
            cand_nodes > sig.size as u32 + 1
        };
        if early {
            if self.opts.text == TextMode::Compare {
                let line = format!(
                    "{}\t{}\t-\t{}\t{}\t{}\t{}\t{}",
                    self.progress, sid, name, cand_nodes, num_placeholder, num_endpoint,
                    num_back_ref
                );
                self.emit(&line)?;
            }
            self.skip_size += 1;
            return Ok(true);
        }

        // Determine safety from heads and tails.
        let mut member = Member {
            name: pack_name(name),
            sid,
            tid,
            size: cand_nodes as u8,
            num_placeholder: num_placeholder as u8,
            num_endpoint: num_endpoint as u8,
            num_back_ref: num_back_ref as u8,
            ..Member::default()
        };
        self.find_head_tail(&mut member, tree)?;

        let cmp = match (sig.is_safe(), member.is_safe()) {
            (true, false) => '<',
            (true, true) => {
                if cand_score < self.safe_scores[sid as usize] {
                    '!'
                } else {
                    '+'
                }
            }
            (false, true) => '>',
            (false, false) => '=',
        };

        if self.opts.text == TextMode::Compare {
            let line = format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                self.progress, sid, cmp, name, cand_nodes, num_placeholder, num_endpoint,
                num_back_ref
            );
            self.emit(&line)?;
        }

        if cmp == '<' {
            self.skip_unsafe += 1;
            return Ok(true);
        }

        if self.opts.text == TextMode::Won {
            let line = name.to_string();
            self.emit(&line)?;
        }

        if cmp == '>' || cmp == '!' {
            // Group flips to safe, or a better score arrived: remove the
            // stale members first.
            self.flush_group(sid);
        }
        if cmp == '>' {
            self.store.signature_mut(sid).flags |= Signature::SAFE;
            self.num_unsafe -= 1;
        }

        if self.store.signature(sid).first_member == 0 {
            self.num_empty -= 1;
        }

        // Promote candidate to member.
        if self.opts.read_only {
            // Mark non-empty without touching the member section.
            self.store.signature_mut(sid).first_member = 1;
        } else {
            let mut member = member;
            member.next_member = self.store.signature(sid).first_member;
            let mid = match self.member_alloc(member) {
                Ok(mid) => mid,
                Err(Error::CapacityExceeded { section, .. }) => {
                    return Err(self.capacity_error(section));
                }
                Err(e) => return Err(e),
            };
            self.store.signature_mut(sid).first_member = mid;
            self.store.index_member(mid);
        }

        self.safe_scores[sid as usize] = cand_score;
        Ok(true)
    }

    /// Add-if-not-found: create the signature for an unmatched candidate
    /// and index its imprint rows. `Ok(None)` means a storage ceiling was
    /// hit under `--truncate`.
    fn create_signature(
        &mut self,
        tree: &TinyTree,
        name: &str,
        num_placeholder: u32,
        num_endpoint: u32,
        num_back_ref: u32,
    ) -> Result<Option<u32>> {
        let sig = Signature {
            name: pack_name(name),
            size: tree.num_nodes() as u8,
            num_placeholder: num_placeholder as u8,
            num_endpoint: num_endpoint as u8,
            num_back_ref: num_back_ref as u8,
            ..Signature::default()
        };

        let sid = match self.store.add_signature(sig) {
            Ok(sid) => sid,
            Err(Error::CapacityExceeded { .. }) if self.opts.truncate => {
                self.truncated = Some(Truncation {
                    progress: self.progress,
                    name: name.to_string(),
                });
                return Ok(None);
            }
            Err(Error::CapacityExceeded { section, .. }) => {
                return Err(self.capacity_error(section))
            }
            Err(e) => return Err(e),
        };

        let got = match self.store.add_imprint_associative(tree, sid) {
            Ok(got) => got,
            Err(Error::CapacityExceeded { .. }) if self.opts.truncate => {
                self.truncated = Some(Truncation {
                    progress: self.progress,
                    name: name.to_string(),
                });
                return Ok(None);
            }
            Err(Error::CapacityExceeded { section, .. }) => {
                return Err(self.capacity_error(section))
            }
            Err(e) => return Err(e),
        };

        if got != sid {
            // A partially indexed class resurfaced (possible after an
            // unsafe-only rebuild). Fold into the existing signature; the
            // fresh record stays as an unreferenced orphan.
            log::warn!("add-if-not-found: \"{name}\" folded into sid={got}");
            return Ok(Some(got));
        }

        self.num_empty += 1;
        self.num_unsafe += 1;
        Ok(Some(sid))
    }

    /*
     * Finalisation
     */

    /// Compact (drop orphans), sort by the composite key, re-index,
    /// re-resolve heads/tails so pair ids are dense, re-link the signature
    /// chains best-first, and recompute the COMPONENT flags.
    ///
    /// Running this twice produces identical tables.
    pub fn finalise(&mut self) -> Result<()> {
        log::info!("sorting members");

        // Pairs are re-interned from scratch.
        self.store.clear_pairs();

        // Clear the member index and the chains; group safety is
        // re-derived from the surviving members.
        self.store.member_index.owned_mut().fill(0);
        for sid in 0..self.store.num_signature() {
            let sig = self.store.signature_mut(sid);
            sig.first_member = 0;
            sig.flags &= !Signature::SAFE;
        }
        self.skip_duplicate = 0;
        self.skip_size = 0;
        self.skip_unsafe = 0;
        self.free_member_root = 0;

        // Compact and sort the live members.
        let cfg = self.cfg;
        let mut live: Vec<Member> = self
            .store
            .members
            .as_slice()
            .iter()
            .skip(1)
            .filter(|m| m.sid != 0)
            .copied()
            .collect();
        live.sort_by(|l, r| compare_members(cfg, l, r));

        {
            let members = self.store.members.owned_mut();
            members.truncate(1);
            members.extend(live);
        }

        log::info!("indexing members");

        let mut tree = TinyTree::new(self.cfg);

        for mid in 1..self.store.num_member() {
            let mut member = *self.store.member(mid);
            let was_safe = member.is_safe();

            // Recalculate heads and tails against the new ordering.
            tree.decode_fast(member.name_str());
            let is_safe = self.find_head_tail(&mut member, &tree)?;

            if was_safe && !is_safe {
                log::warn!(
                    "member {} \"{}\" lost safety during finalisation",
                    mid,
                    member.name_str()
                );
            }

            if self.cfg.paranoid {
                for pid in [member.q_pair, member.t_pair, member.f_pair] {
                    assert!(pid == 0 || self.store.pair(pid).member_id < mid);
                }
                for head in member.heads {
                    assert!(head < mid);
                }
            }

            let sig = self.store.signature(member.sid);
            let admit = if sig.first_member == 0 {
                if member.is_safe() {
                    // First member safe makes the signature safe.
                    self.store.signature_mut(member.sid).flags |= Signature::SAFE;
                }
                // Mark the group non-empty for the admission logic; the
                // chains are relinked below.
                self.store.signature_mut(member.sid).first_member = mid;
                true
            } else if member.is_safe() == self.store.signature(member.sid).is_safe() {
                true
            } else if member.is_safe() {
                log::warn!(
                    "adding safe member {} \"{}\" to unsafe signature {}",
                    mid,
                    member.name_str(),
                    member.sid
                );
                self.store.signature_mut(member.sid).flags |= Signature::SAFE;
                true
            } else {
                // Unsafe member against a safe group: not indexed.
                self.skip_unsafe += 1;
                false
            };

            *self.store.member_mut(mid) = member;
            if admit {
                self.store.index_member(mid);
            }
        }

        // String the members onto their signatures, best first.
        for sid in 0..self.store.num_signature() {
            self.store.signature_mut(sid).first_member = 0;
        }
        for mid in (1..self.store.num_member()).rev() {
            let sid = self.store.member(mid).sid;
            let first = self.store.signature(sid).first_member;
            self.store.member_mut(mid).next_member = first;
            self.store.signature_mut(sid).first_member = mid;
        }

        // Flag components: everything a safe member references.
        for mid in 1..self.store.num_member() {
            self.store.member_mut(mid).flags &= !Member::COMPONENT;
        }
        for mid in 1..self.store.num_member() {
            let m = *self.store.member(mid);
            if !m.is_safe() {
                continue;
            }
            for pid in [m.q_pair, m.t_pair, m.f_pair] {
                if pid != 0 {
                    let target = self.store.pair(pid).member_id;
                    self.store.member_mut(target).flags |= Member::COMPONENT;
                }
            }
            for head in m.heads {
                if head != 0 {
                    self.store.member_mut(head).flags |= Member::COMPONENT;
                }
            }
        }

        self.recount();

        log::info!(
            "indexed members: numMember={} skipUnsafe={} numEmpty={} numUnsafe={}",
            self.store.num_member(),
            self.skip_unsafe,
            self.num_empty,
            self.num_unsafe - self.num_empty
        );

        Ok(())
    }

    /// Check that no unsafe group holds a safe member (it would have been
    /// promoted).
    pub fn validate_groups(&self) -> Result<()> {
        for sid in 1..self.store.num_signature() {
            let sig = self.store.signature(sid);
            if sig.is_safe() {
                continue;
            }
            let mut mid = sig.first_member;
            while mid != 0 {
                let m = self.store.member(mid);
                if m.is_safe() {
                    return Err(Error::Inconsistent(format!(
                        "unsafe signature {sid} holds safe member {mid}"
                    )));
                }
                mid = m.next_member;
            }
        }
        Ok(())
    }

    /*
     * Text output of the finalised dataset
     */

    pub fn write_text(&mut self) -> Result<()> {
        match self.opts.text {
            TextMode::Brief => self.write_brief(),
            TextMode::Verbose => self.write_verbose(),
            TextMode::Sql => self.write_sql(),
            _ => Ok(()),
        }
    }

    fn write_brief(&mut self) -> Result<()> {
        for mid in 1..self.store.num_member() {
            let line = self.store.member(mid).name_str().to_string();
            self.emit(&line)?;
        }
        Ok(())
    }

    fn decode_pair(&self, pid: u32) -> String {
        if pid == 0 {
            return "-".to_string();
        }
        let pair = self.store.pair(pid);
        let m = self.store.member(pair.member_id);
        format!(
            "{}:{}/{}:{}",
            pair.member_id,
            m.name_str(),
            pair.transform_id,
            &self.store.fwd_name(pair.transform_id)[..m.num_placeholder.max(1) as usize]
        )
    }

    fn write_verbose(&mut self) -> Result<()> {
        for sid in 1..self.store.num_signature() {
            let mut mid = self.store.signature(sid).first_member;
            while mid != 0 {
                let m = *self.store.member(mid);
                let mut line = format!(
                    "{}\t{}\t{}\t{}\t{:03x}\t{}\t{}\t{}",
                    mid,
                    sid,
                    m.tid,
                    m.name_str(),
                    calc_score_name(m.name_str()),
                    self.decode_pair(m.q_pair),
                    self.decode_pair(m.t_pair),
                    self.decode_pair(m.f_pair),
                );
                for head in m.heads {
                    if head != 0 {
                        line.push_str(&format!(
                            "\t{}:{}",
                            head,
                            self.store.member(head).name_str()
                        ));
                    }
                }
                let sig_safe = self.store.signature(sid).is_safe();
                line.push('\t');
                if sig_safe {
                    line.push(if m.is_safe() { 'S' } else { 's' });
                }
                if m.flags & Member::COMPONENT != 0 {
                    line.push('C');
                }
                if m.flags & Member::DEPRECATED != 0 {
                    line.push('D');
                }
                self.emit(&line)?;
                mid = m.next_member;
            }
        }
        Ok(())
    }

    fn write_sql(&mut self) -> Result<()> {
        for mid in 1..self.store.num_member() {
            let m = *self.store.member(mid);
            let line = format!(
                "insert ignore into member (mid,sid,tid,name,size,numplaceholder,numendpoint,numbackref,safe) values ({},{},{},'{}',{},{},{},{},{});",
                mid,
                m.sid,
                m.tid,
                m.name_str(),
                m.size,
                m.num_placeholder,
                m.num_endpoint,
                m.num_back_ref,
                if m.is_safe() { 1 } else { 0 }
            );
            self.emit(&line)?;
        }
        Ok(())
    }

    /// Final single-line JSON summary of the run.
    pub fn summary(&self, num_node: u32) -> RunSummary {
        RunSummary {
            num_slot: SLOT_COUNT as u32,
            pure: self.cfg.pure,
            interleave: self.store.interleave,
            num_node,
            num_signature: self.store.num_signature(),
            num_imprint: self.store.num_imprint(),
            num_member: self.store.num_member(),
            num_pair: self.store.num_pair(),
            num_empty: self.num_empty,
            num_unsafe: self.num_unsafe.saturating_sub(self.num_empty),
            skip_duplicate: self.skip_duplicate,
            skip_size: self.skip_size,
            skip_unsafe: self.skip_unsafe,
            truncated: self.truncated.clone(),
        }
    }
}

impl CandidateSink for MemberCollector<'_> {
    fn on_candidate(
        &mut self,
        tree: &TinyTree,
        name: &str,
        num_placeholder: u32,
        num_endpoint: u32,
        num_back_ref: u32,
    ) -> Result<bool> {
        if self.truncated.is_some() || self.cfg.cancelled() {
            return Ok(false);
        }
        self.intake(tree, name, num_placeholder, num_endpoint, num_back_ref)
    }
}

fn score_name(mode: ScoreMode, name: &str) -> u32 {
    match mode {
        ScoreMode::Nodes => {
            name.bytes()
                .filter(|b| matches!(b, b'>' | b'+' | b'^' | b'!' | b'&' | b'<' | b'?'))
                .count() as u32
        }
        ScoreMode::Lexicographic => calc_score_name(name),
    }
}

/// Composite member order: orphans last, then safe first, deprecated
/// last, score, structural compare.
///
/// The COMPONENT flag deliberately takes no part in the ordering: it is
/// recomputed from scratch after every sort, and letting a stale flag
/// steer the sort would make finalisation order depend on the previous
/// pass. Components are the smallest structures and lead on score anyway.
fn compare_members(cfg: &Config, l: &Member, r: &Member) -> Ordering {
    if l.sid == 0 || r.sid == 0 {
        return (l.sid == 0).cmp(&(r.sid == 0));
    }

    let safe = r.is_safe().cmp(&l.is_safe());
    if safe != Ordering::Equal {
        return safe;
    }

    let depr = (l.flags & Member::DEPRECATED).cmp(&(r.flags & Member::DEPRECATED));
    if depr != Ordering::Equal {
        return depr;
    }

    let score = score_name(cfg.score_mode, l.name_str())
        .cmp(&score_name(cfg.score_mode, r.name_str()));
    if score != Ordering::Equal {
        return score;
    }

    let mut tl = TinyTree::new(cfg);
    let mut tr = TinyTree::new(cfg);
    tl.decode_fast(l.name_str());
    tr.decode_fast(r.name_str());
    tl.compare(&tr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::policy::{SectionPolicy, SizingOptions};

    fn build_store(max_member: u32) -> Store {
        let db = Store::new_root();
        let mut policy = SectionPolicy::new(SizingOptions {
            max_signature: 64,
            max_member,
            max_pair: 256,
            max_hint: 8,
            max_imprint: 64 * 504 + 1,
            interleave: 504,
            ..SizingOptions::default()
        });
        policy.prepare_member_collection(&db, false);
        let params = policy.size_sections(&db, 1, false).unwrap();
        policy.populate(&params, &db, 0).unwrap()
    }

    fn ainf_config() -> Config {
        Config {
            add_if_not_found: true,
            ..Config::default()
        }
    }

    fn insert(collector: &mut MemberCollector, name: &str) -> bool {
        let mut tree = TinyTree::new(collector.cfg);
        tree.decode_safe(name).unwrap();
        let (canonical, _skin) = tree.encode_with_skin(tree.root);
        tree.decode_fast(&canonical);
        let (nph, nep, nbr) = crate::tree::name_counts(&canonical);
        collector
            .on_candidate(&tree, &canonical, nph, nep, nbr)
            .unwrap()
    }

    #[test]
    fn test_reserved_candidates_make_safe_single_member_groups() {
        let cfg = ainf_config();
        let mut store = build_store(64);
        let mut c = MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);

        assert!(insert(&mut c, "0"));
        assert!(insert(&mut c, "a"));
        c.finalise().unwrap();
        c.validate_groups().unwrap();

        let store = &c.store;
        assert_eq!(store.num_signature() - 1, 2);
        assert_eq!(store.num_member() - 1, 2);
        for sid in 1..store.num_signature() {
            let sig = store.signature(sid);
            assert!(sig.is_safe());
            let first = sig.first_member;
            assert_ne!(first, 0);
            assert!(store.member(first).is_safe());
            assert_eq!(store.member(first).next_member, 0);
        }
    }

    #[test]
    fn test_and_candidates_collapse_to_one_class() {
        let cfg = ainf_config();
        let mut store = build_store(64);
        let mut c = MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);

        insert(&mut c, "0");
        insert(&mut c, "a");
        insert(&mut c, "ab&");
        // "ba&" canonicalises to the same name and is dropped as a
        // duplicate.
        insert(&mut c, "ba&");
        assert_eq!(c.skip_duplicate, 1);

        c.finalise().unwrap();
        assert_eq!(c.store.num_signature() - 1, 3);
        assert_eq!(c.store.num_member() - 1, 3);
    }

    #[test]
    fn test_noncommutative_orientation_joins_class_under_transform() {
        let cfg = ainf_config();
        let mut store = build_store(64);
        let mut c = MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);

        insert(&mut c, "0");
        insert(&mut c, "a");
        insert(&mut c, "ab>");
        let sid = c.store.find_signature("ab>").unwrap();

        // "ba>" relabels to the same placeholder name and is dropped as a
        // duplicate; as a raw orientation it still resolves to the class
        // under the a<->b transform.
        insert(&mut c, "ba>");
        assert_eq!(c.skip_duplicate, 1);
        assert_eq!(c.store.num_signature() - 1, 3);
        let mut tree = TinyTree::new(&cfg);
        tree.decode_fast("ba>");
        let (found, tid) = c.store.lookup_imprint_associative(&tree).unwrap();
        assert_eq!(found, sid);
        assert_ne!(tid, 0);
    }

    #[test]
    fn test_safe_supersedes_unsafe() {
        let cfg = ainf_config();
        let mut store = build_store(64);
        let mut c = MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);

        for name in ["0", "a", "ab&", "ab+"] {
            insert(&mut c, name);
        }

        // (a&b)|(a&c): tails resolve through "ab&", but the heads are
        // 2-node structures with no members yet, so it lands unsafe.
        insert(&mut c, "ab&ac&+");
        let sid = c.store.find_signature("ab&ac&+").unwrap();
        assert!(!c.store.signature(sid).is_safe());
        let first_unsafe = c.store.signature(sid).first_member;
        assert_ne!(first_unsafe, 0);
        assert!(!c.store.member(first_unsafe).is_safe());

        // a&(b|c) is the same class, one node smaller, and fully
        // resolvable: the unsafe member is flushed and the group promotes.
        insert(&mut c, "abc+&");
        assert!(c.store.signature(sid).is_safe());
        let first = c.store.signature(sid).first_member;
        assert!(c.store.member(first).is_safe());
        // The stale unsafe member was orphaned; its freed slot holds the
        // safe replacement now.
        assert_eq!(first, first_unsafe);
        assert_eq!(c.store.member(first).name_str(), "abc+&");

        c.finalise().unwrap();
        c.validate_groups().unwrap();
        // After compaction the orphan is gone: 0, a, ab&, ab+ and one
        // safe member for the promoted class.
        let live = (1..c.store.num_member())
            .filter(|&m| c.store.member(m).sid != 0)
            .count();
        assert_eq!(live, 5);
    }

    #[test]
    fn test_truncation_winds_down_cleanly() {
        let cfg = ainf_config();
        let mut store = build_store(6);
        let opts = CollectorOptions {
            truncate: true,
            ..CollectorOptions::default()
        };
        let mut c = MemberCollector::new(&cfg, &mut store, opts, None);

        let names = ["0", "a", "ab&", "ab+", "ab>", "ab^", "abc!", "abc?", "ab^c^"];
        let mut stopped = false;
        for name in names {
            if !insert(&mut c, name) {
                stopped = true;
                break;
            }
        }
        assert!(stopped);
        let t = c.truncated.clone().unwrap();
        assert!(t.progress > 0);

        c.finalise().unwrap();
        assert!(c.store.num_member() <= 6);

        let summary = c.summary(1);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"truncated\""));
    }

    #[test]
    fn test_finalise_is_idempotent() {
        let cfg = ainf_config();
        let mut store = build_store(64);
        let mut c = MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);

        // Components land before the structures that use them, so safety
        // is at its fixed point going into finalisation.
        for name in ["0", "a", "ab&", "ab+", "ab^", "ab^c^"] {
            insert(&mut c, name);
        }
        c.finalise().unwrap();
        let image1 = c.store.to_image(true);
        c.finalise().unwrap();
        let image2 = c.store.to_image(true);

        let stamp = 23 * 4..23 * 4 + 32;
        assert_eq!(image1[..stamp.start], image2[..stamp.start]);
        assert_eq!(image1[stamp.end..], image2[stamp.end..]);
    }

    #[test]
    fn test_read_only_mode_marks_groups_without_members() {
        let cfg = ainf_config();
        let mut store = build_store(64);
        {
            let mut c =
                MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);
            insert(&mut c, "0");
            insert(&mut c, "a");
            insert(&mut c, "ab&ac&+");
            c.finalise().unwrap();
        }

        let num_member = store.num_member();
        let opts = CollectorOptions {
            read_only: true,
            ..CollectorOptions::default()
        };
        let mut c = MemberCollector::new(&cfg, &mut store, opts, None);
        // Same class, different name; accepted, but only as a non-empty
        // marker.
        insert(&mut c, "abc+&");
        assert_eq!(c.store.num_member(), num_member);
        let sid = c.store.find_signature("ab&ac&+").unwrap();
        assert_eq!(c.store.signature(sid).first_member, 1);
    }

    #[test]
    fn test_compare_members_orders_safe_then_score() {
        let cfg = Config::default();
        let mut safe = Member::default();
        safe.name = pack_name("ab&");
        safe.sid = 1;
        safe.flags = Member::SAFE;
        let mut unsafe_m = Member::default();
        unsafe_m.name = pack_name("ab+");
        unsafe_m.sid = 1;
        assert_eq!(compare_members(&cfg, &safe, &unsafe_m), Ordering::Less);

        let mut small = Member::default();
        small.name = pack_name("ab^");
        small.sid = 2;
        small.flags = Member::SAFE;
        let mut big = Member::default();
        big.name = pack_name("ab^c^");
        big.sid = 2;
        big.flags = Member::SAFE;
        assert_eq!(compare_members(&cfg, &small, &big), Ordering::Less);

        let orphan = Member::default();
        assert_eq!(compare_members(&cfg, &safe, &orphan), Ordering::Less);
        assert_eq!(compare_members(&cfg, &orphan, &safe), Ordering::Greater);
    }

    #[test]
    fn test_brief_text_lists_members() {
        let cfg = ainf_config();
        let mut store = build_store(64);
        let mut out: Vec<u8> = Vec::new();
        {
            let opts = CollectorOptions {
                text: TextMode::Brief,
                ..CollectorOptions::default()
            };
            let mut c = MemberCollector::new(&cfg, &mut store, opts, Some(&mut out));
            insert(&mut c, "0");
            insert(&mut c, "a");
            insert(&mut c, "ab&");
            c.finalise().unwrap();
            c.write_text().unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.contains(&"ab&"));
    }
}
