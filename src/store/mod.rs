// SPDX-License-Identifier: Apache-2.0

//! The packed database: entity tables plus their hash indices, held as
//! contiguous arrays sized at open time.
//!
//! Conventions shared by every table:
//! - id 0 is reserved; the first slot of each data table is a zeroed
//!   sentinel and hash indices store 0 for "empty".
//! - indices are open-addressed with a double-hash step and must be sized
//!   prime;
//! - data capacity checks happen on add, surfacing `CapacityExceeded`.

pub mod layout;
pub mod policy;
pub mod section;

use std::sync::Arc;

use crate::error::{Error, Result, Section};
use crate::footprint::Footprint;
use crate::transform::TransformTables;
use crate::{MAX_TRANSFORM, SLOT_COUNT, TREE_NAME_LEN};

pub use section::{mask, SectionView};

/// Signature names stay small; the canonical form of anything the
/// generator emits for one address space fits well under this.
pub const SIG_NAME_LEN: usize = 32;

/// Maximum distinct head references per member.
pub const MAX_HEAD: usize = 6;

/// Hint vector width: one entry per interleave preset.
pub const HINT_WIDTH: usize = 16;

/// Creation flag bits persisted in the file header.
pub mod flags {
    pub const PURE: u32 = 1 << 0;
    pub const PARANOID: u32 = 1 << 1;
    pub const ADD_IF_NOT_FOUND: u32 = 1 << 2;
}

/// A canonical equivalence class.
#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub name: [u8; SIG_NAME_LEN],
    pub size: u8,
    pub num_placeholder: u8,
    pub num_endpoint: u8,
    pub num_back_ref: u8,
    pub flags: u32,
    /// Head of the intra-signature member chain.
    pub first_member: u32,
    /// Optional link to a hint record.
    pub hint_id: u32,
}

impl Signature {
    pub const SAFE: u32 = 1 << 0;

    pub fn name_str(&self) -> &str {
        name_str(&self.name)
    }

    pub fn is_safe(&self) -> bool {
        self.flags & Self::SAFE != 0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Signature {
            name: [0; SIG_NAME_LEN],
            size: 0,
            num_placeholder: 0,
            num_endpoint: 0,
            num_back_ref: 0,
            flags: 0,
            first_member: 0,
            hint_id: 0,
        }
    }
}

/// Measured imprint counts per interleave preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hint {
    pub num_stored: [u32; HINT_WIDTH],
}

/// One associative entry: the 512-bit key, the signature it identifies,
/// and the row transform the footprint was taken under (needed to report
/// the matching permutation at lookup time).
#[derive(Debug, Clone, Copy, Default)]
pub struct Imprint {
    pub footprint: Footprint,
    pub sid: u32,
    pub tid: u32,
}

/// An accepted concrete tree representing a signature.
#[derive(Debug, Clone, Copy)]
pub struct Member {
    pub name: [u8; TREE_NAME_LEN],
    pub sid: u32,
    /// Transform from the canonical form to this stored form.
    pub tid: u32,
    pub size: u8,
    pub num_placeholder: u8,
    pub num_endpoint: u8,
    pub num_back_ref: u8,
    pub flags: u32,
    /// Pair ids for the Q/T/F component sub-members; 0 = none.
    pub q_pair: u32,
    pub t_pair: u32,
    pub f_pair: u32,
    pub heads: [u32; MAX_HEAD],
    pub next_member: u32,
}

impl Member {
    pub const SAFE: u32 = 1 << 0;
    pub const COMPONENT: u32 = 1 << 1;
    pub const DEPRECATED: u32 = 1 << 2;

    pub fn name_str(&self) -> &str {
        name_str(&self.name)
    }

    pub fn is_safe(&self) -> bool {
        self.flags & Self::SAFE != 0
    }
}

impl Default for Member {
    fn default() -> Self {
        Member {
            name: [0; TREE_NAME_LEN],
            sid: 0,
            tid: 0,
            size: 0,
            num_placeholder: 0,
            num_endpoint: 0,
            num_back_ref: 0,
            flags: 0,
            q_pair: 0,
            t_pair: 0,
            f_pair: 0,
            heads: [0; MAX_HEAD],
            next_member: 0,
        }
    }
}

/// "Sub-component X under permutation Y", deduplicated by its own index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pair {
    pub member_id: u32,
    pub transform_id: u32,
}

fn name_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

/// Copy a name into a fixed field, zero padded.
pub fn pack_name<const N: usize>(name: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = name.as_bytes();
    assert!(bytes.len() <= N, "name too long for record: {name}");
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

#[derive(Debug)]
pub struct Store {
    /// Flags the database was created under.
    pub creation_flags: u32,

    pub interleave: u32,
    pub interleave_step: u32,

    pub fwd_transforms: SectionView<u64>,
    pub rev_transforms: SectionView<u64>,
    pub fwd_transform_names: SectionView<[u8; SLOT_COUNT]>,
    pub rev_transform_names: SectionView<[u8; SLOT_COUNT]>,
    pub rev_transform_ids: SectionView<u32>,

    pub max_signature: u32,
    pub signatures: SectionView<Signature>,
    pub signature_index_size: u32,
    pub signature_index: SectionView<u32>,

    pub max_hint: u32,
    pub hints: SectionView<Hint>,
    pub hint_index_size: u32,
    pub hint_index: SectionView<u32>,

    pub max_imprint: u32,
    pub imprints: SectionView<Imprint>,
    pub imprint_index_size: u32,
    pub imprint_index: SectionView<u32>,

    pub max_member: u32,
    pub members: SectionView<Member>,
    pub member_index_size: u32,
    pub member_index: SectionView<u32>,

    pub max_pair: u32,
    pub pairs: SectionView<Pair>,
    pub pair_index_size: u32,
    pub pair_index: SectionView<u32>,
}

impl Store {
    /// A freshly created database: transforms only, every other section at
    /// its minimal single-sentinel size. Transforms are computed once and
    /// inherited ever after.
    pub fn new_root() -> Self {
        let t = TransformTables::shared();
        Store {
            creation_flags: 0,
            interleave: 0,
            interleave_step: 0,
            fwd_transforms: SectionView::Inherited(Arc::clone(&t.fwd_packed)),
            rev_transforms: SectionView::Inherited(Arc::clone(&t.rev_packed)),
            fwd_transform_names: SectionView::Inherited(Arc::clone(&t.fwd_names)),
            rev_transform_names: SectionView::Inherited(Arc::clone(&t.rev_names)),
            rev_transform_ids: SectionView::Inherited(Arc::clone(&t.rev_ids)),
            max_signature: 1,
            signatures: SectionView::Owned(vec![Signature::default()]),
            signature_index_size: 0,
            signature_index: SectionView::empty(),
            max_hint: 1,
            hints: SectionView::Owned(vec![Hint::default()]),
            hint_index_size: 0,
            hint_index: SectionView::empty(),
            max_imprint: 1,
            imprints: SectionView::Owned(vec![Imprint::default()]),
            imprint_index_size: 0,
            imprint_index: SectionView::empty(),
            max_member: 1,
            members: SectionView::Owned(vec![Member::default()]),
            member_index_size: 0,
            member_index: SectionView::empty(),
            max_pair: 1,
            pairs: SectionView::Owned(vec![Pair::default()]),
            pair_index_size: 0,
            pair_index: SectionView::empty(),
        }
    }

    pub fn num_transform(&self) -> u32 {
        self.fwd_transforms.len() as u32
    }

    pub fn num_signature(&self) -> u32 {
        self.signatures.len() as u32
    }

    pub fn num_hint(&self) -> u32 {
        self.hints.len() as u32
    }

    pub fn num_imprint(&self) -> u32 {
        self.imprints.len() as u32
    }

    pub fn num_member(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn num_pair(&self) -> u32 {
        self.pairs.len() as u32
    }

    pub fn has_transforms(&self) -> bool {
        self.num_transform() == MAX_TRANSFORM
    }

    /*
     * Transform accessors
     */

    pub fn fwd_packed(&self, tid: u32) -> u64 {
        self.fwd_transforms[tid as usize]
    }

    pub fn rev_packed(&self, tid: u32) -> u64 {
        self.rev_transforms[tid as usize]
    }

    pub fn rev_id(&self, tid: u32) -> u32 {
        self.rev_transform_ids[tid as usize]
    }

    pub fn fwd_name(&self, tid: u32) -> &str {
        std::str::from_utf8(&self.fwd_transform_names.as_slice()[tid as usize]).unwrap()
    }

    pub fn rev_name(&self, tid: u32) -> &str {
        std::str::from_utf8(&self.rev_transform_names.as_slice()[tid as usize]).unwrap()
    }

    /// Forward transform id for a skin name. Arithmetic: transforms are
    /// laid out in lexicographic name order.
    pub fn lookup_fwd_transform(&self, skin: &str) -> Option<u32> {
        crate::transform::perm_of_name(skin).map(|p| crate::transform::rank(&p))
    }

    /// Reverse transform id for a skin name: the id whose inverse carries
    /// this name.
    pub fn lookup_rev_transform(&self, skin: &str) -> Option<u32> {
        crate::transform::perm_of_name(skin)
            .map(|p| crate::transform::rank(&crate::transform::inverse(&p)))
    }

    /*
     * Signatures
     */

    pub fn signature(&self, sid: u32) -> &Signature {
        &self.signatures.as_slice()[sid as usize]
    }

    pub fn signature_mut(&mut self, sid: u32) -> &mut Signature {
        &mut self.signatures.owned_mut()[sid as usize]
    }

    pub fn find_signature(&self, name: &str) -> Option<u32> {
        let sigs = self.signatures.as_slice();
        probe(self.signature_index.as_slice(), fnv1a(name.as_bytes()), |id| {
            sigs[id as usize].name_str() == name
        })
        .found()
    }

    pub fn add_signature(&mut self, sig: Signature) -> Result<u32> {
        if self.num_signature() >= self.max_signature {
            return Err(Error::CapacityExceeded {
                section: Section::Signature,
                progress: 0,
            });
        }
        let sid = self.num_signature();
        let hash = fnv1a(sig.name_str().as_bytes());
        self.signatures.owned_mut().push(sig);
        let sigs = self.signatures.as_slice();
        let slot = probe(self.signature_index.as_slice(), hash, |id| {
            sigs[id as usize].name_str() == sigs[sid as usize].name_str()
        })
        .empty_slot();
        self.signature_index.owned_mut()[slot] = sid;
        Ok(sid)
    }

    /*
     * Hints
     */

    pub fn hint(&self, hid: u32) -> &Hint {
        &self.hints.as_slice()[hid as usize]
    }

    pub fn find_hint(&self, hint: &Hint) -> Option<u32> {
        let hints = self.hints.as_slice();
        probe(self.hint_index.as_slice(), hash_hint(hint), |id| {
            hints[id as usize] == *hint
        })
        .found()
    }

    pub fn add_hint(&mut self, hint: Hint) -> Result<u32> {
        if self.num_hint() >= self.max_hint {
            return Err(Error::CapacityExceeded {
                section: Section::Hint,
                progress: 0,
            });
        }
        let hid = self.num_hint();
        let slot = probe(self.hint_index.as_slice(), hash_hint(&hint), |_| false).empty_slot();
        self.hints.owned_mut().push(hint);
        self.hint_index.owned_mut()[slot] = hid;
        Ok(hid)
    }

    pub fn intern_hint(&mut self, hint: Hint) -> Result<u32> {
        match self.find_hint(&hint) {
            Some(hid) => Ok(hid),
            None => self.add_hint(hint),
        }
    }

    /*
     * Imprints
     */

    pub fn imprint(&self, iid: u32) -> &Imprint {
        &self.imprints.as_slice()[iid as usize]
    }

    pub fn find_imprint(&self, fp: &Footprint) -> Option<u32> {
        let imprints = self.imprints.as_slice();
        probe(self.imprint_index.as_slice(), fp.hash64(), |id| {
            imprints[id as usize].footprint == *fp
        })
        .found()
    }

    pub fn add_imprint(&mut self, imp: Imprint) -> Result<u32> {
        if self.num_imprint() >= self.max_imprint {
            return Err(Error::CapacityExceeded {
                section: Section::Imprint,
                progress: 0,
            });
        }
        let iid = self.num_imprint();
        let slot = probe(self.imprint_index.as_slice(), imp.footprint.hash64(), |_| false)
            .empty_slot();
        self.imprints.owned_mut().push(imp);
        self.imprint_index.owned_mut()[slot] = iid;
        Ok(iid)
    }

    /// Drop all imprints and clear the index, keeping the sentinel.
    pub fn clear_imprints(&mut self) {
        let imprints = self.imprints.owned_mut();
        imprints.truncate(1);
        if imprints.is_empty() {
            imprints.push(Imprint::default());
        }
        self.imprint_index.owned_mut().fill(0);
    }

    /*
     * Members
     */

    pub fn member(&self, mid: u32) -> &Member {
        &self.members.as_slice()[mid as usize]
    }

    pub fn member_mut(&mut self, mid: u32) -> &mut Member {
        &mut self.members.owned_mut()[mid as usize]
    }

    pub fn find_member(&self, name: &str) -> Option<u32> {
        let members = self.members.as_slice();
        probe(self.member_index.as_slice(), fnv1a(name.as_bytes()), |id| {
            members[id as usize].name_str() == name
        })
        .found()
    }

    /// Append a member record. The caller indexes it (or reuses a freed
    /// slot instead and indexes that).
    pub fn add_member(&mut self, member: Member) -> Result<u32> {
        if self.num_member() >= self.max_member {
            return Err(Error::CapacityExceeded {
                section: Section::Member,
                progress: 0,
            });
        }
        let mid = self.num_member();
        self.members.owned_mut().push(member);
        Ok(mid)
    }

    /// Insert `mid` into the name index under its current name.
    pub fn index_member(&mut self, mid: u32) {
        let members = self.members.as_slice();
        let name = members[mid as usize].name_str();
        let slot = probe(self.member_index.as_slice(), fnv1a(name.as_bytes()), |id| {
            members[id as usize].name_str() == name
        })
        .empty_slot();
        self.member_index.owned_mut()[slot] = mid;
    }

    /*
     * Pairs
     */

    pub fn pair(&self, pid: u32) -> &Pair {
        &self.pairs.as_slice()[pid as usize]
    }

    pub fn find_pair(&self, member_id: u32, transform_id: u32) -> Option<u32> {
        let pairs = self.pairs.as_slice();
        let key = Pair {
            member_id,
            transform_id,
        };
        probe(self.pair_index.as_slice(), hash_pair(&key), |id| pairs[id as usize] == key).found()
    }

    pub fn add_pair(&mut self, member_id: u32, transform_id: u32) -> Result<u32> {
        if self.num_pair() >= self.max_pair {
            return Err(Error::CapacityExceeded {
                section: Section::Pair,
                progress: 0,
            });
        }
        let pair = Pair {
            member_id,
            transform_id,
        };
        let pid = self.num_pair();
        let slot = probe(self.pair_index.as_slice(), hash_pair(&pair), |_| false).empty_slot();
        self.pairs.owned_mut().push(pair);
        self.pair_index.owned_mut()[slot] = pid;
        Ok(pid)
    }

    pub fn intern_pair(&mut self, member_id: u32, transform_id: u32) -> Result<u32> {
        match self.find_pair(member_id, transform_id) {
            Some(pid) => Ok(pid),
            None => self.add_pair(member_id, transform_id),
        }
    }

    /// Drop all pairs and clear their index, keeping the sentinel.
    pub fn clear_pairs(&mut self) {
        let pairs = self.pairs.owned_mut();
        pairs.truncate(1);
        if pairs.is_empty() {
            pairs.push(Pair::default());
        }
        self.pair_index.owned_mut().fill(0);
    }

    /*
     * Index rebuilds (signature/hint/member/pair name indices).
     * Imprints rebuild through the imprint engine, which needs trees.
     */

    pub fn rebuild_indices(&mut self, rebuild_mask: u32) {
        if rebuild_mask & mask::SIGNATURE_INDEX != 0 && self.signature_index_size > 0 {
            self.signature_index.owned_mut().fill(0);
            for sid in 1..self.num_signature() {
                let name = self.signature(sid).name_str().to_string();
                let slot = probe(self.signature_index.as_slice(), fnv1a(name.as_bytes()), |id| {
                    self.signatures.as_slice()[id as usize].name_str() == name
                })
                .empty_slot();
                self.signature_index.owned_mut()[slot] = sid;
            }
        }

        if rebuild_mask & mask::HINT_INDEX != 0 && self.hint_index_size > 0 {
            self.hint_index.owned_mut().fill(0);
            for hid in 1..self.num_hint() {
                let hint = *self.hint(hid);
                let slot =
                    probe(self.hint_index.as_slice(), hash_hint(&hint), |_| false).empty_slot();
                self.hint_index.owned_mut()[slot] = hid;
            }
        }

        if rebuild_mask & mask::IMPRINT_INDEX != 0 && self.imprint_index_size > 0 {
            self.imprint_index.owned_mut().fill(0);
            for iid in 1..self.num_imprint() {
                let hash = self.imprint(iid).footprint.hash64();
                let slot = probe(self.imprint_index.as_slice(), hash, |_| false).empty_slot();
                self.imprint_index.owned_mut()[slot] = iid;
            }
        }

        if rebuild_mask & mask::MEMBER_INDEX != 0 && self.member_index_size > 0 {
            self.member_index.owned_mut().fill(0);
            for mid in 1..self.num_member() {
                if self.member(mid).sid != 0 {
                    self.index_member(mid);
                }
            }
        }

        if rebuild_mask & mask::PAIR_INDEX != 0 && self.pair_index_size > 0 {
            self.pair_index.owned_mut().fill(0);
            for pid in 1..self.num_pair() {
                let pair = *self.pair(pid);
                let slot =
                    probe(self.pair_index.as_slice(), hash_pair(&pair), |_| false).empty_slot();
                self.pair_index.owned_mut()[slot] = pid;
            }
        }
    }

    /// Structured description of the store, emitted as JSON by the tools.
    pub fn info(&self) -> StoreInfo {
        StoreInfo {
            flags: flags_to_text(self.creation_flags),
            interleave: self.interleave,
            interleave_step: self.interleave_step,
            num_transform: self.num_transform(),
            num_signature: self.num_signature(),
            max_signature: self.max_signature,
            signature_index_size: self.signature_index_size,
            num_hint: self.num_hint(),
            max_hint: self.max_hint,
            hint_index_size: self.hint_index_size,
            num_imprint: self.num_imprint(),
            max_imprint: self.max_imprint,
            imprint_index_size: self.imprint_index_size,
            num_member: self.num_member(),
            max_member: self.max_member,
            member_index_size: self.member_index_size,
            num_pair: self.num_pair(),
            max_pair: self.max_pair,
            pair_index_size: self.pair_index_size,
        }
    }

    /// Full structural validation: reference ordering, chain safety,
    /// prime index sizes and the transform algebra. Costs a pass over
    /// every table (plus a transform spot-check), so callers gate it on
    /// the paranoid flag.
    pub fn validate(&self) -> Result<()> {
        use crate::transform as tf;

        // Transforms: count, identity at id 0, inverse cross-links.
        if self.num_transform() != 0 {
            if !self.has_transforms() {
                return Err(Error::Inconsistent(format!(
                    "transform section holds {} of {} entries",
                    self.num_transform(),
                    MAX_TRANSFORM
                )));
            }
            if self.fwd_packed(0) != tf::pack(&tf::IDENTITY) {
                return Err(Error::Inconsistent("transform 0 is not identity".into()));
            }
            let mut tid = 0u32;
            while tid < MAX_TRANSFORM {
                let fwd = tf::unpack(self.fwd_packed(tid));
                let rev = tf::unpack(self.rev_packed(tid));
                if tf::compose(&fwd, &rev) != tf::IDENTITY {
                    return Err(Error::Inconsistent(format!(
                        "transform {tid}: fwd∘rev is not identity"
                    )));
                }
                if self.rev_id(self.rev_id(tid)) != tid {
                    return Err(Error::Inconsistent(format!(
                        "transform {tid}: reverse id cross-link broken"
                    )));
                }
                // Deterministic stride keeps this affordable.
                tid += 977;
            }
        }

        // Indices must be prime-sized (or the degenerate 0/1).
        for (name, size) in [
            ("signature", self.signature_index_size),
            ("hint", self.hint_index_size),
            ("imprint", self.imprint_index_size),
            ("member", self.member_index_size),
            ("pair", self.pair_index_size),
        ] {
            if size > 1 && !is_prime(size as u64) {
                return Err(Error::Inconsistent(format!(
                    "{name} index size {size} is not prime"
                )));
            }
        }

        // Safe signatures chain a safe member first.
        for sid in 1..self.num_signature() {
            let sig = self.signature(sid);
            if sig.is_safe() {
                if sig.first_member == 0 {
                    return Err(Error::Inconsistent(format!(
                        "safe signature {sid} has no members"
                    )));
                }
                if sig.first_member < self.num_member()
                    && !self.member(sig.first_member).is_safe()
                {
                    return Err(Error::Inconsistent(format!(
                        "safe signature {sid} chains unsafe member {}",
                        sig.first_member
                    )));
                }
            }
        }

        // Members reference only smaller ids, through pairs and heads.
        for mid in 1..self.num_member() {
            let m = self.member(mid);
            if m.sid == 0 {
                continue; // free-listed orphan
            }
            if m.sid >= self.num_signature() {
                return Err(Error::Inconsistent(format!(
                    "member {mid} references signature {} of {}",
                    m.sid,
                    self.num_signature()
                )));
            }
            for pid in [m.q_pair, m.t_pair, m.f_pair] {
                if pid == 0 {
                    continue;
                }
                if pid >= self.num_pair() {
                    return Err(Error::Inconsistent(format!(
                        "member {mid} references pair {pid} of {}",
                        self.num_pair()
                    )));
                }
                if self.pair(pid).member_id >= mid {
                    return Err(Error::Inconsistent(format!(
                        "member {mid} references component {} out of order",
                        self.pair(pid).member_id
                    )));
                }
            }
            for head in m.heads {
                if head >= mid {
                    return Err(Error::Inconsistent(format!(
                        "member {mid} references head {head} out of order"
                    )));
                }
            }
        }

        // Imprints point at live signatures and stored row transforms.
        for iid in 1..self.num_imprint() {
            let imp = self.imprint(iid);
            if imp.sid == 0 || imp.sid >= self.num_signature() {
                return Err(Error::Inconsistent(format!(
                    "imprint {iid} references signature {} of {}",
                    imp.sid,
                    self.num_signature()
                )));
            }
            if self.interleave_step != 0 && imp.tid % self.interleave_step != 0 {
                return Err(Error::Inconsistent(format!(
                    "imprint {iid} stored under off-row transform {}",
                    imp.tid
                )));
            }
        }

        Ok(())
    }

    /// Which sections currently hold data, for the file header.
    pub fn section_mask(&self) -> u32 {
        let mut m = 0;
        if self.has_transforms() {
            m |= mask::TRANSFORM;
        }
        if self.num_signature() > 0 {
            m |= mask::SIGNATURE;
        }
        if self.signature_index_size > 0 {
            m |= mask::SIGNATURE_INDEX;
        }
        if self.num_hint() > 0 {
            m |= mask::HINT;
        }
        if self.hint_index_size > 0 {
            m |= mask::HINT_INDEX;
        }
        if self.num_imprint() > 0 {
            m |= mask::IMPRINT;
        }
        if self.imprint_index_size > 0 {
            m |= mask::IMPRINT_INDEX;
        }
        if self.num_member() > 0 {
            m |= mask::MEMBER;
        }
        if self.member_index_size > 0 {
            m |= mask::MEMBER_INDEX;
        }
        if self.num_pair() > 0 {
            m |= mask::PAIR;
        }
        if self.pair_index_size > 0 {
            m |= mask::PAIR_INDEX;
        }
        m
    }
}

/// JSON-serialisable store description.
#[derive(Debug, serde::Serialize)]
pub struct StoreInfo {
    pub flags: String,
    pub interleave: u32,
    pub interleave_step: u32,
    pub num_transform: u32,
    pub num_signature: u32,
    pub max_signature: u32,
    pub signature_index_size: u32,
    pub num_hint: u32,
    pub max_hint: u32,
    pub hint_index_size: u32,
    pub num_imprint: u32,
    pub max_imprint: u32,
    pub imprint_index_size: u32,
    pub num_member: u32,
    pub max_member: u32,
    pub member_index_size: u32,
    pub num_pair: u32,
    pub max_pair: u32,
    pub pair_index_size: u32,
}

/// Creation flags as text for diagnostics.
pub fn flags_to_text(f: u32) -> String {
    let mut out: Vec<&str> = Vec::new();
    if f & flags::PURE != 0 {
        out.push("pure");
    }
    if f & flags::PARANOID != 0 {
        out.push("paranoid");
    }
    if f & flags::ADD_IF_NOT_FOUND != 0 {
        out.push("ainf");
    }
    out.join(",")
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

/*
 * Hashing
 */

pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

fn hash_hint(hint: &Hint) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for v in hint.num_stored {
        h ^= v as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

fn hash_pair(pair: &Pair) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    h ^= pair.member_id as u64;
    h = h.wrapping_mul(0x0000_0100_0000_01b3);
    h ^= pair.transform_id as u64;
    h.wrapping_mul(0x0000_0100_0000_01b3)
}

pub enum Slot {
    Found { pos: usize, id: u32 },
    Empty { pos: usize },
}

impl Slot {
    pub fn found(&self) -> Option<u32> {
        match self {
            Slot::Found { id, .. } => Some(*id),
            Slot::Empty { .. } => None,
        }
    }

    pub fn empty_slot(&self) -> usize {
        match self {
            Slot::Empty { pos } => *pos,
            Slot::Found { pos, .. } => *pos,
        }
    }
}

/// Open-addressed walk: start at `hash % size`, advance by a double-hash
/// step (sizes are prime, so the walk covers the whole table). Id 0 marks
/// an empty slot.
pub fn probe(index: &[u32], hash: u64, is_match: impl Fn(u32) -> bool) -> Slot {
    let size = index.len() as u64;
    if size == 0 {
        return Slot::Empty { pos: 0 };
    }
    let mut ix = (hash % size) as usize;
    let step = if size > 2 {
        (hash % (size - 2)) as usize + 1
    } else {
        1
    };
    for _ in 0..index.len() {
        let id = index[ix];
        if id == 0 {
            return Slot::Empty { pos: ix };
        }
        if is_match(id) {
            return Slot::Found { pos: ix, id };
        }
        ix = (ix + step) % size as usize;
    }
    panic!("hash index full; the sizing policy guarantees headroom");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store() -> Store {
        let mut s = Store::new_root();
        s.max_signature = 16;
        s.signature_index_size = 31;
        s.signature_index = SectionView::Owned(vec![0; 31]);
        s.max_member = 16;
        s.member_index_size = 31;
        s.member_index = SectionView::Owned(vec![0; 31]);
        s.max_pair = 16;
        s.pair_index_size = 31;
        s.pair_index = SectionView::Owned(vec![0; 31]);
        s.max_hint = 16;
        s.hint_index_size = 31;
        s.hint_index = SectionView::Owned(vec![0; 31]);
        s
    }

    #[test]
    fn test_signature_add_and_find() {
        let mut s = small_store();
        let mut sig = Signature::default();
        sig.name = pack_name("ab&");
        sig.size = 1;
        let sid = s.add_signature(sig).unwrap();
        assert_eq!(sid, 1);
        assert_eq!(s.find_signature("ab&"), Some(1));
        assert_eq!(s.find_signature("ab+"), None);
    }

    #[test]
    fn test_capacity_one_section_accepts_exactly_one() {
        let mut s = small_store();
        s.max_pair = 2;
        assert!(s.add_pair(5, 7).is_ok());
        match s.add_pair(6, 8) {
            Err(Error::CapacityExceeded { section, .. }) => assert_eq!(section, Section::Pair),
            other => panic!("expected capacity error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_pair_interning_dedups() {
        let mut s = small_store();
        let p1 = s.intern_pair(3, 200_000).unwrap();
        let p2 = s.intern_pair(3, 200_000).unwrap();
        let p3 = s.intern_pair(3, 200_001).unwrap();
        assert_eq!(p1, p2);
        assert_ne!(p1, p3);
    }

    #[test]
    fn test_hint_interning_dedups() {
        let mut s = small_store();
        let mut h = Hint::default();
        h.num_stored[7] = 504;
        let h1 = s.intern_hint(h).unwrap();
        let h2 = s.intern_hint(h).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(s.num_hint(), 2);
    }

    #[test]
    fn test_member_free_slot_reuse_keeps_index_walkable() {
        let mut s = small_store();
        let mut m = Member::default();
        m.name = pack_name("ab&");
        m.sid = 1;
        let mid = s.add_member(m).unwrap();
        s.index_member(mid);

        // Orphan it the way the collector does: zero the record.
        *s.member_mut(mid) = Member::default();
        assert_eq!(s.find_member("ab&"), None);

        // Reuse the slot under a different name.
        let mut m2 = Member::default();
        m2.name = pack_name("ab+");
        m2.sid = 2;
        *s.member_mut(mid) = m2;
        s.index_member(mid);
        assert_eq!(s.find_member("ab+"), Some(mid));
    }

    #[test]
    fn test_transform_cross_links() {
        let s = Store::new_root();
        assert!(s.has_transforms());
        assert_eq!(s.fwd_name(0), "abcdefghi");
        assert_eq!(s.lookup_fwd_transform("abcdefghi"), Some(0));
        let tid = s.lookup_fwd_transform("bacdefghi").unwrap();
        assert_eq!(s.rev_id(tid), s.lookup_rev_transform("bacdefghi").unwrap());
    }
}
