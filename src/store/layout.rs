// SPDX-License-Identifier: Apache-2.0

//! On-disk format: a fixed header followed by each section at a
//! header-declared byte offset. All multi-byte integers are little-endian;
//! footprints are 64 bytes (8 × u64).
//!
//! Section order: transforms (forward data, reverse data, forward names,
//! reverse names, reverse ids), signatures + index, hints + index,
//! imprints + index, members + index, pairs + index.

use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::footprint::{Footprint, QUADS};
use crate::store::section::{mask, SectionView};
use crate::store::{
    Hint, Imprint, Member, Pair, Signature, Store, HINT_WIDTH, MAX_HEAD, SIG_NAME_LEN,
};
use crate::{SLOT_COUNT, TREE_NAME_LEN};

const MAGIC: u32 = 0x4D55_5844; // "MUXD"
const VERSION: u32 = 1;

/// Fixed header length in bytes: 23 u32 fields, a 32-byte creation
/// timestamp, and 15 u64 section offsets.
const HEADER_LEN: usize = 23 * 4 + 32 + 15 * 8;

const SIG_REC_LEN: usize = SIG_NAME_LEN + 4 + 4 + 4 + 4;
const HINT_REC_LEN: usize = HINT_WIDTH * 4;
const IMPRINT_REC_LEN: usize = QUADS * 8 + 4 + 4;
const MEMBER_REC_LEN: usize = TREE_NAME_LEN + 4 + 4 + 4 + 4 + 4 + 4 + 4 + MAX_HEAD * 4 + 4;
const PAIR_REC_LEN: usize = 8;

fn corrupt(detail: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("database image: {detail}"),
    ))
}

/*
 * Little-endian primitives
 */

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn pos(&self) -> u64 {
        self.buf.len() as u64
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(corrupt("short read"));
        }
        let b = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(b)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos as usize > self.buf.len() {
            return Err(corrupt("offset beyond image"));
        }
        self.pos = pos as usize;
        Ok(())
    }
}

/*
 * Record codecs
 */

fn enc_signature(w: &mut Writer, s: &Signature) {
    w.bytes(&s.name);
    w.buf.push(s.size);
    w.buf.push(s.num_placeholder);
    w.buf.push(s.num_endpoint);
    w.buf.push(s.num_back_ref);
    w.u32(s.flags);
    w.u32(s.first_member);
    w.u32(s.hint_id);
}

fn dec_signature(r: &mut Reader) -> Result<Signature> {
    let mut name = [0u8; SIG_NAME_LEN];
    name.copy_from_slice(r.take(SIG_NAME_LEN)?);
    let counts = r.take(4)?;
    Ok(Signature {
        name,
        size: counts[0],
        num_placeholder: counts[1],
        num_endpoint: counts[2],
        num_back_ref: counts[3],
        flags: r.u32()?,
        first_member: r.u32()?,
        hint_id: r.u32()?,
    })
}

fn enc_hint(w: &mut Writer, h: &Hint) {
    for v in h.num_stored {
        w.u32(v);
    }
}

fn dec_hint(r: &mut Reader) -> Result<Hint> {
    let mut h = Hint::default();
    for v in h.num_stored.iter_mut() {
        *v = r.u32()?;
    }
    Ok(h)
}

fn enc_imprint(w: &mut Writer, i: &Imprint) {
    for q in i.footprint.0 {
        w.u64(q);
    }
    w.u32(i.sid);
    w.u32(i.tid);
}

fn dec_imprint(r: &mut Reader) -> Result<Imprint> {
    let mut fp = Footprint::ZERO;
    for q in fp.0.iter_mut() {
        *q = r.u64()?;
    }
    Ok(Imprint {
        footprint: fp,
        sid: r.u32()?,
        tid: r.u32()?,
    })
}

fn enc_member(w: &mut Writer, m: &Member) {
    w.bytes(&m.name);
    w.buf.push(m.size);
    w.buf.push(m.num_placeholder);
    w.buf.push(m.num_endpoint);
    w.buf.push(m.num_back_ref);
    w.u32(m.sid);
    w.u32(m.tid);
    w.u32(m.flags);
    w.u32(m.q_pair);
    w.u32(m.t_pair);
    w.u32(m.f_pair);
    for h in m.heads {
        w.u32(h);
    }
    w.u32(m.next_member);
}

fn dec_member(r: &mut Reader) -> Result<Member> {
    let mut name = [0u8; TREE_NAME_LEN];
    name.copy_from_slice(r.take(TREE_NAME_LEN)?);
    let counts = r.take(4)?;
    let mut m = Member {
        name,
        size: counts[0],
        num_placeholder: counts[1],
        num_endpoint: counts[2],
        num_back_ref: counts[3],
        sid: r.u32()?,
        tid: r.u32()?,
        flags: r.u32()?,
        q_pair: r.u32()?,
        t_pair: r.u32()?,
        f_pair: r.u32()?,
        ..Member::default()
    };
    for h in m.heads.iter_mut() {
        *h = r.u32()?;
    }
    m.next_member = r.u32()?;
    Ok(m)
}

fn enc_pair(w: &mut Writer, p: &Pair) {
    w.u32(p.member_id);
    w.u32(p.transform_id);
}

fn dec_pair(r: &mut Reader) -> Result<Pair> {
    Ok(Pair {
        member_id: r.u32()?,
        transform_id: r.u32()?,
    })
}

struct SectionOffsets {
    fwd_transforms: u64,
    rev_transforms: u64,
    fwd_transform_names: u64,
    rev_transform_names: u64,
    rev_transform_ids: u64,
    signatures: u64,
    signature_index: u64,
    hints: u64,
    hint_index: u64,
    imprints: u64,
    imprint_index: u64,
    members: u64,
    member_index: u64,
    pairs: u64,
    pair_index: u64,
}

impl Store {
    /// Serialise to a byte image.
    ///
    /// With `save_index` off, the level-1 indices and the imprint section
    /// (a level-2 index over signatures) are written empty; readers rebuild
    /// them on demand.
    pub fn to_image(&self, save_index: bool) -> Vec<u8> {
        let mut w = Writer {
            buf: Vec::with_capacity(HEADER_LEN),
        };

        // Header is written last; reserve its space.
        w.buf.resize(HEADER_LEN, 0);

        let signature_index_size = if save_index { self.signature_index_size } else { 0 };
        let hint_index_size = if save_index { self.hint_index_size } else { 0 };
        let imprint_index_size = if save_index { self.imprint_index_size } else { 0 };
        let member_index_size = if save_index { self.member_index_size } else { 0 };
        let pair_index_size = if save_index { self.pair_index_size } else { 0 };
        let (num_imprint, interleave, interleave_step) = if save_index {
            (self.num_imprint(), self.interleave, self.interleave_step)
        } else {
            (0, 0, 0)
        };

        let fwd_transforms = w.pos();
        for &v in self.fwd_transforms.as_slice() {
            w.u64(v);
        }
        let rev_transforms = w.pos();
        for &v in self.rev_transforms.as_slice() {
            w.u64(v);
        }
        let fwd_transform_names = w.pos();
        for v in self.fwd_transform_names.as_slice() {
            w.bytes(v);
        }
        let rev_transform_names = w.pos();
        for v in self.rev_transform_names.as_slice() {
            w.bytes(v);
        }
        let rev_transform_ids = w.pos();
        for &v in self.rev_transform_ids.as_slice() {
            w.u32(v);
        }

        let signatures = w.pos();
        for s in self.signatures.as_slice() {
            enc_signature(&mut w, s);
        }
        let signature_index = w.pos();
        if signature_index_size > 0 {
            for &v in self.signature_index.as_slice() {
                w.u32(v);
            }
        }

        let hints = w.pos();
        for h in self.hints.as_slice() {
            enc_hint(&mut w, h);
        }
        let hint_index = w.pos();
        if hint_index_size > 0 {
            for &v in self.hint_index.as_slice() {
                w.u32(v);
            }
        }

        let imprints = w.pos();
        if num_imprint > 0 {
            for i in self.imprints.as_slice() {
                enc_imprint(&mut w, i);
            }
        }
        let imprint_index = w.pos();
        if imprint_index_size > 0 {
            for &v in self.imprint_index.as_slice() {
                w.u32(v);
            }
        }

        let members = w.pos();
        for m in self.members.as_slice() {
            enc_member(&mut w, m);
        }
        let member_index = w.pos();
        if member_index_size > 0 {
            for &v in self.member_index.as_slice() {
                w.u32(v);
            }
        }

        let pairs = w.pos();
        for p in self.pairs.as_slice() {
            enc_pair(&mut w, p);
        }
        let pair_index = w.pos();
        if pair_index_size > 0 {
            for &v in self.pair_index.as_slice() {
                w.u32(v);
            }
        }

        let offsets = SectionOffsets {
            fwd_transforms,
            rev_transforms,
            fwd_transform_names,
            rev_transform_names,
            rev_transform_ids,
            signatures,
            signature_index,
            hints,
            hint_index,
            imprints,
            imprint_index,
            members,
            member_index,
            pairs,
            pair_index,
        };

        // Now the header.
        let mut h = Writer { buf: Vec::with_capacity(HEADER_LEN) };
        h.u32(MAGIC);
        h.u32(VERSION);
        h.u32(self.creation_flags);
        h.u32(SLOT_COUNT as u32);
        h.u32(interleave);
        h.u32(interleave_step);
        h.u32(self.num_transform());
        h.u32(self.max_signature);
        h.u32(self.num_signature());
        h.u32(signature_index_size);
        h.u32(self.max_hint);
        h.u32(self.num_hint());
        h.u32(hint_index_size);
        h.u32(self.max_imprint);
        h.u32(num_imprint);
        h.u32(imprint_index_size);
        h.u32(self.max_member);
        h.u32(self.num_member());
        h.u32(member_index_size);
        h.u32(self.max_pair);
        h.u32(self.num_pair());
        h.u32(pair_index_size);
        h.u32(self.section_mask());

        let mut stamp = [0u8; 32];
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let text = format!("unix:{now}");
        stamp[..text.len()].copy_from_slice(text.as_bytes());
        h.bytes(&stamp);

        h.u64(offsets.fwd_transforms);
        h.u64(offsets.rev_transforms);
        h.u64(offsets.fwd_transform_names);
        h.u64(offsets.rev_transform_names);
        h.u64(offsets.rev_transform_ids);
        h.u64(offsets.signatures);
        h.u64(offsets.signature_index);
        h.u64(offsets.hints);
        h.u64(offsets.hint_index);
        h.u64(offsets.imprints);
        h.u64(offsets.imprint_index);
        h.u64(offsets.members);
        h.u64(offsets.member_index);
        h.u64(offsets.pairs);
        h.u64(offsets.pair_index);

        assert_eq!(h.buf.len(), HEADER_LEN);
        w.buf[..HEADER_LEN].copy_from_slice(&h.buf);
        w.buf
    }

    pub fn save(&self, path: &Path, save_index: bool) -> Result<()> {
        let image = self.to_image(save_index);
        std::fs::write(path, image)?;
        log::info!(
            "saved {}: numSignature={} numImprint={} numMember={} numPair={}",
            path.display(),
            self.num_signature(),
            self.num_imprint(),
            self.num_member(),
            self.num_pair()
        );
        Ok(())
    }

    /// Parse a byte image. Every section is decoded once into shared
    /// memory; a derived writable store borrows or copies per the section
    /// policy.
    pub fn from_image(buf: &[u8]) -> Result<Store> {
        let mut r = Reader { buf, pos: 0 };

        if r.u32()? != MAGIC {
            return Err(corrupt("bad magic"));
        }
        if r.u32()? != VERSION {
            return Err(corrupt("unsupported version"));
        }
        let creation_flags = r.u32()?;
        if r.u32()? != SLOT_COUNT as u32 {
            return Err(corrupt("slot count mismatch"));
        }
        let interleave = r.u32()?;
        let interleave_step = r.u32()?;
        let num_transform = r.u32()?;
        let max_signature = r.u32()?;
        let num_signature = r.u32()?;
        let signature_index_size = r.u32()?;
        let max_hint = r.u32()?;
        let num_hint = r.u32()?;
        let hint_index_size = r.u32()?;
        let max_imprint = r.u32()?;
        let num_imprint = r.u32()?;
        let imprint_index_size = r.u32()?;
        let max_member = r.u32()?;
        let num_member = r.u32()?;
        let member_index_size = r.u32()?;
        let max_pair = r.u32()?;
        let num_pair = r.u32()?;
        let pair_index_size = r.u32()?;
        let _section_mask = r.u32()?;
        let _stamp = r.take(32)?;

        let off = SectionOffsets {
            fwd_transforms: r.u64()?,
            rev_transforms: r.u64()?,
            fwd_transform_names: r.u64()?,
            rev_transform_names: r.u64()?,
            rev_transform_ids: r.u64()?,
            signatures: r.u64()?,
            signature_index: r.u64()?,
            hints: r.u64()?,
            hint_index: r.u64()?,
            imprints: r.u64()?,
            imprint_index: r.u64()?,
            members: r.u64()?,
            member_index: r.u64()?,
            pairs: r.u64()?,
            pair_index: r.u64()?,
        };

        fn dec_vec<T>(
            r: &mut Reader,
            offset: u64,
            count: usize,
            dec: impl Fn(&mut Reader) -> Result<T>,
        ) -> Result<Arc<[T]>> {
            r.seek(offset)?;
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                v.push(dec(r)?);
            }
            Ok(v.into())
        }

        let store = Store {
            creation_flags,
            interleave,
            interleave_step,
            fwd_transforms: SectionView::Inherited(dec_vec(
                &mut r,
                off.fwd_transforms,
                num_transform as usize,
                |r| r.u64(),
            )?),
            rev_transforms: SectionView::Inherited(dec_vec(
                &mut r,
                off.rev_transforms,
                num_transform as usize,
                |r| r.u64(),
            )?),
            fwd_transform_names: SectionView::Inherited(dec_vec(
                &mut r,
                off.fwd_transform_names,
                num_transform as usize,
                |r| {
                    let mut n = [0u8; SLOT_COUNT];
                    n.copy_from_slice(r.take(SLOT_COUNT)?);
                    Ok(n)
                },
            )?),
            rev_transform_names: SectionView::Inherited(dec_vec(
                &mut r,
                off.rev_transform_names,
                num_transform as usize,
                |r| {
                    let mut n = [0u8; SLOT_COUNT];
                    n.copy_from_slice(r.take(SLOT_COUNT)?);
                    Ok(n)
                },
            )?),
            rev_transform_ids: SectionView::Inherited(dec_vec(
                &mut r,
                off.rev_transform_ids,
                num_transform as usize,
                |r| r.u32(),
            )?),
            max_signature,
            signatures: SectionView::Inherited(dec_vec(
                &mut r,
                off.signatures,
                num_signature as usize,
                dec_signature,
            )?),
            signature_index_size,
            signature_index: SectionView::Inherited(dec_vec(
                &mut r,
                off.signature_index,
                signature_index_size as usize,
                |r| r.u32(),
            )?),
            max_hint,
            hints: SectionView::Inherited(dec_vec(&mut r, off.hints, num_hint as usize, dec_hint)?),
            hint_index_size,
            hint_index: SectionView::Inherited(dec_vec(
                &mut r,
                off.hint_index,
                hint_index_size as usize,
                |r| r.u32(),
            )?),
            max_imprint,
            imprints: SectionView::Inherited(dec_vec(
                &mut r,
                off.imprints,
                num_imprint as usize,
                dec_imprint,
            )?),
            imprint_index_size,
            imprint_index: SectionView::Inherited(dec_vec(
                &mut r,
                off.imprint_index,
                imprint_index_size as usize,
                |r| r.u32(),
            )?),
            max_member,
            members: SectionView::Inherited(dec_vec(
                &mut r,
                off.members,
                num_member as usize,
                dec_member,
            )?),
            member_index_size,
            member_index: SectionView::Inherited(dec_vec(
                &mut r,
                off.member_index,
                member_index_size as usize,
                |r| r.u32(),
            )?),
            max_pair,
            pairs: SectionView::Inherited(dec_vec(&mut r, off.pairs, num_pair as usize, dec_pair)?),
            pair_index_size,
            pair_index: SectionView::Inherited(dec_vec(
                &mut r,
                off.pair_index,
                pair_index_size as usize,
                |r| r.u32(),
            )?),
        };

        if store.num_transform() != 0 && !store.has_transforms() {
            return Err(corrupt("transform section truncated"));
        }

        Ok(store)
    }

    pub fn open(path: &Path) -> Result<Store> {
        let buf = std::fs::read(path)?;
        let store = Store::from_image(&buf)?;
        log::info!(
            "opened {}: numSignature={} numImprint={} numMember={} interleave={}",
            path.display(),
            store.num_signature(),
            store.num_imprint(),
            store.num_member(),
            store.interleave
        );
        Ok(store)
    }
}
