//! Consistency protocol for replicated vectors and matrix entries
//!
//! Every operation packs the components of all interface vectors, exchanges
//! the packets with all partners at once, and then merges the replicas of
//! each vector with a combine rule. Contributions are merged in rank order,
//! the local one included, so all replicas compute bitwise the same result
//! whatever order the packets arrive in.

use super::comm::{Communicator, Packet};
use super::interface::{Interface, InterfaceKind};
use crate::algebra::{GridLevel, LevelMatrix, Multigrid, SkipMask, Vector};
use crate::blas;
use crate::descriptor::VecDesc;
use crate::error::{MgError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

const FLAG_PARTICIPATES: u8 = 1;
const FLAG_MASTER: u8 = 2;

/// One replica's view of a vector.
#[derive(Debug, Clone)]
struct Contribution {
    rank: usize,
    values: Vec<f64>,
    mask: SkipMask,
    flags: u8,
}

impl Contribution {
    fn participates(&self) -> bool {
        self.flags & FLAG_PARTICIPATES != 0
    }

    fn is_master(&self) -> bool {
        self.flags & FLAG_MASTER != 0
    }
}

/// Values per vector in a packet; scalar descriptors send exactly one.
fn payload_width(x: &VecDesc) -> usize {
    if x.is_scalar() { 1 } else { x.max_comp() }
}

fn pack_values(v: &Vector, x: &VecDesc, width: usize, out: &mut Vec<f64>) {
    if let Some(c) = x.scalar_comp() {
        out.push(if x.defines(v.gtype()) { v.values[c] } else { 0.0 });
        return;
    }
    let comps = x.components(v.gtype());
    out.extend(comps.iter().map(|&c| v.values[c]));
    out.extend(std::iter::repeat_n(0.0, width - comps.len()));
}

fn unpack_values(v: &mut Vector, x: &VecDesc, values: &[f64]) {
    if let Some(c) = x.scalar_comp() {
        if x.defines(v.gtype()) {
            v.values[c] = values[0];
        }
        return;
    }
    let comps: Vec<usize> = x.components(v.gtype()).to_vec();
    for (c, &value) in comps.into_iter().zip(values) {
        v.values[c] = value;
    }
}

fn own_contribution(
    rank: usize,
    v: &Vector,
    x: &VecDesc,
    width: usize,
    participates: &dyn Fn(&Vector) -> bool,
) -> Contribution {
    let mut values = Vec::with_capacity(width);
    pack_values(v, x, width, &mut values);
    let mut flags = 0;
    if participates(v) {
        flags |= FLAG_PARTICIPATES;
    }
    if v.is_master() {
        flags |= FLAG_MASTER;
    }
    Contribution {
        rank,
        values,
        mask: v.skip(),
        flags,
    }
}

/// Exchange the replicas of all vectors on `iface` and return, per local
/// vector, every contribution sorted by rank, its own included.
fn gather(
    comm: &dyn Communicator,
    vectors: &[Vector],
    iface: &Interface,
    kind: InterfaceKind,
    x: &VecDesc,
    participates: &dyn Fn(&Vector) -> bool,
) -> Result<BTreeMap<usize, Vec<Contribution>>> {
    let mut merged: BTreeMap<usize, Vec<Contribution>> = BTreeMap::new();
    if iface.is_empty() {
        return Ok(merged);
    }
    let width = payload_width(x);
    let rank = comm.rank();

    let outgoing = iface
        .links()
        .iter()
        .map(|link| {
            let mut packet = Packet::default();
            for &i in link.vectors() {
                let own = own_contribution(rank, &vectors[i], x, width, participates);
                packet.values.extend(own.values);
                packet.masks.push(own.mask.bits());
                packet.flags.push(own.flags);
            }
            (link.partner(), packet)
        })
        .collect();
    let incoming = comm.exchange(kind.name(), outgoing)?;

    for (partner, packet) in incoming {
        let link = iface
            .links()
            .iter()
            .find(|l| l.partner() == partner)
            .ok_or_else(|| {
                MgError::exchange(kind.name(), format!("unexpected partner {}", partner))
            })?;
        let n = link.vectors().len();
        if packet.values.len() != n * width || packet.masks.len() != n || packet.flags.len() != n {
            return Err(MgError::exchange(
                kind.name(),
                format!(
                    "partner {} sent {} values for {} vectors of width {}",
                    partner,
                    packet.values.len(),
                    n,
                    width
                ),
            ));
        }
        for (k, &i) in link.vectors().iter().enumerate() {
            merged.entry(i).or_default().push(Contribution {
                rank: partner,
                values: packet.values[k * width..(k + 1) * width].to_vec(),
                mask: SkipMask::from_bits(packet.masks[k]),
                flags: packet.flags[k],
            });
        }
    }
    for (&i, list) in merged.iter_mut() {
        list.push(own_contribution(rank, &vectors[i], x, width, participates));
        list.sort_by_key(|c| c.rank);
    }
    Ok(merged)
}

/// Run `rule` on every interface vector of `level` with its rank-sorted
/// replica contributions.
fn combine(
    mg: &mut Multigrid,
    level: usize,
    kind: InterfaceKind,
    x: &VecDesc,
    participates: &dyn Fn(&Vector) -> bool,
    rule: impl Fn(&mut Vector, &[Contribution]),
) -> Result<()> {
    let comm = Arc::clone(mg.comm());
    let grid = mg.level_mut(level)?;
    let GridLevel {
        vectors, interfaces, ..
    } = grid;
    let merged = gather(comm.as_ref(), vectors, interfaces.get(kind), kind, x, participates)?;
    for (i, contributions) in merged {
        rule(&mut vectors[i], &contributions);
    }
    Ok(())
}

fn everyone(_: &Vector) -> bool {
    true
}

fn sum_of<'a>(contributions: impl Iterator<Item = &'a Contribution>, width: usize) -> Vec<f64> {
    let mut total = vec![0.0; width];
    for c in contributions {
        for (t, v) in total.iter_mut().zip(&c.values) {
            *t += v;
        }
    }
    total
}

/// Sum all replicas over the border interface (`consistent`)
pub fn vector_consistent(mg: &mut Multigrid, level: usize, x: &VecDesc) -> Result<()> {
    let width = payload_width(x);
    combine(mg, level, InterfaceKind::Border, x, &everyone, |v, cs| {
        unpack_values(v, x, &sum_of(cs.iter(), width));
    })
}

/// Sum all replicas except on components locked in the local skip mask
pub fn vector_consistent_noskip(mg: &mut Multigrid, level: usize, x: &VecDesc) -> Result<()> {
    let width = payload_width(x);
    combine(mg, level, InterfaceKind::Border, x, &everyone, |v, cs| {
        let mut total = sum_of(cs.iter(), width);
        let skip = v.skip();
        if !skip.is_empty() {
            let local = local_values(v, x, width);
            for (k, t) in total.iter_mut().enumerate() {
                if skip.is_locked(k) {
                    *t = local[k];
                }
            }
        }
        unpack_values(v, x, &total);
    })
}

fn local_values(v: &Vector, x: &VecDesc, width: usize) -> Vec<f64> {
    let mut values = Vec::with_capacity(width);
    pack_values(v, x, width, &mut values);
    values
}

fn fold_replicas(
    mg: &mut Multigrid,
    level: usize,
    x: &VecDesc,
    op: fn(f64, f64) -> f64,
) -> Result<()> {
    combine(mg, level, InterfaceKind::Border, x, &everyone, |v, cs| {
        let mut acc = cs[0].values.clone();
        for c in &cs[1..] {
            for (a, b) in acc.iter_mut().zip(&c.values) {
                *a = op(*a, *b);
            }
        }
        unpack_values(v, x, &acc);
    })
}

/// Component-wise minimum over all replicas
pub fn vector_minimum(mg: &mut Multigrid, level: usize, x: &VecDesc) -> Result<()> {
    fold_replicas(mg, level, x, f64::min)
}

/// Component-wise maximum over all replicas
pub fn vector_maximum(mg: &mut Multigrid, level: usize, x: &VecDesc) -> Result<()> {
    fold_replicas(mg, level, x, f64::max)
}

/// Arithmetic mean over all replicas
pub fn vector_mean_value(mg: &mut Multigrid, level: usize, x: &VecDesc) -> Result<()> {
    let width = payload_width(x);
    combine(mg, level, InterfaceKind::Border, x, &everyone, |v, cs| {
        let n = cs.len() as f64;
        let mean: Vec<f64> = sum_of(cs.iter(), width).into_iter().map(|s| s / n).collect();
        unpack_values(v, x, &mean);
    })
}

/// Sum all replicas onto the master copy and zero the others
pub fn vector_collect(mg: &mut Multigrid, level: usize, x: &VecDesc) -> Result<()> {
    let width = payload_width(x);
    combine(mg, level, InterfaceKind::Border, x, &everyone, |v, cs| {
        if v.is_master() {
            unpack_values(v, x, &sum_of(cs.iter(), width));
        } else {
            unpack_values(v, x, &vec![0.0; width]);
        }
    })
}

fn take_master(
    mg: &mut Multigrid,
    level: usize,
    kind: InterfaceKind,
    x: &VecDesc,
    with_mask: bool,
) -> Result<()> {
    combine(mg, level, kind, x, &everyone, |v, cs| {
        if v.is_master() {
            return;
        }
        if let Some(master) = cs.iter().find(|c| c.is_master()) {
            unpack_values(v, x, &master.values);
            if with_mask {
                v.set_skip(master.mask);
            }
        }
    })
}

/// Non-master border copies take the value of the master copy
pub fn vector_overwrite_from_master(mg: &mut Multigrid, level: usize, x: &VecDesc) -> Result<()> {
    take_master(mg, level, InterfaceKind::Border, x, false)
}

/// Ghost copies take the value of the master copy (one-directional)
pub fn vector_project_to_ghosts(mg: &mut Multigrid, level: usize, x: &VecDesc) -> Result<()> {
    take_master(mg, level, InterfaceKind::Outer, x, false)
}

/// Merge skip masks and values of border replicas, then project to ghosts.
///
/// The merged mask is the union of all masks. On a locked component the
/// value of largest magnitude among the replicas that lock it survives;
/// ties go to the lowest rank. Unlocked components keep their local value.
pub fn vector_skip_exchange(mg: &mut Multigrid, level: usize, x: &VecDesc) -> Result<()> {
    let width = payload_width(x);
    combine(mg, level, InterfaceKind::Border, x, &everyone, |v, cs| {
        let merged = cs.iter().fold(SkipMask::EMPTY, |m, c| m.union(c.mask));
        let mut values = local_values(v, x, width);
        for (k, value) in values.iter_mut().enumerate() {
            if !merged.is_locked(k) {
                continue;
            }
            let mut best: Option<f64> = None;
            for c in cs.iter().filter(|c| c.mask.is_locked(k)) {
                if best.is_none_or(|b| c.values[k].abs() > b.abs()) {
                    best = Some(c.values[k]);
                }
            }
            if let Some(b) = best {
                *value = b;
            }
        }
        unpack_values(v, x, &values);
        v.set_skip(merged);
    })?;
    take_master(mg, level, InterfaceKind::Outer, x, true)
}

/// Sum replicas of the vectors accepted by `in_block`, e.g. one blockvector
pub fn vector_consistent_in_block(
    mg: &mut Multigrid,
    level: usize,
    x: &VecDesc,
    in_block: &dyn Fn(&Vector) -> bool,
) -> Result<()> {
    let width = payload_width(x);
    combine(mg, level, InterfaceKind::Border, x, in_block, |v, cs| {
        if !in_block(v) {
            return;
        }
        unpack_values(v, x, &sum_of(cs.iter().filter(|c| c.participates()), width));
    })
}

fn matrix_width(m: &LevelMatrix) -> usize {
    let d = m.desc.max_block_dim();
    d * d
}

/// Sum the diagonal blocks of a matrix copy over the border interface
pub fn matrix_diag_consistent(mg: &Multigrid, level: usize, m: &mut LevelMatrix) -> Result<()> {
    let grid = mg.level(level)?;
    let iface = grid.interfaces.get(InterfaceKind::Border);
    if iface.is_empty() {
        return Ok(());
    }
    let width = matrix_width(m);
    let comm = mg.comm();
    let outgoing = iface
        .links()
        .iter()
        .map(|link| {
            let mut packet = Packet::default();
            for &i in link.vectors() {
                let d = m.matrix.diagonal(i).values();
                packet.values.extend_from_slice(d);
                packet.values.extend(std::iter::repeat_n(0.0, width - d.len()));
            }
            (link.partner(), packet)
        })
        .collect();
    let incoming = comm.exchange("border", outgoing)?;

    let mut parts: BTreeMap<usize, Vec<(usize, Vec<f64>)>> = BTreeMap::new();
    for (partner, packet) in incoming {
        let Some(link) = iface.links().iter().find(|l| l.partner() == partner) else {
            return Err(MgError::exchange("border", format!("unexpected partner {}", partner)));
        };
        if packet.values.len() != link.vectors().len() * width {
            return Err(MgError::exchange(
                "border",
                format!("partner {} sent a malformed diagonal", partner),
            ));
        }
        for (k, &i) in link.vectors().iter().enumerate() {
            parts
                .entry(i)
                .or_default()
                .push((partner, packet.values[k * width..(k + 1) * width].to_vec()));
        }
    }
    let rank = comm.rank();
    for (i, mut list) in parts {
        list.push((rank, m.matrix.diagonal(i).values().to_vec()));
        list.sort_by_key(|(r, _)| *r);
        let diag = m.matrix.diagonal_mut(i).values_mut();
        let mut total = vec![0.0; diag.len()];
        for (_, values) in &list {
            for (t, v) in total.iter_mut().zip(values) {
                *t += v;
            }
        }
        diag.copy_from_slice(&total);
    }
    Ok(())
}

/// Sum every matrix entry shared with a partner over the border interface.
///
/// An entry is shared when both its vectors are replicated on the partner;
/// entries are matched by the global ids of their vectors.
pub fn matrix_consistent(mg: &Multigrid, level: usize, m: &mut LevelMatrix) -> Result<()> {
    let grid = mg.level(level)?;
    let iface = grid.interfaces.get(InterfaceKind::Border);
    if iface.is_empty() {
        return Ok(());
    }
    let width = matrix_width(m);
    let comm = mg.comm();
    let local: HashMap<u64, usize> = grid.vectors.iter().map(|v| (v.gid(), v.index())).collect();

    let outgoing = iface
        .links()
        .iter()
        .map(|link| {
            let shared: HashSet<usize> = link.vectors().iter().copied().collect();
            let mut packet = Packet::default();
            for &i in link.vectors() {
                for e in m.matrix.row(i).iter().filter(|e| shared.contains(&e.col())) {
                    packet.keys.push(grid.vectors[i].gid());
                    packet.keys.push(grid.vectors[e.col()].gid());
                    packet.values.extend_from_slice(e.values());
                    packet.values.extend(std::iter::repeat_n(0.0, width - e.values().len()));
                }
            }
            (link.partner(), packet)
        })
        .collect();
    let incoming = comm.exchange("border", outgoing)?;

    let mut parts: BTreeMap<(usize, usize), Vec<(usize, Vec<f64>)>> = BTreeMap::new();
    for (partner, packet) in incoming {
        let n = packet.keys.len() / 2;
        if packet.keys.len() % 2 != 0 || packet.values.len() != n * width {
            return Err(MgError::exchange(
                "border",
                format!("partner {} sent a malformed matrix", partner),
            ));
        }
        for k in 0..n {
            let (Some(&i), Some(&j)) = (
                local.get(&packet.keys[2 * k]),
                local.get(&packet.keys[2 * k + 1]),
            ) else {
                continue;
            };
            if m.matrix.entry(i, j).is_some() {
                parts
                    .entry((i, j))
                    .or_default()
                    .push((partner, packet.values[k * width..(k + 1) * width].to_vec()));
            }
        }
    }
    let rank = comm.rank();
    for ((i, j), mut list) in parts {
        let Some(entry) = m.matrix.entry_mut(i, j) else {
            continue;
        };
        list.push((rank, entry.values().to_vec()));
        list.sort_by_key(|(r, _)| *r);
        let mut total = vec![0.0; entry.values().len()];
        for (_, values) in &list {
            for (t, v) in total.iter_mut().zip(values) {
                *t += v;
            }
        }
        entry.values_mut().copy_from_slice(&total);
    }
    Ok(())
}

/// Global `(x, y)` counting each master copy once
pub fn global_dot(mg: &Multigrid, level: usize, x: &VecDesc, y: &VecDesc) -> Result<f64> {
    let mut s = [blas::dot(&mg.level(level)?.vectors, x, y)?];
    mg.comm().all_reduce_sum(&mut s)?;
    Ok(s[0])
}

/// Global Euclidean norm counting each master copy once
pub fn global_norm(mg: &Multigrid, level: usize, x: &VecDesc) -> Result<f64> {
    let mut s = [blas::norm_sqr(&mg.level(level)?.vectors, x)];
    mg.comm().all_reduce_sum(&mut s)?;
    Ok(s[0].sqrt())
}

/// Global norm of an additive vector such as a defect.
///
/// Replicas are summed in a temporary first, so every shared vector counts
/// once with its full value.
pub fn global_defect_norm(mg: &mut Multigrid, level: usize, x: &VecDesc) -> Result<f64> {
    if !mg.is_distributed() {
        return Ok(blas::norm(&mg.level(level)?.vectors, x));
    }
    let t = mg.alloc_temp_vector(x)?;
    blas::copy(&mut mg.level_mut(level)?.vectors, &t, x)?;
    vector_consistent(mg, level, &t)?;
    global_norm(mg, level, &t)
}
