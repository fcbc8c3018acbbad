//! Consistency protocol on in-process ranks
//!
//! Each rank runs on its own thread with a `ChannelCommunicator`. Vectors
//! shared between ranks carry the same global id on every rank.

use approx::assert_relative_eq;
use math_audio_multigrid::parallel::{
    self, InterfaceKind, global_defect_norm, vector_collect, vector_consistent,
    vector_consistent_in_block, vector_consistent_noskip, vector_maximum, vector_mean_value,
    vector_minimum, vector_overwrite_from_master, vector_project_to_ghosts,
    vector_skip_exchange,
};
use math_audio_multigrid::algebra::Priority;
use math_audio_multigrid::blas;
use math_audio_multigrid::smoother::Jacobi;
use math_audio_multigrid::{
    ChannelCommunicator, Communicator, GeomType, Iteration, MatDesc, Multigrid, Operands,
    SkipMask, SmootherConfig, VecDesc,
};
use std::sync::Arc;
use std::thread;

/// Run `body(rank, mg)` on `size` ranks, each with a one-level hierarchy
fn on_ranks<T, F>(size: usize, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, Multigrid) -> T + Send + Sync + 'static,
{
    let body = Arc::new(body);
    let handles: Vec<_> = ChannelCommunicator::create(size)
        .into_iter()
        .map(|comm| {
            let body = Arc::clone(&body);
            thread::spawn(move || {
                let rank = comm.rank();
                let comm: Arc<dyn Communicator> = Arc::new(comm);
                body(rank, Multigrid::with_communicator(1, comm))
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Add one vector shared by all ranks (global id 1000) after an interior
/// vector; rank `master` owns it. Returns the local index of the shared one.
fn add_shared(mg: &mut Multigrid, rank: usize, size: usize, master: usize) -> usize {
    mg.add_vector_with_gid(0, GeomType::Node, rank as u64).unwrap();
    let shared = mg.add_vector_with_gid(0, GeomType::Node, 1000).unwrap();
    let level = mg.level_mut(0).unwrap();
    if rank != master {
        level.vector_mut(shared).unwrap().set_priority(Priority::Border);
    }
    for partner in (0..size).filter(|&p| p != rank) {
        level.link_replicas(InterfaceKind::Border, partner, &[shared]).unwrap();
    }
    shared
}

#[test]
fn test_sum_agrees_on_all_replicas_and_is_stable_under_overwrite() {
    let results = on_ranks(3, |rank, mut mg| {
        let x = mg.create_vec_desc("x", [2, 0, 0, 0]).unwrap();
        let y = mg.create_vec_desc("y", [2, 0, 0, 0]).unwrap();
        let shared = add_shared(&mut mg, rank, 3, 0);
        let r = rank as f64;
        let level = mg.level_mut(0).unwrap();
        level.set_values(shared, &x, &[r, 1.0 + r]).unwrap();
        level.set_values(0, &x, &[7.0, 7.0]).unwrap();
        blas::copy(&mut level.vectors, &y, &x).unwrap();

        vector_consistent(&mut mg, 0, &x).unwrap();
        let summed = mg.level(0).unwrap().values(shared, &x).unwrap();
        let interior = mg.level(0).unwrap().values(0, &x).unwrap();

        // replicas agree now, so taking the master value changes nothing
        vector_overwrite_from_master(&mut mg, 0, &x).unwrap();
        let overwritten = mg.level(0).unwrap().values(shared, &x).unwrap();

        // collecting onto the master first gives the same sum
        vector_collect(&mut mg, 0, &y).unwrap();
        let collected = mg.level(0).unwrap().values(shared, &y).unwrap();
        vector_consistent(&mut mg, 0, &y).unwrap();
        let via_master = mg.level(0).unwrap().values(shared, &y).unwrap();
        (summed, interior, overwritten, collected, via_master)
    });
    for (rank, (summed, interior, overwritten, collected, via_master)) in
        results.into_iter().enumerate()
    {
        assert_eq!(summed, vec![3.0, 6.0]);
        assert_eq!(interior, vec![7.0, 7.0]);
        assert_eq!(overwritten, summed);
        if rank == 0 {
            assert_eq!(collected, vec![3.0, 6.0]);
        } else {
            assert_eq!(collected, vec![0.0, 0.0]);
        }
        assert_eq!(via_master, summed);
    }
}

#[test]
fn test_overwrite_from_master() {
    let results = on_ranks(2, |rank, mut mg| {
        let x = mg.create_vec_desc("x", [1, 0, 0, 0]).unwrap();
        let shared = add_shared(&mut mg, rank, 2, 1);
        mg.level_mut(0)
            .unwrap()
            .set_values(shared, &x, &[10.0 + rank as f64])
            .unwrap();
        vector_overwrite_from_master(&mut mg, 0, &x).unwrap();
        mg.level(0).unwrap().values(shared, &x).unwrap()[0]
    });
    assert_eq!(results, vec![11.0, 11.0]);
}

#[test]
fn test_fold_rules() {
    let results = on_ranks(2, |rank, mut mg| {
        let x = mg.create_vec_desc("x", [2, 0, 0, 0]).unwrap();
        let shared = add_shared(&mut mg, rank, 2, 0);
        if rank == 1 {
            mg.level_mut(0)
                .unwrap()
                .set_skip(shared, SkipMask::from_components(&[1]))
                .unwrap();
        }
        let local = if rank == 0 { [1.0, 10.0] } else { [3.0, -2.0] };
        let rules: [fn(&mut Multigrid, usize, &VecDesc) -> math_audio_multigrid::Result<()>; 4] = [
            vector_minimum,
            vector_maximum,
            vector_mean_value,
            vector_consistent_noskip,
        ];
        rules
            .iter()
            .map(|rule| {
                mg.level_mut(0).unwrap().set_values(shared, &x, &local).unwrap();
                rule(&mut mg, 0, &x).unwrap();
                mg.level(0).unwrap().values(shared, &x).unwrap()
            })
            .collect::<Vec<_>>()
    });
    for (rank, got) in results.iter().enumerate() {
        assert_eq!(got[0], vec![1.0, -2.0]);
        assert_eq!(got[1], vec![3.0, 10.0]);
        assert_eq!(got[2], vec![2.0, 4.0]);
        // the locked component keeps its local value
        let noskip = if rank == 0 { vec![4.0, 8.0] } else { vec![4.0, -2.0] };
        assert_eq!(got[3], noskip);
    }
}

#[test]
fn test_block_restricted_sum() {
    let results = on_ranks(3, |rank, mut mg| {
        let x = mg.create_vec_desc("x", [1, 0, 0, 0]).unwrap();
        let shared = add_shared(&mut mg, rank, 3, 0);
        let level = mg.level_mut(0).unwrap();
        if rank < 2 {
            level.add_blockvector(vec![shared]).unwrap();
        }
        let value = if rank < 2 { 1.0 + rank as f64 } else { 10.0 };
        level.set_values(shared, &x, &[value]).unwrap();
        vector_consistent_in_block(&mut mg, 0, &x, &|v| v.block().is_some()).unwrap();
        mg.level(0).unwrap().values(shared, &x).unwrap()[0]
    });
    // ranks 0 and 1 sum their line, rank 2 is outside it
    assert_eq!(results, vec![3.0, 3.0, 10.0]);
}

/// Skip-mask data per rank: (locked components, values)
type SkipData = (Vec<usize>, [f64; 2]);

fn merge_skip(data: Vec<SkipData>) -> Vec<(SkipMask, Vec<f64>)> {
    let size = data.len();
    let data = Arc::new(data);
    on_ranks(size, move |rank, mut mg| {
        let x = mg.create_vec_desc("x", [2, 0, 0, 0]).unwrap();
        let shared = add_shared(&mut mg, rank, size, 0);
        let (locked, values) = &data[rank];
        let level = mg.level_mut(0).unwrap();
        level.set_values(shared, &x, values).unwrap();
        level.set_skip(shared, SkipMask::from_components(locked)).unwrap();
        vector_skip_exchange(&mut mg, 0, &x).unwrap();
        let v = mg.level(0).unwrap().vector(shared).unwrap();
        (v.skip(), v.get(&x))
    })
}

#[test]
fn test_skip_merge_unions_locks_and_keeps_largest_magnitude() {
    let data: Vec<SkipData> = vec![
        (vec![0], [-3.0, 1.0]),
        (vec![0, 1], [2.0, 5.0]),
        (vec![], [7.0, 7.0]),
    ];
    let merged = merge_skip(data.clone());
    for (mask, values) in &merged {
        assert_eq!(*mask, SkipMask::from_components(&[0, 1]));
        assert_eq!(*values, vec![-3.0, 5.0]);
    }

    // the merge does not depend on which rank holds which replica
    for shift in 1..3 {
        let mut rotated = data.clone();
        rotated.rotate_left(shift);
        assert_eq!(merge_skip(rotated), merged);
    }
}

#[test]
fn test_unlocked_components_keep_local_values() {
    let merged = merge_skip(vec![(vec![1], [1.0, -4.0]), (vec![], [2.0, 3.0])]);
    assert_eq!(merged[0].1, vec![1.0, -4.0]);
    assert_eq!(merged[1].1, vec![2.0, -4.0]);
}

#[test]
fn test_projection_reaches_ghosts_only() {
    let results = on_ranks(2, |rank, mut mg| {
        let x = mg.create_vec_desc("x", [1, 0, 0, 0]).unwrap();
        mg.add_vector_with_gid(0, GeomType::Node, 5).unwrap();
        let level = mg.level_mut(0).unwrap();
        if rank == 1 {
            level.vector_mut(0).unwrap().set_priority(Priority::Ghost);
        }
        level.link_replicas(InterfaceKind::Outer, 1 - rank, &[0]).unwrap();
        level.set_values(0, &x, &[if rank == 0 { 4.0 } else { -1.0 }]).unwrap();
        vector_project_to_ghosts(&mut mg, 0, &x).unwrap();
        mg.level(0).unwrap().values(0, &x).unwrap()[0]
    });
    assert_eq!(results, vec![4.0, 4.0]);
}

/// Three-node chain `tridiag(-1, 2, -1)`, node 1 shared between two ranks.
///
/// Rank 0 holds nodes 0 and 1, rank 1 holds nodes 1 and 2; the shared row
/// and its defect are split evenly, so the ranks add up to the serial system.
fn split_chain(rank: usize, mg: &mut Multigrid) -> (VecDesc, VecDesc, MatDesc) {
    let c = mg.create_vec_desc("c", [1, 0, 0, 0]).unwrap();
    let b = mg.create_vec_desc("b", [1, 0, 0, 0]).unwrap();
    let a = mg.create_mat_desc("A", &b, &c).unwrap();
    let (own, shared) = if rank == 0 { (0, 1) } else { (1, 0) };
    let own_gid = if rank == 0 { 0 } else { 2 };
    for i in 0..2 {
        let gid = if i == own { own_gid } else { 1 };
        mg.add_vector_with_gid(0, GeomType::Node, gid).unwrap();
    }
    mg.connect(0, 0, 1).unwrap();
    let level = mg.level_mut(0).unwrap();
    if rank == 1 {
        level.vector_mut(shared).unwrap().set_priority(Priority::Border);
    }
    level.link_replicas(InterfaceKind::Border, 1 - rank, &[shared]).unwrap();
    level.set_block(own, own, &a, &[2.0]).unwrap();
    level.set_block(shared, shared, &a, &[1.0]).unwrap();
    level.set_block(own, shared, &a, &[-1.0]).unwrap();
    level.set_block(shared, own, &a, &[-1.0]).unwrap();
    level.set_values(own, &b, &[1.0]).unwrap();
    level.set_values(shared, &b, &[0.5]).unwrap();
    (c, b, a)
}

#[test]
fn test_distributed_jacobi_matches_serial() {
    let results = on_ranks(2, |rank, mut mg| {
        let (c, b, a) = split_chain(rank, &mut mg);
        let ops = Operands::new(&c, &b, &a);
        let mut jacobi = Jacobi::new(SmootherConfig::default()).unwrap();
        jacobi.pre_process(&mut mg, 0, &ops).unwrap();
        jacobi.iterate(&mut mg, 0, &ops).unwrap();
        let norm = global_defect_norm(&mut mg, 0, &b).unwrap();
        jacobi.post_process(&mut mg, 0, &ops).unwrap();
        (mg.level(0).unwrap().gather(&c), norm)
    });
    // serial: c = (0.5, 0.5, 0.5), b - A c = (0.5, 1, 0.5)
    for (c, norm) in results {
        assert_eq!(c, vec![0.5, 0.5]);
        assert_relative_eq!(norm, 1.5_f64.sqrt(), epsilon = 1e-14);
    }
}

#[test]
fn test_global_norm_counts_each_vector_once() {
    let results = on_ranks(2, |rank, mut mg| {
        let x = mg.create_vec_desc("x", [1, 0, 0, 0]).unwrap();
        let shared = add_shared(&mut mg, rank, 2, 0);
        let level = mg.level_mut(0).unwrap();
        level.set_values(0, &x, &[if rank == 0 { 3.0 } else { 0.0 }]).unwrap();
        level.set_values(shared, &x, &[2.0]).unwrap();
        // additive: the shared value is 4 in total
        let defect = global_defect_norm(&mut mg, 0, &x).unwrap();
        vector_consistent(&mut mg, 0, &x).unwrap();
        let consistent = parallel::global_norm(&mg, 0, &x).unwrap();
        (defect, consistent)
    });
    for (defect, consistent) in results {
        assert_relative_eq!(defect, 5.0);
        assert_relative_eq!(consistent, 5.0);
    }
}
