//! Multigrid on a 1D Poisson hierarchy
//!
//! The finest level holds the interior nodes of `-u'' = 1` on a uniform
//! mesh with homogeneous Dirichlet ends; coarser levels are built by linear
//! interpolation and Galerkin products.

use approx::assert_relative_eq;
use math_audio_multigrid::blas;
use math_audio_multigrid::{
    GeomType, IluConfig, Iteration, Lmgc, MatDesc, MgError, Multigrid, MultigridSolveConfig,
    Operands, Prolongation, SmootherConfig, SmootherSpec, SolverConfig, VCycleConfig, VecDesc,
    galerkin_coarse_matrix, solve_multigrid,
};

/// Interior nodes on `level`: 3, 7, 15, ...
fn nodes(level: usize) -> usize {
    (1 << (level + 2)) - 1
}

fn linear_interpolation(nf: usize, nc: usize) -> Prolongation {
    let mut p = Prolongation::new(nf);
    for f in 0..nf {
        if f % 2 == 1 {
            p.add(f, (f - 1) / 2, 1.0);
        } else {
            if f / 2 >= 1 {
                p.add(f, f / 2 - 1, 0.5);
            }
            if f / 2 < nc {
                p.add(f, f / 2, 0.5);
            }
        }
    }
    p
}

struct Poisson {
    mg: Multigrid,
    x: VecDesc,
    b: VecDesc,
    a: MatDesc,
}

fn poisson_hierarchy(levels: usize) -> Poisson {
    let mut mg = Multigrid::new(levels);
    let x = mg.create_vec_desc("x", [1, 0, 0, 0]).unwrap();
    let b = mg.create_vec_desc("b", [1, 0, 0, 0]).unwrap();
    let a = mg.create_mat_desc("A", &b, &x).unwrap();
    for level in 0..levels {
        let n = nodes(level);
        for _ in 0..n {
            mg.add_vector(level, GeomType::Node).unwrap();
        }
        if level > 0 {
            mg.level_mut(level).unwrap().prolongation =
                Some(linear_interpolation(n, nodes(level - 1)));
        }
    }

    let top = levels - 1;
    let n = nodes(top);
    for i in 1..n {
        mg.connect(top, i - 1, i).unwrap();
    }
    let fine = mg.level_mut(top).unwrap();
    for i in 0..n {
        fine.set_block(i, i, &a, &[2.0]).unwrap();
        if i > 0 {
            fine.set_block(i, i - 1, &a, &[-1.0]).unwrap();
            fine.set_block(i - 1, i, &a, &[-1.0]).unwrap();
        }
        fine.set_values(i, &b, &[1.0]).unwrap();
    }
    for level in (1..levels).rev() {
        galerkin_coarse_matrix(&mut mg, level, &a).unwrap();
    }
    Poisson { mg, x, b, a }
}

/// `x_i = (i + 1)(n - i) / 2` solves `tridiag(-1, 2, -1) x = 1`
fn exact(i: usize, n: usize) -> f64 {
    ((i + 1) * (n - i)) as f64 / 2.0
}

fn solve_with(smoother: SmootherSpec) -> (Poisson, math_audio_multigrid::MultigridResult) {
    let mut p = poisson_hierarchy(4);
    let top = p.mg.top_level();
    blas::set(&mut p.mg.level_mut(top).unwrap().vectors, &p.x, 0.0);
    let config = SolverConfig {
        smoother,
        ..Default::default()
    };
    let mut cycle = Lmgc::from_config(&config).unwrap();
    let result = solve_multigrid(
        &mut p.mg,
        &mut cycle,
        &p.x,
        &p.b,
        &p.a,
        &MultigridSolveConfig {
            max_iterations: 30,
            reduction: 1e-10,
            ..Default::default()
        },
    )
    .unwrap();
    (p, result)
}

#[test]
fn test_galerkin_hierarchy_is_scaled_laplacian() {
    let p = poisson_hierarchy(3);
    // linear interpolation halves the 1D stencil per level
    let coarse = p.mg.level(1).unwrap();
    assert_relative_eq!(coarse.block(3, 3, &p.a).unwrap()[0], 1.0);
    assert_relative_eq!(coarse.block(3, 4, &p.a).unwrap()[0], -0.5);
    let coarsest = p.mg.level(0).unwrap();
    assert_relative_eq!(coarsest.block(1, 1, &p.a).unwrap()[0], 0.5);
    assert_relative_eq!(coarsest.block(1, 0, &p.a).unwrap()[0], -0.25);
}

#[test]
fn test_vcycle_converges_with_symmetric_gauss_seidel() {
    let (p, result) = solve_with(SmootherSpec::SymmetricGaussSeidel(SmootherConfig::default()));
    assert!(result.converged, "{:?}", result);
    assert!(result.iterations <= 12, "{:?}", result);
    assert!(result.last_defect <= 1e-10 * result.first_defect);

    let n = nodes(3);
    let fine = p.mg.level(3).unwrap();
    for i in [0, n / 2, n - 1] {
        assert_relative_eq!(fine.values(i, &p.x).unwrap()[0], exact(i, n), epsilon = 1e-6);
    }
}

#[test]
fn test_vcycle_converges_with_other_smoothers() {
    let smoothers = vec![
        SmootherSpec::GaussSeidel(SmootherConfig::default()),
        SmootherSpec::Jacobi(SmootherConfig {
            damp: vec![0.6],
            ..Default::default()
        }),
        SmootherSpec::Ilu(IluConfig::default()),
    ];
    for smoother in smoothers {
        let (_, result) = solve_with(smoother.clone());
        assert!(result.converged, "{:?}: {:?}", smoother, result);
    }
}

#[test]
fn test_exact_smoother_converges_in_one_cycle() {
    // ILU(0) of a tridiagonal matrix is its exact LU factorization
    let (_, result) = solve_with(SmootherSpec::Ilu(IluConfig::default()));
    assert_eq!(result.iterations, 1);
}

#[test]
fn test_w_cycle_converges_at_least_as_fast() {
    let mut counts = Vec::new();
    for gamma in [1, 2] {
        let mut p = poisson_hierarchy(4);
        let config = SolverConfig {
            smoother: SmootherSpec::GaussSeidel(SmootherConfig::default()),
            cycle: VCycleConfig {
                gamma,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut cycle = Lmgc::from_config(&config).unwrap();
        let result = solve_multigrid(
            &mut p.mg,
            &mut cycle,
            &p.x,
            &p.b,
            &p.a,
            &MultigridSolveConfig::default(),
        )
        .unwrap();
        assert!(result.converged);
        counts.push(result.iterations);
    }
    assert!(counts[1] <= counts[0], "{:?}", counts);
}

#[test]
fn test_higher_base_level() {
    let mut p = poisson_hierarchy(4);
    let config = SolverConfig {
        smoother: SmootherSpec::SymmetricGaussSeidel(SmootherConfig::default()),
        cycle: VCycleConfig {
            base_level: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut cycle = Lmgc::from_config(&config).unwrap();
    let result = solve_multigrid(
        &mut p.mg,
        &mut cycle,
        &p.x,
        &p.b,
        &p.a,
        &MultigridSolveConfig::default(),
    )
    .unwrap();
    assert!(result.converged);
    // level 0 was never touched
    assert!(p.mg.level(0).unwrap().gather(&p.b).iter().all(|&v| v == 0.0));
}

#[test]
fn test_unconfigured_cycle_is_rejected_and_releases_temporaries() {
    let mut p = poisson_hierarchy(2);
    let in_use = p.mg.pool().lock().vec_in_use(GeomType::Node);
    let mut cycle = Lmgc::new(VCycleConfig::default()).unwrap();
    let err = solve_multigrid(
        &mut p.mg,
        &mut cycle,
        &p.x,
        &p.b,
        &p.a,
        &MultigridSolveConfig::default(),
    )
    .unwrap_err();
    assert!(err.is_lifecycle_error());
    assert_eq!(p.mg.pool().lock().vec_in_use(GeomType::Node), in_use);

    let mut cycle = Lmgc::from_config(&SolverConfig::default()).unwrap();
    let ops = Operands::new(&p.x, &p.b, &p.a);
    assert!(matches!(
        cycle.iterate(&mut p.mg, 1, &ops),
        Err(MgError::NotPreprocessed { .. })
    ));
    cycle.pre_process(&mut p.mg, 1, &ops).unwrap();
    assert!(matches!(
        cycle.pre_process(&mut p.mg, 1, &ops),
        Err(MgError::AlreadyPreprocessed { .. })
    ));
    cycle.post_process(&mut p.mg, 1, &ops).unwrap();
}

/// One cycle with an exact base solve and no smoothing; returns the fine
/// correction and the fine defect left behind.
fn coarse_correction(gamma: usize) -> (Vec<f64>, Vec<f64>) {
    let mut p = poisson_hierarchy(2);
    let c = p.mg.create_vec_desc("c", [1, 0, 0, 0]).unwrap();
    let config = SolverConfig {
        cycle: VCycleConfig {
            gamma,
            nu1: 0,
            nu2: 0,
            base_level: 0,
        },
        ..Default::default()
    };
    let mut cycle = Lmgc::from_config(&config).unwrap();
    let ops = Operands::new(&c, &p.b, &p.a);
    cycle.pre_process(&mut p.mg, 1, &ops).unwrap();
    cycle.iterate(&mut p.mg, 1, &ops).unwrap();
    cycle.post_process(&mut p.mg, 1, &ops).unwrap();
    let fine = p.mg.level(1).unwrap();
    (fine.gather(&c), fine.gather(&p.b))
}

#[test]
fn test_repeated_coarse_visits_keep_the_correction() {
    let (v_cycle, v_defect) = coarse_correction(1);
    let (w_cycle, w_defect) = coarse_correction(2);
    // the second exact coarse solve sees a zero defect and adds nothing
    assert!(v_cycle.iter().any(|&c| c.abs() > 1.0), "{:?}", v_cycle);
    for (v, w) in v_cycle.iter().zip(&w_cycle) {
        assert_relative_eq!(*v, *w, epsilon = 1e-10);
    }
    for (v, w) in v_defect.iter().zip(&w_defect) {
        assert_relative_eq!(*v, *w, epsilon = 1e-10);
    }

    // the defect left behind is 1 - A c
    let n = nodes(1);
    for i in 0..n {
        let left = if i > 0 { w_cycle[i - 1] } else { 0.0 };
        let right = if i + 1 < n { w_cycle[i + 1] } else { 0.0 };
        let ac = 2.0 * w_cycle[i] - left - right;
        assert_relative_eq!(w_defect[i], 1.0 - ac, epsilon = 1e-10);
    }
}
