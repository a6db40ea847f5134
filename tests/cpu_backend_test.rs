//! End-to-end tests of the host backend through the `SolverBackend` trait.

use approx::assert_abs_diff_eq;
use faer::prelude::*;
use faer::sparse::{SparseColMat, Triplet};
use porelin::error::BridgeError;
use porelin::problem;
use porelin::solver::{
    create_backend, BackendKind, CpuBackend, SessionState, SolveStatus, SolverBackend,
    SolverConfig, WellContributions,
};
use porelin::sparse::BlockedMatrix;

fn backend(config: SolverConfig) -> Box<dyn SolverBackend> {
    create_backend(BackendKind::Cpu, config).expect("cpu backend is always available")
}

fn tight() -> SolverConfig {
    SolverConfig {
        tolerance: 1e-10,
        ..Default::default()
    }
}

/// Independent reference: sparse LU of the scalar expansion.
fn reference_solve(m: &BlockedMatrix, b: &[f64]) -> Vec<f64> {
    let bs = m.block_size;
    let n = m.n();
    let mut triplets = Vec::new();
    for brow in 0..m.nb {
        for idx in m.row_pointers[brow]..m.row_pointers[brow + 1] {
            let bcol = m.col_indices[idx];
            let block = m.block(idx);
            for r in 0..bs {
                for c in 0..bs {
                    triplets.push(Triplet::new(brow * bs + r, bcol * bs + c, block[r * bs + c]));
                }
            }
        }
    }
    let a = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets).unwrap();
    let lu = a.sp_lu().unwrap();
    let x = lu.solve(faer::Mat::<f64>::from_fn(n, 1, |i, _| b[i]));
    (0..n).map(|i| x[(i, 0)]).collect()
}

#[test]
fn identity_converges_immediately() {
    let mut solver = backend(SolverConfig::default());
    let m = problem::identity(5, 1);
    let b = [1.0, -2.0, 3.0, 0.5, 4.0];
    let (x, result) = solver.solve_owned(&m, &b, None).unwrap();
    assert!(result.converged);
    assert!(result.iterations <= 1);
    for i in 0..5 {
        assert_abs_diff_eq!(x[i], b[i], epsilon = 1e-14);
    }
}

#[test]
fn tridiagonal_three_by_three() {
    let mut solver = backend(tight());
    let m = problem::tridiagonal(3);
    let mut x = vec![0.0; 3];
    let result = solver.solve(&m, &[1.0, 0.0, 1.0], None, &mut x).unwrap();
    assert!(result.converged);
    assert!(result.iterations < 10);
    for xi in x {
        assert_abs_diff_eq!(xi, 1.0, epsilon = 1e-9);
    }
}

#[test]
fn zero_diagonal_does_not_succeed() {
    let mut solver = backend(SolverConfig::default());
    let m = BlockedMatrix::from_scalar_triplets(2, &[(0, 1, 1.0), (1, 0, 1.0)]).unwrap();
    let (x, result) = solver.solve_owned(&m, &[1.0, 2.0], None).unwrap();
    assert!(!result.converged);
    assert_ne!(result.status, SolveStatus::RelativeTolerance);
    assert!(result.reduction >= 0.0);
    assert!(x.iter().all(|v| v.is_finite()));
}

#[test]
fn block_laplacian_matches_sparse_lu() {
    for bs in [1, 2, 3] {
        let mut solver = backend(tight());
        let m = problem::laplacian_3d(4, 3, 2, bs);
        let b: Vec<f64> = (0..m.n()).map(|i| ((i * 7) % 11) as f64 - 5.0).collect();
        let (x, result) = solver.solve_owned(&m, &b, None).unwrap();
        assert!(result.converged, "block size {bs}: {result:?}");
        let expected = reference_solve(&m, &b);
        for i in 0..m.n() {
            assert_abs_diff_eq!(x[i], expected[i], epsilon = 1e-7);
        }
    }
}

#[test]
fn fresh_sessions_are_reproducible() {
    let m = problem::laplacian_3d(6, 5, 3, 3);
    let b = problem::rhs_for_ones(&m);
    let config = SolverConfig {
        tolerance: 1e-8,
        ..Default::default()
    };
    let (x1, r1) = backend(config.clone()).solve_owned(&m, &b, None).unwrap();
    let (x2, r2) = backend(config).solve_owned(&m, &b, None).unwrap();
    assert_eq!(r1.iterations, r2.iterations);
    assert_eq!(r1.status, r2.status);
    let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&x1), bits(&x2));
}

#[test]
fn reduction_bounds() {
    let systems = [
        problem::laplacian_3d(3, 3, 3, 2),
        problem::tridiagonal(20),
        problem::identity(4, 3),
    ];
    for tol in [1e-2, 1e-6] {
        let config = SolverConfig {
            tolerance: tol,
            ..Default::default()
        };
        for m in &systems {
            let b = problem::rhs_for_ones(m);
            let (_, result) = backend(config.clone()).solve_owned(m, &b, None).unwrap();
            assert!(result.reduction >= 0.0);
            if result.converged {
                assert!(result.reduction <= tol, "{result:?}");
            }
            assert!(result.conv_rate >= 0.0);
        }
    }
}

#[test]
fn tiny_rhs_stops_on_absolute_tolerance_unconverged() {
    let mut solver = backend(SolverConfig::default());
    let m = problem::laplacian_3d(2, 2, 2, 2);
    let b: Vec<f64> = problem::rhs_for_ones(&m).iter().map(|v| v * 1e-20).collect();
    let (x, result) = solver.solve_owned(&m, &b, None).unwrap();
    assert_eq!(result.status, SolveStatus::AbsoluteTolerance);
    assert!(!result.converged);
    assert_eq!(result.iterations, 0);
    assert!(x.iter().all(|&v| v == 0.0));
}

#[test]
fn zero_rhs_is_trivially_converged() {
    let mut solver = backend(SolverConfig::default());
    let m = problem::tridiagonal(4);
    let mut x = vec![5.0; 4];
    let result = solver.solve(&m, &[0.0; 4], None, &mut x).unwrap();
    assert!(result.converged);
    assert_eq!(result.iterations, 0);
    assert_eq!(result.reduction, 0.0);
    assert_eq!(x, vec![0.0; 4]);
}

#[test]
fn max_iterations_reported() {
    let mut solver = backend(SolverConfig {
        max_iterations: 1,
        tolerance: 1e-12,
        ..Default::default()
    });
    let m = problem::laplacian_3d(5, 5, 5, 3);
    let b = problem::rhs_for_ones(&m);
    let (_, result) = solver.solve_owned(&m, &b, None).unwrap();
    assert_eq!(result.status, SolveStatus::MaxIterations);
    assert_eq!(result.iterations, 1);
    assert!(!result.converged);
}

#[test]
fn wells_fold_into_system() {
    let m = problem::laplacian_3d(3, 2, 1, 2);
    let b = problem::rhs_for_ones(&m);

    let mut wells = WellContributions::new(2);
    wells.add_block(2, 2, &[3.0, 0.5, 0.0, 3.0]).unwrap();
    wells.add_rhs(4, 1.5);
    wells.add_rhs(5, -0.5);

    let mut explicit = m.clone();
    let pos = explicit.find_block(2, 2).unwrap();
    for (v, w) in explicit.values[pos * 4..(pos + 1) * 4].iter_mut().zip([3.0, 0.5, 0.0, 3.0]) {
        *v += w;
    }
    let mut explicit_b = b.clone();
    explicit_b[4] += 1.5;
    explicit_b[5] -= 0.5;

    let (x, result) = backend(tight()).solve_owned(&m, &b, Some(&wells)).unwrap();
    assert!(result.converged);
    let expected = reference_solve(&explicit, &explicit_b);
    for i in 0..m.n() {
        assert_abs_diff_eq!(x[i], expected[i], epsilon = 1e-8);
    }
}

#[test]
fn well_block_outside_pattern_is_structural() {
    let mut solver = backend(SolverConfig::default());
    let m = problem::laplacian_3d(3, 1, 1, 1);
    let mut wells = WellContributions::new(1);
    wells.add_block(0, 2, &[1.0]).unwrap();
    let mut x = vec![0.0; 3];
    let err = solver.solve(&m, &[1.0; 3], Some(&wells), &mut x).unwrap_err();
    assert!(matches!(err, BridgeError::Structural(_)));
}

#[test]
fn malformed_matrix_is_structural() {
    let mut solver = backend(SolverConfig::default());
    let mut m = problem::tridiagonal(4);
    m.col_indices.swap(0, 1);
    let mut x = vec![0.0; 4];
    let err = solver.solve(&m, &[1.0; 4], None, &mut x).unwrap_err();
    assert!(matches!(err, BridgeError::Structural(_)));
}

#[test]
fn dimension_change_reinitializes() {
    let mut solver = CpuBackend::new(tight()).unwrap();
    for (nx, bs) in [(2, 2), (4, 2), (4, 3), (2, 2)] {
        let m = problem::laplacian_3d(nx, 2, 1, bs);
        let b = problem::rhs_for_ones(&m);
        let mut x = vec![0.0; m.n()];
        let result = solver.solve(&m, &b, None, &mut x).unwrap();
        assert!(result.converged);
        assert_eq!(solver.state(), SessionState::Initialized);
        for xi in x {
            assert_abs_diff_eq!(xi, 1.0, epsilon = 1e-8);
        }
    }
}

#[test]
fn repeated_perturbed_solves_reuse_session() {
    let mut solver = CpuBackend::new(tight()).unwrap();
    let mut m = problem::laplacian_3d(4, 4, 2, 3);
    for step in 0..4 {
        problem::perturb(&mut m, step);
        let b = problem::rhs_for_ones(&m);
        let mut x = vec![0.0; m.n()];
        let result = solver.solve(&m, &b, None, &mut x).unwrap();
        assert!(result.converged, "step {step}");
        for xi in x {
            assert_abs_diff_eq!(xi, 1.0, epsilon = 1e-8);
        }
    }
}

#[test]
fn dispose_is_idempotent_and_reopens() {
    let mut solver = backend(SolverConfig::default());
    solver.dispose();
    assert_eq!(solver.state(), SessionState::Disposed);
    solver.dispose();
    assert_eq!(solver.state(), SessionState::Disposed);

    let m = problem::tridiagonal(3);
    let (_, result) = solver.solve_owned(&m, &[1.0, 0.0, 1.0], None).unwrap();
    assert!(result.converged);
    assert_eq!(solver.state(), SessionState::Initialized);
    solver.dispose();
    assert_eq!(solver.state(), SessionState::Disposed);
}

#[test]
fn explicit_initialize() {
    let mut solver = backend(SolverConfig::default());
    let m = problem::laplacian_3d(2, 2, 2, 3);
    assert_eq!(solver.initialize(m.dims()).unwrap(), SessionState::Initialized);
    assert_eq!(solver.initialize(m.dims()).unwrap(), SessionState::Initialized);
}

#[test]
fn unavailable_backend_fails_at_configuration() {
    let err = "rocalution".parse::<BackendKind>().unwrap_err();
    assert!(matches!(err, BridgeError::Config(_)));
    let err = create_backend(
        BackendKind::Cpu,
        SolverConfig {
            max_iterations: 0,
            ..Default::default()
        },
    )
    .err()
    .unwrap();
    assert!(matches!(err, BridgeError::Config(_)));
}

#[test]
fn row_pointer_past_end_is_structural() {
    let mut solver = backend(SolverConfig::default());
    let m = BlockedMatrix {
        nb: 2,
        block_size: 1,
        row_pointers: vec![0, 5, 2],
        col_indices: vec![0, 1],
        values: vec![1.0, 1.0],
    };
    let mut x = vec![0.0; 2];
    let err = solver.solve(&m, &[1.0, 1.0], None, &mut x).unwrap_err();
    assert!(matches!(err, BridgeError::Structural(_)));
}
