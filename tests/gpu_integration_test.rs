//! Integration tests comparing the wgpu and host backends on the same systems.
//!
//! The GPU device works in f32, so results are compared with loose
//! tolerances. Every test is skipped when no adapter is available.

use approx::assert_abs_diff_eq;
use porelin::convert::{convert_matrix, HostStaging};
use porelin::problem;
use porelin::solver::device::KrylovDevice;
use porelin::solver::gpu::WgpuDevice;
use porelin::solver::preconditioner::BlockIlu0;
use porelin::solver::{create_backend, BackendKind, SessionState, SolverConfig, WgpuBackend};

fn gpu_available() -> bool {
    WgpuDevice::open().is_ok()
}

macro_rules! skip_if_no_gpu {
    () => {
        if !gpu_available() {
            eprintln!("Skipping: no GPU available");
            return;
        }
    };
}

fn config(tolerance: f64) -> SolverConfig {
    SolverConfig {
        tolerance,
        ..Default::default()
    }
}

#[test]
fn gpu_spmv_matches_host() {
    skip_if_no_gpu!();
    let dev = WgpuDevice::open().unwrap();
    let m = problem::laplacian_3d(4, 3, 2, 3);
    let mut staging = HostStaging::allocate(m.dims(), WgpuDevice::BLOCK_ORDER).unwrap();
    convert_matrix(&m, &m.values, &mut staging).unwrap();
    let mut dm = dev.alloc_matrix(m.dims()).unwrap();
    dev.write_matrix(&mut dm, &staging);

    let xs: Vec<f64> = (0..m.n()).map(|i| (i % 5) as f64 - 2.0).collect();
    let x = dev.new_buffer(m.n()).unwrap();
    let y = dev.new_buffer(m.n()).unwrap();
    dev.upload_vec(&xs, &x);
    dev.spmv(&dm, &x, &y);
    let mut out = vec![0.0; m.n()];
    dev.download_vec(&y, &mut out).unwrap();

    let expected = m.spmv(&xs);
    for i in 0..m.n() {
        assert_abs_diff_eq!(out[i], expected[i], epsilon = 1e-4);
    }
}

#[test]
fn gpu_level_scheduled_ilu_matches_host() {
    skip_if_no_gpu!();
    let dev = WgpuDevice::open().unwrap();
    let m = problem::laplacian_3d(5, 4, 3, 2);
    let mut ilu = BlockIlu0::analyze(&m);
    ilu.factorize(&m.values).unwrap();
    assert!(ilu.lower_levels.count() > 1);

    let mut factors = dev.alloc_factors(&ilu).unwrap();
    dev.write_factors(&mut factors, &ilu);

    let r: Vec<f64> = (0..m.n()).map(|i| 1.0 + (i % 3) as f64).collect();
    let input = dev.new_buffer(m.n()).unwrap();
    let output = dev.new_buffer(m.n()).unwrap();
    dev.upload_vec(&r, &input);
    let before = dev.counters().dispatches;
    dev.apply_preconditioner(&factors, &input, &output);
    let levels = ilu.lower_levels.count() + ilu.upper_levels.count();
    assert_eq!((dev.counters().dispatches - before) as usize, levels);

    let mut out = vec![0.0; m.n()];
    dev.download_vec(&output, &mut out).unwrap();
    let mut expected = vec![0.0; m.n()];
    ilu.apply(&r, &mut expected);
    for i in 0..m.n() {
        assert_abs_diff_eq!(out[i], expected[i], epsilon = 1e-4);
    }
}

#[test]
fn gpu_tridiagonal_three_by_three() {
    skip_if_no_gpu!();
    let mut solver = create_backend(BackendKind::Wgpu, config(1e-5)).unwrap();
    let m = problem::tridiagonal(3);
    let (x, result) = solver.solve_owned(&m, &[1.0, 0.0, 1.0], None).unwrap();
    assert!(result.converged);
    assert!(result.iterations < 10);
    for xi in x {
        assert_abs_diff_eq!(xi, 1.0, epsilon = 1e-4);
    }
}

#[test]
fn gpu_matches_cpu_on_block_laplacian() {
    skip_if_no_gpu!();
    for bs in [1, 3] {
        let m = problem::laplacian_3d(6, 5, 4, bs);
        let b = problem::rhs_for_ones(&m);
        let (x_gpu, r_gpu) = create_backend(BackendKind::Wgpu, config(1e-5))
            .unwrap()
            .solve_owned(&m, &b, None)
            .unwrap();
        let (x_cpu, r_cpu) = create_backend(BackendKind::Cpu, config(1e-5))
            .unwrap()
            .solve_owned(&m, &b, None)
            .unwrap();
        assert!(r_gpu.converged, "block size {bs}: {r_gpu:?}");
        assert!(r_cpu.converged);
        for i in 0..m.n() {
            assert_abs_diff_eq!(x_gpu[i], x_cpu[i], epsilon = 1e-3);
        }
    }
}

#[test]
fn gpu_zero_diagonal_does_not_panic() {
    skip_if_no_gpu!();
    let mut solver = create_backend(BackendKind::Wgpu, SolverConfig::default()).unwrap();
    let m = porelin::sparse::BlockedMatrix::from_scalar_triplets(2, &[(0, 1, 1.0), (1, 0, 1.0)])
        .unwrap();
    let (_, result) = solver.solve_owned(&m, &[1.0, 2.0], None).unwrap();
    assert!(!result.converged);
}

#[test]
fn gpu_session_reuse_and_counters() {
    skip_if_no_gpu!();
    let mut solver = WgpuBackend::new(config(1e-4)).unwrap();
    let mut m = problem::laplacian_3d(4, 4, 4, 3);
    for step in 0..3 {
        problem::perturb(&mut m, step);
        let b = problem::rhs_for_ones(&m);
        let mut x = vec![0.0; m.n()];
        let result = solver.solve(&m, &b, None, &mut x).unwrap();
        assert!(result.converged, "step {step}: {result:?}");
    }
    let counters = solver.counters();
    assert!(counters.dispatches > 0);
    assert!(counters.readbacks > 0);

    // A different grid forces reallocation on the same device.
    let m = problem::laplacian_3d(3, 3, 3, 2);
    let b = problem::rhs_for_ones(&m);
    let mut x = vec![0.0; m.n()];
    assert!(solver.solve(&m, &b, None, &mut x).unwrap().converged);

    solver.dispose();
    assert_eq!(solver.state(), SessionState::Disposed);
    solver.dispose();
}
