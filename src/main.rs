use clap::Parser;
use porelin::problem;
use porelin::solver::{create_backend, BackendKind, SolverConfig};
use porelin::stats::Stats;
use std::io::{self, Write};
use std::time::Instant;

/// Solve synthetic reservoir-style block systems with a chosen backend
#[derive(Parser)]
#[command(name = "porelin", version)]
struct Cli {
    /// Backend: cpu or wgpu
    #[arg(long, default_value = "wgpu")]
    backend: BackendKind,

    /// Grid cells in x
    #[arg(long, default_value_t = 20)]
    nx: usize,

    /// Grid cells in y
    #[arg(long, default_value_t = 20)]
    ny: usize,

    /// Grid cells in z
    #[arg(long, default_value_t = 5)]
    nz: usize,

    /// Equations per cell
    #[arg(long, default_value_t = 3)]
    block_size: usize,

    #[arg(long, default_value_t = 200)]
    max_iterations: usize,

    /// Relative residual reduction
    #[arg(long, default_value_t = 1e-2)]
    tolerance: f64,

    /// Absolute residual norm that stops the iteration
    #[arg(long, default_value_t = 1e-15)]
    absolute_tolerance: f64,

    /// Residual growth factor treated as divergence
    #[arg(long, default_value_t = 1e3)]
    divergence_tolerance: f64,

    /// 0 quiet, 1 summary, 2 per iteration, 3 phase timings
    #[arg(long, default_value_t = 0)]
    verbosity: u32,

    /// Number of solves, each with perturbed values on the same pattern
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Print performance stats to stderr
    #[arg(long)]
    stats: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut stats = if cli.stats { Some(Stats::new()) } else { None };

    let config = SolverConfig {
        verbosity: cli.verbosity,
        max_iterations: cli.max_iterations,
        tolerance: cli.tolerance,
        absolute_tolerance: cli.absolute_tolerance,
        divergence_tolerance: cli.divergence_tolerance,
    };

    let setup_start = Instant::now();
    let mut backend = create_backend(cli.backend, config).unwrap_or_else(|e| {
        eprintln!("Backend error: {}", e);
        std::process::exit(1);
    });
    let mut matrix = problem::laplacian_3d(cli.nx, cli.ny, cli.nz, cli.block_size);
    if let Some(ref mut stats) = stats {
        stats.add_phase("Setup", setup_start.elapsed());
    }

    let mut stdout = io::stdout();
    writeln!(
        stdout,
        "solve,status,converged,iterations,reduction,conv_rate,elapsed,max_error"
    )
    .unwrap_or_else(|e| {
        eprintln!("Output error: {}", e);
        std::process::exit(1);
    });

    for step in 0..cli.repeat {
        if step > 0 {
            problem::perturb(&mut matrix, step);
        }
        let rhs = problem::rhs_for_ones(&matrix);
        let (x, result) = backend.solve_owned(&matrix, &rhs, None).unwrap_or_else(|e| {
            eprintln!("Solve error: {}", e);
            std::process::exit(1);
        });
        let max_error = x.iter().map(|v| (v - 1.0).abs()).fold(0.0, f64::max);
        writeln!(
            stdout,
            "{},{:?},{},{},{:e},{:.4},{:.6},{:e}",
            step,
            result.status,
            result.converged,
            result.iterations,
            result.reduction,
            result.conv_rate,
            result.elapsed,
            max_error
        )
        .unwrap_or_else(|e| {
            eprintln!("Output error: {}", e);
            std::process::exit(1);
        });
        if let Some(ref mut stats) = stats {
            stats.record(&result, &backend.last_timings());
        }
    }

    if let Some(ref mut stats) = stats {
        stats.record_counters(backend.counters());
    }
    backend.dispose();

    if let Some(ref stats) = stats {
        stats.display();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_flags() {
        let cli = Cli::try_parse_from([
            "porelin",
            "--backend",
            "cpu",
            "--absolute-tolerance",
            "1e-12",
            "--divergence-tolerance",
            "50",
        ])
        .unwrap();
        assert_eq!(cli.absolute_tolerance, 1e-12);
        assert_eq!(cli.divergence_tolerance, 50.0);
        assert_eq!(cli.tolerance, 1e-2);
    }

    #[test]
    fn test_tolerance_defaults_match_solver() {
        let cli = Cli::try_parse_from(["porelin"]).unwrap();
        let defaults = SolverConfig::default();
        assert_eq!(cli.absolute_tolerance, defaults.absolute_tolerance);
        assert_eq!(cli.divergence_tolerance, defaults.divergence_tolerance);
        assert_eq!(cli.max_iterations, defaults.max_iterations);
    }
}
