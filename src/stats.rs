//! Performance statistics collection for `--stats` output.

use std::time::{Duration, Instant};

use crate::solver::device::DeviceCounters;
use crate::solver::{SolveStatus, SolverResult};

/// Wall time spent in each phase of one linear solve.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseTimings {
    /// Validation, well folding and block reordering on the host.
    pub convert: Duration,
    pub upload: Duration,
    /// ILU(0) structure analysis (when needed) and numeric factorization.
    pub preconditioner: Duration,
    pub krylov: Duration,
    pub download: Duration,
}

/// Collects per-solve diagnostics across a session.
///
/// Created when `--stats` is passed, threaded as `Option<&mut Stats>`.
pub struct Stats {
    total_start: Instant,
    phases: Vec<(&'static str, Duration)>,
    pub iterations_per_solve: Vec<usize>,
    pub converged_solves: u32,
    pub failed_solves: u32,
    pub numerical_faults: u32,
    // Accumulated over all solves
    pub convert: Duration,
    pub upload: Duration,
    pub preconditioner: Duration,
    pub krylov: Duration,
    pub download: Duration,
    // Device counters (read from the backend at the end)
    pub dispatches: u32,
    pub readbacks: u32,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_start: Instant::now(),
            phases: Vec::new(),
            iterations_per_solve: Vec::new(),
            converged_solves: 0,
            failed_solves: 0,
            numerical_faults: 0,
            convert: Duration::ZERO,
            upload: Duration::ZERO,
            preconditioner: Duration::ZERO,
            krylov: Duration::ZERO,
            download: Duration::ZERO,
            dispatches: 0,
            readbacks: 0,
        }
    }

    /// Record a completed phase with its duration.
    pub fn add_phase(&mut self, name: &'static str, duration: Duration) {
        self.phases.push((name, duration));
    }

    pub fn record(&mut self, result: &SolverResult, timings: &PhaseTimings) {
        self.iterations_per_solve.push(result.iterations);
        if result.converged {
            self.converged_solves += 1;
        } else {
            self.failed_solves += 1;
        }
        if result.status == SolveStatus::NumericalFault {
            self.numerical_faults += 1;
        }
        self.convert += timings.convert;
        self.upload += timings.upload;
        self.preconditioner += timings.preconditioner;
        self.krylov += timings.krylov;
        self.download += timings.download;
    }

    pub fn record_counters(&mut self, counters: DeviceCounters) {
        self.dispatches = counters.dispatches;
        self.readbacks = counters.readbacks;
    }

    pub fn average_iterations(&self) -> f64 {
        if self.iterations_per_solve.is_empty() {
            return 0.0;
        }
        self.iterations_per_solve.iter().sum::<usize>() as f64
            / self.iterations_per_solve.len() as f64
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        let total = self.total_start.elapsed();
        eprintln!();
        eprintln!("=== Porelin Performance Stats ===");

        for (name, dur) in &self.phases {
            eprintln!("  {:<24} {:>8.3}s", name, dur.as_secs_f64());
        }

        let solves = self.iterations_per_solve.len();
        if solves > 0 {
            eprintln!(
                "  Linear solves:          {}  (converged={}  failed={}  faults={})",
                solves, self.converged_solves, self.failed_solves, self.numerical_faults
            );
            let iters_str: Vec<String> =
                self.iterations_per_solve.iter().map(|i| i.to_string()).collect();
            eprintln!("    BiCGStab iters:       {}", iters_str.join(" / "));
            eprintln!("    BiCGStab avg:         {:.1}", self.average_iterations());
            eprintln!("    Convert:              {:>8.3}s", self.convert.as_secs_f64());
            eprintln!("    Upload:               {:>8.3}s", self.upload.as_secs_f64());
            eprintln!("    Preconditioner:       {:>8.3}s", self.preconditioner.as_secs_f64());
            eprintln!("    Krylov:               {:>8.3}s", self.krylov.as_secs_f64());
            eprintln!("    Download:             {:>8.3}s", self.download.as_secs_f64());
        }

        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
        eprintln!("  Device dispatches:      {}", self.dispatches);
        eprintln!("  Device readbacks:       {}", self.readbacks);
    }
}
