//! Generic BiCGStab iterative solver.
//!
//! Right-preconditioned BiCGStab written against the `KrylovDevice` trait, so
//! the same iteration runs on the host fallback and on the GPU. Numerical
//! non-convergence is never an error: every way the iteration can stop is a
//! `SolveStatus`. Only device failures (readback, mapping) propagate as `Err`.

use tracing::debug;

use crate::error::Result;

use super::device::KrylovDevice;
use super::{SolveStatus, SolverConfig};

/// Scratch vectors of one BiCGStab run, allocated once per session.
pub struct KrylovWorkspace<D: KrylovDevice> {
    pub(crate) r: D::Buffer,
    pub(crate) r_hat: D::Buffer,
    pub(crate) p: D::Buffer,
    pub(crate) v: D::Buffer,
    pub(crate) s: D::Buffer,
    pub(crate) t: D::Buffer,
    pub(crate) p_hat: D::Buffer,
    pub(crate) s_hat: D::Buffer,
}

impl<D: KrylovDevice> KrylovWorkspace<D> {
    pub fn allocate(device: &D, n: usize) -> Result<Self> {
        Ok(Self {
            r: device.new_buffer(n)?,
            r_hat: device.new_buffer(n)?,
            p: device.new_buffer(n)?,
            v: device.new_buffer(n)?,
            s: device.new_buffer(n)?,
            t: device.new_buffer(n)?,
            p_hat: device.new_buffer(n)?,
            s_hat: device.new_buffer(n)?,
        })
    }
}

/// How one run of the iteration ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub status: SolveStatus,
    pub iterations: usize,
    pub initial_norm: f64,
    /// Last finite residual norm observed.
    pub final_norm: f64,
}

/// Stopping test applied to every residual norm, in priority order.
fn classify(norm: f64, norm0: f64, config: &SolverConfig) -> Option<SolveStatus> {
    if !norm.is_finite() {
        Some(SolveStatus::NumericalFault)
    } else if norm / norm0 <= config.tolerance {
        Some(SolveStatus::RelativeTolerance)
    } else if norm <= config.absolute_tolerance {
        Some(SolveStatus::AbsoluteTolerance)
    } else if norm / norm0 >= config.divergence_tolerance {
        Some(SolveStatus::Diverged)
    } else {
        None
    }
}

fn usable(scalar: f64) -> bool {
    scalar.is_finite() && scalar != 0.0
}

/// Solve Ax = b using right-preconditioned BiCGStab.
///
/// On entry `x` must be zero, so the initial residual is `b`. The
/// `preconditioner_apply` closure computes `output = M⁻¹ * input`.
pub fn bicgstab<D: KrylovDevice>(
    device: &D,
    a: &D::Matrix,
    b: &D::Buffer,
    x: &D::Buffer,
    preconditioner_apply: impl Fn(&D, &D::Buffer, &D::Buffer),
    ws: &KrylovWorkspace<D>,
    config: &SolverConfig,
) -> Result<Outcome> {
    let _span = tracing::debug_span!("bicgstab").entered();

    device.copy(b, &ws.r);
    device.copy(b, &ws.r_hat);
    device.fill_zero(&ws.p);
    device.fill_zero(&ws.v);

    let norm0 = device.dot(&ws.r, &ws.r)?.sqrt();
    let finish = |status, iterations, final_norm| Outcome {
        status,
        iterations,
        initial_norm: norm0,
        final_norm,
    };

    if !norm0.is_finite() {
        // No meaningful reduction exists; report none.
        return Ok(Outcome {
            status: SolveStatus::NumericalFault,
            iterations: 0,
            initial_norm: 1.0,
            final_norm: 1.0,
        });
    }
    if norm0 == 0.0 {
        return Ok(finish(SolveStatus::RelativeTolerance, 0, 0.0));
    }
    if let Some(status) = classify(norm0, norm0, config) {
        return Ok(finish(status, 0, norm0));
    }

    let mut rho = 1.0;
    let mut alpha = 1.0;
    let mut omega = 1.0;
    let mut last_norm = norm0;

    for iter in 1..=config.max_iterations {
        let rho_new = device.dot(&ws.r_hat, &ws.r)?;
        if !usable(rho_new) {
            debug!(iteration = iter, "BiCGStab breakdown: rho = {rho_new}");
            return Ok(finish(SolveStatus::NumericalFault, iter - 1, last_norm));
        }
        let beta = (rho_new / rho) * (alpha / omega);
        rho = rho_new;

        // p = r + beta * (p - omega * v)
        device.axpy(-omega, &ws.v, &ws.p);
        device.scale(beta, &ws.p);
        device.axpy(1.0, &ws.r, &ws.p);

        preconditioner_apply(device, &ws.p, &ws.p_hat);
        device.spmv(a, &ws.p_hat, &ws.v);

        let r_hat_dot_v = device.dot(&ws.r_hat, &ws.v)?;
        if !usable(r_hat_dot_v) {
            debug!(iteration = iter, "BiCGStab breakdown: r_hat.v = {r_hat_dot_v}");
            return Ok(finish(SolveStatus::NumericalFault, iter - 1, last_norm));
        }
        alpha = rho / r_hat_dot_v;

        // s = r - alpha * v
        device.copy(&ws.r, &ws.s);
        device.axpy(-alpha, &ws.v, &ws.s);

        // Half step: s small enough means x + alpha * p_hat is the answer.
        let s_norm = device.dot(&ws.s, &ws.s)?.sqrt();
        match classify(s_norm, norm0, config) {
            Some(status @ (SolveStatus::RelativeTolerance | SolveStatus::AbsoluteTolerance)) => {
                device.axpy(alpha, &ws.p_hat, x);
                return Ok(finish(status, iter, s_norm));
            }
            Some(SolveStatus::NumericalFault) => {
                return Ok(finish(SolveStatus::NumericalFault, iter - 1, last_norm));
            }
            _ => {}
        }

        preconditioner_apply(device, &ws.s, &ws.s_hat);
        device.spmv(a, &ws.s_hat, &ws.t);

        let t_dot_t = device.dot(&ws.t, &ws.t)?;
        if !usable(t_dot_t) {
            debug!(iteration = iter, "BiCGStab breakdown: t.t = {t_dot_t}");
            return Ok(finish(SolveStatus::NumericalFault, iter - 1, last_norm));
        }
        let t_dot_s = device.dot(&ws.t, &ws.s)?;
        omega = t_dot_s / t_dot_t;
        if !usable(omega) {
            debug!(iteration = iter, "BiCGStab breakdown: omega = {omega}");
            return Ok(finish(SolveStatus::NumericalFault, iter - 1, last_norm));
        }

        // x = x + alpha * p_hat + omega * s_hat
        device.axpy(alpha, &ws.p_hat, x);
        device.axpy(omega, &ws.s_hat, x);

        // r = s - omega * t
        device.copy(&ws.s, &ws.r);
        device.axpy(-omega, &ws.t, &ws.r);

        let r_norm = device.dot(&ws.r, &ws.r)?.sqrt();
        if config.verbosity >= 2 {
            debug!(
                iteration = iter,
                residual = r_norm,
                relative = r_norm / norm0,
                "bicgstab iteration"
            );
        }
        match classify(r_norm, norm0, config) {
            Some(SolveStatus::NumericalFault) => {
                return Ok(finish(SolveStatus::NumericalFault, iter, last_norm));
            }
            Some(status) => return Ok(finish(status, iter, r_norm)),
            None => last_norm = r_norm,
        }
    }

    Ok(finish(
        SolveStatus::MaxIterations,
        config.max_iterations,
        last_norm,
    ))
}
