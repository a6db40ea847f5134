//! WGSL compute shader sources for the wgpu device.
//!
//! All values are f32 on the device. Matrix and ILU factor blocks are stored
//! column-major: element (r, c) of a `bs x bs` block sits at `c * bs + r`.
//! Index arrays are u32. Kernels take a 2D grid so vectors longer than
//! 65535 workgroups still dispatch; `flat_index` linearizes it.

/// Threads per workgroup in every kernel.
pub const WORKGROUP_SIZE: u32 = 64;

/// WGSL source containing all compute kernels.
///
/// Entry points:
/// - `bsr_spmv`: y = A * x, one thread per scalar row
/// - `dot_partial`: per-workgroup partial sums of x . y
/// - `vec_axpy`: y = alpha * x + y
/// - `vec_scale`: x = alpha * x
/// - `ilu_lower`: forward block sweep for the rows of one level
/// - `ilu_upper`: in-place backward block sweep for the rows of one level
pub const SHADER_SOURCE: &str = r#"
const WG_SIZE: u32 = 64u;
const MAX_BS: u32 = 6u;

fn flat_index(gid: vec3<u32>, nwg: vec3<u32>) -> u32 {
    return gid.x + gid.y * nwg.x * WG_SIZE;
}

struct VecParams {
    alpha: f32,
    n: u32,
    _pad0: u32,
    _pad1: u32,
}

// --- Block SpMV ---

struct SpmvParams {
    nb: u32,
    bs: u32,
    n: u32,
    _pad: u32,
}

@group(0) @binding(0) var<storage, read> spmv_row_ptr: array<u32>;
@group(0) @binding(1) var<storage, read> spmv_col: array<u32>;
@group(0) @binding(2) var<storage, read> spmv_vals: array<f32>;
@group(0) @binding(3) var<storage, read> spmv_x: array<f32>;
@group(0) @binding(4) var<storage, read_write> spmv_y: array<f32>;
@group(0) @binding(5) var<uniform> spmv_params: SpmvParams;

@compute @workgroup_size(64)
fn bsr_spmv(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let row = flat_index(gid, nwg);
    if row >= spmv_params.n {
        return;
    }
    let bs = spmv_params.bs;
    let brow = row / bs;
    let r = row % bs;
    var sum: f32 = 0.0;
    for (var idx = spmv_row_ptr[brow]; idx < spmv_row_ptr[brow + 1u]; idx = idx + 1u) {
        let base = idx * bs * bs;
        let xbase = spmv_col[idx] * bs;
        for (var c = 0u; c < bs; c = c + 1u) {
            sum = sum + spmv_vals[base + c * bs + r] * spmv_x[xbase + c];
        }
    }
    spmv_y[row] = sum;
}

// --- Dot product partials, reduced on the host ---

var<workgroup> dot_scratch: array<f32, 64>;

@group(0) @binding(0) var<storage, read> dot_x: array<f32>;
@group(0) @binding(1) var<storage, read> dot_y: array<f32>;
@group(0) @binding(2) var<storage, read_write> dot_out: array<f32>;
@group(0) @binding(3) var<uniform> dot_params: VecParams;

@compute @workgroup_size(64)
fn dot_partial(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let i = flat_index(gid, nwg);
    let local_id = lid.x;

    if i < dot_params.n {
        dot_scratch[local_id] = dot_x[i] * dot_y[i];
    } else {
        dot_scratch[local_id] = 0.0;
    }
    workgroupBarrier();

    var stride = WG_SIZE / 2u;
    while stride > 0u {
        if local_id < stride {
            dot_scratch[local_id] = dot_scratch[local_id] + dot_scratch[local_id + stride];
        }
        workgroupBarrier();
        stride = stride / 2u;
    }

    if local_id == 0u {
        dot_out[wid.x + wid.y * nwg.x] = dot_scratch[0];
    }
}

// --- AXPY: y = alpha * x + y ---

@group(0) @binding(0) var<storage, read> axpy_x: array<f32>;
@group(0) @binding(1) var<storage, read_write> axpy_y: array<f32>;
@group(0) @binding(2) var<uniform> axpy_params: VecParams;

@compute @workgroup_size(64)
fn vec_axpy(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let i = flat_index(gid, nwg);
    if i >= axpy_params.n {
        return;
    }
    axpy_y[i] = axpy_params.alpha * axpy_x[i] + axpy_y[i];
}

// --- Scale: x = alpha * x ---

@group(0) @binding(0) var<storage, read_write> scale_x: array<f32>;
@group(0) @binding(1) var<uniform> scale_params: VecParams;

@compute @workgroup_size(64)
fn vec_scale(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let i = flat_index(gid, nwg);
    if i >= scale_params.n {
        return;
    }
    scale_x[i] = scale_params.alpha * scale_x[i];
}

// --- Level-scheduled block ILU(0) apply ---
// Group 0 is fixed per level (factors, level rows, params); group 1 holds the
// vectors of the current call. Lower blocks hold L (unit diagonal implied),
// upper blocks hold U, diagonal blocks hold inv(U_ii).

struct LevelParams {
    start: u32,
    count: u32,
    bs: u32,
    _pad: u32,
}

@group(0) @binding(0) var<storage, read> ilu_row_ptr: array<u32>;
@group(0) @binding(1) var<storage, read> ilu_col: array<u32>;
@group(0) @binding(2) var<storage, read> ilu_diag: array<u32>;
@group(0) @binding(3) var<storage, read> ilu_vals: array<f32>;
@group(0) @binding(4) var<storage, read> ilu_rows: array<u32>;
@group(0) @binding(5) var<uniform> ilu_level: LevelParams;

@group(1) @binding(0) var<storage, read> ilu_in: array<f32>;
@group(1) @binding(1) var<storage, read_write> ilu_out: array<f32>;

@compute @workgroup_size(64)
fn ilu_lower(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let t = flat_index(gid, nwg);
    if t >= ilu_level.count {
        return;
    }
    let bs = ilu_level.bs;
    let i = ilu_rows[ilu_level.start + t];

    var acc: array<f32, MAX_BS>;
    for (var r = 0u; r < bs; r = r + 1u) {
        acc[r] = ilu_in[i * bs + r];
    }
    for (var kk = ilu_row_ptr[i]; kk < ilu_diag[i]; kk = kk + 1u) {
        let base = kk * bs * bs;
        let k = ilu_col[kk];
        for (var c = 0u; c < bs; c = c + 1u) {
            let zk = ilu_out[k * bs + c];
            for (var r = 0u; r < bs; r = r + 1u) {
                acc[r] = acc[r] - ilu_vals[base + c * bs + r] * zk;
            }
        }
    }
    for (var r = 0u; r < bs; r = r + 1u) {
        ilu_out[i * bs + r] = acc[r];
    }
}

@group(1) @binding(0) var<storage, read_write> ilu_x: array<f32>;

@compute @workgroup_size(64)
fn ilu_upper(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let t = flat_index(gid, nwg);
    if t >= ilu_level.count {
        return;
    }
    let bs = ilu_level.bs;
    let i = ilu_rows[ilu_level.start + t];
    let d = ilu_diag[i];

    var acc: array<f32, MAX_BS>;
    for (var r = 0u; r < bs; r = r + 1u) {
        acc[r] = ilu_x[i * bs + r];
    }
    for (var jj = d + 1u; jj < ilu_row_ptr[i + 1u]; jj = jj + 1u) {
        let base = jj * bs * bs;
        let j = ilu_col[jj];
        for (var c = 0u; c < bs; c = c + 1u) {
            let xj = ilu_x[j * bs + c];
            for (var r = 0u; r < bs; r = r + 1u) {
                acc[r] = acc[r] - ilu_vals[base + c * bs + r] * xj;
            }
        }
    }
    let dbase = d * bs * bs;
    for (var r = 0u; r < bs; r = r + 1u) {
        var sum: f32 = 0.0;
        for (var c = 0u; c < bs; c = c + 1u) {
            sum = sum + ilu_vals[dbase + c * bs + r] * acc[c];
        }
        ilu_x[i * bs + r] = sum;
    }
}
"#;
