//! WGSL source generation for the fused Tree-LSTM kernels.
//!
//! One template per direction, unrolled over the arity `N` at generation
//! time: every child gets its own `af{n}` / `c{n}` locals and its own term in
//! the cell sum (forward) or its own forget-gate and cell gradient writes
//! (backward).
//! Different arities therefore always produce different text, and a pipeline
//! is cached under a [`KernelKey`] that carries the arity.
//!
//! # Binding layout
//!
//! Children are copied into one packed storage buffer before launch (child
//! `n` at offset `(n - 1) * len`). This keeps the binding count independent
//! of `N`:
//!
//! | kernel   | bindings                                                       |
//! |----------|----------------------------------------------------------------|
//! | forward  | `params`, `x`, `cells`, `c_out`, `h_out`                       |
//! | backward | `params`, `c`, `gc`, `gh`, `x`, `cells`, `gx`, `gcells`        |
//!
//! At most seven storage buffers per stage, under the WebGPU default of eight.
//!
//! Every invocation handles one element `e` of a child-shaped tensor. The
//! gate slice `g` of that element sits at
//! `((e / inner) * groups + g) * inner + e % inner` inside `x`, where
//! `inner = F * prod(trailing)` and `groups = 3 + N`.

use core::fmt::Write;

/// Invocations per workgroup along x.
pub const WORKGROUP_SIZE: u32 = 64;

/// Which half of the operator a kernel implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Forward,
    Backward,
}

/// Identifies a generated kernel. Pipelines are cached per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub arity: usize,
    pub kind: KernelKind,
}

impl KernelKey {
    #[must_use]
    pub const fn forward(arity: usize) -> Self {
        Self {
            arity,
            kind: KernelKind::Forward,
        }
    }

    #[must_use]
    pub const fn backward(arity: usize) -> Self {
        Self {
            arity,
            kind: KernelKind::Backward,
        }
    }

    /// Debug label for shader modules and pipelines.
    #[must_use]
    pub fn label(&self) -> String {
        match self.kind {
            KernelKind::Forward => format!("treelstm_fwd_{}", self.arity),
            KernelKind::Backward => format!("treelstm_bwd_{}", self.arity),
        }
    }

    /// Full WGSL source for this key.
    #[must_use]
    pub fn source(&self) -> String {
        match self.kind {
            KernelKind::Forward => forward_source(self.arity),
            KernelKind::Backward => backward_source(self.arity),
        }
    }
}

/// Uniform block shared by both kernels. Must match `Params` in the preamble.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelParams {
    /// Elements in one child cell.
    pub len: u32,
    /// `F * prod(trailing)`.
    pub inner: u32,
    /// `3 + N`.
    pub groups: u32,
    pub _pad: u32,
}

impl KernelParams {
    #[must_use]
    pub fn as_words(&self) -> [u32; 4] {
        [self.len, self.inner, self.groups, self._pad]
    }
}

const PREAMBLE: &str = "struct Params {
    len: u32,
    inner: u32,
    groups: u32,
    _pad: u32,
}

fn tanh_stable(v: f32) -> f32 {
    return tanh(clamp(v, -20.0, 20.0));
}

fn sigmoid(v: f32) -> f32 {
    return tanh_stable(v * 0.5) * 0.5 + 0.5;
}

fn grad_sigmoid(y: f32) -> f32 {
    return y * (1.0 - y);
}

fn grad_tanh(y: f32) -> f32 {
    return 1.0 - y * y;
}
";

const GATE_HELPER: &str = "
fn gate(e: u32, g: u32) -> u32 {
    let b = e / params.inner;
    let r = e % params.inner;
    return (b * params.groups + g) * params.inner + r;
}
";

/// Kernel entry point up to the shared gate loads.
fn entry() -> String {
    format!(
        "
@compute @workgroup_size({WORKGROUP_SIZE})
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {{
    let e = gid.x + gid.y * nwg.x * {WORKGROUP_SIZE}u;
    if (e >= params.len) {{
        return;
    }}
    let aa = tanh_stable(x[gate(e, 0u)]);
    let ai = sigmoid(x[gate(e, 1u)]);
    let ao = sigmoid(x[gate(e, 2u)]);
"
    )
}

/// Per-child loads of the forget gate activation and the child cell.
fn child_loads(src: &mut String, arity: usize) {
    for n in 1..=arity {
        let _ = writeln!(src, "    let af{n} = sigmoid(x[gate(e, {}u)]);", 2 + n);
        let _ = writeln!(src, "    let c{n} = cells[{}u * params.len + e];", n - 1);
    }
}

/// WGSL compute shader for the forward pass at the given arity.
///
/// Writes `c = tanh(a) * sigmoid(i) + Σ sigmoid(f_n) * c_n` and
/// `h = sigmoid(o) * tanh(c)`.
#[must_use]
pub fn forward_source(arity: usize) -> String {
    let mut src = String::with_capacity(1536 + 96 * arity);
    let _ = writeln!(src, "// N-ary Tree-LSTM forward, N = {arity}");
    src.push_str(PREAMBLE);
    src.push_str(
        "
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> x: array<f32>;
@group(0) @binding(2) var<storage, read> cells: array<f32>;
@group(0) @binding(3) var<storage, read_write> c_out: array<f32>;
@group(0) @binding(4) var<storage, read_write> h_out: array<f32>;
",
    );
    src.push_str(GATE_HELPER);
    src.push_str(&entry());
    child_loads(&mut src, arity);

    let terms: Vec<String> = (1..=arity).map(|n| format!("af{n} * c{n}")).collect();
    let _ = writeln!(src, "    let c = aa * ai + {};", terms.join(" + "));
    src.push_str("    c_out[e] = c;\n");
    src.push_str("    h_out[e] = ao * tanh_stable(c);\n");
    src.push_str("}\n");
    src
}

/// WGSL compute shader for the backward pass at the given arity.
///
/// Recomputes the gate activations from `x`, then writes every gate
/// gradient into `gx` (same layout as `x`) and every child gradient into the
/// packed `gcells` buffer.
#[must_use]
pub fn backward_source(arity: usize) -> String {
    let mut src = String::with_capacity(2048 + 192 * arity);
    let _ = writeln!(src, "// N-ary Tree-LSTM backward, N = {arity}");
    src.push_str(PREAMBLE);
    src.push_str(
        "
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> c: array<f32>;
@group(0) @binding(2) var<storage, read> gc: array<f32>;
@group(0) @binding(3) var<storage, read> gh: array<f32>;
@group(0) @binding(4) var<storage, read> x: array<f32>;
@group(0) @binding(5) var<storage, read> cells: array<f32>;
@group(0) @binding(6) var<storage, read_write> gx: array<f32>;
@group(0) @binding(7) var<storage, read_write> gcells: array<f32>;
",
    );
    src.push_str(GATE_HELPER);
    src.push_str(&entry());
    child_loads(&mut src, arity);

    src.push_str("    let co = tanh_stable(c[e]);\n");
    src.push_str("    let temp = gh[e] * ao * grad_tanh(co) + gc[e];\n");
    src.push_str("    gx[gate(e, 0u)] = temp * ai * grad_tanh(aa);\n");
    src.push_str("    gx[gate(e, 1u)] = temp * aa * grad_sigmoid(ai);\n");
    src.push_str("    gx[gate(e, 2u)] = gh[e] * co * grad_sigmoid(ao);\n");
    for n in 1..=arity {
        let _ = writeln!(
            src,
            "    gx[gate(e, {}u)] = temp * c{n} * grad_sigmoid(af{n});",
            2 + n
        );
    }
    for n in 1..=arity {
        let _ = writeln!(src, "    gcells[{}u * params.len + e] = temp * af{n};", n - 1);
    }
    src.push_str("}\n");
    src
}

/// Workgroup grid covering `len` invocations.
///
/// Spills into the y dimension past the 65535-workgroup limit on x; the
/// kernels fold `gid.y` back into a flat index.
#[must_use]
pub fn workgroup_grid(len: u32) -> (u32, u32) {
    const MAX_X: u32 = 65_535;
    let groups = len.div_ceil(WORKGROUP_SIZE);
    if groups <= MAX_X {
        (groups.max(1), 1)
    } else {
        (MAX_X, groups.div_ceil(MAX_X))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_unrolls_one_term_per_child() {
        let src = forward_source(3);
        assert!(src.contains("let c = aa * ai + af1 * c1 + af2 * c2 + af3 * c3;"));
        assert!(src.contains("let af3 = sigmoid(x[gate(e, 5u)]);"));
        assert!(src.contains("let c3 = cells[2u * params.len + e];"));
        assert!(!src.contains("af4"));
        assert!(src.contains("fn main"));
    }

    #[test]
    fn backward_writes_every_gate_and_child() {
        let src = backward_source(2);
        assert!(src.contains("gx[gate(e, 0u)] = temp * ai * grad_tanh(aa);"));
        assert!(src.contains("gx[gate(e, 3u)] = temp * c1 * grad_sigmoid(af1);"));
        assert!(src.contains("gx[gate(e, 4u)] = temp * c2 * grad_sigmoid(af2);"));
        assert!(src.contains("gcells[0u * params.len + e] = temp * af1;"));
        assert!(src.contains("gcells[1u * params.len + e] = temp * af2;"));
        assert!(!src.contains("gx[gate(e, 5u)]"));
    }

    #[test]
    fn distinct_arities_give_distinct_kernels() {
        let sources: Vec<String> = (2..=6).map(forward_source).collect();
        for (i, a) in sources.iter().enumerate() {
            for b in &sources[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_ne!(backward_source(2), backward_source(3));
        assert_eq!(forward_source(4), KernelKey::forward(4).source());
        assert_ne!(KernelKey::forward(2), KernelKey::forward(3));
        assert_ne!(KernelKey::forward(2), KernelKey::backward(2));
        assert_eq!(KernelKey::backward(5).label(), "treelstm_bwd_5");
    }

    #[test]
    fn backward_body_is_larger_than_forward() {
        for n in [2, 3, 5] {
            assert!(backward_source(n).len() > forward_source(n).len());
        }
    }

    #[test]
    fn entry_follows_workgroup_size() {
        let src = forward_source(2);
        assert!(src.contains(&format!("@workgroup_size({WORKGROUP_SIZE})")));
        assert!(src.contains(&format!("nwg.x * {WORKGROUP_SIZE}u")));
    }

    #[test]
    fn every_tanh_saturates() {
        for src in [forward_source(3), backward_source(3)] {
            let bare: Vec<usize> = src
                .match_indices("tanh(")
                .map(|(i, _)| i)
                .filter(|&i| i == 0 || !src[..i].ends_with('_'))
                .collect();
            // the only bare call is inside tanh_stable itself
            assert_eq!(bare.len(), 1, "{src}");
            assert!(src[bare[0]..].starts_with("tanh(clamp("));
        }
        assert!(backward_source(2).contains("let co = tanh_stable(c[e]);"));
    }

    #[test]
    fn grid_spills_into_y() {
        assert_eq!(workgroup_grid(1), (1, 1));
        assert_eq!(workgroup_grid(64), (1, 1));
        assert_eq!(workgroup_grid(65), (2, 1));
        let (x, y) = workgroup_grid(u32::MAX);
        assert_eq!(x, 65_535);
        assert!(u64::from(x) * u64::from(y) * 64 >= u64::from(u32::MAX));
    }
}
