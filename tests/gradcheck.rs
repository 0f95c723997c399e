//! Analytic gradients against central finite differences.
//!
//! The scalar under test is `L = Σ wc·c + Σ wh·h` for random weights, so the
//! upstream gradients are exactly `(wc, wh)`.

use nary_treelstm::approx::max_relative_error;
use nary_treelstm::{backward, forward, Array, Element, Tensor, Upstream};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct Case {
    children: Vec<Tensor<f64>>,
    x: Tensor<f64>,
    wc: Tensor<f64>,
    wh: Tensor<f64>,
}

fn random(rng: &mut StdRng, shape: &[usize], scale: f64) -> Tensor<f64> {
    let len = shape.iter().product();
    let data = (0..len).map(|_| rng.random_range(-scale..scale)).collect();
    Tensor::new(shape.to_vec(), data)
}

/// Random batch, feature width and trailing dimension, then random values.
fn case(seed: u64, arity: usize) -> Case {
    let mut rng = StdRng::seed_from_u64(seed);
    let batch = rng.random_range(1..=3);
    let features = rng.random_range(1..=3);
    let trailing = rng.random_range(1..=3);
    let child_shape = [batch, features, trailing];
    let x_shape = [batch, features * (3 + arity), trailing];
    Case {
        children: (0..arity).map(|_| random(&mut rng, &child_shape, 1.0)).collect(),
        x: random(&mut rng, &x_shape, 2.0),
        wc: random(&mut rng, &child_shape, 1.0),
        wh: random(&mut rng, &child_shape, 1.0),
    }
}

fn cast<T: Element>(t: &Tensor<f64>) -> Array<T> {
    Array::from(Tensor::new(
        t.shape.clone(),
        t.data.iter().map(|&v| T::from_f64(v)).collect(),
    ))
}

fn loss(children: &[Tensor<f64>], x: &Tensor<f64>, wc: &Tensor<f64>, wh: &Tensor<f64>) -> f64 {
    let arrays: Vec<Array<f64>> = children.iter().map(cast).collect();
    let refs: Vec<&Array<f64>> = arrays.iter().collect();
    let (out, _) = forward(&refs, &cast(x)).unwrap();
    let c = out.c.into_host().unwrap();
    let h = out.h.into_host().unwrap();
    let dot = |a: &Tensor<f64>, w: &Tensor<f64>| -> f64 {
        a.data.iter().zip(&w.data).map(|(a, w)| a * w).sum()
    };
    dot(&c, wc) + dot(&h, wh)
}

/// Numeric gradients `(dL/dc_1..dL/dc_N, dL/dx)`.
fn numeric(case: &Case, eps: f64) -> Vec<Vec<f64>> {
    let mut grads = Vec::new();
    for n in 0..case.children.len() {
        let mut g = Vec::new();
        for e in 0..case.children[n].len() {
            let mut plus = case.children.clone();
            plus[n].data[e] += eps;
            let mut minus = case.children.clone();
            minus[n].data[e] -= eps;
            g.push(
                (loss(&plus, &case.x, &case.wc, &case.wh)
                    - loss(&minus, &case.x, &case.wc, &case.wh))
                    / (2.0 * eps),
            );
        }
        grads.push(g);
    }
    let mut gx = Vec::new();
    for e in 0..case.x.len() {
        let mut plus = case.x.clone();
        plus.data[e] += eps;
        let mut minus = case.x.clone();
        minus.data[e] -= eps;
        gx.push(
            (loss(&case.children, &plus, &case.wc, &case.wh)
                - loss(&case.children, &minus, &case.wc, &case.wh))
                / (2.0 * eps),
        );
    }
    grads.push(gx);
    grads
}

/// Analytic gradients at element type `T`, widened to `f64`.
fn analytic<T: Element>(case: &Case) -> Vec<Vec<f64>> {
    let arrays: Vec<Array<T>> = case.children.iter().map(cast).collect();
    let refs: Vec<&Array<T>> = arrays.iter().collect();
    let x = cast::<T>(&case.x);
    let (_, ctx) = forward(&refs, &x).unwrap();
    let (wc, wh) = (cast::<T>(&case.wc), cast::<T>(&case.wh));
    let grads = backward(&ctx, &refs, &x, Upstream::Given(&wc), Upstream::Given(&wh)).unwrap();
    grads
        .into_vec()
        .into_iter()
        .map(|g| g.into_host().unwrap().data.iter().map(|v| v.into_f64()).collect())
        .collect()
}

fn check<T: Element>(case: &Case, tolerance: f64) {
    let expected = numeric(case, 1e-6);
    let actual = analytic::<T>(case);
    assert_eq!(expected.len(), actual.len());
    for (i, (e, a)) in expected.iter().zip(&actual).enumerate() {
        let err = max_relative_error(e, a);
        assert!(err < tolerance, "input {i}: relative error {err}");
    }
}

#[test]
fn test_gradcheck_binary() {
    for seed in [1, 7] {
        check::<f64>(&case(seed, 2), 1e-6);
    }
}

#[test]
fn test_gradcheck_ternary() {
    for seed in [2, 8] {
        check::<f64>(&case(seed, 3), 1e-6);
    }
}

#[test]
fn test_gradcheck_five_children() {
    check::<f64>(&case(3, 5), 1e-6);
}

#[test]
fn test_gradcheck_f32_within_single_precision() {
    for (seed, arity) in [(4, 2), (5, 3), (6, 5)] {
        check::<f32>(&case(seed, arity), 1e-3);
    }
}
