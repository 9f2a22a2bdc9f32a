use approx::assert_abs_diff_eq;
use mlscript::context;
use mlscript::tensors::{Op, SliceSpec};
use mlscript::{Error, Matrix, Tensor};
use proptest::prelude::*;

fn matrix(rows: usize, cols: usize, data: &[f64]) -> Tensor {
    Tensor::new(rows, cols, data.to_vec()).unwrap()
}

/// Central differences of `f` around `x`.
fn finite_difference<F>(f: F, x: &[f64], epsilon: f64) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let mut grad = vec![0.0; x.len()];
    let mut x_plus = x.to_vec();
    let mut x_minus = x.to_vec();

    for i in 0..x.len() {
        x_plus[i] = x[i] + epsilon;
        x_minus[i] = x[i] - epsilon;
        grad[i] = (f(&x_plus) - f(&x_minus)) / (2.0 * epsilon);
        x_plus[i] = x[i];
        x_minus[i] = x[i];
    }

    grad
}

fn shaped(max: usize) -> impl Strategy<Value = (usize, usize, Vec<f64>, Vec<f64>)> {
    (1..max, 1..max).prop_flat_map(|(r, c)| {
        (
            Just(r),
            Just(c),
            prop::collection::vec(-10.0f64..10.0, r * c),
            prop::collection::vec(-10.0f64..10.0, r * c),
        )
    })
}

proptest! {
    #[test]
    fn prop_sum_of_add_gives_ones((r, c, x, y) in shaped(5)) {
        let a = matrix(r, c, &x);
        let b = matrix(r, c, &y);
        a.add(&b).unwrap().sum().backward().unwrap();
        prop_assert!(a.grad().data().iter().all(|&g| g == 1.0));
        prop_assert!(b.grad().data().iter().all(|&g| g == 1.0));
        prop_assert_eq!(a.grad().shape(), (r, c));
    }

    #[test]
    fn prop_log_softmax_matches_log_of_softmax((r, c, x, _) in shaped(6)) {
        let t = matrix(r, c, &x);
        let direct = t.log_softmax();
        let composed = t.softmax().log();
        for (d, l) in direct.value().data().iter().zip(composed.value().data()) {
            prop_assert!((d - l).abs() < 1e-9);
        }
    }
}

#[test]
fn test_matmul_gradient_matches_finite_difference() {
    let a_data = [0.5, -1.0, 2.0, 1.5, 0.25, -0.75];
    let b_data = [1.0, 2.0, -0.5, 0.0, 3.0, -1.25, 0.8, 0.1, -2.0, 1.1, 0.6, 0.4];

    let a = matrix(2, 3, &a_data);
    let b = matrix(3, 4, &b_data);
    a.matmul(&b).unwrap().sum().backward().unwrap();

    let f_a = |x: &[f64]| {
        Matrix::new(2, 3, x.to_vec())
            .unwrap()
            .matmul(&Matrix::new(3, 4, b_data.to_vec()).unwrap())
            .unwrap()
            .sum()
    };
    let f_b = |x: &[f64]| {
        Matrix::new(2, 3, a_data.to_vec())
            .unwrap()
            .matmul(&Matrix::new(3, 4, x.to_vec()).unwrap())
            .unwrap()
            .sum()
    };

    for (analytic, numeric) in a.grad().data().iter().zip(finite_difference(f_a, &a_data, 1e-5)) {
        assert_abs_diff_eq!(*analytic, numeric, epsilon = 1e-6);
    }
    for (analytic, numeric) in b.grad().data().iter().zip(finite_difference(f_b, &b_data, 1e-5)) {
        assert_abs_diff_eq!(*analytic, numeric, epsilon = 1e-6);
    }
}

#[test]
fn test_sigmoid_and_div_gradients_match_finite_difference() {
    let x_data = [0.3, -1.2, 2.0, 0.9];
    let y_data = [1.5, 2.5, -0.5, 4.0];
    let x = matrix(2, 2, &x_data);
    let y = matrix(2, 2, &y_data);
    x.sigmoid().div(&y).unwrap().sum().backward().unwrap();

    let f = |v: &[f64]| {
        v.iter()
            .zip(&y_data)
            .map(|(a, b)| 1.0 / (1.0 + (-a).exp()) / b)
            .sum::<f64>()
    };
    for (analytic, numeric) in x.grad().data().iter().zip(finite_difference(f, &x_data, 1e-6)) {
        assert_abs_diff_eq!(*analytic, numeric, epsilon = 1e-6);
    }
}

#[test]
fn test_elementwise_division_by_zero_is_not_an_error() {
    let a = matrix(1, 2, &[1.0, 0.0]);
    let b = matrix(1, 2, &[0.0, 0.0]);
    let q = a.div(&b).unwrap();
    assert!(q.value().data().iter().all(|x| !x.is_finite()));
}

#[test]
fn test_shape_mismatch_is_reported() {
    let a = Tensor::zeros(2, 3);
    let b = Tensor::zeros(2, 3);
    assert!(matches!(a.matmul(&b), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(a.add(&Tensor::zeros(3, 2)), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(Tensor::new(2, 2, vec![1.0; 3]), Err(Error::ShapeMismatch { .. })));
}

#[test]
fn test_gradients_accumulate_until_zeroed() {
    let a = matrix(1, 2, &[1.0, 2.0]);
    a.mul_scalar(3.0).sum().backward().unwrap();
    a.mul_scalar(3.0).sum().backward().unwrap();
    assert_eq!(a.grad().data(), &[6.0, 6.0]);
    a.zero_grad();
    assert!(!a.has_grad());
    assert_eq!(a.grad().data(), &[0.0, 0.0]);
}

#[test]
fn test_dangling_edge_after_tape_clear() {
    context::reset();
    let a = matrix(1, 2, &[1.0, -1.0]);
    let hidden = a.mul_scalar(2.0);
    let out = hidden.relu().sum();
    drop(hidden);
    context::clear_tape();

    let err = out.backward().unwrap_err();
    assert!(matches!(err, Error::DanglingGraphEdge { .. }));
}

#[test]
fn test_tape_keeps_intermediates_alive() {
    context::reset();
    let a = matrix(1, 2, &[1.0, -1.0]);
    let out = a.mul_scalar(2.0).relu().sum();
    assert!(context::tape_len() >= 3);
    out.backward().unwrap();
    assert_eq!(a.grad().data(), &[2.0, 0.0]);
}

#[test]
fn test_no_grad_records_nothing() {
    context::reset();
    let a = matrix(2, 2, &[1.0, 2.0, 3.0, 4.0]);
    let out = {
        let _guard = context::no_grad();
        a.matmul(&a).unwrap().sum()
    };
    assert_eq!(context::tape_len(), 0);
    assert!(out.is_leaf());
    assert!(!out.requires_grad());
    assert_eq!(*out.op(), Op::Leaf);
    assert_abs_diff_eq!(out.item().unwrap(), 54.0);

    out.backward().unwrap();
    assert!(!a.has_grad());
}

#[test]
fn test_slice_scatters_gradient() {
    let x = matrix(3, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    let s = x
        .slice(SliceSpec::new(None, None, Some(2)), SliceSpec::range(1, 3))
        .unwrap();
    assert_eq!(s.shape(), (2, 2));
    assert_eq!(s.value().data(), &[2.0, 3.0, 8.0, 9.0]);

    s.mul_scalar(5.0).sum().backward().unwrap();
    assert_eq!(
        x.grad().data(),
        &[0.0, 5.0, 5.0, 0.0, 0.0, 0.0, 0.0, 5.0, 5.0]
    );
}

#[test]
fn test_negative_step_slice() {
    let x = matrix(1, 4, &[1.0, 2.0, 3.0, 4.0]);
    let s = x
        .slice(SliceSpec::full(), SliceSpec::new(None, None, Some(-1)))
        .unwrap();
    assert_eq!(s.value().data(), &[4.0, 3.0, 2.0, 1.0]);
    assert!(matches!(
        x.slice(SliceSpec::full(), SliceSpec::new(None, None, Some(0))),
        Err(Error::ZeroSliceStep)
    ));
}

#[test]
fn test_row_access_and_slicing() {
    let x = matrix(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let row = x.get_row(1).unwrap();
    assert_eq!(row.value().data(), &[3.0, 4.0]);
    assert!(matches!(x.get_row(3), Err(Error::IndexOutOfRange { .. })));

    let rows = x.slice_rows(1, 10);
    assert_eq!(rows.shape(), (2, 2));

    row.sum().add(&rows.sum()).unwrap().backward().unwrap();
    assert_eq!(x.grad().data(), &[0.0, 0.0, 2.0, 2.0, 1.0, 1.0]);
}

#[test]
fn test_flatten_reshapes_gradient() {
    let x = matrix(2, 2, &[1.0, -2.0, 3.0, -4.0]);
    let flat = x.flatten();
    assert_eq!(flat.shape(), (1, 4));
    flat.relu().sum().backward().unwrap();
    assert_eq!(x.grad().shape(), (2, 2));
    assert_eq!(x.grad().data(), &[1.0, 0.0, 1.0, 0.0]);
}

#[test]
fn test_softmax_backward_is_unsupported() {
    let x = matrix(1, 3, &[0.1, 0.2, 0.3]);
    let err = x.softmax().sum().backward().unwrap_err();
    assert!(matches!(err, Error::UnknownOperationTag(tag) if tag == "softmax"));
}

#[test]
fn test_log_softmax_rows_normalize() {
    let x = matrix(2, 3, &[1.0, 2.0, 3.0, -1.0, 0.0, 1000.0]);
    let p = x.softmax();
    for row in p.value().data().chunks(3) {
        assert_abs_diff_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }
    assert!(x.log_softmax().value().data().iter().all(|v| v.is_finite()));
}

#[test]
fn test_parsed_literal_feeds_graph() {
    let m = Matrix::parse("[[1, 2], [3, 4.5]]").unwrap();
    assert_eq!(m.shape(), (2, 2));
    let t = Tensor::from_matrix(m);
    assert_abs_diff_eq!(t.sum().item().unwrap(), 10.5);
    assert!(matches!(Matrix::parse("[[1, 2], [3]]"), Err(Error::Parse(_))));
}

#[test]
fn test_plain_operators_never_record() {
    context::reset();
    let a = matrix(2, 2, &[1.0, 2.0, 3.0, 4.0]);
    let b = matrix(2, 2, &[4.0, 3.0, 2.0, 1.0]);

    let sum = a.plain_add(&b).unwrap();
    let diff = a.plain_sub(&b).unwrap();
    let prod = a.plain_mul(&b).unwrap();
    let quot = a.plain_div(&b).unwrap();
    let scaled = a.plain_scale(0.5);
    let mm = a.plain_matmul(&b).unwrap();

    assert_eq!(sum.value().data(), &[5.0; 4]);
    assert_eq!(diff.value().data(), &[-3.0, -1.0, 1.0, 3.0]);
    assert_eq!(prod.value().data(), &[4.0, 6.0, 6.0, 4.0]);
    assert_eq!(quot.value().data(), &[0.25, 2.0 / 3.0, 1.5, 4.0]);
    assert_eq!(scaled.value().data(), &[0.5, 1.0, 1.5, 2.0]);
    assert_eq!(mm.value().data(), &[8.0, 5.0, 20.0, 13.0]);

    for t in [&sum, &diff, &prod, &quot, &scaled, &mm] {
        assert!(t.is_leaf());
    }
    assert_eq!(context::tape_len(), 0);
}

#[test]
fn test_log_backward_divides_by_input() {
    let x = matrix(1, 2, &[2.0, 4.0]);
    x.log().sum().backward().unwrap();
    assert_eq!(x.grad().data(), &[0.5, 0.25]);
}

#[test]
fn test_log_softmax_gradient_matches_finite_difference() {
    let x_data = [0.2, -1.0, 1.5, 3.0, 0.0, -0.5];
    let w_data = [0.3, -2.0, 1.0, 0.5, 1.5, -0.7];
    let x = matrix(2, 3, &x_data);
    let w = Tensor::constant(Matrix::new(2, 3, w_data.to_vec()).unwrap());
    x.log_softmax().mul(&w).unwrap().sum().backward().unwrap();

    let f = |v: &[f64]| {
        Matrix::new(2, 3, v.to_vec())
            .unwrap()
            .log_softmax_rows()
            .mul(&Matrix::new(2, 3, w_data.to_vec()).unwrap())
            .unwrap()
            .sum()
    };
    for (analytic, numeric) in x.grad().data().iter().zip(finite_difference(f, &x_data, 1e-6)) {
        assert_abs_diff_eq!(*analytic, numeric, epsilon = 1e-6);
    }
}
