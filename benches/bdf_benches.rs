use bdf_ivp::solver::bdf::BDF;
use criterion::{Criterion, criterion_group, criterion_main};
use nalgebra::{DMatrix, DVector};
use std::hint::black_box;

fn stiff_decay() -> (
    impl Fn(f64, &DVector<f64>) -> DVector<f64>,
    impl Fn(f64, &DVector<f64>) -> DMatrix<f64>,
) {
    let ode_fn =
        |_t: f64, y: &DVector<f64>| DVector::from_vec(vec![-y[0], -1000.0 * y[1]]);
    let jacobian_fn = |_t: f64, _y: &DVector<f64>| {
        DMatrix::from_diagonal(&DVector::from_vec(vec![-1.0, -1000.0]))
    };
    (ode_fn, jacobian_fn)
}

fn bench_stiff_decay(c: &mut Criterion) {
    let (ode_fn, jacobian_fn) = stiff_decay();
    let y0 = DVector::from_vec(vec![1.0, 1.0]);
    c.bench_function("stiff decay to t = 1", |b| {
        b.iter(|| {
            BDF::new()
                .solve(&ode_fn, &jacobian_fn, 0.0, black_box(&y0), &[1.0])
                .unwrap()
        })
    });
}

fn bench_van_der_pol(c: &mut Criterion) {
    let mu = 5.0;
    let ode_fn = move |_t: f64, y: &DVector<f64>| {
        DVector::from_vec(vec![y[1], mu * (1.0 - y[0] * y[0]) * y[1] - y[0]])
    };
    let jacobian_fn = move |_t: f64, y: &DVector<f64>| {
        DMatrix::from_row_slice(
            2,
            2,
            &[
                0.0,
                1.0,
                -2.0 * mu * y[0] * y[1] - 1.0,
                mu * (1.0 - y[0] * y[0]),
            ],
        )
    };
    let y0 = DVector::from_vec(vec![2.0, 0.0]);
    c.bench_function("van der pol mu = 5 to t = 1", |b| {
        b.iter(|| {
            BDF::new()
                .solve(&ode_fn, &jacobian_fn, 0.0, black_box(&y0), &[1.0])
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_stiff_decay, bench_van_der_pol);
criterion_main!(benches);
