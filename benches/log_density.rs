use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use moraine::bayes::design::ModelData;
use moraine::bayes::posterior::HierarchicalLogitPosterior;
use moraine::bayes::spec::ModelSpec;
use moraine::lakes::frame::{Categorical, Column, LakeFrame};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

const LEVELS: [&str; 5] = ["lowest", "low", "middle", "high", "highest"];

fn synthetic_frame(rows: usize) -> LakeFrame {
    let mut rng = StdRng::seed_from_u64(0x5EED_0000 + rows as u64);
    let x1: Array1<f64> = (0..rows).map(|_| rng.sample(StandardNormal)).collect();
    let x2: Array1<f64> = (0..rows).map(|_| rng.sample(StandardNormal)).collect();
    let y: Array1<f64> = (0..rows)
        .map(|i| f64::from(rng.r#gen::<f64>() < 1.0 / (1.0 + (2.0 - x1[i]).exp())))
        .collect();
    let labels: Vec<Option<&str>> = (0..rows).map(|i| Some(LEVELS[i % LEVELS.len()])).collect();
    LakeFrame::new((0..rows).map(|i| format!("L{i}")).collect())
        .with_column("glof", Column::Numeric(y))
        .and_then(|f| f.with_column("x1", Column::Numeric(x1)))
        .and_then(|f| f.with_column("x2", Column::Numeric(x2)))
        .and_then(|f| {
            f.with_column(
                "elevation_quintile",
                Column::Categorical(Categorical::from_labels(labels)),
            )
        })
        .unwrap()
}

fn benchmark_log_density(c: &mut Criterion) {
    let spec = ModelSpec::new("bench", "glof")
        .with_predictor("x1")
        .with_predictor("x2")
        .with_group("elevation_quintile");

    let mut group = c.benchmark_group("log_density_and_grad");
    for rows in [250_usize, 1000, 4000] {
        let frame = synthetic_frame(rows);
        let data = ModelData::from_frame(&spec, &frame).unwrap();
        let target = HierarchicalLogitPosterior::new(&spec, &data);
        let mut rng = StdRng::seed_from_u64(7);
        let q: Array1<f64> = (0..target.dim()).map(|_| rng.sample(StandardNormal)).collect();

        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &q, |b, q| {
            b.iter(|| {
                let (lp, grad) = target.log_density_and_grad(black_box(q.view()));
                black_box((lp, grad));
            });
        });
    }
    group.finish();
}

criterion_group!(log_density, benchmark_log_density);
criterion_main!(log_density);
