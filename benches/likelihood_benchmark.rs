use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use felsen::config::{CachingStrategy, KernelBackend, LikelihoodSettings, ScalingMethod};
use felsen::data::{CharacterMatrix, NodeIdx, Tree};
use felsen::model::simulate::simulate_alignment;
use felsen::model::{
    LikelihoodKernel, NucleotideCtmc, RateMatrix, ScalarKernel, SiteMixture, WideKernel,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::hint::black_box;
use std::sync::Arc;

fn dataset(n_tips: usize, n_sites: usize) -> (Tree, Arc<CharacterMatrix>, RateMatrix<4>, SiteMixture) {
    let tree = Tree::caterpillar(n_tips, 0.05).unwrap();
    let q = RateMatrix::hky(3.0, [0.2, 0.3, 0.3, 0.2]);
    let mix = SiteMixture::equal_weights(vec![0.14, 0.47, 1.0, 2.39]).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let data = simulate_alignment(&tree, &q, &mix, n_sites, &mut rng).unwrap();
    (tree, Arc::new(data), q, mix)
}

/// Benchmark the per-site propagate kernel for each backend
fn bench_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagate_kernel");
    let p = RateMatrix::hky(3.0, [0.2, 0.3, 0.3, 0.2])
        .transition_probabilities(0.1)
        .unwrap();
    let vectors: Vec<[f64; 4]> = (0..1024)
        .map(|i| {
            let x = (i % 7) as f64 / 7.0;
            [x, 1.0 - x, 0.5 * x, 0.25]
        })
        .collect();
    group.throughput(Throughput::Elements(vectors.len() as u64));

    group.bench_function("scalar", |b| {
        b.iter(|| {
            let mut acc = 0.0;
            for v in &vectors {
                acc += <ScalarKernel as LikelihoodKernel<4>>::propagate(black_box(&p), v)[0];
            }
            black_box(acc)
        })
    });
    group.bench_function("simd", |b| {
        b.iter(|| {
            let mut acc = 0.0;
            for v in &vectors {
                acc += WideKernel::propagate(black_box(&p), v)[0];
            }
            black_box(acc)
        })
    });

    group.finish();
}

/// Benchmark a full evaluation for different alignment lengths
fn bench_full_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_evaluation");
    group.sample_size(20);

    for n_sites in [1_000, 10_000] {
        let (tree, data, q, mix) = dataset(64, n_sites);
        group.throughput(Throughput::Elements(n_sites as u64));

        for backend in [KernelBackend::Scalar, KernelBackend::Simd] {
            let settings = LikelihoodSettings {
                backend,
                ..LikelihoodSettings::default()
            };
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", backend).to_lowercase(), n_sites),
                &n_sites,
                |b, _| {
                    b.iter(|| {
                        let mut model = NucleotideCtmc::new(
                            tree.clone(),
                            Arc::clone(&data),
                            q.clone(),
                            mix.clone(),
                            settings,
                        )
                        .unwrap();
                        black_box(model.ln_probability().unwrap())
                    })
                },
            );
        }
    }

    group.finish();
}

/// Benchmark a single-branch proposal followed by reject
fn bench_incremental_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("branch_proposal");
    let (tree, data, q, mix) = dataset(64, 5_000);

    for caching in [CachingStrategy::EdgeConditioned, CachingStrategy::NodeConditioned] {
        for method in [ScalingMethod::Threshold, ScalingMethod::Direct] {
            let settings = LikelihoodSettings {
                caching,
                scaling_method: method,
                ..LikelihoodSettings::default()
            };
            let mut model =
                NucleotideCtmc::new(tree.clone(), Arc::clone(&data), q.clone(), mix.clone(), settings)
                    .unwrap();
            model.ln_probability().unwrap();
            model.accept();

            // A tip near the root of the ladder has the shortest path.
            let node = NodeIdx::from(tree.n_tips() - 1);
            group.bench_function(BenchmarkId::new(format!("{:?}", caching), format!("{:?}", method)), |b| {
                b.iter(|| {
                    model.set_branch_length(node, 0.07).unwrap();
                    let ln_p = model.ln_probability().unwrap();
                    model.reject();
                    black_box(ln_p)
                })
            });
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_kernels,
    bench_full_evaluation,
    bench_incremental_update,
);

criterion_main!(benches);
