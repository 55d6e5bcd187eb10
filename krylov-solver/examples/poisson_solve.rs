use krylov_solver::{
    BiCgStabTag, CgTag, Context, CsrMatrix, GmresTag, GmresVariant, SparseFormat, SparseMatrix,
    Triplet,
};
use std::time::Instant;

/// Creates the 5-point Laplacian on a `side x side` grid.
/// Diagonals:
/// - Main: 4.0
/// - Horizontal neighbours (+1, -1): -1.0
/// - Vertical neighbours (+side, -side): -1.0
fn create_poisson_matrix(side: usize) -> CsrMatrix<f32> {
    let n = side * side;
    let mut triplets = Vec::with_capacity(5 * n);
    for row in 0..side {
        for col in 0..side {
            let i = row * side + col;
            if row > 0 {
                triplets.push(Triplet::new(i, i - side, -1.0));
            }
            if col > 0 {
                triplets.push(Triplet::new(i, i - 1, -1.0));
            }
            triplets.push(Triplet::new(i, i, 4.0));
            if col + 1 < side {
                triplets.push(Triplet::new(i, i + 1, -1.0));
            }
            if row + 1 < side {
                triplets.push(Triplet::new(i, i + side, -1.0));
            }
        }
    }
    CsrMatrix::from_triplets(n, n, triplets).expect("Failed to assemble the Poisson matrix")
}

/// Creates a vector b of size n with b[i] = sin(i / n).
fn create_sin_vector(n: usize) -> Vec<f32> {
    (0..n).map(|i| (i as f32 / n as f32).sin()).collect()
}

#[tokio::main]
async fn main() {
    // Initialize logging based on RUST_LOG environment variable
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_module("wgpu", log::LevelFilter::Off)
        .init();

    let side = 64;
    let n = side * side;
    log::info!("Setting up {}x{} Poisson matrix A and sin vector b...", n, n);

    let csr = create_poisson_matrix(side);
    let b = create_sin_vector(n);

    let context = Context::best_available().await;
    log::info!("Solving on {:?}", context.placement());

    let tolerance = 1e-5;
    let max_iterations = n;

    for format in SparseFormat::ALL {
        let a = match SparseMatrix::from_csr(csr.clone(), format) {
            Ok(a) => a,
            Err(e) => {
                log::error!("Conversion to {} failed: {}", format.name(), e);
                continue;
            }
        };
        log::info!("--- {} ---", format.name());

        if let Context::Gpu(device) = &context {
            device.reset_transfer_stats();
        }

        let start_time = Instant::now();
        let cg = CgTag::with_params(tolerance, max_iterations);
        report("CG", context.solve(&cg, &a, &b).await, start_time);

        let start_time = Instant::now();
        let bicgstab = BiCgStabTag::with_params(tolerance, max_iterations);
        report("BiCGStab", context.solve(&bicgstab, &a, &b).await, start_time);

        for variant in [GmresVariant::Householder, GmresVariant::Pipelined] {
            let start_time = Instant::now();
            let gmres = GmresTag::with_params(tolerance, max_iterations, 30).with_variant(variant);
            report(
                &format!("GMRES ({:?})", variant),
                context.solve(&gmres, &a, &b).await,
                start_time,
            );
        }

        if let Context::Gpu(device) = &context {
            let stats = device.get_transfer_stats();
            log::info!("GPU Transfer Stats:");
            log::info!("  Bytes CPU -> GPU: {}", stats.bytes_to_gpu);
            log::info!("  Bytes GPU -> CPU: {}", stats.bytes_from_gpu);
        }
    }
}

fn report(
    name: &str,
    result: Result<krylov_solver::SolveResult<f32>, krylov_solver::KrylovError>,
    start_time: Instant,
) {
    match result {
        Ok(result) => {
            log::info!(
                "{}: {:?} after {} iterations, relative residual {:.6e}, {:?}",
                name,
                result.outcome.termination,
                result.outcome.iterations,
                result.outcome.relative_error,
                start_time.elapsed()
            );
        }
        Err(e) => {
            log::error!("{} failed: {:?}", name, e);
        }
    }
}
