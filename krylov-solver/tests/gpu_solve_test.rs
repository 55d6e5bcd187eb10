use krylov_core::{sum_chunk, ChunkLayout, InnerProductBuffer};
use krylov_solver::{
    Backend, BiCgStabTag, CgTag, Context, CsrMatrix, GmresTag, GmresVariant, GpuDevice,
    HostBackend, KrylovError, LaunchConfig, Placement, SolveAlgorithm, SparseFormat, SparseMatrix,
    Triplet, Vector,
};
use pollster::block_on;

// Helper for float comparison in tests
fn assert_approx_eq_vec(a: &[f32], b: &[f32], tolerance: f32) {
    assert_eq!(a.len(), b.len(), "Vector lengths differ");
    for i in 0..a.len() {
        let diff = (a[i] - b[i]).abs();
        assert!(
            diff <= tolerance,
            "Verification failed at index {}: expected {}, got {}, diff {}",
            i,
            b[i],
            a[i],
            diff
        );
    }
}

/// Machines without a usable adapter skip the GPU tests.
fn gpu_device(work_groups: usize) -> Option<GpuDevice> {
    match block_on(GpuDevice::with_work_groups(work_groups)) {
        Ok(device) => Some(device),
        Err(e) => {
            log::warn!("Skipping GPU test: {}", e);
            None
        }
    }
}

fn from_dense(rows: &[&[f32]]) -> CsrMatrix<f32> {
    let mut triplets = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            if v != 0.0 {
                triplets.push(Triplet::new(i, j, v));
            }
        }
    }
    CsrMatrix::from_triplets(rows.len(), rows[0].len(), triplets).unwrap()
}

fn tridiagonal(n: usize) -> CsrMatrix<f32> {
    let mut triplets = Vec::new();
    for i in 0..n {
        if i > 0 {
            triplets.push(Triplet::new(i, i - 1, -1.0));
        }
        triplets.push(Triplet::new(i, i, 3.0));
        if i + 1 < n {
            triplets.push(Triplet::new(i, i + 1, -1.0));
        }
    }
    CsrMatrix::from_triplets(n, n, triplets).unwrap()
}

fn residual_norm(a: &CsrMatrix<f32>, x: &[f32], b: &[f32]) -> f32 {
    let mut ax = vec![0.0; b.len()];
    a.spmv(x, &mut ax).unwrap();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    ax.iter()
        .zip(b)
        .map(|(l, r)| (l - r) * (l - r))
        .sum::<f32>()
        .sqrt()
        / norm_b
}

#[test]
fn test_gpu_solve_conjugate_gradient() -> Result<(), KrylovError> {
    let Some(device) = gpu_device(16) else {
        return Ok(());
    };
    block_on(async {
        let csr = from_dense(&[&[4.0, -1.0, 0.0], &[-1.0, 4.0, -1.0], &[0.0, -1.0, 4.0]]);
        let a = device.upload_matrix("a", &csr.into())?;
        let b = vec![1.0, 2.0, 3.0];

        let tag = CgTag::default().with_tolerance(1e-5);
        let solved = tag.solve(&device, &a, &b).await?;

        assert!(solved.outcome.converged(), "{:?}", solved.outcome);
        assert_approx_eq_vec(&solved.x, &[0.464, 0.857, 0.964], 1e-3);
        Ok(())
    })
}

#[test]
fn test_gpu_solve_bicgstab() -> Result<(), KrylovError> {
    let Some(device) = gpu_device(16) else {
        return Ok(());
    };
    block_on(async {
        let csr = from_dense(&[&[1.0, 0.0, 0.0], &[-237.0, 1.0, 0.0], &[0.0, -2.5, 1.0]]);
        let a = device.upload_matrix("a", &csr.into())?;
        let b = vec![1.0, 0.0, 0.0];

        let tag = BiCgStabTag::default().with_tolerance(1e-6);
        let solved = tag.solve(&device, &a, &b).await?;

        let expected = [1.0, 237.0, 592.5];
        for (x, e) in solved.x.iter().zip(expected) {
            assert!((x - e).abs() <= 1e-3 * e, "expected {}, got {}", e, x);
        }
        Ok(())
    })
}

#[test]
fn test_gpu_solve_gmres_variants() -> Result<(), KrylovError> {
    let Some(device) = gpu_device(16) else {
        return Ok(());
    };
    let n = 64;
    let csr = tridiagonal(n);
    let b: Vec<f32> = (0..n).map(|i| (i as f32 / n as f32).sin() + 0.5).collect();
    let a = device.upload_matrix("a", &csr.clone().into())?;
    for variant in [GmresVariant::Householder, GmresVariant::Pipelined] {
        let tag = GmresTag::with_params(1e-5, 400, 16).with_variant(variant);
        let solved = block_on(tag.solve(&device, &a, &b))?;
        assert!(solved.outcome.converged(), "{:?}: {:?}", variant, solved.outcome);
        assert!(residual_norm(&csr, &solved.x, &b) < 1e-4);
    }
    Ok(())
}

#[test]
fn test_gpu_fused_product_matches_host() -> Result<(), KrylovError> {
    let work_groups = 8;
    let Some(device) = gpu_device(work_groups) else {
        return Ok(());
    };
    let host = HostBackend::<f32>::with_config(LaunchConfig::new(work_groups, 128)?)?;

    let n = 300;
    let mut rng = fastrand::Rng::with_seed(5);
    let mut triplets = Vec::new();
    for i in 0..n {
        triplets.push(Triplet::new(i, i, 4.0));
        for _ in 0..rng.usize(0..6) {
            triplets.push(Triplet::new(i, rng.usize(0..n), rng.f32() - 0.5));
        }
    }
    let csr = CsrMatrix::from_triplets(n, n, triplets)?;
    let p: Vec<f32> = (0..n).map(|_| rng.f32()).collect();

    for format in [
        SparseFormat::Csr,
        SparseFormat::Coo { groups: work_groups },
        SparseFormat::Ell,
        SparseFormat::SlicedEll {
            rows_per_block: 32,
            sigma: 64,
        },
        SparseFormat::Hybrid,
    ] {
        let matrix = SparseMatrix::from_csr(csr.clone(), format)?;
        let (host_ap, host_sums) = block_on(fused_product(&host, &matrix, &p))?;
        let a_gpu = device.upload_matrix("a", &matrix)?;
        let (gpu_ap, gpu_sums) = block_on(fused_product(&device, &a_gpu, &p))?;

        assert_approx_eq_vec(&gpu_ap, &host_ap, 1e-4);
        for (g, h) in gpu_sums.iter().zip(&host_sums) {
            assert!(
                (g - h).abs() <= 1e-4 * h.abs().max(1.0),
                "{}: gpu {} vs host {}",
                format.name(),
                g,
                h
            );
        }
    }
    Ok(())
}

#[test]
fn test_gpu_fused_product_of_empty_matrix() -> Result<(), KrylovError> {
    // Enough groups for the default COO group count.
    let Some(device) = gpu_device(128) else {
        return Ok(());
    };
    let p = vec![1.0; 5];
    for format in SparseFormat::ALL {
        let matrix = SparseMatrix::from_csr(CsrMatrix::new(5, 5), format)?;
        let a_gpu = device.upload_matrix("empty", &matrix)?;
        let (ap, sums) = block_on(fused_product(&device, &a_gpu, &p))?;
        assert_eq!(ap, vec![0.0; 5], "{}", format.name());
        assert_eq!(&sums[1..], &[0.0, 0.0], "{}", format.name());
    }
    Ok(())
}

/// Runs the CG fused product and returns `Ap` with the reduced chunk sums.
async fn fused_product<B: Backend<Scalar = f32>>(
    backend: &B,
    a: &B::Matrix,
    p: &[f32],
) -> Result<(Vec<f32>, Vec<f32>), KrylovError> {
    let chunk = backend.launch_config().chunk_size();
    let p = backend.from_slice("p", p)?;
    let mut ap = backend.zeros("ap", p.len())?;
    let data = backend.zeros("inner_products", chunk * ChunkLayout::CG_CHUNKS)?;
    let mut buffer = InnerProductBuffer::new(data, chunk, ChunkLayout::CG_CHUNKS)?;
    backend.prod(a, &p, &mut ap, &mut buffer).await?;
    backend.finish().await?;
    let partials = backend.to_host(&buffer.data).await?;
    let sums = (0..ChunkLayout::CG_CHUNKS)
        .map(|c| sum_chunk(&partials, buffer.chunk_offset(c), chunk))
        .collect();
    Ok((backend.to_host(&ap).await?, sums))
}

#[test]
fn test_gpu_context_solve() -> Result<(), KrylovError> {
    if gpu_device(16).is_none() {
        return Ok(());
    }
    let context = block_on(Context::new(Placement::Gpu))?;
    assert_eq!(context.placement(), Placement::Gpu);
    let csr = tridiagonal(32);
    let b = vec![1.0; 32];
    let tag = CgTag::default().with_tolerance(1e-5);
    let solved = block_on(context.solve_jacobi(&tag, &csr.clone().into(), &b))?;
    assert!(solved.outcome.converged(), "{:?}", solved.outcome);
    assert!(residual_norm(&csr, &solved.x, &b) < 1e-4);
    Ok(())
}
