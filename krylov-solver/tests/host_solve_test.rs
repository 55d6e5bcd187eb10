use krylov_solver::{
    BiCgStabTag, CgTag, CsrMatrix, GmresTag, GmresVariant, HostBackend, JacobiPreconditioner,
    KrylovError, LaunchConfig, SolveAlgorithm, SparseFormat, SparseMatrix, Termination, Triplet,
};
use pollster::block_on;

// Helper for float comparison in tests
fn assert_approx_eq_vec(a: &[f64], b: &[f64], tolerance: f64) {
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

fn backend() -> HostBackend<f64> {
    HostBackend::with_config(LaunchConfig::new(8, 16).unwrap()).unwrap()
}

fn tridiagonal(n: usize) -> CsrMatrix<f64> {
    let mut triplets = Vec::new();
    for i in 0..n {
        if i > 0 {
            triplets.push(Triplet::new(i, i - 1, -1.0));
        }
        triplets.push(Triplet::new(i, i, 2.0));
        if i + 1 < n {
            triplets.push(Triplet::new(i, i + 1, -1.0));
        }
    }
    CsrMatrix::from_triplets(n, n, triplets).unwrap()
}

/// Diagonally dominant random matrix; symmetric when `symmetric` is set.
fn random_matrix(n: usize, seed: u64, symmetric: bool) -> CsrMatrix<f64> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut triplets = Vec::new();
    for i in 0..n {
        triplets.push(Triplet::new(i, i, 6.0 + rng.f64()));
        for _ in 0..rng.usize(1..4) {
            let j = rng.usize(0..n);
            if j == i {
                continue;
            }
            let v = rng.f64() - 0.5;
            triplets.push(Triplet::new(i, j, v));
            if symmetric {
                triplets.push(Triplet::new(j, i, v));
            }
        }
    }
    CsrMatrix::from_triplets(n, n, triplets).unwrap()
}

fn random_vector(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..n).map(|_| rng.f64() * 2.0 - 1.0).collect()
}

fn residual_norm(a: &CsrMatrix<f64>, x: &[f64], b: &[f64]) -> f64 {
    let mut ax = vec![0.0; b.len()];
    a.spmv(x, &mut ax).unwrap();
    let norm_b: f64 = b.iter().map(|v| v * v).sum::<f64>().sqrt();
    ax.iter()
        .zip(b)
        .map(|(l, r)| (l - r) * (l - r))
        .sum::<f64>()
        .sqrt()
        / norm_b
}

#[test]
fn gmres_restart_count() {
    assert_eq!(GmresTag::with_params(1e-10, 300, 20).max_restarts(), 14);
}

#[test]
fn gmres_tridiagonal_converges_in_one_cycle() -> Result<(), KrylovError> {
    let a: SparseMatrix<f64> = tridiagonal(5).into();
    let b = vec![1.0; 5];
    let expected = [2.5, 4.0, 4.5, 4.0, 2.5];
    for variant in [GmresVariant::Householder, GmresVariant::Pipelined] {
        let tag = GmresTag::default().with_krylov_dim(5).with_variant(variant);
        let solved = block_on(tag.solve(&backend(), &a, &b))?;
        assert!(solved.outcome.converged(), "{:?}: {:?}", variant, solved.outcome);
        assert!(solved.outcome.iterations <= 5, "{:?}: {:?}", variant, solved.outcome);
        assert_approx_eq_vec(&solved.x, &expected, 1e-8);
    }
    Ok(())
}

#[test]
fn gmres_variants_agree() -> Result<(), KrylovError> {
    let csr = random_matrix(60, 7, false);
    let b = random_vector(60, 8);
    let a: SparseMatrix<f64> = csr.clone().into();
    let tag = GmresTag::with_params(1e-12, 300, 10);
    let householder = block_on(tag.solve(&backend(), &a, &b))?;
    let pipelined = block_on(
        tag.with_variant(GmresVariant::Pipelined)
            .solve(&backend(), &a, &b),
    )?;
    assert!(householder.outcome.converged());
    assert!(pipelined.outcome.converged());

    let norm: f64 = householder.x.iter().map(|v| v * v).sum::<f64>().sqrt();
    let diff: f64 = householder
        .x
        .iter()
        .zip(&pipelined.x)
        .map(|(l, r)| (l - r) * (l - r))
        .sum::<f64>()
        .sqrt();
    assert!(diff / norm < f64::EPSILON.sqrt(), "relative difference {}", diff / norm);
    assert!(residual_norm(&csr, &pipelined.x, &b) < 1e-10);
    Ok(())
}

#[test]
fn gmres_restarts_until_converged() -> Result<(), KrylovError> {
    let csr = tridiagonal(20);
    let a: SparseMatrix<f64> = csr.clone().into();
    let b = random_vector(20, 3);
    for variant in [GmresVariant::Householder, GmresVariant::Pipelined] {
        let tag = GmresTag::with_params(1e-9, 2000, 8).with_variant(variant);
        let solved = block_on(tag.solve(&backend(), &a, &b))?;
        assert!(solved.outcome.converged(), "{:?}: {:?}", variant, solved.outcome);
        assert!(solved.outcome.iterations > 8);
        assert!(residual_norm(&csr, &solved.x, &b) < 1e-8);
    }
    Ok(())
}

#[test]
fn cg_terminates_within_dimension() -> Result<(), KrylovError> {
    let n = 40;
    let csr = random_matrix(n, 11, true);
    let a: SparseMatrix<f64> = csr.clone().into();
    let b = random_vector(n, 12);
    let solved = block_on(CgTag::default().solve(&backend(), &a, &b))?;
    assert!(solved.outcome.converged(), "{:?}", solved.outcome);
    assert!(solved.outcome.iterations <= n);
    assert!(residual_norm(&csr, &solved.x, &b) < 1e-7);
    Ok(())
}

#[test]
fn cg_identity_scenario() -> Result<(), KrylovError> {
    let a: SparseMatrix<f64> = CsrMatrix::identity(4).into();
    let tag = CgTag::default().with_tolerance(1e-10);
    let solved = block_on(tag.solve(&backend(), &a, &[1.0, 2.0, 3.0, 4.0]))?;
    assert_eq!(solved.x, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(solved.outcome.iterations, 1);
    Ok(())
}

#[test]
fn every_format_gives_the_same_solution() -> Result<(), KrylovError> {
    let csr = random_matrix(70, 21, true);
    let b = random_vector(70, 22);
    let reference = block_on(CgTag::default().solve(&backend(), &csr.clone().into(), &b))?;
    for format in [
        SparseFormat::Coo { groups: 5 },
        SparseFormat::Ell,
        SparseFormat::SlicedEll {
            rows_per_block: 8,
            sigma: 16,
        },
        SparseFormat::Hybrid,
    ] {
        let a = SparseMatrix::from_csr(csr.clone(), format)?;
        let solved = block_on(CgTag::default().solve(&backend(), &a, &b))?;
        assert!(solved.outcome.converged(), "{}", format.name());
        assert_approx_eq_vec(&solved.x, &reference.x, 1e-7);

        let solved = block_on(BiCgStabTag::default().solve(&backend(), &a, &b))?;
        assert!(solved.outcome.converged(), "{}", format.name());
        assert_approx_eq_vec(&solved.x, &reference.x, 1e-7);
    }
    Ok(())
}

#[test]
fn bicgstab_solves_nonsymmetric_system() -> Result<(), KrylovError> {
    let csr = random_matrix(80, 31, false);
    let a: SparseMatrix<f64> = csr.clone().into();
    let b = random_vector(80, 32);
    let solved = block_on(BiCgStabTag::default().solve(&backend(), &a, &b))?;
    assert!(solved.outcome.converged(), "{:?}", solved.outcome);
    assert!(residual_norm(&csr, &solved.x, &b) < 1e-7);
    Ok(())
}

#[test]
fn zero_rhs_returns_zero_for_every_solver() -> Result<(), KrylovError> {
    let a: SparseMatrix<f64> = tridiagonal(6).into();
    let b = vec![0.0; 6];
    let backend = backend();
    let results = [
        block_on(CgTag::default().solve(&backend, &a, &b))?,
        block_on(BiCgStabTag::default().solve(&backend, &a, &b))?,
        block_on(GmresTag::default().solve(&backend, &a, &b))?,
        block_on(
            GmresTag::default()
                .with_variant(GmresVariant::Pipelined)
                .solve(&backend, &a, &b),
        )?,
    ];
    for solved in results {
        assert_eq!(solved.x, vec![0.0; 6]);
        assert_eq!(solved.outcome.iterations, 0);
        assert_eq!(solved.outcome.relative_error, 0.0);
        assert_eq!(solved.outcome.termination, Termination::Converged);
    }
    Ok(())
}

#[test]
fn repeated_solves_are_identical() -> Result<(), KrylovError> {
    let a = SparseMatrix::from_csr(random_matrix(50, 41, false), SparseFormat::Coo { groups: 6 })?;
    let b = random_vector(50, 42);
    let backend = backend();
    let tag = GmresTag::default().with_variant(GmresVariant::Pipelined);
    let first = block_on(tag.solve(&backend, &a, &b))?;
    let second = block_on(tag.solve(&backend, &a, &b))?;
    assert_eq!(first.x, second.x);
    assert_eq!(first.outcome, second.outcome);

    let first = block_on(BiCgStabTag::default().solve(&backend, &a, &b))?;
    let second = block_on(BiCgStabTag::default().solve(&backend, &a, &b))?;
    assert_eq!(first.x, second.x);
    Ok(())
}

#[test]
fn jacobi_solves_badly_scaled_system() -> Result<(), KrylovError> {
    let n = 50;
    let mut triplets = Vec::new();
    for i in 0..n {
        let scale = 10f64.powi((i % 5) as i32);
        triplets.push(Triplet::new(i, i, 4.0 * scale));
        if i + 1 < n {
            triplets.push(Triplet::new(i, i + 1, -1.5));
            triplets.push(Triplet::new(i + 1, i, -1.5));
        }
    }
    let csr = CsrMatrix::from_triplets(n, n, triplets)?;
    let a: SparseMatrix<f64> = csr.clone().into();
    let b = random_vector(n, 51);
    let backend = backend();

    let precond = JacobiPreconditioner::from_matrix(&backend, &a)?;
    let cg = block_on(CgTag::default().solve_preconditioned(&backend, &a, &b, &precond))?;
    assert!(cg.outcome.converged(), "{:?}", cg.outcome);
    assert!(residual_norm(&csr, &cg.x, &b) < 1e-7);

    let bicgstab =
        block_on(BiCgStabTag::default().solve_preconditioned(&backend, &a, &b, &precond))?;
    assert!(bicgstab.outcome.converged(), "{:?}", bicgstab.outcome);
    assert!(residual_norm(&csr, &bicgstab.x, &b) < 1e-7);

    let gmres = block_on(GmresTag::default().solve_preconditioned(&backend, &a, &b, &precond))?;
    assert!(gmres.outcome.converged(), "{:?}", gmres.outcome);
    assert_approx_eq_vec(&gmres.x, &cg.x, 1e-6);
    Ok(())
}

#[test]
fn rectangular_matrix_is_rejected() {
    let a: SparseMatrix<f64> = CsrMatrix::new(3, 4).into();
    let err = block_on(GmresTag::default().solve(&backend(), &a, &[1.0, 2.0, 3.0])).unwrap_err();
    assert!(matches!(err, KrylovError::InvalidDimensions(_)));
}
