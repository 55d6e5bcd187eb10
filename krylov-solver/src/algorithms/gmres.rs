//! Restarted GMRES in two realizations.
//!
//! [`GmresVariant::Householder`] follows Walker's "A Simpler GMRES": the
//! basis is kept implicitly as a chain of Householder reflectors and the
//! update is reconstructed by applying them in reverse. [`GmresVariant::Pipelined`]
//! stores an explicit basis orthogonalized with the fused classical
//! Gram-Schmidt kernels and solves the small triangular system on the host
//! once per restart cycle.

use num_traits::Float;
use krylov_core::{
    sum_chunk, Backend, ChunkLayout, InnerProductBuffer, KrylovBasis, KrylovError, Scalar,
};
use log::{debug, info, warn};

use super::cg::log_outcome;
use super::{
    cast, download, host_norm_squared, GmresTag, GmresVariant, SolveAlgorithm, SolveResult,
    SolverOutcome, Termination,
};
use crate::preconditioner::Preconditioner;

impl<B: Backend> SolveAlgorithm<B> for GmresTag {
    async fn solve_preconditioned<P: Preconditioner<B>>(
        &self,
        backend: &B,
        a: &B::Matrix,
        b: &[B::Scalar],
        precond: &P,
    ) -> Result<SolveResult<B::Scalar>, KrylovError> {
        <GmresTag as SolveAlgorithm<B>>::validate_inputs(self, a, b)?;
        if self.krylov_dim() == 0 {
            return Err(KrylovError::InvalidDimensions(
                "GMRES needs a Krylov dimension of at least 1".to_string(),
            ));
        }
        if host_norm_squared(b) == 0.0 {
            info!("GMRES: zero right-hand side, returning zero solution");
            return Ok(SolveResult::zero(b.len()));
        }
        // A Krylov space larger than the problem adds nothing.
        let krylov_dim = self.krylov_dim().min(b.len());
        info!(
            "GMRES ({:?}): n = {}, krylov dim = {}, tolerance = {:e}, max restarts = {}, placement = {:?}",
            self.variant(),
            b.len(),
            krylov_dim,
            self.tolerance(),
            self.max_restarts(),
            backend.placement()
        );

        let result = match self.variant() {
            GmresVariant::Pipelined if precond.is_identity() => {
                pipelined_gmres(backend, a, b, self, krylov_dim).await?
            }
            GmresVariant::Pipelined => {
                warn!("Pipelined GMRES takes no preconditioner; running the Householder variant");
                householder_gmres(backend, a, b, self, krylov_dim, precond).await?
            }
            GmresVariant::Householder => {
                householder_gmres(backend, a, b, self, krylov_dim, precond).await?
            }
        };
        log_outcome("GMRES", &result.outcome);
        Ok(result)
    }
}

/// Explicit-basis GMRES built from the fused kernels.
///
/// Basis vector `v_k` is `A v_{k-1}` (with `v_{-1}` the normalized
/// residual) made orthonormal against `v_0..v_{k-1}`, so column `j` of R
/// holds the coefficients of `A z_j` with `z_0 = r`, `z_j = v_{j-1}`.
async fn pipelined_gmres<B: Backend>(
    backend: &B,
    a: &B::Matrix,
    b: &[B::Scalar],
    tag: &GmresTag,
    krylov_dim: usize,
) -> Result<SolveResult<B::Scalar>, KrylovError> {
    let n = b.len();
    let chunk = backend.launch_config().chunk_size();
    let norm_rhs = host_norm_squared(b).sqrt();

    let rhs = backend.from_slice("gmres_rhs", b)?;
    let mut result = backend.zeros("gmres_result", n)?;
    let mut residual = backend.from_slice("gmres_residual", b)?;
    let mut product = backend.zeros("gmres_product", n)?;
    let mut operand = backend.zeros("gmres_operand", n)?;
    let mut basis = KrylovBasis::new(
        backend.zeros(
            "gmres_krylov_basis",
            KrylovBasis::<B::Vector>::internal_size_for(n) * krylov_dim,
        )?,
        n,
        krylov_dim,
    )?;
    let mut r_matrix = backend.zeros("gmres_R", krylov_dim * krylov_dim)?;
    let mut buffer = InnerProductBuffer::new(
        backend.zeros("gmres_inner_prod_buffer", ChunkLayout::GMRES_CHUNKS * chunk)?,
        chunk,
        ChunkLayout::GMRES_CHUNKS,
    )?;
    let mut r_dot_vk = backend.zeros("gmres_r_dot_vk", chunk * krylov_dim)?;
    let mut vi_in_vk = backend.zeros("gmres_vi_in_vk", chunk * krylov_dim)?;
    let mut coefficients = backend.zeros("gmres_coefficients", krylov_dim)?;

    let mut rho_0 = norm_rhs;
    let mut relative_error = 1.0;
    let mut iterations = 0;
    let mut termination = Termination::MaxIterations;

    for restart in 0..=tag.max_restarts() {
        if restart > 0 {
            // True residual, not the recurrence, to avoid drift.
            backend.spmv(a, &result, &mut product).await?;
            backend.copy(&rhs, &mut residual).await?;
            backend.axpy(cast(-1.0), &product, &mut residual).await?;
            rho_0 = backend.norm_2(&residual).await?.as_f64();
            relative_error = rho_0 / norm_rhs;
            if relative_error < tag.tolerance() {
                termination = Termination::Converged;
                break;
            }
            if !rho_0.is_finite() {
                termination = Termination::Breakdown;
                break;
            }
        }
        backend.scale(cast(1.0 / rho_0), &mut residual).await?;

        for k in 0..krylov_dim {
            if k == 0 {
                backend.prod(a, &residual, &mut product, &mut buffer).await?;
            } else {
                backend
                    .copy_range(&basis.vectors, basis.offset(k - 1), &mut operand, 0, n)
                    .await?;
                backend.prod(a, &operand, &mut product, &mut buffer).await?;
            }
            let offset_k = basis.offset(k);
            backend
                .copy_range(&product, 0, &mut basis.vectors, offset_k, n)
                .await?;

            if k > 0 {
                backend
                    .gmres_gram_schmidt_stage1(&basis, k, &mut vi_in_vk)
                    .await?;
                backend
                    .gmres_gram_schmidt_stage2(&mut basis, k, &vi_in_vk, &mut r_matrix, &mut buffer)
                    .await?;
            }

            backend
                .gmres_normalize_vk(
                    &mut basis,
                    k,
                    &residual,
                    &mut r_matrix,
                    k * krylov_dim + k,
                    &buffer,
                    &mut r_dot_vk,
                    k * chunk,
                )
                .await?;
        }
        backend.finish().await?;

        let r_dot_host = backend.to_host(&r_dot_vk).await?;
        let r_host: Vec<f64> = backend
            .to_host(&r_matrix)
            .await?
            .iter()
            .map(|v| v.as_f64())
            .collect();

        let k = usable_dimension(&r_host, krylov_dim, B::Scalar::epsilon().as_f64());
        iterations += k;
        let xi: Vec<f64> = (0..k)
            .map(|i| sum_chunk(&r_dot_host, i * chunk, chunk).as_f64())
            .collect();

        let mut rho: f64 = 1.0;
        for &x in &xi {
            if rho.is_nan() || rho <= 0.0 {
                break;
            }
            let x = x.clamp(-rho, rho);
            rho *= (x / rho).acos().sin();
        }

        let eta = back_substitute(&r_host, krylov_dim, &xi);
        if eta.iter().any(|v| !v.is_finite()) || k == 0 {
            warn!("GMRES breakdown in restart {}: singular triangular system", restart);
            termination = Termination::Breakdown;
            break;
        }
        let update: Vec<B::Scalar> = eta.iter().map(|e| cast(rho_0 * e)).collect();
        backend.write_range(&mut coefficients, 0, &update).await?;
        backend
            .gmres_update_result(&mut result, &residual, &basis, &coefficients, k)
            .await?;

        relative_error = (rho * rho_0 / norm_rhs).abs();
        debug!(
            "GMRES restart {}: {} basis vectors, residual estimate {:.6e}",
            restart, k, relative_error
        );
        if relative_error < tag.tolerance() {
            termination = Termination::Converged;
            break;
        }
    }

    if termination == Termination::MaxIterations {
        // The estimate bottoms out near sqrt(eps); the true residual decides.
        backend.spmv(a, &result, &mut product).await?;
        backend.copy(&rhs, &mut residual).await?;
        backend.axpy(cast(-1.0), &product, &mut residual).await?;
        relative_error = backend.norm_2(&residual).await?.as_f64() / norm_rhs;
        if relative_error < tag.tolerance() {
            termination = Termination::Converged;
        }
    }

    Ok(SolveResult {
        x: download(backend, &result, n).await?,
        outcome: SolverOutcome {
            iterations,
            relative_error,
            termination,
        },
    })
}

/// Number of leading basis vectors whose R diagonal is clearly nonzero.
/// An invariant Krylov subspace shows up as a vanishing (or non-finite)
/// diagonal entry; everything from there on is discarded.
fn usable_dimension(r: &[f64], krylov_dim: usize, epsilon: f64) -> usize {
    let threshold = exhaustion_threshold(epsilon, r[0]);
    (0..krylov_dim)
        .find(|&i| {
            let d = r[i + i * krylov_dim];
            !d.is_finite() || d.abs() <= threshold
        })
        .unwrap_or(krylov_dim)
}

/// Diagonal entries of R at or below this are treated as zero.
fn exhaustion_threshold(epsilon: f64, r_00: f64) -> f64 {
    1e3 * epsilon * r_00.abs()
}

/// Solves the leading `xi.len()` upper-triangular system of the column-major
/// R matrix.
fn back_substitute(r: &[f64], krylov_dim: usize, xi: &[f64]) -> Vec<f64> {
    let k = xi.len();
    let mut eta = xi.to_vec();
    for i in (0..k).rev() {
        for j in i + 1..k {
            eta[i] -= r[i + j * krylov_dim] * eta[j];
        }
        eta[i] /= r[i + i * krylov_dim];
    }
    eta
}

// --- Householder realization ---

async fn read_entry<B: Backend>(backend: &B, v: &B::Vector, i: usize) -> Result<f64, KrylovError> {
    Ok(backend
        .read_range(v, i, 1)
        .await?
        .first()
        .map_or(f64::NAN, |x| x.as_f64()))
}

/// `x -= beta <h,x> h`
async fn reflect<B: Backend>(
    backend: &B,
    x: &mut B::Vector,
    h: &B::Vector,
    beta: f64,
) -> Result<(), KrylovError> {
    let h_dot_x = backend.inner_prod(h, x).await?.as_f64();
    backend.axpy(cast(-beta * h_dot_x), h, x).await
}

/// Builds `hh` (cleared by the caller) and `beta` such that
/// `(I - beta hh hh^T) input` is zero below entry `j`. Returns `(beta, mu)`
/// where `mu` is the resulting entry `j`.
async fn setup_householder_vector<B: Backend>(
    backend: &B,
    input: &B::Vector,
    hh: &mut B::Vector,
    j: usize,
    n: usize,
) -> Result<(f64, f64), KrylovError> {
    let input_j = read_entry(backend, input, j).await?;
    if j + 1 < n {
        backend.copy_range(input, j + 1, hh, j + 1, n - j - 1).await?;
    }
    let sigma = backend.inner_prod(hh, hh).await?.as_f64();
    if sigma == 0.0 {
        return Ok((0.0, input_j));
    }

    let mu = (sigma + input_j * input_j).sqrt();
    let hh_0 = if input_j <= 0.0 {
        input_j - mu
    } else {
        -sigma / (input_j + mu)
    };
    let beta = 2.0 * hh_0 * hh_0 / (sigma + hh_0 * hh_0);
    backend.scale(cast(1.0 / hh_0), hh).await?;
    backend.write_range(hh, j, &[cast(1.0)]).await?;
    Ok((beta, mu))
}

async fn householder_gmres<B: Backend, P: Preconditioner<B>>(
    backend: &B,
    a: &B::Matrix,
    b: &[B::Scalar],
    tag: &GmresTag,
    krylov_dim: usize,
    precond: &P,
) -> Result<SolveResult<B::Scalar>, KrylovError> {
    let n = b.len();
    let norm_rhs = host_norm_squared(b).sqrt();

    let rhs = backend.from_slice("gmres_rhs", b)?;
    let mut result = backend.zeros("gmres_result", n)?;
    let mut res = backend.zeros("gmres_res", n)?;
    let mut v_k_tilde = backend.zeros("gmres_v_k_tilde", n)?;
    let mut v_k_tilde_temp = backend.zeros("gmres_v_k_tilde_temp", n)?;
    let mut reflectors = (0..krylov_dim)
        .map(|k| backend.zeros(&format!("gmres_householder_{}", k), n))
        .collect::<Result<Vec<_>, _>>()?;
    let mut betas = vec![0.0; krylov_dim];
    let epsilon = B::Scalar::epsilon().as_f64();
    // r_columns[k] holds column k of R.
    let mut r_columns = vec![vec![0.0; krylov_dim]; krylov_dim];
    let mut projection_rhs = vec![0.0; krylov_dim];

    let mut relative_error = 1.0;
    let mut iterations = 0;
    let mut termination = Termination::MaxIterations;

    for restart in 0..=tag.max_restarts() {
        // res = M^-1 (b - A x)
        backend.spmv(a, &result, &mut v_k_tilde_temp).await?;
        backend.copy(&rhs, &mut res).await?;
        backend.axpy(cast(-1.0), &v_k_tilde_temp, &mut res).await?;
        precond.apply(backend, &mut res).await?;

        let rho_0 = backend.norm_2(&res).await?.as_f64();
        relative_error = rho_0 / norm_rhs;
        if relative_error < tag.tolerance() {
            termination = Termination::Converged;
            break;
        }
        if !rho_0.is_finite() {
            termination = Termination::Breakdown;
            break;
        }

        backend.scale(cast(1.0 / rho_0), &mut res).await?;
        let mut rho: f64 = 1.0;

        let mut k = 0;
        while k < krylov_dim {
            r_columns[k].fill(0.0);
            backend.fill_zero(&mut reflectors[k]).await?;

            if k == 0 {
                backend.spmv(a, &res, &mut v_k_tilde).await?;
                precond.apply(backend, &mut v_k_tilde).await?;
            } else {
                // v = P_0 ... P_{k-1} e_{k-1}
                backend.fill_zero(&mut v_k_tilde).await?;
                backend.write_range(&mut v_k_tilde, k - 1, &[cast(1.0)]).await?;
                for i in (0..k).rev() {
                    reflect(backend, &mut v_k_tilde, &reflectors[i], betas[i]).await?;
                }

                backend.spmv(a, &v_k_tilde, &mut v_k_tilde_temp).await?;
                precond.apply(backend, &mut v_k_tilde_temp).await?;
                backend.copy(&v_k_tilde_temp, &mut v_k_tilde).await?;

                // v = P_{k-1} ... P_0 v
                for i in 0..k {
                    reflect(backend, &mut v_k_tilde, &reflectors[i], betas[i]).await?;
                }
            }

            let (beta_k, rho_k_k) =
                setup_householder_vector(backend, &v_k_tilde, &mut reflectors[k], k, n).await?;
            if k > 0 && rho_k_k.abs() <= exhaustion_threshold(epsilon, r_columns[0][0]) {
                debug!("GMRES: Krylov space exhausted after {} vectors", k);
                break;
            }
            iterations += 1;
            betas[k] = beta_k;

            if k > 0 {
                let head = backend.read_range(&v_k_tilde, 0, k).await?;
                for (dst, v) in r_columns[k].iter_mut().zip(head) {
                    *dst = v.as_f64();
                }
            }
            r_columns[k][k] = rho_k_k;

            // r = P_k r; |r[k]| cannot exceed rho except by rounding.
            reflect(backend, &mut res, &reflectors[k], beta_k).await?;
            let res_k = read_entry(backend, &res, k).await?;
            let clamped = if rho.is_finite() {
                res_k.clamp(-rho, rho)
            } else {
                res_k
            };
            if clamped != res_k {
                backend.write_range(&mut res, k, &[cast(clamped)]).await?;
            }
            projection_rhs[k] = clamped;

            // The least-squares residual is what P_k left below entry k.
            let tail = n - k - 1;
            rho = if tail == 0 {
                0.0
            } else {
                backend.fill_zero(&mut v_k_tilde_temp).await?;
                backend
                    .copy_range(&res, k + 1, &mut v_k_tilde_temp, k + 1, tail)
                    .await?;
                backend.norm_2(&v_k_tilde_temp).await?.as_f64()
            };

            k += 1;
            let estimate = (rho * rho_0 / norm_rhs).abs();
            debug!("GMRES iteration {}: residual estimate {:.6e}", iterations, estimate);
            if estimate < tag.tolerance() {
                break;
            }
        }

        // Triangular solve; R is stored by columns.
        for i in (0..k).rev() {
            for j in i + 1..k {
                projection_rhs[i] -= r_columns[j][i] * projection_rhs[j];
            }
            projection_rhs[i] /= r_columns[i][i];
        }
        if projection_rhs[..k].iter().any(|v| !v.is_finite()) {
            warn!("GMRES breakdown in restart {}: singular triangular system", restart);
            termination = Termination::Breakdown;
            break;
        }

        // z = P_0 ... P_{k-1} (eta_0 r + sum_i eta_{i+1} e_i)
        backend.scale(cast(projection_rhs[0]), &mut res).await?;
        if k > 1 {
            let mut head: Vec<f64> = backend
                .read_range(&res, 0, k - 1)
                .await?
                .iter()
                .map(|v| v.as_f64())
                .collect();
            for (i, h) in head.iter_mut().enumerate() {
                *h += projection_rhs[i + 1];
            }
            let head: Vec<B::Scalar> = head.into_iter().map(cast).collect();
            backend.write_range(&mut res, 0, &head).await?;
        }
        for i in (0..k).rev() {
            reflect(backend, &mut res, &reflectors[i], betas[i]).await?;
        }

        backend.scale(cast(rho_0), &mut res).await?;
        backend.axpy(cast(1.0), &res, &mut result).await?;

        relative_error = (rho * rho_0 / norm_rhs).abs();
        debug!(
            "GMRES restart {}: residual estimate {:.6e}",
            restart, relative_error
        );
        if relative_error < tag.tolerance() {
            termination = Termination::Converged;
            break;
        }
    }

    Ok(SolveResult {
        x: download(backend, &result, n).await?,
        outcome: SolverOutcome {
            iterations,
            relative_error,
            termination,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preconditioner::JacobiPreconditioner;
    use krylov_core::{CsrMatrix, HostBackend, LaunchConfig, SparseMatrix};
    use pollster::block_on;

    fn backend() -> HostBackend<f64> {
        HostBackend::with_config(LaunchConfig::new(4, 4).unwrap()).unwrap()
    }

    #[test]
    fn back_substitution_reads_columns() {
        // R = [[2, 1], [0, 4]] stored column-major with stride 2.
        let r = [2.0, 0.0, 1.0, 4.0];
        assert_eq!(back_substitute(&r, 2, &[5.0, 8.0]), vec![1.5, 2.0]);
    }

    #[test]
    fn usable_dimension_stops_at_vanishing_diagonal() {
        let r = [1.0, 0.0, 0.5, 1e-20];
        assert_eq!(usable_dimension(&r, 2, f64::EPSILON), 1);
        let r = [1.0, 0.0, 0.5, 0.25];
        assert_eq!(usable_dimension(&r, 2, f64::EPSILON), 2);
    }

    #[test]
    fn identity_converges_in_one_step_for_both_variants() {
        let a: SparseMatrix<f64> = CsrMatrix::identity(4).into();
        let b = [1.0, -2.0, 3.0, 0.5];
        for variant in [GmresVariant::Householder, GmresVariant::Pipelined] {
            let tag = GmresTag::default().with_variant(variant);
            let solved = block_on(tag.solve(&backend(), &a, &b)).unwrap();
            assert!(solved.outcome.converged(), "{:?}: {:?}", variant, solved.outcome);
            assert_eq!(solved.outcome.iterations, 1, "{:?}", variant);
            for (x, e) in solved.x.iter().zip(b) {
                assert!((x - e).abs() < 1e-12, "{:?}: {:?}", variant, solved.x);
            }
        }
    }

    #[test]
    fn zero_krylov_dimension_is_rejected() {
        let a: SparseMatrix<f64> = CsrMatrix::identity(2).into();
        let tag = GmresTag::default().with_krylov_dim(0);
        assert!(block_on(tag.solve(&backend(), &a, &[1.0, 1.0])).is_err());
    }

    #[test]
    fn preconditioned_householder_solves_badly_scaled_system() {
        let a: SparseMatrix<f64> = CsrMatrix::from_dense(&[
            vec![1000.0, 1.0, 0.0],
            vec![2.0, 1.0, 0.1],
            vec![0.0, 3.0, 0.01],
        ])
        .unwrap()
        .into();
        let x_true = [1.0, 2.0, 3.0];
        let b = [1002.0, 4.3, 6.03];
        let backend = backend();
        let precond = JacobiPreconditioner::from_matrix(&backend, &a).unwrap();
        let solved =
            block_on(GmresTag::default().solve_preconditioned(&backend, &a, &b, &precond)).unwrap();
        assert!(solved.outcome.converged(), "{:?}", solved.outcome);
        for (x, e) in solved.x.iter().zip(x_true) {
            assert!((x - e).abs() < 1e-6, "{:?}", solved.x);
        }
    }
}
