use krylov_core::{Backend, ChunkLayout, InnerProductBuffer, KrylovError, Scalar};
use log::{debug, info, warn};

use super::cg::log_outcome;
use super::{
    cast, download, host_norm_squared, reduce_chunks, BiCgStabTag, SolveAlgorithm, SolveResult,
    SolverOutcome, Termination,
};
use crate::preconditioner::Preconditioner;

impl<B: Backend> SolveAlgorithm<B> for BiCgStabTag {
    async fn solve_preconditioned<P: Preconditioner<B>>(
        &self,
        backend: &B,
        a: &B::Matrix,
        b: &[B::Scalar],
        precond: &P,
    ) -> Result<SolveResult<B::Scalar>, KrylovError> {
        <BiCgStabTag as SolveAlgorithm<B>>::validate_inputs(self, a, b)?;
        if host_norm_squared(b) == 0.0 {
            info!("BiCGStab: zero right-hand side, returning zero solution");
            return Ok(SolveResult::zero(b.len()));
        }
        info!(
            "BiCGStab: n = {}, tolerance = {:e}, max iterations = {}, placement = {:?}",
            b.len(),
            self.tolerance(),
            self.max_iterations(),
            backend.placement()
        );
        let result = if precond.is_identity() {
            pipelined_bicgstab(backend, a, b, self).await?
        } else {
            preconditioned_bicgstab(backend, a, b, self, precond).await?
        };
        log_outcome("BiCGStab", &result.outcome);
        Ok(result)
    }
}

/// Pipelined BiCGStab with `r0star = b`.
///
/// One iteration issues two fused products and two fused updates; all six
/// inner products are read back together after the second product.
async fn pipelined_bicgstab<B: Backend>(
    backend: &B,
    a: &B::Matrix,
    b: &[B::Scalar],
    tag: &BiCgStabTag,
) -> Result<SolveResult<B::Scalar>, KrylovError> {
    let n = b.len();
    let chunk = backend.launch_config().chunk_size();
    let norm_rhs_squared = host_norm_squared(b);

    let mut result = backend.zeros("bicgstab_result", n)?;
    let mut residual = backend.from_slice("bicgstab_residual", b)?;
    let mut p = backend.from_slice("bicgstab_p", b)?;
    let r0star = backend.from_slice("bicgstab_r0star", b)?;
    let mut ap = backend.zeros("bicgstab_Ap", n)?;
    let mut s = backend.zeros("bicgstab_s", n)?;
    let mut as_vec = backend.zeros("bicgstab_As", n)?;
    let mut buffer = InnerProductBuffer::new(
        backend.zeros(
            "bicgstab_inner_prod_buffer",
            ChunkLayout::BICGSTAB_CHUNKS * chunk,
        )?,
        chunk,
        ChunkLayout::BICGSTAB_CHUNKS,
    )?;
    // <r, r0star> = <b, b> before the first iteration.
    backend
        .write_range(&mut buffer.data, 0, &[cast(norm_rhs_squared)])
        .await?;

    let ap_r0_offset = buffer.chunk_offset(ChunkLayout::AP_R0);
    let as_r0_offset = buffer.chunk_offset(ChunkLayout::AS_R0);
    let s_offset = buffer.chunk_offset(ChunkLayout::S_S);

    let mut relative_error = 1.0;
    let mut iterations = 0;
    let mut termination = Termination::MaxIterations;

    for i in 0..tag.max_iterations() {
        backend
            .prod_with_r0(a, &p, &mut ap, &r0star, &mut buffer, ap_r0_offset)
            .await?;
        backend
            .bicgstab_update_s(&mut s, &residual, &ap, &mut buffer, s_offset)
            .await?;
        backend
            .prod_with_r0(a, &s, &mut as_vec, &r0star, &mut buffer, as_r0_offset)
            .await?;

        let sums = reduce_chunks(backend, &buffer, ChunkLayout::BICGSTAB_CHUNKS).await?;
        let r_r0 = sums[ChunkLayout::RESIDUAL];
        let as_as = sums[ChunkLayout::AP_AP];
        let s_as = sums[ChunkLayout::P_AP];
        let ap_r0 = sums[ChunkLayout::AP_R0];
        let as_r0 = sums[ChunkLayout::AS_R0];
        let s_s = sums[ChunkLayout::S_S];

        let alpha = r_r0 / ap_r0;
        if !alpha.is_finite() {
            warn!(
                "BiCGStab breakdown at iteration {}: <Ap,r0star> = {}",
                i, ap_r0
            );
            termination = Termination::Breakdown;
            break;
        }
        iterations += 1;

        // s itself may already be small enough; finish with the half step.
        let s_error = (s_s.abs() / norm_rhs_squared).sqrt();
        if s_error < tag.tolerance() {
            backend.axpy(cast(alpha), &p, &mut result).await?;
            relative_error = s_error;
            termination = Termination::Converged;
            break;
        }

        let omega = s_as / as_as;
        let beta = -as_r0 / ap_r0;
        if !omega.is_finite() || !beta.is_finite() {
            warn!(
                "BiCGStab breakdown at iteration {}: omega = {}, beta = {}",
                i, omega, beta
            );
            relative_error = s_error;
            termination = Termination::Breakdown;
            break;
        }

        backend
            .bicgstab_vector_update(
                &mut result,
                cast(alpha),
                &mut p,
                cast(omega),
                &s,
                &mut residual,
                &as_vec,
                cast(beta),
                &ap,
                &r0star,
                &mut buffer,
            )
            .await?;

        // ||s - omega As||^2 expanded in the reductions at hand.
        let r_r = s_s - 2.0 * omega * s_as + omega * omega * as_as;
        relative_error = (r_r.abs() / norm_rhs_squared).sqrt();
        debug!(
            "BiCGStab iteration {}: residual estimate {:.6e}",
            i, relative_error
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

/// Right-preconditioned BiCGStab with separate reductions.
async fn preconditioned_bicgstab<B: Backend, P: Preconditioner<B>>(
    backend: &B,
    a: &B::Matrix,
    b: &[B::Scalar],
    tag: &BiCgStabTag,
    precond: &P,
) -> Result<SolveResult<B::Scalar>, KrylovError> {
    let n = b.len();
    let norm_rhs = host_norm_squared(b).sqrt();

    let mut x = backend.zeros("pbicgstab_x", n)?;
    let mut r = backend.from_slice("pbicgstab_r", b)?;
    let r_hat_0 = backend.from_slice("pbicgstab_r_hat_0", b)?;
    let mut p = backend.zeros("pbicgstab_p", n)?;
    let mut v = backend.zeros("pbicgstab_v", n)?;
    let mut s = backend.zeros("pbicgstab_s", n)?;
    let mut t = backend.zeros("pbicgstab_t", n)?;
    let mut phat = backend.zeros("pbicgstab_phat", n)?;
    let mut shat = backend.zeros("pbicgstab_shat", n)?;

    let mut rho_prev = 1.0;
    let mut alpha = 1.0;
    let mut omega = 1.0;
    let mut relative_error = 1.0;
    let mut iterations = 0;
    let mut termination = Termination::MaxIterations;

    for i in 0..tag.max_iterations() {
        let rho = backend.inner_prod(&r_hat_0, &r).await?.as_f64();

        if i == 0 {
            backend.copy(&r, &mut p).await?;
        } else {
            let beta = (rho / rho_prev) * (alpha / omega);
            if !beta.is_finite() {
                warn!("BiCGStab breakdown at iteration {}: beta = {}", i, beta);
                termination = Termination::Breakdown;
                break;
            }
            // p = r + beta * (p - omega * v)
            backend.axpy(cast(-omega), &v, &mut p).await?;
            backend.scale(cast(beta), &mut p).await?;
            backend.axpy(cast(1.0), &r, &mut p).await?;
        }

        backend.copy(&p, &mut phat).await?;
        precond.apply(backend, &mut phat).await?;
        backend.spmv(a, &phat, &mut v).await?;

        alpha = rho / backend.inner_prod(&r_hat_0, &v).await?.as_f64();
        if !alpha.is_finite() {
            warn!("BiCGStab breakdown at iteration {}: alpha = {}", i, alpha);
            termination = Termination::Breakdown;
            break;
        }
        iterations += 1;

        // s = r - alpha * v
        backend.copy(&r, &mut s).await?;
        backend.axpy(cast(-alpha), &v, &mut s).await?;

        let s_error = backend.norm_2(&s).await?.as_f64() / norm_rhs;
        if s_error < tag.tolerance() {
            backend.axpy(cast(alpha), &phat, &mut x).await?;
            relative_error = s_error;
            termination = Termination::Converged;
            break;
        }

        backend.copy(&s, &mut shat).await?;
        precond.apply(backend, &mut shat).await?;
        backend.spmv(a, &shat, &mut t).await?;

        omega = backend.inner_prod(&t, &s).await?.as_f64()
            / backend.inner_prod(&t, &t).await?.as_f64();
        if !omega.is_finite() {
            warn!("BiCGStab breakdown at iteration {}: omega = {}", i, omega);
            relative_error = s_error;
            termination = Termination::Breakdown;
            break;
        }

        backend.axpy(cast(alpha), &phat, &mut x).await?;
        backend.axpy(cast(omega), &shat, &mut x).await?;

        // r = s - omega * t
        backend.copy(&s, &mut r).await?;
        backend.axpy(cast(-omega), &t, &mut r).await?;

        relative_error = backend.norm_2(&r).await?.as_f64() / norm_rhs;
        debug!(
            "Preconditioned BiCGStab iteration {}: relative residual {:.6e}",
            i, relative_error
        );
        if relative_error < tag.tolerance() {
            termination = Termination::Converged;
            break;
        }
        rho_prev = rho;
    }

    Ok(SolveResult {
        x: download(backend, &x, n).await?,
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

    fn lower_triangular() -> SparseMatrix<f64> {
        CsrMatrix::from_dense(&[
            vec![1.0, 0.0, 0.0],
            vec![-237.0, 1.0, 0.0],
            vec![0.0, -2.5, 1.0],
        ])
        .unwrap()
        .into()
    }

    #[test]
    fn solves_nonsymmetric_system() {
        let b = [1.0, 0.0, 0.0];
        let tag = BiCgStabTag::default().with_tolerance(1e-12);
        let solved = block_on(tag.solve(&backend(), &lower_triangular(), &b)).unwrap();
        assert!(solved.outcome.converged(), "{:?}", solved.outcome);
        let expected = [1.0, 237.0, 592.5];
        for (x, e) in solved.x.iter().zip(expected) {
            assert!((x - e).abs() < 1e-5 * e, "{:?}", solved.x);
        }
    }

    #[test]
    fn preconditioned_path_agrees() {
        let a = lower_triangular();
        let backend = backend();
        let precond = JacobiPreconditioner::from_matrix(&backend, &a).unwrap();
        let b = [1.0, 0.0, 0.0];
        let tag = BiCgStabTag::default().with_tolerance(1e-12);
        let solved = block_on(tag.solve_preconditioned(&backend, &a, &b, &precond)).unwrap();
        assert!(solved.outcome.converged(), "{:?}", solved.outcome);
        assert!((solved.x[2] - 592.5).abs() < 1e-3);
    }

    #[test]
    fn vanishing_shadow_product_is_a_breakdown() {
        // <A b, b> = 0 for this rotation, so the first alpha is infinite.
        let a: SparseMatrix<f64> = CsrMatrix::from_dense(&[vec![0.0, -1.0], vec![1.0, 0.0]])
            .unwrap()
            .into();
        let solved = block_on(BiCgStabTag::default().solve(&backend(), &a, &[1.0, 0.0])).unwrap();
        assert_eq!(solved.outcome.termination, Termination::Breakdown);
        assert_eq!(solved.outcome.iterations, 0);
    }
}
