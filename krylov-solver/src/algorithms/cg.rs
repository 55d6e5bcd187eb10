use krylov_core::{Backend, ChunkLayout, InnerProductBuffer, KrylovError, Scalar};
use log::{debug, info, warn};

use super::{
    cast, download, host_norm_squared, reduce_chunks, CgTag, SolveAlgorithm, SolveResult,
    SolverOutcome, Termination,
};
use crate::preconditioner::Preconditioner;

impl<B: Backend> SolveAlgorithm<B> for CgTag {
    async fn solve_preconditioned<P: Preconditioner<B>>(
        &self,
        backend: &B,
        a: &B::Matrix,
        b: &[B::Scalar],
        precond: &P,
    ) -> Result<SolveResult<B::Scalar>, KrylovError> {
        <CgTag as SolveAlgorithm<B>>::validate_inputs(self, a, b)?;
        if host_norm_squared(b) == 0.0 {
            info!("CG: zero right-hand side, returning zero solution");
            return Ok(SolveResult::zero(b.len()));
        }
        info!(
            "CG: n = {}, tolerance = {:e}, max iterations = {}, placement = {:?}",
            b.len(),
            self.tolerance(),
            self.max_iterations(),
            backend.placement()
        );
        let result = if precond.is_identity() {
            pipelined_cg(backend, a, b, self).await?
        } else {
            preconditioned_cg(backend, a, b, self, precond).await?
        };
        log_outcome("CG", &result.outcome);
        Ok(result)
    }
}

pub(crate) fn log_outcome(name: &str, outcome: &SolverOutcome) {
    match outcome.termination {
        Termination::Converged => info!(
            "{} converged in {} iterations (relative error {:.3e})",
            name, outcome.iterations, outcome.relative_error
        ),
        Termination::MaxIterations => warn!(
            "{} reached maximum iterations ({}) without converging. Relative error: {:.3e}",
            name, outcome.iterations, outcome.relative_error
        ),
        Termination::Breakdown => warn!(
            "{} broke down after {} iterations (relative error {:.3e})",
            name, outcome.iterations, outcome.relative_error
        ),
    }
}

/// Pipelined CG: `<r,r>` for the next step comes out of the vector update
/// and `<Ap,Ap>`, `<p,Ap>` out of the product, so each iteration needs a
/// single read-back of the inner-product buffer.
async fn pipelined_cg<B: Backend>(
    backend: &B,
    a: &B::Matrix,
    b: &[B::Scalar],
    tag: &CgTag,
) -> Result<SolveResult<B::Scalar>, KrylovError> {
    let n = b.len();
    let chunk = backend.launch_config().chunk_size();
    let norm_rhs_squared = host_norm_squared(b);
    let tol_squared = tag.tolerance() * tag.tolerance();

    let mut result = backend.zeros("cg_result", n)?;
    let mut r = backend.from_slice("cg_residual", b)?;
    let mut p = backend.from_slice("cg_p", b)?;
    let mut ap = backend.zeros("cg_Ap", n)?;
    let mut buffer = InnerProductBuffer::new(
        backend.zeros("cg_inner_prod_buffer", ChunkLayout::CG_CHUNKS * chunk)?,
        chunk,
        ChunkLayout::CG_CHUNKS,
    )?;
    // The first <r,r> is known on the host; park it in slot 0 of its chunk.
    backend
        .write_range(&mut buffer.data, 0, &[cast(norm_rhs_squared)])
        .await?;

    let mut rr = norm_rhs_squared;
    let mut iterations = 0;
    let mut termination = Termination::MaxIterations;

    for i in 0..tag.max_iterations() {
        backend.prod(a, &p, &mut ap, &mut buffer).await?;
        let sums = reduce_chunks(backend, &buffer, ChunkLayout::CG_CHUNKS).await?;
        rr = sums[ChunkLayout::RESIDUAL];
        let ap_ap = sums[ChunkLayout::AP_AP];
        let p_ap = sums[ChunkLayout::P_AP];
        debug!(
            "CG iteration {}: residual estimate {:.6e}",
            i,
            (rr.abs() / norm_rhs_squared).sqrt()
        );

        if (rr / norm_rhs_squared).abs() < tol_squared {
            termination = Termination::Converged;
            break;
        }

        let alpha = rr / p_ap;
        let beta = (alpha * alpha * ap_ap - rr) / rr;
        if !alpha.is_finite() || !beta.is_finite() {
            warn!(
                "CG breakdown at iteration {}: alpha = {}, beta = {}",
                i, alpha, beta
            );
            termination = Termination::Breakdown;
            break;
        }

        backend
            .cg_vector_update(
                &mut result,
                cast(alpha),
                &mut p,
                &mut r,
                &ap,
                cast(beta),
                &mut buffer,
            )
            .await?;
        iterations += 1;
    }

    if termination == Termination::MaxIterations {
        // The last update already reduced the final <r,r> into chunk 0.
        rr = reduce_chunks(backend, &buffer, 1).await?[ChunkLayout::RESIDUAL];
        if (rr / norm_rhs_squared).abs() < tol_squared {
            termination = Termination::Converged;
        }
    }

    Ok(SolveResult {
        x: download(backend, &result, n).await?,
        outcome: SolverOutcome {
            iterations,
            relative_error: (rr.abs() / norm_rhs_squared).sqrt(),
            termination,
        },
    })
}

/// Classical preconditioned CG.
async fn preconditioned_cg<B: Backend, P: Preconditioner<B>>(
    backend: &B,
    a: &B::Matrix,
    b: &[B::Scalar],
    tag: &CgTag,
    precond: &P,
) -> Result<SolveResult<B::Scalar>, KrylovError> {
    let n = b.len();
    let norm_rhs = host_norm_squared(b).sqrt();

    let mut result = backend.zeros("pcg_result", n)?;
    let mut r = backend.from_slice("pcg_residual", b)?;
    let mut z = backend.from_slice("pcg_z", b)?;
    precond.apply(backend, &mut z).await?;
    let mut p = backend.zeros("pcg_p", n)?;
    backend.copy(&z, &mut p).await?;
    let mut ap = backend.zeros("pcg_Ap", n)?;

    let mut rz = backend.inner_prod(&r, &z).await?.as_f64();
    let mut relative_error = 1.0;
    let mut iterations = 0;
    let mut termination = Termination::MaxIterations;

    for i in 0..tag.max_iterations() {
        backend.spmv(a, &p, &mut ap).await?;
        let p_ap = backend.inner_prod(&p, &ap).await?.as_f64();
        let alpha = rz / p_ap;
        if !alpha.is_finite() {
            warn!("PCG breakdown at iteration {}: alpha = {}", i, alpha);
            termination = Termination::Breakdown;
            break;
        }

        backend.axpy(cast(alpha), &p, &mut result).await?;
        backend.axpy(cast(-alpha), &ap, &mut r).await?;
        iterations += 1;

        relative_error = backend.norm_2(&r).await?.as_f64() / norm_rhs;
        debug!("PCG iteration {}: relative residual {:.6e}", i, relative_error);
        if relative_error < tag.tolerance() {
            termination = Termination::Converged;
            break;
        }

        backend.copy(&r, &mut z).await?;
        precond.apply(backend, &mut z).await?;
        let rz_next = backend.inner_prod(&r, &z).await?.as_f64();
        let beta = rz_next / rz;
        if !beta.is_finite() {
            warn!("PCG breakdown at iteration {}: beta = {}", i, beta);
            termination = Termination::Breakdown;
            break;
        }
        // p = z + beta p
        backend.scale(cast(beta), &mut p).await?;
        backend.axpy(cast(1.0), &z, &mut p).await?;
        rz = rz_next;
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
    use krylov_core::{CsrMatrix, HostBackend, LaunchConfig, SparseFormat, SparseMatrix};
    use pollster::block_on;

    fn backend() -> HostBackend<f64> {
        HostBackend::with_config(LaunchConfig::new(4, 4).unwrap()).unwrap()
    }

    #[test]
    fn identity_system_takes_one_iteration() {
        let a: SparseMatrix<f64> = CsrMatrix::identity(4).into();
        let b = [1.0, 2.0, 3.0, 4.0];
        let tag = CgTag::default().with_tolerance(1e-10);
        let solved = block_on(tag.solve(&backend(), &a, &b)).unwrap();
        assert_eq!(solved.x, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(solved.outcome.iterations, 1);
        assert!(solved.outcome.converged());
        assert_eq!(solved.outcome.relative_error, 0.0);
    }

    #[test]
    fn exhausted_budget_reports_max_iterations() {
        let dense: Vec<Vec<f64>> = (0..30)
            .map(|i| {
                (0..30)
                    .map(|j| match i as i64 - j as i64 {
                        0 => 2.0,
                        1 | -1 => -1.0,
                        _ => 0.0,
                    })
                    .collect()
            })
            .collect();
        let a: SparseMatrix<f64> = CsrMatrix::from_dense(&dense).unwrap().into();
        let b = vec![1.0; 30];
        let tag = CgTag::with_params(1e-12, 3);
        let solved = block_on(tag.solve(&backend(), &a, &b)).unwrap();
        assert_eq!(solved.outcome.iterations, 3);
        assert_eq!(solved.outcome.termination, Termination::MaxIterations);
        assert!(solved.outcome.relative_error > 1e-12);
    }

    #[test]
    fn jacobi_path_solves_scaled_diagonal_system() {
        let a: SparseMatrix<f64> = CsrMatrix::from_dense(&[
            vec![10.0, 1.0, 0.0],
            vec![1.0, 20.0, 1.0],
            vec![0.0, 1.0, 30.0],
        ])
        .unwrap()
        .into();
        let b = [11.0, 22.0, 31.0];
        let backend = backend();
        let precond = JacobiPreconditioner::from_matrix(&backend, &a).unwrap();
        let solved =
            block_on(CgTag::default().solve_preconditioned(&backend, &a, &b, &precond)).unwrap();
        assert!(solved.outcome.converged());
        for v in &solved.x {
            assert!((v - 1.0).abs() < 1e-7, "{:?}", solved.x);
        }
    }

    #[test]
    fn rejects_mismatched_rhs() {
        let a: SparseMatrix<f64> =
            SparseMatrix::from_csr(CsrMatrix::identity(3), SparseFormat::Ell).unwrap();
        let err = block_on(CgTag::default().solve(&backend(), &a, &[1.0, 2.0])).unwrap_err();
        assert!(matches!(err, KrylovError::InvalidDimensions(_)));
    }
}
