//! Fairness Rebate via Entropic Optimal Transport
//!
//! Moves the token mass held by recent levy payers (donors) onto buyers below
//! the poverty line (recipients). The transport plan couples donor mass with a
//! uniform recipient distribution under an income-distance cost:
//!
//! 1. Incomes are rescaled by the largest income into [0, 1]
//! 2. `C[i][j] = |donor_i - recipient_j|`
//! 3. Marginals: normalized donor tokens, uniform over recipients
//! 4. Log-domain Sinkhorn iterations, capped at `max_iter`
//! 5. Column sums of the plan, times the original mass, are the credits
//!
//! Every iteration ends on the recipient update, so the recipient marginal is
//! matched exactly and the credits always sum to the donor mass.

use tracing::{debug, warn};

use crate::config::RebateParams;
use crate::error::RebateError;

/// Below this total mass nothing is redistributed.
pub const MASS_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SinkhornReport {
    pub iterations: usize,
    /// L1 distance between the plan's donor marginal and the target.
    pub marginal_error: f64,
    pub converged: bool,
}

impl SinkhornReport {
    fn skipped() -> Self {
        Self {
            iterations: 0,
            marginal_error: 0.0,
            converged: true,
        }
    }
}

/// Credit per recipient, in the order of `recipient_income`.
pub fn rebate(
    donor_income: &[f64],
    donor_tokens: &[f64],
    recipient_income: &[f64],
    params: &RebateParams,
) -> Result<Vec<f64>, RebateError> {
    rebate_with_report(donor_income, donor_tokens, recipient_income, params)
        .map(|(credits, _)| credits)
}

pub fn rebate_with_report(
    donor_income: &[f64],
    donor_tokens: &[f64],
    recipient_income: &[f64],
    params: &RebateParams,
) -> Result<(Vec<f64>, SinkhornReport), RebateError> {
    validate(donor_income, donor_tokens, recipient_income)?;

    let mass: f64 = donor_tokens.iter().sum();
    if mass < MASS_EPSILON || recipient_income.is_empty() {
        return Ok((vec![0.0; recipient_income.len()], SinkhornReport::skipped()));
    }

    let scale = donor_income
        .iter()
        .chain(recipient_income)
        .fold(0.0_f64, |acc, &x| acc.max(x));
    let scale = if scale > 0.0 { scale } else { 1.0 };

    // zero-mass donors cannot ship anything and would only add -inf potentials
    let (donors, a): (Vec<f64>, Vec<f64>) = donor_income
        .iter()
        .zip(donor_tokens)
        .filter(|(_, t)| **t > 0.0)
        .map(|(&inc, &t)| (inc / scale, t / mass))
        .unzip();
    let recipients: Vec<f64> = recipient_income.iter().map(|&r| r / scale).collect();
    let b = vec![1.0 / recipients.len() as f64; recipients.len()];

    let cost: Vec<Vec<f64>> = donors
        .iter()
        .map(|&d| recipients.iter().map(|&r| (d - r).abs()).collect())
        .collect();

    let (plan, report) = sinkhorn_log(&a, &b, &cost, params);
    if report.converged {
        debug!(
            iterations = report.iterations,
            error = report.marginal_error,
            "sinkhorn converged"
        );
    } else {
        warn!(
            iterations = report.iterations,
            error = report.marginal_error,
            "sinkhorn hit iteration cap, using best-effort plan"
        );
    }

    let credits = (0..recipients.len())
        .map(|j| plan.iter().map(|row| row[j]).sum::<f64>() * mass)
        .collect();
    Ok((credits, report))
}

fn validate(
    donor_income: &[f64],
    donor_tokens: &[f64],
    recipient_income: &[f64],
) -> Result<(), RebateError> {
    if donor_income.len() != donor_tokens.len() {
        return Err(RebateError::LengthMismatch {
            incomes: donor_income.len(),
            tokens: donor_tokens.len(),
        });
    }
    if let Some((index, &value)) = donor_tokens
        .iter()
        .enumerate()
        .find(|(_, t)| !t.is_finite() || **t < 0.0)
    {
        return Err(RebateError::InvalidMass { index, value });
    }
    if let Some((index, &value)) = donor_income
        .iter()
        .chain(recipient_income)
        .enumerate()
        .find(|(_, x)| !x.is_finite() || **x < 0.0)
    {
        return Err(RebateError::InvalidIncome { index, value });
    }
    Ok(())
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Entropic OT in the log domain. Returns the plan and how the solve went.
///
/// Potentials `f` (rows) and `g` (columns) define
/// `P[i][j] = exp((f_i + g_j - C[i][j]) / reg)`.
fn sinkhorn_log(
    a: &[f64],
    b: &[f64],
    cost: &[Vec<f64>],
    params: &RebateParams,
) -> (Vec<Vec<f64>>, SinkhornReport) {
    let (n, m) = (a.len(), b.len());
    let reg = params.reg;
    let log_a: Vec<f64> = a.iter().map(|x| x.ln()).collect();
    let log_b: Vec<f64> = b.iter().map(|x| x.ln()).collect();

    let mut f = vec![0.0; n];
    let mut g = vec![0.0; m];
    let mut row_scratch = vec![0.0; m];
    let mut col_scratch = vec![0.0; n];

    let mut report = SinkhornReport {
        iterations: 0,
        marginal_error: f64::INFINITY,
        converged: false,
    };

    for iter in 0..params.max_iter {
        for i in 0..n {
            for j in 0..m {
                row_scratch[j] = (g[j] - cost[i][j]) / reg;
            }
            f[i] = reg * (log_a[i] - log_sum_exp(&row_scratch));
        }
        for j in 0..m {
            for i in 0..n {
                col_scratch[i] = (f[i] - cost[i][j]) / reg;
            }
            g[j] = reg * (log_b[j] - log_sum_exp(&col_scratch));
        }

        let error: f64 = (0..n)
            .map(|i| {
                let row: f64 = (0..m).map(|j| ((f[i] + g[j] - cost[i][j]) / reg).exp()).sum();
                (row - a[i]).abs()
            })
            .sum();

        report.iterations = iter + 1;
        report.marginal_error = error;
        if error < params.tol {
            report.converged = true;
            break;
        }
    }

    let plan = (0..n)
        .map(|i| {
            (0..m)
                .map(|j| ((f[i] + g[j] - cost[i][j]) / reg).exp())
                .collect()
        })
        .collect();
    (plan, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RebateParams {
        RebateParams::default()
    }

    #[test]
    fn test_rebate_zero_mass() {
        let out = rebate(&[1.0, 2.0], &[0.0, 0.0], &[0.5], &params()).unwrap();
        assert_eq!(out, vec![0.0]);
    }

    #[test]
    fn test_rebate_no_recipients() {
        let out = rebate(&[1.0], &[5.0], &[], &params()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_rebate_mass_conservation() {
        let donor_inc = [1e6, 2e6, 5e6];
        let donor_tok = [10.0, 20.0, 30.0];
        let recip_inc = [1e3, 2e3, 3e3, 8e3];

        let out = rebate(&donor_inc, &donor_tok, &recip_inc, &params()).unwrap();
        assert_eq!(out.len(), 4);
        assert!((out.iter().sum::<f64>() - 60.0).abs() < 0.01);
        // uniform recipient marginal
        for credit in &out {
            assert!((credit - 15.0).abs() < 0.01);
        }
    }

    #[test]
    fn test_rebate_iteration_cap_is_best_effort() {
        let params = RebateParams {
            max_iter: 1,
            tol: 0.0,
            ..RebateParams::default()
        };
        let (out, report) = rebate_with_report(
            &[1e6, 2e6, 5e6],
            &[10.0, 20.0, 30.0],
            &[1e3, 2e3, 3e3, 8e3],
            &params,
        )
        .unwrap();
        assert!(!report.converged);
        assert_eq!(report.iterations, 1);
        assert!((out.iter().sum::<f64>() - 60.0).abs() < 0.01);
    }

    #[test]
    fn test_rebate_wide_income_range_stays_finite() {
        let params = RebateParams {
            reg: 1e-4,
            ..RebateParams::default()
        };
        let (out, report) =
            rebate_with_report(&[1e9, 1.0], &[3.0, 1.0], &[0.5, 2.0, 1e3], &params).unwrap();
        assert!(out.iter().all(|c| c.is_finite() && *c >= 0.0));
        assert!((out.iter().sum::<f64>() - 4.0).abs() < 1e-6);
        assert!(report.iterations >= 1);
    }

    #[test]
    fn test_rebate_skips_zero_mass_donors() {
        let out = rebate(&[100.0, 200.0], &[0.0, 8.0], &[10.0, 20.0], &params()).unwrap();
        assert!((out.iter().sum::<f64>() - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_rebate_rejects_length_mismatch() {
        assert_eq!(
            rebate(&[1.0, 2.0], &[1.0], &[0.5], &params()),
            Err(RebateError::LengthMismatch { incomes: 2, tokens: 1 })
        );
    }

    #[test]
    fn test_rebate_rejects_negative_mass() {
        assert_eq!(
            rebate(&[1.0, 2.0], &[1.0, -2.0], &[0.5], &params()),
            Err(RebateError::InvalidMass { index: 1, value: -2.0 })
        );
    }

    #[test]
    fn test_log_sum_exp_handles_large_values() {
        let v = log_sum_exp(&[1000.0, 1000.0]);
        assert!((v - (1000.0 + 2f64.ln())).abs() < 1e-9);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }
}
