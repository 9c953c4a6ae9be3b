//! CMA-ES over bounded gait genomes.
//!
//! Canonical full-covariance CMA-ES (Hansen's purecma.py), maximizing.
//! Genes live in `[0, 1]`: samples are clamped to that box before evaluation
//! and the clamped points are what the distribution learns from.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;

const LOWER: f64 = 0.0;
const UPPER: f64 = 1.0;

/// Standard normal sample via Box-Muller.
fn randn(rng: &mut ChaCha12Rng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-12);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn identity(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| {
            let mut row = vec![0.0; n];
            row[i] = 1.0;
            row
        })
        .collect()
}

/// Cyclic Jacobi eigendecomposition of a symmetric matrix.
/// Returns eigenvalues and the eigenvectors as columns.
fn symmetric_eigen(a: &[Vec<f64>]) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = a.len();
    let mut m = a.to_vec();
    let mut v = identity(n);

    for _sweep in 0..64 {
        let off: f64 = (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .map(|(i, j)| m[i][j] * m[i][j])
            .sum();
        if off < 1e-24 {
            break;
        }

        for p in 0..n {
            for q in p + 1..n {
                let apq = m[p][q];
                if apq.abs() < 1e-300 {
                    continue;
                }
                let tau = (m[q][q] - m[p][p]) / (2.0 * apq);
                let t = tau.signum() / (tau.abs() + (1.0 + tau * tau).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = t * c;

                for row in m.iter_mut() {
                    let (kp, kq) = (row[p], row[q]);
                    row[p] = c * kp - s * kq;
                    row[q] = s * kp + c * kq;
                }
                for k in 0..n {
                    let (pk, qk) = (m[p][k], m[q][k]);
                    m[p][k] = c * pk - s * qk;
                    m[q][k] = s * pk + c * qk;
                }
                for row in v.iter_mut() {
                    let (kp, kq) = (row[p], row[q]);
                    row[p] = c * kp - s * kq;
                    row[q] = s * kp + c * kq;
                }
            }
        }
    }

    let eigenvalues = (0..n).map(|i| m[i][i].max(1e-20)).collect();
    (eigenvalues, v)
}

pub struct CmaEs {
    pub n: usize,
    pub sigma: f64,
    pub mean: Vec<f64>,
    pub pop_size: usize,
    pub generation: usize,

    c: Vec<Vec<f64>>,
    /// Eigensystem of `c` as of the last `ask`. Columns are eigenvectors.
    eigenvalues: Vec<f64>,
    eigenvectors: Vec<Vec<f64>>,
    ps: Vec<f64>,
    pc: Vec<f64>,

    mu: usize,
    weights: Vec<f64>,
    mu_eff: f64,
    cs: f64,
    ds: f64,
    cc: f64,
    c1: f64,
    cmu: f64,
    chi_n: f64,
    rng: ChaCha12Rng,
    best: Option<(Vec<f64>, f64)>,
}

impl CmaEs {
    /// Search over `[0, 1]^n`, starting from the center of the box.
    pub fn new(n: usize, sigma0: f64, pop_size: Option<usize>, seed: u64) -> Self {
        let nf = n as f64;
        let lam = pop_size.unwrap_or(4 + (3.0 * nf.ln()) as usize).max(2);
        let mu = lam / 2;

        let raw: Vec<f64> = (0..mu)
            .map(|i| (mu as f64 + 0.5).ln() - ((i + 1) as f64).ln())
            .collect();
        let total: f64 = raw.iter().sum();
        let weights: Vec<f64> = raw.iter().map(|w| w / total).collect();
        let mu_eff = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();

        let cs = (mu_eff + 2.0) / (nf + mu_eff + 5.0);
        let ds = 2.0 * mu_eff / lam as f64 + 0.3 + cs;
        let cc = (4.0 + mu_eff / nf) / (nf + 4.0 + 2.0 * mu_eff / nf);
        let c1 = 2.0 / ((nf + 1.3).powi(2) + mu_eff);
        let cmu = (2.0 * (mu_eff - 2.0 + 1.0 / mu_eff) / ((nf + 2.0).powi(2) + mu_eff))
            .min(1.0 - c1);
        let chi_n = nf.sqrt() * (1.0 - 1.0 / (4.0 * nf) + 1.0 / (21.0 * nf * nf));

        CmaEs {
            n,
            sigma: sigma0,
            mean: vec![(LOWER + UPPER) / 2.0; n],
            pop_size: lam,
            generation: 0,
            c: identity(n),
            eigenvalues: vec![1.0; n],
            eigenvectors: identity(n),
            ps: vec![0.0; n],
            pc: vec![0.0; n],
            mu,
            weights,
            mu_eff,
            cs,
            ds,
            cc,
            c1,
            cmu,
            chi_n,
            rng: ChaCha12Rng::seed_from_u64(seed),
            best: None,
        }
    }

    /// Sample a population, clamped to bounds.
    pub fn ask(&mut self) -> Vec<Vec<f64>> {
        let (eigenvalues, eigenvectors) = symmetric_eigen(&self.c);
        self.eigenvalues = eigenvalues;
        self.eigenvectors = eigenvectors;

        let n = self.n;
        (0..self.pop_size)
            .map(|_| {
                let z: Vec<f64> = (0..n).map(|_| randn(&mut self.rng)).collect();
                // y = B · sqrt(D) · z
                (0..n)
                    .map(|i| {
                        let y: f64 = (0..n)
                            .map(|j| self.eigenvectors[i][j] * self.eigenvalues[j].sqrt() * z[j])
                            .sum();
                        (self.mean[i] + self.sigma * y).clamp(LOWER, UPPER)
                    })
                    .collect()
            })
            .collect()
    }

    /// C^(-1/2) · v through the cached eigensystem.
    fn c_invsqrt_mul(&self, v: &[f64]) -> Vec<f64> {
        let n = self.n;
        let z: Vec<f64> = (0..n)
            .map(|j| {
                let proj: f64 = (0..n).map(|i| self.eigenvectors[i][j] * v[i]).sum();
                proj / self.eigenvalues[j].sqrt()
            })
            .collect();
        (0..n)
            .map(|i| (0..n).map(|j| self.eigenvectors[i][j] * z[j]).sum())
            .collect()
    }

    /// Update the distribution. Higher fitness is better.
    pub fn tell(&mut self, candidates: &[Vec<f64>], fitnesses: &[f64]) {
        assert_eq!(candidates.len(), self.pop_size);
        assert_eq!(fitnesses.len(), self.pop_size);
        let n = self.n;
        let nf = n as f64;

        let mut order: Vec<usize> = (0..self.pop_size).collect();
        order.sort_by(|&a, &b| fitnesses[b].total_cmp(&fitnesses[a]));

        let top = order[0];
        if self.best.as_ref().map_or(true, |(_, f)| fitnesses[top] > *f) {
            self.best = Some((candidates[top].clone(), fitnesses[top]));
        }

        let old_mean = self.mean.clone();
        for i in 0..n {
            self.mean[i] = (0..self.mu)
                .map(|k| self.weights[k] * candidates[order[k]][i])
                .sum();
        }
        // Mean shift in units of sigma.
        let y_w: Vec<f64> = (0..n).map(|i| (self.mean[i] - old_mean[i]) / self.sigma).collect();

        let z = self.c_invsqrt_mul(&y_w);
        let csn = (self.cs * (2.0 - self.cs) * self.mu_eff).sqrt();
        for i in 0..n {
            self.ps[i] = (1.0 - self.cs) * self.ps[i] + csn * z[i];
        }

        let ps_norm_sq: f64 = self.ps.iter().map(|p| p * p).sum();
        let decay = 1.0 - (1.0 - self.cs).powi(2 * (self.generation as i32 + 1));
        let hsig = if ps_norm_sq / nf / decay < 2.0 + 4.0 / (nf + 1.0) { 1.0 } else { 0.0 };

        let ccn = (self.cc * (2.0 - self.cc) * self.mu_eff).sqrt();
        for i in 0..n {
            self.pc[i] = (1.0 - self.cc) * self.pc[i] + hsig * ccn * y_w[i];
        }

        let steps: Vec<Vec<f64>> = (0..self.mu)
            .map(|k| {
                let x = &candidates[order[k]];
                (0..n).map(|i| (x[i] - old_mean[i]) / self.sigma).collect()
            })
            .collect();

        let c1a = self.c1 * (1.0 - (1.0 - hsig * hsig) * self.cc * (2.0 - self.cc));
        let keep = 1.0 - c1a - self.cmu;
        for i in 0..n {
            for j in 0..=i {
                let rank_mu: f64 = (0..self.mu)
                    .map(|k| self.weights[k] * steps[k][i] * steps[k][j])
                    .sum();
                let rank_one = self.c1 * self.pc[i] * self.pc[j];
                let cij = keep * self.c[i][j] + rank_one + self.cmu * rank_mu;
                self.c[i][j] = cij;
                self.c[j][i] = cij;
            }
        }

        let ps_norm = ps_norm_sq.sqrt();
        self.sigma *= ((self.cs / self.ds) * (ps_norm / self.chi_n - 1.0)).min(1.0).exp();
        self.sigma = self.sigma.clamp(1e-20, 1e10);
        self.generation += 1;
    }

    /// Best candidate seen by `tell` so far.
    pub fn best(&self) -> Option<(&[f64], f64)> {
        self.best.as_ref().map(|(x, f)| (x.as_slice(), *f))
    }
}
