//! Sampling schedules
//!
//! A schedule maps normalized sampling progress (0.0 = first step, 1.0 = last)
//! to the noise level the model sees at that point. Scale curves are expressed
//! in percent, the hooks only see sigmas, so the resolver needs the inverse.

use crate::config::{BetaSchedule, ModelSamplingConfig};

/// Number of evenly spaced percents probed when inverting a schedule.
pub const SIGMA_SAMPLE_COUNT: usize = 100;

/// Sigma returned for `percent <= 0.0`; larger than any trained sigma.
pub const SIGMA_AT_START: f64 = 999_999_999.9;

/// Percent-to-sigma mapping owned by the model.
///
/// Implementations are expected to be non-increasing in `percent`.
pub trait SamplingSchedule: Send + Sync {
    fn percent_to_sigma(&self, percent: f64) -> f64;
}

/// Adapts a closure into a [`SamplingSchedule`].
#[derive(Debug, Clone, Copy)]
pub struct FnSchedule<F>(pub F);

impl<F> SamplingSchedule for FnSchedule<F>
where
    F: Fn(f64) -> f64 + Send + Sync,
{
    fn percent_to_sigma(&self, percent: f64) -> f64 {
        (self.0)(percent)
    }
}

/// Discrete-time model sampling (eps / v-prediction UNets).
///
/// Sigmas come from the training beta schedule; intermediate timesteps are
/// interpolated in log-sigma space.
#[derive(Debug, Clone)]
pub struct DiscreteModelSampling {
    sigmas: Vec<f64>,
    log_sigmas: Vec<f64>,
}

impl DiscreteModelSampling {
    pub fn new(config: &ModelSamplingConfig) -> Self {
        let sigmas = Self::compute_sigmas(config);
        let log_sigmas = sigmas.iter().map(|s| s.ln()).collect();
        Self { sigmas, log_sigmas }
    }

    fn compute_sigmas(config: &ModelSamplingConfig) -> Vec<f64> {
        let n = config.num_train_timesteps.max(2);
        let denom = (n - 1) as f64;

        let betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::ScaledLinear => {
                let start = config.beta_start.sqrt();
                let end = config.beta_end.sqrt();
                (0..n)
                    .map(|i| {
                        let beta_sqrt = start + (i as f64 / denom) * (end - start);
                        beta_sqrt * beta_sqrt
                    })
                    .collect()
            }
            BetaSchedule::Linear => (0..n)
                .map(|i| config.beta_start + (i as f64 / denom) * (config.beta_end - config.beta_start))
                .collect(),
        };

        // sigma = sqrt((1 - alpha_cumprod) / alpha_cumprod)
        let mut cumprod = 1.0;
        betas
            .iter()
            .map(|beta| {
                cumprod *= 1.0 - beta;
                ((1.0 - cumprod) / cumprod).sqrt()
            })
            .collect()
    }

    /// Training sigmas, indexed by timestep.
    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn sigma_min(&self) -> f64 {
        self.sigmas[0]
    }

    pub fn sigma_max(&self) -> f64 {
        self.sigmas[self.sigmas.len() - 1]
    }

    /// Sigma at a (possibly fractional) timestep.
    pub fn sigma_at_timestep(&self, timestep: f64) -> f64 {
        let last = (self.log_sigmas.len() - 1) as f64;
        let t = timestep.clamp(0.0, last);
        let low = t.floor() as usize;
        let high = t.ceil() as usize;
        let w = t - t.floor();
        ((1.0 - w) * self.log_sigmas[low] + w * self.log_sigmas[high]).exp()
    }

    /// Sigmas for an `num_steps` sampling run with evenly spaced timesteps,
    /// followed by the terminal 0.0.
    pub fn step_sigmas(&self, num_steps: usize) -> Vec<f64> {
        let last = (self.sigmas.len() - 1) as f64;
        let mut sigmas: Vec<f64> = (0..num_steps)
            .map(|i| {
                let t = i as f64 / num_steps.saturating_sub(1).max(1) as f64;
                self.sigma_at_timestep((1.0 - t) * last)
            })
            .collect();
        sigmas.push(0.0);
        sigmas
    }
}

impl Default for DiscreteModelSampling {
    fn default() -> Self {
        Self::new(&ModelSamplingConfig::default())
    }
}

impl SamplingSchedule for DiscreteModelSampling {
    fn percent_to_sigma(&self, percent: f64) -> f64 {
        if percent <= 0.0 {
            return SIGMA_AT_START;
        }
        if percent >= 1.0 {
            return 0.0;
        }
        let last = (self.sigmas.len() - 1) as f64;
        self.sigma_at_timestep((1.0 - percent) * last)
    }
}

/// The schedule probed at `i / 100` for `i in 0..100`.
///
/// Sampled once so that resolving a sigma during a forward pass does not call
/// back into the schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct SigmaSamples {
    sigmas: Vec<f64>,
}

impl SigmaSamples {
    pub fn new(schedule: &dyn SamplingSchedule) -> Self {
        let sigmas = (0..SIGMA_SAMPLE_COUNT)
            .map(|i| schedule.percent_to_sigma(Self::percent(i)))
            .collect();
        Self { sigmas }
    }

    /// Percent of sample `index`.
    pub fn percent(index: usize) -> f64 {
        index as f64 / SIGMA_SAMPLE_COUNT as f64
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Largest sampled percent whose sigma is still above `sigma`.
    ///
    /// Searching from the top returns the same sample a full forward scan
    /// keeping the last match would, whether or not the schedule is monotonic.
    pub fn last_percent_above(&self, sigma: f64) -> Option<f64> {
        self.sigmas
            .iter()
            .rposition(|&s| s > sigma)
            .map(Self::percent)
    }
}
