//! PPO algorithm utilities.
//!
//! All tensors are time-major `[T, N]` (steps x environment slots) unless
//! they are flattened minibatch vectors `[B]`.

use tch::{Kind, Tensor};

/// Per-(step, slot) advantages and returns of one rollout
#[derive(Debug)]
pub struct Advantages {
    pub advantages: Tensor,
    pub returns: Tensor,
}

/// Bootstrap value and "non-terminal" mask for step `t`.
///
/// The last step bootstraps from `next_value` masked by its own done flag;
/// earlier steps use the following step's stored value and done flag.
fn bootstrap(values: &Tensor, dones: &Tensor, next_value: &Tensor, t: i64, steps: i64) -> (Tensor, Tensor) {
    if t == steps - 1 {
        (next_value.shallow_clone(), 1.0 - &dones.get(t))
    } else {
        (values.get(t + 1), 1.0 - &dones.get(t + 1))
    }
}

/// Compute Generalized Advantage Estimation (GAE)
///
/// # Arguments
/// * `rewards` - Tensor of rewards [T, N]
/// * `values` - Tensor of value estimates [T, N]
/// * `dones` - Tensor of done flags [T, N]
/// * `next_value` - Value of the observation following the last step [N]
/// * `gamma` - Discount factor
/// * `gae_lambda` - GAE lambda
pub fn compute_gae(
    rewards: &Tensor,
    values: &Tensor,
    dones: &Tensor,
    next_value: &Tensor,
    gamma: f64,
    gae_lambda: f64,
) -> Advantages {
    let steps = rewards.size()[0];
    let advantages = rewards.zeros_like();
    let mut last_gae = next_value.zeros_like();

    for t in (0..steps).rev() {
        let (next_values, non_terminal) = bootstrap(values, dones, next_value, t, steps);
        let delta = rewards.get(t) + gamma * &next_values * &non_terminal - values.get(t);
        last_gae = delta + gamma * gae_lambda * &non_terminal * &last_gae;
        advantages.get(t).copy_(&last_gae);
    }

    Advantages {
        returns: &advantages + values,
        advantages,
    }
}

/// Bootstrapped n-step returns, `advantage = return - value`.
pub fn compute_nstep_returns(
    rewards: &Tensor,
    values: &Tensor,
    dones: &Tensor,
    next_value: &Tensor,
    gamma: f64,
) -> Advantages {
    let steps = rewards.size()[0];
    let returns = rewards.zeros_like();

    for t in (0..steps).rev() {
        let (_, non_terminal) = bootstrap(values, dones, next_value, t, steps);
        let next_return = if t == steps - 1 {
            next_value.shallow_clone()
        } else {
            returns.get(t + 1)
        };
        let ret = rewards.get(t) + gamma * &non_terminal * &next_return;
        returns.get(t).copy_(&ret);
    }

    Advantages {
        advantages: &returns - values,
        returns,
    }
}

/// Standardize a minibatch of advantages.
///
/// A constant batch maps to exactly zero.
pub fn normalize_advantages(advantages: &Tensor) -> Tensor {
    if advantages.numel() < 2 {
        return advantages.zeros_like();
    }
    let std = advantages.std(true);
    // f32 rounding leaves the mean of a constant batch slightly off
    if std.double_value(&[]) < 1e-6 {
        return advantages.zeros_like();
    }
    (advantages - advantages.mean(Kind::Float)) / (std + 1e-8)
}

/// Compute PPO clipped policy loss
pub fn clipped_policy_loss(
    advantages: &Tensor,
    ratio: &Tensor,
    clip_coef: f64,
) -> Tensor {
    let surr1 = -advantages * ratio;
    let surr2 = -advantages * ratio.clamp(1.0 - clip_coef, 1.0 + clip_coef);
    surr1.max_other(&surr2).mean(Kind::Float)
}

/// Squared-error value loss, optionally clipped around the old values
pub fn value_loss(
    new_values: &Tensor,
    old_values: &Tensor,
    returns: &Tensor,
    clip_coef: Option<f64>,
) -> Tensor {
    let unclipped = (new_values - returns).pow_tensor_scalar(2);
    match clip_coef {
        Some(clip) => {
            let clipped = old_values + (new_values - old_values).clamp(-clip, clip);
            let clipped = (clipped - returns).pow_tensor_scalar(2);
            unclipped.max_other(&clipped).mean(Kind::Float) * 0.5
        }
        None => unclipped.mean(Kind::Float) * 0.5,
    }
}

/// KL estimates between the collecting and current policy: `(old, new)`,
/// where `new = mean((ratio - 1) - log_ratio)`.
pub fn approx_kl(log_ratio: &Tensor) -> (f64, f64) {
    let ratio = log_ratio.exp();
    let old = (-log_ratio).mean(Kind::Float).double_value(&[]);
    let new = ((ratio - 1.0) - log_ratio).mean(Kind::Float).double_value(&[]);
    (old, new)
}

/// Fraction of ratios outside the clip range
pub fn clip_fraction(ratio: &Tensor, clip_coef: f64) -> f64 {
    (ratio - 1.0)
        .abs()
        .gt(clip_coef)
        .to_kind(Kind::Float)
        .mean(Kind::Float)
        .double_value(&[])
}

/// `1 - Var(returns - values) / Var(returns)`; `None` when the returns have
/// zero variance.
pub fn explained_variance(values: &Tensor, returns: &Tensor) -> Option<f64> {
    let var_y = returns.var(false).double_value(&[]);
    if var_y == 0.0 || !var_y.is_finite() {
        return None;
    }
    let var_residual = (returns - values).var(false).double_value(&[]);
    Some(1.0 - var_residual / var_y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn t(data: &[f32], steps: i64) -> Tensor {
        Tensor::from_slice(data).reshape([steps, -1])
    }

    fn values(x: &Tensor) -> Vec<f32> {
        Vec::<f32>::try_from(x.flatten(0, -1)).unwrap()
    }

    fn close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn test_gae_two_step_scenario() {
        let rewards = Tensor::ones([2, 4], (Kind::Float, Device::Cpu));
        let zeros = Tensor::zeros([2, 4], (Kind::Float, Device::Cpu));
        let next_value = Tensor::zeros([4], (Kind::Float, Device::Cpu));

        let out = compute_gae(&rewards, &zeros, &zeros, &next_value, 0.99, 0.95);
        let adv = values(&out.advantages);
        close(&adv[..4], &[1.9405; 4]);
        close(&adv[4..], &[1.0; 4]);
        assert!(out.returns.equal(&out.advantages));
    }

    #[test]
    fn test_gae_lambda_one_is_monte_carlo() {
        let rewards = t(&[1.0, 0.5, -1.0, 2.0], 4);
        let vals = t(&[0.3, -0.2, 0.7, 0.1], 4);
        let dones = t(&[0.0; 4], 4);
        let next_value = Tensor::from_slice(&[0.4f32]);
        let gamma = 0.9f32;

        let out = compute_gae(&rewards, &vals, &dones, &next_value, gamma as f64, 1.0);
        let r = [1.0f32, 0.5, -1.0, 2.0];
        let v = [0.3f32, -0.2, 0.7, 0.1];
        let mut ret = 0.4f32;
        let mut expected = [0.0f32; 4];
        for i in (0..4).rev() {
            ret = r[i] + gamma * ret;
            expected[i] = ret - v[i];
        }
        close(&values(&out.advantages), &expected);
    }

    #[test]
    fn test_gae_lambda_zero_is_td_residual() {
        let rewards = t(&[1.0, 0.5, -1.0], 3);
        let vals = t(&[0.3, -0.2, 0.7], 3);
        let dones = t(&[0.0, 1.0, 0.0], 3);
        let next_value = Tensor::from_slice(&[0.4f32]);

        let out = compute_gae(&rewards, &vals, &dones, &next_value, 0.9, 0.0);
        // step 0 sees dones[1] = 1, so no bootstrap
        let expected = [1.0 - 0.3, 0.5 + 0.9 * 0.7 + 0.2, -1.0 + 0.9 * 0.4 - 0.7];
        close(&values(&out.advantages), &expected);
    }

    #[test]
    fn test_final_done_ignores_bootstrap() {
        let rewards = t(&[0.0, 1.0], 2);
        let vals = t(&[0.0, 0.5], 2);
        let dones = t(&[0.0, 1.0], 2);
        for bootstrap in [0.0f32, 1e6, -1e6] {
            let next_value = Tensor::from_slice(&[bootstrap]);
            let gae = compute_gae(&rewards, &vals, &dones, &next_value, 0.99, 0.95);
            assert!((values(&gae.advantages)[1] - 0.5).abs() < 1e-6);
            let nstep = compute_nstep_returns(&rewards, &vals, &dones, &next_value, 0.99);
            assert!((values(&nstep.returns)[1] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_nstep_is_discounted_sum() {
        let rewards = t(&[1.0, 2.0, 3.0, 4.0, 1.0, 2.0], 3);
        let vals = Tensor::zeros([3, 2], (Kind::Float, Device::Cpu));
        let dones = Tensor::zeros([3, 2], (Kind::Float, Device::Cpu));
        let next_value = Tensor::from_slice(&[10.0f32, -5.0]);
        let g = 0.5f32;

        let out = compute_nstep_returns(&rewards, &vals, &dones, &next_value, g as f64);
        let expected = [
            1.0 + g * 3.0 + g * g * 1.0 + g * g * g * 10.0,
            2.0 + g * 4.0 + g * g * 2.0 - g * g * g * 5.0,
            3.0 + g * 1.0 + g * g * 10.0,
            4.0 + g * 2.0 - g * g * 5.0,
            1.0 + g * 10.0,
            2.0 - g * 5.0,
        ];
        close(&values(&out.returns), &expected);
        assert!(out.advantages.equal(&out.returns));
    }

    #[test]
    fn test_identical_advantages_normalize_to_zero() {
        let adv = Tensor::full([16], 3.25, (Kind::Float, Device::Cpu));
        let normalized = normalize_advantages(&adv);
        assert!(normalized.equal(&Tensor::zeros([16], (Kind::Float, Device::Cpu))));

        let single = normalize_advantages(&Tensor::from_slice(&[2.0f32]));
        assert_eq!(values(&single), [0.0]);
    }

    #[test]
    fn test_inexact_constant_advantages_normalize_to_zero() {
        for (n, v) in [(16, 0.7), (7, 0.1)] {
            let adv = Tensor::full([n], v, (Kind::Float, Device::Cpu));
            let normalized = normalize_advantages(&adv);
            assert!(values(&normalized).iter().all(|&x| x == 0.0), "n={n} v={v}");
        }
    }

    #[test]
    fn test_normalized_advantages_have_unit_std() {
        let adv = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]);
        let normalized = normalize_advantages(&adv);
        assert!(normalized.mean(Kind::Float).double_value(&[]).abs() < 1e-6);
        assert!((normalized.std(true).double_value(&[]) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_clip_removes_gradient_outside_range() {
        for (advantage, log_ratio) in [(1.0f32, 0.5f32), (-1.0, -0.5)] {
            let log_ratio = Tensor::from_slice(&[log_ratio]).set_requires_grad(true);
            let adv = Tensor::from_slice(&[advantage]);
            let loss = clipped_policy_loss(&adv, &log_ratio.exp(), 0.2);
            loss.backward();
            assert_eq!(log_ratio.grad().double_value(&[0]), 0.0);
        }
    }

    #[test]
    fn test_clipped_loss_is_pessimistic() {
        let ratio = Tensor::from_slice(&[0.5f32, 0.9, 1.1, 1.5]);
        for sign in [1.0f32, -1.0] {
            let adv = Tensor::from_slice(&[sign; 4]);
            let clipped = clipped_policy_loss(&adv, &ratio, 0.2).double_value(&[]);
            let unclipped = (-&adv * &ratio).mean(Kind::Float).double_value(&[]);
            assert!(clipped >= unclipped - 1e-6);
        }
    }

    #[test]
    fn test_value_loss_clipping() {
        let old = Tensor::from_slice(&[0.0f32]);
        let returns = Tensor::from_slice(&[1.0f32]);
        let new = Tensor::from_slice(&[2.0f32]);
        // unclipped (2-1)^2 = 1, clipped (0.2-1)^2 = 0.64, max = 1
        assert!((value_loss(&new, &old, &returns, None).double_value(&[]) - 0.5).abs() < 1e-6);
        assert!((value_loss(&new, &old, &returns, Some(0.2)).double_value(&[]) - 0.5).abs() < 1e-6);

        let new = Tensor::from_slice(&[0.9f32]);
        // unclipped 0.01, clipped 0.64
        assert!((value_loss(&new, &old, &returns, Some(0.2)).double_value(&[]) - 0.32).abs() < 1e-6);
    }

    #[test]
    fn test_approx_kl_is_non_negative() {
        let log_ratio = Tensor::from_slice(&[-0.3f32, 0.1, 0.4, 0.0]);
        let (_, kl) = approx_kl(&log_ratio);
        assert!(kl >= 0.0);
        let (old, new) = approx_kl(&Tensor::zeros([3], (Kind::Float, Device::Cpu)));
        assert_eq!((old, new), (0.0, 0.0));
    }

    #[test]
    fn test_clip_fraction() {
        let ratio = Tensor::from_slice(&[1.0f32, 1.3, 0.7, 1.1]);
        assert!((clip_fraction(&ratio, 0.2) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_explained_variance() {
        let returns = Tensor::from_slice(&[1.0f32, 2.0, 3.0]);
        assert!((explained_variance(&returns, &returns).unwrap() - 1.0).abs() < 1e-6);
        let constant = Tensor::from_slice(&[2.0f32, 2.0, 2.0]);
        assert_eq!(explained_variance(&returns, &constant), None);
    }
}
