//! Rollout throughput of the serial and threaded pools on the arena.

use fpsrl::prelude::*;
use fpsrl::training::{RolloutBuffer, RolloutCollector, TrainContext};
use fpsrl::utils::{abbreviate, select_device};
use fpsrl_envs::{Arena, ArenaConfig};
use std::time::Instant;

const NUM_ENVS: usize = 16;
const NUM_STEPS: usize = 64;
const ROLLOUTS: usize = 5;

fn profile(name: &str, pool: &mut dyn AsyncEnvPool, agent: &Agent) -> Result<()> {
    let device = agent.device();
    let obs_shape = pool.observation_space().image_shape()?;
    let mut buffer = RolloutBuffer::new(NUM_STEPS, NUM_ENVS, obs_shape, device);
    let mut collector = RolloutCollector::new(NUM_ENVS);
    let mut ctx = TrainContext::silent(device);

    pool.reset_async(Some(0))?;
    let start = Instant::now();
    let mut polls = 0;
    for _ in 0..ROLLOUTS {
        polls += collector.collect(agent, pool, &mut buffer, &mut ctx)?.polls;
    }
    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "{name:<10} {} steps in {elapsed:.2}s ({:.0} SPS, {polls} polls)",
        abbreviate(ctx.global_step),
        ctx.global_step as f64 / elapsed
    );
    pool.close();
    Ok(())
}

fn main() -> Result<()> {
    let device = select_device(true);
    let config = ArenaConfig::default();
    println!("Profiling {NUM_ENVS} arenas of {:?} on {device:?}", config.obs_shape());

    let mut serial = SerialPool::from_fn(NUM_ENVS, NUM_ENVS / 2, |_| Arena::boxed(config.clone()))?.with_shuffle(0);
    let agent = Agent::new(
        AgentConfig::from_spaces(&serial.observation_space(), &serial.action_space())?,
        device,
    )?;
    profile("serial", &mut serial, &agent)?;

    let mut threaded = ThreadedPool::from_fn(NUM_ENVS, NUM_ENVS / 2, |_| Arena::boxed(config.clone()))?;
    profile("threaded", &mut threaded, &agent)?;
    Ok(())
}
