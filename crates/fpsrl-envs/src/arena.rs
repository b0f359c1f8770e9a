//! First-person arena shooter.
//!
//! The agent stands in the middle of a circular room and can only turn and
//! shoot. Targets spawn at random bearings and walk towards it; a target that
//! reaches the agent deals damage. The view is rendered column by column, one
//! bearing per column, so targets appear as vertical bars that grow as they
//! approach.

use fpsrl::env::{EnvInfo, Environment, StepResult, KILLCOUNT_TOTAL};
use fpsrl::spaces::{Box as BoxSpace, Discrete, DynSpace};
use fpsrl::FpsError;
use ndarray::{s, Array3, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::f32::consts::{PI, TAU};
use std::str::FromStr;

/// Counter key for remaining health
pub const HEALTH: &str = "HEALTH";
/// Counter key for remaining ammunition
pub const AMMO: &str = "AMMO";

const TURN_LEFT: i64 = 0;
const TURN_RIGHT: i64 = 1;
const ATTACK: i64 = 2;

/// Distance at which a target reaches the agent
const CONTACT: f32 = 0.05;

/// Preset variations of the arena, one per training task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    /// Few slow targets in a lit room
    Center,
    /// Same targets in a dark room with muted colors
    Night,
    /// Many fast targets
    Crowd,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [Scenario::Center, Scenario::Night, Scenario::Crowd];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::Center => "center",
            Scenario::Night => "night",
            Scenario::Crowd => "crowd",
        }
    }
}

impl FromStr for Scenario {
    type Err = FpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| FpsError::Config(format!("unknown scenario '{s}' (expected center, night or crowd)")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Palette {
    ceiling: [f32; 3],
    floor: [f32; 3],
    target: [f32; 3],
}

const LIT: Palette = Palette {
    ceiling: [90.0, 90.0, 110.0],
    floor: [70.0, 60.0, 50.0],
    target: [220.0, 40.0, 40.0],
};

const DARK: Palette = Palette {
    ceiling: [15.0, 15.0, 25.0],
    floor: [20.0, 18.0, 15.0],
    target: [110.0, 60.0, 140.0],
};

/// Arena parameters
#[derive(Clone, Debug, PartialEq)]
pub struct ArenaConfig {
    pub scenario: Scenario,
    pub width: usize,
    pub height: usize,
    /// Stacked RGB frames per observation
    pub frames: usize,
    pub num_targets: usize,
    /// Distance a target covers per step
    pub target_speed: f32,
    /// Horizontal field of view in radians
    pub fov: f32,
    /// Rotation per turn action in radians
    pub turn: f32,
    pub ammo: u32,
    pub health: u32,
    /// Damage taken when a target reaches the agent
    pub damage: u32,
    /// Steps before the episode is truncated
    pub max_steps: u32,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::scenario(Scenario::Center)
    }
}

impl ArenaConfig {
    pub fn scenario(scenario: Scenario) -> Self {
        let (num_targets, target_speed) = match scenario {
            Scenario::Center | Scenario::Night => (3, 0.01),
            Scenario::Crowd => (6, 0.02),
        };
        Self {
            scenario,
            width: 64,
            height: 64,
            frames: 4,
            num_targets,
            target_speed,
            fov: PI / 2.0,
            turn: PI / 16.0,
            ammo: 26,
            health: 100,
            damage: 25,
            max_steps: 2100,
        }
    }

    pub fn with_resolution(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames.max(1);
        self
    }

    pub fn with_ammo(mut self, ammo: u32) -> Self {
        self.ammo = ammo;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_targets(mut self, num_targets: usize, speed: f32) -> Self {
        self.num_targets = num_targets.max(1);
        self.target_speed = speed;
        self
    }

    /// `[channels, height, width]` of an observation
    pub fn obs_shape(&self) -> [usize; 3] {
        [3 * self.frames, self.height, self.width]
    }

    fn palette(&self) -> Palette {
        match self.scenario {
            Scenario::Night => DARK,
            Scenario::Center | Scenario::Crowd => LIT,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Target {
    bearing: f32,
    distance: f32,
}

/// Arena environment
pub struct Arena {
    config: ArenaConfig,
    palette: Palette,
    heading: f32,
    targets: Vec<Target>,
    health: u32,
    ammo: u32,
    kills: u32,
    tick: u32,
    done: bool,
    history: VecDeque<Array3<f32>>,
    rng: StdRng,
}

/// Wrap an angle to `[-PI, PI)`
fn wrap(angle: f32) -> f32 {
    (angle + PI).rem_euclid(TAU) - PI
}

impl Arena {
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            palette: config.palette(),
            heading: 0.0,
            targets: Vec::new(),
            health: config.health,
            ammo: config.ammo,
            kills: 0,
            tick: 0,
            done: false,
            history: VecDeque::with_capacity(config.frames),
            rng: StdRng::from_entropy(),
            config,
        }
    }

    pub fn boxed(config: ArenaConfig) -> Box<dyn Environment> {
        Box::new(Self::new(config))
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn kills(&self) -> u32 {
        self.kills
    }

    fn spawn(&mut self) -> Target {
        Target {
            bearing: self.rng.gen_range(-PI..PI),
            distance: self.rng.gen_range(0.7..1.0),
        }
    }

    /// Angular half-width of a target at `distance`
    fn half_width(distance: f32) -> f32 {
        (0.04 / distance.max(CONTACT)).min(0.5)
    }

    /// Index of the nearest target under the crosshair
    fn aimed_target(&self) -> Option<usize> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(_, t)| wrap(t.bearing - self.heading).abs() <= Self::half_width(t.distance))
            .min_by(|(_, a), (_, b)| a.distance.total_cmp(&b.distance))
            .map(|(i, _)| i)
    }

    fn render_frame(&self) -> Array3<f32> {
        let (h, w) = (self.config.height, self.config.width);
        let mut frame = Array3::zeros((3, h, w));
        let horizon = h / 2;
        for c in 0..3 {
            frame.slice_mut(s![c, ..horizon, ..]).fill(self.palette.ceiling[c]);
            frame.slice_mut(s![c, horizon.., ..]).fill(self.palette.floor[c]);
        }

        // Far targets first so near ones cover them
        let mut visible: Vec<&Target> = self.targets.iter().collect();
        visible.sort_by(|a, b| b.distance.total_cmp(&a.distance));
        for target in visible {
            let half = Self::half_width(target.distance);
            let bar = ((h as f32 * 0.3 / target.distance) as usize).clamp(1, h);
            let top = horizon.saturating_sub(bar / 2);
            let bottom = (top + bar).min(h);
            let shade = (1.2 - target.distance).clamp(0.3, 1.0);
            for col in 0..w {
                let angle = self.heading - self.config.fov / 2.0 + self.config.fov * (col as f32 + 0.5) / w as f32;
                if wrap(target.bearing - angle).abs() <= half {
                    for c in 0..3 {
                        frame
                            .slice_mut(s![c, top..bottom, col])
                            .fill(self.palette.target[c] * shade);
                    }
                }
            }
        }
        frame
    }

    /// Stack the frame history oldest-first
    fn observation(&self) -> ArrayD<f32> {
        let [channels, h, w] = self.config.obs_shape();
        let mut obs = ArrayD::zeros(IxDyn(&[channels, h, w]));
        for (i, frame) in self.history.iter().enumerate() {
            obs.slice_mut(s![3 * i..3 * (i + 1), .., ..]).assign(frame);
        }
        obs
    }

    fn push_frame(&mut self) {
        let frame = self.render_frame();
        if self.history.len() == self.config.frames {
            self.history.pop_front();
        }
        self.history.push_back(frame);
    }

    fn info(&self) -> EnvInfo {
        EnvInfo::new()
            .with_counter(KILLCOUNT_TOTAL, self.kills as f32)
            .with_counter(HEALTH, self.health as f32)
            .with_counter(AMMO, self.ammo as f32)
    }
}

impl Environment for Arena {
    fn observation_space(&self) -> DynSpace {
        let [c, h, w] = self.config.obs_shape();
        DynSpace::Box(BoxSpace::image(c, h, w))
    }

    fn action_space(&self) -> DynSpace {
        DynSpace::Discrete(Discrete::new(3))
    }

    fn reset(&mut self, seed: Option<u64>) -> (ArrayD<f32>, EnvInfo) {
        if let Some(s) = seed {
            self.rng = StdRng::seed_from_u64(s);
        }
        self.heading = 0.0;
        self.health = self.config.health;
        self.ammo = self.config.ammo;
        self.kills = 0;
        self.tick = 0;
        self.done = false;
        let targets = (0..self.config.num_targets).map(|_| self.spawn()).collect();
        self.targets = targets;

        let frame = self.render_frame();
        self.history.clear();
        self.history.extend(std::iter::repeat(frame).take(self.config.frames));
        (self.observation(), self.info())
    }

    fn step(&mut self, action: i64) -> StepResult {
        let mut reward = 0.0;
        match action {
            TURN_LEFT => self.heading = wrap(self.heading - self.config.turn),
            TURN_RIGHT => self.heading = wrap(self.heading + self.config.turn),
            ATTACK if self.ammo > 0 => {
                self.ammo -= 1;
                if let Some(i) = self.aimed_target() {
                    self.targets[i] = self.spawn();
                    self.kills += 1;
                    reward += 1.0;
                }
            }
            _ => {}
        }

        for i in 0..self.targets.len() {
            self.targets[i].distance -= self.config.target_speed;
            if self.targets[i].distance <= CONTACT {
                self.health = self.health.saturating_sub(self.config.damage);
                self.targets[i] = self.spawn();
            }
        }

        self.tick += 1;
        let dead = self.health == 0;
        if dead {
            reward -= 1.0;
        }
        let terminated = dead || self.ammo == 0;
        let truncated = !terminated && self.tick >= self.config.max_steps;
        self.done = terminated || truncated;
        if self.done {
            tracing::trace!(kills = self.kills, tick = self.tick, health = self.health, "Arena episode finished");
        }

        self.push_frame();
        StepResult {
            observation: self.observation(),
            reward,
            terminated,
            truncated,
            info: self.info(),
        }
    }

    fn render(&self) -> Option<String> {
        Some(format!(
            "{} heading={:+.2} health={} ammo={} kills={} tick={}",
            self.config.scenario.name(),
            self.heading,
            self.health,
            self.ammo,
            self.kills,
            self.tick
        ))
    }

    fn is_done(&self) -> bool {
        self.done
    }
}
