//! Extension points of the training loop.
//!
//! Continual-learning methods plug in here: a penalty such as elastic
//! weight consolidation returns it from [`TrainingHook::regularization`],
//! parameter resets such as shrink-and-perturb act in
//! [`TrainingHook::after_optimizer_step`].

use crate::policy::Agent;
use tch::Tensor;

pub trait TrainingHook: Send {
    /// Extra scalar added to every minibatch loss
    fn regularization(&mut self, _agent: &Agent) -> Option<Tensor> {
        None
    }

    /// Called after every optimizer step
    fn after_optimizer_step(&mut self, _agent: &mut Agent) {}

    /// Called when training moves from task `finished` to task `next`
    fn on_task_switch(&mut self, _agent: &Agent, _finished: usize, _next: usize) {}
}
