//! Imitation policy network using Burn framework

use std::borrow::Borrow;

use burn::module::AutodiffModule;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::{relu, softmax};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Distribution, ElementConversion};

use crate::env::{Action, ActionKind};
use crate::error::{Error, Result as CrateResult};

/// Added to probabilities before the log so a zero probability still gives a finite loss
pub const LOG_EPSILON: f32 = 1e-10;

/// Shape of the feed-forward policy network
#[derive(Debug, Config)]
pub struct NetworkConfig {
    /// Width of one state row
    pub state_size: usize,
    /// Number of discrete categories, or length of a continuous action
    pub action_size: usize,
    #[config(default = 128)]
    pub hidden_units: usize,
    /// Hidden layers after the input layer
    #[config(default = 2)]
    pub num_layers: usize,
    /// Drop probability applied before the output layer during training
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl NetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PolicyNet<B> {
        let input = LinearConfig::new(self.state_size, self.hidden_units).init(device);

        let hidden = (0..self.num_layers)
            .map(|_| LinearConfig::new(self.hidden_units, self.hidden_units).init(device))
            .collect();

        PolicyNet {
            input,
            hidden,
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_units, self.action_size).init(device),
        }
    }
}

/// Feed-forward network: ELU hidden stack, dropout, linear output
#[derive(Module, Debug)]
pub struct PolicyNet<B: Backend> {
    input: Linear<B>,
    hidden: Vec<Linear<B>>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> PolicyNet<B> {
    /// Raw outputs: logits for discrete policies, the action itself for continuous ones.
    ///
    /// Dropout only fires on autodiff backends, so forwarding through `valid()` is
    /// deterministic.
    pub fn forward(&self, states: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = elu(self.input.forward(states));

        for layer in &self.hidden {
            x = elu(layer.forward(x));
        }

        self.output.forward(self.dropout.forward(x))
    }
}

/// ELU with alpha = 1: x for x > 0, exp(x) - 1 otherwise
fn elu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let negative = x.clone().clamp_max(0.0).exp().sub_scalar(1.0);
    relu(x) + negative
}

/// Sum over the batch of -log p(true action)
pub fn discrete_loss<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2, Int>) -> Tensor<B, 1> {
    let log_probs = softmax(logits, 1).add_scalar(LOG_EPSILON).log();
    -log_probs.gather(1, targets).sum()
}

/// Sum over the batch of squared differences
pub fn continuous_loss<B: Backend>(predicted: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    (predicted - targets).powf_scalar(2.0).sum()
}

/// Pick one action per state row with the given network
pub fn act<B: Backend, S: AsRef<[f32]>>(
    net: &PolicyNet<B>,
    kind: ActionKind,
    config: &NetworkConfig,
    states: &[S],
    device: &B::Device,
) -> CrateResult<Vec<Action>> {
    if states.is_empty() {
        return Ok(Vec::new());
    }
    let output = net.forward(states_tensor(states, config.state_size, device)?);

    match kind {
        ActionKind::Discrete => {
            // Gumbel-max: argmax(logits + g) is a draw from softmax(logits)
            let uniform = Tensor::<B, 2>::random(
                output.shape(),
                Distribution::Uniform(LOG_EPSILON as f64, 1.0),
                device,
            );
            let gumbel = -(-uniform.log()).log();
            let picks = (output + gumbel).argmax(1);

            let picks = picks
                .into_data()
                .convert::<i64>()
                .to_vec::<i64>()
                .map_err(|e| Error::Tensor(format!("{:?}", e)))?;
            Ok(picks
                .into_iter()
                .map(|i| Action::Discrete(i as usize))
                .collect())
        }
        ActionKind::Continuous => {
            let values = output
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| Error::Tensor(format!("{:?}", e)))?;
            Ok(values
                .chunks(config.action_size)
                .map(|row| Action::Continuous(row.to_vec()))
                .collect())
        }
    }
}

fn states_tensor<B: Backend, S: AsRef<[f32]>>(
    rows: &[S],
    width: usize,
    device: &B::Device,
) -> CrateResult<Tensor<B, 2>> {
    let mut flat = Vec::with_capacity(rows.len() * width);
    for row in rows {
        let row = row.as_ref();
        if row.len() != width {
            return Err(Error::MalformedStep(format!(
                "state has {} values, expected {}",
                row.len(),
                width
            )));
        }
        flat.extend_from_slice(row);
    }

    Ok(Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([rows.len(), width]))
}

fn discrete_targets<B: Backend, A: Borrow<Action>>(
    actions: &[A],
    action_size: usize,
    device: &B::Device,
) -> CrateResult<Tensor<B, 2, Int>> {
    let indices = actions
        .iter()
        .map(|action| match action.borrow() {
            Action::Discrete(i) if *i < action_size => Ok(*i as i64),
            other => Err(Error::ActionMismatch(format!(
                "{:?} is not one of {} discrete actions",
                other, action_size
            ))),
        })
        .collect::<CrateResult<Vec<_>>>()?;

    Ok(Tensor::<B, 1, Int>::from_ints(indices.as_slice(), device).reshape([actions.len(), 1]))
}

fn continuous_targets<B: Backend, A: Borrow<Action>>(
    actions: &[A],
    action_size: usize,
    device: &B::Device,
) -> CrateResult<Tensor<B, 2>> {
    let mut flat = Vec::with_capacity(actions.len() * action_size);
    for action in actions {
        match action.borrow() {
            Action::Continuous(values) if values.len() == action_size => {
                flat.extend_from_slice(values)
            }
            other => {
                return Err(Error::ActionMismatch(format!(
                    "{:?} is not a continuous action of size {}",
                    other, action_size
                )));
            }
        }
    }

    Ok(Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([actions.len(), action_size]))
}

fn check_batch(states: usize, actions: usize) -> CrateResult<()> {
    if states == 0 || states != actions {
        return Err(Error::ActionMismatch(format!(
            "batch of {} states and {} actions",
            states, actions
        )));
    }
    Ok(())
}

/// What the training loop needs from a policy
pub trait ImitationPolicy {
    /// One action per state row, for driving the simulation
    fn sample<S: AsRef<[f32]>>(&self, states: &[S]) -> CrateResult<Vec<Action>>;

    /// Summed loss of the batch under the current parameters, without dropout
    fn loss<S: AsRef<[f32]>, A: Borrow<Action>>(&self, states: &[S], actions: &[A])
    -> CrateResult<f32>;

    /// One Adam step on the batch; returns the loss seen before the step
    fn update<S: AsRef<[f32]>, A: Borrow<Action>>(
        &mut self,
        states: &[S],
        actions: &[A],
    ) -> CrateResult<f32>;
}

/// Network, optimizer and hyperparameters shared by both policy kinds
struct Trainable<B: AutodiffBackend> {
    net: PolicyNet<B>,
    optimizer: OptimizerAdaptor<Adam, PolicyNet<B>, B>,
    config: NetworkConfig,
    learning_rate: f64,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainable<B> {
    fn new(config: &NetworkConfig, learning_rate: f64, device: &B::Device) -> Self {
        Self {
            net: config.init(device),
            optimizer: AdamConfig::new().init(),
            config: config.clone(),
            learning_rate,
            device: device.clone(),
        }
    }

    fn sample<S: AsRef<[f32]>>(&self, kind: ActionKind, states: &[S]) -> CrateResult<Vec<Action>> {
        act(&self.net.valid(), kind, &self.config, states, &self.device)
    }

    fn step(&mut self, loss: Tensor<B, 1>) -> f32 {
        let value = loss.clone().into_scalar().elem::<f32>();

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.net);
        self.net = self
            .optimizer
            .step(self.learning_rate, self.net.clone(), grads);

        value
    }
}

/// Policy over a fixed set of action categories
pub struct DiscretePolicy<B: AutodiffBackend> {
    inner: Trainable<B>,
}

impl<B: AutodiffBackend> ImitationPolicy for DiscretePolicy<B> {
    fn sample<S: AsRef<[f32]>>(&self, states: &[S]) -> CrateResult<Vec<Action>> {
        self.inner.sample(ActionKind::Discrete, states)
    }

    fn loss<S: AsRef<[f32]>, A: Borrow<Action>>(
        &self,
        states: &[S],
        actions: &[A],
    ) -> CrateResult<f32> {
        check_batch(states.len(), actions.len())?;
        let inner = &self.inner;
        let net = inner.net.valid();

        let states = states_tensor(states, inner.config.state_size, &inner.device)?;
        let targets = discrete_targets(actions, inner.config.action_size, &inner.device)?;

        Ok(discrete_loss(net.forward(states), targets)
            .into_scalar()
            .elem::<f32>())
    }

    fn update<S: AsRef<[f32]>, A: Borrow<Action>>(
        &mut self,
        states: &[S],
        actions: &[A],
    ) -> CrateResult<f32> {
        check_batch(states.len(), actions.len())?;
        let inner = &mut self.inner;

        let states = states_tensor(states, inner.config.state_size, &inner.device)?;
        let targets = discrete_targets(actions, inner.config.action_size, &inner.device)?;
        let loss = discrete_loss(inner.net.forward(states), targets);

        Ok(inner.step(loss))
    }
}

/// Policy producing real-valued action vectors
pub struct ContinuousPolicy<B: AutodiffBackend> {
    inner: Trainable<B>,
}

impl<B: AutodiffBackend> ImitationPolicy for ContinuousPolicy<B> {
    fn sample<S: AsRef<[f32]>>(&self, states: &[S]) -> CrateResult<Vec<Action>> {
        self.inner.sample(ActionKind::Continuous, states)
    }

    fn loss<S: AsRef<[f32]>, A: Borrow<Action>>(
        &self,
        states: &[S],
        actions: &[A],
    ) -> CrateResult<f32> {
        check_batch(states.len(), actions.len())?;
        let inner = &self.inner;
        let net = inner.net.valid();

        let states = states_tensor(states, inner.config.state_size, &inner.device)?;
        let targets = continuous_targets(actions, inner.config.action_size, &inner.device)?;

        Ok(continuous_loss(net.forward(states), targets)
            .into_scalar()
            .elem::<f32>())
    }

    fn update<S: AsRef<[f32]>, A: Borrow<Action>>(
        &mut self,
        states: &[S],
        actions: &[A],
    ) -> CrateResult<f32> {
        check_batch(states.len(), actions.len())?;
        let inner = &mut self.inner;

        let states = states_tensor(states, inner.config.state_size, &inner.device)?;
        let targets = continuous_targets(actions, inner.config.action_size, &inner.device)?;
        let loss = continuous_loss(inner.net.forward(states), targets);

        Ok(inner.step(loss))
    }
}

/// The learner policy, its kind fixed at construction
pub enum Policy<B: AutodiffBackend> {
    Discrete(DiscretePolicy<B>),
    Continuous(ContinuousPolicy<B>),
}

impl<B: AutodiffBackend> Policy<B> {
    pub fn new(
        config: &NetworkConfig,
        kind: ActionKind,
        learning_rate: f64,
        device: &B::Device,
    ) -> Self {
        let inner = Trainable::new(config, learning_rate, device);
        match kind {
            ActionKind::Discrete => Policy::Discrete(DiscretePolicy { inner }),
            ActionKind::Continuous => Policy::Continuous(ContinuousPolicy { inner }),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Policy::Discrete(_) => ActionKind::Discrete,
            Policy::Continuous(_) => ActionKind::Continuous,
        }
    }

    fn inner(&self) -> &Trainable<B> {
        match self {
            Policy::Discrete(p) => &p.inner,
            Policy::Continuous(p) => &p.inner,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner().config
    }

    pub fn device(&self) -> &B::Device {
        &self.inner().device
    }

    /// Current parameters, for checkpointing and export
    pub fn network(&self) -> &PolicyNet<B> {
        &self.inner().net
    }

    /// Swap in restored parameters
    pub fn set_network(&mut self, net: PolicyNet<B>) {
        match self {
            Policy::Discrete(p) => p.inner.net = net,
            Policy::Continuous(p) => p.inner.net = net,
        }
    }
}

impl<B: AutodiffBackend> ImitationPolicy for Policy<B> {
    fn sample<S: AsRef<[f32]>>(&self, states: &[S]) -> CrateResult<Vec<Action>> {
        match self {
            Policy::Discrete(p) => p.sample(states),
            Policy::Continuous(p) => p.sample(states),
        }
    }

    fn loss<S: AsRef<[f32]>, A: Borrow<Action>>(
        &self,
        states: &[S],
        actions: &[A],
    ) -> CrateResult<f32> {
        match self {
            Policy::Discrete(p) => p.loss(states, actions),
            Policy::Continuous(p) => p.loss(states, actions),
        }
    }

    fn update<S: AsRef<[f32]>, A: Borrow<Action>>(
        &mut self,
        states: &[S],
        actions: &[A],
    ) -> CrateResult<f32> {
        match self {
            Policy::Discrete(p) => p.update(states, actions),
            Policy::Continuous(p) => p.update(states, actions),
        }
    }
}
