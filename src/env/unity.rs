use std::collections::HashMap;
use std::path::Path;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tonic::transport::{Channel, Endpoint};

use crate::error::{Error, Result};
use crate::proto::environment::unity_environment_client::UnityEnvironmentClient;
use crate::proto::environment::{self as pb, ActionSpaceType};

use super::{Action, ActionKind, AgentBatch, BrainInfos, BrainParameters, Environment};

/// Port of worker 0; each worker listens on `BASE_PORT + worker_id`
pub const BASE_PORT: u16 = 5005;

/// A simulation binary spoken to over gRPC.
///
/// Calls are driven to completion on a private current-thread runtime, so the
/// adapter is fully synchronous from the caller's point of view.
pub struct UnityEnvironment {
    name: String,
    academy: String,
    brains: HashMap<String, BrainParameters>,
    runtime: Runtime,
    client: UnityEnvironmentClient<Channel>,
    process: Option<Child>,
}

impl UnityEnvironment {
    /// Start the simulation binary and connect to it
    pub fn launch(path: impl AsRef<Path>, worker_id: u16, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let port = port_for(worker_id)?;

        tracing::info!("Launching {} on port {}", path.display(), port);
        let mut child = Command::new(path)
            .arg("--port")
            .arg(port.to_string())
            .spawn()
            .map_err(|source| Error::Launch {
                path: path.to_path_buf(),
                source,
            })?;

        match Self::connect(path.display().to_string(), port, timeout) {
            Ok(mut env) => {
                env.process = Some(child);
                Ok(env)
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    /// Connect to an already running simulation
    pub fn connect(name: impl Into<String>, port: u16, timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{}", port))?;
        let deadline = Instant::now() + timeout;

        // The binary needs a moment to bind its port after launch
        let channel = runtime.block_on(async {
            loop {
                match endpoint.connect().await {
                    Ok(channel) => return Ok(channel),
                    Err(e) if Instant::now() < deadline => {
                        tracing::debug!("Waiting for environment on port {}: {}", port, e);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    Err(_) => {
                        return Err(Error::StartupTimeout {
                            port,
                            seconds: timeout.as_secs(),
                        });
                    }
                }
            }
        })?;

        let mut client = UnityEnvironmentClient::new(channel);
        let academy = runtime
            .block_on(client.initialize(pb::InitializeRequest { port: port as u32 }))?
            .into_inner();

        let brains = academy
            .brains
            .iter()
            .map(|b| Ok((b.name.clone(), brain_from_proto(b)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        tracing::info!(
            "Connected to academy '{}' with {} brains",
            academy.name,
            brains.len()
        );
        for brain in brains.values() {
            tracing::info!(
                "  {}: state {}x{}, {:?} actions of size {}",
                brain.name,
                brain.state_space_size,
                brain.stacked_states,
                brain.action_kind,
                brain.action_space_size
            );
        }

        Ok(Self {
            name: name.into(),
            academy: academy.name,
            brains,
            runtime,
            client,
            process: None,
        })
    }

    pub fn academy_name(&self) -> &str {
        &self.academy
    }

    fn shutdown_process(&mut self) {
        if let Some(mut child) = self.process.take() {
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.kill() {
                    tracing::warn!("Failed to kill environment process: {}", e);
                }
            }
            let _ = child.wait();
        }
    }
}

impl Environment for UnityEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    fn brain_parameters(&self, brain: &str) -> Option<&BrainParameters> {
        self.brains.get(brain)
    }

    fn reset(&mut self, fast: bool) -> Result<BrainInfos> {
        let response = self
            .runtime
            .block_on(self.client.reset(pb::ResetRequest { train_mode: fast }))?
            .into_inner();
        decode_step(response, &self.brains)
    }

    fn step(&mut self, brain: &str, actions: &[Action]) -> Result<BrainInfos> {
        let params = self
            .brains
            .get(brain)
            .ok_or_else(|| Error::MissingBrain(brain.to_string()))?;
        let request = encode_actions(params, actions)?;

        let response = self
            .runtime
            .block_on(self.client.step(request))?
            .into_inner();
        decode_step(response, &self.brains)
    }

    fn close(&mut self) -> Result<()> {
        let result = self
            .runtime
            .block_on(self.client.close(pb::CloseRequest {}))
            .map(|_| ());
        self.shutdown_process();
        result.map_err(Error::from)
    }
}

impl Drop for UnityEnvironment {
    fn drop(&mut self) {
        self.shutdown_process();
    }
}

/// Port a worker's simulation listens on
pub fn port_for(worker_id: u16) -> Result<u16> {
    BASE_PORT.checked_add(worker_id).ok_or_else(|| {
        Error::Config(format!(
            "worker id {} puts the port past {}",
            worker_id,
            u16::MAX
        ))
    })
}

fn brain_from_proto(brain: &pb::BrainParameters) -> Result<BrainParameters> {
    let action_kind = match ActionSpaceType::try_from(brain.action_space_type) {
        Ok(ActionSpaceType::Discrete) => ActionKind::Discrete,
        Ok(ActionSpaceType::Continuous) => ActionKind::Continuous,
        Err(_) => {
            return Err(Error::MalformedStep(format!(
                "brain {} has unknown action space type {}",
                brain.name, brain.action_space_type
            )));
        }
    };

    Ok(BrainParameters {
        name: brain.name.clone(),
        state_space_size: brain.state_space_size as usize,
        stacked_states: brain.stacked_states as usize,
        action_space_size: brain.action_space_size as usize,
        action_kind,
    })
}

fn encode_actions(brain: &BrainParameters, actions: &[Action]) -> Result<pb::StepRequest> {
    let mut flat = Vec::with_capacity(actions.len() * brain.action_width());

    for action in actions {
        match (brain.action_kind, action) {
            (ActionKind::Discrete, Action::Discrete(index)) if *index < brain.action_space_size => {}
            (ActionKind::Continuous, Action::Continuous(values))
                if values.len() == brain.action_space_size => {}
            _ => {
                return Err(Error::ActionMismatch(format!(
                    "{:?} is not a valid action for brain {}",
                    action, brain.name
                )));
            }
        }
        flat.extend(action.to_floats());
    }

    Ok(pb::StepRequest {
        brain_name: brain.name.clone(),
        actions: flat,
    })
}

fn decode_step(
    step: pb::EnvironmentStep,
    brains: &HashMap<String, BrainParameters>,
) -> Result<BrainInfos> {
    step.brains
        .into_iter()
        .map(|batch| {
            let params = brains
                .get(&batch.brain_name)
                .ok_or_else(|| Error::MissingBrain(batch.brain_name.clone()))?;
            Ok((batch.brain_name.clone(), decode_batch(batch, params)?))
        })
        .collect()
}

fn decode_batch(batch: pb::AgentBatch, brain: &BrainParameters) -> Result<AgentBatch> {
    let agents = batch.agents as usize;
    let state_size = brain.state_size();
    let action_width = brain.action_width();

    let malformed = |what: &str, len: usize, expected: usize| {
        Error::MalformedStep(format!(
            "brain {}: {} has {} values, expected {}",
            brain.name, what, len, expected
        ))
    };

    if state_size == 0 || batch.states.len() != agents * state_size {
        return Err(malformed("states", batch.states.len(), agents * state_size));
    }
    if batch.rewards.len() != agents {
        return Err(malformed("rewards", batch.rewards.len(), agents));
    }
    if !batch.local_done.is_empty() && batch.local_done.len() != agents {
        return Err(malformed("local_done", batch.local_done.len(), agents));
    }
    // Right after a reset no action has been taken yet
    if !batch.previous_actions.is_empty()
        && batch.previous_actions.len() != agents * action_width
    {
        return Err(malformed(
            "previous_actions",
            batch.previous_actions.len(),
            agents * action_width,
        ));
    }

    let states = batch
        .states
        .chunks(state_size)
        .map(|row| row.to_vec())
        .collect();

    let previous_actions = batch
        .previous_actions
        .chunks(action_width.max(1))
        .map(|row| match brain.action_kind {
            ActionKind::Discrete => {
                let value = row[0];
                if value.is_finite()
                    && value >= 0.0
                    && value.fract() == 0.0
                    && (value as usize) < brain.action_space_size
                {
                    Ok(Action::Discrete(value as usize))
                } else {
                    Err(Error::MalformedStep(format!(
                        "brain {}: discrete action {} out of range",
                        brain.name, value
                    )))
                }
            }
            ActionKind::Continuous => Ok(Action::Continuous(row.to_vec())),
        })
        .collect::<Result<Vec<_>>>()?;

    let local_done = if batch.local_done.is_empty() {
        vec![false; agents]
    } else {
        batch.local_done
    };

    Ok(AgentBatch {
        states,
        previous_actions,
        rewards: batch.rewards,
        local_done,
    })
}
