//! Frozen inference graph: the trained policy plus everything needed to run it

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use burn::module::{AutodiffModule, Module};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use prost::Message;
use prost::bytes::BytesMut;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::bc::policy::{self, NetworkConfig, Policy, PolicyNet};
use crate::env::{Action, ActionKind};
use crate::error::{Error, Result};
use crate::proto::graph::{ActionKind as ProtoActionKind, FrozenGraph};

/// Name of the graph output that yields actions
pub const TARGET_NODE: &str = "action";

pub const GRAPH_EXTENSION: &str = "bytes";

/// Write `<dir>/<graph_name>.bytes` holding the inference-only policy
pub fn export_graph<B: AutodiffBackend>(
    policy: &Policy<B>,
    dir: &Path,
    graph_name: &str,
) -> Result<PathBuf> {
    let config = policy.config();
    let net = policy.network().valid();

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let parameters = Recorder::<B::InnerBackend>::record(&recorder, net.into_record(), ())?;

    let graph = FrozenGraph {
        name: graph_name.to_string(),
        target_node: TARGET_NODE.to_string(),
        action_kind: match policy.kind() {
            ActionKind::Discrete => ProtoActionKind::Discrete,
            ActionKind::Continuous => ProtoActionKind::Continuous,
        } as i32,
        state_size: dimension(config.state_size)?,
        action_size: dimension(config.action_size)?,
        hidden_units: dimension(config.hidden_units)?,
        num_layers: dimension(config.num_layers)?,
        exported_at: timestamp(),
        parameters,
    };

    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.{}", graph_name, GRAPH_EXTENSION));
    let mut file = File::create(&path)?;
    write_delimited_message(&mut file, &graph)?;

    tracing::info!(
        "Exported graph {} ({} bytes of parameters) to {}",
        graph_name,
        graph.parameters.len(),
        path.display()
    );
    Ok(path)
}

fn write_delimited_message<T: Message, W: Write>(out: &mut W, message: &T) -> Result<()> {
    let mut buf = Vec::new();
    message.encode(&mut buf).map_err(std::io::Error::other)?;

    let mut varint_buf = BytesMut::new();
    prost::encode_length_delimiter(buf.len(), &mut varint_buf)
        .map_err(std::io::Error::other)?;

    out.write_all(&varint_buf)?;
    out.write_all(&buf)?;
    out.flush()?;
    Ok(())
}

fn dimension(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Config(format!("{} does not fit a graph header", value)))
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&Rfc3339).unwrap_or_default()
}

/// An exported graph loaded back for inference
pub struct FrozenPolicy<B: Backend> {
    pub graph: FrozenGraph,
    net: PolicyNet<B>,
    kind: ActionKind,
    config: NetworkConfig,
    device: B::Device,
}

impl<B: Backend> FrozenPolicy<B> {
    pub fn load(path: &Path, device: &B::Device) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        let graph = FrozenGraph::decode_length_delimited(bytes.as_slice())?;

        let kind = match ProtoActionKind::try_from(graph.action_kind) {
            Ok(ProtoActionKind::Discrete) => ActionKind::Discrete,
            Ok(ProtoActionKind::Continuous) => ActionKind::Continuous,
            Err(_) => {
                return Err(Error::Config(format!(
                    "unknown action kind {} in {}",
                    graph.action_kind,
                    path.display()
                )));
            }
        };

        // Dropout is inert outside autodiff, its rate does not matter here
        let config = NetworkConfig::new(graph.state_size as usize, graph.action_size as usize)
            .with_hidden_units(graph.hidden_units as usize)
            .with_num_layers(graph.num_layers as usize);

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, graph.parameters.clone(), device)?;
        let net = config.init::<B>(device).load_record(record);

        tracing::info!("Loaded graph {} from {}", graph.name, path.display());
        Ok(Self {
            graph,
            net,
            kind,
            config,
            device: device.clone(),
        })
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn act<S: AsRef<[f32]>>(&self, states: &[S]) -> Result<Vec<Action>> {
        policy::act(&self.net, self.kind, &self.config, states, &self.device)
    }
}
