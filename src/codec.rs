// Model bundle codec.
//
// A trained model persists as three named artifacts:
//   model/topology  JSON { layers, weightManifest }
//   model/weights   raw little-endian f32 bytes, manifest order, no gaps
//   model/metadata  JSON { vocabulary, intents, responses, version }
//
// Write packs every weight in manifest order and checks the exact-length
// invariant (which also guarantees 4-byte alignment). Read rebuilds the
// network from the topology and restores each array by name; a shortfall
// of weight data is fatal, a surplus is tolerated but logged.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::network::{IntentNet, LayerSpec, Topology, WeightSpec};
use crate::store::{BundleStore, METADATA_ARTIFACT, TOPOLOGY_ARTIFACT, WEIGHTS_ARTIFACT};

pub const BUNDLE_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyDoc {
    pub layers: Vec<LayerSpec>,
    pub weight_manifest: Vec<WeightSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataDoc {
    pub vocabulary: HashMap<String, u32>,
    pub intents: Vec<String>,
    pub responses: HashMap<String, Vec<String>>,
    pub version: String,
}

/// A fully reassembled model plus everything inference needs around it.
pub struct ReadyModel {
    pub net: IntentNet,
    pub varmap: VarMap,
    pub vocabulary: HashMap<String, u32>,
    pub intents: Vec<String>,
    pub responses: HashMap<String, Vec<String>>,
}

impl std::fmt::Debug for ReadyModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyModel")
            .field("vocabulary", &self.vocabulary.len())
            .field("intents", &self.intents)
            .field("responses", &self.responses.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

pub fn write_bundle(
    store: &dyn BundleStore,
    topology: &Topology,
    varmap: &VarMap,
    metadata: &MetadataDoc,
) -> Result<(), EngineError> {
    let manifest = topology.weight_specs();
    let blob = pack_weights(varmap, &manifest)?;

    let expected_bytes = 4 * manifest.iter().map(WeightSpec::element_count).sum::<usize>();
    if blob.len() != expected_bytes {
        return Err(EngineError::InvalidBundle(format!(
            "packed weight blob is {} bytes, manifest requires {expected_bytes}",
            blob.len()
        )));
    }

    let topo_doc = TopologyDoc {
        layers: topology.layers.clone(),
        weight_manifest: manifest,
    };
    let topo_json = serde_json::to_vec_pretty(&topo_doc)
        .map_err(|e| EngineError::InvalidBundle(format!("topology serialization failed: {e}")))?;
    let meta_json = serde_json::to_vec_pretty(metadata)
        .map_err(|e| EngineError::InvalidBundle(format!("metadata serialization failed: {e}")))?;

    // The three artifacts replace each other as a set; a failed put aborts
    // the remaining writes so a reader never sees a half-new bundle.
    store.put(TOPOLOGY_ARTIFACT, &topo_json)?;
    store.put(WEIGHTS_ARTIFACT, &blob)?;
    store.put(METADATA_ARTIFACT, &meta_json)?;

    eprintln!(
        "[codec] wrote bundle: {} arrays, {} bytes of weights, {} intents",
        topo_doc.weight_manifest.len(),
        blob.len(),
        metadata.intents.len()
    );
    Ok(())
}

fn pack_weights(varmap: &VarMap, manifest: &[WeightSpec]) -> Result<Vec<u8>, EngineError> {
    let vars = varmap.data().lock().unwrap();
    let mut blob = Vec::new();
    for spec in manifest {
        let var = vars.get(&spec.name).ok_or_else(|| {
            EngineError::InvalidBundle(format!(
                "variable '{}' missing from the trained model",
                spec.name
            ))
        })?;
        let values: Vec<f32> = var.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        if values.len() != spec.element_count() {
            return Err(EngineError::InvalidBundle(format!(
                "variable '{}' holds {} floats, manifest says {}",
                spec.name,
                values.len(),
                spec.element_count()
            )));
        }
        for v in values {
            blob.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(blob)
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

pub fn read_bundle(store: &dyn BundleStore, device: &Device) -> Result<ReadyModel, EngineError> {
    let meta_bytes = store.get(METADATA_ARTIFACT)?;
    let metadata: MetadataDoc = serde_json::from_slice(&meta_bytes)
        .map_err(|e| EngineError::InvalidBundle(format!("metadata parse failed: {e}")))?;
    if metadata.vocabulary.is_empty() {
        return Err(EngineError::InvalidBundle(
            "bundle vocabulary is empty".to_string(),
        ));
    }
    if metadata.intents.is_empty() {
        return Err(EngineError::InvalidBundle(
            "bundle lists no intents".to_string(),
        ));
    }
    if metadata.version != BUNDLE_VERSION {
        eprintln!(
            "[codec] bundle version '{}' differs from supported '{BUNDLE_VERSION}', loading anyway",
            metadata.version
        );
    }

    let topo_bytes = store.get(TOPOLOGY_ARTIFACT)?;
    let doc: TopologyDoc = serde_json::from_slice(&topo_bytes)
        .map_err(|e| EngineError::InvalidBundle(format!("topology parse failed: {e}")))?;
    if doc.weight_manifest.is_empty() {
        return Err(EngineError::InvalidBundle(
            "weight manifest is absent or empty".to_string(),
        ));
    }

    let blob = store.get(WEIGHTS_ARTIFACT)?;
    let floats = bytes_to_floats(&blob);
    let expected: usize = doc.weight_manifest.iter().map(WeightSpec::element_count).sum();
    if floats.len() < expected {
        return Err(EngineError::InsufficientWeightData {
            expected,
            actual: floats.len(),
        });
    }
    if floats.len() > expected {
        eprintln!(
            "[codec] weight blob carries {} floats, manifest needs {expected}; ignoring trailing surplus",
            floats.len()
        );
    }

    // Rebuild the architecture from the dimensions the metadata dictates;
    // the stored layer list should agree with it.
    let topology = Topology::for_model(metadata.vocabulary.len(), metadata.intents.len());
    if doc.layers != topology.layers {
        eprintln!("[codec] stored layer list differs from the rebuilt topology");
    }
    let varmap = VarMap::new();
    let net = IntentNet::build(&topology, &varmap, device)?;

    // Manifest-order restore. Slices are consumed from offset 0 with no
    // gaps; a name the fresh model does not know is a hard error rather
    // than a silently garbled model.
    {
        let vars = varmap.data().lock().unwrap();
        let mut offset = 0usize;
        for spec in &doc.weight_manifest {
            let count = spec.element_count();
            let slice = floats[offset..offset + count].to_vec();
            offset += count;
            let tensor = Tensor::from_vec(slice, spec.shape.as_slice(), device)?;
            let var = vars.get(&spec.name).ok_or_else(|| {
                EngineError::InvalidBundle(format!(
                    "manifest names unknown variable '{}'",
                    spec.name
                ))
            })?;
            var.set(&tensor)?;
        }
    }

    eprintln!(
        "[codec] restored {} arrays ({} floats), vocab={}, intents={}",
        doc.weight_manifest.len(),
        expected,
        metadata.vocabulary.len(),
        metadata.intents.len()
    );

    Ok(ReadyModel {
        net,
        varmap,
        vocabulary: metadata.vocabulary,
        intents: metadata.intents,
        responses: metadata.responses,
    })
}

/// Reinterpret raw bytes as little-endian f32s, zero-padding up to the next
/// 4-byte multiple first. Write never produces a misaligned blob, but a
/// reader must survive one.
fn bytes_to_floats(bytes: &[u8]) -> Vec<f32> {
    let mut buf = bytes.to_vec();
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
    buf.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
