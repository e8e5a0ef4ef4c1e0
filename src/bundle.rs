/*!
Model bundles: a model's descriptor, its fitted input scaler and its learned weights in a single file.

A bundle is laid out as

```text
magic    8 bytes   "STKFMR01"
length   8 bytes   little-endian u64, the JSON header length
header   length    JSON `BundleHeader`
weights  rest      the `VarStore` tensor stream
```

so a model can be rebuilt from the file alone, without knowing its hyperparameters in advance.
*/
use crate::data::scale::MinMaxScaler;
use crate::data::Pipeline;
use crate::model::{StockTransformer, StockTransformerDesc};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::collections::HashSet;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;
use tch::{nn::VarStore, Device, Tensor};
use tracing::{debug, info};

/// The magic bytes at the start of every bundle
pub const MAGIC: &[u8; 8] = b"STKFMR01";

/// The current bundle header version
pub const VERSION: u32 = 2;

/// Headers larger than this are rejected rather than allocated
const MAX_HEADER_LEN: u64 = 1 << 20;

/// The architecture metadata stored ahead of a bundle's weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleHeader {
    /// The header version
    pub version: u32,
    /// The descriptor of the bundled model
    pub model: StockTransformerDesc,
    /// The scaler fitted to the model's training data, if any
    pub scaler: Option<MinMaxScaler>,
    /// The preprocessing the model's training data went through before scaling
    pub pipeline: Pipeline,
}

/// A model rebuilt from a bundle
pub struct LoadedModel {
    /// The bundle's header
    pub header: BundleHeader,
    /// The variables backing `model`
    pub vs: VarStore,
    /// The rebuilt model
    pub model: StockTransformer,
}

impl LoadedModel {
    /// Check that `pipeline` is the preprocessing this model was trained with
    pub fn expect_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        if &self.header.pipeline == pipeline {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "bundle was trained with {:?}, but {:?} was requested",
                self.header.pipeline, pipeline
            )))
        }
    }
}

/// Write a bundle to a Writer
pub fn write<W: Write>(
    mut wtr: W,
    desc: &StockTransformerDesc,
    scaler: Option<&MinMaxScaler>,
    pipeline: Pipeline,
    vs: &VarStore,
) -> Result<()> {
    let header = BundleHeader {
        version: VERSION,
        model: desc.clone(),
        scaler: scaler.copied(),
        pipeline,
    };
    let header = serde_json::to_vec(&header)?;
    wtr.write_all(MAGIC)?;
    wtr.write_all(&(header.len() as u64).to_le_bytes())?;
    wtr.write_all(&header)?;
    let mut weights = Vec::new();
    vs.save_to_stream(&mut weights)?;
    wtr.write_all(&weights)?;
    wtr.flush()?;
    Ok(())
}

/// Read a bundle from a Reader, rebuilding its model on `device`.
///
/// The weights must match the header's architecture exactly: a missing tensor and a tensor no variable of the
/// rebuilt model accounts for are both errors.
pub fn read<R: Read>(mut rdr: R, device: Device) -> Result<LoadedModel> {
    let mut magic = [0u8; 8];
    rdr.read_exact(&mut magic)
        .map_err(|err| Error::Bundle(format!("truncated bundle: {}", err)))?;
    if &magic != MAGIC {
        return Err(Error::Bundle("missing bundle magic".into()));
    }
    let mut len = [0u8; 8];
    rdr.read_exact(&mut len)
        .map_err(|err| Error::Bundle(format!("truncated bundle: {}", err)))?;
    let len = u64::from_le_bytes(len);
    if len > MAX_HEADER_LEN {
        return Err(Error::Bundle(format!("header of {} bytes is too large", len)));
    }
    let mut header = vec![0u8; len as usize];
    rdr.read_exact(&mut header)
        .map_err(|err| Error::Bundle(format!("truncated bundle header: {}", err)))?;
    let header: BundleHeader = serde_json::from_slice(&header)?;
    if header.version != VERSION {
        return Err(Error::Bundle(format!(
            "unsupported bundle version {}",
            header.version
        )));
    }
    debug!("Rebuilding model from bundle: {:?}", header.model);
    let mut vs = VarStore::new(device);
    let model = header.model.build(&vs.root())?;
    let mut weights = Vec::new();
    rdr.read_to_end(&mut weights)?;
    let stored = Tensor::load_multi_from_stream(Cursor::new(&weights[..]))
        .map_err(|err| Error::Bundle(format!("could not read bundled weights: {}", err)))?;
    let expected: HashSet<String> = vs.variables().into_keys().collect();
    if let Some((name, _)) = stored.iter().find(|(name, _)| !expected.contains(name)) {
        return Err(Error::Bundle(format!(
            "bundled tensor {} does not belong to the described model",
            name
        )));
    }
    vs.load_from_stream(Cursor::new(weights))
        .map_err(|err| Error::Bundle(format!("could not load bundled weights: {}", err)))?;
    Ok(LoadedModel { header, vs, model })
}

/// Save a bundle to a file
pub fn save<P: AsRef<Path>>(
    path: P,
    desc: &StockTransformerDesc,
    scaler: Option<&MinMaxScaler>,
    pipeline: Pipeline,
    vs: &VarStore,
) -> Result<()> {
    let file = File::create(path.as_ref())?;
    write(BufWriter::new(file), desc, scaler, pipeline, vs)?;
    info!("Saved model bundle to {}", path.as_ref().display());
    Ok(())
}

/// Load a bundle from a file
pub fn load<P: AsRef<Path>>(path: P, device: Device) -> Result<LoadedModel> {
    let file = File::open(path.as_ref())?;
    let loaded = read(BufReader::new(file), device)?;
    info!("Loaded model bundle from {}", path.as_ref().display());
    Ok(loaded)
}

/// Load a bundle from a file, requiring its model to take windows of `seq_len` steps
pub fn load_expecting<P: AsRef<Path>>(path: P, device: Device, seq_len: usize) -> Result<LoadedModel> {
    let loaded = load(path, device)?;
    if loaded.header.model.seq_len != seq_len {
        return Err(Error::SeqLenMismatch {
            bundle: loaded.header.model.seq_len,
            runtime: seq_len,
        });
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EncoderDesc;
    use tch::{Kind, Tensor};

    fn desc() -> StockTransformerDesc {
        StockTransformerDesc {
            seq_len: 12,
            encoders: vec![
                EncoderDesc {
                    d_k: 8,
                    d_v: 4,
                    n_heads: 2,
                    ff_dim: 8,
                    dropout: 0.1,
                };
                2
            ],
            head_hidden: 4,
            ..Default::default()
        }
    }

    #[test]
    fn in_memory_roundtrip_preserves_outputs() {
        tch::manual_seed(21);
        let vs = VarStore::new(Device::Cpu);
        let model = desc().build(&vs.root()).unwrap();
        let scaler = MinMaxScaler::new(-0.02, 0.03).unwrap();
        let mut buf = Vec::new();
        let pipeline = Pipeline { moving_average: 5 };
        write(&mut buf, &model.desc, Some(&scaler), pipeline, &vs).unwrap();

        let loaded = read(&buf[..], Device::Cpu).unwrap();
        assert_eq!(loaded.header.model, model.desc);
        assert_eq!(loaded.header.scaler, Some(scaler));
        assert_eq!(loaded.header.pipeline, pipeline);
        let xs = Tensor::rand([3, 12, 4], (Kind::Float, Device::Cpu));
        assert_eq!(model.predict(&xs).unwrap(), loaded.model.predict(&xs).unwrap());
    }

    #[test]
    fn malformed_bundles_are_rejected() {
        let vs = VarStore::new(Device::Cpu);
        let model = desc().build(&vs.root()).unwrap();
        let mut buf = Vec::new();
        write(&mut buf, &model.desc, None, Pipeline::default(), &vs).unwrap();

        let mut bad_magic = buf.clone();
        bad_magic[0] = b'X';
        assert!(matches!(read(&bad_magic[..], Device::Cpu), Err(Error::Bundle(_))));
        assert!(matches!(read(&buf[..12], Device::Cpu), Err(Error::Bundle(_))));
        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[8..16]);
        let header_len = u64::from_le_bytes(len);
        let no_weights = &buf[..16 + header_len as usize];
        assert!(matches!(read(no_weights, Device::Cpu), Err(Error::Bundle(_))));
    }

    #[test]
    fn mismatched_architectures_are_rejected() {
        let vs = VarStore::new(Device::Cpu);
        let model = desc().build(&vs.root()).unwrap();
        let mut buf = Vec::new();
        // Weights for two encoders under a header claiming three
        let mut wider = model.desc.clone();
        wider.encoders.push(wider.encoders[0].clone());
        write(&mut buf, &wider, None, Pipeline::default(), &vs).unwrap();
        assert!(matches!(read(&buf[..], Device::Cpu), Err(Error::Bundle(_))));
    }

    #[test]
    fn surplus_weights_are_rejected() {
        let vs = VarStore::new(Device::Cpu);
        let model = desc().build(&vs.root()).unwrap();
        let mut buf = Vec::new();
        // Weights for two encoders under a header claiming one
        let mut narrower = model.desc.clone();
        narrower.encoders.pop();
        write(&mut buf, &narrower, None, Pipeline::default(), &vs).unwrap();
        match read(&buf[..], Device::Cpu) {
            Err(Error::Bundle(msg)) => assert!(msg.contains("encoder_1"), "{}", msg),
            _ => panic!("a truncated architecture should not load"),
        }
    }

    #[test]
    fn pipeline_mismatches_are_reported() {
        let vs = VarStore::new(Device::Cpu);
        let model = desc().build(&vs.root()).unwrap();
        let mut buf = Vec::new();
        let pipeline = Pipeline { moving_average: 5 };
        write(&mut buf, &model.desc, None, pipeline, &vs).unwrap();
        let loaded = read(&buf[..], Device::Cpu).unwrap();
        assert!(loaded.expect_pipeline(&pipeline).is_ok());
        assert!(matches!(
            loaded.expect_pipeline(&Pipeline::default()),
            Err(Error::Config(_))
        ));
    }
}
