//! Checkpoint persistence for the network's [`VarMap`].
//!
//! Checkpoints are safetensors files holding every variable by name:
//! convolution kernels, batch-norm scale/shift/running statistics and the
//! two dense layers.

use candle_core::Device;
use candle_nn::VarMap;
use mixverify_core::{Result, VerifierError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

fn checkpoint_err(path: &Path, reason: impl std::fmt::Display) -> VerifierError {
    VerifierError::CheckpointIo {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// `<dir>/epoch_<n>.safetensors`
pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("epoch_{epoch}.safetensors"))
}

/// Write every variable, creating parent directories as needed.
pub fn save_checkpoint(varmap: &VarMap, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| checkpoint_err(path, e))?;
    }
    varmap.save(path).map_err(|e| checkpoint_err(path, e))?;
    tracing::info!(path = %path.display(), "Checkpoint saved");
    Ok(())
}

/// Restore every variable; names and shapes must match exactly.
pub fn load_checkpoint(varmap: &mut VarMap, path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(checkpoint_err(path, "file not found"));
    }
    let stored: BTreeSet<String> = checkpoint_entries(path)?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    let expected: BTreeSet<String> = varmap
        .data()
        .lock()
        .map_err(|_| checkpoint_err(path, "variable map lock poisoned"))?
        .keys()
        .cloned()
        .collect();
    let missing: Vec<&String> = expected.difference(&stored).collect();
    let extra: Vec<&String> = stored.difference(&expected).collect();
    if !missing.is_empty() || !extra.is_empty() {
        return Err(checkpoint_err(
            path,
            format!("parameter names differ (missing: {missing:?}, unexpected: {extra:?})"),
        ));
    }
    varmap.load(path).map_err(|e| checkpoint_err(path, e))?;
    tracing::info!(path = %path.display(), "Checkpoint loaded");
    Ok(())
}

/// Copy selected tensors from a checkpoint into differently named variables.
///
/// `mapping` pairs a name in the file with a name in `varmap`; `device` must
/// be the device the variables live on. Returns the number of variables
/// written.
pub fn load_renamed(
    varmap: &mut VarMap,
    path: &Path,
    mapping: &[(String, String)],
    device: &Device,
) -> Result<usize> {
    let tensors =
        candle_core::safetensors::load(path, device).map_err(|e| checkpoint_err(path, e))?;
    for (source, target) in mapping {
        let tensor = tensors
            .get(source)
            .ok_or_else(|| checkpoint_err(path, format!("no tensor named {source}")))?;
        varmap
            .set_one(target, tensor)
            .map_err(|e| checkpoint_err(path, format!("{source} -> {target}: {e}")))?;
    }
    tracing::info!(
        path = %path.display(),
        tensors = mapping.len(),
        "Renamed checkpoint tensors loaded"
    );
    Ok(mapping.len())
}

/// Names and shapes stored in a checkpoint, sorted by name.
pub fn checkpoint_entries(path: &Path) -> Result<Vec<(String, Vec<usize>)>> {
    let bytes = std::fs::read(path).map_err(|e| checkpoint_err(path, e))?;
    let file = safetensors::SafeTensors::deserialize(&bytes).map_err(|e| checkpoint_err(path, e))?;
    let mut entries: Vec<(String, Vec<usize>)> = file
        .tensors()
        .into_iter()
        .map(|(name, view)| (name, view.shape().to_vec()))
        .collect();
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn varmap_with(names: &[(&str, usize)]) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for (name, len) in names {
            vb.get_with_hints(*len, name, Init::Randn { mean: 0.0, stdev: 1.0 })
                .unwrap();
        }
        varmap
    }

    fn values(varmap: &VarMap, name: &str) -> Vec<f32> {
        varmap.data().lock().unwrap()[name].as_tensor().to_vec1().unwrap()
    }

    #[test]
    fn test_checkpoint_path() {
        assert_eq!(
            checkpoint_path(Path::new("runs/a"), 3),
            PathBuf::from("runs/a/epoch_3.safetensors")
        );
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run/epoch_0.safetensors");
        let saved = varmap_with(&[("w", 5), ("b", 2)]);
        save_checkpoint(&saved, &path).unwrap();
        assert!(path.is_file());

        let mut restored = varmap_with(&[("w", 5), ("b", 2)]);
        assert_ne!(values(&saved, "w"), values(&restored, "w"));
        load_checkpoint(&mut restored, &path).unwrap();
        assert_eq!(values(&saved, "w"), values(&restored, "w"));
        assert_eq!(values(&saved, "b"), values(&restored, "b"));
    }

    #[test]
    fn test_load_rejects_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        save_checkpoint(&varmap_with(&[("w", 5)]), &path).unwrap();

        let mut other = varmap_with(&[("w", 4)]);
        let err = load_checkpoint(&mut other, &path).unwrap_err();
        assert!(matches!(err, VerifierError::CheckpointIo { .. }));
    }

    #[test]
    fn test_load_rejects_missing_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        save_checkpoint(&varmap_with(&[("w", 5)]), &path).unwrap();

        let mut other = varmap_with(&[("w", 5), ("extra", 3)]);
        let err = load_checkpoint(&mut other, &path).unwrap_err();
        assert!(matches!(err, VerifierError::CheckpointIo { ref reason, .. } if reason.contains("extra")));
        assert!(load_checkpoint(&mut other, &dir.path().join("absent.safetensors")).is_err());
    }

    #[test]
    fn test_load_rejects_unexpected_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        save_checkpoint(&varmap_with(&[("w", 5), ("stage9.extra", 3)]), &path).unwrap();

        let mut other = varmap_with(&[("w", 5)]);
        let before = values(&other, "w");
        let err = load_checkpoint(&mut other, &path).unwrap_err();
        match err {
            VerifierError::CheckpointIo { reason, .. } => assert!(reason.contains("stage9.extra")),
            e => panic!("unexpected error: {e:?}"),
        }
        assert_eq!(values(&other, "w"), before);
    }

    #[test]
    fn test_save_into_unwritable_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let err = save_checkpoint(&varmap_with(&[("w", 1)]), &blocker.join("epoch_0.safetensors"))
            .unwrap_err();
        assert!(matches!(err, VerifierError::CheckpointIo { .. }));
    }

    #[test]
    fn test_load_renamed_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let source = varmap_with(&[("old.w", 3), ("old.unused", 2)]);
        save_checkpoint(&source, &path).unwrap();

        let mut target = varmap_with(&[("new.w", 3), ("new.other", 2)]);
        let before_other = values(&target, "new.other");
        let mapping = vec![("old.w".to_string(), "new.w".to_string())];
        assert_eq!(load_renamed(&mut target, &path, &mapping, &Device::Cpu).unwrap(), 1);
        assert_eq!(values(&target, "new.w"), values(&source, "old.w"));
        assert_eq!(values(&target, "new.other"), before_other);

        let bad = vec![("missing".to_string(), "new.w".to_string())];
        assert!(load_renamed(&mut target, &path, &bad, &Device::Cpu).is_err());
    }

    #[test]
    fn test_checkpoint_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        save_checkpoint(&varmap_with(&[("z", 4), ("a", 2)]), &path).unwrap();
        let entries = checkpoint_entries(&path).unwrap();
        assert_eq!(
            entries,
            vec![("a".to_string(), vec![2]), ("z".to_string(), vec![4])]
        );
    }
}
