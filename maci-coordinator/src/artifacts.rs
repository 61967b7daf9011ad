//! Circuit artifact naming.
//!
//! Circuits are published per family, e.g. `ProcessMessages_10-2-1-2` for
//! quadratic voting and `ProcessMessagesNonQv_10-2-1-2` otherwise. Each
//! family directory holds the proving key, the wasm witness generator and
//! a native witness generator.

use std::path::{Path, PathBuf};

use crate::error::{CoordinatorError, CoordinatorResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactSet {
    pub family: String,
    pub zkey: PathBuf,
    pub wasm: PathBuf,
    pub witness_generator: PathBuf,
}

/// Witness generator available for a family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WitnessGenerator {
    Native(PathBuf),
    /// The wasm build, run through the family's `generate_witness.js`.
    Wasm { wasm: PathBuf, script: PathBuf },
}

impl ArtifactSet {
    /// Check the proving key and pick a witness generator, preferring the
    /// native one. Fails with `ArtifactNotFound` naming the first missing
    /// file.
    pub async fn ensure_present(&self) -> CoordinatorResult<WitnessGenerator> {
        if !exists(&self.zkey).await {
            return Err(not_found(&self.zkey));
        }
        if exists(&self.witness_generator).await {
            return Ok(WitnessGenerator::Native(self.witness_generator.clone()));
        }
        if exists(&self.wasm).await {
            let script = self.wasm.with_file_name("generate_witness.js");
            if !exists(&script).await {
                return Err(not_found(&script));
            }
            return Ok(WitnessGenerator::Wasm {
                wasm: self.wasm.clone(),
                script,
            });
        }
        Err(not_found(&self.witness_generator))
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn not_found(path: &Path) -> CoordinatorError {
    CoordinatorError::ArtifactNotFound(path.display().to_string())
}

#[derive(Clone, Debug)]
pub struct ArtifactResolver {
    root: PathBuf,
}

impl ArtifactResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a circuit base name to its artifact paths. Nothing is read from
    /// disk here.
    pub fn resolve(&self, base_name: &str, quadratic_voting: bool) -> CoordinatorResult<ArtifactSet> {
        let family = family_name(base_name, quadratic_voting)?;
        let dir = self.root.join(&family);
        Ok(ArtifactSet {
            zkey: dir.join(format!("{}.0.zkey", family)),
            wasm: dir
                .join(format!("{}_js", family))
                .join(format!("{}.wasm", family)),
            witness_generator: dir.join(format!("{}_cpp", family)).join(&family),
            family,
        })
    }
}

pub fn family_name(base_name: &str, quadratic_voting: bool) -> CoordinatorResult<String> {
    let (circuit_type, params) = base_name.split_once('_').ok_or_else(|| {
        CoordinatorError::Config(format!(
            "circuit name '{}' must look like <type>_<params>",
            base_name
        ))
    })?;
    if circuit_type.is_empty() || params.is_empty() {
        return Err(CoordinatorError::Config(format!(
            "circuit name '{}' must look like <type>_<params>",
            base_name
        )));
    }
    let mode = if quadratic_voting { "" } else { "NonQv" };
    Ok(format!("{}{}_{}", circuit_type, mode, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_names() {
        assert_eq!(
            family_name("ProcessMessages_10-2-1-2", true).unwrap(),
            "ProcessMessages_10-2-1-2"
        );
        assert_eq!(
            family_name("ProcessMessages_10-2-1-2", false).unwrap(),
            "ProcessMessagesNonQv_10-2-1-2"
        );
        assert_eq!(
            family_name("TallyVotes_10-1-2", false).unwrap(),
            "TallyVotesNonQv_10-1-2"
        );
    }

    #[test]
    fn test_only_first_underscore_splits() {
        assert_eq!(
            family_name("ProcessMessages_10_2", false).unwrap(),
            "ProcessMessagesNonQv_10_2"
        );
    }

    #[test]
    fn test_names_without_params_are_rejected() {
        assert!(matches!(
            family_name("ProcessMessages", true),
            Err(CoordinatorError::Config(_))
        ));
        assert!(family_name("_10-2", true).is_err());
    }

    #[test]
    fn test_paths_follow_family_layout() {
        let resolver = ArtifactResolver::new("/zkeys");
        let set = resolver.resolve("TallyVotes_10-1-2", true).unwrap();
        assert_eq!(set.zkey, PathBuf::from("/zkeys/TallyVotes_10-1-2/TallyVotes_10-1-2.0.zkey"));
        assert_eq!(
            set.wasm,
            PathBuf::from("/zkeys/TallyVotes_10-1-2/TallyVotes_10-1-2_js/TallyVotes_10-1-2.wasm")
        );
        assert_eq!(
            set.witness_generator,
            PathBuf::from("/zkeys/TallyVotes_10-1-2/TallyVotes_10-1-2_cpp/TallyVotes_10-1-2")
        );
    }

    #[tokio::test]
    async fn test_missing_files_surface_at_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let set = ArtifactResolver::new(dir.path()).resolve("TallyVotes_1-1", true).unwrap();
        let err = set.ensure_present().await.unwrap_err();
        assert_eq!(err.error_code(), "ARTIFACT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_native_generator_is_preferred_over_wasm() {
        let dir = tempfile::tempdir().unwrap();
        let set = ArtifactResolver::new(dir.path()).resolve("TallyVotes_1-1", true).unwrap();
        for path in [&set.zkey, &set.wasm, &set.witness_generator] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"x").unwrap();
        }
        assert_eq!(
            set.ensure_present().await.unwrap(),
            WitnessGenerator::Native(set.witness_generator.clone())
        );

        // Without the native build the wasm one needs its runner script.
        std::fs::remove_file(&set.witness_generator).unwrap();
        let err = set.ensure_present().await.unwrap_err();
        assert!(err.to_string().contains("generate_witness.js"));

        let script = set.wasm.with_file_name("generate_witness.js");
        std::fs::write(&script, b"// runner").unwrap();
        assert_eq!(
            set.ensure_present().await.unwrap(),
            WitnessGenerator::Wasm {
                wasm: set.wasm.clone(),
                script
            }
        );
    }
}
