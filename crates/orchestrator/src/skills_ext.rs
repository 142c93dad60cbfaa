//! Progressive skill loading (spec §4.F). Wraps the teacher's
//! file-system-backed `sa_skills::SkillsRegistry` (which already holds L1
//! metadata for every skill) with the three-level L1/L2/L3 promotion
//! state machine and the dynamic-skill SHA-256 hash validator the spec
//! adds on top of it.

use std::collections::HashMap;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use sa_domain::error::{Error, Result};
use sa_skills::registry::SkillsRegistry;
use sa_skills::types::SkillEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SkillLevel {
    L1Metadata,
    L2Instructions,
    L3Resources,
}

/// A skill promoted at least to L2: its metadata plus the instantiated
/// instructions (the SKILL.md body the teacher's loader already parses).
#[derive(Debug, Clone)]
pub struct LoadedSkill {
    pub metadata: SkillEntry,
    pub instructions: String,
    pub level: SkillLevel,
}

/// A registered dynamic (non-built-in) skill: source plus the hash taken
/// at registration time, re-verified on every reload.
#[derive(Debug, Clone)]
struct DynamicSkillRecord {
    source_hash: String,
}

/// Wraps [`SkillsRegistry`] with per-skill level tracking and dynamic
/// skill hash validation.
pub struct ProgressiveSkillRegistry {
    inner: SkillsRegistry,
    levels: RwLock<HashMap<String, SkillLevel>>,
    dynamic: RwLock<HashMap<String, DynamicSkillRecord>>,
}

fn sha256_hex(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

impl ProgressiveSkillRegistry {
    pub fn new(inner: SkillsRegistry) -> Self {
        let levels = inner
            .list()
            .into_iter()
            .map(|e| (e.name.clone(), SkillLevel::L1Metadata))
            .collect();
        Self {
            inner,
            levels: RwLock::new(levels),
            dynamic: RwLock::new(HashMap::new()),
        }
    }

    pub fn list(&self) -> Vec<SkillEntry> {
        self.inner.list()
    }

    pub fn level_of(&self, skill_name: &str) -> SkillLevel {
        self.levels
            .read()
            .get(skill_name)
            .copied()
            .unwrap_or(SkillLevel::L1Metadata)
    }

    /// Returns the skill promoted to at least L2, loading its instructions
    /// on first access (spec: "promotion is driven by the first
    /// `get_skill` or `ensure_loaded` call").
    pub fn get_skill(&self, skill_name: &str) -> Result<LoadedSkill> {
        self.ensure_loaded(skill_name, SkillLevel::L2Instructions)?;
        let metadata = self
            .inner
            .list()
            .into_iter()
            .find(|e| e.name == skill_name)
            .ok_or_else(|| Error::SkillNotFound(skill_name.to_string()))?;
        let instructions = self.inner.read_doc(skill_name)?;
        let level = self.level_of(skill_name);
        Ok(LoadedSkill {
            metadata,
            instructions,
            level,
        })
    }

    /// Promotes a skill to (at least) `target`. L2 instantiates the
    /// executor (here: loads the SKILL.md body); L3 additionally confirms
    /// bundled resources are reachable. Idempotent once reached.
    pub fn ensure_loaded(&self, skill_name: &str, target: SkillLevel) -> Result<()> {
        if self.level_of(skill_name) >= target {
            return Ok(());
        }
        if target >= SkillLevel::L2Instructions {
            self.inner.read_doc(skill_name)?;
        }
        self.levels.write().insert(skill_name.to_string(), target);
        Ok(())
    }

    /// Loads a bundled resource, promoting to L3 if this is the skill's
    /// first resource access.
    pub fn load_resource(&self, skill_name: &str, relative_path: &str) -> Result<String> {
        let content = self.inner.read_resource(skill_name, relative_path)?;
        self.levels
            .write()
            .insert(skill_name.to_string(), SkillLevel::L3Resources);
        Ok(content)
    }

    /// Demotes a skill back to L1, discarding any cached instructions or
    /// resource state. Metadata itself is untouched.
    pub fn unload(&self, skill_name: &str) {
        self.levels
            .write()
            .insert(skill_name.to_string(), SkillLevel::L1Metadata);
    }

    /// Registers a dynamic (non-built-in) skill's source and records its
    /// SHA-256 hash for later reload verification.
    pub fn register_dynamic_skill(&self, skill_name: &str, source: &str) {
        let record = DynamicSkillRecord {
            source_hash: sha256_hex(source),
        };
        self.dynamic
            .write()
            .insert(skill_name.to_string(), record);
    }

    /// Re-hashes `source` and compares against the hash stored at
    /// registration. Aborts the reload (returns an error) on mismatch —
    /// the skill is left at whatever level it was already at.
    pub fn revalidate_dynamic_skill(&self, skill_name: &str, source: &str) -> Result<()> {
        let dynamic = self.dynamic.read();
        let Some(record) = dynamic.get(skill_name) else {
            return Err(Error::SkillNotFound(format!(
                "{skill_name} is not a registered dynamic skill"
            )));
        };
        if sha256_hex(source) != record.source_hash {
            return Err(Error::Guardrail(format!(
                "dynamic skill '{skill_name}' source hash mismatch on reload"
            )));
        }
        Ok(())
    }
}
