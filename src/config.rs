// Engine configuration: optimization level, per-pass tuning knobs, and the
// disassembly flag. Constructible in code or loaded from a `.ron` document,
// mirroring `v1::load`'s `ron::de::from_reader` pattern.

use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io;

#[derive(Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    O3,
}

impl OptLevel {
    pub fn includes(self, level: OptLevel) -> bool {
        self >= level
    }
}

impl Default for OptLevel {
    fn default() -> OptLevel {
        OptLevel::O0
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub opt_level: OptLevel,
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: usize,
    #[serde(default = "default_unroll_threshold")]
    pub unroll_threshold: usize,
    #[serde(default)]
    pub disabled_passes: HashSet<String>,
    #[serde(default)]
    pub disassemble: bool,
}

fn default_inline_threshold() -> usize {
    24
}

fn default_unroll_threshold() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            opt_level: OptLevel::default(),
            inline_threshold: default_inline_threshold(),
            unroll_threshold: default_unroll_threshold(),
            disabled_passes: HashSet::new(),
            disassemble: false,
        }
    }
}

impl EngineConfig {
    pub fn pass_enabled(&self, name: &str) -> bool {
        !self.disabled_passes.contains(name)
    }

    pub fn from_ron_str(text: &str) -> Result<EngineConfig, ron::error::SpannedError> {
        ron::de::from_str(text)
    }

    pub fn load(path: &str) -> io::Result<EngineConfig> {
        let reader = File::open(path)?;
        ron::de::from_reader(reader)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_opt_level_is_o0() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.opt_level, OptLevel::O0);
        assert!(cfg.pass_enabled("constant_folding"));
    }

    #[test]
    fn test_opt_level_includes_lower_levels() {
        assert!(OptLevel::O2.includes(OptLevel::O1));
        assert!(!OptLevel::O1.includes(OptLevel::O2));
    }

    #[test]
    fn test_loads_from_ron_document() {
        let text = r#"(
            opt_level: O2,
            inline_threshold: 40,
            disabled_passes: ["loop_unrolling"],
        )"#;
        let cfg = EngineConfig::from_ron_str(text).unwrap();
        assert_eq!(cfg.opt_level, OptLevel::O2);
        assert_eq!(cfg.inline_threshold, 40);
        assert!(!cfg.pass_enabled("loop_unrolling"));
        assert!(cfg.pass_enabled("constant_folding"));
    }
}
