//! Plugin factories and factory presets.
//!
//! Discovery and metadata parsing of third-party plugin binaries happen
//! outside the engine; whatever that subsystem finds is registered here as a
//! factory closure. The engine only ever asks the registry to instantiate a
//! URI and to list presets.

use crate::effect::Plugin;
use crate::effects::{Gain, Tremolo, GAIN_URI, TREMOLO_URI};
use pedalrig_core::{Error, Result};
use std::collections::BTreeMap;
use std::collections::HashMap;

type Factory = Box<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// A named factory preset: control symbol -> value.
#[derive(Clone, Debug, PartialEq)]
pub struct Preset {
    pub uri: String,
    pub name: String,
    pub values: BTreeMap<String, f32>,
}

struct Entry {
    factory: Factory,
    presets: Vec<Preset>,
}

/// URI -> plugin factory table.
pub struct PluginRegistry {
    entries: HashMap<String, Entry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in effects.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(GAIN_URI, || Box::new(Gain::new()));
        registry.add_preset(Preset {
            uri: format!("{GAIN_URI}#unity"),
            name: "Unity".into(),
            values: [("gain".to_string(), 0.0)].into_iter().collect(),
        });
        registry.add_preset(Preset {
            uri: format!("{GAIN_URI}#boost"),
            name: "Boost +6".into(),
            values: [("gain".to_string(), 6.0)].into_iter().collect(),
        });
        registry.register(TREMOLO_URI, || Box::new(Tremolo::new()));
        registry
    }

    pub fn register<F>(&mut self, uri: &str, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.entries.insert(
            uri.to_string(),
            Entry {
                factory: Box::new(factory),
                presets: Vec::new(),
            },
        );
    }

    /// Attaches a preset to its plugin (the part of `uri` before `#`).
    pub fn add_preset(&mut self, preset: Preset) {
        let plugin_uri = preset.uri.split('#').next().unwrap_or(&preset.uri);
        if let Some(entry) = self.entries.get_mut(plugin_uri) {
            entry.presets.push(preset);
        }
    }

    pub fn instantiate(&self, uri: &str) -> Result<Box<dyn Plugin>> {
        self.entries
            .get(uri)
            .map(|entry| (entry.factory)())
            .ok_or_else(|| Error::NotFound(format!("plugin not registered: {uri}")))
    }

    pub fn factory_presets(&self, plugin_uri: &str) -> Vec<Preset> {
        self.entries
            .get(plugin_uri)
            .map(|entry| entry.presets.clone())
            .unwrap_or_default()
    }

    pub fn find_preset(&self, preset_uri: &str) -> Option<Preset> {
        let plugin_uri = preset_uri.split('#').next().unwrap_or(preset_uri);
        self.entries
            .get(plugin_uri)?
            .presets
            .iter()
            .find(|p| p.uri == preset_uri)
            .cloned()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_instantiation() {
        let registry = PluginRegistry::with_builtins();
        let plugin = registry.instantiate(GAIN_URI).unwrap();
        assert_eq!(plugin.uri(), GAIN_URI);
        assert!(registry.instantiate("builtin://missing").is_err());
    }

    #[test]
    fn test_factory_presets() {
        let registry = PluginRegistry::with_builtins();
        let presets = registry.factory_presets(GAIN_URI);
        assert_eq!(presets.len(), 2);
        assert!(presets.iter().any(|p| p.name == "Unity"));

        let boost = registry.find_preset(&format!("{GAIN_URI}#boost")).unwrap();
        assert_eq!(boost.values["gain"], 6.0);
        assert!(registry.find_preset("builtin://gain#nope").is_none());
    }
}
