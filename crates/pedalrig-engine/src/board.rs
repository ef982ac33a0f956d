//! The persisted pedalboard model.
//!
//! A pedalboard is a linear chain of items; an item is either a plugin
//! instance or a two-way split whose legs are themselves chains. The JSON
//! schema stays stable across versions by tagging every item with
//! `pluginType`.

use pedalrig_midi::MidiBinding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One plugin instance in the chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginItem {
    pub instance_id: u64,
    pub plugin_uri: String,
    #[serde(default)]
    pub control_values: BTreeMap<String, f32>,
    #[serde(default)]
    pub bypass: bool,
    #[serde(default)]
    pub midi_bindings: Vec<MidiBinding>,
}

/// A two-way branch: input feeds both legs, outputs are mixed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitItem {
    pub instance_id: u64,
    pub top: Vec<PedalboardItem>,
    pub bottom: Vec<PedalboardItem>,
    /// 0.0 = all top, 1.0 = all bottom.
    #[serde(default = "default_mix")]
    pub mix: f32,
    /// -1.0 hard left .. 1.0 hard right, applied to stereo outputs.
    #[serde(default)]
    pub pan_top: f32,
    #[serde(default)]
    pub pan_bottom: f32,
}

fn default_mix() -> f32 {
    0.5
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pluginType", rename_all = "camelCase")]
pub enum PedalboardItem {
    Plugin(PluginItem),
    Split(SplitItem),
}

impl PedalboardItem {
    pub fn instance_id(&self) -> u64 {
        match self {
            Self::Plugin(item) => item.instance_id,
            Self::Split(item) => item.instance_id,
        }
    }
}

/// The user's effect graph, as stored on disk and shipped to the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pedalboard {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub items: Vec<PedalboardItem>,
    /// Input/output trim, dB.
    #[serde(default)]
    pub input_volume_db: f32,
    #[serde(default)]
    pub output_volume_db: f32,
}

impl Pedalboard {
    pub fn empty() -> Self {
        Self {
            name: "empty".into(),
            items: Vec::new(),
            input_volume_db: 0.0,
            output_volume_db: 0.0,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Depth-first iteration over every plugin item.
    pub fn plugin_items(&self) -> Vec<&PluginItem> {
        fn walk<'a>(items: &'a [PedalboardItem], out: &mut Vec<&'a PluginItem>) {
            for item in items {
                match item {
                    PedalboardItem::Plugin(plugin) => out.push(plugin),
                    PedalboardItem::Split(split) => {
                        walk(&split.top, out);
                        walk(&split.bottom, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.items, &mut out);
        out
    }

    /// Largest instance id present, for id allocation.
    pub fn max_instance_id(&self) -> u64 {
        fn walk(items: &[PedalboardItem], max: &mut u64) {
            for item in items {
                *max = (*max).max(item.instance_id());
                if let PedalboardItem::Split(split) = item {
                    walk(&split.top, max);
                    walk(&split.bottom, max);
                }
            }
        }
        let mut max = 0;
        walk(&self.items, &mut max);
        max
    }
}
