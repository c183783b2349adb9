use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

const CHARACTER_VIEWS: &[&str] = &[
    "front view, full body, standing pose, white background",
    "side view (profile), full body, standing pose, white background",
    "three-quarter view, full body, standing pose, white background",
    "full body action pose, dynamic angle, white background",
];

const BACKGROUND_VIEWS: &[&str] = &[
    "wide establishing shot, panoramic view",
    "medium shot, eye-level perspective",
    "detail close-up of key features",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub style_prefix: String,
    #[serde(default)]
    pub negative_prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Character,
    Background,
}

impl Default for ElementKind {
    fn default() -> Self {
        ElementKind::Character
    }
}

/// A reusable visual reference (character or background) shared across scenes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDef {
    pub name: String,
    #[serde(default)]
    pub kind: ElementKind,
    #[serde(default)]
    pub description: String,
    /// Explicit per-view prompts; when empty, defaults are derived from the
    /// element kind and description.
    #[serde(default)]
    pub reference_prompts: Vec<String>,
}

impl ElementDef {
    /// Prompts for the reference images of this element, one per view.
    pub fn view_prompts(&self) -> Vec<String> {
        if !self.reference_prompts.is_empty() {
            return self.reference_prompts.clone();
        }
        let views = match self.kind {
            ElementKind::Character => CHARACTER_VIEWS,
            ElementKind::Background => BACKGROUND_VIEWS,
        };
        views
            .iter()
            .map(|view| format!("{}, {}", self.description, view))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shot {
    pub prompt: String,
    #[serde(default = "default_shot_duration")]
    pub duration: u32,
    #[serde(default)]
    pub negative_prompt: String,
}

fn default_shot_duration() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub lighting: String,
    /// Names of elements whose reference images this scene needs.
    #[serde(default)]
    pub elements: Vec<String>,
    pub shots: Vec<Shot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub elements: Vec<ElementDef>,
    pub scenes: Vec<Scene>,
}

impl Scenario {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read scenario: {}", path.as_ref().display()))?;
        let scenario: Scenario = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse scenario: {}", path.as_ref().display()))?;
        Ok(scenario)
    }

    pub fn element(&self, name: &str) -> Option<&ElementDef> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Full prompt for one shot: style prefix, scene continuity, then the
    /// shot's own prompt.
    pub fn shot_prompt(&self, scene: &Scene, shot: &Shot) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !self.global.style_prefix.is_empty() {
            parts.push(self.global.style_prefix.clone());
        }
        let mut continuity: Vec<String> = Vec::new();
        if !scene.background.is_empty() {
            continuity.push(format!("Setting: {}", scene.background));
        }
        if !scene.lighting.is_empty() {
            continuity.push(format!("Lighting: {}", scene.lighting));
        }
        if !continuity.is_empty() {
            parts.push(continuity.join(". "));
        }
        parts.push(shot.prompt.clone());
        parts.join(". ")
    }

    /// Scene-level negative prompt: first shot override wins, otherwise the
    /// global one.
    pub fn scene_negative(&self, scene: &Scene) -> String {
        scene
            .shots
            .iter()
            .find(|s| !s.negative_prompt.is_empty())
            .map(|s| s.negative_prompt.clone())
            .unwrap_or_else(|| self.global.negative_prompt.clone())
    }
}

/// Stem used to scope per-scenario output directories.
pub fn scenario_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scenario".to_string())
}
