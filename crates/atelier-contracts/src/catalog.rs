use std::collections::HashMap;

use indexmap::IndexMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Marker value: the transformation takes a free-form prompt from the user
/// instead of carrying its own.
pub const CUSTOM_PROMPT: &str = "CUSTOM";

/// Placeholder inside the custom style preset replaced by the user's
/// location text.
pub const LOCATION_PLACEHOLDER: &str = "**[LOCATION]**";

const LOCATION_FALLBACK: &str = "a dramatic location";

/// One selectable value for a prompt option slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionValue {
    /// The literal text substituted into the prompt template.
    pub value: String,
    pub label: String,
}

/// A named `{key}` slot in a prompt template together with its declared values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOption {
    pub key: String,
    pub title: String,
    pub values: Vec<OptionValue>,
}

/// Declarative descriptor of one catalog transformation. Immutable after
/// startup; the user-visible ordering is handled by [`merge_saved_order`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationSpec {
    pub key: String,
    pub title: String,
    pub emoji: String,
    pub prompt: Option<String>,
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub options: Vec<PromptOption>,
    pub step_two_prompt: Option<String>,
    #[serde(default)]
    pub is_multi_image: bool,
    #[serde(default)]
    pub is_secondary_optional: bool,
    #[serde(default)]
    pub is_two_step: bool,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub is_generative: bool,
    #[serde(default = "default_true")]
    pub supports_batch: bool,
    #[serde(default)]
    pub is_auto_flow: bool,
}

fn default_true() -> bool {
    true
}

impl TransformationSpec {
    fn effect(key: &str, title: &str, emoji: &str, prompt: &str) -> Self {
        Self {
            key: key.to_string(),
            title: title.to_string(),
            emoji: emoji.to_string(),
            prompt: Some(prompt.to_string()),
            prompt_template: None,
            options: Vec::new(),
            step_two_prompt: None,
            is_multi_image: false,
            is_secondary_optional: false,
            is_two_step: false,
            is_video: false,
            is_generative: false,
            supports_batch: true,
            is_auto_flow: false,
        }
    }

    pub fn uses_custom_prompt(&self) -> bool {
        self.prompt.as_deref() == Some(CUSTOM_PROMPT)
    }

    /// Resolve the prompt to send for this transformation.
    ///
    /// Custom transformations take the user's text verbatim; templated ones
    /// substitute the selected option values; plain ones return their fixed
    /// prompt.
    pub fn resolve_prompt(
        &self,
        custom_prompt: &str,
        selections: &HashMap<String, String>,
    ) -> String {
        if self.uses_custom_prompt() {
            return custom_prompt.to_string();
        }
        if let Some(template) = self.prompt_template.as_deref() {
            return render_prompt(template, &self.options, selections);
        }
        self.prompt.clone().unwrap_or_default()
    }
}

/// Substitute every `{key}` slot of `template` with the selected value.
///
/// An absent selection (or the literal selection `"random"`) resolves to a
/// uniformly random declared value; a selection that is not among the
/// declared values falls back to the first declared value.
pub fn render_prompt(
    template: &str,
    options: &[PromptOption],
    selections: &HashMap<String, String>,
) -> String {
    let mut prompt = template.to_string();
    let mut rng = rand::thread_rng();
    for option in options {
        if option.values.is_empty() {
            continue;
        }
        let placeholder = format!("{{{}}}", option.key);
        let selected = selections.get(&option.key).map(String::as_str);
        let replacement = match selected {
            None | Some("random") => {
                &option
                    .values
                    .choose(&mut rng)
                    .unwrap_or(&option.values[0])
                    .value
            }
            Some(value) => {
                &option
                    .values
                    .iter()
                    .find(|candidate| candidate.value == value)
                    .unwrap_or(&option.values[0])
                    .value
            }
        };
        prompt = prompt.replace(&placeholder, replacement);
    }
    prompt
}

/// Fill the custom style preset's location slot, falling back to a generic
/// location when the user left it empty.
pub fn substitute_location(prompt: &str, location: Option<&str>) -> String {
    let location = location
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(LOCATION_FALLBACK);
    prompt.replace(LOCATION_PLACEHOLDER, location)
}

/// Merge a persisted key ordering with the canonical catalog: saved keys
/// first in saved order (stale keys dropped), then any canonical entries the
/// saved list does not know about, in canonical order.
pub fn merge_saved_order(
    saved_keys: &[String],
    canonical: &[TransformationSpec],
) -> Vec<TransformationSpec> {
    let by_key: IndexMap<&str, &TransformationSpec> = canonical
        .iter()
        .map(|spec| (spec.key.as_str(), spec))
        .collect();
    let mut merged: Vec<TransformationSpec> = saved_keys
        .iter()
        .filter_map(|key| by_key.get(key.as_str()).map(|spec| (*spec).clone()))
        .collect();
    merged.extend(
        canonical
            .iter()
            .filter(|spec| !saved_keys.contains(&spec.key))
            .cloned(),
    );
    merged
}

/// The canonical transformation catalog, in its default presentation order.
#[derive(Debug, Clone)]
pub struct TransformationCatalog {
    specs: IndexMap<String, TransformationSpec>,
}

impl TransformationCatalog {
    pub fn new(specs: Vec<TransformationSpec>) -> Self {
        Self {
            specs: specs
                .into_iter()
                .map(|spec| (spec.key.clone(), spec))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&TransformationSpec> {
        self.specs.get(key)
    }

    pub fn list(&self) -> impl Iterator<Item = &TransformationSpec> {
        self.specs.values()
    }

    pub fn keys(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    /// Catalog entries in the user's saved order (see [`merge_saved_order`]).
    pub fn reordered(&self, saved_keys: &[String]) -> Vec<TransformationSpec> {
        let canonical: Vec<TransformationSpec> = self.specs.values().cloned().collect();
        merge_saved_order(saved_keys, &canonical)
    }
}

impl Default for TransformationCatalog {
    fn default() -> Self {
        Self::new(default_transformations())
    }
}

fn default_transformations() -> Vec<TransformationSpec> {
    let mut specs = Vec::new();

    specs.push(TransformationSpec {
        key: "custom-prompt".to_string(),
        title: "Custom prompt".to_string(),
        emoji: "✍️".to_string(),
        prompt: Some(CUSTOM_PROMPT.to_string()),
        prompt_template: None,
        options: Vec::new(),
        step_two_prompt: None,
        is_multi_image: true,
        is_secondary_optional: true,
        is_two_step: false,
        is_video: false,
        is_generative: false,
        supports_batch: false,
        is_auto_flow: false,
    });

    specs.push(TransformationSpec {
        key: "virtual-try-on".to_string(),
        title: "Virtual try-on studio".to_string(),
        emoji: "🤖".to_string(),
        prompt: None,
        prompt_template: None,
        options: Vec::new(),
        step_two_prompt: None,
        is_multi_image: false,
        is_secondary_optional: false,
        is_two_step: false,
        is_video: false,
        is_generative: false,
        supports_batch: false,
        is_auto_flow: true,
    });

    specs.push(TransformationSpec::effect(
        "figurine",
        "Collector figurine",
        "🧍",
        "Turn this photo into a character figure. Behind it, place a box with the \
         character's image printed on it, and a computer showing the modeling process \
         on its screen. In front of the box, add a round plastic base with the \
         character figure standing on it.",
    ));

    specs.push(TransformationSpec::effect(
        "plushie",
        "Plushie",
        "🧸",
        "Turn the person in this photo into a cute, soft plushie doll.",
    ));

    specs.push(TransformationSpec::effect(
        "hd-enhance",
        "HD enhance",
        "🔍",
        "Enhance this image to high resolution, improving sharpness and clarity.",
    ));

    specs.push(TransformationSpec {
        key: "pose-transfer".to_string(),
        title: "Pose transfer".to_string(),
        emoji: "💃".to_string(),
        prompt: Some(
            "Apply the pose from the second image to the character in the first image. \
             Render as a professional studio photograph."
                .to_string(),
        ),
        prompt_template: None,
        options: Vec::new(),
        step_two_prompt: None,
        is_multi_image: true,
        is_secondary_optional: false,
        is_two_step: false,
        is_video: false,
        is_generative: false,
        supports_batch: false,
        is_auto_flow: false,
    });

    specs.push(TransformationSpec {
        key: "scene-background".to_string(),
        title: "Scene background".to_string(),
        emoji: "🪩".to_string(),
        prompt: None,
        prompt_template: Some(
            "Change the background to a {style} in a {atmosphere} atmosphere.".to_string(),
        ),
        options: vec![
            PromptOption {
                key: "style".to_string(),
                title: "Background style".to_string(),
                values: vec![
                    OptionValue {
                        value: "bustling cyberpunk city at night".to_string(),
                        label: "Cyberpunk city".to_string(),
                    },
                    OptionValue {
                        value: "enchanted forest with glowing flora".to_string(),
                        label: "Enchanted forest".to_string(),
                    },
                    OptionValue {
                        value: "serene tropical beach at sunset".to_string(),
                        label: "Tropical beach".to_string(),
                    },
                    OptionValue {
                        value: "grand, opulent ballroom".to_string(),
                        label: "Opulent ballroom".to_string(),
                    },
                ],
            },
            PromptOption {
                key: "atmosphere".to_string(),
                title: "Atmosphere".to_string(),
                values: vec![
                    OptionValue {
                        value: "vibrant and energetic".to_string(),
                        label: "Vibrant".to_string(),
                    },
                    OptionValue {
                        value: "dark and moody".to_string(),
                        label: "Moody".to_string(),
                    },
                    OptionValue {
                        value: "dreamy and ethereal".to_string(),
                        label: "Dreamy".to_string(),
                    },
                ],
            },
        ],
        step_two_prompt: None,
        is_multi_image: false,
        is_secondary_optional: false,
        is_two_step: false,
        is_video: false,
        is_generative: false,
        supports_batch: true,
        is_auto_flow: false,
    });

    specs.push(TransformationSpec {
        key: "color-palette".to_string(),
        title: "Line art & palette recolor".to_string(),
        emoji: "🎨".to_string(),
        prompt: Some("Turn this image into a clean, hand-drawn line art sketch.".to_string()),
        prompt_template: None,
        options: Vec::new(),
        step_two_prompt: Some(
            "Color the line art using the colors from the second image.".to_string(),
        ),
        is_multi_image: true,
        is_secondary_optional: true,
        is_two_step: true,
        is_video: false,
        is_generative: false,
        supports_batch: false,
        is_auto_flow: false,
    });

    specs.push(TransformationSpec {
        key: "video".to_string(),
        title: "Video generation".to_string(),
        emoji: "🎬".to_string(),
        prompt: Some(CUSTOM_PROMPT.to_string()),
        prompt_template: None,
        options: Vec::new(),
        step_two_prompt: None,
        is_multi_image: false,
        is_secondary_optional: false,
        is_two_step: false,
        is_video: true,
        is_generative: false,
        supports_batch: false,
        is_auto_flow: false,
    });

    specs.push(TransformationSpec {
        key: "poster-concept".to_string(),
        title: "Poster concept".to_string(),
        emoji: "🖼️".to_string(),
        prompt: None,
        prompt_template: Some(
            "A {medium} poster of a serene mountain landscape at golden hour, with bold \
             composition and rich, saturated colors."
                .to_string(),
        ),
        options: vec![PromptOption {
            key: "medium".to_string(),
            title: "Medium".to_string(),
            values: vec![
                OptionValue {
                    value: "hand-painted gouache".to_string(),
                    label: "Gouache".to_string(),
                },
                OptionValue {
                    value: "mid-century screen print".to_string(),
                    label: "Screen print".to_string(),
                },
                OptionValue {
                    value: "minimalist vector art".to_string(),
                    label: "Vector art".to_string(),
                },
            ],
        }],
        step_two_prompt: None,
        is_multi_image: false,
        is_secondary_optional: false,
        is_two_step: false,
        is_video: false,
        is_generative: true,
        supports_batch: false,
        is_auto_flow: false,
    });

    specs
}

/// One entry of the stylization fan-out catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StylePreset {
    pub key: String,
    pub label: String,
    pub prompt: String,
}

/// The fixed fan-out styles, in presentation order. The `custom` preset
/// carries a [`LOCATION_PLACEHOLDER`] slot.
pub fn style_presets() -> Vec<StylePreset> {
    let preset = |key: &str, label: &str, prompt: &str| StylePreset {
        key: key.to_string(),
        label: label.to_string(),
        prompt: prompt.to_string(),
    };
    vec![
        preset(
            "t-show",
            "Runway",
            "Reimagine the photo as a fashion editorial cover shoot. Create an \
             ultra-realistic portrait with impeccable detail in the skin texture and \
             fabric. On a runway, the subject should hold a powerful, dramatic pose. \
             Illuminate the scene with moody, cinematic lighting that sculpts the \
             features and casts deep, artistic shadows.",
        ),
        preset(
            "street",
            "Street",
            "Reimagine the photo as a fashion editorial cover shoot. Create an \
             ultra-realistic portrait with impeccable detail in the skin texture and \
             fabric. In the street, the subject should hold a powerful, dramatic pose. \
             Illuminate the scene with moody, cinematic lighting that sculpts the \
             features and casts deep, artistic shadows.",
        ),
        preset(
            "party",
            "Grand ballroom",
            "Reimagine the photo as a fashion editorial cover shoot. Create an \
             ultra-realistic portrait with impeccable detail in the skin texture and \
             fabric. In an exclusive, candlelit grand ballroom, the subject should hold \
             a powerful, dramatic pose under moody, cinematic lighting.",
        ),
        preset(
            "vintage-building",
            "Vintage building",
            "Capture the essence of a high-fashion editorial cover: an ultra-realistic \
             portrait demanding impeccable fidelity in skin texture and fabric detail. \
             Against the backdrop of a grand vintage edifice, the subject strikes a \
             dynamic, commanding pose sculpted by moody, cinematic illumination.",
        ),
        preset(
            "night-club",
            "Night club",
            "Reimagine the photo inside a high-energy night club with a live DJ booth, \
             pulsing neon lights, laser beams, and a lively dancing crowd. The subject \
             strikes a dynamic, powerful pose under vibrant color gels and deep, \
             artistic shadows.",
        ),
        preset(
            "custom",
            "Custom location",
            "Capture the essence of a high-fashion editorial cover: an ultra-realistic \
             portrait demanding impeccable fidelity in skin texture and fabric detail. \
             Against the backdrop of **[LOCATION]**, the subject strikes a dynamic, \
             commanding pose sculpted by moody, cinematic illumination.",
        ),
    ]
}
