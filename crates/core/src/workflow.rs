//! Workflow template binding and inspection.
//!
//! Workflow templates are ComfyUI API-format JSON objects keyed by node id,
//! each node carrying a `class_type` and an `inputs` object:
//!
//! ```json
//! {
//!   "3": { "class_type": "KSampler", "inputs": { "seed": 42, ... } },
//!   "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "..." } }
//! }
//! ```
//!
//! Only two node kinds are touched: text encoders receive the prompt and
//! samplers receive a fresh seed. Everything else passes through verbatim.

use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// ComfyUI node class types
// ---------------------------------------------------------------------------

/// CLIP text encode node class type (prompt sink).
pub const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";

/// KSampler node class type (seed sink).
pub const KSAMPLER_CLASS: &str = "KSampler";

/// Input field holding the prompt on a text encoder node.
const TEXT_INPUT: &str = "text";

/// Input field holding the seed on a sampler node.
const SEED_INPUT: &str = "seed";

/// Smallest seed drawn for a sampler.
pub const MIN_SEED: u64 = 1;

/// Largest seed drawn for a sampler.
pub const MAX_SEED: u64 = 1_000_000_000;

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Node ids the binder would overwrite in a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowReport {
    /// Text encoder nodes carrying a `text` input, sorted by id.
    pub prompt_nodes: Vec<String>,
    /// Sampler nodes carrying a `seed` input, sorted by id.
    pub sampler_nodes: Vec<String>,
}

impl WorkflowReport {
    /// A template without a prompt sink would generate images that ignore
    /// the prompt file entirely.
    pub fn has_prompt_sink(&self) -> bool {
        !self.prompt_nodes.is_empty()
    }

    /// A template without a sampler would reuse its stored seed every time.
    pub fn has_sampler(&self) -> bool {
        !self.sampler_nodes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Bind a prompt into a copy of `document`, drawing sampler seeds from the
/// thread-local RNG.
///
/// See [`bind_prompt_with_rng`].
pub fn bind_prompt(document: &Value, prompt: &str) -> Result<Value, CoreError> {
    bind_prompt_with_rng(document, prompt, &mut rand::rng())
}

/// Bind a prompt into a copy of `document`.
///
/// - Every `CLIPTextEncode` node with a `text` input gets `prompt`.
/// - Every `KSampler` node with a `seed` input gets an independent seed in
///   `[MIN_SEED, MAX_SEED]`.
///
/// The input document is never modified. Returns
/// [`CoreError::Validation`] if the document is not a JSON object.
pub fn bind_prompt_with_rng<R: Rng>(
    document: &Value,
    prompt: &str,
    rng: &mut R,
) -> Result<Value, CoreError> {
    if !document.is_object() {
        return Err(CoreError::Validation(
            "Workflow JSON must be an object".to_string(),
        ));
    }

    let mut bound = document.clone();

    for node in bound.as_object_mut().into_iter().flat_map(|nodes| nodes.values_mut()) {
        let field = match node.get("class_type").and_then(Value::as_str) {
            Some(CLIP_TEXT_ENCODE_CLASS) => TEXT_INPUT,
            Some(KSAMPLER_CLASS) => SEED_INPUT,
            _ => continue,
        };

        let Some(slot) = node
            .get_mut("inputs")
            .and_then(Value::as_object_mut)
            .and_then(|inputs| inputs.get_mut(field))
        else {
            continue;
        };

        *slot = if field == TEXT_INPUT {
            Value::String(prompt.to_string())
        } else {
            Value::from(rng.random_range(MIN_SEED..=MAX_SEED))
        };
    }

    Ok(bound)
}

/// List the nodes [`bind_prompt`] would overwrite.
pub fn inspect_workflow(document: &Value) -> Result<WorkflowReport, CoreError> {
    let nodes = document.as_object().ok_or_else(|| {
        CoreError::Validation("Workflow JSON must be an object".to_string())
    })?;

    let mut report = WorkflowReport::default();

    for (node_id, node) in nodes {
        let has_input = |field: &str| {
            node.get("inputs")
                .and_then(|inputs| inputs.get(field))
                .is_some()
        };

        match node.get("class_type").and_then(Value::as_str) {
            Some(CLIP_TEXT_ENCODE_CLASS) if has_input(TEXT_INPUT) => {
                report.prompt_nodes.push(node_id.clone());
            }
            Some(KSAMPLER_CLASS) if has_input(SEED_INPUT) => {
                report.sampler_nodes.push(node_id.clone());
            }
            _ => {}
        }
    }

    report.prompt_nodes.sort();
    report.sampler_nodes.sort();

    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    use super::*;

    // -- Helper: minimal txt2img workflow -------------------------------------

    fn sample_workflow_json() -> Value {
        json!({
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": 42,
                    "steps": 20,
                    "cfg": 7.5,
                    "model": ["4", 0],
                    "positive": ["6", 0],
                    "negative": ["7", 0],
                    "latent_image": ["5", 0]
                }
            },
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": "sd_xl_base_1.0.safetensors" }
            },
            "5": {
                "class_type": "EmptyLatentImage",
                "inputs": { "width": 1344, "height": 768, "batch_size": 1 }
            },
            "6": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "placeholder", "clip": ["4", 1] }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": { "filename_prefix": "batch", "images": ["8", 0] }
            }
        })
    }

    // -- bind_prompt ----------------------------------------------------------

    #[test]
    fn bind_sets_prompt_text() {
        let workflow = sample_workflow_json();
        let bound = bind_prompt(&workflow, "a misty mountain").expect("bind");
        assert_eq!(bound["6"]["inputs"]["text"], "a misty mountain");
    }

    #[test]
    fn bind_does_not_modify_the_template() {
        let workflow = sample_workflow_json();
        let before = workflow.clone();
        let _ = bind_prompt(&workflow, "a misty mountain").expect("bind");
        assert_eq!(workflow, before);
    }

    #[test]
    fn bind_draws_seed_in_range() {
        let workflow = sample_workflow_json();
        for _ in 0..50 {
            let bound = bind_prompt(&workflow, "p").expect("bind");
            let seed = bound["3"]["inputs"]["seed"].as_u64().expect("seed is u64");
            assert!((MIN_SEED..=MAX_SEED).contains(&seed));
        }
    }

    #[test]
    fn consecutive_binds_draw_independent_seeds() {
        let workflow = sample_workflow_json();
        let mut rng = StdRng::seed_from_u64(7);
        let seeds: Vec<u64> = (0..20)
            .map(|i| {
                let bound =
                    bind_prompt_with_rng(&workflow, &format!("prompt {i}"), &mut rng)
                        .expect("bind");
                bound["3"]["inputs"]["seed"].as_u64().expect("seed is u64")
            })
            .collect();

        let mut unique = seeds.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), seeds.len(), "seeds repeated: {seeds:?}");
    }

    #[test]
    fn bind_leaves_other_nodes_untouched() {
        let workflow = sample_workflow_json();
        let bound = bind_prompt(&workflow, "p").expect("bind");
        assert_eq!(bound["4"], workflow["4"]);
        assert_eq!(bound["5"], workflow["5"]);
        assert_eq!(bound["9"], workflow["9"]);
        assert_eq!(bound["3"]["inputs"]["positive"], json!(["6", 0]));
    }

    #[test]
    fn bind_overwrites_every_text_encoder() {
        let workflow = json!({
            "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "pos" } },
            "7": { "class_type": "CLIPTextEncode", "inputs": { "text": "neg" } }
        });
        let bound = bind_prompt(&workflow, "p").expect("bind");
        assert_eq!(bound["6"]["inputs"]["text"], "p");
        assert_eq!(bound["7"]["inputs"]["text"], "p");
    }

    #[test]
    fn bind_skips_nodes_without_the_target_field() {
        let workflow = json!({
            "3": { "class_type": "KSampler", "inputs": { "steps": 20 } },
            "6": { "class_type": "CLIPTextEncode" }
        });
        let bound = bind_prompt(&workflow, "p").expect("bind");
        assert_eq!(bound, workflow);
    }

    #[test]
    fn bind_rejects_non_object() {
        let result = bind_prompt(&json!([1, 2, 3]), "p");
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    // -- inspect_workflow -----------------------------------------------------

    #[test]
    fn inspect_finds_prompt_and_sampler_nodes() {
        let report = inspect_workflow(&sample_workflow_json()).expect("inspect");
        assert_eq!(report.prompt_nodes, vec!["6".to_string()]);
        assert_eq!(report.sampler_nodes, vec!["3".to_string()]);
        assert!(report.has_prompt_sink());
        assert!(report.has_sampler());
    }

    #[test]
    fn inspect_reports_missing_sinks() {
        let workflow = json!({
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "x" } }
        });
        let report = inspect_workflow(&workflow).expect("inspect");
        assert!(!report.has_prompt_sink());
        assert!(!report.has_sampler());
    }

    #[test]
    fn inspect_rejects_non_object() {
        assert!(inspect_workflow(&json!("nope")).is_err());
    }
}
