use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::api::RemoteBackend;
use crate::api::kie::image_task_body;
use crate::config::Config;
use crate::driver::{PhaseSummary, WorkPlan, run_phase};
use crate::logi;
use crate::scenario::Scenario;
use crate::status::{Phase, StatusStore};

/// Plan the reference-image tasks for every element in the scenario. One task
/// per view, keyed `{element}/view_{index}` so reruns line up with the shared
/// element store regardless of which scenario requested them.
pub fn plan_element_views(config: &Config, scenario: &Scenario) -> Vec<WorkPlan> {
    let mut plans = Vec::new();
    for element in &scenario.elements {
        for (index, view_prompt) in element.view_prompts().iter().enumerate() {
            let prompt = if scenario.global.style_prefix.is_empty() {
                view_prompt.clone()
            } else {
                format!("{}. {}", scenario.global.style_prefix, view_prompt)
            };
            plans.push(WorkPlan {
                key: format!("{}/view_{index}", element.name),
                phase: Phase::Elements,
                request: image_task_body(
                    &prompt,
                    &scenario.global.negative_prompt,
                    &config.generation.aspect_ratio,
                ),
                output_path: config
                    .elements_dir()
                    .join(&element.name)
                    .join(format!("{}{}.png", element.name, index + 1)),
            });
        }
    }
    plans
}

pub async fn generate_elements(
    backend: Arc<dyn RemoteBackend>,
    config: &Config,
    scenario: &Scenario,
    force: bool,
) -> Result<PhaseSummary> {
    let plans = plan_element_views(config, scenario);
    logi(format!(
        "Generating {} reference images for {} elements",
        plans.len(),
        scenario.elements.len()
    ));

    let store = Arc::new(Mutex::new(StatusStore::load(
        config.elements_status_path(),
    )?));
    let summary = run_phase(backend, store, plans, super::driver_options(config, force)).await?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        serde_json::from_str(r#"{"api": {"api_key": "k"}}"#).unwrap()
    }

    fn scenario() -> Scenario {
        serde_json::from_str(
            r#"{
                "global": {"style_prefix": "watercolor", "negative_prompt": "text"},
                "elements": [
                    {"name": "Fox", "description": "a red fox"},
                    {"name": "Forest", "kind": "background", "description": "a pine forest"}
                ],
                "scenes": []
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn one_plan_per_view_with_scoped_keys_and_paths() {
        let plans = plan_element_views(&config(), &scenario());
        // 4 character views + 3 background views.
        assert_eq!(plans.len(), 7);
        assert_eq!(plans[0].key, "Fox/view_0");
        assert_eq!(
            plans[0].output_path,
            std::path::PathBuf::from("output/elements/Fox/Fox1.png")
        );
        assert_eq!(plans[4].key, "Forest/view_0");
    }

    #[test]
    fn style_prefix_lands_in_the_request_prompt() {
        let plans = plan_element_views(&config(), &scenario());
        let prompt = plans[0].request["input"]["prompt"].as_str().unwrap();
        assert!(prompt.starts_with("watercolor. a red fox, front view"));
        assert_eq!(plans[0].request["input"]["negative_prompt"], "text");
    }
}
