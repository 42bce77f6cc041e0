use manifest::Manifest;

use super::*;

fn manifest_from(json: serde_json::Value) -> Manifest {
    serde_json::from_value(json).unwrap()
}

#[test]
fn noop_pipeline_matches_the_hand_computed_identifier() {
    let manifest = manifest_from(serde_json::json!({
        "pipeline": { "stages": [ { "name": "org.osbuild.noop" } ] }
    }));
    let plan = compile(&manifest).unwrap();
    assert_eq!(plan.pipelines.len(), 1);
    let stage = &plan.pipelines[0].stages[0];

    let expected = compute_object_id("org.osbuild.noop", &serde_json::json!({}), &[], None);
    assert_eq!(stage.object_id, expected);
    assert_eq!(plan.root_object_id(), Some(expected));
}

#[test]
fn planning_is_deterministic() {
    let manifest = manifest_from(serde_json::json!({
        "pipeline": {
            "stages": [
                { "name": "org.osbuild.a", "options": {"x": 1} },
                { "name": "org.osbuild.b", "options": {"y": 2} },
            ]
        }
    }));
    let first = compile(&manifest).unwrap();
    let second = compile(&manifest).unwrap();
    assert_eq!(first.root_object_id(), second.root_object_id());
    assert_eq!(
        first.pipelines[0].stages[0].object_id,
        second.pipelines[0].stages[0].object_id
    );
}

#[test]
fn two_stage_chain_threads_upstream_and_isolates_later_options() {
    let manifest = manifest_from(serde_json::json!({
        "pipeline": {
            "stages": [
                { "name": "org.osbuild.a" },
                { "name": "org.osbuild.b", "options": {"mode": "append"} },
            ]
        }
    }));
    let plan = compile(&manifest).unwrap();
    let a = &plan.pipelines[0].stages[0];
    let b = &plan.pipelines[0].stages[1];
    assert_eq!(b.upstream, Some(a.object_id));

    let manifest_changed_b = manifest_from(serde_json::json!({
        "pipeline": {
            "stages": [
                { "name": "org.osbuild.a" },
                { "name": "org.osbuild.b", "options": {"mode": "overwrite"} },
            ]
        }
    }));
    let changed = compile(&manifest_changed_b).unwrap();
    assert_eq!(changed.pipelines[0].stages[0].object_id, a.object_id);
    assert_ne!(changed.pipelines[0].stages[1].object_id, b.object_id);
}

#[test]
fn ordered_reference_swap_changes_identifier() {
    let a = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    let b = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    let make = |refs: [&str; 2]| {
        manifest_from(serde_json::json!({
            "pipeline": {
                "stages": [{
                    "name": "org.osbuild.rpm",
                    "inputs": {
                        "packages": {
                            "type": "org.osbuild.files",
                            "origin": "org.osbuild.source",
                            "references": refs,
                        }
                    },
                }]
            }
        }))
    };

    let base_id = compile(&make([a, b])).unwrap().root_object_id().unwrap();
    let swapped_id = compile(&make([b, a])).unwrap().root_object_id().unwrap();
    assert_ne!(base_id, swapped_id);
}

#[test]
fn keyed_reference_order_does_not_affect_identifier() {
    let make = |first: &str, second: &str| {
        manifest_from(serde_json::json!({
            "pipeline": {
                "stages": [{
                    "name": "org.osbuild.rpm",
                    "inputs": {
                        "packages": {
                            "type": "org.osbuild.files",
                            "origin": "org.osbuild.source",
                            "references": {
                                (first): {},
                                (second): {},
                            },
                        }
                    },
                }]
            }
        }))
    };
    let a = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    let b = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    let first_order = compile(&make(a, b)).unwrap().root_object_id().unwrap();
    let second_order = compile(&make(b, a)).unwrap().root_object_id().unwrap();
    assert_eq!(first_order, second_order);
}

#[test]
fn build_pipeline_runs_before_and_changing_it_changes_downstream_identifier() {
    let manifest = manifest_from(serde_json::json!({
        "pipeline": {
            "build": {
                "stages": [ { "name": "org.osbuild.bootstrap" } ]
            },
            "stages": [ { "name": "org.osbuild.install" } ]
        }
    }));
    let plan = compile(&manifest).unwrap();
    assert_eq!(plan.pipelines.len(), 2, "build pipeline first, then the outer pipeline");
    let build_final = plan.pipelines[0].final_object_id.unwrap();
    assert_eq!(plan.pipelines[1].stages[0].upstream, Some(build_final));

    let manifest_changed_build = manifest_from(serde_json::json!({
        "pipeline": {
            "build": {
                "stages": [ { "name": "org.osbuild.bootstrap", "options": {"variant": "minimal"} } ]
            },
            "stages": [ { "name": "org.osbuild.install" } ]
        }
    }));
    let changed = compile(&manifest_changed_build).unwrap();
    assert_ne!(
        changed.pipelines[0].final_object_id,
        plan.pipelines[0].final_object_id
    );
    assert_ne!(
        changed.pipelines[1].stages[0].object_id,
        plan.pipelines[1].stages[0].object_id
    );
}

#[test]
fn malformed_source_reference_is_rejected() {
    let manifest = manifest_from(serde_json::json!({
        "pipeline": {
            "stages": [{
                "name": "org.osbuild.rpm",
                "inputs": {
                    "packages": {
                        "type": "org.osbuild.files",
                        "origin": "org.osbuild.source",
                        "references": ["not-a-content-hash"],
                    }
                },
            }]
        }
    }));
    assert!(matches!(compile(&manifest), Err(PlanError::ManifestInvalid(_))));
}
